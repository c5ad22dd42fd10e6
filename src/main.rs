use std::env;
use std::path::{Path, PathBuf};
use std::process;

use cinder::bytecode::compile::{Compiled, compile_file};
use cinder::bytecode::disasm::disassemble;
use cinder::bytecode::module::{DebugInfo, Module};
use cinder::lexer::Lexer;
use cinder::runtime::vm::Vm;

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.contains(&"--help".to_string()) || args.contains(&"-h".to_string()) {
        print_usage();
        return;
    }

    let tokens_only = args.contains(&"--tokens".to_string());

    match args.get(1).map(String::as_str) {
        Some("build") => {
            let source = expect_path(args.get(2), "build");
            let output = output_path(&args, &source);
            build(&source, &output);
        }
        Some("run") => {
            let module_path = expect_path(args.get(2), "run");
            run_module(&module_path);
        }
        Some("disasm") => {
            let module_path = expect_path(args.get(2), "disasm");
            disasm(&module_path);
        }
        Some(_) => {
            // first non-flag argument is the source file
            let filename = args.iter().skip(1).find(|a| !a.starts_with('-'));
            match filename {
                Some(filename) => {
                    let path = PathBuf::from(filename);
                    ensure_extension(&path);
                    if tokens_only {
                        dump_tokens(&path);
                    } else {
                        compile_and_run(&path);
                    }
                }
                None => {
                    print_usage();
                    process::exit(1);
                }
            }
        }
        None => {
            print_usage();
            process::exit(1);
        }
    }
}

fn print_usage() {
    println!("cinder - compiler and VM for the cinder scripting language");
    println!();
    println!("Usage:");
    println!("  cinder <file.cn>                Compile and run");
    println!("  cinder build <file.cn> [-o out] Compile to a .cnb module (+ .dbg sidecar)");
    println!("  cinder run <file.cnb>           Run a compiled module");
    println!("  cinder disasm <file.cnb>        Disassemble a compiled module");
    println!("  cinder --tokens <file.cn>       Dump the token stream");
    println!("  cinder --help, -h               Show this help");
}

fn expect_path(arg: Option<&String>, command: &str) -> PathBuf {
    match arg {
        Some(path) => PathBuf::from(path),
        None => {
            eprintln!("cinder {}: missing file argument", command);
            process::exit(1);
        }
    }
}

fn ensure_extension(path: &Path) {
    if path.extension().and_then(|e| e.to_str()) != Some("cn") {
        eprintln!("Error: expected a .cn file, got {}", path.display());
        process::exit(1);
    }
}

fn output_path(args: &[String], source: &Path) -> PathBuf {
    if let Some(i) = args.iter().position(|a| a == "-o") {
        if let Some(out) = args.get(i + 1) {
            return PathBuf::from(out);
        }
        eprintln!("cinder build: -o requires a path");
        process::exit(1);
    }
    source.with_extension("cnb")
}

fn compile_or_exit(path: &Path) -> Compiled {
    match compile_file(path) {
        Ok(compiled) => compiled,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    }
}

fn compile_and_run(path: &Path) {
    let compiled = compile_or_exit(path);
    let mut vm = Vm::new();
    if let Err(fault) = vm.run(&compiled.module) {
        eprintln!("{}", fault);
        process::exit(1);
    }
}

fn build(source: &Path, output: &Path) {
    ensure_extension(source);
    let compiled = compile_or_exit(source);
    if let Err(e) = compiled.module.save(output) {
        eprintln!("{}", e);
        process::exit(1);
    }
    // the sidecar is best-effort: a failed write loses annotations, not
    // the build
    if let Ok(bytes) = compiled.debug.to_bytes() {
        let _ = std::fs::write(output.with_extension("dbg"), bytes);
    }
    println!(
        "Compiled {} -> {} ({} bytes)",
        source.display(),
        output.display(),
        compiled.module.code.len()
    );
}

fn run_module(path: &Path) {
    let module = match Module::load(path) {
        Ok(module) => module,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    };
    let mut vm = Vm::new();
    if let Err(fault) = vm.run(&module) {
        eprintln!("{}", fault);
        process::exit(1);
    }
}

fn disasm(path: &Path) {
    let module = match Module::load(path) {
        Ok(module) => module,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    };
    let debug = std::fs::read(path.with_extension("dbg"))
        .ok()
        .and_then(|bytes| DebugInfo::from_bytes(&bytes));
    print!("{}", disassemble(&module, debug.as_ref()));
}

fn dump_tokens(path: &Path) {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("Failed to read '{}': {}", path.display(), e);
            process::exit(1);
        }
    };
    match Lexer::new(&source).tokenize() {
        Ok(tokens) => {
            for spanned in tokens {
                println!(
                    "{:>4}:{:<3} {}",
                    spanned.span.line, spanned.span.col, spanned.token
                );
            }
        }
        Err(e) => {
            eprintln!("Lexer error: {}", e);
            process::exit(1);
        }
    }
}
