//! Disassembler for the flat instruction stream. Output is meant for
//! humans debugging lowering: absolute offsets, jump-target markers,
//! and (when a debug-info sidecar is available) function labels and
//! annotated call targets.

use crate::bytecode::module::{DebugInfo, Module};
use crate::bytecode::op::Op;
use std::collections::BTreeSet;
use std::fmt::Write;

enum Operand {
    None,
    U8(u8),
    U32(u32),
    U64(u64),
    Call { addr: u32, argc: u8 },
}

/// Decode the instruction at `ip`. Returns the opcode, its operand and
/// the offset of the next instruction, or `None` on a malformed tail.
fn decode_at(code: &[u8], ip: usize) -> Option<(Op, Operand, usize)> {
    let op = Op::from_byte(*code.get(ip)?)?;
    let operand_start = ip + 1;

    let read_u8 = |at: usize| -> Option<u8> { code.get(at).copied() };
    let read_u32 = |at: usize| -> Option<u32> {
        let bytes = code.get(at..at + 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    };
    let read_u64 = |at: usize| -> Option<u64> {
        let bytes = code.get(at..at + 8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Some(u64::from_le_bytes(buf))
    };

    use Op::*;
    let (operand, next) = match op {
        ConstInt | ConstStr | Jmp | Jz | AllocStruct | AllocArray | AllocStack | Try | Native => {
            (Operand::U32(read_u32(operand_start)?), operand_start + 4)
        }
        ConstFloat => (Operand::U64(read_u64(operand_start)?), operand_start + 8),
        GetGlobal | SetGlobal | GetLocal | SetLocal | GetField | SetField | Ret | PrintFmt => {
            (Operand::U8(read_u8(operand_start)?), operand_start + 1)
        }
        Call => {
            let addr = read_u32(operand_start)?;
            let argc = read_u8(operand_start + 4)?;
            (Operand::Call { addr, argc }, operand_start + 5)
        }
        _ => (Operand::None, operand_start),
    };
    Some((op, operand, next))
}

/// Offsets that some instruction jumps or calls to.
fn collect_targets(code: &[u8]) -> BTreeSet<usize> {
    let mut targets = BTreeSet::new();
    let mut ip = 0;
    while ip < code.len() {
        match decode_at(code, ip) {
            Some((op, operand, next)) => {
                match (op, &operand) {
                    (Op::Jmp | Op::Jz | Op::Try, Operand::U32(t)) => {
                        targets.insert(*t as usize);
                    }
                    (Op::Call, Operand::Call { addr, .. }) => {
                        targets.insert(*addr as usize);
                    }
                    _ => {}
                }
                ip = next;
            }
            None => break,
        }
    }
    targets
}

pub fn disassemble(module: &Module, debug: Option<&DebugInfo>) -> String {
    let code = &module.code;
    let mut out = String::new();

    let _ = writeln!(
        out,
        "module: {} string(s), {} struct(s), {} byte(s) of code",
        module.strings.len(),
        module.structs.len(),
        code.len()
    );
    for (i, meta) in module.structs.iter().enumerate() {
        let _ = writeln!(out, "  struct #{} {} ({} slots)", i, meta.name, meta.slots);
    }

    let targets = collect_targets(code);
    let mut ip = 0;
    while ip < code.len() {
        if let Some(info) = debug.and_then(|d| d.function_at(ip as u32)) {
            let _ = writeln!(
                out,
                "\n{} (args={}, rets={}):",
                info.name, info.arg_count, info.ret_count
            );
        }

        let Some((op, operand, next)) = decode_at(code, ip) else {
            let _ = writeln!(out, "{:04x} ?? malformed instruction", ip);
            break;
        };

        let marker = if targets.contains(&ip) { '>' } else { ' ' };
        let _ = write!(out, "{:04x} {} {:<12}", ip, marker, op.mnemonic());

        match (op, operand) {
            (Op::ConstFloat, Operand::U64(bits)) => {
                let _ = write!(out, " {}", f64::from_bits(bits));
            }
            (Op::ConstStr, Operand::U32(idx)) => {
                let _ = write!(out, " {}", idx);
                if let Some(s) = module.strings.get(idx as usize) {
                    let _ = write!(out, " ; {:?}", s);
                }
            }
            (Op::ConstInt, Operand::U32(v)) => {
                let _ = write!(out, " {}", v as i32);
            }
            (Op::Jmp | Op::Jz | Op::Try, Operand::U32(t)) => {
                let _ = write!(out, " {:04x}", t);
            }
            (Op::Call, Operand::Call { addr, argc }) => {
                let _ = write!(out, " {:04x} argc={}", addr, argc);
                if let Some(f) = debug.and_then(|d| d.function_at(addr)) {
                    let _ = write!(out, " ; {}", f.name);
                }
            }
            (_, Operand::U32(v)) => {
                let _ = write!(out, " {}", v);
            }
            (_, Operand::U8(v)) => {
                let _ = write!(out, " {}", v);
            }
            _ => {}
        }
        let _ = writeln!(out);
        ip = next;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::code::CodeBuf;

    fn module_of(code: CodeBuf, strings: Vec<String>) -> Module {
        Module {
            strings,
            structs: Vec::new(),
            code: code.into_bytes(),
        }
    }

    #[test]
    fn test_simple_listing() {
        let mut code = CodeBuf::new();
        code.emit_op(Op::ConstInt);
        code.emit_u32(42);
        code.emit_op(Op::Print);
        code.emit_op(Op::Halt);

        let asm = disassemble(&module_of(code, vec![]), None);
        assert!(asm.contains("const_int"));
        assert!(asm.contains("42"));
        assert!(asm.contains("print"));
        assert!(asm.contains("halt"));
    }

    #[test]
    fn test_jump_targets_are_marked() {
        let mut code = CodeBuf::new();
        code.emit_op(Op::Jmp);
        code.emit_u32(5); // the halt below
        code.emit_op(Op::Halt);

        let asm = disassemble(&module_of(code, vec![]), None);
        assert!(asm.contains("0005 > halt"));
    }

    #[test]
    fn test_string_constants_are_annotated() {
        let mut code = CodeBuf::new();
        code.emit_op(Op::ConstStr);
        code.emit_u32(0);
        code.emit_op(Op::PrintStr);
        code.emit_op(Op::Halt);

        let asm = disassemble(&module_of(code, vec!["boom".to_string()]), None);
        assert!(asm.contains("\"boom\""));
    }

    #[test]
    fn test_negative_const_int_renders_signed() {
        let mut code = CodeBuf::new();
        code.emit_op(Op::ConstInt);
        code.emit_u32(-3i32 as u32);
        code.emit_op(Op::Halt);

        let asm = disassemble(&module_of(code, vec![]), None);
        assert!(asm.contains("-3"));
    }

    #[test]
    fn test_debug_info_labels_functions_and_calls() {
        use crate::bytecode::module::{DebugInfo, FuncDebug};

        let mut code = CodeBuf::new();
        code.emit_op(Op::Jmp);
        let site = code.pos();
        code.emit_u32(0);
        let entry = code.pos() as u32;
        code.emit_op(Op::ConstInt);
        code.emit_u32(0);
        code.emit_op(Op::Ret);
        code.emit_u8(1);
        let main = code.pos() as u32;
        code.patch_u32(site, main);
        code.emit_op(Op::Call);
        code.emit_u32(entry);
        code.emit_u8(0);
        code.emit_op(Op::Halt);

        let debug = DebugInfo {
            functions: vec![FuncDebug {
                name: "tick".to_string(),
                addr: entry,
                arg_count: 0,
                ret_count: 1,
            }],
            globals: vec![],
        };
        let asm = disassemble(&module_of(code, vec![]), Some(&debug));
        assert!(asm.contains("tick (args=0, rets=1):"));
        assert!(asm.contains("; tick"));
    }

    #[test]
    fn test_malformed_tail_is_reported() {
        let module = Module {
            strings: vec![],
            structs: vec![],
            code: vec![Op::ConstInt as u8, 1],
        };
        let asm = disassemble(&module, None);
        assert!(asm.contains("malformed"));
    }
}
