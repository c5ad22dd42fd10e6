//! The code generator: a recursive-descent, type-directed compiler that
//! parses and emits in one forward pass. Every expression-compiling
//! method returns the static type of the value it leaves on the operand
//! stack, so callers pick integer or floating-point instruction
//! variants without a separate checking pass. Forward jumps are emitted
//! with placeholder targets and backpatched; function signatures are
//! pre-registered in a token pre-scan so forward and mutually recursive
//! calls resolve.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::bytecode::code::CodeBuf;
use crate::bytecode::compile_error::CompileError;
use crate::bytecode::module::{DebugInfo, FuncDebug, Module, StructMeta};
use crate::bytecode::op::Op;
use crate::lexer::{self, Span, Spanned};
use crate::runtime::native;
use crate::symbols::{DataType, Field, SymbolTable, TypeInfo};
use crate::token::Token;

const MAX_LOCALS: usize = 256;
const MAX_GLOBALS: usize = 256;
const MAX_FIELDS: usize = 256;
const MAX_RETURNS: usize = 8;
const MAX_CALL_ARGS: usize = 255;
const MAX_FMT_ARGS: usize = 255;

/// Bytes per stack/heap cell, recorded as the array element width.
const CELL_BYTES: u32 = 8;

/// Result of a successful compilation: the runnable module plus the
/// debug-info sidecar.
#[derive(Debug, Clone)]
pub struct Compiled {
    pub module: Module,
    pub debug: DebugInfo,
}

/// The innermost loop being compiled: where `continue` jumps, the
/// pending `break` patch sites resolved when the loop ends, and the
/// local count at loop entry so early exits pop block locals first.
struct LoopContext {
    continue_addr: u32,
    break_patches: Vec<usize>,
    entry_locals: usize,
}

/// A variable reference resolved against the symbol tables.
#[derive(Clone, Copy)]
struct VarRef {
    slot: u8,
    is_local: bool,
    info: TypeInfo,
}

pub struct Compiler {
    tokens: Vec<Spanned>,
    pos: usize,
    code: CodeBuf,
    strings: Vec<String>,
    syms: SymbolTable,
    loops: Vec<LoopContext>,
    /// Call sites waiting for their target address: (operand offset,
    /// function id). Resolved once every body has been compiled.
    call_fixups: Vec<(usize, usize)>,
    /// Declared returns of the function being compiled; `None` at the
    /// top level.
    current_rets: Option<Vec<TypeInfo>>,
}

/// Compile a source string (no import resolution).
pub fn compile_source(source: &str) -> Result<Compiled, CompileError> {
    let tokens = lexer::tokenize(source)?;
    Compiler::new(tokens).compile()
}

/// Compile a source file, splicing `import` statements first.
pub fn compile_file(path: &Path) -> Result<Compiled, CompileError> {
    let mut included = HashSet::new();
    let tokens = load_tokens(path, &mut included)?;
    Compiler::new(tokens).compile()
}

/// Read and tokenize a file, recursively replacing each
/// `import a.b;` with the token stream of `a/b.cn` (resolved against
/// the importing file's directory). Each file is spliced at most once.
fn load_tokens(
    path: &Path,
    included: &mut HashSet<PathBuf>,
) -> Result<Vec<Spanned>, CompileError> {
    let display = path.display().to_string();
    let canonical = path
        .canonicalize()
        .map_err(|e| CompileError::import(&display, e.to_string()))?;
    if !included.insert(canonical.clone()) {
        return Ok(Vec::new());
    }
    let source = std::fs::read_to_string(&canonical)
        .map_err(|e| CompileError::import(&display, e.to_string()))?;
    let raw = lexer::tokenize(&source)?;
    let base_dir = canonical
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_default();

    let mut out = Vec::new();
    let mut i = 0;
    while i < raw.len() {
        if raw[i].token != Token::Import {
            out.push(raw[i].clone());
            i += 1;
            continue;
        }
        let span = raw[i].span;
        i += 1;
        let mut rel = PathBuf::new();
        loop {
            match raw.get(i).map(|s| &s.token) {
                Some(Token::Ident(name)) => {
                    rel.push(name);
                    i += 1;
                }
                _ => {
                    return Err(CompileError::syntax(
                        "expected a module name after 'import'",
                        span,
                    ));
                }
            }
            match raw.get(i).map(|s| &s.token) {
                Some(Token::Dot) => i += 1,
                Some(Token::Semi) => {
                    i += 1;
                    break;
                }
                _ => {
                    return Err(CompileError::syntax(
                        "expected '.' or ';' in import path",
                        span,
                    ));
                }
            }
        }
        rel.set_extension("cn");
        let inner = load_tokens(&base_dir.join(&rel), included)?;
        out.extend(inner.into_iter().filter(|s| s.token != Token::Eof));
    }
    Ok(out)
}

impl Compiler {
    pub fn new(mut tokens: Vec<Spanned>) -> Self {
        if tokens.is_empty() {
            tokens.push(Spanned {
                token: Token::Eof,
                span: Span { line: 1, col: 1 },
            });
        }
        Compiler {
            tokens,
            pos: 0,
            code: CodeBuf::new(),
            strings: Vec::new(),
            syms: SymbolTable::new(),
            loops: Vec::new(),
            call_fixups: Vec::new(),
            current_rets: None,
        }
    }

    pub fn compile(mut self) -> Result<Compiled, CompileError> {
        self.predeclare()?;
        self.parse_program()?;
        self.finish()
    }

    // =========================================================================
    // Token cursor
    // =========================================================================

    fn cur(&self) -> &Spanned {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn kind(&self) -> &Token {
        &self.cur().token
    }

    fn span(&self) -> Span {
        self.cur().span
    }

    fn peek(&self, n: usize) -> &Token {
        &self.tokens[(self.pos + n).min(self.tokens.len() - 1)].token
    }

    fn advance(&mut self) {
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
    }

    fn accept(&mut self, token: &Token) -> bool {
        if self.kind() == token {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token) -> Result<(), CompileError> {
        if self.accept(token) {
            Ok(())
        } else {
            Err(CompileError::syntax(
                format!("expected '{}' but found '{}'", token, self.kind()),
                self.span(),
            ))
        }
    }

    fn take_ident(&mut self) -> Result<String, CompileError> {
        match self.kind().clone() {
            Token::Ident(name) => {
                self.advance();
                Ok(name)
            }
            tok => Err(CompileError::syntax(
                format!("expected an identifier, found '{}'", tok),
                self.span(),
            )),
        }
    }

    fn take_dotted_name(&mut self) -> Result<String, CompileError> {
        let mut name = self.take_ident()?;
        while self.accept(&Token::Dot) {
            name.push('.');
            name.push_str(&self.take_ident()?);
        }
        Ok(name)
    }

    // =========================================================================
    // Signature pre-scan
    // =========================================================================

    /// Register every struct name and function signature before code
    /// generation, so forward references and mutual recursion resolve
    /// in the single emission pass.
    fn predeclare(&mut self) -> Result<(), CompileError> {
        // Struct names first: signatures may mention structs declared
        // later in the file.
        let mut depth = 0usize;
        for i in 0..self.tokens.len() {
            match &self.tokens[i].token {
                Token::LBrace => depth += 1,
                Token::RBrace => depth = depth.saturating_sub(1),
                Token::Struct if depth == 0 => {
                    if let Some(Spanned {
                        token: Token::Ident(name),
                        span,
                    }) = self.tokens.get(i + 1)
                    {
                        if self.syms.find_struct(name).is_some() {
                            return Err(CompileError::structural(
                                format!("duplicate struct '{}'", name),
                                *span,
                            ));
                        }
                        self.syms.add_struct(name.clone());
                    }
                }
                _ => {}
            }
        }

        self.pos = 0;
        loop {
            match self.kind().clone() {
                Token::Eof => break,
                Token::Function => {
                    self.advance();
                    let name = self.take_dotted_name()?;
                    self.scan_signature(name, None)?;
                }
                Token::LBrace => self.skip_block_from_open()?,
                tok => {
                    if self.at_type_start(&tok) {
                        let save = self.pos;
                        let parsed = self.parse_type();
                        match parsed {
                            Ok(ret)
                                if matches!(self.kind(), Token::Ident(_))
                                    && *self.peek(1) == Token::LParen =>
                            {
                                let name = self.take_ident()?;
                                self.scan_signature(name, Some(ret))?;
                            }
                            _ => {
                                self.pos = save;
                                self.advance();
                            }
                        }
                    } else {
                        self.advance();
                    }
                }
            }
        }
        self.pos = 0;
        Ok(())
    }

    /// Parse a signature without emitting code or declaring locals,
    /// then skip the body. `preset_ret` is the C-style leading return
    /// type; otherwise the `: (...)` annotation is scanned.
    fn scan_signature(
        &mut self,
        name: String,
        preset_ret: Option<TypeInfo>,
    ) -> Result<(), CompileError> {
        let span = self.span();
        if self.syms.find_func(&name).is_some() {
            return Err(CompileError::structural(
                format!("duplicate function '{}'", name),
                span,
            ));
        }
        self.expect(&Token::LParen)?;
        let mut arg_count = 0usize;
        if *self.kind() != Token::RParen {
            loop {
                self.parse_type()?;
                self.take_ident()?;
                arg_count += 1;
                if !self.accept(&Token::Comma) {
                    break;
                }
            }
        }
        self.expect(&Token::RParen)?;
        let rets = match preset_ret {
            Some(ret) => vec![ret],
            None => {
                if self.accept(&Token::Colon) {
                    self.scan_return_list()?
                } else {
                    vec![TypeInfo::VOID]
                }
            }
        };
        if arg_count > MAX_CALL_ARGS {
            return Err(CompileError::structural(
                format!("function '{}' has too many parameters", name),
                span,
            ));
        }
        if rets.len() > MAX_RETURNS {
            return Err(CompileError::structural(
                format!(
                    "function '{}' declares {} return values (max {})",
                    name,
                    rets.len(),
                    MAX_RETURNS
                ),
                span,
            ));
        }
        self.syms.add_func(name, arg_count as u8, rets);
        self.skip_block()
    }

    fn scan_return_list(&mut self) -> Result<Vec<TypeInfo>, CompileError> {
        let mut rets = Vec::new();
        if self.accept(&Token::LParen) {
            loop {
                let info = self.parse_type()?;
                if matches!(self.kind(), Token::Ident(_)) {
                    self.advance(); // named return value
                }
                rets.push(info);
                if !self.accept(&Token::Comma) {
                    break;
                }
            }
            self.expect(&Token::RParen)?;
        } else {
            rets.push(self.parse_type()?);
        }
        Ok(rets)
    }

    fn skip_block(&mut self) -> Result<(), CompileError> {
        self.expect(&Token::LBrace)?;
        self.skip_block_body()
    }

    fn skip_block_from_open(&mut self) -> Result<(), CompileError> {
        self.advance(); // the '{' that triggered this
        self.skip_block_body()
    }

    fn skip_block_body(&mut self) -> Result<(), CompileError> {
        let mut depth = 1usize;
        while depth > 0 {
            match self.kind() {
                Token::LBrace => depth += 1,
                Token::RBrace => depth -= 1,
                Token::Eof => {
                    return Err(CompileError::syntax(
                        "unexpected EOF inside a block",
                        self.span(),
                    ));
                }
                _ => {}
            }
            self.advance();
        }
        Ok(())
    }

    fn at_type_start(&self, token: &Token) -> bool {
        match token {
            Token::Ident(name) => self.syms.find_struct(name).is_some(),
            tok => tok.starts_type(),
        }
    }

    // =========================================================================
    // Top level
    // =========================================================================

    fn parse_program(&mut self) -> Result<(), CompileError> {
        loop {
            match self.kind().clone() {
                Token::Eof => break,
                Token::Import => {
                    return Err(CompileError::syntax(
                        "imports are only available when compiling from a file",
                        self.span(),
                    ));
                }
                Token::Struct => self.parse_struct()?,
                Token::Function => {
                    self.advance();
                    // top-level flow jumps over function bodies
                    self.code.emit_op(Op::Jmp);
                    let skip = self.code.pos();
                    self.code.emit_u32(0);
                    let name = self.take_dotted_name()?;
                    self.parse_func(name, false)?;
                    let end = self.code.pos() as u32;
                    self.code.patch_u32(skip, end);
                }
                tok if self.at_type_start(&tok) => {
                    let info = self.parse_type()?;
                    if matches!(self.kind(), Token::Ident(_)) && *self.peek(1) == Token::LParen {
                        // C-style definition: `T name(...) { ... }`
                        self.code.emit_op(Op::Jmp);
                        let skip = self.code.pos();
                        self.code.emit_u32(0);
                        let name = self.take_ident()?;
                        self.parse_func(name, true)?;
                        let end = self.code.pos() as u32;
                        self.code.patch_u32(skip, end);
                    } else {
                        self.parse_global_decl(info)?;
                    }
                }
                _ => self.statement()?,
            }
        }

        // Top-level statements ran in order; now enter main, if any.
        if let Some(fid) = self.syms.find_func("main") {
            if self.syms.funcs[fid].arg_count != 0 {
                return Err(CompileError::structural(
                    "main must take no arguments",
                    self.span(),
                ));
            }
            self.emit_call(fid, 0);
            let ret_count = self.syms.funcs[fid].rets.len();
            for _ in 0..ret_count {
                self.code.emit_op(Op::Pop);
            }
        }
        self.code.emit_op(Op::Halt);
        Ok(())
    }

    fn parse_global_decl(&mut self, info: TypeInfo) -> Result<(), CompileError> {
        let name = self.take_ident()?;

        // tuple declaration: `int a, b = f(...);`
        if *self.kind() == Token::Comma {
            let mut names = vec![name];
            while self.accept(&Token::Comma) {
                names.push(self.take_ident()?);
            }
            let mut slots = Vec::new();
            for n in names {
                slots.push(self.declare_global(n, info)?);
            }
            if self.accept(&Token::Assign) {
                self.compile_unpack_call(slots.len())?;
                self.expect(&Token::Semi)?;
                for slot in slots.iter().rev() {
                    self.code.emit_op(Op::SetGlobal);
                    self.code.emit_u8(*slot);
                }
            } else {
                self.expect(&Token::Semi)?; // zero-initialized by the engine
            }
            return Ok(());
        }

        let slot = self.declare_global(name, info)?;
        if self.accept(&Token::Assign) {
            self.expression()?;
            self.code.emit_op(Op::SetGlobal);
            self.code.emit_u8(slot);
        }
        self.expect(&Token::Semi)
    }

    fn parse_struct(&mut self) -> Result<(), CompileError> {
        self.expect(&Token::Struct)?;
        let span = self.span();
        let name = self.take_ident()?;
        let sid = self
            .syms
            .find_struct(&name)
            .ok_or_else(|| CompileError::undefined("struct", &name, span))?;
        self.expect(&Token::LBrace)?;
        let mut fields: Vec<Field> = Vec::new();
        while *self.kind() != Token::RBrace {
            let info = self.parse_type()?;
            let fspan = self.span();
            let fname = self.take_ident()?;
            self.expect(&Token::Semi)?;
            if fields.len() >= MAX_FIELDS {
                return Err(CompileError::structural(
                    format!("struct '{}' has too many fields (max {})", name, MAX_FIELDS),
                    fspan,
                ));
            }
            if fields.iter().any(|f| f.name == fname) {
                return Err(CompileError::structural(
                    format!("duplicate field '{}' in struct '{}'", fname, name),
                    fspan,
                ));
            }
            let offset = fields.len() as u8;
            fields.push(Field {
                name: fname,
                info,
                offset,
            });
        }
        self.expect(&Token::RBrace)?;
        self.syms.structs[sid as usize].fields = fields;
        Ok(())
    }

    /// Compile a function definition. The signature was registered by
    /// the pre-scan; this pass fills in the entry address, declares
    /// parameters as the first local slots and compiles the body.
    /// `c_style` definitions carry their single return type before the
    /// name instead of a `:` annotation.
    fn parse_func(&mut self, name: String, c_style: bool) -> Result<(), CompileError> {
        let span = self.span();
        let fid = self
            .syms
            .find_func(&name)
            .ok_or_else(|| CompileError::undefined("function", &name, span))?;
        self.syms.funcs[fid].addr = self.code.pos() as u32;
        self.syms.truncate_locals(0);

        self.expect(&Token::LParen)?;
        if *self.kind() != Token::RParen {
            loop {
                let info = self.parse_type()?;
                let pname = self.take_ident()?;
                self.declare_local(pname, info)?;
                if !self.accept(&Token::Comma) {
                    break;
                }
            }
        }
        self.expect(&Token::RParen)?;

        let rets = if c_style {
            self.syms.funcs[fid].rets.clone()
        } else if self.accept(&Token::Colon) {
            self.parse_return_annotation()?
        } else {
            vec![TypeInfo::VOID]
        };

        self.current_rets = Some(rets.clone());
        self.expect(&Token::LBrace)?;
        while *self.kind() != Token::RBrace {
            if *self.kind() == Token::Eof {
                return Err(CompileError::syntax(
                    "unexpected EOF inside a function body",
                    self.span(),
                ));
            }
            self.statement()?;
        }
        self.expect(&Token::RBrace)?;
        self.emit_fallthrough_return(&rets);
        self.current_rets = None;
        self.syms.truncate_locals(0);
        Ok(())
    }

    /// Parse the `: T` / `: (T, T name, ...)` return annotation. Named
    /// return values become locals whose slots are reserved with zero
    /// pushes at function entry.
    fn parse_return_annotation(&mut self) -> Result<Vec<TypeInfo>, CompileError> {
        let mut rets = Vec::new();
        if self.accept(&Token::LParen) {
            loop {
                let info = self.parse_type()?;
                if matches!(self.kind(), Token::Ident(_)) {
                    let rname = self.take_ident()?;
                    self.declare_local(rname, info)?;
                    self.code.emit_op(Op::ConstInt);
                    self.code.emit_u32(0);
                }
                rets.push(info);
                if !self.accept(&Token::Comma) {
                    break;
                }
            }
            self.expect(&Token::RParen)?;
        } else {
            rets.push(self.parse_type()?);
        }
        Ok(rets)
    }

    /// Falling off the end of a body returns zeros; void functions
    /// return the single dummy cell the caller pops.
    fn emit_fallthrough_return(&mut self, rets: &[TypeInfo]) {
        let count = rets.len();
        for _ in 0..count {
            self.code.emit_op(Op::ConstInt);
            self.code.emit_u32(0);
        }
        self.code.emit_op(Op::Ret);
        self.code.emit_u8(count as u8);
    }

    fn parse_type(&mut self) -> Result<TypeInfo, CompileError> {
        let span = self.span();
        let mut info = match self.kind().clone() {
            Token::KwInt => {
                self.advance();
                TypeInfo::scalar(DataType::Int)
            }
            Token::KwFloat => {
                self.advance();
                TypeInfo::scalar(DataType::Float)
            }
            Token::KwChar => {
                self.advance();
                TypeInfo::scalar(DataType::Char)
            }
            Token::KwStr => {
                self.advance();
                TypeInfo::scalar(DataType::Str)
            }
            Token::KwVoid => {
                self.advance();
                TypeInfo::VOID
            }
            Token::Ident(name) => match self.syms.find_struct(&name) {
                Some(sid) => {
                    self.advance();
                    TypeInfo::of_struct(sid)
                }
                None => return Err(CompileError::undefined("type", name, span)),
            },
            tok => {
                return Err(CompileError::syntax(
                    format!("expected a type, found '{}'", tok),
                    span,
                ));
            }
        };
        while self.accept(&Token::LBracket) {
            self.expect(&Token::RBracket)?;
            info.ty = DataType::Array;
            info.array_depth += 1;
        }
        Ok(info)
    }

    // =========================================================================
    // Statements
    // =========================================================================

    fn statement(&mut self) -> Result<(), CompileError> {
        match self.kind().clone() {
            Token::LBrace => {
                self.advance();
                self.block_body()
            }
            Token::Break => {
                self.advance();
                self.add_break()?;
                self.expect(&Token::Semi)
            }
            Token::Continue => {
                self.advance();
                self.add_continue()?;
                self.expect(&Token::Semi)
            }
            Token::Try => {
                self.advance();
                self.try_statement()
            }
            Token::Throw => {
                self.advance();
                let span = self.span();
                let info = self.expression()?;
                if info.ty != DataType::Str {
                    return Err(CompileError::type_error(
                        "throw expects a string value",
                        span,
                    ));
                }
                self.expect(&Token::Semi)?;
                self.code.emit_op(Op::Throw);
                Ok(())
            }
            Token::HeapDump => {
                self.advance();
                self.expect(&Token::LParen)?;
                self.expect(&Token::RParen)?;
                self.expect(&Token::Semi)?;
                self.code.emit_op(Op::HeapDump);
                Ok(())
            }
            Token::Print => {
                self.advance();
                self.print_statement()
            }
            Token::Free => {
                self.advance();
                self.expect(&Token::LParen)?;
                self.expression()?;
                self.expect(&Token::RParen)?;
                self.expect(&Token::Semi)?;
                self.code.emit_op(Op::Free);
                Ok(())
            }
            Token::Return => {
                self.advance();
                self.return_statement()
            }
            Token::While => {
                self.advance();
                self.while_statement()
            }
            Token::For => {
                self.advance();
                self.for_statement()
            }
            Token::If => {
                self.advance();
                self.if_statement()
            }
            tok if self.is_decl_start(&tok) => self.local_decl(),
            Token::Ident(_) => self.ident_statement(),
            _ => {
                let info = self.expression()?;
                if info.ty != DataType::Void {
                    self.code.emit_op(Op::Pop);
                }
                self.expect(&Token::Semi)
            }
        }
    }

    fn is_decl_start(&self, token: &Token) -> bool {
        match token {
            Token::KwInt | Token::KwFloat | Token::KwChar | Token::KwStr => true,
            Token::Ident(name) => self.syms.find_struct(name).is_some(),
            _ => false,
        }
    }

    /// `{ ... }`: entering records the local count, leaving emits one
    /// pop per local declared inside, making block exit an explicit
    /// compiled cleanup sequence.
    fn block_body(&mut self) -> Result<(), CompileError> {
        let saved = self.syms.local_count();
        while *self.kind() != Token::RBrace {
            if *self.kind() == Token::Eof {
                return Err(CompileError::syntax(
                    "unexpected EOF: unterminated block",
                    self.span(),
                ));
            }
            self.statement()?;
        }
        self.expect(&Token::RBrace)?;
        self.pop_scope(saved);
        Ok(())
    }

    fn pop_scope(&mut self, saved: usize) {
        for _ in saved..self.syms.local_count() {
            self.code.emit_op(Op::Pop);
        }
        self.syms.truncate_locals(saved);
    }

    /// Pop the locals declared since loop entry without forgetting
    /// them: the jump leaves the block early, but the block itself
    /// keeps compiling for the fallthrough path.
    fn emit_loop_exit_pops(&mut self, entry_locals: usize) {
        for _ in entry_locals..self.syms.local_count() {
            self.code.emit_op(Op::Pop);
        }
    }

    fn add_break(&mut self) -> Result<(), CompileError> {
        let entry = match self.loops.last() {
            Some(ctx) => ctx.entry_locals,
            None => {
                return Err(CompileError::structural(
                    "break outside of a loop",
                    self.span(),
                ));
            }
        };
        self.emit_loop_exit_pops(entry);
        self.code.emit_op(Op::Jmp);
        let site = self.code.pos();
        self.code.emit_u32(0);
        if let Some(ctx) = self.loops.last_mut() {
            ctx.break_patches.push(site);
        }
        Ok(())
    }

    fn add_continue(&mut self) -> Result<(), CompileError> {
        let (target, entry) = match self.loops.last() {
            Some(ctx) => (ctx.continue_addr, ctx.entry_locals),
            None => {
                return Err(CompileError::structural(
                    "continue outside of a loop",
                    self.span(),
                ));
            }
        };
        self.emit_loop_exit_pops(entry);
        self.code.emit_op(Op::Jmp);
        self.code.emit_u32(target);
        Ok(())
    }

    fn leave_loop(&mut self, end: u32) {
        if let Some(ctx) = self.loops.pop() {
            for site in ctx.break_patches {
                self.code.patch_u32(site, end);
            }
        }
    }

    fn while_statement(&mut self) -> Result<(), CompileError> {
        self.expect(&Token::LParen)?;
        let start = self.code.pos() as u32;
        self.expression()?;
        self.expect(&Token::RParen)?;
        self.code.emit_op(Op::Jz);
        let exit = self.code.pos();
        self.code.emit_u32(0);
        self.loops.push(LoopContext {
            continue_addr: start,
            break_patches: Vec::new(),
            entry_locals: self.syms.local_count(),
        });
        self.statement()?;
        self.code.emit_op(Op::Jmp);
        self.code.emit_u32(start);
        let end = self.code.pos() as u32;
        self.code.patch_u32(exit, end);
        self.leave_loop(end);
        Ok(())
    }

    /// `for (init; cond; step) body` — the step clause is emitted
    /// before the body, so the layout needs two forward hops: cond
    /// falls into the step section, which jumps back to cond; the body
    /// lives after and jumps to the step. `continue` targets the step.
    fn for_statement(&mut self) -> Result<(), CompileError> {
        self.expect(&Token::LParen)?;
        let saved = self.syms.local_count();
        self.statement()?; // init, consumes its ';'

        let cond = self.code.pos() as u32;
        self.expression()?;
        self.expect(&Token::Semi)?;
        self.code.emit_op(Op::Jz);
        let exit = self.code.pos();
        self.code.emit_u32(0);
        self.code.emit_op(Op::Jmp);
        let to_body = self.code.pos();
        self.code.emit_u32(0);

        let step = self.code.pos() as u32;
        self.for_step()?;
        self.expect(&Token::RParen)?;
        self.code.emit_op(Op::Jmp);
        self.code.emit_u32(cond);

        let body = self.code.pos() as u32;
        self.code.patch_u32(to_body, body);
        self.loops.push(LoopContext {
            continue_addr: step,
            break_patches: Vec::new(),
            entry_locals: self.syms.local_count(),
        });
        self.statement()?;
        self.code.emit_op(Op::Jmp);
        self.code.emit_u32(step);
        let end = self.code.pos() as u32;
        self.code.patch_u32(exit, end);
        self.leave_loop(end);
        self.pop_scope(saved);
        Ok(())
    }

    fn for_step(&mut self) -> Result<(), CompileError> {
        if !matches!(self.kind(), Token::Ident(_)) {
            return Ok(()); // empty step clause
        }
        let span = self.span();
        let name = self.take_ident()?;
        let var = self
            .resolve_var(&name)
            .ok_or_else(|| CompileError::undefined("variable", &name, span))?;
        if self.accept(&Token::PlusPlus) {
            self.emit_get_var(&var);
            self.code.emit_op(Op::ConstInt);
            self.code.emit_u32(1);
            self.code.emit_op(Op::Add);
            self.emit_set_var(&var);
        } else if self.accept(&Token::MinusMinus) {
            self.emit_get_var(&var);
            self.code.emit_op(Op::ConstInt);
            self.code.emit_u32(1);
            self.code.emit_op(Op::Sub);
            self.emit_set_var(&var);
        } else if self.accept(&Token::Assign) {
            self.expression()?;
            self.emit_set_var(&var);
        } else {
            return Err(CompileError::syntax(
                "expected '++', '--' or '=' in for-loop step",
                self.span(),
            ));
        }
        Ok(())
    }

    fn if_statement(&mut self) -> Result<(), CompileError> {
        self.expect(&Token::LParen)?;
        self.expression()?;
        self.expect(&Token::RParen)?;
        self.code.emit_op(Op::Jz);
        let else_site = self.code.pos();
        self.code.emit_u32(0);
        self.statement()?;
        if self.accept(&Token::Else) {
            self.code.emit_op(Op::Jmp);
            let end_site = self.code.pos();
            self.code.emit_u32(0);
            let here = self.code.pos() as u32;
            self.code.patch_u32(else_site, here);
            self.statement()?;
            let end = self.code.pos() as u32;
            self.code.patch_u32(end_site, end);
        } else {
            let here = self.code.pos() as u32;
            self.code.patch_u32(else_site, here);
        }
        Ok(())
    }

    fn try_statement(&mut self) -> Result<(), CompileError> {
        self.expect(&Token::LBrace)?;
        self.code.emit_op(Op::Try);
        let catch_site = self.code.pos();
        self.code.emit_u32(0);
        let saved = self.syms.local_count();
        while *self.kind() != Token::RBrace {
            if *self.kind() == Token::Eof {
                return Err(CompileError::syntax(
                    "unexpected EOF inside a try block",
                    self.span(),
                ));
            }
            self.statement()?;
        }
        self.expect(&Token::RBrace)?;
        self.pop_scope(saved);
        self.code.emit_op(Op::EndTry);
        self.code.emit_op(Op::Jmp);
        let end_site = self.code.pos();
        self.code.emit_u32(0);

        // handler entry: the thrown value is on the stack, bound to
        // the catch variable's slot
        let catch_addr = self.code.pos() as u32;
        self.code.patch_u32(catch_site, catch_addr);
        self.expect(&Token::Catch)?;
        self.expect(&Token::LParen)?;
        let err_name = self.take_ident()?;
        self.declare_local(err_name, TypeInfo::scalar(DataType::Str))?;
        self.expect(&Token::RParen)?;
        self.expect(&Token::LBrace)?;
        while *self.kind() != Token::RBrace {
            if *self.kind() == Token::Eof {
                return Err(CompileError::syntax(
                    "unexpected EOF inside a catch block",
                    self.span(),
                ));
            }
            self.statement()?;
        }
        self.expect(&Token::RBrace)?;
        self.code.emit_op(Op::Pop);
        let count = self.syms.local_count();
        self.syms.truncate_locals(count - 1);
        let end = self.code.pos() as u32;
        self.code.patch_u32(end_site, end);
        Ok(())
    }

    fn print_statement(&mut self) -> Result<(), CompileError> {
        self.expect(&Token::LParen)?;
        let span = self.span();
        let info = self.expression()?;

        if *self.kind() == Token::Comma {
            // formatted print: string first, then the hole arguments
            if info.ty != DataType::Str {
                return Err(CompileError::type_error(
                    "the first argument of a formatted print must be a string",
                    span,
                ));
            }
            let mut args = 0usize;
            while self.accept(&Token::Comma) {
                self.expression()?;
                args += 1;
            }
            self.expect(&Token::RParen)?;
            self.expect(&Token::Semi)?;
            if args > MAX_FMT_ARGS {
                return Err(CompileError::structural(
                    "too many formatted print arguments",
                    span,
                ));
            }
            self.code.emit_op(Op::PrintFmt);
            self.code.emit_u8(args as u8);
            return Ok(());
        }

        self.expect(&Token::RParen)?;
        self.expect(&Token::Semi)?;
        let op = match info.ty {
            DataType::Int => Op::Print,
            DataType::Float => Op::PrintF,
            DataType::Str => Op::PrintStr,
            DataType::Char => Op::PrintChar,
            _ => {
                return Err(CompileError::type_error(
                    "cannot print a value of this type",
                    span,
                ));
            }
        };
        self.code.emit_op(op);
        Ok(())
    }

    fn return_statement(&mut self) -> Result<(), CompileError> {
        let span = self.span();
        if self.accept(&Token::Semi) {
            // bare return: the void convention, one dummy cell
            if let Some(rets) = &self.current_rets {
                let is_void = rets.len() == 1 && rets[0].ty == DataType::Void;
                if !is_void {
                    return Err(CompileError::structural(
                        format!("this function must return {} value(s)", rets.len()),
                        span,
                    ));
                }
            }
            self.code.emit_op(Op::ConstInt);
            self.code.emit_u32(0);
            self.code.emit_op(Op::Ret);
            self.code.emit_u8(1);
            return Ok(());
        }

        let mut count = 0usize;
        loop {
            self.expression()?;
            count += 1;
            if !self.accept(&Token::Comma) {
                break;
            }
        }
        self.expect(&Token::Semi)?;
        if count > MAX_RETURNS {
            return Err(CompileError::structural(
                format!("too many return values (max {})", MAX_RETURNS),
                span,
            ));
        }
        if let Some(rets) = &self.current_rets {
            if count != rets.len() {
                return Err(CompileError::structural(
                    format!(
                        "return value count mismatch: declared {}, returning {}",
                        rets.len(),
                        count
                    ),
                    span,
                ));
            }
        }
        self.code.emit_op(Op::Ret);
        self.code.emit_u8(count as u8);
        Ok(())
    }

    fn local_decl(&mut self) -> Result<(), CompileError> {
        let info = self.parse_type()?;
        let name = self.take_ident()?;

        // tuple declaration: `int a, b = f(...);`
        if *self.kind() == Token::Comma {
            let mut names = vec![name];
            while self.accept(&Token::Comma) {
                names.push(self.take_ident()?);
            }
            let mut slots = Vec::new();
            for n in names {
                let slot = self.declare_local(n, info)?;
                // reserve the slot before the call executes
                self.code.emit_op(Op::ConstInt);
                self.code.emit_u32(0);
                slots.push(slot);
            }
            self.expect(&Token::Assign)?;
            self.compile_unpack_call(slots.len())?;
            self.expect(&Token::Semi)?;
            for slot in slots.iter().rev() {
                self.code.emit_op(Op::SetLocal);
                self.code.emit_u8(*slot);
            }
            return Ok(());
        }

        if self.accept(&Token::Assign) {
            self.expression()?;
        } else {
            self.code.emit_op(Op::ConstInt);
            self.code.emit_u32(0);
        }
        self.expect(&Token::Semi)?;
        // declared after its initializer, so `int x = x;` resolves the
        // outer x
        self.declare_local(name, info)?;
        Ok(())
    }

    /// Statements that begin with an identifier: calls, tuple
    /// unpacking, assignment and compound assignment, and field/index
    /// chains ending in either of those or a discarded read.
    fn ident_statement(&mut self) -> Result<(), CompileError> {
        let span = self.span();
        let mut name = self.take_ident()?;

        // tuple unpack into existing variables: `a, b = f(...);`
        if *self.kind() == Token::Comma {
            let mut names = vec![name];
            while self.accept(&Token::Comma) {
                names.push(self.take_ident()?);
            }
            self.expect(&Token::Assign)?;
            self.compile_unpack_call(names.len())?;
            self.expect(&Token::Semi)?;
            for n in names.iter().rev() {
                let var = self
                    .resolve_var(n)
                    .ok_or_else(|| CompileError::undefined("variable", n, span))?;
                self.emit_set_var(&var);
            }
            return Ok(());
        }

        let mut var = self.resolve_var(&name);

        // unknown bare name followed by dots is a namespaced call:
        // `math.sq(3);`
        if var.is_none() {
            while self.accept(&Token::Dot) {
                name.push('.');
                name.push_str(&self.take_ident()?);
            }
            var = self.resolve_var(&name);
        }

        // call in statement position: results are discarded
        if self.accept(&Token::LParen) {
            if let Some(native_fn) = native::lookup(&name).copied() {
                self.compile_native_args(&native_fn, span)?;
                self.expect(&Token::Semi)?;
                self.code.emit_op(Op::Native);
                self.code.emit_u32(native_fn.id);
                if native_fn.ret != DataType::Void {
                    self.code.emit_op(Op::Pop);
                }
                return Ok(());
            }
            let fid = self.compile_user_call(&name, span)?;
            self.expect(&Token::Semi)?;
            let ret_count = self.syms.funcs[fid].rets.len();
            for _ in 0..ret_count {
                self.code.emit_op(Op::Pop);
            }
            return Ok(());
        }

        let var = var.ok_or_else(|| CompileError::undefined("variable", &name, span))?;

        // simple variable forms
        match self.kind().clone() {
            Token::Assign => {
                self.advance();
                self.expression()?;
                self.expect(&Token::Semi)?;
                self.emit_set_var(&var);
                return Ok(());
            }
            Token::PlusPlus => {
                self.advance();
                self.expect(&Token::Semi)?;
                self.emit_get_var(&var);
                self.code.emit_op(Op::ConstInt);
                self.code.emit_u32(1);
                self.code.emit_op(Op::Add);
                self.emit_set_var(&var);
                return Ok(());
            }
            Token::MinusMinus => {
                self.advance();
                self.expect(&Token::Semi)?;
                self.emit_get_var(&var);
                self.code.emit_op(Op::ConstInt);
                self.code.emit_u32(1);
                self.code.emit_op(Op::Sub);
                self.emit_set_var(&var);
                return Ok(());
            }
            Token::PlusAssign => {
                self.advance();
                self.emit_get_var(&var);
                let rhs = self.expression()?;
                self.expect(&Token::Semi)?;
                self.emit_arith(Op::Add, Op::AddF, var.info, rhs);
                self.emit_set_var(&var);
                return Ok(());
            }
            Token::MinusAssign => {
                self.advance();
                self.emit_get_var(&var);
                let rhs = self.expression()?;
                self.expect(&Token::Semi)?;
                self.emit_arith(Op::Sub, Op::SubF, var.info, rhs);
                self.emit_set_var(&var);
                return Ok(());
            }
            _ => {}
        }

        // field/index chain rooted at the variable's value
        self.emit_get_var(&var);
        let mut info = var.info;
        loop {
            if self.accept(&Token::Dot) {
                let (field_info, offset) = self.resolve_field(info)?;
                match self.kind().clone() {
                    Token::Assign => {
                        self.advance();
                        self.expression()?;
                        self.expect(&Token::Semi)?;
                        self.code.emit_op(Op::SetField);
                        self.code.emit_u8(offset);
                        return Ok(());
                    }
                    Token::PlusAssign => {
                        self.advance();
                        // keep the target address around for the
                        // read-modify-write
                        self.code.emit_op(Op::Dup);
                        self.code.emit_op(Op::GetField);
                        self.code.emit_u8(offset);
                        let rhs = self.expression()?;
                        self.expect(&Token::Semi)?;
                        self.emit_arith(Op::Add, Op::AddF, field_info, rhs);
                        self.code.emit_op(Op::SetField);
                        self.code.emit_u8(offset);
                        return Ok(());
                    }
                    Token::MinusAssign => {
                        self.advance();
                        self.code.emit_op(Op::Dup);
                        self.code.emit_op(Op::GetField);
                        self.code.emit_u8(offset);
                        let rhs = self.expression()?;
                        self.expect(&Token::Semi)?;
                        self.emit_arith(Op::Sub, Op::SubF, field_info, rhs);
                        self.code.emit_op(Op::SetField);
                        self.code.emit_u8(offset);
                        return Ok(());
                    }
                    Token::PlusPlus => {
                        self.advance();
                        self.expect(&Token::Semi)?;
                        self.emit_field_step(offset, Op::Add);
                        return Ok(());
                    }
                    Token::MinusMinus => {
                        self.advance();
                        self.expect(&Token::Semi)?;
                        self.emit_field_step(offset, Op::Sub);
                        return Ok(());
                    }
                    _ => {
                        self.code.emit_op(Op::GetField);
                        self.code.emit_u8(offset);
                        info = field_info;
                    }
                }
            } else if self.accept(&Token::LBracket) {
                if info.ty != DataType::Array {
                    return Err(CompileError::type_error(
                        "cannot index a non-array value",
                        span,
                    ));
                }
                self.expression()?;
                self.expect(&Token::RBracket)?;
                let elem = info.indexed();
                match self.kind().clone() {
                    Token::Assign => {
                        self.advance();
                        self.expression()?;
                        self.expect(&Token::Semi)?;
                        self.code.emit_op(Op::SetIndex);
                        return Ok(());
                    }
                    Token::PlusPlus => {
                        self.advance();
                        self.expect(&Token::Semi)?;
                        self.code.emit_op(Op::IncIndex);
                        return Ok(());
                    }
                    Token::MinusMinus => {
                        self.advance();
                        self.expect(&Token::Semi)?;
                        self.code.emit_op(Op::DecIndex);
                        return Ok(());
                    }
                    _ => {
                        self.code.emit_op(Op::GetIndex);
                        info = elem;
                    }
                }
            } else {
                break;
            }
        }

        // a bare read used as a statement: evaluate and discard
        self.code.emit_op(Op::Pop);
        self.expect(&Token::Semi)
    }

    fn emit_field_step(&mut self, offset: u8, op: Op) {
        self.code.emit_op(Op::Dup);
        self.code.emit_op(Op::GetField);
        self.code.emit_u8(offset);
        self.code.emit_op(Op::ConstInt);
        self.code.emit_u32(1);
        self.code.emit_op(op);
        self.code.emit_op(Op::SetField);
        self.code.emit_u8(offset);
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    fn expression(&mut self) -> Result<TypeInfo, CompileError> {
        let info = self.rel_expr()?;
        if self.accept(&Token::Question) {
            let span = self.span();
            self.code.emit_op(Op::Jz);
            let else_site = self.code.pos();
            self.code.emit_u32(0);
            let t_true = self.expression()?;
            self.code.emit_op(Op::Jmp);
            let end_site = self.code.pos();
            self.code.emit_u32(0);
            let here = self.code.pos() as u32;
            self.code.patch_u32(else_site, here);
            self.expect(&Token::Colon)?;
            let t_false = self.expression()?;
            let end = self.code.pos() as u32;
            self.code.patch_u32(end_site, end);
            if t_true.ty != t_false.ty {
                return Err(CompileError::type_error(
                    "ternary branches have different types",
                    span,
                ));
            }
            return Ok(t_true);
        }
        Ok(info)
    }

    fn rel_expr(&mut self) -> Result<TypeInfo, CompileError> {
        let lhs = self.add_expr()?;
        let op = match self.kind() {
            Token::Eq
            | Token::NotEq
            | Token::Lt
            | Token::LtEq
            | Token::Gt
            | Token::GtEq => self.kind().clone(),
            _ => return Ok(lhs),
        };
        self.advance();
        let rhs = self.add_expr()?;
        let float = lhs.is_float() || rhs.is_float();
        let code_op = match (&op, float) {
            (Token::Eq, false) => Op::Eq,
            (Token::Eq, true) => Op::EqF,
            (Token::NotEq, false) => Op::Ne,
            (Token::NotEq, true) => Op::NeF,
            (Token::Lt, false) => Op::Lt,
            (Token::Lt, true) => Op::LtF,
            (Token::LtEq, false) => Op::Le,
            (Token::LtEq, true) => Op::LeF,
            (Token::Gt, false) => Op::Gt,
            (Token::Gt, true) => Op::GtF,
            (Token::GtEq, false) => Op::Ge,
            _ => Op::GeF,
        };
        self.code.emit_op(code_op);
        Ok(TypeInfo::scalar(DataType::Int))
    }

    fn add_expr(&mut self) -> Result<TypeInfo, CompileError> {
        let mut lhs = self.term()?;
        loop {
            let plus = match self.kind() {
                Token::Plus => true,
                Token::Minus => false,
                _ => break,
            };
            self.advance();
            let rhs = self.term()?;
            lhs = if plus {
                self.emit_arith(Op::Add, Op::AddF, lhs, rhs)
            } else {
                self.emit_arith(Op::Sub, Op::SubF, lhs, rhs)
            };
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<TypeInfo, CompileError> {
        let mut lhs = self.factor()?;
        loop {
            let op = match self.kind() {
                Token::Star | Token::Slash | Token::Percent => self.kind().clone(),
                _ => break,
            };
            let span = self.span();
            self.advance();
            let rhs = self.factor()?;
            lhs = match op {
                Token::Percent => {
                    // modulo is integer-only
                    if lhs.is_float() || rhs.is_float() {
                        return Err(CompileError::type_error(
                            "modulo requires integer operands",
                            span,
                        ));
                    }
                    self.code.emit_op(Op::Mod);
                    lhs
                }
                Token::Star => self.emit_arith(Op::Mul, Op::MulF, lhs, rhs),
                _ => self.emit_arith(Op::Div, Op::DivF, lhs, rhs),
            };
        }
        Ok(lhs)
    }

    fn factor(&mut self) -> Result<TypeInfo, CompileError> {
        let span = self.span();
        match self.kind().clone() {
            Token::Minus => {
                self.advance();
                let info = self.factor()?;
                match info.ty {
                    DataType::Int | DataType::Char => self.code.emit_op(Op::Neg),
                    DataType::Float => self.code.emit_op(Op::NegF),
                    _ => {
                        return Err(CompileError::type_error("cannot negate this value", span));
                    }
                }
                Ok(info)
            }
            Token::Int(v) => {
                self.advance();
                if v > i32::MAX as i64 {
                    return Err(CompileError::structural(
                        "integer literal out of range",
                        span,
                    ));
                }
                self.code.emit_op(Op::ConstInt);
                self.code.emit_u32(v as u32);
                Ok(TypeInfo::scalar(DataType::Int))
            }
            Token::Float(v) => {
                self.advance();
                self.code.emit_op(Op::ConstFloat);
                self.code.emit_u64(v.to_bits());
                Ok(TypeInfo::scalar(DataType::Float))
            }
            Token::Str(s) => {
                self.advance();
                let idx = self.add_str(&s);
                self.code.emit_op(Op::ConstStr);
                self.code.emit_u32(idx);
                Ok(TypeInfo::scalar(DataType::Str))
            }
            Token::Stack => {
                self.advance();
                self.expect(&Token::LParen)?;
                let info = self.parse_type()?;
                self.expect(&Token::RParen)?;
                let sid = match (info.ty, info.struct_id) {
                    (DataType::Struct, Some(sid)) => sid,
                    _ => {
                        return Err(CompileError::type_error(
                            "stack() expects a struct type",
                            span,
                        ));
                    }
                };
                self.code.emit_op(Op::AllocStack);
                self.code.emit_u32(sid);
                Ok(TypeInfo::of_struct(sid))
            }
            Token::New => {
                self.advance();
                self.expect(&Token::LParen)?;
                let info = self.parse_type()?;
                if self.accept(&Token::Comma) {
                    let count = self.expression()?;
                    if count.ty != DataType::Int {
                        return Err(CompileError::type_error(
                            "array size must be an integer",
                            span,
                        ));
                    }
                    self.expect(&Token::RParen)?;
                    self.code.emit_op(Op::AllocArray);
                    self.code.emit_u32(CELL_BYTES);
                    return Ok(TypeInfo {
                        ty: DataType::Array,
                        struct_id: info.struct_id,
                        array_depth: info.array_depth + 1,
                    });
                }
                self.expect(&Token::RParen)?;
                let sid = match (info.ty, info.struct_id) {
                    (DataType::Struct, Some(sid)) => sid,
                    _ => {
                        return Err(CompileError::type_error(
                            "new() expects a struct type, or an element type and a count",
                            span,
                        ));
                    }
                };
                self.code.emit_op(Op::AllocStruct);
                self.code.emit_u32(sid);
                Ok(TypeInfo::of_struct(sid))
            }
            Token::LParen => {
                self.advance();
                let info = self.expression()?;
                self.expect(&Token::RParen)?;
                Ok(info)
            }
            Token::Ident(_) => self.factor_ident(),
            tok => Err(CompileError::syntax(
                format!("unexpected token '{}'", tok),
                span,
            )),
        }
    }

    /// Identifier in expression position: a variable (with an optional
    /// read-only field/index chain) or a call. Assignment is statement
    /// syntax, so every path here pushes exactly one value.
    fn factor_ident(&mut self) -> Result<TypeInfo, CompileError> {
        let span = self.span();
        let mut name = self.take_ident()?;
        let mut var = self.resolve_var(&name);

        if var.is_none() {
            while self.accept(&Token::Dot) {
                name.push('.');
                name.push_str(&self.take_ident()?);
            }
            var = self.resolve_var(&name);
        }

        if self.accept(&Token::LParen) {
            if let Some(native_fn) = native::lookup(&name).copied() {
                self.compile_native_args(&native_fn, span)?;
                self.code.emit_op(Op::Native);
                self.code.emit_u32(native_fn.id);
                return Ok(TypeInfo::scalar(native_fn.ret));
            }
            let fid = self.compile_user_call(&name, span)?;
            let rets = &self.syms.funcs[fid].rets;
            if rets.len() != 1 {
                return Err(CompileError::structural(
                    format!(
                        "function '{}' returns {} values and cannot be used in an expression",
                        name,
                        rets.len()
                    ),
                    span,
                ));
            }
            return Ok(rets[0]);
        }

        let var = var.ok_or_else(|| CompileError::undefined("variable", &name, span))?;
        self.emit_get_var(&var);
        let mut info = var.info;

        loop {
            if self.accept(&Token::Dot) {
                let (field_info, offset) = self.resolve_field(info)?;
                self.code.emit_op(Op::GetField);
                self.code.emit_u8(offset);
                info = field_info;
            } else if self.accept(&Token::LBracket) {
                if info.ty != DataType::Array {
                    return Err(CompileError::type_error(
                        "cannot index a non-array value",
                        span,
                    ));
                }
                self.expression()?;
                self.expect(&Token::RBracket)?;
                self.code.emit_op(Op::GetIndex);
                info = info.indexed();
            } else {
                break;
            }
        }
        Ok(info)
    }

    // =========================================================================
    // Calls and shared emission helpers
    // =========================================================================

    /// Compile the argument list and the call instruction for a user
    /// function; the cursor is just past '('. Returns the function id.
    fn compile_user_call(&mut self, name: &str, span: Span) -> Result<usize, CompileError> {
        let fid = self
            .syms
            .find_func(name)
            .ok_or_else(|| CompileError::undefined("function", name, span))?;
        let mut args = 0usize;
        if *self.kind() != Token::RParen {
            loop {
                self.expression()?;
                args += 1;
                if !self.accept(&Token::Comma) {
                    break;
                }
            }
        }
        self.expect(&Token::RParen)?;
        let expected = self.syms.funcs[fid].arg_count as usize;
        if args != expected {
            return Err(CompileError::structural(
                format!(
                    "argument count mismatch: '{}' takes {}, got {}",
                    name, expected, args
                ),
                span,
            ));
        }
        self.emit_call(fid, args as u8);
        Ok(fid)
    }

    fn compile_native_args(
        &mut self,
        native_fn: &native::NativeFn,
        span: Span,
    ) -> Result<(), CompileError> {
        let mut args = 0usize;
        if *self.kind() != Token::RParen {
            loop {
                self.expression()?;
                args += 1;
                if !self.accept(&Token::Comma) {
                    break;
                }
            }
        }
        self.expect(&Token::RParen)?;
        if args != native_fn.arity as usize {
            return Err(CompileError::structural(
                format!(
                    "'{}' takes {} argument(s), got {}",
                    native_fn.name, native_fn.arity, args
                ),
                span,
            ));
        }
        Ok(())
    }

    /// Compile the `f(...)` right-hand side of a tuple assignment and
    /// check the declared return count against the target count.
    fn compile_unpack_call(&mut self, targets: usize) -> Result<(), CompileError> {
        let span = self.span();
        if !matches!(self.kind(), Token::Ident(_)) {
            return Err(CompileError::syntax(
                "expected a function call on the right of a tuple assignment",
                span,
            ));
        }
        let name = self.take_dotted_name()?;
        self.expect(&Token::LParen)?;
        let fid = self.compile_user_call(&name, span)?;
        let ret_count = self.syms.funcs[fid].rets.len();
        if ret_count != targets {
            return Err(CompileError::structural(
                format!(
                    "'{}' returns {} value(s) but {} target(s) are assigned",
                    name, ret_count, targets
                ),
                span,
            ));
        }
        Ok(())
    }

    fn emit_call(&mut self, fid: usize, argc: u8) {
        self.code.emit_op(Op::Call);
        let site = self.code.pos();
        self.code.emit_u32(0);
        self.call_fixups.push((site, fid));
        self.code.emit_u8(argc);
    }

    /// Pick the integer or floating-point variant: float wins.
    fn emit_arith(&mut self, int_op: Op, float_op: Op, lhs: TypeInfo, rhs: TypeInfo) -> TypeInfo {
        if lhs.is_float() || rhs.is_float() {
            self.code.emit_op(float_op);
            TypeInfo::scalar(DataType::Float)
        } else {
            self.code.emit_op(int_op);
            lhs
        }
    }

    fn resolve_var(&self, name: &str) -> Option<VarRef> {
        if let Some(i) = self.syms.find_local(name) {
            let s = &self.syms.locals[i];
            return Some(VarRef {
                slot: s.slot,
                is_local: true,
                info: s.info,
            });
        }
        if let Some(i) = self.syms.find_global(name) {
            let s = &self.syms.globals[i];
            return Some(VarRef {
                slot: s.slot,
                is_local: false,
                info: s.info,
            });
        }
        None
    }

    fn emit_get_var(&mut self, var: &VarRef) {
        self.code.emit_op(if var.is_local {
            Op::GetLocal
        } else {
            Op::GetGlobal
        });
        self.code.emit_u8(var.slot);
    }

    fn emit_set_var(&mut self, var: &VarRef) {
        self.code.emit_op(if var.is_local {
            Op::SetLocal
        } else {
            Op::SetGlobal
        });
        self.code.emit_u8(var.slot);
    }

    /// Resolve `.name` after a struct-typed value; the cursor is on the
    /// field name. Returns the field's type and slot offset.
    fn resolve_field(&mut self, info: TypeInfo) -> Result<(TypeInfo, u8), CompileError> {
        let span = self.span();
        let sid = match (info.ty, info.struct_id) {
            (DataType::Struct, Some(sid)) => sid,
            _ => {
                return Err(CompileError::type_error(
                    "field access on a non-struct value",
                    span,
                ));
            }
        };
        let name = self.take_ident()?;
        let st = &self.syms.structs[sid as usize];
        match st.field(&name) {
            Some(f) => Ok((f.info, f.offset)),
            None => Err(CompileError::undefined(
                "field",
                format!("{}.{}", st.name, name),
                span,
            )),
        }
    }

    fn declare_local(&mut self, name: String, info: TypeInfo) -> Result<u8, CompileError> {
        if self.syms.local_count() >= MAX_LOCALS {
            return Err(CompileError::structural(
                format!("too many local variables (max {})", MAX_LOCALS),
                self.span(),
            ));
        }
        Ok(self.syms.add_local(name, info))
    }

    fn declare_global(&mut self, name: String, info: TypeInfo) -> Result<u8, CompileError> {
        let span = self.span();
        if self.syms.find_global(&name).is_some() {
            return Err(CompileError::structural(
                format!("duplicate global '{}'", name),
                span,
            ));
        }
        if self.syms.globals.len() >= MAX_GLOBALS {
            return Err(CompileError::structural(
                format!("too many global variables (max {})", MAX_GLOBALS),
                span,
            ));
        }
        Ok(self.syms.add_global(name, info))
    }

    fn add_str(&mut self, s: &str) -> u32 {
        if let Some(i) = self.strings.iter().position(|x| x == s) {
            return i as u32;
        }
        self.strings.push(s.to_string());
        (self.strings.len() - 1) as u32
    }

    fn finish(mut self) -> Result<Compiled, CompileError> {
        for (site, fid) in &self.call_fixups {
            let addr = self.syms.funcs[*fid].addr;
            self.code.patch_u32(*site, addr);
        }

        let structs = self
            .syms
            .structs
            .iter()
            .map(|s| StructMeta {
                name: s.name.clone(),
                slots: s.slot_count(),
            })
            .collect();
        let functions = self
            .syms
            .funcs
            .iter()
            .map(|f| FuncDebug {
                name: f.name.clone(),
                addr: f.addr,
                arg_count: f.arg_count,
                ret_count: f.rets.len() as u8,
            })
            .collect();
        let globals = self.syms.globals.iter().map(|g| g.name.clone()).collect();

        Ok(Compiled {
            module: Module {
                strings: self.strings,
                structs,
                code: self.code.into_bytes(),
            },
            debug: DebugInfo { functions, globals },
        })
    }
}
