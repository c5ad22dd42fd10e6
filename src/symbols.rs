//! Symbol tables for the code generator: global variables, function-local
//! variables, struct layouts and function signatures. Pure bookkeeping;
//! lookup is linear by name, locals are scanned newest-first so inner
//! declarations shadow outer ones.

/// Static type of an expression or symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Void,
    Int,
    Float,
    Char,
    Str,
    Struct,
    Array,
}

/// Full static type of a value: base type plus the struct id (for
/// struct / array-of-struct) and the array nesting depth.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TypeInfo {
    pub ty: DataType,
    pub struct_id: Option<u32>,
    pub array_depth: u8,
}

impl TypeInfo {
    pub const VOID: TypeInfo = TypeInfo {
        ty: DataType::Void,
        struct_id: None,
        array_depth: 0,
    };

    pub fn scalar(ty: DataType) -> Self {
        TypeInfo {
            ty,
            struct_id: None,
            array_depth: 0,
        }
    }

    pub fn of_struct(struct_id: u32) -> Self {
        TypeInfo {
            ty: DataType::Struct,
            struct_id: Some(struct_id),
            array_depth: 0,
        }
    }

    pub fn is_float(&self) -> bool {
        self.ty == DataType::Float
    }

    /// The type obtained by indexing one level into this array type.
    /// Element types below the last level collapse to the struct the
    /// array carries, or to integer cells otherwise.
    pub fn indexed(&self) -> TypeInfo {
        if self.array_depth > 1 {
            TypeInfo {
                ty: DataType::Array,
                struct_id: self.struct_id,
                array_depth: self.array_depth - 1,
            }
        } else if let Some(sid) = self.struct_id {
            TypeInfo::of_struct(sid)
        } else {
            TypeInfo::scalar(DataType::Int)
        }
    }
}

/// A named variable: a global (slot = table index) or a local
/// (slot = stack offset relative to the frame pointer).
#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub info: TypeInfo,
    pub slot: u8,
}

#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub info: TypeInfo,
    pub offset: u8,
}

/// Struct layout: one 64-bit slot per field, offsets in declaration
/// order. Immutable once its declaration has been compiled.
#[derive(Debug, Clone)]
pub struct StructInfo {
    pub name: String,
    pub fields: Vec<Field>,
}

impl StructInfo {
    pub fn slot_count(&self) -> u32 {
        self.fields.len() as u32
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Function signature plus entry address. Signatures are registered
/// before any body is compiled; `addr` stays `UNRESOLVED` until the
/// definition is reached.
#[derive(Debug, Clone)]
pub struct FuncInfo {
    pub name: String,
    pub addr: u32,
    pub arg_count: u8,
    pub rets: Vec<TypeInfo>,
}

impl FuncInfo {
    pub const UNRESOLVED: u32 = u32::MAX;
}

#[derive(Debug, Default)]
pub struct SymbolTable {
    pub globals: Vec<Symbol>,
    pub locals: Vec<Symbol>,
    pub structs: Vec<StructInfo>,
    pub funcs: Vec<FuncInfo>,
}

impl SymbolTable {
    pub fn new() -> Self {
        SymbolTable::default()
    }

    pub fn find_local(&self, name: &str) -> Option<usize> {
        self.locals.iter().rposition(|s| s.name == name)
    }

    pub fn find_global(&self, name: &str) -> Option<usize> {
        self.globals.iter().position(|s| s.name == name)
    }

    pub fn find_struct(&self, name: &str) -> Option<u32> {
        self.structs
            .iter()
            .position(|s| s.name == name)
            .map(|i| i as u32)
    }

    pub fn find_func(&self, name: &str) -> Option<usize> {
        self.funcs.iter().position(|f| f.name == name)
    }

    /// Declare a local in the next stack slot. Caller checks the slot
    /// budget (offsets are one byte wide).
    pub fn add_local(&mut self, name: String, info: TypeInfo) -> u8 {
        let slot = self.locals.len() as u8;
        self.locals.push(Symbol { name, info, slot });
        slot
    }

    pub fn add_global(&mut self, name: String, info: TypeInfo) -> u8 {
        let slot = self.globals.len() as u8;
        self.globals.push(Symbol { name, info, slot });
        slot
    }

    pub fn add_struct(&mut self, name: String) -> u32 {
        let sid = self.structs.len() as u32;
        self.structs.push(StructInfo {
            name,
            fields: Vec::new(),
        });
        sid
    }

    pub fn add_func(&mut self, name: String, arg_count: u8, rets: Vec<TypeInfo>) -> usize {
        self.funcs.push(FuncInfo {
            name,
            addr: FuncInfo::UNRESOLVED,
            arg_count,
            rets,
        });
        self.funcs.len() - 1
    }

    pub fn local_count(&self) -> usize {
        self.locals.len()
    }

    /// Drop the locals declared past `count` (block exit).
    pub fn truncate_locals(&mut self, count: usize) {
        self.locals.truncate(count);
    }
}
