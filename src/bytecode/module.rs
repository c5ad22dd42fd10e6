use serde::{Deserialize, Serialize};
use std::path::Path;

/// Module file identification tag, first seven bytes of every `.cnb`.
pub const MAGIC: &[u8; 7] = b"CINDERB";

/// Current module format version. Bumped on any layout change; a
/// mismatch is a hard incompatibility, never reinterpreted.
pub const VERSION: u8 = 1;

/// Struct metadata carried alongside the instruction stream: the
/// execution engine only needs the slot count to size allocations.
#[derive(Debug, Clone, PartialEq)]
pub struct StructMeta {
    pub name: String,
    pub slots: u32,
}

/// A compiled module: string-constant pool, struct size table and the
/// raw instruction stream. This is the unit the compiler produces and
/// the execution engine consumes.
#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    pub strings: Vec<String>,
    pub structs: Vec<StructMeta>,
    pub code: Vec<u8>,
}

#[derive(Debug)]
pub enum ModuleError {
    Io { path: String, message: String },
    BadMagic,
    UnsupportedVersion { found: u8 },
    Truncated { reading: &'static str },
    BadString,
    Oversized { what: &'static str },
}

impl std::fmt::Display for ModuleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModuleError::Io { path, message } => {
                write!(f, "module error: cannot access '{}': {}", path, message)
            }
            ModuleError::BadMagic => {
                write!(f, "module error: not a cinder module (bad magic)")
            }
            ModuleError::UnsupportedVersion { found } => {
                write!(
                    f,
                    "module error: format version {} is not supported (engine speaks {})",
                    found, VERSION
                )
            }
            ModuleError::Truncated { reading } => {
                write!(f, "module error: file truncated while reading {}", reading)
            }
            ModuleError::BadString => {
                write!(f, "module error: string pool entry is not valid UTF-8")
            }
            ModuleError::Oversized { what } => {
                write!(f, "module error: {} exceeds the format limit", what)
            }
        }
    }
}

impl std::error::Error for ModuleError {}

/// Cursor over the raw module bytes; every read is bounds-checked.
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize, reading: &'static str) -> Result<&'a [u8], ModuleError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or(ModuleError::Truncated { reading })?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn take_u8(&mut self, reading: &'static str) -> Result<u8, ModuleError> {
        Ok(self.take(1, reading)?[0])
    }

    fn take_u32(&mut self, reading: &'static str) -> Result<u32, ModuleError> {
        let bytes = self.take(4, reading)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn take_string(&mut self, reading: &'static str) -> Result<String, ModuleError> {
        let len = self.take_u32(reading)? as usize;
        let bytes = self.take(len, reading)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ModuleError::BadString)
    }
}

impl Module {
    /// Serialize to the external byte layout: magic, version byte,
    /// string pool, struct table, code length, code bytes. All
    /// multi-byte integers little-endian.
    pub fn encode(&self) -> Result<Vec<u8>, ModuleError> {
        if self.code.len() > u32::MAX as usize {
            return Err(ModuleError::Oversized {
                what: "instruction stream",
            });
        }

        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        out.push(VERSION);

        out.extend_from_slice(&(self.strings.len() as u32).to_le_bytes());
        for s in &self.strings {
            out.extend_from_slice(&(s.len() as u32).to_le_bytes());
            out.extend_from_slice(s.as_bytes());
        }

        out.extend_from_slice(&(self.structs.len() as u32).to_le_bytes());
        for meta in &self.structs {
            out.extend_from_slice(&(meta.name.len() as u32).to_le_bytes());
            out.extend_from_slice(meta.name.as_bytes());
            out.extend_from_slice(&meta.slots.to_le_bytes());
        }

        out.extend_from_slice(&(self.code.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.code);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Module, ModuleError> {
        let mut r = Reader { bytes, pos: 0 };

        if r.take(7, "magic")? != MAGIC {
            return Err(ModuleError::BadMagic);
        }
        let version = r.take_u8("version")?;
        if version != VERSION {
            return Err(ModuleError::UnsupportedVersion { found: version });
        }

        let str_count = r.take_u32("string pool")?;
        let mut strings = Vec::with_capacity(str_count.min(1024) as usize);
        for _ in 0..str_count {
            strings.push(r.take_string("string pool")?);
        }

        let struct_count = r.take_u32("struct table")?;
        let mut structs = Vec::with_capacity(struct_count.min(1024) as usize);
        for _ in 0..struct_count {
            let name = r.take_string("struct table")?;
            let slots = r.take_u32("struct table")?;
            structs.push(StructMeta { name, slots });
        }

        let code_len = r.take_u32("code length")? as usize;
        let code = r.take(code_len, "code")?.to_vec();

        Ok(Module {
            strings,
            structs,
            code,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ModuleError> {
        let bytes = self.encode()?;
        std::fs::write(path, bytes).map_err(|e| ModuleError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    pub fn load(path: &Path) -> Result<Module, ModuleError> {
        let bytes = std::fs::read(path).map_err(|e| ModuleError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Module::decode(&bytes)
    }
}

// =============================================================================
// Debug-info sidecar
// =============================================================================

/// Per-function debug record: enough to label entry points and call
/// targets in disassembly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FuncDebug {
    pub name: String,
    pub addr: u32,
    pub arg_count: u8,
    pub ret_count: u8,
}

/// Optional symbol information written next to a module (`.dbg`).
/// Never required to run; the disassembler uses it opportunistically.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DebugInfo {
    pub functions: Vec<FuncDebug>,
    pub globals: Vec<String>,
}

impl DebugInfo {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ModuleError> {
        postcard::to_allocvec(self).map_err(|_| ModuleError::Oversized { what: "debug info" })
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<DebugInfo> {
        postcard::from_bytes(bytes).ok()
    }

    pub fn function_at(&self, addr: u32) -> Option<&FuncDebug> {
        self.functions.iter().find(|f| f.addr == addr)
    }
}
