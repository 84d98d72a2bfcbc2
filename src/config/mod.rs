//! Configuration bytecode.
//!
//! The `wah_wasi_config` section carries a tiny static-assignment program
//! instead of a scripting host: a stream of 32-bit little-endian words,
//! each instruction `opcode, argc, args…`, evaluated strictly in order
//! against a fixed opcode table. Every instruction pushes exactly one value,
//! so a program that ran to completion has pushed `len(ops) - 256` results
//! past the reserved slots.
//!
//! Section layout: `[word_count: u32][words…][data pool]`, everything
//! little-endian. Pointer operands of `string`, `json` and `array` are byte
//! offsets into the data pool.

mod assembler;
mod eval;

pub use assembler::Assembler;
pub use eval::{Configuration, EvalFailure, Evaluator, FdBinding, Outcome};

use std::collections::BTreeMap;

use thiserror::Error;

use crate::vfs::{FdIndex, NodeIndex};

/// Number of reserved operand slots: configuration, builtins, reserved
/// range, undefined.
pub const RESERVED_OPS: usize = 256;

/// Slot of the configuration object.
pub const OP_CONFIGURATION: usize = 0;

/// Slot holding the canonical undefined value.
pub const OP_UNDEFINED: usize = 255;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown opcode {0}")]
    BadOpcode(u32),

    #[error("opcode {op:?} takes {want} arguments, found {got}")]
    BadArgc { op: Opcode, want: u32, got: u32 },

    #[error("instruction stream ends inside an instruction")]
    TruncatedProgram,

    #[error("data pool reference {ptr}+{len} is out of range")]
    BadDataRef { ptr: u32, len: u32 },

    #[error("operand {0} is not valid UTF-8")]
    BadString(u32),

    #[error("operand {0} is not valid JSON: {1}")]
    BadJson(u32, String),

    #[error("operand slot {0} does not exist")]
    BadSlot(u32),

    #[error("{op:?} expects {expected}, slot holds {found}")]
    TypeMismatch {
        op: Opcode,
        expected: &'static str,
        found: &'static str,
    },

    #[error("cannot index {target} with {index}")]
    BadIndex {
        target: &'static str,
        index: &'static str,
    },

    #[error("filesystem operation failed: {0}")]
    Vfs(#[from] crate::vfs::VfsError),
}

/// The fixed opcode table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Opcode {
    Skip = 1,
    String = 2,
    Json = 3,
    Const = 4,
    Array = 5,
    Get = 6,
    Set = 7,
    File = 8,
    Directory = 9,
    PreopenDirectory = 10,
    PathOpen = 11,
    OpenFile = 12,
    Section = 13,
    Noop = 14,
    Function = 15,
}

impl Opcode {
    pub fn from_word(word: u32) -> Result<Self, ConfigError> {
        Ok(match word {
            1 => Opcode::Skip,
            2 => Opcode::String,
            3 => Opcode::Json,
            4 => Opcode::Const,
            5 => Opcode::Array,
            6 => Opcode::Get,
            7 => Opcode::Set,
            8 => Opcode::File,
            9 => Opcode::Directory,
            10 => Opcode::PreopenDirectory,
            11 => Opcode::PathOpen,
            12 => Opcode::OpenFile,
            13 => Opcode::Section,
            14 => Opcode::Noop,
            15 => Opcode::Function,
            other => return Err(ConfigError::BadOpcode(other)),
        })
    }

    /// Required argument count; `None` means any.
    pub fn argc(self) -> Option<u32> {
        Some(match self {
            Opcode::Skip => 1,
            Opcode::String => 2,
            Opcode::Json => 2,
            Opcode::Const => 1,
            Opcode::Array => 2,
            Opcode::Get => 2,
            Opcode::Set => 3,
            Opcode::File => 1,
            Opcode::Directory => 1,
            Opcode::PreopenDirectory => 2,
            Opcode::PathOpen => 4,
            Opcode::OpenFile => 1,
            Opcode::Section => 1,
            Opcode::Noop => return None,
            Opcode::Function => 1,
        })
    }
}

/// A value in the operand table.
#[derive(Debug, Clone, PartialEq)]
pub enum CfgValue {
    Undefined,
    /// Builtin operation exposed through the reserved slots.
    Builtin(Opcode),
    Int(i64),
    Str(String),
    Json(serde_json::Value),
    /// A view into the program's data pool; no copy is taken.
    Bytes(core::ops::Range<usize>),
    /// Owned bytes produced by operations (section contents).
    Blob(Vec<u8>),
    /// Key-value object; both `noop`'s `{}` and the configuration.
    Object(BTreeMap<String, CfgValue>),
    List(Vec<CfgValue>),
    /// A file node in the evaluator's filesystem arena.
    File(NodeIndex),
    /// A directory node.
    Directory(NodeIndex),
    /// A preopen binding a guest path to a directory.
    Preopen(FdIndex),
    /// An entry in the open-file table.
    OpenFile(FdIndex),
    /// Source text that may become invocable behind the unsafe-exec gate.
    Callable { source: String },
}

impl CfgValue {
    pub fn kind(&self) -> &'static str {
        match self {
            CfgValue::Undefined => "undefined",
            CfgValue::Builtin(_) => "builtin",
            CfgValue::Int(_) => "integer",
            CfgValue::Str(_) => "string",
            CfgValue::Json(_) => "json",
            CfgValue::Bytes(_) => "bytes",
            CfgValue::Blob(_) => "blob",
            CfgValue::Object(_) => "object",
            CfgValue::List(_) => "list",
            CfgValue::File(_) => "file",
            CfgValue::Directory(_) => "directory",
            CfgValue::Preopen(_) => "preopen",
            CfgValue::OpenFile(_) => "open file",
            CfgValue::Callable { .. } => "callable",
        }
    }
}

/// A decoded program: instruction words plus the data pool they index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Program {
    pub words: Vec<u32>,
    pub data: Vec<u8>,
}

impl Program {
    /// The program an absent configuration section stands for: it leaves the
    /// configuration object empty.
    pub fn empty() -> Self {
        Program::default()
    }

    pub fn to_section_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.words.len() * 4 + self.data.len());
        out.extend_from_slice(&(self.words.len() as u32).to_le_bytes());
        for word in &self.words {
            out.extend_from_slice(&word.to_le_bytes());
        }
        out.extend_from_slice(&self.data);
        out
    }

    pub fn from_section_bytes(bytes: &[u8]) -> Result<Self, ConfigError> {
        let count = bytes
            .get(..4)
            .map(|b| u32::from_le_bytes(b.try_into().unwrap()) as usize)
            .ok_or(ConfigError::TruncatedProgram)?;

        let words_end = 4 + count.checked_mul(4).ok_or(ConfigError::TruncatedProgram)?;
        let word_bytes = bytes
            .get(4..words_end)
            .ok_or(ConfigError::TruncatedProgram)?;

        let words = word_bytes
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes(chunk.try_into().unwrap()))
            .collect();

        Ok(Program {
            words,
            data: bytes[words_end..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn section_roundtrip() {
        let program = Program {
            words: vec![4, 1, 42, 14, 0],
            data: b"seed".to_vec(),
        };
        let bytes = program.to_section_bytes();
        assert_eq!(Program::from_section_bytes(&bytes).unwrap(), program);
    }

    #[test]
    fn truncated_section() {
        let program = Program {
            words: vec![4, 1, 42],
            data: Vec::new(),
        };
        let bytes = program.to_section_bytes();
        assert!(matches!(
            Program::from_section_bytes(&bytes[..bytes.len() - 2]),
            Err(ConfigError::TruncatedProgram)
        ));
    }

    #[test]
    fn opcode_table_is_stable() {
        // Wire numbers are part of the format.
        assert_eq!(Opcode::from_word(1).unwrap(), Opcode::Skip);
        assert_eq!(Opcode::from_word(7).unwrap(), Opcode::Set);
        assert_eq!(Opcode::from_word(15).unwrap(), Opcode::Function);
        assert!(Opcode::from_word(16).is_err());
        assert!(Opcode::from_word(0).is_err());
    }
}
