//! Assembling configuration programs.
//!
//! The builder mirrors the evaluator: each method appends one instruction
//! and returns the operand slot its result will occupy at run time, so
//! later instructions can reference earlier results by slot.

use super::{Opcode, Program, RESERVED_OPS};

pub struct Assembler {
    words: Vec<u32>,
    data: Vec<u8>,
    next_slot: u32,
}

impl Assembler {
    pub fn new() -> Self {
        Assembler {
            words: Vec::new(),
            data: Vec::new(),
            next_slot: RESERVED_OPS as u32,
        }
    }

    fn emit(&mut self, op: Opcode, args: &[u32]) -> u32 {
        self.words.push(op as u32);
        self.words.push(args.len() as u32);
        self.words.extend_from_slice(args);
        let slot = self.next_slot;
        self.next_slot += 1;
        slot
    }

    fn pool(&mut self, bytes: &[u8]) -> (u32, u32) {
        let ptr = self.data.len() as u32;
        self.data.extend_from_slice(bytes);
        (ptr, bytes.len() as u32)
    }

    pub fn skip(&mut self, words: u32) -> u32 {
        self.emit(Opcode::Skip, &[words])
    }

    pub fn string(&mut self, text: &str) -> u32 {
        let (ptr, len) = self.pool(text.as_bytes());
        self.emit(Opcode::String, &[ptr, len])
    }

    pub fn json(&mut self, value: &serde_json::Value) -> u32 {
        let encoded = value.to_string();
        let (ptr, len) = self.pool(encoded.as_bytes());
        self.emit(Opcode::Json, &[ptr, len])
    }

    pub fn constant(&mut self, value: u32) -> u32 {
        self.emit(Opcode::Const, &[value])
    }

    pub fn array(&mut self, bytes: &[u8]) -> u32 {
        let (ptr, len) = self.pool(bytes);
        self.emit(Opcode::Array, &[ptr, len])
    }

    pub fn get(&mut self, from: u32, idx: u32) -> u32 {
        self.emit(Opcode::Get, &[from, idx])
    }

    pub fn set(&mut self, into: u32, idx: u32, what: u32) -> u32 {
        self.emit(Opcode::Set, &[into, idx, what])
    }

    pub fn file(&mut self, what: u32) -> u32 {
        self.emit(Opcode::File, &[what])
    }

    pub fn directory(&mut self, what: u32) -> u32 {
        self.emit(Opcode::Directory, &[what])
    }

    pub fn preopen_directory(&mut self, where_: u32, what: u32) -> u32 {
        self.emit(Opcode::PreopenDirectory, &[where_, what])
    }

    pub fn path_open(&mut self, dir: u32, flags: u32, path: u32, oflags: u32) -> u32 {
        self.emit(Opcode::PathOpen, &[dir, flags, path, oflags])
    }

    pub fn open_file(&mut self, what: u32) -> u32 {
        self.emit(Opcode::OpenFile, &[what])
    }

    pub fn section(&mut self, what: u32) -> u32 {
        self.emit(Opcode::Section, &[what])
    }

    pub fn noop(&mut self) -> u32 {
        self.emit(Opcode::Noop, &[])
    }

    pub fn function(&mut self, what: u32) -> u32 {
        self.emit(Opcode::Function, &[what])
    }

    /// `configuration[key] = slot`.
    pub fn set_config_key(&mut self, key: &str, value: u32) -> u32 {
        let key = self.string(key);
        self.set(super::OP_CONFIGURATION as u32, key, value)
    }

    pub fn finish(self) -> Program {
        Program {
            words: self.words,
            data: self.data,
        }
    }

    /// The standard program the packer emits: argv and environment as JSON
    /// assignments onto the configuration object. Descriptor defaults are
    /// the sandbox's job, so a minimal program stays minimal.
    pub fn standard(args: &[String], env: &[String]) -> Program {
        let mut this = Assembler::new();

        let argv = this.json(&serde_json::json!(args));
        this.set_config_key("args", argv);

        let environ = this.json(&serde_json::json!(env));
        this.set_config_key("env", environ);

        this.finish()
    }
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}
