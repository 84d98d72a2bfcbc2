//! The staged bootstrap protocol.
//!
//! Stage 0 recovers the embedded filesystem from the scanned document and
//! finds the boot module. Stage 1 resolves external references and locates
//! the stage-2 payload. Stage 2 evaluates the configuration program, binds
//! descriptors and runs init. Everything that would suspend on the browser
//! (compiling, fetching, starting) is a method on [`BootHost`], so the
//! protocol itself stays synchronous and testable.

pub mod stage0;
pub mod stage1;
pub mod stage2;

use thiserror::Error;

use crate::escape::EscapeError;
use crate::section::SectionError;
use crate::tar::TarHeader;
use crate::vfs::{RootFs, VfsError};

/// A user program that throws this exact string has exited cleanly.
pub const EXIT_SENTINEL: &str = "exit with exit code 0";

/// Path of the boot module inside the embedded filesystem.
pub const BOOT_MODULE: &str = "boot/wah-init.wasm";

/// Path of the inner init binary run against the shim.
pub const BOOT_INIT: &str = "boot/init";

/// Module invoked at the end of stage 2 with the full configuration.
pub const INIT_MODULE: &str = "init.mjs";

#[derive(Debug, Error)]
pub enum BootError {
    #[error("file `{name}` declares {declared} bytes but decodes to {actual}")]
    BadFile {
        name: String,
        declared: u64,
        actual: u64,
    },

    #[error("no boot executable in the embedded filesystem")]
    NoBootExecutable,

    #[error("boot module carries no loader section")]
    MissingStage1,

    #[error("no init module in the filesystem")]
    NoInitModule,

    #[error("user program crashed: {0}")]
    UserProgramCrash(String),

    #[error("fetching `{url}` failed: {reason}")]
    Fetch { url: String, reason: String },

    #[error("module compilation failed: {0}")]
    Compile(String),

    #[error(transparent)]
    Section(#[from] SectionError),

    #[error(transparent)]
    Escape(#[from] EscapeError),

    #[error(transparent)]
    Vfs(#[from] VfsError),
}

/// One element scraped from the loaded document: the attributes and text
/// content of a `wah_polyglot_data` template.
#[derive(Debug, Clone)]
pub struct ScannedElement {
    /// `data-wahtml_id`: the file name.
    pub id: String,
    /// `data-b`: the header bytes past the name field.
    pub header_tail: String,
    /// Text content: the base64 payload.
    pub text: String,
}

/// A decoded file entry on its way into the filesystem.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub header: TarHeader,
    pub name: String,
    pub data: EntryData,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntryData {
    Inline(Vec<u8>),
    External { url: String, realsize: u64 },
}

/// The boot path's suspension points. Compiling, fetching and starting all
/// go through the host; the stages never block on their own.
pub trait BootHost {
    /// Opaque handle to a compiled module.
    type Module;

    fn compile(&mut self, wasm: &[u8]) -> Result<Self::Module, BootError>;

    fn fetch(&mut self, url: &str) -> Result<Vec<u8>, BootError>;

    /// Instantiate and run the inner init module against the shim
    /// configuration. An `Err` carries the settled message; the exit
    /// sentinel is handled by the caller.
    fn start(
        &mut self,
        module: &Self::Module,
        config: &crate::config::Configuration,
        fs: &mut RootFs,
    ) -> Result<(), String>;

    /// Load `init.mjs` from its source bytes and call it with the full
    /// configuration. Hosts hand their message port and fallback shell to
    /// the module alongside.
    fn invoke_init(
        &mut self,
        source: &[u8],
        config: &crate::config::Configuration,
    ) -> Result<(), String>;
}
