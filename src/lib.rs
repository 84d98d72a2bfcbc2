//! wah: one file, three parsers.
//!
//! Builds a single artifact that is simultaneously a WebAssembly module,
//! an HTML document and a pax tar archive, and implements the staged
//! bootstrap protocol that artifact targets.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 wah document                 │
//! │                                              │
//! │  base64   - byte-exact payload transport     │
//! │  tar      - pax header model                 │
//! │  escape   - HTML/tar interleave engine       │
//! │  section  - wasm custom-section plumbing     │
//! │  config   - configuration bytecode           │
//! │  vfs      - in-memory root filesystem        │
//! │  boot     - stage 0/1/2 protocol             │
//! │  bridge   - kernel/firmware message channel  │
//! │  packer   - artifact assembly/disassembly    │
//! ├──────────────────────────────────────────────┤
//! │   browser page (firmware) │ sandbox (kernel) │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Build-time flow: sources -> config assembler -> custom sections ->
//! tar/HTML/base64 wrapping -> one polyglot artifact. Load-time flow:
//! stage 0 recovers the filesystem from the document, stage 1 resolves
//! external references, stage 2 evaluates the configuration and starts
//! init, and the bridge relays between the sandbox and the page from
//! then on.

pub mod base64;
pub mod boot;
pub mod bridge;
pub mod config;
pub mod escape;
pub mod packer;
pub mod project;
pub mod section;
pub mod tar;
pub mod vfs;

pub use boot::{BootError, BootHost, ScannedElement, EXIT_SENTINEL};
pub use bridge::{BridgeError, Firmware, Kernel, Message};
pub use config::{Assembler, CfgValue, ConfigError, Configuration, Evaluator, Program};
pub use escape::{EscapeEngine, EscapeError, EscapeUnpacker};
pub use packer::{build, unbuild, BuildSpec, PackError, PackFile};
pub use section::SectionError;
pub use tar::{TarError, TarHeader};
pub use vfs::{RootFs, VfsError};
