//! The kernel/firmware bridge.
//!
//! Two cooperative executors, one ordered message channel. The kernel runs
//! the sandboxed process and allocates element descriptors; the firmware
//! owns the page and resolves them. Nothing is shared across the channel;
//! buffers and results move by value.

mod descriptor;
mod firmware;
mod kernel;
mod message;
mod process;
mod registry;

pub use descriptor::EdAllocator;
pub use firmware::{Dom, Firmware, Handler, UnsafeExec};
pub use kernel::{Kernel, ProcessSpec};
pub use message::{IoBinding, IoKind, Message, RunLevels, Selector, SelectorKind};
pub use process::{Process, ProcessState};
pub use registry::{ModuleKey, ModuleLoader, ModuleRegistry};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("malformed bridge frame: {0}")]
    BadFrame(String),

    #[error("io binding must have exactly one of file, pipe, null")]
    BadIoBinding,

    #[error("element descriptor space exhausted")]
    OutOfDescriptors,

    #[error("no live element descriptor {0}")]
    UnknownDescriptor(u64),

    #[error("no process with fid {0}")]
    UnknownProcess(u64),

    #[error("process {0} was already reaped")]
    AlreadyReaped(u64),

    #[error("no exec handler named `{0}`")]
    UnknownHandler(String),

    #[error("running source text requires the unsafe-exec capability")]
    UnsafeExecDisabled,

    #[error("peer reported: {0}")]
    Remote(String),

    #[error("module load failed: {0}")]
    LoadFailed(String),
}
