//! Kernel side of the bridge.
//!
//! The kernel allocates element descriptors, queues commands for the
//! firmware and tracks what it is still owed: pending `completed`
//! notifications and unsettled processes. All references are strong and
//! freed explicitly when the answer arrives, so nothing leaks quietly and
//! nothing is collected while an operation is in flight.

use std::collections::{HashMap, VecDeque};

use sha2::{Digest, Sha256};

use super::descriptor::EdAllocator;
use super::message::{IoBinding, IoKind, Message, RunLevels, Selector};
use super::process::{Process, ProcessState};
use super::BridgeError;

/// What a pending `completed` will mean for its descriptor.
enum Pending {
    /// A selection: the descriptor stays bound afterwards.
    Select,
    /// An exec result: the descriptor is one-shot and released on arrival.
    ExecResult,
    /// A module load report.
    ModuleLoad,
}

/// Inputs for spawning a process over the bridge.
pub struct ProcessSpec {
    pub executable: Option<String>,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub stdin: IoBinding,
    pub stdout: IoBinding,
    pub stderr: IoBinding,
}

pub struct Kernel {
    descriptors: EdAllocator,
    pending: HashMap<u64, Pending>,
    processes: HashMap<u64, Process>,
    next_fid: u64,
    pipe_counter: u64,
    outbox: VecDeque<Message>,
}

impl Kernel {
    pub fn new() -> Self {
        Kernel {
            descriptors: EdAllocator::new(),
            pending: HashMap::new(),
            processes: HashMap::new(),
            next_fid: 1,
            pipe_counter: 0,
            outbox: VecDeque::new(),
        }
    }

    /// Messages queued for the firmware, in send order.
    pub fn drain_outbox(&mut self) -> Vec<Message> {
        self.outbox.drain(..).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn ensure_live(&self, ed: u64) -> Result<(), BridgeError> {
        if !self.descriptors.is_live(ed) {
            return Err(BridgeError::UnknownDescriptor(ed));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Element commands
    // ------------------------------------------------------------------

    /// Bind a fresh descriptor to whatever the first matching selector
    /// resolves to.
    pub fn element_select(&mut self, selectors: Vec<Selector>) -> Result<u64, BridgeError> {
        for selector in &selectors {
            selector.kind()?;
        }

        let ed = self.descriptors.allocate()?;
        self.pending.insert(ed, Pending::Select);
        self.outbox.push_back(Message::ElementSelect { ed, selectors });
        Ok(ed)
    }

    pub fn element_insert(&mut self, ed: u64, inner_html: String) -> Result<(), BridgeError> {
        self.ensure_live(ed)?;
        self.outbox.push_back(Message::ElementInsert { ed, inner_html });
        Ok(())
    }

    /// Replacing an element implicitly releases its descriptor.
    pub fn element_replace(&mut self, ed: u64, outer_html: String) -> Result<(), BridgeError> {
        self.ensure_live(ed)?;
        self.outbox.push_back(Message::ElementReplace { ed, outer_html });
        self.descriptors.release(ed)
    }

    /// Invoke a registered handler against the bound element. With
    /// `want_result`, a one-shot result descriptor is allocated and
    /// returned; it is released when `completed` arrives.
    pub fn element_exec(
        &mut self,
        ed: u64,
        handler: &str,
        args: serde_json::Value,
        want_result: bool,
    ) -> Result<Option<u64>, BridgeError> {
        self.ensure_live(ed)?;

        let ret_ed = if want_result {
            let ret = self.descriptors.allocate()?;
            self.pending.insert(ret, Pending::ExecResult);
            Some(ret)
        } else {
            None
        };

        self.outbox.push_back(Message::ElementExec {
            ed,
            handler: Some(handler.to_owned()),
            source: None,
            args,
            ret_ed,
        });
        Ok(ret_ed)
    }

    /// Ship module bytes for the firmware to load and run; reports back on
    /// a fresh descriptor.
    pub fn load_module(
        &mut self,
        body: String,
        kind: Option<String>,
        options: serde_json::Value,
    ) -> Result<u64, BridgeError> {
        let ed = self.descriptors.allocate()?;
        self.pending.insert(ed, Pending::ModuleLoad);
        self.outbox.push_back(Message::Module {
            module: body,
            kind,
            options,
            ed,
        });
        Ok(ed)
    }

    // ------------------------------------------------------------------
    // Processes
    // ------------------------------------------------------------------

    /// Register a process. Pipe bindings are rewritten to anonymous files
    /// before the spec leaves the kernel.
    pub fn create_process(&mut self, spec: ProcessSpec) -> Result<u64, BridgeError> {
        let stdin = self.realise_pipe(spec.stdin)?;
        let stdout = self.realise_pipe(spec.stdout)?;
        let stderr = self.realise_pipe(spec.stderr)?;

        let fid = self.next_fid;
        self.next_fid += 1;
        self.processes.insert(fid, Process::new(fid));

        self.outbox.push_back(Message::CreateProc {
            executable: spec.executable,
            args: spec.args,
            env: spec.env,
            stdin,
            stdout,
            stderr,
            fid,
        });
        Ok(fid)
    }

    /// Settle a process and post its one-shot `reap`.
    pub fn settle_process(
        &mut self,
        fid: u64,
        status: i32,
        stdout: Option<String>,
        stderr: Option<String>,
    ) -> Result<(), BridgeError> {
        let process = self
            .processes
            .get_mut(&fid)
            .ok_or(BridgeError::UnknownProcess(fid))?;
        process.settle_exit(status, stdout.clone(), stderr.clone())?;

        self.outbox.push_back(Message::Reap {
            fid,
            status,
            stdout,
            stderr,
        });
        Ok(())
    }

    /// Settle a process from a thrown message; the exit sentinel becomes
    /// `status = 0`.
    pub fn settle_process_message(&mut self, fid: u64, message: &str) -> Result<(), BridgeError> {
        let process = self
            .processes
            .get_mut(&fid)
            .ok_or(BridgeError::UnknownProcess(fid))?;
        process.settle_message(message)?;

        match process.state().clone() {
            ProcessState::Exited {
                status,
                stdout,
                stderr,
            } => self.outbox.push_back(Message::Reap {
                fid,
                status,
                stdout,
                stderr,
            }),
            ProcessState::Crashed(reason) => {
                // Crashes cross the bridge before any fallback runs.
                self.emit_error(serde_json::json!({ "fid": fid, "crash": reason }));
                self.outbox.push_back(Message::Reap {
                    fid,
                    status: 1,
                    stdout: None,
                    stderr: None,
                });
            }
            ProcessState::Pending => unreachable!("settle_message leaves a terminal state"),
        }
        Ok(())
    }

    pub fn process_state(&self, fid: u64) -> Option<&ProcessState> {
        self.processes.get(&fid).map(Process::state)
    }

    fn realise_pipe(&mut self, binding: IoBinding) -> Result<IoBinding, BridgeError> {
        let is_pipe = matches!(binding.kind()?, IoKind::Pipe(_));
        if !is_pipe {
            return Ok(binding);
        }

        self.pipe_counter += 1;
        let mut hasher = Sha256::new();
        hasher.update(self.pipe_counter.to_le_bytes());
        let digest = hasher.finalize();
        let tag: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
        Ok(IoBinding::file(format!("io-{tag}")))
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Handle a message arriving from the firmware.
    pub fn handle(&mut self, message: Message) -> Result<(), BridgeError> {
        match message {
            Message::Completed { ed, result, error } => self.on_completed(ed, result, error),

            // A spawn request originating on the page: register the handle
            // under the creator's fid and wait for the embedder to settle.
            Message::CreateProc {
                stdin,
                stdout,
                stderr,
                fid,
                ..
            } => {
                stdin.kind()?;
                stdout.kind()?;
                stderr.kind()?;
                if self.processes.contains_key(&fid) {
                    return Err(BridgeError::BadFrame(format!("fid {fid} already pending")));
                }
                self.processes.insert(fid, Process::new(fid));
                self.next_fid = self.next_fid.max(fid + 1);
                Ok(())
            }

            Message::Error(detail) => Err(BridgeError::Remote(detail.to_string())),

            other => Err(BridgeError::BadFrame(format!(
                "kernel cannot handle {}",
                other.to_frame()
            ))),
        }
    }

    fn on_completed(
        &mut self,
        ed: u64,
        _result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<(), BridgeError> {
        let pending = self
            .pending
            .remove(&ed)
            .ok_or(BridgeError::UnknownDescriptor(ed))?;

        match pending {
            Pending::Select => {
                if let Some(reason) = error {
                    // A failed selection never binds; give the value back.
                    self.descriptors.release(ed)?;
                    return Err(BridgeError::Remote(reason));
                }
                Ok(())
            }
            Pending::ExecResult | Pending::ModuleLoad => {
                self.descriptors.release(ed)?;
                match error {
                    Some(reason) => Err(BridgeError::Remote(reason)),
                    None => Ok(()),
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Run levels and faults
    // ------------------------------------------------------------------

    pub fn publish_run_level(&mut self, levels: RunLevels) {
        self.outbox.push_back(Message::RunLevel(levels));
    }

    pub fn emit_error(&mut self, detail: serde_json::Value) {
        self.outbox.push_back(Message::Error(detail));
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}
