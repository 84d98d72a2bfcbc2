//! Process handles as a settle-once state machine.
//!
//! `pending → exited(status) | crashed(err)`; the exit sentinel string is a
//! normal terminal transition into `exited(0)`, never an error.

use crate::boot::EXIT_SENTINEL;

use super::BridgeError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    Pending,
    Exited {
        status: i32,
        stdout: Option<String>,
        stderr: Option<String>,
    },
    Crashed(String),
}

#[derive(Debug)]
pub struct Process {
    pub fid: u64,
    state: ProcessState,
}

impl Process {
    pub fn new(fid: u64) -> Self {
        Process {
            fid,
            state: ProcessState::Pending,
        }
    }

    pub fn state(&self) -> &ProcessState {
        &self.state
    }

    pub fn is_settled(&self) -> bool {
        !matches!(self.state, ProcessState::Pending)
    }

    /// Settle with a numeric status and captured streams.
    pub fn settle_exit(
        &mut self,
        status: i32,
        stdout: Option<String>,
        stderr: Option<String>,
    ) -> Result<(), BridgeError> {
        self.transition(ProcessState::Exited {
            status,
            stdout,
            stderr,
        })
    }

    /// Settle from a thrown message. The sentinel is a clean exit.
    pub fn settle_message(&mut self, message: &str) -> Result<(), BridgeError> {
        if message == EXIT_SENTINEL {
            self.settle_exit(0, None, None)
        } else {
            self.transition(ProcessState::Crashed(message.to_owned()))
        }
    }

    fn transition(&mut self, terminal: ProcessState) -> Result<(), BridgeError> {
        if self.is_settled() {
            return Err(BridgeError::AlreadyReaped(self.fid));
        }
        self.state = terminal;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settles_exactly_once() {
        let mut process = Process::new(7);
        process.settle_exit(0, Some("out".into()), None).unwrap();
        assert!(matches!(
            process.settle_exit(1, None, None),
            Err(BridgeError::AlreadyReaped(7))
        ));
    }

    #[test]
    fn sentinel_is_a_clean_exit() {
        let mut process = Process::new(1);
        process.settle_message(EXIT_SENTINEL).unwrap();
        assert_eq!(
            process.state(),
            &ProcessState::Exited {
                status: 0,
                stdout: None,
                stderr: None
            }
        );
    }

    #[test]
    fn other_messages_are_crashes() {
        let mut process = Process::new(1);
        process.settle_message("panicked at src/lib.rs").unwrap();
        assert!(matches!(process.state(), ProcessState::Crashed(_)));
    }
}
