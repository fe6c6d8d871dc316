//! OS utility invocation.
//!
//! Every external tool the backend relies on (`losetup`, `blkid`, `mkfs.*`,
//! `mount`, `umount`) goes through a [`CommandExecutor`] so the node logic can
//! be driven by a scripted executor in tests.

use async_trait::async_trait;
use tracing::debug;

use crate::error::CsiError;

/// Result of one utility invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    /// Exit code; `None` when the process was killed by a signal.
    pub code: Option<i32>,
    /// Combined stdout and stderr.
    pub output: String,
}

impl CommandOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            code: Some(0),
            output: output.into(),
        }
    }

    pub fn failed(code: i32, output: impl Into<String>) -> Self {
        Self {
            success: false,
            code: Some(code),
            output: output.into(),
        }
    }

    /// Turn a non-zero exit into [`CsiError::CommandFailed`], keeping the
    /// tool's output verbatim.
    pub fn into_result(self, program: &str, args: &[&str]) -> Result<String, CsiError> {
        if self.success {
            Ok(self.output)
        } else {
            Err(CsiError::CommandFailed {
                command: render(program, args),
                output: self.output.trim().to_owned(),
            })
        }
    }
}

fn render(program: &str, args: &[&str]) -> String {
    std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Runs OS utilities on the local host.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run `program` with `args` and capture its combined output.
    ///
    /// A non-zero exit is not an error at this level; only a failure to spawn
    /// the process is.
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, CsiError>;
}

/// [`CommandExecutor`] backed by `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostExecutor;

#[async_trait]
impl CommandExecutor for HostExecutor {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, CsiError> {
        debug!(command = %render(program, args), "exec");
        let out = tokio::process::Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| CsiError::CommandFailed {
                command: render(program, args),
                output: e.to_string(),
            })?;

        let mut output = String::from_utf8_lossy(&out.stdout).into_owned();
        output.push_str(&String::from_utf8_lossy(&out.stderr));
        Ok(CommandOutput {
            success: out.status.success(),
            code: out.status.code(),
            output,
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted executor used by the node and loop-device tests.

    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    /// Replays queued responses per program and records every invocation.
    #[derive(Default)]
    pub struct ScriptedExecutor {
        responses: Mutex<Vec<(String, VecDeque<CommandOutput>)>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedExecutor {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue a response for the next call of `program`. Programs without
        /// a queued response succeed with empty output.
        pub fn push(&self, program: &str, output: CommandOutput) {
            let mut responses = self.responses.lock().unwrap();
            match responses.iter_mut().find(|(p, _)| p == program) {
                Some((_, queue)) => queue.push_back(output),
                None => responses.push((program.to_owned(), VecDeque::from([output]))),
            }
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        pub fn calls_to(&self, program: &str) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter(|c| c.split_whitespace().next() == Some(program))
                .collect()
        }
    }

    #[async_trait]
    impl CommandExecutor for ScriptedExecutor {
        async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, CsiError> {
            self.calls.lock().unwrap().push(render(program, args));
            let next = self
                .responses
                .lock()
                .unwrap()
                .iter_mut()
                .find(|(p, _)| p == program)
                .and_then(|(_, queue)| queue.pop_front());
            Ok(next.unwrap_or_else(|| CommandOutput::ok("")))
        }
    }
}
