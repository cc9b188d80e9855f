// SPDX-License-Identifier: GPL-3.0-only

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use vdisk_contracts::{CommandError, CommandRunner, FormatUtility};
use vdisk_types::{CapturedOutput, ExitResult, FormatOptions, FormatTarget};

#[derive(Debug, Clone)]
enum Behavior {
    Exit(i32),
    TimedOut,
    SpawnFailure(String),
}

impl Behavior {
    fn outcome(&self, command: &str) -> Result<ExitResult, CommandError> {
        match self {
            Behavior::Exit(code) => Ok(ExitResult::new(*code)),
            Behavior::TimedOut => Err(CommandError::TimedOut {
                command: command.to_string(),
                timeout: Duration::from_secs(1),
            }),
            Behavior::SpawnFailure(reason) => Err(CommandError::Spawn {
                command: command.to_string(),
                reason: reason.clone(),
            }),
        }
    }
}

#[derive(Debug)]
struct FormatterState {
    behavior: Behavior,
    calls: Vec<(FormatTarget, FormatOptions)>,
}

/// Formatting utility that answers with a scripted outcome
#[derive(Debug)]
pub struct FakeFormatter {
    state: Mutex<FormatterState>,
}

impl FakeFormatter {
    pub fn exiting(code: i32) -> Self {
        Self {
            state: Mutex::new(FormatterState {
                behavior: Behavior::Exit(code),
                calls: Vec::new(),
            }),
        }
    }

    pub fn set_exit(&self, code: i32) {
        self.state.lock().behavior = Behavior::Exit(code);
    }

    pub fn set_timed_out(&self) {
        self.state.lock().behavior = Behavior::TimedOut;
    }

    pub fn set_spawn_failure(&self, reason: &str) {
        self.state.lock().behavior = Behavior::SpawnFailure(reason.to_string());
    }

    pub fn calls(&self) -> Vec<(FormatTarget, FormatOptions)> {
        self.state.lock().calls.clone()
    }

    pub fn last_call(&self) -> Option<(FormatTarget, FormatOptions)> {
        self.state.lock().calls.last().cloned()
    }
}

impl FormatUtility for FakeFormatter {
    fn format(
        &self,
        target: &FormatTarget,
        options: &FormatOptions,
    ) -> Result<ExitResult, CommandError> {
        let mut state = self.state.lock();
        state.calls.push((target.clone(), options.clone()));
        state.behavior.outcome("format")
    }
}

/// One invocation seen by [`ScriptedRunner`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerCall {
    pub command: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

/// Command runner that records invocations and replays queued outputs.
///
/// Once the queue is empty every command exits 0 with no output.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    outputs: Mutex<VecDeque<(i32, String)>>,
    calls: Mutex<Vec<RunnerCall>>,
}

impl ScriptedRunner {
    pub fn with_exits(exits: impl IntoIterator<Item = i32>) -> Self {
        let runner = Self::default();
        for code in exits {
            runner.push(code, "");
        }
        runner
    }

    /// Queue the next command's exit code and stdout.
    pub fn push(&self, code: i32, stdout: &str) {
        self.outputs.lock().push_back((code, stdout.to_string()));
    }

    pub fn calls(&self) -> Vec<RunnerCall> {
        self.calls.lock().clone()
    }

    /// Calls rendered as `command arg arg...`
    pub fn command_lines(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .map(|call| {
                std::iter::once(call.command.as_str())
                    .chain(call.args.iter().map(String::as_str))
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect()
    }
}

impl CommandRunner for ScriptedRunner {
    fn capture(
        &self,
        command: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CapturedOutput, CommandError> {
        self.calls.lock().push(RunnerCall {
            command: command.to_string(),
            args: args.to_vec(),
            timeout,
        });
        let (code, stdout) = self.outputs.lock().pop_front().unwrap_or_default();
        Ok(CapturedOutput {
            command: command.to_string(),
            exit: ExitResult::new(code),
            stdout,
            stderr: String::new(),
        })
    }
}
