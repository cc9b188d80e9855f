// SPDX-License-Identifier: GPL-3.0-only

//! External command execution with a hard timeout
//!
//! Commands are started through duct with captured output and polled until
//! they exit. A command that outlives its timeout is killed and reaped before
//! the error is returned, so no child process or handle outlives the call.

use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use vdisk_contracts::{CommandError, CommandRunner};
use vdisk_types::{CapturedOutput, ExitResult};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

pub fn render(command: &str, args: &[String]) -> String {
    if args.is_empty() {
        command.to_string()
    } else {
        format!("{} {}", command, args.join(" "))
    }
}

/// Runs commands on the host
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommandRunner;

impl SystemCommandRunner {
    pub fn new() -> Self {
        Self
    }
}

impl CommandRunner for SystemCommandRunner {
    fn capture(
        &self,
        command: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CapturedOutput, CommandError> {
        let rendered = render(command, args);
        debug!(command = %rendered, ?timeout, "running external command");

        let handle = duct::cmd(command, args)
            .stdin_null()
            .stdout_capture()
            .stderr_capture()
            .unchecked()
            .start()
            .map_err(|error| CommandError::Spawn {
                command: rendered.clone(),
                reason: error.to_string(),
            })?;

        let deadline = Instant::now() + timeout;
        loop {
            match handle.try_wait() {
                Ok(Some(output)) => {
                    let code = output.status.code().ok_or_else(|| CommandError::Terminated {
                        command: rendered.clone(),
                    })?;
                    debug!(command = %rendered, code, "external command exited");
                    return Ok(CapturedOutput {
                        command: rendered,
                        exit: ExitResult::new(code),
                        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                    });
                }
                Ok(None) => {}
                Err(error) => {
                    let _ = handle.kill();
                    return Err(CommandError::Wait {
                        command: rendered,
                        reason: error.to_string(),
                    });
                }
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(command = %rendered, ?timeout, "external command timed out, killing it");
                if let Err(error) = handle.kill() {
                    warn!(command = %rendered, "failed to kill timed out command: {}", error);
                }
                let _ = handle.wait();
                return Err(CommandError::TimedOut {
                    command: rendered,
                    timeout,
                });
            }

            thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }

    fn run(
        &self,
        command: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<ExitResult, CommandError> {
        let output = self.capture(command, args, timeout)?;
        if !output.success() && !output.stderr.trim().is_empty() {
            warn!(
                command = %output.command,
                code = output.exit.code,
                "command failed: {}",
                output.stderr.trim()
            );
        }
        Ok(output.exit)
    }
}
