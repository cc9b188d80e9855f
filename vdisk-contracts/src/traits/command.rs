// SPDX-License-Identifier: GPL-3.0-only

use std::time::Duration;

use vdisk_types::{CapturedOutput, ExitResult};

use crate::CommandError;

/// Runs an external program to completion.
///
/// Both methods block the calling thread until the program exits or
/// `timeout` elapses. A timed-out program is killed and its handles released
/// before `CommandError::TimedOut` is returned. A non-zero exit is reported
/// in the result, not as an error.
pub trait CommandRunner: Send + Sync {
    /// Run `command` and collect its stdout and stderr.
    fn capture(
        &self,
        command: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CapturedOutput, CommandError>;

    fn run(
        &self,
        command: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<ExitResult, CommandError> {
        Ok(self.capture(command, args, timeout)?.exit)
    }
}
