// SPDX-License-Identifier: GPL-3.0-only

use std::time::Duration;

use thiserror::Error;
use vdisk_types::DeviceId;

/// Failure of an external command run through a `CommandRunner`
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to start {command}: {reason}")]
    Spawn { command: String, reason: String },

    #[error("{command} did not exit within {timeout:?}")]
    TimedOut { command: String, timeout: Duration },

    #[error("{command} was terminated without an exit code")]
    Terminated { command: String },

    #[error("failed while waiting for {command}: {reason}")]
    Wait { command: String, reason: String },

    /// A helper step around the requested command exited non-zero
    #[error("{command} exited with status {code}")]
    StepFailed { command: String, code: i32 },
}

/// Failure reported by a block-device driver or drive namespace
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("driver rejected the request: {0}")]
    Rejected(String),

    #[error("device {0} does not exist")]
    DeviceNotFound(DeviceId),

    #[error("malformed device list entry: {0:?}")]
    MalformedDeviceListEntry(String),

    #[error("no free drive letter")]
    NoFreeDriveLetter,

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DriverError {
    /// Human-readable detail without the variant prefix, for wrapping into
    /// higher-level errors.
    pub fn reason(&self) -> String {
        match self {
            DriverError::Rejected(reason) => reason.clone(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_reason_is_bare_driver_detail() {
        let error = DriverError::Rejected("unit busy".to_string());
        assert_eq!(error.reason(), "unit busy");
        assert_eq!(error.to_string(), "driver rejected the request: unit busy");
    }

    #[test]
    fn command_errors_convert_into_driver_errors() {
        let error: DriverError = CommandError::Terminated {
            command: "losetup -d /dev/loop3".to_string(),
        }
        .into();
        assert!(matches!(error, DriverError::Command(_)));
        assert!(error.reason().contains("losetup"));
    }
}
