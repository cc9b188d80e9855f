// SPDX-License-Identifier: GPL-3.0-only

//! External command and formatting models

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{DeviceId, DriveLetter};

/// Exit status of an external command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitResult {
    pub code: i32,
}

impl ExitResult {
    pub fn new(code: i32) -> Self {
        Self { code }
    }

    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Output of a finished external command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedOutput {
    /// The command line as it was run
    pub command: String,
    pub exit: ExitResult,
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    pub fn success(&self) -> bool {
        self.exit.success()
    }
}

/// Options passed to the external formatting utility
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatOptions {
    /// File system name as understood by the utility (e.g. "NTFS", "ext4")
    pub filesystem: String,
    pub quick: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Default for FormatOptions {
    fn default() -> Self {
        let filesystem = if cfg!(windows) { "NTFS" } else { "ext4" };
        Self {
            filesystem: filesystem.to_string(),
            quick: true,
            label: None,
        }
    }
}

/// The drive a format call is aimed at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatTarget {
    pub drive_letter: DriveLetter,
    pub mount_path: PathBuf,
    /// Set when the registry knows which device backs the letter
    pub device_id: Option<DeviceId>,
}
