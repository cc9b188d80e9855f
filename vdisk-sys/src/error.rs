// SPDX-License-Identifier: GPL-3.0-only

use std::path::PathBuf;

use thiserror::Error;
use vdisk_contracts::DriverError;

/// Error types for system-level operations
#[derive(Error, Debug)]
pub enum SysError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ledger error for {path:?}: {reason}")]
    Ledger { path: PathBuf, reason: String },

    #[error("required tool not found: {0}")]
    ToolNotFound(String),

    #[error("invalid mountinfo line: {0}")]
    InvalidMountInfoLine(String),
}

impl From<SysError> for DriverError {
    fn from(error: SysError) -> Self {
        match error {
            SysError::Io(error) => DriverError::Io(error),
            other => DriverError::Rejected(other.to_string()),
        }
    }
}

/// Result type alias for system operations
pub type Result<T> = std::result::Result<T, SysError>;
