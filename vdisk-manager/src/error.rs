// SPDX-License-Identifier: GPL-3.0-only

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;
use vdisk_contracts::DriverError;
use vdisk_types::{DeviceId, DeviceState, DriveLetter};

/// One device `remove_all` could not tear down
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovalFailure {
    pub device_id: DeviceId,
    pub reason: String,
}

impl fmt::Display for RemovalFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device {}: {}", self.device_id, self.reason)
    }
}

#[derive(Debug, Error)]
pub enum VdiskError {
    #[error("no free drive letter")]
    NoFreeIdentifier,

    #[error("device {0} is already registered")]
    DuplicateId(DeviceId),

    #[error("device {0} is not registered")]
    NotFound(DeviceId),

    #[error("drive {0} is already in use")]
    DriveInUse(DriveLetter),

    #[error("device size must be greater than zero megabytes (got {size_megabytes})")]
    InvalidSize { size_megabytes: u64 },

    #[error("device {device_id} cannot move from {from} to {to}")]
    InvalidTransition {
        device_id: DeviceId,
        from: DeviceState,
        to: DeviceState,
    },

    #[error("mount failed: {reason}")]
    MountFailed { reason: String },

    #[error("create failed: {reason}")]
    CreateFailed { reason: String },

    #[error("removal of device {device_id} failed: {reason}")]
    RemoveFailed { device_id: DeviceId, reason: String },

    #[error("{} device(s) could not be removed: {}", .failed.len(), join_failures(.failed))]
    PartialRemoval { failed: Vec<RemovalFailure> },

    #[error("device {0} no longer exists in the driver")]
    StaleDevice(DeviceId),

    #[error("format failed with exit code {exit_code}")]
    FormatFailed { exit_code: i32 },

    #[error("format utility did not finish in time")]
    FormatTimedOut,

    #[error("format utility could not run: {0}")]
    Format(String),

    #[error("malformed compressed payload: {0}")]
    DecompressionError(String),

    #[error("scratch drive {0} is not mounted")]
    NoScratchDevice(DriveLetter),

    #[error("malformed device list entry: {0:?}")]
    MalformedDeviceListEntry(String),

    #[error("driver error: {0}")]
    Driver(DriverError),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid configuration in {path:?}: {reason}")]
    Config { path: PathBuf, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<DriverError> for VdiskError {
    fn from(error: DriverError) -> Self {
        match error {
            DriverError::MalformedDeviceListEntry(entry) => {
                VdiskError::MalformedDeviceListEntry(entry)
            }
            DriverError::NoFreeDriveLetter => VdiskError::NoFreeIdentifier,
            other => VdiskError::Driver(other),
        }
    }
}

fn join_failures(failed: &[RemovalFailure]) -> String {
    failed
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, VdiskError>;
