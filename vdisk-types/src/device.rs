// SPDX-License-Identifier: GPL-3.0-only

//! Virtual device data models
//!
//! `VirtualDevice` is what the registry stores; `DeviceRequest` is what the
//! driver is asked to build.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::DriveLetter;

pub const BYTES_PER_MEGABYTE: u64 = 1_048_576;

/// Driver-assigned handle of a virtual device
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DeviceId {
    type Err = std::num::ParseIntError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        value.trim().parse().map(DeviceId)
    }
}

impl From<u32> for DeviceId {
    fn from(value: u32) -> Self {
        DeviceId(value)
    }
}

/// What stores the device's blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BackingKind {
    /// Volatile system memory
    Memory,
    /// A file holding a full disk image
    ImageFile,
}

impl BackingKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackingKind::Memory => "memory",
            BackingKind::ImageFile => "image_file",
        }
    }
}

impl fmt::Display for BackingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for BackingKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "memory" => Ok(BackingKind::Memory),
            "image_file" => Ok(BackingKind::ImageFile),
            other => Err(format!("unknown backing kind `{other}`")),
        }
    }
}

impl From<BackingKind> for String {
    fn from(kind: BackingKind) -> Self {
        kind.as_str().to_owned()
    }
}

/// Lifecycle state of a device.
///
/// Moves strictly forward: Creating → Mounted → Removing → Removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DeviceState {
    Creating,
    Mounted,
    Removing,
    Removed,
}

impl DeviceState {
    fn rank(self) -> u8 {
        match self {
            DeviceState::Creating => 0,
            DeviceState::Mounted => 1,
            DeviceState::Removing => 2,
            DeviceState::Removed => 3,
        }
    }

    /// Whether `next` is the immediate successor of `self`.
    pub fn can_transition_to(self, next: DeviceState) -> bool {
        next.rank() == self.rank() + 1
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceState::Creating => "creating",
            DeviceState::Mounted => "mounted",
            DeviceState::Removing => "removing",
            DeviceState::Removed => "removed",
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for DeviceState {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "creating" => Ok(DeviceState::Creating),
            "mounted" => Ok(DeviceState::Mounted),
            "removing" => Ok(DeviceState::Removing),
            "removed" => Ok(DeviceState::Removed),
            other => Err(format!("unknown device state `{other}`")),
        }
    }
}

impl From<DeviceState> for String {
    fn from(state: DeviceState) -> Self {
        state.as_str().to_owned()
    }
}

/// Arguments handed to the block-device driver when creating a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRequest {
    /// Size in bytes; 0 means "sized from the backing image"
    pub capacity_bytes: u64,
    pub backing_kind: BackingKind,
    pub image_path: Option<PathBuf>,
    pub read_only: bool,
    pub drive_letter: DriveLetter,
}

impl DeviceRequest {
    pub fn memory(drive_letter: DriveLetter, capacity_bytes: u64) -> Self {
        Self {
            capacity_bytes,
            backing_kind: BackingKind::Memory,
            image_path: None,
            read_only: false,
            drive_letter,
        }
    }

    pub fn image(drive_letter: DriveLetter, image_path: PathBuf, read_only: bool) -> Self {
        Self {
            capacity_bytes: 0,
            backing_kind: BackingKind::ImageFile,
            image_path: Some(image_path),
            read_only,
            drive_letter,
        }
    }

    /// Same request aimed at a different drive letter.
    pub fn retarget(&self, drive_letter: DriveLetter) -> Self {
        Self {
            drive_letter,
            ..self.clone()
        }
    }
}

/// One virtual block device known to the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualDevice {
    pub device_id: DeviceId,
    pub drive_letter: DriveLetter,
    pub backing_kind: BackingKind,
    pub capacity_bytes: u64,
    pub read_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<PathBuf>,
    pub state: DeviceState,
}

impl VirtualDevice {
    pub fn from_request(device_id: DeviceId, request: &DeviceRequest, state: DeviceState) -> Self {
        Self {
            device_id,
            drive_letter: request.drive_letter,
            backing_kind: request.backing_kind,
            capacity_bytes: request.capacity_bytes,
            read_only: request.read_only,
            image_path: request.image_path.clone(),
            state,
        }
    }

    pub fn is_mounted(&self) -> bool {
        self.state == DeviceState::Mounted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_only_moves_forward_one_step() {
        assert!(DeviceState::Creating.can_transition_to(DeviceState::Mounted));
        assert!(DeviceState::Mounted.can_transition_to(DeviceState::Removing));
        assert!(DeviceState::Removing.can_transition_to(DeviceState::Removed));

        assert!(!DeviceState::Mounted.can_transition_to(DeviceState::Creating));
        assert!(!DeviceState::Removed.can_transition_to(DeviceState::Mounted));
        assert!(!DeviceState::Creating.can_transition_to(DeviceState::Removed));
        assert!(!DeviceState::Mounted.can_transition_to(DeviceState::Mounted));
    }

    #[test]
    fn device_copies_request_fields() {
        let letter: DriveLetter = "R".parse().expect("letter");
        let request = DeviceRequest::memory(letter, 64 * BYTES_PER_MEGABYTE);
        let device = VirtualDevice::from_request(DeviceId(3), &request, DeviceState::Mounted);

        assert_eq!(device.device_id, DeviceId(3));
        assert_eq!(device.drive_letter, letter);
        assert_eq!(device.backing_kind, BackingKind::Memory);
        assert_eq!(device.capacity_bytes, 67_108_864);
        assert!(device.is_mounted());
    }

    #[test]
    fn kinds_and_states_serialize_as_plain_strings() {
        assert_eq!(
            serde_json::to_string(&BackingKind::ImageFile).expect("serialize"),
            "\"image_file\""
        );
        let state: DeviceState = serde_json::from_str("\"removing\"").expect("deserialize");
        assert_eq!(state, DeviceState::Removing);
        assert!(serde_json::from_str::<DeviceState>("\"gone\"").is_err());
    }

    #[test]
    fn retarget_keeps_everything_but_the_letter() {
        let request = DeviceRequest::image(
            "E".parse().expect("letter"),
            PathBuf::from("/tmp/disk.img"),
            true,
        );
        let moved = request.retarget("F".parse().expect("letter"));
        assert_eq!(moved.drive_letter.as_char(), 'F');
        assert_eq!(moved.image_path, request.image_path);
        assert!(moved.read_only);
    }
}
