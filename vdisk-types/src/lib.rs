// SPDX-License-Identifier: GPL-3.0-only

//! Canonical domain models for the vdisk virtual device manager
//!
//! These types are shared by every layer of the stack:
//!
//! - **vdisk-contracts**: collaborator traits take and return these types
//! - **vdisk-sys**: system drivers build them from tool output
//! - **vdisk-manager**: the registry stores `VirtualDevice` values
//! - **vdisk-cli**: persists registry snapshots built from them

pub mod command;
pub mod device;
pub mod drive;

pub use command::{CapturedOutput, ExitResult, FormatOptions, FormatTarget};
pub use device::{
    BYTES_PER_MEGABYTE, BackingKind, DeviceId, DeviceRequest, DeviceState, VirtualDevice,
};
pub use drive::{DriveLetter, DriveLetterError};
