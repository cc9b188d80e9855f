// SPDX-License-Identifier: GPL-3.0-only

//! Contracts between the device manager and the collaborators it drives
//!
//! The manager never talks to the operating system directly. Everything it
//! needs (the block-device driver, the drive namespace, external commands and
//! the formatting utility) is reached through the traits defined here, so that
//! system implementations (`vdisk-sys`) and in-process fakes (`vdisk-testing`)
//! are interchangeable.

pub mod error;
pub mod traits;

pub use error::{CommandError, DriverError};
pub use traits::{BlockDeviceDriver, CommandRunner, DriveNamespace, FormatUtility};
