// SPDX-License-Identifier: GPL-3.0-only

//! System collaborators for the virtual device manager
//!
//! This crate provides the implementations of the `vdisk-contracts` traits
//! that touch the host:
//! - External command execution with a hard timeout
//! - The external formatting utility
//! - Drive-letter occupancy read from the mount table
//! - A loop-device backed block-device driver
//! - The TCP port liveness probe
//!
//! Most of these operations require elevated privileges.

pub mod command;
pub mod error;
pub mod format;
pub mod ledger;
pub mod loop_driver;
pub mod namespace;
pub mod port;

pub use command::{SystemCommandRunner, render};
pub use error::{Result, SysError};
pub use format::{FormatCommand, SystemFormatter};
pub use loop_driver::{LoopDeviceDriver, LoopDriverOptions};
pub use namespace::MountTableNamespace;
pub use port::{is_in_use, is_in_use_within};
