// SPDX-License-Identifier: GPL-3.0-only

pub mod command;
pub mod driver;
pub mod format;
pub mod namespace;

pub use command::CommandRunner;
pub use driver::BlockDeviceDriver;
pub use format::FormatUtility;
pub use namespace::DriveNamespace;
