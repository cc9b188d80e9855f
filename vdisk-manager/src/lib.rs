// SPDX-License-Identifier: GPL-3.0-only

//! User-space manager for virtual block devices
//!
//! The manager owns the in-process view of which virtual devices exist and
//! drives their lifecycle against an external block-device driver:
//!
//! - [`allocator::DriveAllocator`] finds drive letters nobody holds
//! - [`registry::DeviceRegistry`] is the single authority on registered devices
//! - [`lifecycle::DeviceManager`] mounts, creates, removes and formats devices
//! - [`transfer::ContentTransfer`] moves gzip payloads on and off the scratch drive
//!
//! Everything is synchronous. The registry is the only shared mutable state
//! and is safe to use from several threads at once.

pub mod allocator;
pub mod compression;
pub mod config;
pub mod context;
pub mod error;
pub mod lifecycle;
pub mod registry;
pub mod serialization;
pub mod transfer;

pub use allocator::DriveAllocator;
pub use config::{DEFAULT_PORT, VdiskConfig};
pub use context::VdiskContext;
pub use error::{RemovalFailure, Result, VdiskError};
pub use lifecycle::{DeviceManager, RemoveAllReport, RemoveOutcome};
pub use registry::{DeviceRegistry, LetterReservation, RegistrySnapshot};
pub use transfer::ContentTransfer;
