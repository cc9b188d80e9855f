// SPDX-License-Identifier: GPL-3.0-only

//! In-memory stand-ins for the collaborators the manager talks to.
//!
//! The fakes share state through `Arc`, so a test keeps a handle to script
//! failures and inspect calls after handing a clone to the manager.

pub mod driver;
pub mod format;
pub mod namespace;

pub use driver::{DriverCall, FakeDriver};
pub use format::{FakeFormatter, RunnerCall, ScriptedRunner};
pub use namespace::FakeNamespace;
