// SPDX-License-Identifier: GPL-3.0-only

//! Drive letter allocation

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;
use vdisk_contracts::DriveNamespace;
use vdisk_types::DriveLetter;

use crate::error::{Result, VdiskError};

/// Hands out drive letters nobody holds.
///
/// The operating system is asked on every call; nothing is cached, since
/// other processes can claim letters at any time.
#[derive(Clone)]
pub struct DriveAllocator {
    namespace: Arc<dyn DriveNamespace>,
    start: DriveLetter,
}

impl DriveAllocator {
    pub fn new(namespace: Arc<dyn DriveNamespace>, start: DriveLetter) -> Self {
        Self { namespace, start }
    }

    /// First letter, in ascending order from the start letter, that the
    /// operating system reports as free.
    pub fn find_free_identifier(&self) -> Result<DriveLetter> {
        self.find_free_excluding(&BTreeSet::new())
    }

    /// Like `find_free_identifier`, also skipping letters claimed in-process.
    pub fn find_free_excluding(&self, claimed: &BTreeSet<DriveLetter>) -> Result<DriveLetter> {
        let mut occupied = self.namespace.occupied()?;
        occupied.extend(claimed.iter().copied());

        let letter =
            DriveLetter::first_free(&occupied, self.start).ok_or(VdiskError::NoFreeIdentifier)?;
        debug!(drive = %letter, occupied = occupied.len(), "found free drive letter");
        Ok(letter)
    }

    /// Re-check a single letter against live operating-system state.
    pub fn is_free(&self, letter: DriveLetter) -> Result<bool> {
        Ok(!self.namespace.is_occupied(letter)?)
    }
}
