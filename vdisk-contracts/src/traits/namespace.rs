// SPDX-License-Identifier: GPL-3.0-only

use std::collections::BTreeSet;

use vdisk_types::DriveLetter;

use crate::DriverError;

/// Operating-system view of which drive letters are taken.
///
/// Implementations must read live state on every call: letters can be
/// claimed by other processes between two queries.
pub trait DriveNamespace: Send + Sync {
    fn occupied(&self) -> Result<BTreeSet<DriveLetter>, DriverError>;

    fn is_occupied(&self, letter: DriveLetter) -> Result<bool, DriverError> {
        Ok(self.occupied()?.contains(&letter))
    }
}
