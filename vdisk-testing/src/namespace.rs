// SPDX-License-Identifier: GPL-3.0-only

use std::collections::BTreeSet;

use parking_lot::Mutex;
use vdisk_contracts::{DriveNamespace, DriverError};
use vdisk_types::DriveLetter;

#[derive(Debug, Default)]
struct NamespaceState {
    occupied: BTreeSet<DriveLetter>,
    /// Letters that look free in a listing but are taken once probed
    contested: BTreeSet<DriveLetter>,
    failing: bool,
}

/// Drive namespace backed by a set of letters
#[derive(Debug, Default)]
pub struct FakeNamespace {
    state: Mutex<NamespaceState>,
}

impl FakeNamespace {
    /// Start with `letters` occupied.
    ///
    /// Panics if one of them is not a drive letter.
    pub fn with_occupied<I, S>(letters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let namespace = Self::default();
        for letter in letters {
            let letter = letter
                .as_ref()
                .parse()
                .unwrap_or_else(|error| panic!("invalid fake drive letter: {error}"));
            namespace.occupy(letter);
        }
        namespace
    }

    pub fn occupy(&self, letter: DriveLetter) {
        self.state.lock().occupied.insert(letter);
    }

    pub fn release(&self, letter: DriveLetter) {
        let mut state = self.state.lock();
        state.occupied.remove(&letter);
        state.contested.remove(&letter);
    }

    /// Simulate another process grabbing `letter` the moment it is probed.
    pub fn contest(&self, letter: DriveLetter) {
        self.state.lock().contested.insert(letter);
    }

    pub fn fail_queries(&self, failing: bool) {
        self.state.lock().failing = failing;
    }

    pub fn occupied_letters(&self) -> BTreeSet<DriveLetter> {
        self.state.lock().occupied.clone()
    }
}

impl DriveNamespace for FakeNamespace {
    fn occupied(&self) -> Result<BTreeSet<DriveLetter>, DriverError> {
        let state = self.state.lock();
        if state.failing {
            return Err(DriverError::Rejected("namespace unavailable".to_string()));
        }
        Ok(state.occupied.clone())
    }

    fn is_occupied(&self, letter: DriveLetter) -> Result<bool, DriverError> {
        let mut state = self.state.lock();
        if state.failing {
            return Err(DriverError::Rejected("namespace unavailable".to_string()));
        }
        if state.contested.remove(&letter) {
            state.occupied.insert(letter);
        }
        Ok(state.occupied.contains(&letter))
    }
}
