// SPDX-License-Identifier: GPL-3.0-only

//! In-memory device registry
//!
//! The registry is the single authority on which devices this process knows
//! about. It never talks to the operating system. All compound operations
//! (check-then-insert, state transitions, removal) run under one lock, so
//! concurrent callers cannot claim the same id or letter, nor remove the same
//! device twice.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use tracing::debug;
use vdisk_types::{DeviceId, DeviceState, DriveLetter, VirtualDevice};

use crate::error::{Result, VdiskError};

#[derive(Debug, Default)]
struct RegistryState {
    devices: BTreeMap<DeviceId, VirtualDevice>,
    /// Letters claimed by mounts that have not reached the driver yet
    reserved: BTreeSet<DriveLetter>,
    /// Devices whose driver-side removal is running right now
    removing: BTreeSet<DeviceId>,
}

impl RegistryState {
    fn letter_taken(&self, letter: DriveLetter) -> bool {
        self.reserved.contains(&letter)
            || self
                .devices
                .values()
                .any(|device| device.drive_letter == letter)
    }

    fn insert(&mut self, device: VirtualDevice) -> Result<()> {
        if self.devices.contains_key(&device.device_id) {
            return Err(VdiskError::DuplicateId(device.device_id));
        }
        if self.letter_taken(device.drive_letter) {
            return Err(VdiskError::DriveInUse(device.drive_letter));
        }
        self.devices.insert(device.device_id, device);
        Ok(())
    }

    fn transition(&mut self, device_id: DeviceId, next: DeviceState) -> Result<&mut VirtualDevice> {
        let device = self
            .devices
            .get_mut(&device_id)
            .ok_or(VdiskError::NotFound(device_id))?;
        if !device.state.can_transition_to(next) {
            return Err(VdiskError::InvalidTransition {
                device_id,
                from: device.state,
                to: next,
            });
        }
        device.state = next;
        Ok(device)
    }
}

/// Serializable copy of the registry contents
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    #[serde(rename = "device", default)]
    pub devices: Vec<VirtualDevice>,
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    state: Mutex<RegistryState>,
    /// Shared while a driver device exists that is not committed yet
    attach_gate: RwLock<()>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device. Fails with `DuplicateId` if the id is present and
    /// `DriveInUse` if its letter belongs to another device or reservation.
    pub fn insert(&self, device: VirtualDevice) -> Result<()> {
        let device_id = device.device_id;
        self.state.lock().insert(device)?;
        debug!(%device_id, "device registered");
        Ok(())
    }

    /// Drop a device from the registry, returning what was stored.
    pub fn remove(&self, device_id: DeviceId) -> Result<VirtualDevice> {
        let mut state = self.state.lock();
        let device = state
            .devices
            .remove(&device_id)
            .ok_or(VdiskError::NotFound(device_id))?;
        state.removing.remove(&device_id);
        debug!(%device_id, "device unregistered");
        Ok(device)
    }

    pub fn lookup(&self, device_id: DeviceId) -> Option<VirtualDevice> {
        self.state.lock().devices.get(&device_id).cloned()
    }

    /// Snapshot of every registered device, ordered by id.
    pub fn list_all(&self) -> Vec<VirtualDevice> {
        self.state.lock().devices.values().cloned().collect()
    }

    pub fn find_by_letter(&self, letter: DriveLetter) -> Option<VirtualDevice> {
        self.state
            .lock()
            .devices
            .values()
            .find(|device| device.drive_letter == letter)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().devices.is_empty()
    }

    /// Move a device one step forward in its lifecycle.
    pub fn transition(&self, device_id: DeviceId, next: DeviceState) -> Result<VirtualDevice> {
        let mut state = self.state.lock();
        state.transition(device_id, next).map(|device| device.clone())
    }

    /// Letters held by registered devices or pending reservations.
    pub fn claimed_letters(&self) -> BTreeSet<DriveLetter> {
        let state = self.state.lock();
        state
            .devices
            .values()
            .map(|device| device.drive_letter)
            .chain(state.reserved.iter().copied())
            .collect()
    }

    /// Claim `letter` for a mount in progress.
    ///
    /// The claim lasts until the reservation is committed or dropped.
    pub fn reserve_letter(&self, letter: DriveLetter) -> Result<LetterReservation<'_>> {
        let mut state = self.state.lock();
        if state.letter_taken(letter) {
            return Err(VdiskError::DriveInUse(letter));
        }
        state.reserved.insert(letter);
        debug!(drive = %letter, "drive letter reserved");
        Ok(LetterReservation {
            registry: self,
            letter,
            active: true,
        })
    }

    /// Turn a reservation into a registered device in one step.
    ///
    /// The reservation is released whatever the outcome.
    pub fn commit(&self, mut reservation: LetterReservation<'_>, device: VirtualDevice) -> Result<()> {
        let mut state = self.state.lock();
        state.reserved.remove(&reservation.letter);
        reservation.active = false;

        if device.drive_letter != reservation.letter {
            return Err(VdiskError::DriveInUse(device.drive_letter));
        }
        let device_id = device.device_id;
        state.insert(device)?;
        debug!(%device_id, drive = %reservation.letter, "reservation committed");
        Ok(())
    }

    /// Held by a mount from the driver call until its commit.
    pub fn attach_guard(&self) -> RwLockReadGuard<'_, ()> {
        self.attach_gate.read()
    }

    /// Wait for in-flight driver calls to commit and keep new ones out.
    ///
    /// While held, every device the driver knows about that belongs to this
    /// process is in the registry.
    pub fn hold_attaches(&self) -> RwLockWriteGuard<'_, ()> {
        self.attach_gate.write()
    }

    /// Mark a device as being removed and return it.
    ///
    /// A device already in `Removing` whose previous removal failed may be
    /// retried; one whose removal is running in another caller may not.
    pub fn begin_removal(&self, device_id: DeviceId) -> Result<VirtualDevice> {
        let mut state = self.state.lock();
        if state.removing.contains(&device_id) {
            return Err(VdiskError::InvalidTransition {
                device_id,
                from: DeviceState::Removing,
                to: DeviceState::Removing,
            });
        }

        let current = state
            .devices
            .get(&device_id)
            .map(|device| device.state)
            .ok_or(VdiskError::NotFound(device_id))?;

        let device = match current {
            DeviceState::Removing => state
                .devices
                .get(&device_id)
                .cloned()
                .ok_or(VdiskError::NotFound(device_id))?,
            _ => state.transition(device_id, DeviceState::Removing)?.clone(),
        };

        state.removing.insert(device_id);
        Ok(device)
    }

    /// Complete a removal: the device reaches `Removed` and is purged.
    pub fn finish_removal(&self, device_id: DeviceId) -> Result<VirtualDevice> {
        let mut state = self.state.lock();
        state.removing.remove(&device_id);
        state.transition(device_id, DeviceState::Removed)?;
        state
            .devices
            .remove(&device_id)
            .ok_or(VdiskError::NotFound(device_id))
    }

    /// Give up on a removal; the device stays in `Removing` for a retry.
    pub fn abort_removal(&self, device_id: DeviceId) {
        self.state.lock().removing.remove(&device_id);
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            devices: self.list_all(),
        }
    }

    /// Load devices from a persisted snapshot with the same checks as `insert`.
    ///
    /// Devices that had already reached `Removed` are skipped.
    pub fn restore(&self, snapshot: RegistrySnapshot) -> Result<usize> {
        let mut state = self.state.lock();
        let mut restored = 0;
        for device in snapshot.devices {
            if device.state == DeviceState::Removed {
                continue;
            }
            state.insert(device)?;
            restored += 1;
        }
        Ok(restored)
    }

    fn release(&self, letter: DriveLetter) {
        self.state.lock().reserved.remove(&letter);
        debug!(drive = %letter, "drive letter reservation released");
    }
}

/// A drive letter claimed in the registry for a mount in progress.
///
/// Dropping it without committing releases the letter.
#[derive(Debug)]
pub struct LetterReservation<'a> {
    registry: &'a DeviceRegistry,
    letter: DriveLetter,
    active: bool,
}

impl LetterReservation<'_> {
    pub fn letter(&self) -> DriveLetter {
        self.letter
    }
}

impl Drop for LetterReservation<'_> {
    fn drop(&mut self) {
        if self.active {
            self.registry.release(self.letter);
        }
    }
}
