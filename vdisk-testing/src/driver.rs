// SPDX-License-Identifier: GPL-3.0-only

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use vdisk_contracts::{BlockDeviceDriver, DriveNamespace, DriverError};
use vdisk_types::{BackingKind, DeviceId, DeviceRequest, DriveLetter};

use crate::namespace::FakeNamespace;

/// One call received by [`FakeDriver`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    Create {
        drive_letter: DriveLetter,
        backing_kind: BackingKind,
    },
    ForceRemove(DeviceId),
    ListActive,
    FindFreeLetter,
}

#[derive(Debug)]
struct DriverState {
    next_id: u32,
    /// Live devices and the letter each one published, if any
    live: BTreeMap<DeviceId, Option<DriveLetter>>,
    create_failures: VecDeque<String>,
    removal_failures: BTreeMap<DeviceId, String>,
    malformed_listing: Option<String>,
    publish_letters: bool,
    create_delay: Duration,
    calls: Vec<DriverCall>,
}

impl Default for DriverState {
    fn default() -> Self {
        Self {
            next_id: 1,
            live: BTreeMap::new(),
            create_failures: VecDeque::new(),
            removal_failures: BTreeMap::new(),
            malformed_listing: None,
            publish_letters: true,
            create_delay: Duration::ZERO,
            calls: Vec::new(),
        }
    }
}

/// Block-device driver that keeps its devices in memory.
///
/// Ids are handed out sequentially from 1. Created devices occupy their
/// letter in the shared [`FakeNamespace`] unless publishing is turned off.
pub struct FakeDriver {
    namespace: Arc<FakeNamespace>,
    state: Mutex<DriverState>,
}

impl FakeDriver {
    pub fn new(namespace: Arc<FakeNamespace>) -> Self {
        Self {
            namespace,
            state: Mutex::new(DriverState::default()),
        }
    }

    /// Make the next `create_device` call fail with `reason`.
    pub fn fail_next_create(&self, reason: &str) {
        self.state
            .lock()
            .create_failures
            .push_back(reason.to_string());
    }

    pub fn fail_removal(&self, device_id: DeviceId, reason: &str) {
        self.state
            .lock()
            .removal_failures
            .insert(device_id, reason.to_string());
    }

    pub fn clear_removal_failure(&self, device_id: DeviceId) {
        self.state.lock().removal_failures.remove(&device_id);
    }

    /// Report `entry` as an unparsable line in the next device listings.
    pub fn corrupt_listing(&self, entry: &str) {
        self.state.lock().malformed_listing = Some(entry.to_string());
    }

    pub fn set_publish_letters(&self, publish: bool) {
        self.state.lock().publish_letters = publish;
    }

    /// Slow down `create_device` to widen race windows.
    pub fn set_create_delay(&self, delay: Duration) {
        self.state.lock().create_delay = delay;
    }

    /// Drop a device behind the manager's back.
    pub fn lose_device(&self, device_id: DeviceId) {
        let letter = self.state.lock().live.remove(&device_id).flatten();
        if let Some(letter) = letter {
            self.namespace.release(letter);
        }
    }

    /// Add a live device nobody registered, as left behind by an earlier
    /// process.
    pub fn adopt_device(&self) -> DeviceId {
        let mut state = self.state.lock();
        let device_id = DeviceId(state.next_id);
        state.next_id += 1;
        state.live.insert(device_id, None);
        device_id
    }

    pub fn active(&self) -> Vec<DeviceId> {
        self.state.lock().live.keys().copied().collect()
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.state.lock().calls.clone()
    }

    pub fn create_calls(&self) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| matches!(call, DriverCall::Create { .. }))
            .count()
    }
}

impl BlockDeviceDriver for FakeDriver {
    fn create_device(&self, request: &DeviceRequest) -> Result<DeviceId, DriverError> {
        let delay = {
            let mut state = self.state.lock();
            state.calls.push(DriverCall::Create {
                drive_letter: request.drive_letter,
                backing_kind: request.backing_kind,
            });
            if let Some(reason) = state.create_failures.pop_front() {
                return Err(DriverError::Rejected(reason));
            }
            state.create_delay
        };

        if !delay.is_zero() {
            thread::sleep(delay);
        }

        let (device_id, publish) = {
            let mut state = self.state.lock();
            let device_id = DeviceId(state.next_id);
            state.next_id += 1;
            let publish = state.publish_letters;
            state
                .live
                .insert(device_id, publish.then_some(request.drive_letter));
            (device_id, publish)
        };

        if publish {
            self.namespace.occupy(request.drive_letter);
        }
        Ok(device_id)
    }

    fn force_remove_device(&self, device_id: DeviceId) -> Result<(), DriverError> {
        let letter = {
            let mut state = self.state.lock();
            state.calls.push(DriverCall::ForceRemove(device_id));
            if let Some(reason) = state.removal_failures.get(&device_id) {
                return Err(DriverError::Rejected(reason.clone()));
            }
            state
                .live
                .remove(&device_id)
                .ok_or(DriverError::DeviceNotFound(device_id))?
        };

        if let Some(letter) = letter {
            self.namespace.release(letter);
        }
        Ok(())
    }

    fn list_active_devices(&self) -> Result<Vec<DeviceId>, DriverError> {
        let mut state = self.state.lock();
        state.calls.push(DriverCall::ListActive);
        if let Some(entry) = &state.malformed_listing {
            return Err(DriverError::MalformedDeviceListEntry(entry.clone()));
        }
        Ok(state.live.keys().copied().collect())
    }

    fn find_free_drive_letter(&self) -> Result<DriveLetter, DriverError> {
        let published: BTreeSet<DriveLetter> = {
            let mut state = self.state.lock();
            state.calls.push(DriverCall::FindFreeLetter);
            state.live.values().flatten().copied().collect()
        };

        let mut occupied = self.namespace.occupied()?;
        occupied.extend(published);
        DriveLetter::first_free(&occupied, DriveLetter::FIRST).ok_or(DriverError::NoFreeDriveLetter)
    }
}
