// SPDX-License-Identifier: GPL-3.0-only

//! Device lifecycle: mount, create, remove and format

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};
use vdisk_contracts::{BlockDeviceDriver, CommandError, DriveNamespace, DriverError, FormatUtility};
use vdisk_types::{
    BYTES_PER_MEGABYTE, BackingKind, DeviceId, DeviceRequest, DeviceState, DriveLetter,
    ExitResult, FormatOptions, FormatTarget, VirtualDevice,
};

use crate::allocator::DriveAllocator;
use crate::context::VdiskContext;
use crate::error::{RemovalFailure, Result, VdiskError};
use crate::registry::{DeviceRegistry, LetterReservation};

/// How a single `remove` ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// The driver tore the device down
    Removed,
    /// The driver no longer had the device; only the registry entry was purged
    Stale,
}

/// Result of tearing down every device the driver reports
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoveAllReport {
    pub removed: Vec<DeviceId>,
    /// Devices that were already gone from the driver
    pub stale: Vec<DeviceId>,
    pub failed: Vec<RemovalFailure>,
    /// Devices still being created or removed by another caller; left alone
    pub in_flight: Vec<DeviceId>,
}

impl RemoveAllReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Turn a report with failures into `VdiskError::PartialRemoval`.
    pub fn into_result(self) -> Result<Self> {
        if self.failed.is_empty() {
            Ok(self)
        } else {
            Err(VdiskError::PartialRemoval {
                failed: self.failed,
            })
        }
    }
}

pub struct DeviceManager {
    registry: Arc<DeviceRegistry>,
    driver: Arc<dyn BlockDeviceDriver>,
    namespace: Arc<dyn DriveNamespace>,
    formatter: Arc<dyn FormatUtility>,
    allocator: DriveAllocator,
    mount_root: PathBuf,
    mount_attempts: u32,
    settle_timeout: Duration,
    settle_poll_interval: Duration,
    format_options: FormatOptions,
}

impl DeviceManager {
    pub fn new(context: &VdiskContext) -> Self {
        let config = &context.config;
        Self {
            registry: Arc::clone(&context.registry),
            driver: Arc::clone(&context.driver),
            namespace: Arc::clone(&context.namespace),
            formatter: Arc::clone(&context.formatter),
            allocator: DriveAllocator::new(Arc::clone(&context.namespace), config.allocation_start),
            mount_root: config.mount_root.clone(),
            mount_attempts: config.mount_attempts.max(1),
            settle_timeout: config.settle_timeout(),
            settle_poll_interval: config.settle_poll_interval(),
            format_options: config.format_options.clone(),
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn allocator(&self) -> &DriveAllocator {
        &self.allocator
    }

    /// First letter free both in the operating system and in this process.
    pub fn find_free_identifier(&self) -> Result<DriveLetter> {
        self.allocator
            .find_free_excluding(&self.registry.claimed_letters())
    }

    /// Expose an existing image file as a drive.
    ///
    /// If `drive_letter` is taken by the time the driver is called, another
    /// free letter is used instead. The returned id identifies the device in
    /// the registry; look it up to learn the final letter.
    pub fn mount_from_image(&self, drive_letter: DriveLetter, image_path: &Path) -> Result<DeviceId> {
        self.mount_from_image_with(drive_letter, image_path, false)
    }

    pub fn mount_from_image_with(
        &self,
        drive_letter: DriveLetter,
        image_path: &Path,
        read_only: bool,
    ) -> Result<DeviceId> {
        if !image_path.is_file() {
            return Err(VdiskError::MountFailed {
                reason: format!("image {} does not exist", image_path.display()),
            });
        }

        info!(drive = %drive_letter, image = %image_path.display(), read_only, "mounting image");
        self.attach(DeviceRequest::image(
            drive_letter,
            image_path.to_path_buf(),
            read_only,
        ))
    }

    /// Create a RAM-backed drive of `size_megabytes` MiB.
    pub fn create_memory_backed(
        &self,
        drive_letter: DriveLetter,
        size_megabytes: u64,
    ) -> Result<DeviceId> {
        if size_megabytes == 0 {
            return Err(VdiskError::InvalidSize { size_megabytes });
        }
        let capacity_bytes = size_megabytes
            .checked_mul(BYTES_PER_MEGABYTE)
            .ok_or(VdiskError::InvalidSize { size_megabytes })?;

        info!(drive = %drive_letter, size_megabytes, "creating memory-backed drive");
        self.attach(DeviceRequest::memory(drive_letter, capacity_bytes))
    }

    fn attach(&self, request: DeviceRequest) -> Result<DeviceId> {
        let mut letter = request.drive_letter;

        for attempt in 1..=self.mount_attempts {
            if attempt > 1 {
                letter = self.find_free_identifier()?;
                debug!(drive = %letter, attempt, "retrying with another drive letter");
            }

            let reservation = match self.registry.reserve_letter(letter) {
                Ok(reservation) => reservation,
                Err(VdiskError::DriveInUse(_)) => {
                    warn!(drive = %letter, attempt, "drive letter already claimed in this process");
                    continue;
                }
                Err(error) => return Err(error),
            };

            if !self.allocator.is_free(letter)? {
                warn!(drive = %letter, attempt, "drive letter taken before mount");
                continue;
            }

            return self.attach_reserved(reservation, request.retarget(letter));
        }

        warn!(attempts = self.mount_attempts, "no drive letter stayed free long enough to mount");
        Err(VdiskError::NoFreeIdentifier)
    }

    fn attach_reserved(
        &self,
        reservation: LetterReservation<'_>,
        request: DeviceRequest,
    ) -> Result<DeviceId> {
        let letter = request.drive_letter;
        let gate = self.registry.attach_guard();
        let device_id = self.driver.create_device(&request).map_err(|driver_error| {
            error!(drive = %letter, error = %driver_error, "driver refused device");
            attach_failure(request.backing_kind, &driver_error)
        })?;

        let device = VirtualDevice::from_request(device_id, &request, DeviceState::Creating);
        if let Err(commit_error) = self.registry.commit(reservation, device) {
            error!(%device_id, error = %commit_error, "driver returned an id the registry cannot hold");
            if let Err(cleanup) = self.driver.force_remove_device(device_id) {
                warn!(%device_id, error = %cleanup, "failed to tear down unregistered device");
            }
            return Err(commit_error);
        }
        drop(gate);

        if request.backing_kind == BackingKind::Memory {
            self.wait_for_letter(letter);
        }

        self.registry.transition(device_id, DeviceState::Mounted)?;
        info!(%device_id, drive = %letter, kind = %request.backing_kind, "device mounted");
        Ok(device_id)
    }

    /// Poll the namespace until `letter` shows up or the settle timeout runs
    /// out. Expiry is not an error.
    fn wait_for_letter(&self, letter: DriveLetter) {
        let deadline = Instant::now() + self.settle_timeout;
        loop {
            match self.namespace.is_occupied(letter) {
                Ok(true) => {
                    debug!(drive = %letter, "drive letter visible");
                    return;
                }
                Ok(false) => {}
                Err(error) => debug!(drive = %letter, %error, "namespace query failed while settling"),
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    drive = %letter,
                    timeout_ms = self.settle_timeout.as_millis() as u64,
                    "drive letter did not appear before the settle timeout"
                );
                return;
            }
            thread::sleep(self.settle_poll_interval.min(deadline - now));
        }
    }

    /// Tear down a mounted device and drop it from the registry.
    ///
    /// A device the driver has already lost is purged and reported as
    /// [`RemoveOutcome::Stale`]. Any other driver failure leaves the device in
    /// `Removing`; calling `remove` again retries the driver.
    pub fn remove(&self, device_id: DeviceId) -> Result<RemoveOutcome> {
        let device = self.registry.begin_removal(device_id)?;

        match self.driver.force_remove_device(device_id) {
            Ok(()) => {
                self.registry.finish_removal(device_id)?;
                info!(%device_id, drive = %device.drive_letter, "device removed");
                Ok(RemoveOutcome::Removed)
            }
            Err(DriverError::DeviceNotFound(_)) => {
                self.registry.finish_removal(device_id)?;
                warn!(
                    %device_id,
                    drive = %device.drive_letter,
                    "{}; registry entry purged",
                    VdiskError::StaleDevice(device_id)
                );
                Ok(RemoveOutcome::Stale)
            }
            Err(driver_error) => {
                self.registry.abort_removal(device_id);
                error!(%device_id, error = %driver_error, "device removal failed");
                Err(VdiskError::RemoveFailed {
                    device_id,
                    reason: driver_error.reason(),
                })
            }
        }
    }

    /// Remove every device the driver reports, including ones this process
    /// never registered. Failures are collected, never fatal.
    ///
    /// Registered devices go through the same state machine as `remove`, so
    /// devices another caller is creating or removing are skipped and
    /// reported as in flight.
    pub fn remove_all(&self) -> Result<RemoveAllReport> {
        let (active, registered) = {
            let _attaches = self.registry.hold_attaches();
            let active = self.driver.list_active_devices()?;
            let registered: BTreeSet<DeviceId> = self
                .registry
                .list_all()
                .into_iter()
                .map(|device| device.device_id)
                .collect();
            (active, registered)
        };
        let mut report = RemoveAllReport::default();

        for &device_id in &active {
            if registered.contains(&device_id) {
                self.remove_registered(device_id, &mut report);
            } else {
                self.remove_foreign(device_id, &mut report);
            }
        }

        let live: BTreeSet<DeviceId> = active.into_iter().collect();
        for &device_id in registered.difference(&live) {
            match self.registry.begin_removal(device_id) {
                Ok(_) => {
                    warn!(%device_id, "purging device the driver no longer reports");
                    self.settle_removal(device_id);
                    report.stale.push(device_id);
                }
                Err(VdiskError::NotFound(_)) => {}
                Err(error) => {
                    debug!(%device_id, %error, "leaving device busy elsewhere");
                    report.in_flight.push(device_id);
                }
            }
        }

        info!(
            removed = report.removed.len(),
            stale = report.stale.len(),
            failed = report.failed.len(),
            in_flight = report.in_flight.len(),
            "removed all devices"
        );
        Ok(report)
    }

    fn remove_registered(&self, device_id: DeviceId, report: &mut RemoveAllReport) {
        match self.registry.begin_removal(device_id) {
            Ok(_) => {}
            Err(VdiskError::NotFound(_)) => {
                debug!(%device_id, "device already removed by another caller");
                return;
            }
            Err(error) => {
                debug!(%device_id, %error, "leaving device busy elsewhere");
                report.in_flight.push(device_id);
                return;
            }
        }

        match self.driver.force_remove_device(device_id) {
            Ok(()) => {
                self.settle_removal(device_id);
                report.removed.push(device_id);
            }
            Err(DriverError::DeviceNotFound(_)) => {
                self.settle_removal(device_id);
                report.stale.push(device_id);
            }
            Err(driver_error) => {
                self.registry.abort_removal(device_id);
                warn!(%device_id, error = %driver_error, "failed to remove device");
                report.failed.push(RemovalFailure {
                    device_id,
                    reason: driver_error.reason(),
                });
            }
        }
    }

    fn remove_foreign(&self, device_id: DeviceId, report: &mut RemoveAllReport) {
        match self.driver.force_remove_device(device_id) {
            Ok(()) => {
                debug!(%device_id, "removed device not registered in this process");
                report.removed.push(device_id);
            }
            Err(DriverError::DeviceNotFound(_)) => report.stale.push(device_id),
            Err(driver_error) => {
                warn!(%device_id, error = %driver_error, "failed to remove device");
                report.failed.push(RemovalFailure {
                    device_id,
                    reason: driver_error.reason(),
                });
            }
        }
    }

    fn settle_removal(&self, device_id: DeviceId) {
        if let Err(error) = self.registry.finish_removal(device_id) {
            warn!(%device_id, %error, "failed to purge registry entry");
        }
    }

    /// Format a drive with the configured default options.
    pub fn format(&self, drive_letter: DriveLetter) -> Result<ExitResult> {
        let options = self.format_options.clone();
        self.format_with(drive_letter, &options)
    }

    /// Run the formatting utility against `drive_letter` and wait for it.
    pub fn format_with(&self, drive_letter: DriveLetter, options: &FormatOptions) -> Result<ExitResult> {
        let target = FormatTarget {
            drive_letter,
            mount_path: drive_letter.mount_path(&self.mount_root),
            device_id: self
                .registry
                .find_by_letter(drive_letter)
                .map(|device| device.device_id),
        };

        info!(drive = %drive_letter, filesystem = %options.filesystem, quick = options.quick, "formatting drive");
        match self.formatter.format(&target, options) {
            Ok(exit) if exit.success() => {
                info!(drive = %drive_letter, "format complete");
                Ok(exit)
            }
            Ok(exit) => {
                error!(drive = %drive_letter, exit_code = exit.code, "format utility failed");
                Err(VdiskError::FormatFailed {
                    exit_code: exit.code,
                })
            }
            Err(CommandError::TimedOut { timeout, .. }) => {
                error!(drive = %drive_letter, ?timeout, "format utility timed out");
                Err(VdiskError::FormatTimedOut)
            }
            Err(command_error) => {
                error!(drive = %drive_letter, error = %command_error, "format utility could not run");
                Err(VdiskError::Format(command_error.to_string()))
            }
        }
    }

    pub fn lookup(&self, device_id: DeviceId) -> Option<VirtualDevice> {
        self.registry.lookup(device_id)
    }

    pub fn list(&self) -> Vec<VirtualDevice> {
        self.registry.list_all()
    }
}

fn attach_failure(kind: BackingKind, error: &DriverError) -> VdiskError {
    let reason = error.reason();
    match kind {
        BackingKind::ImageFile => VdiskError::MountFailed { reason },
        BackingKind::Memory => VdiskError::CreateFailed { reason },
    }
}
