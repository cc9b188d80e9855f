// SPDX-License-Identifier: GPL-3.0-only

use vdisk_types::{DeviceId, DeviceRequest, DriveLetter};

use crate::DriverError;

/// Binding to the driver that backs virtual devices with memory or image files.
pub trait BlockDeviceDriver: Send + Sync {
    /// Create and expose a device, returning the id the driver assigned.
    fn create_device(&self, request: &DeviceRequest) -> Result<DeviceId, DriverError>;

    /// Tear a device down even if it is still in use.
    ///
    /// Reports `DriverError::DeviceNotFound` when the driver has no such device.
    fn force_remove_device(&self, device_id: DeviceId) -> Result<(), DriverError>;

    /// Devices the driver currently has, which may include devices created by
    /// an earlier process.
    fn list_active_devices(&self) -> Result<Vec<DeviceId>, DriverError>;

    fn find_free_drive_letter(&self) -> Result<DriveLetter, DriverError>;
}
