// SPDX-License-Identifier: GPL-3.0-only

//! XML serialization helpers

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Result, VdiskError};

pub fn to_xml<T: Serialize>(value: &T) -> Result<String> {
    quick_xml::se::to_string(value).map_err(|error| VdiskError::Serialization(error.to_string()))
}

pub fn from_xml<T: DeserializeOwned>(xml: &str) -> Result<T> {
    quick_xml::de::from_str(xml).map_err(|error| VdiskError::Serialization(error.to_string()))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use vdisk_types::{BackingKind, DeviceId, DeviceState, VirtualDevice};

    use super::*;
    use crate::registry::RegistrySnapshot;

    fn image_device() -> VirtualDevice {
        VirtualDevice {
            device_id: DeviceId(7),
            drive_letter: "S".parse().expect("letter"),
            backing_kind: BackingKind::ImageFile,
            capacity_bytes: 0,
            read_only: true,
            image_path: Some(PathBuf::from("/srv/images/boot.img")),
            state: DeviceState::Mounted,
        }
    }

    fn memory_device() -> VirtualDevice {
        VirtualDevice {
            device_id: DeviceId(2),
            drive_letter: "R".parse().expect("letter"),
            backing_kind: BackingKind::Memory,
            capacity_bytes: 512 * 1_048_576,
            read_only: false,
            image_path: None,
            state: DeviceState::Mounted,
        }
    }

    #[test]
    fn device_round_trips() {
        for device in [image_device(), memory_device()] {
            let xml = to_xml(&device).expect("serialize");
            let parsed: VirtualDevice = from_xml(&xml).expect("deserialize");
            assert_eq!(parsed, device);
        }
    }

    #[test]
    fn snapshot_round_trips() {
        let snapshot = RegistrySnapshot {
            devices: vec![memory_device(), image_device()],
        };
        let xml = to_xml(&snapshot).expect("serialize");
        assert!(xml.contains("<device>"));

        let parsed: RegistrySnapshot = from_xml(&xml).expect("deserialize");
        assert_eq!(parsed, snapshot);
    }

    #[test]
    fn empty_snapshot_round_trips() {
        let xml = to_xml(&RegistrySnapshot::default()).expect("serialize");
        let parsed: RegistrySnapshot = from_xml(&xml).expect("deserialize");
        assert!(parsed.devices.is_empty());
    }

    #[test]
    fn malformed_xml_is_a_serialization_error() {
        let result: Result<VirtualDevice> = from_xml("<VirtualDevice><device_id>");
        assert!(matches!(result, Err(VdiskError::Serialization(_))));
    }
}
