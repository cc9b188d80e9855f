// SPDX-License-Identifier: GPL-3.0-only

#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;
use vdisk_contracts::FormatUtility;
use vdisk_manager::{ContentTransfer, DeviceManager, VdiskConfig, VdiskContext};
use vdisk_testing::{FakeDriver, FakeFormatter, FakeNamespace};
use vdisk_types::DriveLetter;

pub struct Bed {
    pub dir: TempDir,
    pub namespace: Arc<FakeNamespace>,
    pub driver: Arc<FakeDriver>,
    pub context: VdiskContext,
}

impl Bed {
    pub fn manager(&self) -> DeviceManager {
        DeviceManager::new(&self.context)
    }

    pub fn transfer(&self) -> ContentTransfer {
        ContentTransfer::new(&self.context)
    }

    pub fn image(&self, name: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        fs::write(&path, vec![0u8; 4096]).expect("write image");
        path
    }
}

pub fn bed() -> Bed {
    bed_with_formatter(Arc::new(FakeFormatter::exiting(0)))
}

pub fn bed_with_formatter(formatter: Arc<dyn FormatUtility>) -> Bed {
    let dir = tempfile::tempdir().expect("tempdir");
    let namespace = Arc::new(FakeNamespace::default());
    let driver = Arc::new(FakeDriver::new(Arc::clone(&namespace)));

    let config = VdiskConfig {
        mount_root: dir.path().join("drives"),
        state_dir: dir.path().join("state"),
        settle_timeout_ms: 100,
        settle_poll_ms: 5,
        ..VdiskConfig::default()
    };
    let context = VdiskContext::new(config, driver.clone(), namespace.clone(), formatter);

    Bed {
        dir,
        namespace,
        driver,
        context,
    }
}

pub fn letter(value: &str) -> DriveLetter {
    value.parse().expect("letter")
}
