// SPDX-License-Identifier: GPL-3.0-only

use std::sync::Arc;

use vdisk_contracts::{BlockDeviceDriver, DriveNamespace, FormatUtility};

use crate::config::VdiskConfig;
use crate::registry::DeviceRegistry;

/// Everything the manager needs, built once at startup.
///
/// Components borrow the context at construction and clone the `Arc`s they
/// keep, so several managers can share one registry.
#[derive(Clone)]
pub struct VdiskContext {
    pub config: VdiskConfig,
    pub driver: Arc<dyn BlockDeviceDriver>,
    pub namespace: Arc<dyn DriveNamespace>,
    pub formatter: Arc<dyn FormatUtility>,
    pub registry: Arc<DeviceRegistry>,
}

impl VdiskContext {
    pub fn new(
        config: VdiskConfig,
        driver: Arc<dyn BlockDeviceDriver>,
        namespace: Arc<dyn DriveNamespace>,
        formatter: Arc<dyn FormatUtility>,
    ) -> Self {
        Self::with_registry(
            config,
            driver,
            namespace,
            formatter,
            Arc::new(DeviceRegistry::new()),
        )
    }

    pub fn with_registry(
        config: VdiskConfig,
        driver: Arc<dyn BlockDeviceDriver>,
        namespace: Arc<dyn DriveNamespace>,
        formatter: Arc<dyn FormatUtility>,
        registry: Arc<DeviceRegistry>,
    ) -> Self {
        Self {
            config,
            driver,
            namespace,
            formatter,
            registry,
        }
    }
}
