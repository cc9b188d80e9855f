// SPDX-License-Identifier: GPL-3.0-only

//! Registry persistence between invocations

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info};
use vdisk_manager::serialization::{from_xml, to_xml};
use vdisk_manager::{DeviceRegistry, RegistrySnapshot};

/// Load the snapshot at `path` into `registry`. A missing file is an empty
/// registry.
pub(crate) fn restore(registry: &DeviceRegistry, path: &Path) -> Result<usize> {
    if !path.exists() {
        debug!(path = %path.display(), "no registry snapshot");
        return Ok(0);
    }

    let xml = fs::read_to_string(path)
        .with_context(|| format!("failed to read registry snapshot {}", path.display()))?;
    let snapshot: RegistrySnapshot = from_xml(&xml)
        .with_context(|| format!("failed to parse registry snapshot {}", path.display()))?;
    let restored = registry.restore(snapshot)?;

    info!(path = %path.display(), devices = restored, "registry restored");
    Ok(restored)
}

/// Write the registry to `path`, replacing any previous snapshot atomically.
pub(crate) fn save(registry: &DeviceRegistry, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create state directory {}", parent.display()))?;
    }

    let xml = to_xml(&registry.snapshot())?;
    let tmp_path = path.with_extension("xml.tmp");
    fs::write(&tmp_path, xml)
        .with_context(|| format!("failed to write {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to replace {}", path.display()))?;

    debug!(path = %path.display(), devices = registry.len(), "registry saved");
    Ok(())
}
