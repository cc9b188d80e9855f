// SPDX-License-Identifier: GPL-3.0-only

//! Moving gzip payloads on and off the scratch drive

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;
use vdisk_types::DriveLetter;

use crate::compression;
use crate::context::VdiskContext;
use crate::error::{Result, VdiskError};
use crate::registry::DeviceRegistry;

pub struct ContentTransfer {
    registry: Arc<DeviceRegistry>,
    scratch_drive: DriveLetter,
    mount_root: PathBuf,
}

impl ContentTransfer {
    pub fn new(context: &VdiskContext) -> Self {
        Self {
            registry: Arc::clone(&context.registry),
            scratch_drive: context.config.scratch_drive,
            mount_root: context.config.mount_root.clone(),
        }
    }

    pub fn scratch_drive(&self) -> DriveLetter {
        self.scratch_drive
    }

    /// Decompress `compressed` and store it as a new uniquely named file on
    /// the scratch drive. Returns the path written.
    pub fn write_compressed_payload(&self, compressed: &[u8]) -> Result<PathBuf> {
        let scratch = self.scratch_root()?;
        let payload = compression::decompress(compressed)?;

        let path = scratch.join(format!("{}.bin", Uuid::new_v4()));
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.write_all(&payload)?;
        file.sync_all()?;

        info!(
            path = %path.display(),
            compressed = compressed.len(),
            bytes = payload.len(),
            "payload written to scratch drive"
        );
        Ok(path)
    }

    /// Read any file and return its contents gzip-compressed.
    pub fn read_compressed_payload(&self, path: &Path) -> Result<Vec<u8>> {
        let contents = fs::read(path)?;
        let compressed = compression::compress(&contents)?;
        debug!(
            path = %path.display(),
            bytes = contents.len(),
            compressed = compressed.len(),
            "payload read"
        );
        Ok(compressed)
    }

    fn scratch_root(&self) -> Result<PathBuf> {
        match self.registry.find_by_letter(self.scratch_drive) {
            Some(device) if device.is_mounted() => Ok(self.scratch_drive.mount_path(&self.mount_root)),
            _ => Err(VdiskError::NoScratchDevice(self.scratch_drive)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::ErrorKind;

    use tempfile::TempDir;
    use vdisk_testing::{FakeDriver, FakeFormatter, FakeNamespace};
    use vdisk_types::{BackingKind, DeviceId, DeviceState, VirtualDevice};

    use super::*;
    use crate::config::VdiskConfig;

    fn transfer(dir: &TempDir) -> (ContentTransfer, Arc<DeviceRegistry>) {
        let namespace = Arc::new(FakeNamespace::default());
        let config = VdiskConfig {
            mount_root: dir.path().to_path_buf(),
            ..VdiskConfig::default()
        };
        let context = VdiskContext::new(
            config,
            Arc::new(FakeDriver::new(namespace.clone())),
            namespace,
            Arc::new(FakeFormatter::exiting(0)),
        );
        (ContentTransfer::new(&context), Arc::clone(&context.registry))
    }

    fn mount_scratch(dir: &TempDir, registry: &DeviceRegistry, drive: DriveLetter) {
        registry
            .insert(VirtualDevice {
                device_id: DeviceId(1),
                drive_letter: drive,
                backing_kind: BackingKind::Memory,
                capacity_bytes: 1_048_576,
                read_only: false,
                image_path: None,
                state: DeviceState::Mounted,
            })
            .expect("insert");
        fs::create_dir_all(drive.mount_path(dir.path())).expect("mount dir");
    }

    #[test]
    fn payload_lands_on_scratch_drive_and_reads_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (transfer, registry) = transfer(&dir);
        mount_scratch(&dir, &registry, transfer.scratch_drive());

        let original = b"boot sector contents".repeat(64);
        let compressed = compression::compress(&original).expect("compress");

        let path = transfer.write_compressed_payload(&compressed).expect("write");
        assert!(path.starts_with(transfer.scratch_drive().mount_path(dir.path())));
        assert_eq!(path.extension().and_then(|ext| ext.to_str()), Some("bin"));
        assert_eq!(fs::read(&path).expect("read"), original);

        let read_back = transfer.read_compressed_payload(&path).expect("read payload");
        assert_eq!(compression::decompress(&read_back).expect("decompress"), original);
    }

    #[test]
    fn each_write_gets_a_new_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (transfer, registry) = transfer(&dir);
        mount_scratch(&dir, &registry, transfer.scratch_drive());
        let compressed = compression::compress(b"same").expect("compress");

        let first = transfer.write_compressed_payload(&compressed).expect("write");
        let second = transfer.write_compressed_payload(&compressed).expect("write");
        assert_ne!(first, second);
    }

    #[test]
    fn missing_scratch_drive_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (transfer, _registry) = transfer(&dir);
        let compressed = compression::compress(b"data").expect("compress");

        assert!(matches!(
            transfer.write_compressed_payload(&compressed),
            Err(VdiskError::NoScratchDevice(drive)) if drive == transfer.scratch_drive()
        ));
    }

    #[test]
    fn garbage_payload_writes_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (transfer, registry) = transfer(&dir);
        mount_scratch(&dir, &registry, transfer.scratch_drive());

        assert!(matches!(
            transfer.write_compressed_payload(b"not gzip at all"),
            Err(VdiskError::DecompressionError(_))
        ));
        let scratch = transfer.scratch_drive().mount_path(dir.path());
        assert_eq!(fs::read_dir(scratch).expect("list").count(), 0);
    }

    #[test]
    fn reading_a_missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (transfer, _registry) = transfer(&dir);

        match transfer.read_compressed_payload(&dir.path().join("absent.bin")) {
            Err(VdiskError::Io(error)) => assert_eq!(error.kind(), ErrorKind::NotFound),
            other => panic!("expected Io error, got {other:?}"),
        }
    }
}
