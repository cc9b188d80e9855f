// SPDX-License-Identifier: GPL-3.0-only

//! Loop-device backed block-device driver
//!
//! Memory-backed devices are sparse files in a tmpfs directory attached with
//! `losetup` and given a fresh file system; image-backed devices attach the
//! image itself. Both are mounted at the drive letter's mount path.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use vdisk_contracts::{BlockDeviceDriver, CommandRunner, DriveNamespace, DriverError};
use vdisk_types::{BackingKind, CapturedOutput, DeviceId, DeviceRequest, DriveLetter};

use crate::command::SystemCommandRunner;
use crate::error::{Result, SysError};
use crate::ledger::{Ledger, LedgerEntry};
use crate::namespace::MountTableNamespace;

const LOOP_PREFIX: &str = "/dev/loop";

/// Paths and limits used by `LoopDeviceDriver`
#[derive(Debug, Clone)]
pub struct LoopDriverOptions {
    pub mount_root: PathBuf,
    /// tmpfs directory holding memory-backed device files
    pub memory_dir: PathBuf,
    /// Where the ledger lives
    pub state_dir: PathBuf,
    pub allocation_start: DriveLetter,
    pub command_timeout: Duration,
    /// File system put on memory devices before they are mounted
    pub memory_filesystem: String,
}

pub struct LoopDeviceDriver {
    options: LoopDriverOptions,
    losetup: PathBuf,
    runner: Arc<dyn CommandRunner>,
    namespace: Arc<dyn DriveNamespace>,
    ledger: Ledger,
    // Serializes ledger read-modify-write within this process.
    guard: Mutex<()>,
}

impl LoopDeviceDriver {
    /// Create a driver, failing if `losetup` is not installed.
    pub fn new(options: LoopDriverOptions) -> Result<Self> {
        let losetup =
            which::which("losetup").map_err(|_| SysError::ToolNotFound("losetup".to_string()))?;
        info!("Found losetup binary at {:?}", losetup);

        let namespace = Arc::new(MountTableNamespace::new(&options.mount_root));
        Ok(Self::with_collaborators(
            options,
            losetup,
            Arc::new(SystemCommandRunner::new()),
            namespace,
        ))
    }

    /// Create a driver around an explicit `losetup` path, command runner and
    /// namespace.
    pub fn with_collaborators(
        options: LoopDriverOptions,
        losetup: PathBuf,
        runner: Arc<dyn CommandRunner>,
        namespace: Arc<dyn DriveNamespace>,
    ) -> Self {
        Self {
            ledger: Ledger::new(&options.state_dir),
            losetup,
            runner,
            namespace,
            guard: Mutex::new(()),
            options,
        }
    }

    fn losetup(&self, args: Vec<String>) -> std::result::Result<CapturedOutput, DriverError> {
        let program = self.losetup.to_string_lossy().to_string();
        Ok(self
            .runner
            .capture(&program, &args, self.options.command_timeout)?)
    }

    fn run_tool(
        &self,
        program: &str,
        args: Vec<String>,
    ) -> std::result::Result<CapturedOutput, DriverError> {
        Ok(self
            .runner
            .capture(program, &args, self.options.command_timeout)?)
    }

    fn attach(&self, backing_file: &Path, read_only: bool) -> std::result::Result<DeviceId, DriverError> {
        let mut args = vec!["--find".to_string(), "--show".to_string()];
        if read_only {
            args.push("--read-only".to_string());
        }
        args.push(backing_file.display().to_string());

        let output = self.losetup(args)?;
        if !output.success() {
            return Err(DriverError::Rejected(format!(
                "losetup could not attach {}: {}",
                backing_file.display(),
                output.stderr.trim()
            )));
        }

        parse_loop_name(output.stdout.trim())
    }

    fn detach(&self, device_id: DeviceId) -> std::result::Result<(), DriverError> {
        let output = self.losetup(vec!["-d".to_string(), loop_path(device_id)])?;
        if output.success() {
            Ok(())
        } else {
            Err(DriverError::Rejected(format!(
                "losetup could not detach {}: {}",
                loop_path(device_id),
                output.stderr.trim()
            )))
        }
    }

    fn live_loop_devices(&self) -> std::result::Result<BTreeSet<DeviceId>, DriverError> {
        let output = self.losetup(vec![
            "--list".to_string(),
            "--noheadings".to_string(),
            "--raw".to_string(),
            "--output".to_string(),
            "NAME".to_string(),
        ])?;
        if !output.success() {
            return Err(DriverError::Rejected(format!(
                "losetup could not list devices: {}",
                output.stderr.trim()
            )));
        }
        parse_loop_list(&output.stdout)
    }

    fn create_memory_file(&self, request: &DeviceRequest) -> std::result::Result<PathBuf, DriverError> {
        fs::create_dir_all(&self.options.memory_dir)?;
        let path = self.options.memory_dir.join(format!(
            "vdisk-{}-{}.img",
            request.drive_letter.as_char(),
            uuid::Uuid::new_v4()
        ));
        let file = File::create(&path)?;
        file.set_len(request.capacity_bytes)?;
        debug!(path = %path.display(), bytes = request.capacity_bytes, "created memory backing file");
        Ok(path)
    }

    fn mount(
        &self,
        device_id: DeviceId,
        mount_path: &Path,
        read_only: bool,
    ) -> std::result::Result<(), DriverError> {
        fs::create_dir_all(mount_path)?;
        let mut args = Vec::new();
        if read_only {
            args.push("-o".to_string());
            args.push("ro".to_string());
        }
        args.push(loop_path(device_id));
        args.push(mount_path.display().to_string());

        let output = self.run_tool("mount", args)?;
        if output.success() {
            Ok(())
        } else {
            Err(DriverError::Rejected(format!(
                "mount of {} at {} failed: {}",
                loop_path(device_id),
                mount_path.display(),
                output.stderr.trim()
            )))
        }
    }

    fn unmount(&self, mount_path: &Path) -> std::result::Result<(), DriverError> {
        let output = self.run_tool("umount", vec![mount_path.display().to_string()])?;
        if output.success() {
            debug!(path = %mount_path.display(), "unmounted");
            Ok(())
        } else {
            Err(DriverError::Rejected(format!(
                "umount of {} failed with status {}: {}",
                mount_path.display(),
                output.exit.code,
                output.stderr.trim()
            )))
        }
    }

    /// Put a fresh file system on a memory device so it can be mounted.
    fn make_filesystem(&self, device_id: DeviceId) -> std::result::Result<(), DriverError> {
        let args = vec![
            "-t".to_string(),
            self.options.memory_filesystem.clone(),
            loop_path(device_id),
        ];
        let output = self.run_tool("mkfs", args)?;
        if output.success() {
            debug!(%device_id, filesystem = %self.options.memory_filesystem, "memory device formatted");
            Ok(())
        } else {
            Err(DriverError::Rejected(format!(
                "mkfs on {} failed: {}",
                loop_path(device_id),
                output.stderr.trim()
            )))
        }
    }

    /// Undo a half-finished `create_device`.
    fn abandon(&self, device_id: DeviceId, backing_file: &Path, owns_backing_file: bool) {
        if let Err(error) = self.detach(device_id) {
            warn!(%device_id, "failed to detach abandoned device: {}", error);
        }
        if owns_backing_file {
            let _ = fs::remove_file(backing_file);
        }
    }

    fn discard_backing_file(entry: &LedgerEntry) {
        if !entry.owns_backing_file {
            return;
        }
        if let Err(error) = fs::remove_file(&entry.backing_file) {
            warn!(
                path = %entry.backing_file.display(),
                "failed to delete memory backing file: {}",
                error
            );
        }
    }
}

impl BlockDeviceDriver for LoopDeviceDriver {
    fn create_device(&self, request: &DeviceRequest) -> std::result::Result<DeviceId, DriverError> {
        let _guard = self.guard.lock();

        let (backing_file, owns_backing_file) = match request.backing_kind {
            BackingKind::Memory => (self.create_memory_file(request)?, true),
            BackingKind::ImageFile => {
                let image = request.image_path.clone().ok_or_else(|| {
                    DriverError::Rejected("image-backed device needs an image path".to_string())
                })?;
                (image, false)
            }
        };

        let device_id = match self.attach(&backing_file, request.read_only) {
            Ok(device_id) => device_id,
            Err(error) => {
                if owns_backing_file {
                    let _ = fs::remove_file(&backing_file);
                }
                return Err(error);
            }
        };

        if request.backing_kind == BackingKind::Memory {
            if let Err(error) = self.make_filesystem(device_id) {
                self.abandon(device_id, &backing_file, owns_backing_file);
                return Err(error);
            }
        }

        let mount_path = request.drive_letter.mount_path(&self.options.mount_root);
        if let Err(error) = self.mount(device_id, &mount_path, request.read_only) {
            self.abandon(device_id, &backing_file, owns_backing_file);
            return Err(error);
        }

        let entry = LedgerEntry {
            drive_letter: request.drive_letter,
            backing_kind: request.backing_kind,
            backing_file: backing_file.clone(),
            owns_backing_file,
            mount_path: Some(mount_path.clone()),
        };
        if let Err(record_error) = self.ledger.record(device_id, entry) {
            error!(%device_id, error = %record_error, "could not record device, tearing it down");
            if let Err(unmount_error) = self.unmount(&mount_path) {
                warn!(%device_id, "failed to unmount unrecorded device: {}", unmount_error);
            }
            self.abandon(device_id, &backing_file, owns_backing_file);
            return Err(record_error.into());
        }

        info!(%device_id, drive = %request.drive_letter, kind = %request.backing_kind, "loop device attached");
        Ok(device_id)
    }

    fn force_remove_device(&self, device_id: DeviceId) -> std::result::Result<(), DriverError> {
        let _guard = self.guard.lock();

        let entry = self.ledger.load()?.devices.get(&device_id).cloned();
        let live = self.live_loop_devices()?;

        let Some(entry) = entry else {
            return Err(DriverError::DeviceNotFound(device_id));
        };

        if !live.contains(&device_id) {
            self.ledger.forget(device_id)?;
            Self::discard_backing_file(&entry);
            return Err(DriverError::DeviceNotFound(device_id));
        }

        let mount_path = entry
            .mount_path
            .clone()
            .unwrap_or_else(|| entry.drive_letter.mount_path(&self.options.mount_root));
        if self.namespace.is_occupied(entry.drive_letter)? {
            self.unmount(&mount_path)?;
        }

        self.detach(device_id)?;
        self.ledger.forget(device_id)?;
        Self::discard_backing_file(&entry);

        info!(%device_id, "loop device detached");
        Ok(())
    }

    fn list_active_devices(&self) -> std::result::Result<Vec<DeviceId>, DriverError> {
        let live = self.live_loop_devices()?;
        let owned = self.ledger.load()?;
        Ok(owned
            .devices
            .keys()
            .filter(|device_id| live.contains(device_id))
            .copied()
            .collect())
    }

    fn find_free_drive_letter(&self) -> std::result::Result<DriveLetter, DriverError> {
        let mut occupied = self.namespace.occupied()?;
        occupied.extend(
            self.ledger
                .load()?
                .devices
                .values()
                .map(|entry| entry.drive_letter),
        );
        DriveLetter::first_free(&occupied, self.options.allocation_start)
            .ok_or(DriverError::NoFreeDriveLetter)
    }
}

fn loop_path(device_id: DeviceId) -> String {
    format!("{LOOP_PREFIX}{device_id}")
}

/// Parse a loop device node name such as `/dev/loop7`.
pub fn parse_loop_name(name: &str) -> std::result::Result<DeviceId, DriverError> {
    name.strip_prefix(LOOP_PREFIX)
        .filter(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|digits| digits.parse::<u32>().ok())
        .map(DeviceId)
        .ok_or_else(|| DriverError::MalformedDeviceListEntry(name.to_string()))
}

/// Parse `losetup --list --noheadings --raw --output NAME` output.
pub fn parse_loop_list(output: &str) -> std::result::Result<BTreeSet<DeviceId>, DriverError> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(parse_loop_name)
        .collect()
}

#[cfg(test)]
mod tests {
    use vdisk_testing::{FakeNamespace, ScriptedRunner};
    use vdisk_types::BYTES_PER_MEGABYTE;

    use super::*;

    fn options(dir: &Path) -> LoopDriverOptions {
        LoopDriverOptions {
            mount_root: dir.join("drives"),
            memory_dir: dir.join("memory"),
            state_dir: dir.join("state"),
            allocation_start: "D".parse().expect("letter"),
            command_timeout: Duration::from_secs(5),
            memory_filesystem: "ext4".to_string(),
        }
    }

    fn driver(
        options: LoopDriverOptions,
        runner: &Arc<ScriptedRunner>,
        namespace: FakeNamespace,
    ) -> LoopDeviceDriver {
        LoopDeviceDriver::with_collaborators(
            options,
            PathBuf::from("losetup"),
            runner.clone(),
            Arc::new(namespace),
        )
    }

    fn programs(runner: &ScriptedRunner) -> Vec<String> {
        runner.calls().into_iter().map(|call| call.command).collect()
    }

    /// Record loop7 as a mounted memory device on R and return its backing file.
    fn recorded_device(options: &LoopDriverOptions) -> PathBuf {
        let drive: DriveLetter = "R".parse().expect("letter");
        let backing_file = options.state_dir.join("R.img");
        fs::create_dir_all(&options.state_dir).expect("state dir");
        fs::write(&backing_file, b"").expect("backing file");
        Ledger::new(&options.state_dir)
            .record(
                DeviceId(7),
                LedgerEntry {
                    drive_letter: drive,
                    backing_kind: BackingKind::Memory,
                    backing_file: backing_file.clone(),
                    owns_backing_file: true,
                    mount_path: Some(drive.mount_path(&options.mount_root)),
                },
            )
            .expect("record");
        backing_file
    }

    #[test]
    fn device_that_cannot_be_recorded_is_torn_down() {
        let dir = tempfile::tempdir().expect("tempdir");
        let options = options(dir.path());
        fs::write(&options.state_dir, "not a directory").expect("block state dir");
        let runner = Arc::new(ScriptedRunner::default());
        runner.push(0, "/dev/loop7\n");
        let driver = driver(options.clone(), &runner, FakeNamespace::default());

        let request = DeviceRequest::memory("R".parse().expect("letter"), 4 * BYTES_PER_MEGABYTE);
        assert!(matches!(
            driver.create_device(&request),
            Err(DriverError::Rejected(reason)) if reason.contains("ledger")
        ));

        assert_eq!(programs(&runner), vec!["losetup", "mkfs", "mount", "umount", "losetup"]);
        let detach = runner.calls().pop().expect("detach call");
        assert_eq!(detach.args, vec!["-d", "/dev/loop7"]);
        let leftovers = fs::read_dir(&options.memory_dir).expect("memory dir").count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn busy_mount_blocks_removal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let options = options(dir.path());
        let backing_file = recorded_device(&options);
        let runner = Arc::new(ScriptedRunner::default());
        runner.push(0, "/dev/loop7\n");
        runner.push(32, "");
        let driver = driver(options.clone(), &runner, FakeNamespace::with_occupied(["R"]));

        assert!(matches!(
            driver.force_remove_device(DeviceId(7)),
            Err(DriverError::Rejected(reason)) if reason.contains("umount")
        ));

        assert_eq!(programs(&runner), vec!["losetup", "umount"]);
        let ledger = Ledger::new(&options.state_dir).load().expect("load");
        assert!(ledger.devices.contains_key(&DeviceId(7)));
        assert!(backing_file.exists());
    }

    #[test]
    fn removal_unmounts_detaches_and_forgets() {
        let dir = tempfile::tempdir().expect("tempdir");
        let options = options(dir.path());
        let backing_file = recorded_device(&options);
        let runner = Arc::new(ScriptedRunner::default());
        runner.push(0, "/dev/loop7\n");
        let driver = driver(options.clone(), &runner, FakeNamespace::with_occupied(["R"]));

        driver.force_remove_device(DeviceId(7)).expect("remove");

        assert_eq!(programs(&runner), vec!["losetup", "umount", "losetup"]);
        assert_eq!(runner.calls()[2].args, vec!["-d", "/dev/loop7"]);
        let ledger = Ledger::new(&options.state_dir).load().expect("load");
        assert!(ledger.devices.is_empty());
        assert!(!backing_file.exists());
    }

    #[test]
    fn parses_loop_device_names() {
        assert_eq!(parse_loop_name("/dev/loop0").expect("parse"), DeviceId(0));
        assert_eq!(parse_loop_name("/dev/loop17").expect("parse"), DeviceId(17));
    }

    #[test]
    fn rejects_unexpected_device_names() {
        for name in ["/dev/sda", "/dev/loop", "/dev/loop-control", "/dev/loop1p2", "loop3"] {
            match parse_loop_name(name) {
                Err(DriverError::MalformedDeviceListEntry(entry)) => assert_eq!(entry, name),
                other => panic!("expected malformed entry for {name}, got {other:?}"),
            }
        }
    }

    #[test]
    fn parses_listing_and_skips_blank_lines() {
        let ids = parse_loop_list("/dev/loop3\n\n/dev/loop0\n").expect("parse");
        assert_eq!(ids, BTreeSet::from([DeviceId(0), DeviceId(3)]));
    }

    #[test]
    fn one_bad_listing_row_fails_the_listing() {
        let result = parse_loop_list("/dev/loop3\n/dev/nbd0\n");
        assert!(matches!(
            result,
            Err(DriverError::MalformedDeviceListEntry(entry)) if entry == "/dev/nbd0"
        ));
    }
}
