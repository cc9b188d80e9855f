// SPDX-License-Identifier: GPL-3.0-only

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{bed, bed_with_formatter, letter};
use vdisk_contracts::DriverError;
use vdisk_manager::{RemoveOutcome, VdiskError};
use vdisk_testing::ScriptedRunner;
use vdisk_types::{BackingKind, DeviceId, DeviceState, FormatOptions};

#[test]
fn mounted_image_is_listed_until_removed() {
    let bed = bed();
    let manager = bed.manager();
    let image = bed.image("data.img");

    let id = manager.mount_from_image(letter("E"), &image).expect("mount");
    let device = manager.lookup(id).expect("registered");
    assert_eq!(device.state, DeviceState::Mounted);
    assert_eq!(device.backing_kind, BackingKind::ImageFile);

    assert_eq!(manager.remove(id).expect("remove"), RemoveOutcome::Removed);
    assert!(matches!(manager.remove(id), Err(VdiskError::NotFound(_))));
    assert!(bed.driver.active().is_empty());
}

#[test]
fn read_only_mount_is_recorded() {
    let bed = bed();
    let manager = bed.manager();
    let image = bed.image("iso.img");

    let id = manager
        .mount_from_image_with(letter("F"), &image, true)
        .expect("mount");
    assert!(manager.lookup(id).expect("registered").read_only);
}

#[test]
fn driver_rejection_leaves_registry_unchanged() {
    let bed = bed();
    let manager = bed.manager();
    let image = bed.image("data.img");
    bed.driver.fail_next_create("device table full");

    assert!(matches!(
        manager.mount_from_image(letter("E"), &image),
        Err(VdiskError::MountFailed { .. })
    ));
    assert!(manager.list().is_empty());
    assert!(bed.driver.active().is_empty());
}

#[test]
fn zero_megabytes_never_reaches_the_driver() {
    let bed = bed();
    let manager = bed.manager();

    assert!(matches!(
        manager.create_memory_backed(letter("R"), 0),
        Err(VdiskError::InvalidSize { size_megabytes: 0 })
    ));
    assert!(manager.list().is_empty());
    assert_eq!(bed.driver.create_calls(), 0);
}

#[test]
fn concurrent_mounts_on_one_letter_never_share_it() {
    let bed = bed();
    bed.driver.set_create_delay(Duration::from_millis(20));
    let image = bed.image("shared.img");
    let manager = Arc::new(bed.manager());

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let manager = Arc::clone(&manager);
            let image = image.clone();
            thread::spawn(move || manager.mount_from_image(letter("E"), &image))
        })
        .collect();

    let ids: Vec<DeviceId> = handles
        .into_iter()
        .filter_map(|handle| handle.join().expect("thread").ok())
        .collect();
    assert!(!ids.is_empty());

    let letters: BTreeSet<_> = manager
        .list()
        .iter()
        .map(|device| device.drive_letter)
        .collect();
    assert_eq!(letters.len(), ids.len());
    assert_eq!(manager.list().len(), ids.len());
}

#[test]
fn remove_all_reports_exactly_the_failed_devices() {
    let bed = bed();
    let manager = bed.manager();
    for drive in ["D", "E", "F", "G", "H", "I", "J"] {
        manager
            .create_memory_backed(letter(drive), 1)
            .expect("create");
    }
    bed.driver.fail_removal(DeviceId(2), "busy");
    bed.driver.fail_removal(DeviceId(5), "open handles");

    let report = manager.remove_all().expect("remove all");

    let failed: BTreeSet<DeviceId> = report.failed.iter().map(|f| f.device_id).collect();
    assert_eq!(failed, BTreeSet::from([DeviceId(2), DeviceId(5)]));
    assert_eq!(report.removed.len(), 5);
    assert_eq!(bed.driver.active(), vec![DeviceId(2), DeviceId(5)]);
}

#[test]
fn device_list_entries_are_validated() {
    let error = vdisk_sys::loop_driver::parse_loop_list("/dev/loop0\n/dev/nbd0\n")
        .expect_err("nbd is not a loop device");
    assert!(matches!(error, DriverError::MalformedDeviceListEntry(_)));

    let error: VdiskError = error.into();
    assert!(matches!(
        error,
        VdiskError::MalformedDeviceListEntry(entry) if entry == "/dev/nbd0"
    ));
}

#[test]
fn format_renders_the_configured_command() {
    let runner = Arc::new(ScriptedRunner::with_exits([0]));
    let command = vdisk_sys::FormatCommand {
        program: "mkfs".to_string(),
        args: vec![
            "-t".to_string(),
            "{fs}".to_string(),
            "/dev/loop{device_id}".to_string(),
        ],
        quick_flag: None,
        timeout_secs: 30,
        remount: false,
    };
    let formatter = Arc::new(vdisk_sys::SystemFormatter::new(command, runner.clone()));
    let bed = bed_with_formatter(formatter);
    let manager = bed.manager();
    let id = manager.create_memory_backed(letter("R"), 8).expect("create");

    let options = FormatOptions {
        filesystem: "ext4".to_string(),
        quick: true,
        label: None,
    };
    manager.format_with(letter("R"), &options).expect("format");

    let calls = runner.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].command, "mkfs");
    assert_eq!(calls[0].args, vec!["-t", "ext4", format!("/dev/loop{id}").as_str()]);
    assert_eq!(calls[0].timeout, Duration::from_secs(30));
}

#[cfg(unix)]
mod real_commands {
    use std::time::Instant;

    use vdisk_sys::{FormatCommand, SystemCommandRunner, SystemFormatter};

    use super::*;

    fn shell_formatter(script: &str, timeout_secs: u64) -> Arc<SystemFormatter> {
        let command = FormatCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            quick_flag: None,
            timeout_secs,
            remount: false,
        };
        Arc::new(SystemFormatter::new(
            command,
            Arc::new(SystemCommandRunner::new()),
        ))
    }

    #[test]
    fn failing_utility_reports_its_exit_code() {
        let bed = bed_with_formatter(shell_formatter("exit 1", 10));
        let started = Instant::now();

        assert!(matches!(
            bed.manager().format(letter("R")),
            Err(VdiskError::FormatFailed { exit_code: 1 })
        ));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn hung_utility_is_killed_at_the_timeout() {
        let bed = bed_with_formatter(shell_formatter("exec sleep 30", 1));
        let started = Instant::now();

        assert!(matches!(
            bed.manager().format(letter("R")),
            Err(VdiskError::FormatTimedOut)
        ));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn successful_utility_returns_zero() {
        let bed = bed_with_formatter(shell_formatter("exit 0", 10));
        let exit = bed.manager().format(letter("R")).expect("format");
        assert_eq!(exit.code, 0);
    }
}
