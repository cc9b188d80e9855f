// SPDX-License-Identifier: GPL-3.0-only

//! Drive-letter occupancy as seen by the operating system
//!
//! On Unix a letter is a directory directly below the mount root; it is
//! occupied while something is mounted there, whoever mounted it. On Windows
//! a letter is occupied while its volume root exists.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use tracing::trace;
use vdisk_contracts::{DriveNamespace, DriverError};
use vdisk_types::DriveLetter;

use crate::error::SysError;

#[cfg(not(windows))]
const MOUNTINFO_PATH: &str = "/proc/self/mountinfo";

/// Reads the live mount table on every query
#[derive(Debug, Clone)]
pub struct MountTableNamespace {
    mount_root: PathBuf,
}

impl MountTableNamespace {
    pub fn new(mount_root: impl Into<PathBuf>) -> Self {
        Self {
            mount_root: mount_root.into(),
        }
    }

    pub fn mount_root(&self) -> &Path {
        &self.mount_root
    }

    #[cfg(windows)]
    fn read_occupied(&self) -> Result<BTreeSet<DriveLetter>, SysError> {
        Ok(DriveLetter::all()
            .filter(|letter| letter.mount_path(&self.mount_root).exists())
            .collect())
    }

    #[cfg(not(windows))]
    fn read_occupied(&self) -> Result<BTreeSet<DriveLetter>, SysError> {
        let mount_info = std::fs::read_to_string(MOUNTINFO_PATH)?;
        let mount_points = parse_mount_points(&mount_info)?;
        Ok(letters_under(&self.mount_root, &mount_points))
    }
}

impl DriveNamespace for MountTableNamespace {
    fn occupied(&self) -> Result<BTreeSet<DriveLetter>, DriverError> {
        let occupied = self.read_occupied()?;
        trace!(count = occupied.len(), root = %self.mount_root.display(), "drive letters in use");
        Ok(occupied)
    }
}

/// Letters whose mount directory sits directly below `root`.
pub fn letters_under(root: &Path, mount_points: &[PathBuf]) -> BTreeSet<DriveLetter> {
    mount_points
        .iter()
        .filter(|mount| mount.parent() == Some(root))
        .filter_map(|mount| mount.file_name()?.to_str())
        .filter_map(DriveLetter::from_mount_dir_name)
        .collect()
}

/// Mount points listed in a `/proc/self/mountinfo` dump.
pub fn parse_mount_points(input: &str) -> Result<Vec<PathBuf>, SysError> {
    let mut mounts = Vec::new();

    for line in input.lines().filter(|line| !line.trim().is_empty()) {
        let (left, _) = line
            .split_once(" - ")
            .ok_or_else(|| SysError::InvalidMountInfoLine(line.to_string()))?;

        let mount_point = left
            .split_whitespace()
            .nth(4)
            .ok_or_else(|| SysError::InvalidMountInfoLine(line.to_string()))?;

        mounts.push(PathBuf::from(unescape_mount_field(mount_point)));
    }

    Ok(mounts)
}

fn unescape_mount_field(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut output = Vec::with_capacity(bytes.len());
    let mut index = 0;

    while index < bytes.len() {
        if bytes[index] == b'\\'
            && index + 3 < bytes.len()
            && bytes[index + 1..index + 4].iter().all(u8::is_ascii_digit)
        {
            if let Ok(num) = u8::from_str_radix(&value[index + 1..index + 4], 8) {
                output.push(num);
                index += 4;
                continue;
            }
        }

        output.push(bytes[index]);
        index += 1;
    }

    // Escaped bytes may be pieces of one multi-byte character.
    String::from_utf8_lossy(&output).into_owned()
}
