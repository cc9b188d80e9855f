// SPDX-License-Identifier: GPL-3.0-only

//! Startup configuration
//!
//! Read once from a TOML file. Every key is optional; a missing file yields
//! the defaults. An unusable `port` falls back to [`DEFAULT_PORT`] instead of
//! rejecting the whole file.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::{info, warn};
use vdisk_sys::FormatCommand;
use vdisk_types::{DriveLetter, FormatOptions};

use crate::error::{Result, VdiskError};

pub const DEFAULT_PORT: u16 = 50051;

const CONFIG_FILE_NAME: &str = "vdisk.toml";

const DEFAULT_SCRATCH_DRIVE: DriveLetter = match DriveLetter::from_ascii_upper('R') {
    Some(letter) => letter,
    None => panic!("default scratch drive must be an upper-case letter"),
};

// A, B and C are conventionally taken by the system.
const DEFAULT_ALLOCATION_START: DriveLetter = match DriveLetter::from_ascii_upper('D') {
    Some(letter) => letter,
    None => panic!("default allocation start must be an upper-case letter"),
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VdiskConfig {
    #[serde(deserialize_with = "lenient_port")]
    pub port: u16,

    /// Drive that content transfers read from and write to
    pub scratch_drive: DriveLetter,

    /// Directory whose single-letter subdirectories are drive mount points
    pub mount_root: PathBuf,

    /// tmpfs directory for memory-backed device files
    pub memory_dir: PathBuf,

    /// File system the driver puts on new memory-backed devices
    pub memory_filesystem: String,

    /// Registry snapshot and driver ledger
    pub state_dir: PathBuf,

    /// First letter handed out by the allocator
    pub allocation_start: DriveLetter,

    /// Bounded retries when a drive letter is claimed between query and mount
    pub mount_attempts: u32,

    pub settle_timeout_ms: u64,
    pub settle_poll_ms: u64,

    /// Timeout for driver-side helper commands
    pub command_timeout_secs: u64,

    /// Enables the rolling file log when set
    pub log_dir: Option<PathBuf>,

    pub format: FormatCommand,
    pub format_options: FormatOptions,
}

impl Default for VdiskConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            scratch_drive: DEFAULT_SCRATCH_DRIVE,
            mount_root: PathBuf::from("/mnt/vdisk"),
            memory_dir: PathBuf::from("/dev/shm/vdisk"),
            memory_filesystem: "ext4".to_string(),
            state_dir: default_state_dir(),
            allocation_start: DEFAULT_ALLOCATION_START,
            mount_attempts: 3,
            settle_timeout_ms: 2_000,
            settle_poll_ms: 100,
            command_timeout_secs: 30,
            log_dir: None,
            format: FormatCommand::default(),
            format_options: FormatOptions::default(),
        }
    }
}

impl VdiskConfig {
    /// Load the configuration file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "no configuration file, using defaults");
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path).map_err(|error| VdiskError::Config {
            path: path.to_path_buf(),
            reason: error.to_string(),
        })?;

        let config = Self::parse(&raw).map_err(|reason| VdiskError::Config {
            path: path.to_path_buf(),
            reason,
        })?;

        info!(path = %path.display(), port = config.port, "loaded configuration");
        Ok(config)
    }

    pub fn parse(raw: &str) -> std::result::Result<Self, String> {
        toml::from_str(raw).map_err(|error| error.to_string())
    }

    /// Resolve the configuration path: explicit flag, `VDISK_CONFIG`, then
    /// the XDG config directory.
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }

        if let Some(path) = std::env::var_os("VDISK_CONFIG") {
            return PathBuf::from(path);
        }

        if let Some(xdg_config) = std::env::var_os("XDG_CONFIG_HOME") {
            return PathBuf::from(xdg_config).join("vdisk").join(CONFIG_FILE_NAME);
        }

        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home)
                .join(".config")
                .join("vdisk")
                .join(CONFIG_FILE_NAME);
        }

        PathBuf::from(CONFIG_FILE_NAME)
    }

    pub fn settle_timeout(&self) -> Duration {
        Duration::from_millis(self.settle_timeout_ms)
    }

    pub fn settle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.settle_poll_ms.max(1))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn registry_snapshot_path(&self) -> PathBuf {
        self.state_dir.join("registry.xml")
    }
}

fn default_state_dir() -> PathBuf {
    if let Some(xdg_state) = std::env::var_os("XDG_STATE_HOME") {
        return PathBuf::from(xdg_state).join("vdisk");
    }

    if let Some(home) = std::env::var_os("HOME") {
        return PathBuf::from(home).join(".local").join("state").join("vdisk");
    }

    PathBuf::from("/tmp").join("vdisk")
}

fn lenient_port<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    let value = toml::Value::deserialize(deserializer)?;
    let port = value
        .as_integer()
        .and_then(|port| u16::try_from(port).ok())
        .filter(|port| *port != 0);

    Ok(port.unwrap_or_else(|| {
        warn!(value = %value, "invalid port in configuration, using {}", DEFAULT_PORT);
        DEFAULT_PORT
    }))
}
