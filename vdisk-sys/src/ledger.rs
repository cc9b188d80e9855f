// SPDX-License-Identifier: GPL-3.0-only

//! On-disk record of the loop devices this driver attached
//!
//! The loop subsystem is shared with every other program on the host, so the
//! driver only ever reports or removes devices listed here.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use vdisk_types::{BackingKind, DeviceId, DriveLetter};

use crate::error::{Result, SysError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub drive_letter: DriveLetter,
    pub backing_kind: BackingKind,
    pub backing_file: PathBuf,
    /// Set when the driver created the backing file and must delete it
    pub owns_backing_file: bool,
    pub mount_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerState {
    pub devices: BTreeMap<DeviceId, LedgerEntry>,
}

#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
}

impl Ledger {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join("loop-ledger.json"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<LedgerState> {
        if !self.path.exists() {
            return Ok(LedgerState::default());
        }

        let raw = fs::read_to_string(&self.path).map_err(|error| self.error(error))?;
        serde_json::from_str(&raw).map_err(|error| self.error(error))
    }

    pub fn save(&self, state: &LedgerState) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(|error| SysError::Ledger {
                path: dir.to_path_buf(),
                reason: error.to_string(),
            })?;
        }

        let content = serde_json::to_string_pretty(state).map_err(|error| self.error(error))?;
        let staging = self.staging_path();
        fs::write(&staging, content).map_err(|error| self.error(error))?;
        fs::rename(&staging, &self.path).map_err(|error| self.error(error))
    }

    fn staging_path(&self) -> PathBuf {
        self.path.with_extension("json.tmp")
    }

    pub fn record(&self, device_id: DeviceId, entry: LedgerEntry) -> Result<()> {
        let mut state = self.load()?;
        state.devices.insert(device_id, entry);
        self.save(&state)
    }

    pub fn forget(&self, device_id: DeviceId) -> Result<Option<LedgerEntry>> {
        let mut state = self.load()?;
        let removed = state.devices.remove(&device_id);
        if removed.is_some() {
            self.save(&state)?;
        }
        Ok(removed)
    }

    fn error(&self, error: impl ToString) -> SysError {
        SysError::Ledger {
            path: self.path.clone(),
            reason: error.to_string(),
        }
    }
}
