// SPDX-License-Identifier: GPL-3.0-only

//! Drive letters and their mount paths

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriveLetterError {
    #[error("drive letter must be a single ASCII letter, got {0:?}")]
    Invalid(String),
}

/// A single drive identifier in the `A..=Z` namespace.
///
/// Always stored upper-case so that `d`, `D` and `D:` name the same drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DriveLetter(char);

impl DriveLetter {
    pub const FIRST: DriveLetter = DriveLetter('A');

    pub fn new(letter: char) -> Result<Self, DriveLetterError> {
        if letter.is_ascii_alphabetic() {
            Ok(Self(letter.to_ascii_uppercase()))
        } else {
            Err(DriveLetterError::Invalid(letter.to_string()))
        }
    }

    /// Const constructor for letters known at compile time.
    pub const fn from_ascii_upper(letter: char) -> Option<Self> {
        if letter.is_ascii_uppercase() {
            Some(Self(letter))
        } else {
            None
        }
    }

    pub fn as_char(self) -> char {
        self.0
    }

    /// Every letter in canonical (ascending) order.
    pub fn all() -> impl Iterator<Item = DriveLetter> {
        ('A'..='Z').map(DriveLetter)
    }

    /// First letter at or after `start` that is not in `occupied`.
    pub fn first_free(occupied: &BTreeSet<DriveLetter>, start: DriveLetter) -> Option<DriveLetter> {
        Self::all()
            .skip_while(|letter| *letter < start)
            .find(|letter| !occupied.contains(letter))
    }

    /// Where the operating system exposes this drive.
    ///
    /// Windows uses the volume root (`D:\`); elsewhere each letter is a
    /// directory directly below `mount_root`.
    pub fn mount_path(self, mount_root: &Path) -> PathBuf {
        if cfg!(windows) {
            let _ = mount_root;
            PathBuf::from(format!("{}:\\", self.0))
        } else {
            mount_root.join(self.0.to_string())
        }
    }

    /// Parse the final component of a mount path back into a letter.
    pub fn from_mount_dir_name(name: &str) -> Option<DriveLetter> {
        let mut chars = name.chars();
        match (chars.next(), chars.next()) {
            (Some(letter), None) if letter.is_ascii_uppercase() => Some(DriveLetter(letter)),
            _ => None,
        }
    }
}

impl fmt::Display for DriveLetter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.0)
    }
}

impl FromStr for DriveLetter {
    type Err = DriveLetterError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value
            .trim()
            .trim_end_matches(['\\', '/'])
            .trim_end_matches(':');
        let mut chars = trimmed.chars();
        match (chars.next(), chars.next()) {
            (Some(letter), None) => {
                Self::new(letter).map_err(|_| DriveLetterError::Invalid(value.to_string()))
            }
            _ => Err(DriveLetterError::Invalid(value.to_string())),
        }
    }
}

impl TryFrom<String> for DriveLetter {
    type Error = DriveLetterError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DriveLetter> for String {
    fn from(letter: DriveLetter) -> Self {
        letter.0.to_string()
    }
}
