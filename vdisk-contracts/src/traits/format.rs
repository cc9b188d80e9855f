// SPDX-License-Identifier: GPL-3.0-only

use vdisk_types::{ExitResult, FormatOptions, FormatTarget};

use crate::CommandError;

/// External disk-formatting utility.
///
/// A non-zero exit code is returned as a value; only failing to run the
/// utility at all is an error.
pub trait FormatUtility: Send + Sync {
    fn format(
        &self,
        target: &FormatTarget,
        options: &FormatOptions,
    ) -> Result<ExitResult, CommandError>;
}
