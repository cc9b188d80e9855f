// SPDX-License-Identifier: GPL-3.0-only

//! External formatting utility

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use vdisk_contracts::{CommandError, CommandRunner, FormatUtility};
use vdisk_types::{ExitResult, FormatOptions, FormatTarget};

use crate::command::render;

/// How to invoke the formatting utility.
///
/// Arguments may contain the placeholders `{drive}`, `{mount}`, `{fs}`,
/// `{label}` and `{device_id}`. An argument mentioning `{label}` is dropped
/// when no label was requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatCommand {
    pub program: String,
    pub args: Vec<String>,
    pub quick_flag: Option<String>,
    pub timeout_secs: u64,
    /// Unmount the loop device before formatting and mount it again after
    pub remount: bool,
}

impl Default for FormatCommand {
    fn default() -> Self {
        if cfg!(windows) {
            Self {
                program: "format.com".to_string(),
                args: vec![
                    "{drive}:".to_string(),
                    "/FS:{fs}".to_string(),
                    "/V:{label}".to_string(),
                    "/Y".to_string(),
                ],
                quick_flag: Some("/Q".to_string()),
                timeout_secs: 300,
                remount: false,
            }
        } else {
            Self {
                program: "mkfs".to_string(),
                args: vec![
                    "-t".to_string(),
                    "{fs}".to_string(),
                    "-L{label}".to_string(),
                    "/dev/loop{device_id}".to_string(),
                ],
                quick_flag: None,
                timeout_secs: 300,
                remount: true,
            }
        }
    }
}

impl FormatCommand {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Expand the argument template for one target.
    pub fn render_args(
        &self,
        target: &FormatTarget,
        options: &FormatOptions,
    ) -> Result<Vec<String>, CommandError> {
        let mut rendered = Vec::with_capacity(self.args.len() + 1);

        for arg in &self.args {
            if arg.contains("{label}") && options.label.is_none() {
                continue;
            }

            let mut value = arg
                .replace("{drive}", &target.drive_letter.as_char().to_string())
                .replace("{mount}", &target.mount_path.display().to_string())
                .replace("{fs}", &options.filesystem)
                .replace("{label}", options.label.as_deref().unwrap_or_default());

            if value.contains("{device_id}") {
                let device_id = target.device_id.ok_or_else(|| CommandError::Spawn {
                    command: self.program.clone(),
                    reason: format!(
                        "{} is not backed by a registered device, cannot fill {{device_id}}",
                        target.drive_letter
                    ),
                })?;
                value = value.replace("{device_id}", &device_id.to_string());
            }

            rendered.push(value);
        }

        if options.quick {
            if let Some(flag) = &self.quick_flag {
                rendered.push(flag.clone());
            }
        }

        Ok(rendered)
    }
}

/// Runs the configured formatting utility through a `CommandRunner`
pub struct SystemFormatter {
    command: FormatCommand,
    runner: Arc<dyn CommandRunner>,
}

impl SystemFormatter {
    pub fn new(command: FormatCommand, runner: Arc<dyn CommandRunner>) -> Self {
        Self { command, runner }
    }
}

impl SystemFormatter {
    fn run_step(&self, program: &str, args: Vec<String>) -> Result<ExitResult, CommandError> {
        self.runner.run(program, &args, self.command.timeout())
    }

    fn format_unmounted(
        &self,
        target: &FormatTarget,
        args: &[String],
    ) -> Result<ExitResult, CommandError> {
        let device_id = target.device_id.ok_or_else(|| CommandError::Spawn {
            command: self.command.program.clone(),
            reason: format!("{} is not backed by a loop device", target.drive_letter),
        })?;
        let device = format!("/dev/loop{device_id}");
        let mount_path = target.mount_path.display().to_string();

        let umount_args = vec![mount_path.clone()];
        let unmounted = self.run_step("umount", umount_args.clone())?;
        if !unmounted.success() {
            warn!(drive = %target.drive_letter, code = unmounted.code, "could not unmount before formatting");
            return Err(CommandError::StepFailed {
                command: render("umount", &umount_args),
                code: unmounted.code,
            });
        }

        let formatted = self
            .runner
            .run(&self.command.program, args, self.command.timeout())?;

        let mount_args = vec![device, mount_path];
        let remounted = self.run_step("mount", mount_args.clone())?;
        if !remounted.success() {
            warn!(drive = %target.drive_letter, code = remounted.code, "could not mount after formatting");
            if formatted.success() {
                return Err(CommandError::StepFailed {
                    command: render("mount", &mount_args),
                    code: remounted.code,
                });
            }
        }

        Ok(formatted)
    }
}

impl FormatUtility for SystemFormatter {
    fn format(
        &self,
        target: &FormatTarget,
        options: &FormatOptions,
    ) -> Result<ExitResult, CommandError> {
        let args = self.command.render_args(target, options)?;
        info!(
            drive = %target.drive_letter,
            filesystem = %options.filesystem,
            quick = options.quick,
            "Formatting drive with {}",
            self.command.program
        );

        if self.command.remount {
            self.format_unmounted(target, &args)
        } else {
            self.runner
                .run(&self.command.program, &args, self.command.timeout())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use vdisk_testing::ScriptedRunner;
    use vdisk_types::DeviceId;

    use super::*;

    fn target(device_id: Option<u32>) -> FormatTarget {
        FormatTarget {
            drive_letter: "R".parse().expect("letter"),
            mount_path: PathBuf::from("/mnt/vdisk/R"),
            device_id: device_id.map(DeviceId),
        }
    }

    fn windows_style() -> FormatCommand {
        FormatCommand {
            program: "format.com".to_string(),
            args: vec![
                "{drive}:".to_string(),
                "/FS:{fs}".to_string(),
                "/V:{label}".to_string(),
                "/Y".to_string(),
            ],
            quick_flag: Some("/Q".to_string()),
            timeout_secs: 60,
            remount: false,
        }
    }

    #[test]
    fn renders_drive_filesystem_and_quick_flag() {
        let options = FormatOptions {
            filesystem: "NTFS".to_string(),
            quick: true,
            label: None,
        };
        let args = windows_style()
            .render_args(&target(None), &options)
            .expect("render");
        assert_eq!(args, vec!["R:", "/FS:NTFS", "/Y", "/Q"]);
    }

    #[test]
    fn keeps_label_argument_only_when_requested() {
        let options = FormatOptions {
            filesystem: "FAT32".to_string(),
            quick: false,
            label: Some("SCRATCH".to_string()),
        };
        let args = windows_style()
            .render_args(&target(None), &options)
            .expect("render");
        assert_eq!(args, vec!["R:", "/FS:FAT32", "/V:SCRATCH", "/Y"]);
    }

    #[test]
    fn device_placeholder_requires_a_registered_device() {
        let command = FormatCommand {
            program: "mkfs".to_string(),
            args: vec!["-t".to_string(), "{fs}".to_string(), "/dev/loop{device_id}".to_string()],
            quick_flag: None,
            timeout_secs: 60,
            remount: false,
        };
        let options = FormatOptions::default();

        assert!(command.render_args(&target(None), &options).is_err());

        let args = command
            .render_args(&target(Some(7)), &options)
            .expect("render");
        assert_eq!(args.last().map(String::as_str), Some("/dev/loop7"));
    }

    fn loop_style() -> FormatCommand {
        FormatCommand {
            program: "mkfs".to_string(),
            args: vec!["-t".to_string(), "{fs}".to_string(), "/dev/loop{device_id}".to_string()],
            quick_flag: None,
            timeout_secs: 60,
            remount: true,
        }
    }

    #[test]
    fn remount_wraps_the_format_in_umount_and_mount() {
        let runner = Arc::new(ScriptedRunner::default());
        let formatter = SystemFormatter::new(loop_style(), runner.clone());

        let exit = formatter
            .format(&target(Some(3)), &FormatOptions::default())
            .expect("format");

        assert!(exit.success());
        let steps: Vec<(String, Vec<String>)> = runner
            .calls()
            .into_iter()
            .map(|call| (call.command, call.args))
            .collect();
        assert_eq!(
            steps,
            vec![
                ("umount".to_string(), vec!["/mnt/vdisk/R".to_string()]),
                (
                    "mkfs".to_string(),
                    vec!["-t".to_string(), "ext4".to_string(), "/dev/loop3".to_string()]
                ),
                (
                    "mount".to_string(),
                    vec!["/dev/loop3".to_string(), "/mnt/vdisk/R".to_string()]
                ),
            ]
        );
    }

    #[test]
    fn failed_format_is_reported_after_remounting() {
        let runner = Arc::new(ScriptedRunner::with_exits([0, 1, 0]));
        let formatter = SystemFormatter::new(loop_style(), runner.clone());

        let exit = formatter
            .format(&target(Some(3)), &FormatOptions::default())
            .expect("format");

        assert_eq!(exit.code, 1);
        assert_eq!(runner.calls().len(), 3);
    }

    #[test]
    fn busy_mount_stops_before_formatting() {
        let runner = Arc::new(ScriptedRunner::with_exits([32]));
        let formatter = SystemFormatter::new(loop_style(), runner.clone());

        match formatter.format(&target(Some(3)), &FormatOptions::default()) {
            Err(CommandError::StepFailed { command, code }) => {
                assert_eq!(command, "umount /mnt/vdisk/R");
                assert_eq!(code, 32);
            }
            other => panic!("expected a failed umount step, got {other:?}"),
        }
        assert_eq!(runner.command_lines(), vec!["umount /mnt/vdisk/R"]);
    }

    #[test]
    fn failed_remount_after_a_good_format_is_an_error() {
        let runner = Arc::new(ScriptedRunner::with_exits([0, 0, 32]));
        let formatter = SystemFormatter::new(loop_style(), runner.clone());

        assert!(matches!(
            formatter.format(&target(Some(3)), &FormatOptions::default()),
            Err(CommandError::StepFailed { code: 32, .. })
        ));
        assert_eq!(runner.calls().len(), 3);
    }
}
