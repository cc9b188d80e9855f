// SPDX-License-Identifier: GPL-3.0-only

//! `vdisk` command-line front end

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use vdisk_manager::{
    ContentTransfer, DeviceManager, RemoveOutcome, VdiskConfig, VdiskContext,
};
use vdisk_sys::{
    LoopDeviceDriver, LoopDriverOptions, MountTableNamespace, SystemCommandRunner,
    SystemFormatter,
};
use vdisk_types::{DeviceId, DriveLetter, VirtualDevice};

mod logging;
mod state;

#[derive(Debug, Parser)]
#[command(name = "vdisk")]
#[command(about = "Create, mount and remove virtual block devices")]
struct Cli {
    /// Configuration file (defaults to $VDISK_CONFIG or the XDG config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Expose an image file as a drive
    Mount {
        letter: DriveLetter,
        image: PathBuf,
        #[arg(long)]
        read_only: bool,
    },
    /// Create a RAM-backed drive
    Create { letter: DriveLetter, size_mb: u64 },
    /// Remove one device by id
    Remove { id: DeviceId },
    /// Remove every device the driver reports
    RemoveAll,
    /// Format a drive with the external utility
    Format {
        letter: DriveLetter,
        #[arg(long)]
        fs: Option<String>,
        #[arg(long)]
        label: Option<String>,
        /// Full instead of quick format
        #[arg(long)]
        full: bool,
    },
    /// List registered devices
    List,
    /// Print the first free drive letter
    FreeLetter,
    /// Decompress a gzip file onto the scratch drive
    Push { payload: PathBuf },
    /// Gzip a file into `output`
    Pull { path: PathBuf, output: PathBuf },
    /// Report whether the configured port is taken
    Port,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = VdiskConfig::resolve_path(cli.config.as_deref());
    let config = VdiskConfig::load(&config_path)?;
    logging::init(config.log_dir.as_deref());

    if let Command::Port = cli.command {
        let state = if vdisk_sys::is_in_use(config.port) {
            "in use"
        } else {
            "free"
        };
        println!("port {} is {state}", config.port);
        return Ok(());
    }

    let context = build_context(config)?;
    let snapshot_path = context.config.registry_snapshot_path();
    state::restore(&context.registry, &snapshot_path)?;

    let outcome = run(&context, cli.command);

    if let Err(e) = state::save(&context.registry, &snapshot_path) {
        warn!("failed to persist registry: {e:#}");
    }
    outcome
}

fn build_context(config: VdiskConfig) -> Result<VdiskContext> {
    let namespace = Arc::new(MountTableNamespace::new(&config.mount_root));
    let driver = LoopDeviceDriver::new(LoopDriverOptions {
        mount_root: config.mount_root.clone(),
        memory_dir: config.memory_dir.clone(),
        state_dir: config.state_dir.clone(),
        allocation_start: config.allocation_start,
        command_timeout: config.command_timeout(),
        memory_filesystem: config.memory_filesystem.clone(),
    })
    .context("failed to initialize the loop device driver")?;
    let formatter = SystemFormatter::new(config.format.clone(), Arc::new(SystemCommandRunner::new()));

    Ok(VdiskContext::new(
        config,
        Arc::new(driver),
        namespace,
        Arc::new(formatter),
    ))
}

fn run(context: &VdiskContext, command: Command) -> Result<()> {
    let manager = DeviceManager::new(context);

    match command {
        Command::Mount {
            letter,
            image,
            read_only,
        } => {
            let id = manager.mount_from_image_with(letter, &image, read_only)?;
            print_device(&manager, id);
        }
        Command::Create { letter, size_mb } => {
            let id = manager.create_memory_backed(letter, size_mb)?;
            print_device(&manager, id);
        }
        Command::Remove { id } => match manager.remove(id)? {
            RemoveOutcome::Removed => println!("removed device {id}"),
            RemoveOutcome::Stale => println!("device {id} was already gone; entry purged"),
        },
        Command::RemoveAll => {
            let report = manager.remove_all()?;
            println!(
                "removed {}, stale {}, failed {}, in flight {}",
                report.removed.len(),
                report.stale.len(),
                report.failed.len(),
                report.in_flight.len()
            );
            report.into_result()?;
        }
        Command::Format {
            letter,
            fs,
            label,
            full,
        } => {
            let mut options = context.config.format_options.clone();
            if let Some(fs) = fs {
                options.filesystem = fs;
            }
            if label.is_some() {
                options.label = label;
            }
            if full {
                options.quick = false;
            }
            manager.format_with(letter, &options)?;
            println!("formatted {letter} as {}", options.filesystem);
        }
        Command::List => {
            let devices = manager.list();
            if devices.is_empty() {
                println!("no devices");
            }
            for device in &devices {
                println!("{}", describe(device));
            }
        }
        Command::FreeLetter => println!("{}", manager.find_free_identifier()?),
        Command::Push { payload } => {
            let compressed = fs::read(&payload)
                .with_context(|| format!("failed to read {}", payload.display()))?;
            let written = ContentTransfer::new(context).write_compressed_payload(&compressed)?;
            println!("{}", written.display());
        }
        Command::Pull { path, output } => {
            let compressed = ContentTransfer::new(context).read_compressed_payload(&path)?;
            fs::write(&output, &compressed)
                .with_context(|| format!("failed to write {}", output.display()))?;
            info!(output = %output.display(), bytes = compressed.len(), "payload saved");
        }
        Command::Port => {}
    }

    Ok(())
}

fn print_device(manager: &DeviceManager, id: DeviceId) {
    match manager.lookup(id) {
        Some(device) => println!("{}", describe(&device)),
        None => println!("device {id}"),
    }
}

fn describe(device: &VirtualDevice) -> String {
    let mut line = format!(
        "{:>4}  {}  {:<10} {:<9} {:>10}",
        device.device_id.to_string(),
        device.drive_letter,
        device.backing_kind.as_str(),
        device.state.as_str(),
        device.capacity_bytes
    );
    if device.read_only {
        line.push_str("  ro");
    }
    if let Some(image) = &device.image_path {
        line.push_str(&format!("  {}", image.display()));
    }
    line
}
