//! Command-line interface definitions for slash-smi.

use clap::{Parser, Subcommand};

/// SLASH accelerator card management interface.
#[derive(Parser)]
#[command(name = "slash-smi", version, about)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// List SLASH devices on the PCIe bus.
    List,
    /// Print the metadata carried by a vrtbin bundle.
    Inspect(InspectArgs),
    /// Run DMA validation tests (sequential, concurrent, bandwidth)
    /// against a device.
    Validate(ValidateArgs),
    /// Program a device with a vrtbin bundle.
    Program(ProgramArgs),
    /// Reset a device back to the partition-1 base image.
    Reset(ResetArgs),
}

/// Arguments for the `inspect` subcommand.
#[derive(Parser)]
pub struct InspectArgs {
    /// Path to the vrtbin bundle.
    pub vrtbin: std::path::PathBuf,
}

/// Arguments for the `validate` subcommand.
#[derive(Parser)]
pub struct ValidateArgs {
    /// Device BDF, e.g. `c4:00.0`.
    pub device: String,

    /// Transfer size in bytes per iteration.
    #[arg(long, default_value_t = 1024 * 1024)]
    pub size: u64,

    /// Number of iterations per region.
    #[arg(long, default_value_t = 4)]
    pub count: u32,
}

/// Arguments for the `program` subcommand.
#[derive(Parser)]
pub struct ProgramArgs {
    /// Device BDF, e.g. `c4:00.0`.
    pub device: String,

    /// Path to the vrtbin bundle.
    pub vrtbin: std::path::PathBuf,

    /// Load over JTAG instead of writing to flash.
    #[arg(long)]
    pub jtag: bool,
}

/// Arguments for the `reset` subcommand.
#[derive(Parser)]
pub struct ResetArgs {
    /// Device BDF, e.g. `c4:00.0`.
    pub device: String,
}
