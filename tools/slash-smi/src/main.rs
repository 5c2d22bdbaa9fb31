//! SLASH management interface.
//!
//! Administrative front end over the runtime: device discovery, bundle
//! inspection, DMA validation, programming, and reset.

mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    slash_rt::logging::init();
    let cli = cli::Cli::parse();

    match cli.command {
        cli::Command::List => commands::list::run(),
        cli::Command::Inspect(ref args) => commands::inspect::run(args),
        cli::Command::Validate(ref args) => commands::validate::run(args),
        cli::Command::Program(ref args) => commands::program::run(args),
        cli::Command::Reset(ref args) => commands::reset::run(args),
    }
}
