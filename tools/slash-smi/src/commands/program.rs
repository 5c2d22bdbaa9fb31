//! Device programming.

use anyhow::{Context, Result};

use slash_rt::{Device, DeviceOptions, ProgramMode};

use super::normalize_bdf;
use crate::cli::ProgramArgs;

/// Programs a device with a bundle, flashing only when the UUID differs.
pub fn run(args: &ProgramArgs) -> Result<()> {
    let bdf = normalize_bdf(&args.device);
    let options = DeviceOptions {
        program: true,
        mode: if args.jtag {
            ProgramMode::Jtag
        } else {
            ProgramMode::Flash
        },
    };

    let mut device = Device::open(&bdf, &args.vrtbin, options)
        .with_context(|| format!("programming {bdf}"))?;
    device.cleanup();
    println!("Device {bdf} programmed successfully");
    Ok(())
}
