//! Device reset.

use anyhow::{Context, Result};

use slash_rt::Bdf;
use slash_rt::ami::{AmiDevice, PMC_GPIO_OFFSET};
use slash_rt::hotplug::{PcieDriverHandler, ResetKind, ResetStep, reset_sequence};

use super::normalize_bdf;
use crate::cli::ResetArgs;

/// Boots the card back to the partition-1 base image and re-enumerates it.
pub fn run(args: &ResetArgs) -> Result<()> {
    let bdf = Bdf::parse(&normalize_bdf(&args.device)).context("parsing device address")?;
    let handler = PcieDriverHandler::new(&bdf).context("binding hot-plug driver")?;

    let device = AmiDevice::open(&bdf).with_context(|| format!("opening {bdf}"))?;
    // The segmented base PDI lives on partition 1.
    device.device_boot(1).context("booting partition 1")?;
    device
        .bar_write32(PMC_GPIO_OFFSET, 1)
        .context("triggering PMC reset")?;
    drop(device);

    for step in reset_sequence(ResetKind::SegmentedEnter) {
        match step {
            ResetStep::Send(cmd) => handler.execute(*cmd).context("hot-plug command")?,
            ResetStep::Settle(delay) => std::thread::sleep(*delay),
        }
    }

    // The card must answer again after re-enumeration.
    AmiDevice::open(&bdf).with_context(|| format!("{bdf} did not come back"))?;
    println!("Device {bdf} reset successfully");
    Ok(())
}
