//! PCIe hot-plug driver handler.
//!
//! The hot-plug kernel module exposes one character device per card,
//! `/dev/pcie_hotplug_0000:<BDF>`, accepting four literal commands. A
//! reprogrammed fabric only becomes visible to userland after the full
//! re-enumeration dance; the ordering of that dance differs between the
//! flash, JTAG, and segmented paths and is encoded here as data so the
//! lifecycle code cannot reorder it.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use tracing::info;

use crate::bdf::Bdf;
use crate::error::{Error, Result};

/// Root path of the hot-plug device nodes.
const HOTPLUG_ROOT: &str = "/dev/pcie_hotplug";

/// Commands understood by the hot-plug driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugCommand {
    /// Detach the device from the PCI topology.
    Remove,
    /// Pulse the secondary bus reset.
    ToggleSbr,
    /// Rescan the bus.
    Rescan,
    /// Re-attach the hot-plug state machine.
    Hotplug,
}

impl HotplugCommand {
    /// The literal payload written to the device node.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Remove => "remove",
            Self::ToggleSbr => "toggle_sbr",
            Self::Rescan => "rescan",
            Self::Hotplug => "hotplug",
        }
    }
}

/// Handle to one card's hot-plug device node.
#[derive(Debug)]
pub struct PcieDriverHandler {
    node: PathBuf,
}

impl PcieDriverHandler {
    /// Binds to the hot-plug node for `bdf`.
    ///
    /// # Errors
    ///
    /// Fails when the node does not exist --- the kernel module is not
    /// loaded or does not know this device.
    pub fn new(bdf: &Bdf) -> Result<Self> {
        let node = PathBuf::from(format!("{}_{}", HOTPLUG_ROOT, bdf.with_domain()));
        Self::with_node(node)
    }

    /// Binds to an explicit node path.
    pub fn with_node(node: PathBuf) -> Result<Self> {
        if !node.exists() {
            return Err(Error::os(
                format!("PCIe hotplug driver does not exist: {}", node.display()),
                std::io::Error::from(std::io::ErrorKind::NotFound),
            ));
        }
        Ok(Self { node })
    }

    /// Writes one command to the driver.
    ///
    /// The driver sends no acknowledgement; settle delays between commands
    /// are the caller's responsibility.
    pub fn execute(&self, cmd: HotplugCommand) -> Result<()> {
        info!(command = cmd.as_str(), node = %self.node.display(), "hotplug command");
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(&self.node)
            .map_err(|e| Error::os(format!("opening {}", self.node.display()), e))?;
        file.write_all(cmd.as_str().as_bytes())
            .map_err(|e| Error::os(format!("writing to {}", self.node.display()), e))
    }
}

// ---------------------------------------------------------------------------
// Re-enumeration sequences
// ---------------------------------------------------------------------------

/// One step of a re-enumeration sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetStep {
    /// Send a command to the driver.
    Send(HotplugCommand),
    /// Let the device settle before the next command.
    Settle(Duration),
}

/// Which lifecycle path is re-enumerating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind {
    /// Flat image written to flash.
    FlatFlash,
    /// Flat image loaded over JTAG. No secondary bus reset on this path.
    FlatJtag,
    /// Segmented flow entering the partition-1 base image.
    SegmentedEnter,
    /// Segmented flow after the partial PDI download.
    SegmentedFinish,
}

/// The command/delay sequence for a path. Order is load-bearing on silicon;
/// reordering corrupts the PCI topology visible to userland.
pub fn reset_sequence(kind: ResetKind) -> &'static [ResetStep] {
    use HotplugCommand::*;
    use ResetStep::*;

    const FLAT_FLASH: &[ResetStep] = &[
        Send(Remove),
        Settle(Duration::from_millis(1)),
        Send(ToggleSbr),
        Settle(Duration::from_secs(5)),
        Send(Rescan),
        Send(Hotplug),
    ];
    const FLAT_JTAG: &[ResetStep] = &[
        Send(Remove),
        Settle(Duration::from_millis(1)),
        Send(Rescan),
        Send(Hotplug),
    ];
    const SEGMENTED_ENTER: &[ResetStep] = &[
        Send(Remove),
        Send(ToggleSbr),
        Send(Rescan),
        Send(Hotplug),
    ];
    const SEGMENTED_FINISH: &[ResetStep] = &[
        Send(Remove),
        // Enough time for the device to reset after a partial load.
        Settle(Duration::from_secs(8)),
        Send(Rescan),
        Send(Hotplug),
    ];

    match kind {
        ResetKind::FlatFlash => FLAT_FLASH,
        ResetKind::FlatJtag => FLAT_JTAG,
        ResetKind::SegmentedEnter => SEGMENTED_ENTER,
        ResetKind::SegmentedFinish => SEGMENTED_FINISH,
    }
}
