//! Hardware access layer for the card's management interface.
//!
//! An [`AmiDevice`] is the exclusively owned handle to one physical card:
//! it resolves the device through sysfs, maps the management BAR aperture
//! for register traffic, reads the programmed logic UUID, and drives the
//! vendor `ami_tool` for PDI download and device boot. The external tool is
//! part of the platform contract; its exit code surfaces as a classified
//! error.

use std::fs::OpenOptions;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info, warn};

use crate::bdf::Bdf;
use crate::error::{Error, Result};

/// Host-physical base of the BAR aperture kernels are addressed through.
/// Absolute addresses from the system map are offset against this base.
pub const BAR_APERTURE_BASE: u64 = 0x201_0000_0000;

/// PMC GPIO register; writing 1 triggers the fabric reset.
pub const PMC_GPIO_OFFSET: u64 = 0x104_0000;

/// Vendor management tool driving flash programming and boot.
const AMI_TOOL: &str = "ami_tool";

/// Sysfs attribute published by the management driver with the UUID of the
/// image on flash.
const UUID_ATTR: &str = "logic_uuids";

/// Exclusively owned handle to one card.
#[derive(Debug)]
pub struct AmiDevice {
    bdf: Bdf,
    sysfs: PathBuf,
    bar: BarMapping,
}

impl AmiDevice {
    /// Opens the card at `bdf` through sysfs.
    ///
    /// # Errors
    ///
    /// `HardwareNotFound` if no PCIe device answers to the BDF;
    /// `AccessDenied` if the BAR resource cannot be mapped read-write.
    pub fn open(bdf: &Bdf) -> Result<Self> {
        let sysfs = PathBuf::from("/sys/bus/pci/devices").join(bdf.with_domain());
        Self::open_at(bdf, sysfs)
    }

    /// Opens the card rooted at an explicit sysfs directory.
    pub fn open_at(bdf: &Bdf, sysfs: PathBuf) -> Result<Self> {
        if !sysfs.exists() {
            return Err(Error::HardwareNotFound(bdf.to_string()));
        }
        let bar = BarMapping::map(&sysfs.join("resource0"), bdf)?;
        debug!(%bdf, len = bar.len, "mapped BAR aperture");
        Ok(Self {
            bdf: *bdf,
            sysfs,
            bar,
        })
    }

    /// The card's address.
    pub fn bdf(&self) -> &Bdf {
        &self.bdf
    }

    /// Reads a 32-bit register at a byte offset into the BAR.
    pub fn bar_read32(&self, offset: u64) -> Result<u32> {
        self.check_range(offset, 4)?;
        // SAFETY: bounds checked above; the mapping lives as long as self.
        Ok(unsafe { std::ptr::read_volatile(self.bar.ptr.add(offset as usize).cast::<u32>()) })
    }

    /// Writes a 32-bit register at a byte offset into the BAR.
    pub fn bar_write32(&self, offset: u64, value: u32) -> Result<()> {
        self.check_range(offset, 4)?;
        // SAFETY: bounds checked above; the mapping lives as long as self.
        unsafe {
            std::ptr::write_volatile(self.bar.ptr.add(offset as usize).cast::<u32>(), value);
        }
        Ok(())
    }

    /// Writes a contiguous run of 32-bit registers in one burst.
    pub fn bar_write_range(&self, offset: u64, words: &[u32]) -> Result<()> {
        self.check_range(offset, (words.len() as u64) * 4)?;
        for (i, &word) in words.iter().enumerate() {
            // SAFETY: the whole run is bounds checked above.
            unsafe {
                std::ptr::write_volatile(
                    self.bar.ptr.add(offset as usize + i * 4).cast::<u32>(),
                    word,
                );
            }
        }
        Ok(())
    }

    /// Reads the logic UUID of the image currently on flash.
    ///
    /// # Errors
    ///
    /// `UuidUnreadable` when the driver does not publish the attribute;
    /// callers treat this as "unknown image" rather than a fatal state.
    pub fn read_logic_uuid(&self) -> Result<String> {
        let path = self.sysfs.join(UUID_ATTR);
        let raw =
            std::fs::read_to_string(&path).map_err(|_| Error::UuidUnreadable(path.clone()))?;
        let uuid: String = raw.trim().chars().take(32).collect();
        if uuid.is_empty() {
            return Err(Error::UuidUnreadable(path));
        }
        Ok(uuid)
    }

    /// Downloads a PDI to the card (full flash image or partial load).
    pub fn program_pdi(&self, pdi: &Path, partial: bool) -> Result<()> {
        let mut cmd = Command::new(AMI_TOOL);
        cmd.arg("cfgmem_program")
            .arg("-d")
            .arg(self.bdf.to_string())
            .arg("-i")
            .arg(pdi)
            .arg("-p")
            .arg("1");
        if partial {
            cmd.arg("--partial");
        }
        info!(bdf = %self.bdf, pdi = %pdi.display(), partial, "downloading PDI");
        let output = cmd
            .output()
            .map_err(|e| Error::ProgramFailed(format!("failed to run {AMI_TOOL}: {e}")))?;
        if !output.status.success() {
            return Err(Error::ProgramFailed(format!(
                "{AMI_TOOL} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    /// Boots the card into the given flash partition.
    ///
    /// Unprivileged boot failures are tolerated: the management driver
    /// refuses the request but the subsequent hot-plug reset still takes
    /// effect, so only root sees a hard error.
    pub fn device_boot(&self, partition: u32) -> Result<()> {
        info!(bdf = %self.bdf, partition, "booting device");
        let output = Command::new(AMI_TOOL)
            .arg("device_boot")
            .arg("-d")
            .arg(self.bdf.to_string())
            .arg("-p")
            .arg(partition.to_string())
            .output()
            .map_err(|e| Error::BootFailed(format!("failed to run {AMI_TOOL}: {e}")))?;
        if !output.status.success() {
            if is_root() {
                return Err(Error::BootFailed(format!(
                    "{AMI_TOOL} exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
            warn!(bdf = %self.bdf, "device boot request refused without root; continuing");
        }
        Ok(())
    }

    fn check_range(&self, offset: u64, len: u64) -> Result<()> {
        if offset + len > self.bar.len as u64 {
            return Err(Error::os(
                format!(
                    "BAR access at {offset:#x}+{len:#x} beyond mapping of {:#x}",
                    self.bar.len
                ),
                std::io::Error::from(std::io::ErrorKind::InvalidInput),
            ));
        }
        Ok(())
    }
}

/// Whether the process runs with effective uid 0.
pub(crate) fn is_root() -> bool {
    // SAFETY: geteuid has no failure modes and touches no shared state.
    unsafe { libc::geteuid() == 0 }
}

/// Owned `mmap` of the PCI resource file backing the BAR.
#[derive(Debug)]
struct BarMapping {
    ptr: *mut u8,
    len: usize,
}

// The mapping is a plain memory range; the raw pointer does not tie it to a
// thread.
unsafe impl Send for BarMapping {}

impl BarMapping {
    fn map(resource: &Path, bdf: &Bdf) -> Result<Self> {
        let denied = |source: std::io::Error| Error::AccessDenied {
            bdf: bdf.to_string(),
            source,
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(resource)
            .map_err(denied)?;
        let len = file.metadata().map_err(denied)?.len() as usize;
        if len == 0 {
            return Err(denied(std::io::Error::from(std::io::ErrorKind::InvalidData)));
        }

        // SAFETY: mapping a file we own for its full length; failure is
        // checked against MAP_FAILED before use.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(denied(std::io::Error::last_os_error()));
        }
        Ok(Self {
            ptr: ptr.cast::<u8>(),
            len,
        })
    }
}

impl Drop for BarMapping {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap and are unmapped once.
        unsafe {
            libc::munmap(self.ptr.cast(), self.len);
        }
    }
}
