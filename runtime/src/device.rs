//! Device lifecycle.
//!
//! A [`Device`] owns everything attached to one card: the bundle-derived
//! system map, the hardware handle and BAR mapping, the hot-plug driver
//! handle, the DMA interfaces, the device-memory allocator, the messenger,
//! and (for simulation/emulation) the backend child process. Construction
//! runs the full bring-up: exclusive-access lock, bundle extraction, UUID
//! reconciliation, programming, the hot-plug re-enumeration dance, queue
//! setup, system-map parsing, and clock programming.
//!
//! One `Device` per process per BDF is the only supported model, enforced
//! by an advisory `flock` on a per-BDF lock file in the runtime directory.

use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;

use tracing::{info, warn};

use slash_alloc::{DeviceAllocator, RegionKind};
use slash_sysmap::{BundleType, Platform, QdmaConnection, SystemMap};

use crate::ami::{AmiDevice, PMC_GPIO_OFFSET};
use crate::bdf::Bdf;
use crate::clkwiz::{ClkWiz, RegisterIo};
use crate::error::{Error, Result};
use crate::hotplug::{PcieDriverHandler, ResetKind, ResetStep, reset_sequence};
use crate::kernel::Kernel;
use crate::messenger::Messenger;
use crate::paths;
use crate::qdma::QdmaIntf;
use crate::vrtbin::{Dirs, Vrtbin};

/// Clock wizard base address inside the BAR aperture.
const CLK_WIZ_BASE: u64 = 0x201_0001_0000;

/// External script that loads a PDI over JTAG.
const JTAG_PROGRAM_SCRIPT: &str = "/usr/local/vrt/jtag_program.sh";
/// External script that creates and starts the QDMA queues.
const QDMA_SETUP_SCRIPT: &str = "/usr/local/vrt/setup_queues.sh";

/// How a flat image reaches the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProgramMode {
    /// Write the PDI to flash and boot into it.
    #[default]
    Flash,
    /// Load the PDI over JTAG.
    Jtag,
}

/// Construction options for [`Device::open`].
#[derive(Debug, Clone, Copy)]
pub struct DeviceOptions {
    /// Program the fabric when the bundle's UUID differs from the one on
    /// flash. With `false` the device is taken as-is.
    pub program: bool,
    /// Programming mode for flat bundles.
    pub mode: ProgramMode,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            program: true,
            mode: ProgramMode::Flash,
        }
    }
}

/// Handle to one accelerator card (or its simulated/emulated stand-in).
#[derive(Debug)]
pub struct Device {
    bdf: Bdf,
    platform: Platform,
    bundle_type: BundleType,
    system_map_path: PathBuf,
    map: SystemMap,
    clk: Mutex<ClkWiz>,
    ami: Option<AmiDevice>,
    hotplug: Option<PcieDriverHandler>,
    mm: Option<QdmaIntf>,
    streams: Vec<QdmaIntf>,
    allocator: Mutex<DeviceAllocator>,
    messenger: Messenger,
    child: Option<Child>,
    lock: Option<DeviceLock>,
}

impl Device {
    /// Opens the device at `bdf` with the bundle at `bundle_path`,
    /// programming it when needed.
    pub fn new(bdf: &str, bundle_path: impl AsRef<Path>) -> Result<Self> {
        Self::open(bdf, bundle_path, DeviceOptions::default())
    }

    /// Opens the device with explicit options.
    pub fn open(
        bdf: &str,
        bundle_path: impl AsRef<Path>,
        options: DeviceOptions,
    ) -> Result<Self> {
        let bdf = Bdf::parse(bdf)?;
        let runtime_dir = paths::runtime_dir()?;
        let lock = DeviceLock::acquire(&runtime_dir, &bdf)?;
        let dirs = Dirs::from_env()?;

        let bundle = Vrtbin::open(bundle_path.as_ref(), &bdf, &dirs)?;
        let platform = bundle.platform();
        let map = SystemMap::load(bundle.system_map_path())?;

        let mut device = Self {
            bdf,
            platform,
            bundle_type: map.bundle_type,
            system_map_path: bundle.system_map_path().to_path_buf(),
            clk: Mutex::new(ClkWiz::new(map.clock_frequency)),
            map,
            ami: None,
            hotplug: None,
            mm: None,
            streams: Vec::new(),
            allocator: Mutex::new(DeviceAllocator::new()),
            messenger: Messenger::new(),
            child: None,
            lock: Some(lock),
        };

        match platform {
            Platform::Hardware => device.bring_up_hardware(&bundle, options)?,
            Platform::Simulation => {
                device.spawn_backend(&bundle)?;
                device.messenger.start()?;
            }
            Platform::Emulation => device.spawn_backend(&bundle)?,
        }

        Ok(device)
    }

    fn bring_up_hardware(&mut self, bundle: &Vrtbin, options: DeviceOptions) -> Result<()> {
        self.ami = Some(AmiDevice::open(&self.bdf)?);
        self.hotplug = Some(PcieDriverHandler::new(&self.bdf)?);

        if options.program {
            self.program_device(bundle, options.mode)?;
        }

        // Re-read the map after programming: the persisted copy under
        // AMI_HOME is the authoritative one from here on.
        self.map = SystemMap::load(&self.system_map_path)?;
        self.mm = Some(QdmaIntf::mm(&self.bdf));
        self.streams = self
            .map
            .qdma_connections
            .iter()
            .map(|c| QdmaIntf::stream(&self.bdf, c.qid))
            .collect();

        let max = self.map.clock_frequency;
        let ami = self.ami.as_ref().expect("AMI handle set above");
        let mut regs = BarRegs {
            ami,
            base: CLK_WIZ_BASE,
        };
        self.clk
            .lock()
            .map_err(|_| Error::TransportFailed("clock mutex poisoned".into()))?
            .set_rate_hz(&mut regs, max)?;
        Ok(())
    }

    // -- programming and boot ------------------------------------------------

    fn program_device(&mut self, bundle: &Vrtbin, mode: ProgramMode) -> Result<()> {
        match self.bundle_type {
            BundleType::Flat => {
                if self.uuid_matches(bundle)? {
                    info!(bdf = %self.bdf, "device already programmed with the same image");
                    return self.boot_flat(mode);
                }
                let pdi = self.pdi_of(bundle)?;
                match mode {
                    ProgramMode::Flash => {
                        info!(
                            bdf = %self.bdf,
                            "programming device in FLASH mode, this might take a while"
                        );
                        self.ami_ref()?.program_pdi(&pdi, false)?;
                    }
                    ProgramMode::Jtag => {
                        info!(
                            bdf = %self.bdf,
                            "programming device in JTAG mode, this might take a while"
                        );
                        run_script(
                            Command::new("bash").arg(JTAG_PROGRAM_SCRIPT).arg(&pdi),
                            Error::ProgramFailed,
                        )?;
                    }
                }
                self.boot_flat(mode)
            }
            BundleType::Segmented => {
                if self.uuid_matches(bundle)? {
                    info!(bdf = %self.bdf, "device already programmed; refreshing qdma handle");
                    self.hotplug_ref()?
                        .execute(crate::hotplug::HotplugCommand::Hotplug)?;
                    return self.setup_queues();
                }
                info!(
                    bdf = %self.bdf,
                    "programming device in SEGMENTED mode, this might take a while"
                );
                let pdi = self.pdi_of(bundle)?;
                self.boot_segmented(&pdi)
            }
        }
    }

    /// Compares the UUID on flash with the bundle's. An unreadable flash
    /// UUID means an unknown image and never matches.
    fn uuid_matches(&self, bundle: &Vrtbin) -> Result<bool> {
        let current = match self.ami_ref()?.read_logic_uuid() {
            Ok(uuid) => uuid,
            Err(_) => return Ok(false),
        };
        info!(current = %current, new = %bundle.uuid(), "comparing logic UUIDs");
        Ok(!bundle.uuid().is_empty() && current == bundle.uuid())
    }

    /// Flat-image boot: partition select and PMC GPIO reset on the flash
    /// path, then the per-path hot-plug dance, handle reopen, and queue
    /// setup.
    fn boot_flat(&mut self, mode: ProgramMode) -> Result<()> {
        info!(bdf = %self.bdf, "booting device");
        let kind = match mode {
            ProgramMode::Flash => {
                let ami = self.ami_ref()?;
                ami.device_boot(1)?;
                info!("booting into PDI");
                ami.bar_write32(PMC_GPIO_OFFSET, 1)?;
                ResetKind::FlatFlash
            }
            ProgramMode::Jtag => {
                info!("booting into PDI");
                ResetKind::FlatJtag
            }
        };
        self.reenumerate(kind)?;
        info!(bdf = %self.bdf, "new PDI booted successfully");
        self.setup_queues()
    }

    /// Segmented boot: reset into the partition-1 base image, stream the
    /// partial PDI, then re-enumerate again with the long settle delay.
    fn boot_segmented(&mut self, pdi: &Path) -> Result<()> {
        let ami = self.ami_ref()?;
        // Partition 1 carries the segmented base PDI.
        ami.device_boot(1)?;
        info!("booting into base segmented PDI");
        ami.bar_write32(PMC_GPIO_OFFSET, 1)?;
        self.reenumerate(ResetKind::SegmentedEnter)?;
        info!("base segmented PDI booted successfully");

        self.ami_ref()?.program_pdi(pdi, true)?;
        self.reenumerate(ResetKind::SegmentedFinish)?;
        info!("PLD PDI booted successfully");
        self.setup_queues()
    }

    /// Drops the AMI handle, runs one hot-plug sequence, reopens the
    /// handle. The handle must not be held across the re-enumeration; the
    /// BAR mapping goes stale the moment the device leaves the bus.
    fn reenumerate(&mut self, kind: ResetKind) -> Result<()> {
        self.ami = None;
        let hotplug = self.hotplug_ref()?;
        for step in reset_sequence(kind) {
            match step {
                ResetStep::Send(cmd) => hotplug.execute(*cmd)?,
                ResetStep::Settle(delay) => std::thread::sleep(*delay),
            }
        }
        self.ami = Some(AmiDevice::open(&self.bdf)?);
        Ok(())
    }

    /// Runs the queue-setup script: one MM bidirectional queue plus one
    /// streaming queue per declared connection.
    fn setup_queues(&self) -> Result<()> {
        let map = SystemMap::load(&self.system_map_path)?;
        let mut cmd = Command::new("sudo");
        cmd.arg("bash")
            .arg(QDMA_SETUP_SCRIPT)
            .arg(self.bdf.to_string())
            .args(["--mm", "0", "bi"]);
        for connection in &map.qdma_connections {
            cmd.args([
                "--st",
                &connection.qid.to_string(),
                "--dir",
                connection.direction.as_queue_arg(),
            ]);
        }
        info!(bdf = %self.bdf, "setting up QDMA queues");
        run_script(&mut cmd, Error::QueueSetupFailed)?;
        info!(bdf = %self.bdf, "QDMA queues setup successfully");
        Ok(())
    }

    fn pdi_of(&self, bundle: &Vrtbin) -> Result<PathBuf> {
        bundle
            .pdi_path()
            .map(Path::to_path_buf)
            .ok_or_else(|| Error::ProgramFailed("bundle carries no PDI".into()))
    }

    /// Spawns the emulation/simulation executable as an owned child.
    fn spawn_backend(&mut self, bundle: &Vrtbin) -> Result<()> {
        let exec = bundle
            .executable_path()
            .ok_or_else(|| Error::TransportFailed("bundle carries no backend executable".into()))?;
        info!(exec = %exec.display(), "spawning backend");
        let child = Command::new(exec)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::os(format!("spawning {}", exec.display()), e))?;
        self.child = Some(child);
        Ok(())
    }

    // -- public surface ------------------------------------------------------

    /// The device's PCIe address.
    pub fn bdf(&self) -> &Bdf {
        &self.bdf
    }

    /// The platform this device runs on.
    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Whether the bundle was flat or segmented.
    pub fn bundle_type(&self) -> BundleType {
        self.bundle_type
    }

    /// Binds a live [`Kernel`] by name.
    pub fn kernel(&self, name: &str) -> Result<Kernel<'_>> {
        let desc = self
            .map
            .kernels
            .get(name)
            .cloned()
            .ok_or_else(|| Error::KernelNotFound(name.to_string()))?;
        Ok(Kernel::bind(self, desc))
    }

    /// The stream connections declared in the system map.
    pub fn qdma_connections(&self) -> &[QdmaConnection] {
        &self.map.qdma_connections
    }

    /// Reprograms the user clock. Hardware only; a no-op elsewhere.
    pub fn set_frequency(&self, freq_hz: u64) -> Result<()> {
        if self.platform != Platform::Hardware {
            return Ok(());
        }
        let ami = self.ami_ref()?;
        let mut regs = BarRegs {
            ami,
            base: CLK_WIZ_BASE,
        };
        self.clk
            .lock()
            .map_err(|_| Error::TransportFailed("clock mutex poisoned".into()))?
            .set_rate_hz(&mut regs, freq_hz)
    }

    /// The currently programmed user-clock frequency (0 off hardware).
    pub fn frequency(&self) -> u64 {
        if self.platform != Platform::Hardware {
            return 0;
        }
        self.clk.lock().map(|clk| clk.clock_rate()).unwrap_or(0)
    }

    /// The fabric's declared maximum frequency (0 off hardware).
    pub fn max_frequency(&self) -> u64 {
        if self.platform != Platform::Hardware {
            return 0;
        }
        self.clk.lock().map(|clk| clk.max_rate_hz()).unwrap_or(0)
    }

    /// Releases everything: DMA interfaces, the hardware handle, the
    /// per-BDF lock; tells a sim/emu backend to exit and reaps the child.
    ///
    /// Idempotent; also invoked best-effort on drop.
    pub fn cleanup(&mut self) {
        match self.platform {
            Platform::Hardware => {
                self.streams.clear();
                self.mm = None;
                self.ami = None;
            }
            Platform::Emulation | Platform::Simulation => {
                let mut exited = true;
                if self.child.is_some() {
                    if let Err(e) = self.messenger.exit() {
                        warn!(error = %e, "backend exit command failed");
                        exited = false;
                    }
                }
                if let Some(mut child) = self.child.take() {
                    if !exited {
                        let _ = child.kill();
                    }
                    let _ = child.wait();
                }
            }
        }
        self.lock = None;
    }

    // -- crate-internal plumbing ---------------------------------------------

    pub(crate) fn ami_ref(&self) -> Result<&AmiDevice> {
        self.ami
            .as_ref()
            .ok_or_else(|| Error::HardwareNotFound(self.bdf.to_string()))
    }

    fn hotplug_ref(&self) -> Result<&PcieDriverHandler> {
        self.hotplug
            .as_ref()
            .ok_or_else(|| Error::HardwareNotFound(self.bdf.to_string()))
    }

    pub(crate) fn messenger(&self) -> &Messenger {
        &self.messenger
    }

    pub(crate) fn mm_intf(&self) -> Result<&QdmaIntf> {
        self.mm
            .as_ref()
            .ok_or_else(|| Error::HardwareNotFound(self.bdf.to_string()))
    }

    pub(crate) fn stream_intf(&self, qid: u32) -> Option<&QdmaIntf> {
        self.streams.iter().find(|intf| intf.qid() == qid)
    }

    pub(crate) fn alloc(&self, size: u64, region: RegionKind, port: Option<u8>) -> Result<u64> {
        let mut allocator = self
            .allocator
            .lock()
            .map_err(|_| Error::TransportFailed("allocator mutex poisoned".into()))?;
        let addr = match port {
            Some(port) => allocator.allocate_on_port(size, region, port)?,
            None => allocator.allocate(size, region)?,
        };
        Ok(addr)
    }

    pub(crate) fn dealloc(&self, addr: u64) {
        if let Ok(mut allocator) = self.allocator.lock() {
            allocator.deallocate(addr);
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Runs an external script, mapping a non-zero exit to `err`.
fn run_script(cmd: &mut Command, err: impl Fn(String) -> Error) -> Result<()> {
    let program = format!("{:?}", cmd.get_program());
    let output = cmd
        .output()
        .map_err(|e| err(format!("failed to run {program}: {e}")))?;
    if !output.status.success() {
        return Err(err(format!(
            "{program} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Register access over the BAR
// ---------------------------------------------------------------------------

/// [`RegisterIo`] over the management BAR for an IP block at `base`.
struct BarRegs<'a> {
    ami: &'a AmiDevice,
    base: u64,
}

impl RegisterIo for BarRegs<'_> {
    fn read_reg(&mut self, offset: u32) -> Result<u32> {
        self.ami
            .bar_read32(self.base - crate::ami::BAR_APERTURE_BASE + u64::from(offset))
    }

    fn write_reg(&mut self, offset: u32, value: u32) -> Result<()> {
        self.ami
            .bar_write32(self.base - crate::ami::BAR_APERTURE_BASE + u64::from(offset), value)
    }
}

// ---------------------------------------------------------------------------
// Per-BDF exclusive access
// ---------------------------------------------------------------------------

/// Advisory exclusive lock on `<runtime-dir>/pcie_device_<BDF>.lock`.
///
/// Held for the lifetime of the `Device`; dropping releases it.
#[derive(Debug)]
struct DeviceLock {
    file: std::fs::File,
}

impl DeviceLock {
    fn acquire(runtime_dir: &Path, bdf: &Bdf) -> Result<Self> {
        let path = runtime_dir.join(format!("pcie_device_{bdf}.lock"));
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| Error::os(format!("opening lock file {}", path.display()), e))?;
        // SAFETY: flock on an fd we own.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            return Err(Error::DeviceBusy(bdf.to_string()));
        }
        Ok(Self { file })
    }
}

impl Drop for DeviceLock {
    fn drop(&mut self) {
        // SAFETY: unlocking an fd we own; close releases it regardless.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

#[cfg(test)]
impl Device {
    /// Builds a device around an in-process messenger peer, without
    /// touching hardware, locks, or bundles.
    pub(crate) fn stub(platform: Platform, map: SystemMap, endpoint: &str) -> Self {
        Self {
            bdf: Bdf::parse("21:00.0").unwrap(),
            platform,
            bundle_type: map.bundle_type,
            system_map_path: PathBuf::new(),
            clk: Mutex::new(ClkWiz::new(map.clock_frequency)),
            map,
            ami: None,
            hotplug: None,
            mm: None,
            streams: Vec::new(),
            allocator: Mutex::new(DeviceAllocator::new()),
            messenger: Messenger::with_endpoint(endpoint),
            child: None,
            lock: None,
        }
    }
}
