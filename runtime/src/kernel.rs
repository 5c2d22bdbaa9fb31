//! Kernel register-file abstraction.
//!
//! A [`Kernel`] is a live view of one kernel's register file. Arguments are
//! marshalled in declaration order into a deferred write plan: descriptors
//! flagged wide at parse time consume two consecutive offsets (low word,
//! high word), everything else one. Nothing touches the device until the
//! plan is submitted --- on hardware as a single MMIO burst from offset 0x10
//! through the highest live offset, on simulation as per-register messenger
//! writes, on emulation as one JSON `call`.
//!
//! Register offset 0 is the control register: bit 0 starts the kernel,
//! bit 7 enables auto-restart. The first sixteen bytes are the reserved
//! control block, so the argument cursor begins at register index 4.

use std::collections::BTreeMap;

use serde_json::{Value, json};
use tracing::debug;

use slash_sysmap::{KernelDesc, Platform, RegisterDesc};

use crate::ami::BAR_APERTURE_BASE;
use crate::buffer::Buffer;
use crate::device::Device;
use crate::error::{Error, Result};

/// Control register offset.
const CTRL_OFFSET: u32 = 0x00;
/// Control bit 0: start.
const CTRL_START: u32 = 0x01;
/// Control bits 0+7: start with auto-restart.
const CTRL_START_AUTORESTART: u32 = 0x81;
/// First register index available for arguments.
const FIRST_ARG_INDEX: usize = 4;
/// First byte offset covered by the batched write.
const BATCH_BASE: u32 = 0x10;

/// One kernel argument.
///
/// The marshaller widens or narrows the value to match the descriptor it
/// lands on; `BufferRef` carries a device address and is what the emulation
/// backend serializes as a named buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arg {
    /// A 32-bit scalar.
    Scalar32(u32),
    /// A 64-bit scalar.
    Scalar64(u64),
    /// A device address naming a buffer.
    BufferRef(u64),
}

impl Arg {
    fn as_u64(self) -> u64 {
        match self {
            Self::Scalar32(v) => u64::from(v),
            Self::Scalar64(v) => v,
            Self::BufferRef(addr) => addr,
        }
    }
}

impl From<u32> for Arg {
    fn from(v: u32) -> Self {
        Self::Scalar32(v)
    }
}

impl From<i32> for Arg {
    fn from(v: i32) -> Self {
        Self::Scalar32(v as u32)
    }
}

impl From<u64> for Arg {
    fn from(v: u64) -> Self {
        Self::Scalar64(v)
    }
}

impl From<usize> for Arg {
    fn from(v: usize) -> Self {
        Self::Scalar64(v as u64)
    }
}

impl From<f32> for Arg {
    fn from(v: f32) -> Self {
        Self::Scalar32(v.to_bits())
    }
}

impl<T: Copy + Default> From<&Buffer<'_, T>> for Arg {
    fn from(buffer: &Buffer<'_, T>) -> Self {
        Self::BufferRef(buffer.device_address())
    }
}

/// Builds an argument slice from typed values.
///
/// ```ignore
/// kernel.call(&args![1024u32, &input, 3.14f32])?;
/// ```
#[macro_export]
macro_rules! args {
    ($($arg:expr),* $(,)?) => {
        [$($crate::kernel::Arg::from($arg)),*]
    };
}

/// Live register-file view of one kernel.
#[derive(Debug)]
pub struct Kernel<'a> {
    device: &'a Device,
    desc: KernelDesc,
    autorestart: bool,
}

impl<'a> Kernel<'a> {
    pub(crate) fn bind(device: &'a Device, desc: KernelDesc) -> Self {
        Self {
            device,
            desc,
            autorestart: false,
        }
    }

    /// Kernel instance name.
    pub fn name(&self) -> &str {
        &self.desc.name
    }

    /// Base address of the register file inside the BAR aperture.
    pub fn base_addr(&self) -> u64 {
        self.desc.base_addr
    }

    /// Enables or disables auto-restart on subsequent starts.
    pub fn set_autorestart(&mut self, autorestart: bool) {
        self.autorestart = autorestart;
    }

    /// Writes one register.
    ///
    /// Hardware writes through the BAR; simulation routes the absolute
    /// address through the messenger; emulation has no register file to
    /// write, so the call is a no-op there.
    pub fn write(&self, offset: u32, value: u32) -> Result<()> {
        match self.device.platform() {
            Platform::Hardware => {
                debug!(
                    kernel = %self.desc.name,
                    offset = format_args!("{offset:#x}"),
                    value = format_args!("{value:#x}"),
                    "register write"
                );
                let bar = self.desc.base_addr - BAR_APERTURE_BASE + u64::from(offset);
                self.device.ami_ref()?.bar_write32(bar, value)
            }
            Platform::Simulation => self
                .device
                .messenger()
                .write_reg(self.desc.base_addr + u64::from(offset), value),
            Platform::Emulation => Ok(()),
        }
    }

    /// Reads one register.
    ///
    /// On emulation the offset is mapped back to its argument slot (using
    /// the same wide-pair rule as marshalling) and fetched by index;
    /// offsets that map to no slot read as zero.
    pub fn read(&self, offset: u32) -> Result<u32> {
        match self.device.platform() {
            Platform::Hardware => {
                let bar = self.desc.base_addr - BAR_APERTURE_BASE + u64::from(offset);
                self.device.ami_ref()?.bar_read32(bar)
            }
            Platform::Simulation => self
                .device
                .messenger()
                .fetch_scalar_at(self.desc.base_addr + u64::from(offset)),
            Platform::Emulation => match arg_index_for_offset(&self.desc.registers, offset) {
                Some(index) => self
                    .device
                    .messenger()
                    .fetch_scalar(&self.desc.name, &format!("arg{index}")),
                None => Ok(0),
            },
        }
    }

    /// Marshals `args` and starts the kernel without waiting.
    pub fn start(&mut self, arguments: &[Arg]) -> Result<()> {
        match self.device.platform() {
            Platform::Hardware => {
                let plan = marshal(&self.desc, arguments)?;
                self.write_batch(&plan)?;
                self.start_kernel()
            }
            Platform::Simulation => {
                let plan = marshal(&self.desc, arguments)?;
                for (&offset, &value) in &plan {
                    self.write(offset, value)?;
                }
                self.start_kernel()
            }
            Platform::Emulation => {
                let command = emu_call_json(&self.desc, arguments)?;
                self.device.messenger().send_command(command)
            }
        }
    }

    /// Polls the control register until the kernel is idle.
    ///
    /// A `wait` without a prior `start` returns immediately: the start bit
    /// is already clear. Emulation completes synchronously inside the
    /// `call` message, so `wait` is a no-op there.
    pub fn wait(&self) -> Result<()> {
        if self.device.platform() == Platform::Emulation {
            return Ok(());
        }
        loop {
            let ctrl = self.read(CTRL_OFFSET)?;
            if ctrl != CTRL_START && ctrl != CTRL_START_AUTORESTART {
                return Ok(());
            }
        }
    }

    /// `start` followed by `wait`.
    pub fn call(&mut self, arguments: &[Arg]) -> Result<()> {
        self.start(arguments)?;
        self.wait()
    }

    fn start_kernel(&self) -> Result<()> {
        let word = if self.autorestart {
            CTRL_START_AUTORESTART
        } else {
            CTRL_START
        };
        self.write(CTRL_OFFSET, word)
    }

    /// Submits the plan as one MMIO burst covering offsets
    /// `0x10..=highest`, gaps filled with zero.
    fn write_batch(&self, plan: &BTreeMap<u32, u32>) -> Result<()> {
        let Some((base, words)) = batch_words(plan) else {
            return Ok(());
        };
        debug!(
            kernel = %self.desc.name,
            words = words.len(),
            "batched register write"
        );
        let bar = self.desc.base_addr - BAR_APERTURE_BASE + u64::from(base);
        self.device.ami_ref()?.bar_write_range(bar, &words)
    }
}

// ---------------------------------------------------------------------------
// Marshalling
// ---------------------------------------------------------------------------

/// Marshals arguments into an offset-to-value plan.
///
/// The cursor starts at register index 4 and advances by two for wide
/// descriptors, one otherwise. Mutates nothing but the returned plan.
pub(crate) fn marshal(desc: &KernelDesc, arguments: &[Arg]) -> Result<BTreeMap<u32, u32>> {
    let registers = &desc.registers;
    let mut plan = BTreeMap::new();
    let mut cursor = FIRST_ARG_INDEX;

    for arg in arguments {
        if cursor >= registers.len() {
            return Err(too_many(desc, arguments));
        }
        let value = arg.as_u64();
        if registers[cursor].is_wide() {
            if cursor + 1 >= registers.len() {
                return Err(too_many(desc, arguments));
            }
            plan.insert(registers[cursor].offset, value as u32);
            plan.insert(registers[cursor + 1].offset, (value >> 32) as u32);
            cursor += 2;
        } else {
            plan.insert(registers[cursor].offset, value as u32);
            cursor += 1;
        }
    }
    Ok(plan)
}

fn too_many(desc: &KernelDesc, arguments: &[Arg]) -> Error {
    Error::TooManyArguments {
        kernel: desc.name.clone(),
        args: arguments.len(),
    }
}

/// Builds the dense burst: `(base_offset, words)` covering `0x10..=highest`.
/// Returns `None` for an empty plan.
pub(crate) fn batch_words(plan: &BTreeMap<u32, u32>) -> Option<(u32, Vec<u32>)> {
    let highest = *plan.keys().next_back()?;
    if highest < BATCH_BASE {
        return None;
    }
    let mut words = vec![0u32; ((highest - BATCH_BASE) / 4 + 1) as usize];
    for (&offset, &value) in plan {
        if offset >= BATCH_BASE {
            words[((offset - BATCH_BASE) / 4) as usize] = value;
        }
    }
    Some((BATCH_BASE, words))
}

/// Builds the emulation `call` command.
///
/// Wide slots serialize as named buffers --- the name is the device address
/// in decimal, a convention the emulator side depends on.
pub(crate) fn emu_call_json(desc: &KernelDesc, arguments: &[Arg]) -> Result<Value> {
    let registers = &desc.registers;
    let mut args_obj = serde_json::Map::new();
    let mut cursor = FIRST_ARG_INDEX;

    for (index, arg) in arguments.iter().enumerate() {
        if cursor >= registers.len() {
            return Err(too_many(desc, arguments));
        }
        let entry = if registers[cursor].is_wide() {
            cursor += 2;
            json!({ "type": "buffer", "name": arg.as_u64().to_string() })
        } else {
            cursor += 1;
            json!({ "type": "scalar", "value": arg.as_u64() as u32 })
        };
        args_obj.insert(format!("arg{index}"), entry);
    }

    Ok(json!({
        "command": "call",
        "function": desc.name,
        "args": Value::Object(args_obj),
    }))
}

/// Recovers the argument index addressed by a register offset, walking the
/// descriptor list with the same pairing rule as marshalling.
pub(crate) fn arg_index_for_offset(registers: &[RegisterDesc], offset: u32) -> Option<usize> {
    let mut cursor = FIRST_ARG_INDEX;
    let mut index = 0;
    while cursor < registers.len() {
        if registers[cursor].is_wide() {
            cursor += 2;
        } else {
            if registers[cursor].offset == offset {
                return Some(index);
            }
            cursor += 1;
        }
        index += 1;
    }
    None
}
