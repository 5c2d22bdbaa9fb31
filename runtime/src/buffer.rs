//! Host-mirrored device buffers.
//!
//! A [`Buffer`] owns a host-side mirror of `N` elements and a device
//! allocation drawn from the owning device's allocator; `sync` moves the
//! bytes in one direction. The device address doubles as the buffer's
//! identity on the emulation backend (formatted in decimal), so every
//! platform allocates one.

use tracing::debug;

use slash_alloc::RegionKind;
use slash_sysmap::Platform;

use crate::device::Device;
use crate::error::{Error, Result};

/// Direction of a buffer synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    /// Push host bytes to the device.
    HostToDevice,
    /// Pull device bytes to the host.
    DeviceToHost,
}

/// Host mirror plus device allocation for `len` elements of `T`.
#[derive(Debug)]
pub struct Buffer<'a, T> {
    device: &'a Device,
    data: Vec<T>,
    addr: u64,
    allocated: u64,
}

impl<'a, T: Copy + Default> Buffer<'a, T> {
    /// Allocates a buffer of `len` elements in `region`.
    pub fn new(device: &'a Device, len: usize, region: RegionKind) -> Result<Self> {
        let bytes = byte_len::<T>(len);
        let addr = device.alloc(bytes, region, None)?;
        Ok(Self::assemble(device, len, addr, bytes))
    }

    /// Allocates a buffer of `len` elements on a specific HBM port.
    pub fn new_on_port(
        device: &'a Device,
        len: usize,
        region: RegionKind,
        port: u8,
    ) -> Result<Self> {
        let bytes = byte_len::<T>(len);
        let addr = device.alloc(bytes, region, Some(port))?;
        Ok(Self::assemble(device, len, addr, bytes))
    }

    fn assemble(device: &'a Device, len: usize, addr: u64, allocated: u64) -> Self {
        debug!(
            addr = format_args!("{addr:#x}"),
            bytes = allocated,
            "buffer allocated"
        );
        Self {
            device,
            data: vec![T::default(); len],
            addr,
            allocated,
        }
    }

    /// Device address of the allocation.
    pub fn device_address(&self) -> u64 {
        self.addr
    }

    /// Number of elements in the host mirror.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the buffer holds no elements.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Reads the element at `index`.
    ///
    /// # Errors
    ///
    /// `OutOfRange` when `index >= len`.
    pub fn get(&self, index: usize) -> Result<T> {
        self.data.get(index).copied().ok_or(Error::OutOfRange {
            index,
            len: self.data.len(),
        })
    }

    /// Writes the element at `index`.
    ///
    /// # Errors
    ///
    /// `OutOfRange` when `index >= len`.
    pub fn set(&mut self, index: usize, value: T) -> Result<()> {
        let len = self.data.len();
        match self.data.get_mut(index) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(Error::OutOfRange { index, len }),
        }
    }

    /// The host mirror as a slice.
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    /// The host mirror as a mutable slice.
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Moves the mirror's bytes in the given direction.
    ///
    /// Hardware transfers through the memory-mapped DMA queue at the
    /// allocation address; simulation and emulation route through the
    /// messenger, addressed by device address and by decimal buffer name
    /// respectively.
    pub fn sync(&mut self, direction: SyncDirection) -> Result<()> {
        let bytes = byte_len::<T>(self.data.len());
        if bytes > self.allocated {
            return Err(Error::SizeMismatch {
                requested: bytes,
                allocated: self.allocated,
            });
        }

        match (self.device.platform(), direction) {
            (Platform::Hardware, SyncDirection::HostToDevice) => {
                self.device.mm_intf()?.write_buff(self.bytes(), self.addr)
            }
            (Platform::Hardware, SyncDirection::DeviceToHost) => {
                let addr = self.addr;
                let intf = self.device.mm_intf()?;
                // Read into a scratch vector to keep the mirror intact on
                // failure.
                let mut scratch = vec![0u8; bytes as usize];
                intf.read_buff(&mut scratch, addr)?;
                self.bytes_mut().copy_from_slice(&scratch);
                Ok(())
            }
            (Platform::Simulation, SyncDirection::HostToDevice) => {
                self.device.messenger().send_buffer_at(self.addr, self.bytes())
            }
            (Platform::Simulation, SyncDirection::DeviceToHost) => {
                let fetched = self.device.messenger().fetch_buffer_at(self.addr, bytes)?;
                self.copy_in(&fetched);
                Ok(())
            }
            (Platform::Emulation, SyncDirection::HostToDevice) => self
                .device
                .messenger()
                .send_buffer(&self.addr.to_string(), self.bytes()),
            (Platform::Emulation, SyncDirection::DeviceToHost) => {
                let fetched = self.device.messenger().fetch_buffer(&self.addr.to_string())?;
                self.copy_in(&fetched);
                Ok(())
            }
        }
    }

    fn copy_in(&mut self, fetched: &[u8]) {
        let take = fetched.len().min(self.bytes().len());
        self.bytes_mut()[..take].copy_from_slice(&fetched[..take]);
    }

    fn bytes(&self) -> &[u8] {
        // SAFETY: T is Copy plain data; the mirror is initialized and the
        // byte length matches the element count.
        unsafe {
            std::slice::from_raw_parts(
                self.data.as_ptr().cast::<u8>(),
                std::mem::size_of_val(self.data.as_slice()),
            )
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above; writing any byte pattern is fine for Copy
        // numeric payloads.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.data.as_mut_ptr().cast::<u8>(),
                std::mem::size_of_val(self.data.as_slice()),
            )
        }
    }
}

impl<T> Drop for Buffer<'_, T> {
    fn drop(&mut self) {
        self.device.dealloc(self.addr);
    }
}

fn byte_len<T>(len: usize) -> u64 {
    (len * std::mem::size_of::<T>()) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::test_support::{spawn_peer, stub_map};

    fn emu_device(endpoint: &str) -> Device {
        Device::stub(Platform::Emulation, stub_map("Emulation"), endpoint)
    }

    // ---- Indexing -----------------------------------------------------------

    #[test]
    fn indexing_is_bounds_checked() {
        let device = emu_device("127.0.0.1:1");
        let mut buffer = Buffer::<u32>::new(&device, 4, RegionKind::Hbm).unwrap();

        buffer.set(3, 42).unwrap();
        assert_eq!(buffer.get(3).unwrap(), 42);
        assert!(matches!(
            buffer.get(4).unwrap_err(),
            Error::OutOfRange { index: 4, len: 4 }
        ));
        assert!(matches!(
            buffer.set(9, 0).unwrap_err(),
            Error::OutOfRange { index: 9, len: 4 }
        ));
    }

    #[test]
    fn buffers_draw_distinct_device_addresses() {
        let device = emu_device("127.0.0.1:1");
        let a = Buffer::<u8>::new(&device, 64, RegionKind::Hbm).unwrap();
        let b = Buffer::<u8>::new(&device, 64, RegionKind::Hbm).unwrap();
        assert_ne!(a.device_address(), b.device_address());
    }

    #[test]
    fn dropping_a_buffer_returns_its_allocation() {
        let device = emu_device("127.0.0.1:1");
        let addr = {
            let buffer = Buffer::<u8>::new(&device, 64, RegionKind::Hbm).unwrap();
            buffer.device_address()
        };
        let next = Buffer::<u8>::new(&device, 64, RegionKind::Hbm).unwrap();
        assert_eq!(next.device_address(), addr);
    }

    #[test]
    fn port_placement_is_honored() {
        let device = emu_device("127.0.0.1:1");
        let buffer =
            Buffer::<u64>::new_on_port(&device, 1 << 17, RegionKind::Hbm, 7).unwrap();
        let base = slash_alloc::HBM_START + 7 * slash_alloc::HBM_PORT_SIZE;
        assert!(buffer.device_address() >= base);
        assert!(buffer.device_address() < base + 2 * slash_alloc::HBM_PORT_SIZE);
    }

    // ---- Emulation sync -----------------------------------------------------

    #[test]
    fn emulation_sync_roundtrips_by_decimal_name() {
        let (endpoint, peer) = spawn_peer(vec![b"\"OK\"".to_vec(), b"[1,0,0,0,2,0,0,0]".to_vec()]);
        let device = emu_device(&endpoint);
        let mut buffer = Buffer::<u32>::new(&device, 2, RegionKind::Hbm).unwrap();
        buffer.set(0, 1).unwrap();
        buffer.set(1, 2).unwrap();

        buffer.sync(SyncDirection::HostToDevice).unwrap();
        buffer.sync(SyncDirection::DeviceToHost).unwrap();
        assert_eq!(buffer.as_slice(), &[1, 2]);

        let seen = peer.join().unwrap();
        let name = buffer.device_address().to_string();
        assert_eq!(seen[0].0["command"], "populate");
        assert_eq!(seen[0].0["name"], name.as_str());
        assert_eq!(seen[0].1.as_deref(), Some(&[1, 0, 0, 0, 2, 0, 0, 0][..]));
        assert_eq!(seen[1].0["command"], "fetch");
        assert_eq!(seen[1].0["name"], name.as_str());
    }

    // ---- Simulation sync ----------------------------------------------------

    #[test]
    fn simulation_sync_is_addressed_by_device_address() {
        let (endpoint, peer) = spawn_peer(vec![b"\"OK\"".to_vec()]);
        let device = Device::stub(Platform::Simulation, stub_map("Simulation"), &endpoint);
        let mut buffer = Buffer::<u16>::new(&device, 3, RegionKind::Ddr).unwrap();
        buffer.as_mut_slice().copy_from_slice(&[10, 20, 30]);

        buffer.sync(SyncDirection::HostToDevice).unwrap();

        let seen = peer.join().unwrap();
        assert_eq!(seen[0].0["command"], "populate");
        assert_eq!(seen[0].0["addr"], buffer.device_address());
        assert_eq!(seen[0].0["size"], 6);
    }
}
