//! `slash-alloc` --- device-memory allocator for SLASH accelerator cards.
//!
//! The card exposes two DRAM regions: 32 GiB of HBM split into 32 × 1 GiB
//! ports (one per memory controller) and 32 GiB of DIMM DDR. The allocator
//! hands out device addresses from either region:
//!
//! - Requests smaller than half a superblock are bump-allocated from
//!   superblock carve-outs (4096 bytes by default), amortizing tracking cost.
//! - Larger requests reuse the region free list first, then claim the first
//!   stride-aligned gap in the used-block list.
//! - HBM requests may name a port; the allocation lands at the lowest free
//!   address of that port's window, spilling toward the following ports
//!   rather than failing. Placing every buffer on port 0 would serialize all
//!   traffic through one memory controller.
//!
//! Addresses are never relocated. First-fit is deliberate: device memory
//! fragmentation is rare in the workloads this serves.

mod region;

use std::collections::HashMap;

use thiserror::Error;

use region::{MemoryRegion, Superblock};

/// Starting device address of HBM.
pub const HBM_START: u64 = 0x40_0000_0000;
/// Total HBM size (32 GiB).
pub const HBM_SIZE: u64 = 32 * 1024 * 1024 * 1024;
/// Size of one HBM port (1 GiB).
pub const HBM_PORT_SIZE: u64 = 1024 * 1024 * 1024;
/// Number of HBM ports.
pub const HBM_PORT_COUNT: u8 = 32;

/// Starting device address of DIMM DDR.
pub const DDR_START: u64 = 0x600_0000_0000;
/// Total DDR size (32 GiB).
pub const DDR_SIZE: u64 = 32 * 1024 * 1024 * 1024;

/// Default superblock size in bytes.
pub const DEFAULT_SUPERBLOCK_SIZE: u64 = 4096;

/// Device memory region selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionKind {
    /// High-bandwidth memory, port-addressable.
    Hbm,
    /// DIMM DDR.
    Ddr,
}

/// Allocation failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AllocError {
    /// The region cannot satisfy the request.
    #[error("out of device memory: {size:#x} bytes in {region:?}")]
    OutOfMemory {
        /// Requested size in bytes.
        size: u64,
        /// Region the request targeted.
        region: RegionKind,
    },
    /// Port-addressed allocation in a region without ports.
    #[error("region {0:?} is not port-addressable")]
    InvalidRegion(RegionKind),
    /// HBM port index outside 0..=31.
    #[error("invalid HBM port {0}")]
    InvalidPort(u8),
}

#[derive(Debug, Clone, Copy)]
struct SmallAlloc {
    region: RegionKind,
    superblock: usize,
    size: u64,
}

/// Two-region, port-aware device-address allocator.
#[derive(Debug)]
pub struct DeviceAllocator {
    superblock_size: u64,
    hbm: MemoryRegion,
    ddr: MemoryRegion,
    /// Small allocations routed back to their superblock on deallocate.
    small: HashMap<u64, SmallAlloc>,
}

impl Default for DeviceAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceAllocator {
    /// Creates an allocator with the default superblock size.
    pub fn new() -> Self {
        Self::with_superblock_size(DEFAULT_SUPERBLOCK_SIZE)
    }

    /// Creates an allocator with a custom superblock size.
    pub fn with_superblock_size(superblock_size: u64) -> Self {
        Self {
            superblock_size,
            hbm: MemoryRegion::new(HBM_START, HBM_SIZE),
            ddr: MemoryRegion::new(DDR_START, DDR_SIZE),
            small: HashMap::new(),
        }
    }

    /// Total size of a region in bytes.
    pub fn region_size(&self, region: RegionKind) -> u64 {
        self.region_ref(region).size
    }

    /// Allocates `size` bytes from `region`.
    ///
    /// HBM requests without an explicit port land on port 0.
    pub fn allocate(&mut self, size: u64, region: RegionKind) -> Result<u64, AllocError> {
        match region {
            RegionKind::Hbm => self.allocate_on_port(size, region, 0),
            RegionKind::Ddr => {
                if size < self.superblock_size / 2 {
                    let superblock_size = self.superblock_size;
                    match small_allocate(self.region_mut(region), superblock_size, size) {
                        Some((addr, sb)) => {
                            self.record_small(addr, region, sb, size);
                            Ok(addr)
                        }
                        None => Err(AllocError::OutOfMemory { size, region }),
                    }
                } else {
                    let r = self.region_mut(region);
                    if let Some(addr) = r.reuse_free(size, |_| true) {
                        return Ok(addr);
                    }
                    let start = r.start;
                    r.claim_by_scan(start, size)
                        .ok_or(AllocError::OutOfMemory { size, region })
                }
            }
        }
    }

    /// Allocates `size` bytes from an HBM port window.
    ///
    /// The allocation starts at the lowest free address of
    /// `[port_base, port_base + 1 GiB)` and may spill into the window
    /// extending `2 × 8 GiB` past the port base before a final linear sweep.
    ///
    /// # Errors
    ///
    /// `InvalidPort` for ports outside 0..=31, `InvalidRegion` for non-HBM
    /// regions, `OutOfMemory` on exhaustion.
    pub fn allocate_on_port(
        &mut self,
        size: u64,
        region: RegionKind,
        port: u8,
    ) -> Result<u64, AllocError> {
        if port >= HBM_PORT_COUNT {
            return Err(AllocError::InvalidPort(port));
        }
        if region != RegionKind::Hbm {
            return Err(AllocError::InvalidRegion(region));
        }

        let superblock_size = self.superblock_size;
        let port_base = HBM_START + u64::from(port) * HBM_PORT_SIZE;
        let port_end = port_base + 2 * HBM_PORT_SIZE * 8;

        if size < superblock_size / 2 {
            let r = &mut self.hbm;
            // Existing superblocks whose start lies inside the port.
            let mut found = None;
            for (idx, sb) in r.superblocks.iter_mut().enumerate() {
                if sb.start() < port_base || sb.start() >= port_base + HBM_PORT_SIZE {
                    continue;
                }
                if let Some(addr) = sb.allocate(size) {
                    found = Some((addr, idx));
                    break;
                }
            }
            let (addr, idx) = match found {
                Some(hit) => hit,
                None => {
                    // Open a new superblock at the port base, stepping past
                    // any used blocks already covering it.
                    let sb_start = r.next_free_after(port_base, superblock_size);
                    if sb_start + superblock_size > r.end() {
                        return Err(AllocError::OutOfMemory { size, region });
                    }
                    r.superblocks.push(Superblock::new(sb_start, superblock_size));
                    r.used_blocks.push((sb_start, superblock_size));
                    let idx = r.superblocks.len() - 1;
                    let addr = r.superblocks[idx]
                        .allocate(size)
                        .expect("fresh superblock cannot be full");
                    (addr, idx)
                }
            };
            self.record_small(addr, region, idx, size);
            Ok(addr)
        } else {
            let r = &mut self.hbm;
            if let Some(addr) =
                r.reuse_free(size, |addr| addr >= port_base && addr < port_end)
            {
                return Ok(addr);
            }
            // Lowest free address inside the port window. The window may
            // run past the end of HBM for high ports; clamp it.
            let window_end = port_end.min(r.end());
            let next_free = r.next_free_after(port_base, size);
            if next_free + size <= window_end {
                r.used_blocks.push((next_free, size));
                return Ok(next_free);
            }
            // Window exhausted: linear sweep from the port base.
            r.claim_by_scan(port_base, size)
                .ok_or(AllocError::OutOfMemory { size, region })
        }
    }

    /// Returns an address to its region.
    ///
    /// Superblock-backed addresses rejoin their superblock's free list; the
    /// superblock range itself stays reserved until the allocator drops.
    /// Addresses the allocator never produced are ignored.
    pub fn deallocate(&mut self, addr: u64) {
        if let Some(alloc) = self.small.remove(&addr) {
            let r = self.region_mut(alloc.region);
            r.superblocks[alloc.superblock].deallocate(addr, alloc.size);
            return;
        }
        for region in [RegionKind::Hbm, RegionKind::Ddr] {
            let r = self.region_mut(region);
            if r.contains(addr) {
                r.release(addr);
                return;
            }
        }
    }

    fn record_small(&mut self, addr: u64, region: RegionKind, superblock: usize, size: u64) {
        self.small.insert(
            addr,
            SmallAlloc {
                region,
                superblock,
                size,
            },
        );
    }

    fn region_ref(&self, region: RegionKind) -> &MemoryRegion {
        match region {
            RegionKind::Hbm => &self.hbm,
            RegionKind::Ddr => &self.ddr,
        }
    }

    fn region_mut(&mut self, region: RegionKind) -> &mut MemoryRegion {
        match region {
            RegionKind::Hbm => &mut self.hbm,
            RegionKind::Ddr => &mut self.ddr,
        }
    }
}

/// Small-path allocation for the non-port case: first-fit across existing
/// superblocks, else a new superblock at the region bump position.
fn small_allocate(r: &mut MemoryRegion, superblock_size: u64, size: u64) -> Option<(u64, usize)> {
    for (idx, sb) in r.superblocks.iter_mut().enumerate() {
        if let Some(addr) = sb.allocate(size) {
            return Some((addr, idx));
        }
    }
    // New superblock at the bump position, stepping past large blocks.
    let sb_start = r.next_free_after(r.start + r.offset, superblock_size);
    if sb_start + superblock_size > r.end() {
        return None;
    }
    r.superblocks.push(Superblock::new(sb_start, superblock_size));
    r.used_blocks.push((sb_start, superblock_size));
    r.offset = sb_start + superblock_size - r.start;
    let idx = r.superblocks.len() - 1;
    let addr = r.superblocks[idx].allocate(size)?;
    Some((addr, idx))
}
