//! Property tests for the device allocator.
//!
//! Random allocation sequences must produce pairwise non-overlapping blocks,
//! port-addressed allocations must stay inside their port window, and freed
//! blocks must be reused below the high-water mark.

use proptest::prelude::*;
use proptest::test_runner::TestCaseError;

use slash_alloc::{DeviceAllocator, HBM_PORT_SIZE, HBM_START, RegionKind};

const MIB: u64 = 1024 * 1024;

fn assert_disjoint(blocks: &[(u64, u64)]) -> Result<(), TestCaseError> {
    for (i, &(a, asz)) in blocks.iter().enumerate() {
        for &(b, bsz) in &blocks[i + 1..] {
            prop_assert!(
                a + asz <= b || b + bsz <= a,
                "overlap: {a:#x}+{asz:#x} vs {b:#x}+{bsz:#x}"
            );
        }
    }
    Ok(())
}

// Mixed small and large request sizes, biased toward the interesting
// superblock boundary.
fn size_strategy() -> impl Strategy<Value = u64> {
    prop_oneof![
        1u64..2048,          // superblock path
        2048u64..(4 * MIB),  // used-block scan path
    ]
}

proptest! {
    #[test]
    fn allocations_are_pairwise_disjoint(
        sizes in prop::collection::vec(size_strategy(), 1..24),
        region_is_hbm in any::<bool>(),
    ) {
        let region = if region_is_hbm { RegionKind::Hbm } else { RegionKind::Ddr };
        let mut alloc = DeviceAllocator::new();
        let mut blocks = Vec::new();
        for size in sizes {
            let addr = alloc.allocate(size, region).unwrap();
            blocks.push((addr, size));
        }
        assert_disjoint(&blocks)?;
    }

    #[test]
    fn port_allocations_stay_in_window(
        requests in prop::collection::vec((size_strategy(), 0u8..32), 1..16),
    ) {
        let mut alloc = DeviceAllocator::new();
        let mut blocks = Vec::new();
        for (size, port) in requests {
            let addr = alloc.allocate_on_port(size, RegionKind::Hbm, port).unwrap();
            let port_base = HBM_START + u64::from(port) * HBM_PORT_SIZE;
            prop_assert!(
                addr >= port_base && addr + size <= port_base + 2 * HBM_PORT_SIZE,
                "port {port}: {addr:#x}+{size:#x} outside [{port_base:#x}, +2 GiB)"
            );
            blocks.push((addr, size));
        }
        assert_disjoint(&blocks)?;
    }

    #[test]
    fn freed_blocks_are_reused_below_high_water(
        size in size_strategy(),
    ) {
        let mut alloc = DeviceAllocator::new();
        let first = alloc.allocate(size, RegionKind::Ddr).unwrap();
        let second = alloc.allocate(size, RegionKind::Ddr).unwrap();
        let high_water = first.max(second) + size;
        alloc.deallocate(first);
        let reused = alloc.allocate(size, RegionKind::Ddr).unwrap();
        prop_assert!(reused < high_water, "no reuse: {reused:#x} >= {high_water:#x}");
    }

    #[test]
    fn interleaved_free_and_allocate_stays_disjoint(
        sizes in prop::collection::vec(size_strategy(), 4..16),
    ) {
        let mut alloc = DeviceAllocator::new();
        let mut live: Vec<(u64, u64)> = Vec::new();
        for (i, size) in sizes.iter().copied().enumerate() {
            let addr = alloc.allocate(size, RegionKind::Hbm).unwrap();
            live.push((addr, size));
            // Free every third block to exercise the free lists.
            if i % 3 == 2 {
                let (freed, _) = live.remove(0);
                alloc.deallocate(freed);
            }
            assert_disjoint(&live)?;
        }
    }
}
