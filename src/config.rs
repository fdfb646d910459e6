//! Launch geometry and sorter options.
//!
//! [`DeviceConfiguration::compute`] is the sizing engine: a pure function of
//! the device capabilities and of whether the kernels come from a pre-built
//! binary. Nothing here touches a device.

use crate::device::DeviceProperties;
use crate::kernels::Provisioning;
use crate::scan::ScanStrategy;

/// Bits sorted per pass.
pub const N_RADIX: u32 = 8;
/// Histogram bins per block and pass.
pub const BIN_SIZE: u32 = 1 << N_RADIX;
/// Width of the sorted keys.
pub const KEY_BITS: u32 = 32;

pub const DEFAULT_WARP_SIZE: u32 = 32;
pub const DEFAULT_NUM_WARPS_PER_BLOCK: u32 = 8;
pub const DEFAULT_COUNT_BLOCK_SIZE: u32 = DEFAULT_WARP_SIZE * DEFAULT_NUM_WARPS_PER_BLOCK;
pub const DEFAULT_SCAN_BLOCK_SIZE: u32 = DEFAULT_WARP_SIZE * DEFAULT_NUM_WARPS_PER_BLOCK;
pub const DEFAULT_SORT_BLOCK_SIZE: u32 = DEFAULT_WARP_SIZE * DEFAULT_NUM_WARPS_PER_BLOCK;

/// Count-phase blocks used when the multiprocessor count is unknown.
pub const MIN_NUM_BLOCKS: u32 = 16;

/// Largest block any phase is sized to.
pub const MAX_THREADS_PER_BLOCK: u32 = 1024;
/// Upper bound on count-phase blocks; keeps the histogram length within
/// `u32` and the grid within a dispatch dimension.
pub const MAX_NUM_BLOCKS: u32 = 65_535;

/// Threads of the block-resident single pass kernel.
pub const SINGLE_SORT_WG_SIZE: u32 = 128;
/// Keys each single pass thread keeps in local memory.
pub const SINGLE_SORT_N_ITEMS_PER_WI: u32 = 12;
/// Inputs shorter than this are sorted by the single pass kernel.
pub const SINGLE_PASS_THRESHOLD: usize = (SINGLE_SORT_WG_SIZE * SINGLE_SORT_N_ITEMS_PER_WI) as usize;

/// Launch geometry shared by every sort call of one sorter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConfiguration {
    pub warp_size: u32,
    pub count_threads_per_block: u32,
    pub scan_threads_per_block: u32,
    pub sort_threads_per_block: u32,
    pub sort_warps_per_block: u32,
    /// Resident sort blocks per multiprocessor.
    pub occupancy: u32,
    /// Blocks of the count and scatter phases.
    pub count_blocks: u32,
    /// Blocks of the device-parallel scan.
    pub scan_blocks: u32,
}

impl DeviceConfiguration {
    /// Derives the launch geometry for `props`.
    ///
    /// With `prebuilt` the baked defaults replace every device query except
    /// the multiprocessor figures, since a pre-built binary was compiled for a
    /// fixed geometry. Zero capability values silently fall back to defaults.
    pub fn compute(props: &DeviceProperties, prebuilt: bool) -> Self {
        let (warp_size, count, scan, sort) = if prebuilt {
            (
                DEFAULT_WARP_SIZE,
                DEFAULT_COUNT_BLOCK_SIZE,
                DEFAULT_SCAN_BLOCK_SIZE,
                DEFAULT_SORT_BLOCK_SIZE,
            )
        } else {
            let per_phase = |default: u32| {
                if props.max_threads_per_block > 0 {
                    props.max_threads_per_block.min(MAX_THREADS_PER_BLOCK)
                } else {
                    default
                }
            };
            let warp_size = if props.warp_size > 0 {
                props.warp_size.min(MAX_THREADS_PER_BLOCK)
            } else {
                DEFAULT_WARP_SIZE
            };
            (
                warp_size,
                per_phase(DEFAULT_COUNT_BLOCK_SIZE),
                per_phase(DEFAULT_SCAN_BLOCK_SIZE),
                per_phase(DEFAULT_SORT_BLOCK_SIZE),
            )
        };

        let count_threads_per_block = align_to_warp(count, warp_size);
        let scan_threads_per_block = align_to_warp(scan, warp_size);
        let sort_threads_per_block = align_to_warp(sort, warp_size);

        let occupancy = occupancy(props, warp_size, sort_threads_per_block);
        let count_blocks = count_blocks(props, occupancy, scan_threads_per_block);
        let scan_blocks = BIN_SIZE * count_blocks / scan_threads_per_block;

        Self {
            warp_size,
            count_threads_per_block,
            scan_threads_per_block,
            sort_threads_per_block,
            sort_warps_per_block: sort_threads_per_block / warp_size,
            occupancy,
            count_blocks,
            scan_blocks,
        }
    }

    /// Length of the histogram buffer: one row of bins per count block.
    pub fn histogram_len(&self) -> usize {
        BIN_SIZE as usize * self.count_blocks as usize
    }

    /// Keys each count/scatter block handles for an input of `n` keys.
    pub fn items_per_block(&self, n: u32) -> u32 {
        n.div_ceil(self.count_blocks)
    }
}

fn align_to_warp(threads: u32, warp_size: u32) -> u32 {
    (threads / warp_size).max(1) * warp_size
}

fn occupancy(props: &DeviceProperties, warp_size: u32, sort_threads: u32) -> u32 {
    let warps_per_block = (sort_threads / warp_size).max(1);
    let warps_per_multiprocessor = props.max_threads_per_multiprocessor / warp_size;
    let from_warps = if warps_per_multiprocessor > 0 {
        warps_per_multiprocessor / warps_per_block
    } else {
        1
    };

    from_warps.max(1)
}

fn count_blocks(props: &DeviceProperties, occupancy: u32, scan_threads: u32) -> u32 {
    let blocks = if props.multiprocessor_count > 0 {
        props.multiprocessor_count.saturating_mul(occupancy)
    } else {
        MIN_NUM_BLOCKS
    };
    let blocks = blocks.min(MAX_NUM_BLOCKS);

    // BIN_SIZE * blocks must divide evenly by the scan block size.
    let granule = scan_threads / gcd(scan_threads, BIN_SIZE);
    (blocks / granule).max(1) * granule
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let r = a % b;
        a = b;
        b = r;
    }
    a
}

bitflags::bitflags! {
    /// Sorter behaviour switches.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Flags: u32 {
        /// Log the kernel source, each kernel's footprint and the occupancy.
        const LOG = 1 << 0;
    }
}

impl Default for Flags {
    fn default() -> Self {
        Flags::empty()
    }
}

/// Options fixed at construction of a sorter.
#[derive(Debug, Clone, Default)]
pub struct SortOptions {
    pub provisioning: Provisioning,
    pub scan: ScanStrategy,
    pub flags: Flags,
}

impl SortOptions {
    pub fn with_provisioning(mut self, provisioning: Provisioning) -> Self {
        self.provisioning = provisioning;
        self
    }

    pub fn with_scan(mut self, scan: ScanStrategy) -> Self {
        self.scan = scan;
        self
    }

    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }
}
