//! Exclusive prefix sum over the per-block histogram.

use crate::buffers::TemporaryBuffers;
use crate::config::DeviceConfiguration;
use crate::device::{Device, KernelArg, LaunchDims};
use crate::error::Result;
use crate::kernels::{KernelRegistry, KernelRole};

/// How the histogram is scanned between the count and scatter phases.
/// Fixed per sorter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ScanStrategy {
    /// Round trip through host memory and a serial scan.
    Host,
    /// Single workgroup scan when the histogram fits one block, otherwise the
    /// two level scan with ready-flag propagation between blocks. Sorts of
    /// more than [`Device::max_scan_total`] keys are rejected.
    #[default]
    Device,
}

/// Serial exclusive scan. Accumulates in `u32` and wraps on overflow.
pub fn exclusive_scan(counts: &[u32]) -> Vec<u32> {
    let mut offsets = Vec::with_capacity(counts.len());
    let mut sum = 0u32;
    for &count in counts {
        offsets.push(sum);
        sum = sum.wrapping_add(count);
    }
    offsets
}

/// Scans `counts` on the host and writes the offsets into `offsets`.
///
/// Blocks until the queue has drained before reading, and again before the
/// copy-back is issued. `counts` and `offsets` may be the same buffer.
pub fn exclusive_scan_host<D: Device>(
    device: &D,
    counts: &D::Buffer,
    offsets: &D::Buffer,
    queue: &D::Queue,
) -> Result<()> {
    device.synchronize(queue)?;
    let host = device.read(counts, queue)?;
    let scanned = exclusive_scan(&host);
    device.synchronize(queue)?;
    device.write(offsets, &scanned, queue)
}

/// Replaces the histogram with its exclusive scan.
pub(crate) fn scan_histogram<D: Device>(
    device: &D,
    strategy: ScanStrategy,
    config: &DeviceConfiguration,
    kernels: &KernelRegistry<D::Kernel>,
    buffers: &TemporaryBuffers<D::Buffer>,
    queue: &D::Queue,
) -> Result<()> {
    let histogram = buffers.histogram();
    let len = config.histogram_len() as u32;

    match (strategy, buffers.scan_scratch()) {
        (ScanStrategy::Device, Some(_)) if config.scan_blocks == 1 => device.launch(
            kernels.get(KernelRole::ScanSingleWorkgroup),
            LaunchDims::new(1, config.scan_threads_per_block),
            &[KernelArg::Buffer(histogram), KernelArg::Scalar(len)],
            queue,
        ),
        (ScanStrategy::Device, Some(scratch)) => {
            // Flags from the previous pass are still raised.
            device.fill(&scratch.ready_flags, 0, queue)?;
            device.launch(
                kernels.get(KernelRole::ScanParallel),
                LaunchDims::new(config.scan_blocks, config.scan_threads_per_block),
                &[
                    KernelArg::Buffer(histogram),
                    KernelArg::Buffer(&scratch.partial_sums),
                    KernelArg::Buffer(&scratch.ready_flags),
                    KernelArg::Scalar(len),
                ],
                queue,
            )
        }
        _ => exclusive_scan_host(device, histogram, histogram, queue),
    }
}
