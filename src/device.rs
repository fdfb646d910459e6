//! The accelerator seen from the host.
//!
//! A [`Device`] is both the capability probe and the execution queue the sort
//! enqueues its work on. Every array the sorter touches is an array of `u32`
//! words: keys, values, histogram counts, partial sums and ready flags.
//!
//! All operations taking a queue are enqueued in program order and may run
//! asynchronously with respect to the caller. Only [`Device::read`] and
//! [`Device::synchronize`] block the host.

use crate::error::Result;

/// What the capability probe reports about a device.
///
/// Zero means "unknown"; the sizing engine falls back to defaults for those.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceProperties {
    pub name: String,
    pub max_threads_per_block: u32,
    pub warp_size: u32,
    pub multiprocessor_count: u32,
    pub max_threads_per_multiprocessor: u32,
}

impl DeviceProperties {
    pub fn is_nvidia(&self) -> bool {
        self.name.contains("NVIDIA")
    }
}

/// Grid shape of a one dimensional launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchDims {
    pub blocks: u32,
    pub threads_per_block: u32,
}

impl LaunchDims {
    pub fn new(blocks: u32, threads_per_block: u32) -> Self {
        Self {
            blocks,
            threads_per_block,
        }
    }

    pub fn total_threads(&self) -> u64 {
        self.blocks as u64 * self.threads_per_block as u64
    }
}

/// A positional kernel argument.
///
/// Buffers and scalars keep their relative order; backends decide how each
/// kind is bound.
#[derive(Debug)]
pub enum KernelArg<'a, B> {
    Buffer(&'a B),
    Scalar(u32),
}

impl<'a, B> Clone for KernelArg<'a, B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, B> Copy for KernelArg<'a, B> {}

/// Register and memory footprint of a resolved kernel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelInfo {
    pub registers: u32,
    pub shared_bytes: u32,
    pub constant_bytes: u32,
}

pub trait Device {
    /// Execution queue the caller passes to every sort call.
    type Queue;
    /// Device array of `u32` words. Handles are shared; the device mutates
    /// their contents through `&` like any GPU allocation.
    type Buffer;
    /// Launchable kernel handle.
    type Kernel;

    fn properties(&self) -> DeviceProperties;

    fn create_buffer(&self, len: usize, label: &str) -> Result<Self::Buffer>;

    fn buffer_len(&self, buffer: &Self::Buffer) -> usize;

    /// Reallocates `buffer` to `len` words. Contents are unspecified afterwards.
    fn resize(&self, buffer: &mut Self::Buffer, len: usize, queue: &Self::Queue) -> Result<()>;

    fn fill(&self, buffer: &Self::Buffer, value: u32, queue: &Self::Queue) -> Result<()>;

    /// Copies the first `len` words of `src` into `dst`.
    fn copy(
        &self,
        dst: &Self::Buffer,
        src: &Self::Buffer,
        len: usize,
        queue: &Self::Queue,
    ) -> Result<()>;

    /// Blocks until the buffer contents are visible to the host.
    fn read(&self, buffer: &Self::Buffer, queue: &Self::Queue) -> Result<Vec<u32>>;

    fn write(&self, buffer: &Self::Buffer, data: &[u32], queue: &Self::Queue) -> Result<()>;

    fn launch(
        &self,
        kernel: &Self::Kernel,
        dims: LaunchDims,
        args: &[KernelArg<'_, Self::Buffer>],
        queue: &Self::Queue,
    ) -> Result<()>;

    /// Waits until everything enqueued so far has completed.
    fn synchronize(&self, queue: &Self::Queue) -> Result<()>;

    /// Largest histogram total, i.e. key count, the device scan kernels
    /// handle. The host scan has no such limit.
    fn max_scan_total(&self) -> u32 {
        u32::MAX
    }
}
