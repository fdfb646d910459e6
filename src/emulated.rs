//! Host emulation of a device and of the seven kernel contracts.
//!
//! Every queue operation runs immediately and is recorded, so tests can check
//! both results and the order of work on the queue. Freshly allocated or
//! resized buffers are filled with `u32::MAX` to expose reads of unwritten
//! memory.

use std::cell::{Ref, RefCell};
use std::path::Path;

use crate::config::{BIN_SIZE, SINGLE_PASS_THRESHOLD};
use crate::device::{Device, DeviceProperties, KernelArg, KernelInfo, LaunchDims};
use crate::error::{RadixSortError, Result};
use crate::kernels::{KernelOptions, KernelProvider, KernelRole};
use crate::scan::exclusive_scan;

const GARBAGE: u32 = u32::MAX;

#[derive(Debug, Clone)]
pub struct EmulatedDevice {
    properties: DeviceProperties,
    max_scan_total: u32,
}

impl Default for EmulatedDevice {
    /// 4 multiprocessors of 1024 threads, 256 thread blocks: 16 count blocks
    /// and 16 scan blocks.
    fn default() -> Self {
        Self::new(DeviceProperties {
            name: "Emulated".to_string(),
            max_threads_per_block: 256,
            warp_size: 32,
            multiprocessor_count: 4,
            max_threads_per_multiprocessor: 1024,
        })
    }
}

impl EmulatedDevice {
    pub fn new(properties: DeviceProperties) -> Self {
        Self {
            properties,
            max_scan_total: u32::MAX,
        }
    }

    pub fn with_max_scan_total(mut self, max_scan_total: u32) -> Self {
        self.max_scan_total = max_scan_total;
        self
    }

    pub fn properties_mut(&mut self) -> &mut DeviceProperties {
        &mut self.properties
    }

    /// A buffer holding `data`, outside of any queue.
    pub fn upload(&self, data: &[u32], label: &str) -> EmulatedBuffer {
        EmulatedBuffer::from_slice(label, data)
    }
}

#[derive(Debug)]
pub struct EmulatedBuffer {
    label: String,
    data: RefCell<Vec<u32>>,
}

impl EmulatedBuffer {
    pub fn from_slice(label: &str, data: &[u32]) -> Self {
        Self {
            label: label.to_string(),
            data: RefCell::new(data.to_vec()),
        }
    }

    pub fn len(&self) -> usize {
        self.data.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_vec(&self) -> Vec<u32> {
        self.data.borrow().clone()
    }

    fn words(&self) -> Ref<'_, Vec<u32>> {
        self.data.borrow()
    }
}

/// One recorded queue operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueOp {
    Resize { label: String, len: usize },
    Fill { label: String, value: u32 },
    Copy { dst: String, src: String, len: usize },
    Read { label: String },
    Write { label: String },
    Launch { kernel: KernelRole, blocks: u32, threads: u32 },
    Synchronize,
}

#[derive(Debug, Default)]
pub struct EmulatedQueue {
    ops: RefCell<Vec<QueueOp>>,
}

impl EmulatedQueue {
    pub fn ops(&self) -> Vec<QueueOp> {
        self.ops.borrow().clone()
    }

    pub fn clear(&self) {
        self.ops.borrow_mut().clear();
    }

    fn record(&self, op: QueueOp) {
        self.ops.borrow_mut().push(op);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmulatedKernel {
    pub role: KernelRole,
}

impl Device for EmulatedDevice {
    type Queue = EmulatedQueue;
    type Buffer = EmulatedBuffer;
    type Kernel = EmulatedKernel;

    fn properties(&self) -> DeviceProperties {
        self.properties.clone()
    }

    fn create_buffer(&self, len: usize, label: &str) -> Result<EmulatedBuffer> {
        Ok(EmulatedBuffer::from_slice(label, &vec![GARBAGE; len]))
    }

    fn buffer_len(&self, buffer: &EmulatedBuffer) -> usize {
        buffer.len()
    }

    fn resize(&self, buffer: &mut EmulatedBuffer, len: usize, queue: &EmulatedQueue) -> Result<()> {
        queue.record(QueueOp::Resize {
            label: buffer.label.clone(),
            len,
        });
        *buffer.data.get_mut() = vec![GARBAGE; len];
        Ok(())
    }

    fn fill(&self, buffer: &EmulatedBuffer, value: u32, queue: &EmulatedQueue) -> Result<()> {
        queue.record(QueueOp::Fill {
            label: buffer.label.clone(),
            value,
        });
        buffer.data.borrow_mut().fill(value);
        Ok(())
    }

    fn copy(
        &self,
        dst: &EmulatedBuffer,
        src: &EmulatedBuffer,
        len: usize,
        queue: &EmulatedQueue,
    ) -> Result<()> {
        queue.record(QueueOp::Copy {
            dst: dst.label.clone(),
            src: src.label.clone(),
            len,
        });
        if len > src.len() || len > dst.len() {
            return Err(RadixSortError::Transfer(format!(
                "copy of {} words from {} ({}) into {} ({})",
                len,
                src.label,
                src.len(),
                dst.label,
                dst.len()
            )));
        }
        let words = src.words()[..len].to_vec();
        dst.data.borrow_mut()[..len].copy_from_slice(&words);
        Ok(())
    }

    fn read(&self, buffer: &EmulatedBuffer, queue: &EmulatedQueue) -> Result<Vec<u32>> {
        queue.record(QueueOp::Read {
            label: buffer.label.clone(),
        });
        Ok(buffer.to_vec())
    }

    fn write(&self, buffer: &EmulatedBuffer, data: &[u32], queue: &EmulatedQueue) -> Result<()> {
        queue.record(QueueOp::Write {
            label: buffer.label.clone(),
        });
        if data.len() > buffer.len() {
            return Err(RadixSortError::Transfer(format!(
                "write of {} words into {} ({})",
                data.len(),
                buffer.label,
                buffer.len()
            )));
        }
        buffer.data.borrow_mut()[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn launch(
        &self,
        kernel: &EmulatedKernel,
        dims: LaunchDims,
        args: &[KernelArg<'_, EmulatedBuffer>],
        queue: &EmulatedQueue,
    ) -> Result<()> {
        queue.record(QueueOp::Launch {
            kernel: kernel.role,
            blocks: dims.blocks,
            threads: dims.threads_per_block,
        });

        let args = Args {
            kernel: kernel.role,
            args,
        };
        match kernel.role {
            KernelRole::Count => count(&args),
            KernelRole::ScanSingleWorkgroup => scan_single_workgroup(&args, dims),
            KernelRole::ScanParallel => scan_parallel(&args, dims),
            KernelRole::Sort => scatter(&args, false),
            KernelRole::SortKeyValue => scatter(&args, true),
            KernelRole::SortSinglePass => single_pass(&args, dims, false),
            KernelRole::SortSinglePassKeyValue => single_pass(&args, dims, true),
        }
    }

    fn synchronize(&self, queue: &EmulatedQueue) -> Result<()> {
        queue.record(QueueOp::Synchronize);
        Ok(())
    }

    fn max_scan_total(&self) -> u32 {
        self.max_scan_total
    }
}

struct Args<'a, 'b> {
    kernel: KernelRole,
    args: &'a [KernelArg<'b, EmulatedBuffer>],
}

impl<'a, 'b> Args<'a, 'b> {
    fn error(&self, reason: String) -> RadixSortError {
        RadixSortError::Launch {
            kernel: self.kernel.name().to_string(),
            reason,
        }
    }

    fn buffer(&self, index: usize) -> Result<&'b EmulatedBuffer> {
        match self.args.get(index) {
            Some(KernelArg::Buffer(buffer)) => Ok(*buffer),
            other => Err(self.error(format!("argument {} is {:?}, not a buffer", index, other))),
        }
    }

    fn scalar(&self, index: usize) -> Result<u32> {
        match self.args.get(index) {
            Some(KernelArg::Scalar(value)) => Ok(*value),
            other => Err(self.error(format!("argument {} is {:?}, not a scalar", index, other))),
        }
    }

    fn check_len(&self, buffer: &EmulatedBuffer, len: usize) -> Result<()> {
        if buffer.len() < len {
            return Err(self.error(format!(
                "{} holds {} words, {} accessed",
                buffer.label,
                buffer.len(),
                len
            )));
        }
        Ok(())
    }
}

/// Scalars shared by the count and scatter kernels.
struct Pass {
    n: usize,
    items_per_block: usize,
    start_bit: u32,
    mask: u32,
    blocks: usize,
}

impl Pass {
    fn parse(args: &Args<'_, '_>, first: usize) -> Result<Self> {
        let bits = args.scalar(first + 3)?;
        if bits == 0 || bits > BIN_SIZE.trailing_zeros() {
            return Err(args.error(format!("digit of {} bits", bits)));
        }
        Ok(Self {
            n: args.scalar(first)? as usize,
            items_per_block: args.scalar(first + 1)? as usize,
            start_bit: args.scalar(first + 2)?,
            mask: (1 << bits) - 1,
            blocks: args.scalar(first + 4)? as usize,
        })
    }

    fn digit(&self, key: u32) -> usize {
        ((key >> self.start_bit) & self.mask) as usize
    }

    fn block_range(&self, block: usize) -> std::ops::Range<usize> {
        let start = (block * self.items_per_block).min(self.n);
        let end = ((block + 1) * self.items_per_block).min(self.n);
        start..end
    }
}

fn count(args: &Args<'_, '_>) -> Result<()> {
    let keys = args.buffer(0)?;
    let histogram = args.buffer(1)?;
    let pass = Pass::parse(args, 2)?;
    args.check_len(keys, pass.n)?;
    args.check_len(histogram, BIN_SIZE as usize * pass.blocks)?;

    let keys = keys.to_vec();
    let mut counts = vec![0u32; BIN_SIZE as usize * pass.blocks];
    for block in 0..pass.blocks {
        for &key in &keys[pass.block_range(block)] {
            counts[pass.digit(key) * pass.blocks + block] += 1;
        }
    }

    histogram.data.borrow_mut()[..counts.len()].copy_from_slice(&counts);
    Ok(())
}

fn scan_single_workgroup(args: &Args<'_, '_>, dims: LaunchDims) -> Result<()> {
    let histogram = args.buffer(0)?;
    let len = args.scalar(1)? as usize;
    args.check_len(histogram, len)?;
    if dims.blocks != 1 || dims.total_threads() < len as u64 {
        return Err(args.error(format!(
            "{} words do not fit {} blocks of {} threads",
            len, dims.blocks, dims.threads_per_block
        )));
    }

    let scanned = exclusive_scan(&histogram.words()[..len]);
    histogram.data.borrow_mut()[..len].copy_from_slice(&scanned);
    Ok(())
}

/// Blocks run in whatever order the ready flags allow, highest index first,
/// so a raised flag left over from an earlier launch lets a block consume a
/// stale partial sum.
fn scan_parallel(args: &Args<'_, '_>, dims: LaunchDims) -> Result<()> {
    let histogram = args.buffer(0)?;
    let partial_sums = args.buffer(1)?;
    let ready_flags = args.buffer(2)?;
    let len = args.scalar(3)? as usize;
    let blocks = dims.blocks as usize;
    let threads = dims.threads_per_block as usize;

    if blocks * threads != len {
        return Err(args.error(format!(
            "{} blocks of {} threads for {} words",
            blocks, threads, len
        )));
    }
    args.check_len(histogram, len)?;
    args.check_len(partial_sums, blocks)?;
    args.check_len(ready_flags, blocks)?;

    let mut pending: Vec<usize> = (0..blocks).collect();
    while !pending.is_empty() {
        let runnable = pending
            .iter()
            .rposition(|&block| block == 0 || ready_flags.words()[block - 1] != 0)
            .ok_or_else(|| args.error(format!("blocks {:?} wait forever", pending)))?;
        let block = pending.remove(runnable);

        let chunk = block * threads..(block + 1) * threads;
        let local: Vec<u32> = histogram.words()[chunk.clone()].to_vec();
        let total = local.iter().fold(0u32, |sum, &count| sum.wrapping_add(count));
        let prefix = if block == 0 {
            0
        } else {
            partial_sums.words()[block - 1]
        };

        let scanned: Vec<u32> = exclusive_scan(&local)
            .into_iter()
            .map(|offset| offset.wrapping_add(prefix))
            .collect();
        histogram.data.borrow_mut()[chunk].copy_from_slice(&scanned);
        partial_sums.data.borrow_mut()[block] = prefix.wrapping_add(total);
        ready_flags.data.borrow_mut()[block] = 1;
    }

    Ok(())
}

fn scatter(args: &Args<'_, '_>, with_values: bool) -> Result<()> {
    let src_keys = args.buffer(0)?;
    let dst_keys = args.buffer(1)?;
    let (value_buffers, histogram_index) = if with_values {
        (Some((args.buffer(2)?, args.buffer(3)?)), 4)
    } else {
        (None, 2)
    };
    let histogram = args.buffer(histogram_index)?;
    let pass = Pass::parse(args, histogram_index + 1)?;

    args.check_len(src_keys, pass.n)?;
    args.check_len(dst_keys, pass.n)?;
    args.check_len(histogram, BIN_SIZE as usize * pass.blocks)?;

    let mut offsets = histogram.to_vec();
    let src = src_keys.to_vec();
    let src_values = match value_buffers {
        Some((src_values, dst_values)) => {
            args.check_len(src_values, pass.n)?;
            args.check_len(dst_values, pass.n)?;
            Some(src_values.to_vec())
        }
        None => None,
    };

    let mut out_keys = dst_keys.to_vec();
    let mut out_values = value_buffers.map(|(_, dst_values)| dst_values.to_vec());
    for block in 0..pass.blocks {
        for i in pass.block_range(block) {
            let slot = &mut offsets[pass.digit(src[i]) * pass.blocks + block];
            let position = *slot as usize;
            if position >= pass.n {
                return Err(args.error(format!("offset {} out of {} keys", position, pass.n)));
            }
            *slot += 1;

            out_keys[position] = src[i];
            if let (Some(out), Some(values)) = (out_values.as_mut(), src_values.as_ref()) {
                out[position] = values[i];
            }
        }
    }

    *dst_keys.data.borrow_mut() = out_keys;
    if let (Some((_, dst_values)), Some(out)) = (value_buffers, out_values) {
        *dst_values.data.borrow_mut() = out;
    }
    Ok(())
}

fn single_pass(args: &Args<'_, '_>, dims: LaunchDims, with_values: bool) -> Result<()> {
    let (src_keys, src_values, dst_keys, dst_values, first) = if with_values {
        (
            args.buffer(0)?,
            Some(args.buffer(1)?),
            args.buffer(2)?,
            Some(args.buffer(3)?),
            4,
        )
    } else {
        (args.buffer(0)?, None, args.buffer(1)?, None, 2)
    };
    let n = args.scalar(first)? as usize;
    let start_bit = args.scalar(first + 1)?;
    let end_bit = args.scalar(first + 2)?;

    if dims.blocks != 1 || n > SINGLE_PASS_THRESHOLD {
        return Err(args.error(format!(
            "{} keys on {} blocks exceed one block-resident sort",
            n, dims.blocks
        )));
    }
    args.check_len(src_keys, n)?;
    args.check_len(dst_keys, n)?;

    let bits = end_bit.saturating_sub(start_bit);
    let mask = if bits >= 32 {
        u32::MAX
    } else {
        (1u32 << bits) - 1
    };
    let digit = |key: u32| key.checked_shr(start_bit).unwrap_or(0) & mask;

    let keys = src_keys.to_vec();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by_key(|&i| digit(keys[i]));

    let sorted: Vec<u32> = order.iter().map(|&i| keys[i]).collect();
    dst_keys.data.borrow_mut()[..n].copy_from_slice(&sorted);

    if let (Some(src_values), Some(dst_values)) = (src_values, dst_values) {
        args.check_len(src_values, n)?;
        args.check_len(dst_values, n)?;
        let values = src_values.to_vec();
        let sorted: Vec<u32> = order.iter().map(|&i| values[i]).collect();
        dst_values.data.borrow_mut()[..n].copy_from_slice(&sorted);
    }
    Ok(())
}

/// One kernel request seen by [`EmulatedProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRequest {
    pub method: &'static str,
    /// Path, or the size of the embedded payload.
    pub target: String,
    pub name: String,
    pub options: KernelOptions,
}

/// Provider handing out [`EmulatedKernel`]s and recording every request.
#[derive(Debug, Default)]
pub struct EmulatedProvider {
    requests: RefCell<Vec<LoadRequest>>,
    fail: Option<KernelRole>,
}

impl EmulatedProvider {
    /// A provider that fails to load `role`.
    pub fn failing(role: KernelRole) -> Self {
        Self {
            requests: RefCell::default(),
            fail: Some(role),
        }
    }

    pub fn requests(&self) -> Vec<LoadRequest> {
        self.requests.borrow().clone()
    }

    fn load(
        &self,
        method: &'static str,
        target: String,
        name: &str,
        options: &KernelOptions,
    ) -> Result<EmulatedKernel> {
        self.requests.borrow_mut().push(LoadRequest {
            method,
            target,
            name: name.to_string(),
            options: options.clone(),
        });

        let role = KernelRole::from_name(name)
            .filter(|role| Some(*role) != self.fail)
            .ok_or_else(|| RadixSortError::KernelLoad {
                name: name.to_string(),
                reason: "entry point not found".to_string(),
            })?;
        Ok(EmulatedKernel { role })
    }
}

impl KernelProvider<EmulatedDevice> for EmulatedProvider {
    fn load_precompiled(
        &self,
        _device: &EmulatedDevice,
        path: &Path,
        name: &str,
        options: &KernelOptions,
    ) -> Result<EmulatedKernel> {
        self.load("load_precompiled", path.display().to_string(), name, options)
    }

    fn load_embedded_binary(
        &self,
        _device: &EmulatedDevice,
        blob: &[u8],
        name: &str,
        options: &KernelOptions,
    ) -> Result<EmulatedKernel> {
        self.load("load_embedded_binary", format!("{} bytes", blob.len()), name, options)
    }

    fn compile_embedded_source(
        &self,
        _device: &EmulatedDevice,
        source: &str,
        name: &str,
        options: &KernelOptions,
    ) -> Result<EmulatedKernel> {
        self.load("compile_embedded_source", format!("{} bytes", source.len()), name, options)
    }

    fn compile_source_file(
        &self,
        _device: &EmulatedDevice,
        path: &Path,
        name: &str,
        options: &KernelOptions,
    ) -> Result<EmulatedKernel> {
        self.load("compile_source_file", path.display().to_string(), name, options)
    }

    fn kernel_info(&self, _device: &EmulatedDevice, kernel: &EmulatedKernel) -> Option<KernelInfo> {
        let shared_bytes = match kernel.role {
            KernelRole::Count => BIN_SIZE * 4,
            KernelRole::SortSinglePass | KernelRole::SortSinglePassKeyValue => {
                SINGLE_PASS_THRESHOLD as u32 * 4
            }
            _ => 0,
        };
        Some(KernelInfo {
            registers: 32,
            shared_bytes,
            constant_bytes: 0,
        })
    }
}
