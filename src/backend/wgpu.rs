//! [`Device`] and [`KernelProvider`] over `wgpu` compute.
//!
//! Kernels are compute entry points named after their role. Buffer arguments
//! are bound to group 0 in argument order starting at binding 0; all scalar
//! arguments are packed, in order, into one uniform block bound right after
//! the last buffer. Entry points are compiled with an automatic layout, so
//! every kernel must reference each of its bindings.
//!
//! WGSL sources receive the compile options as a prelude of `const`
//! declarations and may pull in other files with `#include "file.wgsl"`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use futures::executor::block_on;
use wgpu::util::DeviceExt;

use crate::device::{Device, DeviceProperties, KernelArg, LaunchDims};
use crate::error::{RadixSortError, Result};
use crate::kernels::{KernelOptions, KernelProvider};

const WORD: u64 = std::mem::size_of::<u32>() as u64;
const SPIRV_MAGIC: u32 = 0x0723_0203;
const MAX_INCLUDE_DEPTH: usize = 16;
const SCAN_READY_BIT: u32 = 1 << 31;

/// A logical device with what the adapter reports about itself.
#[derive(Debug)]
pub struct WgpuDevice {
    device: wgpu::Device,
    info: wgpu::AdapterInfo,
    limits: wgpu::Limits,
    multiprocessor_count: u32,
    max_threads_per_multiprocessor: u32,
}

impl WgpuDevice {
    /// Opens the first adapter matching `power` with its full limits.
    pub async fn request(power: wgpu::PowerPreference) -> Result<(Self, wgpu::Queue)> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: power,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or(RadixSortError::NoAdapter)?;

        let limits = adapter.limits();
        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("radix sort device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits.clone(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await?;

        log::info!("using adapter {:?}", adapter.get_info());
        Ok((Self::from_parts(device, adapter.get_info(), limits), queue))
    }

    pub fn from_parts(device: wgpu::Device, info: wgpu::AdapterInfo, limits: wgpu::Limits) -> Self {
        Self {
            device,
            info,
            limits,
            multiprocessor_count: 0,
            max_threads_per_multiprocessor: 0,
        }
    }

    /// wgpu cannot query the multiprocessor layout; without it the sorter
    /// falls back to a fixed block count.
    pub fn with_multiprocessors(mut self, count: u32, max_threads_per_multiprocessor: u32) -> Self {
        self.multiprocessor_count = count;
        self.max_threads_per_multiprocessor = max_threads_per_multiprocessor;
        self
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn adapter_info(&self) -> &wgpu::AdapterInfo {
        &self.info
    }

    fn raw_buffer(&self, len: usize, label: &str) -> wgpu::Buffer {
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: len.max(1) as u64 * WORD,
            usage: storage_usage(),
            mapped_at_creation: false,
        })
    }

    fn submit(&self, queue: &wgpu::Queue, label: &str, record: impl FnOnce(&mut wgpu::CommandEncoder)) {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) });
        record(&mut encoder);
        queue.submit(Some(encoder.finish()));
    }
}

fn storage_usage() -> wgpu::BufferUsages {
    wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC
}

/// A storage buffer of `u32` words.
#[derive(Debug)]
pub struct WgpuBuffer {
    buffer: wgpu::Buffer,
    len: usize,
    label: String,
}

impl WgpuBuffer {
    pub fn from_data(device: &WgpuDevice, data: &[u32], label: &str) -> Self {
        let buffer = if data.is_empty() {
            device.raw_buffer(0, label)
        } else {
            device
                .device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some(label),
                    contents: bytemuck::cast_slice(data),
                    usage: storage_usage(),
                })
        };

        Self {
            buffer,
            len: data.len(),
            label: label.to_string(),
        }
    }

    pub fn raw(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Source and swap buffers for a keys-only sort, the second one zeroed.
pub fn create_sort_buffers(device: &WgpuDevice, keys: &[u32]) -> (WgpuBuffer, WgpuBuffer) {
    let src = WgpuBuffer::from_data(device, keys, "radix keys");
    let dst = WgpuBuffer {
        buffer: device.raw_buffer(keys.len(), "radix sorted keys"),
        len: keys.len(),
        label: "radix sorted keys".to_string(),
    };
    (src, dst)
}

/// Source and destination key and value buffers for a key-value sort.
pub fn create_key_value_buffers(
    device: &WgpuDevice,
    keys: &[u32],
    values: &[u32],
) -> ((WgpuBuffer, WgpuBuffer), (WgpuBuffer, WgpuBuffer)) {
    let (src_keys, dst_keys) = create_sort_buffers(device, keys);
    let src_values = WgpuBuffer::from_data(device, values, "radix values");
    let dst_values = WgpuBuffer {
        buffer: device.raw_buffer(values.len(), "radix sorted values"),
        len: values.len(),
        label: "radix sorted values".to_string(),
    };
    ((src_keys, src_values), (dst_keys, dst_values))
}

#[derive(Debug)]
pub struct WgpuKernel {
    name: String,
    pipeline: wgpu::ComputePipeline,
}

impl WgpuKernel {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Device for WgpuDevice {
    type Queue = wgpu::Queue;
    type Buffer = WgpuBuffer;
    type Kernel = WgpuKernel;

    fn properties(&self) -> DeviceProperties {
        DeviceProperties {
            name: self.info.name.clone(),
            max_threads_per_block: self
                .limits
                .max_compute_invocations_per_workgroup
                .min(self.limits.max_compute_workgroup_size_x),
            warp_size: self.limits.min_subgroup_size,
            multiprocessor_count: self.multiprocessor_count,
            max_threads_per_multiprocessor: self.max_threads_per_multiprocessor,
        }
    }

    fn create_buffer(&self, len: usize, label: &str) -> Result<WgpuBuffer> {
        Ok(WgpuBuffer {
            buffer: self.raw_buffer(len, label),
            len,
            label: label.to_string(),
        })
    }

    fn buffer_len(&self, buffer: &WgpuBuffer) -> usize {
        buffer.len
    }

    fn resize(&self, buffer: &mut WgpuBuffer, len: usize, _queue: &wgpu::Queue) -> Result<()> {
        if buffer.len != len {
            buffer.buffer = self.raw_buffer(len, &buffer.label);
            buffer.len = len;
        }
        Ok(())
    }

    fn fill(&self, buffer: &WgpuBuffer, value: u32, queue: &wgpu::Queue) -> Result<()> {
        if value == 0 {
            self.submit(queue, "radix fill", |encoder| {
                encoder.clear_buffer(&buffer.buffer, 0, None)
            });
        } else if buffer.len > 0 {
            queue.write_buffer(&buffer.buffer, 0, bytemuck::cast_slice(&vec![value; buffer.len]));
        }
        Ok(())
    }

    fn copy(
        &self,
        dst: &WgpuBuffer,
        src: &WgpuBuffer,
        len: usize,
        queue: &wgpu::Queue,
    ) -> Result<()> {
        if len > src.len || len > dst.len {
            return Err(RadixSortError::Transfer(format!(
                "copy of {} words from {} ({}) into {} ({})",
                len, src.label, src.len, dst.label, dst.len
            )));
        }
        if len > 0 {
            self.submit(queue, "radix copy", |encoder| {
                encoder.copy_buffer_to_buffer(&src.buffer, 0, &dst.buffer, 0, len as u64 * WORD)
            });
        }
        Ok(())
    }

    fn read(&self, buffer: &WgpuBuffer, queue: &wgpu::Queue) -> Result<Vec<u32>> {
        if buffer.len == 0 {
            return Ok(Vec::new());
        }

        let size = buffer.len as u64 * WORD;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("radix staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        self.submit(queue, "radix read", |encoder| {
            encoder.copy_buffer_to_buffer(&buffer.buffer, 0, &staging, 0, size)
        });

        let slice = staging.slice(..);
        let (sender, receiver) = futures::channel::oneshot::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);

        block_on(receiver)
            .map_err(|_| RadixSortError::Transfer(format!("mapping {} was dropped", buffer.label)))?
            .map_err(|err| RadixSortError::Transfer(format!("mapping {}: {}", buffer.label, err)))?;

        let words = bytemuck::cast_slice::<u8, u32>(&slice.get_mapped_range()).to_vec();
        staging.unmap();
        Ok(words)
    }

    fn write(&self, buffer: &WgpuBuffer, data: &[u32], queue: &wgpu::Queue) -> Result<()> {
        if data.len() > buffer.len {
            return Err(RadixSortError::Transfer(format!(
                "write of {} words into {} ({})",
                data.len(),
                buffer.label,
                buffer.len
            )));
        }
        if !data.is_empty() {
            queue.write_buffer(&buffer.buffer, 0, bytemuck::cast_slice(data));
        }
        Ok(())
    }

    fn launch(
        &self,
        kernel: &WgpuKernel,
        dims: LaunchDims,
        args: &[KernelArg<'_, WgpuBuffer>],
        queue: &wgpu::Queue,
    ) -> Result<()> {
        let scalars = pack_scalars(args);
        let uniform = (!scalars.is_empty()).then(|| {
            self.device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("radix kernel scalars"),
                    contents: bytemuck::cast_slice(&scalars),
                    usage: wgpu::BufferUsages::UNIFORM,
                })
        });

        let mut entries: Vec<wgpu::BindGroupEntry> = args
            .iter()
            .filter_map(|arg| match arg {
                KernelArg::Buffer(buffer) => Some(buffer.buffer.as_entire_binding()),
                KernelArg::Scalar(_) => None,
            })
            .enumerate()
            .map(|(binding, resource)| wgpu::BindGroupEntry {
                binding: binding as u32,
                resource,
            })
            .collect();
        if let Some(uniform) = uniform.as_ref() {
            entries.push(wgpu::BindGroupEntry {
                binding: entries.len() as u32,
                resource: uniform.as_entire_binding(),
            });
        }

        log::trace!(
            "dispatch {} x {} of {}",
            dims.blocks,
            dims.threads_per_block,
            kernel.name
        );

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let layout = kernel.pipeline.get_bind_group_layout(0);
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&kernel.name),
            layout: &layout,
            entries: &entries,
        });
        self.submit(queue, &kernel.name, |encoder| {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(&kernel.name),
                timestamp_writes: None,
            });
            pass.set_pipeline(&kernel.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(dims.blocks, 1, 1);
        });

        match block_on(self.device.pop_error_scope()) {
            Some(err) => Err(RadixSortError::Launch {
                kernel: kernel.name.clone(),
                reason: err.to_string(),
            }),
            None => Ok(()),
        }
    }

    fn synchronize(&self, _queue: &wgpu::Queue) -> Result<()> {
        self.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }

    /// The scan kernels keep the ready bit in the top bit of each prefix.
    fn max_scan_total(&self) -> u32 {
        SCAN_READY_BIT - 1
    }
}

/// Scalar arguments in order, zero padded to a 16 byte uniform block.
fn pack_scalars<B>(args: &[KernelArg<'_, B>]) -> Vec<u32> {
    let mut scalars: Vec<u32> = args
        .iter()
        .filter_map(|arg| match arg {
            KernelArg::Scalar(value) => Some(*value),
            KernelArg::Buffer(_) => None,
        })
        .collect();
    scalars.resize(scalars.len().next_multiple_of(4), 0);
    scalars
}

/// Compiles WGSL and loads SPIR-V into compute pipelines.
#[derive(Debug, Default)]
pub struct WgpuKernelProvider;

impl WgpuKernelProvider {
    fn pipeline(
        &self,
        device: &WgpuDevice,
        source: wgpu::ShaderSource<'_>,
        name: &str,
    ) -> Result<WgpuKernel> {
        let device = device.device();
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(name),
            source,
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(name),
            layout: None,
            module: &module,
            entry_point: Some(name),
            compilation_options: Default::default(),
            cache: None,
        });

        if let Some(err) = block_on(device.pop_error_scope()) {
            return Err(RadixSortError::KernelLoad {
                name: name.to_string(),
                reason: err.to_string(),
            });
        }

        Ok(WgpuKernel {
            name: name.to_string(),
            pipeline,
        })
    }

    fn compile_wgsl(
        &self,
        device: &WgpuDevice,
        source: &str,
        origin: Option<&Path>,
        name: &str,
        options: &KernelOptions,
    ) -> Result<WgpuKernel> {
        log::debug!("{}: {} has no WGSL equivalent", name, options.fast_math.flag());
        let body = resolve_includes(source, origin, &options.include_dirs, name)?;
        let code = format!("{}{}", wgsl_prelude(options), body);
        self.pipeline(device, wgpu::ShaderSource::Wgsl(code.into()), name)
    }
}

impl KernelProvider<WgpuDevice> for WgpuKernelProvider {
    fn load_precompiled(
        &self,
        device: &WgpuDevice,
        path: &Path,
        name: &str,
        options: &KernelOptions,
    ) -> Result<WgpuKernel> {
        let blob = std::fs::read(path).map_err(|source| RadixSortError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.load_embedded_binary(device, &blob, name, options)
    }

    fn load_embedded_binary(
        &self,
        device: &WgpuDevice,
        blob: &[u8],
        name: &str,
        _options: &KernelOptions,
    ) -> Result<WgpuKernel> {
        check_spirv(blob, name)?;
        self.pipeline(device, wgpu::util::make_spirv(blob), name)
    }

    fn compile_embedded_source(
        &self,
        device: &WgpuDevice,
        source: &str,
        name: &str,
        options: &KernelOptions,
    ) -> Result<WgpuKernel> {
        self.compile_wgsl(device, source, None, name, options)
    }

    fn compile_source_file(
        &self,
        device: &WgpuDevice,
        path: &Path,
        name: &str,
        options: &KernelOptions,
    ) -> Result<WgpuKernel> {
        let source = std::fs::read_to_string(path).map_err(|source| RadixSortError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.compile_wgsl(device, &source, Some(path), name, options)
    }

    fn binary_file_name(&self, props: &DeviceProperties) -> String {
        if props.is_nvidia() {
            "radix_sort_kernels.nvidia.spv".to_string()
        } else {
            "radix_sort_kernels.spv".to_string()
        }
    }
}

fn check_spirv(blob: &[u8], name: &str) -> Result<()> {
    let invalid = |reason: String| RadixSortError::KernelLoad {
        name: name.to_string(),
        reason,
    };

    if blob.len() < 4 || blob.len() % 4 != 0 {
        return Err(invalid(format!("{} bytes is not a SPIR-V module", blob.len())));
    }
    let magic = u32::from_le_bytes([blob[0], blob[1], blob[2], blob[3]]);
    if magic != SPIRV_MAGIC && magic.swap_bytes() != SPIRV_MAGIC {
        return Err(invalid(format!("bad SPIR-V magic {:#010x}", magic)));
    }
    Ok(())
}

/// Compile options as WGSL constants. A define without a value becomes a
/// `true` flag.
fn wgsl_prelude(options: &KernelOptions) -> String {
    options
        .defines
        .iter()
        .map(|(name, value)| {
            if value.is_empty() {
                format!("const {}: bool = true;\n", name)
            } else if value.parse::<u32>().is_ok() {
                format!("const {}: u32 = {}u;\n", name, value)
            } else {
                format!("const {} = {};\n", name, value)
            }
        })
        .collect()
}

/// Splices `#include "file"` lines, searching the including file's directory
/// first and then `include_dirs`. Each file is included at most once.
fn resolve_includes(
    source: &str,
    origin: Option<&Path>,
    include_dirs: &[PathBuf],
    name: &str,
) -> Result<String> {
    let mut seen = HashSet::new();
    if let Some(origin) = origin {
        seen.insert(origin.to_path_buf());
    }
    let mut out = String::with_capacity(source.len());
    splice(source, origin, include_dirs, name, &mut seen, 0, &mut out)?;
    Ok(out)
}

fn splice(
    source: &str,
    origin: Option<&Path>,
    include_dirs: &[PathBuf],
    name: &str,
    seen: &mut HashSet<PathBuf>,
    depth: usize,
    out: &mut String,
) -> Result<()> {
    if depth > MAX_INCLUDE_DEPTH {
        return Err(RadixSortError::KernelLoad {
            name: name.to_string(),
            reason: format!("includes nested deeper than {}", MAX_INCLUDE_DEPTH),
        });
    }

    for line in source.lines() {
        let Some(file) = include_target(line) else {
            out.push_str(line);
            out.push('\n');
            continue;
        };

        let search = origin
            .and_then(Path::parent)
            .into_iter()
            .chain(include_dirs.iter().map(PathBuf::as_path));
        let path = search
            .map(|dir| dir.join(file))
            .find(|path| path.is_file())
            .ok_or_else(|| RadixSortError::KernelLoad {
                name: name.to_string(),
                reason: format!("include {:?} not found", file),
            })?;

        if !seen.insert(path.clone()) {
            continue;
        }
        let included = std::fs::read_to_string(&path).map_err(|source| RadixSortError::Io {
            path: path.clone(),
            source,
        })?;
        splice(&included, Some(path.as_path()), include_dirs, name, seen, depth + 1, out)?;
    }

    Ok(())
}

fn include_target(line: &str) -> Option<&str> {
    let rest = line.trim().strip_prefix("#include")?.trim();
    rest.strip_prefix('"')?.strip_suffix('"')
}
