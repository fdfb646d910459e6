//! Kernel roles, provisioning modes and the role registry.
//!
//! The kernel bodies live outside this crate. A [`KernelProvider`] turns a
//! role and a provisioning mode into a launchable handle; the sorter resolves
//! all seven roles once at configuration and keeps them in a
//! [`KernelRegistry`].
//!
//! Argument layout of every role, in launch order (`B` buffer, `S` scalar):
//!
//! | role | arguments |
//! |------|-----------|
//! | `Count` | B keys, B histogram, S n, S items per block, S start bit, S digit bits, S blocks |
//! | `ScanSingleWorkgroup` | B histogram, S length |
//! | `ScanParallel` | B histogram, B partial sums, B ready flags, S length |
//! | `Sort` | B src keys, B dst keys, B histogram, S n, S items per block, S start bit, S digit bits, S blocks |
//! | `SortKeyValue` | B src keys, B dst keys, B src values, B dst values, B histogram, then the `Sort` scalars |
//! | `SortSinglePass` | B src keys, B dst keys, S n, S start bit, S end bit |
//! | `SortSinglePassKeyValue` | B src keys, B src values, B dst keys, B dst values, S n, S start bit, S end bit |
//!
//! The histogram is digit major: the count of digit `d` in block `b` lives at
//! `d * blocks + b`, so its exclusive scan is the global scatter offset of
//! that (digit, block) pair. The count kernel writes every entry, including
//! bins above the live digit range of a narrow final pass.

use std::borrow::Cow;
use std::path::{Path, PathBuf};

use crate::config::{DeviceConfiguration, Flags};
use crate::device::{Device, DeviceProperties, KernelInfo};
use crate::error::{RadixSortError, Result};

pub const DEFAULT_KERNEL_PATH: &str = "kernels/radix_sort.wgsl";
pub const DEFAULT_INCLUDE_DIR: &str = "kernels/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelRole {
    Count,
    ScanSingleWorkgroup,
    ScanParallel,
    Sort,
    SortKeyValue,
    SortSinglePass,
    SortSinglePassKeyValue,
}

impl KernelRole {
    pub const ALL: [KernelRole; 7] = [
        KernelRole::Count,
        KernelRole::ScanSingleWorkgroup,
        KernelRole::ScanParallel,
        KernelRole::Sort,
        KernelRole::SortKeyValue,
        KernelRole::SortSinglePass,
        KernelRole::SortSinglePassKeyValue,
    ];

    /// Entry point name inside the kernel binary or source.
    pub fn name(self) -> &'static str {
        match self {
            KernelRole::Count => "CountKernel",
            KernelRole::ScanSingleWorkgroup => "ParallelExclusiveScanSingleWG",
            KernelRole::ScanParallel => "ParallelExclusiveScanAllWG",
            KernelRole::Sort => "SortKernel",
            KernelRole::SortKeyValue => "SortKVKernel",
            KernelRole::SortSinglePass => "SortSinglePassKernel",
            KernelRole::SortSinglePassKeyValue => "SortSinglePassKVKernel",
        }
    }

    pub fn from_name(name: &str) -> Option<KernelRole> {
        KernelRole::ALL.iter().copied().find(|role| role.name() == name)
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Where the kernels come from. Exactly one mode is active per sorter.
#[derive(Debug, Clone)]
pub enum Provisioning {
    /// Pre-built binary picked by vendor, looked up in `dir` or next to the
    /// running executable.
    PrecompiledBinary { dir: Option<PathBuf> },
    /// Pre-built binary linked into the program.
    EmbeddedBinary(Cow<'static, [u8]>),
    /// Source text linked into the program, compiled at configuration.
    EmbeddedSource(Cow<'static, str>),
    /// Source file compiled at configuration. `None` selects the default
    /// kernel path and include directory.
    SourceFile {
        path: Option<PathBuf>,
        include_dir: Option<PathBuf>,
    },
}

impl Default for Provisioning {
    fn default() -> Self {
        Provisioning::SourceFile {
            path: None,
            include_dir: None,
        }
    }
}

impl Provisioning {
    /// Pre-built binaries carry a fixed launch geometry.
    pub fn is_prebuilt(&self) -> bool {
        matches!(
            self,
            Provisioning::PrecompiledBinary { .. } | Provisioning::EmbeddedBinary(_)
        )
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Provisioning::EmbeddedBinary(blob) if blob.is_empty() => Err(
                RadixSortError::InvalidProvisioning("embedded kernel binary is empty".to_string()),
            ),
            Provisioning::EmbeddedSource(source) if source.trim().is_empty() => Err(
                RadixSortError::InvalidProvisioning("embedded kernel source is empty".to_string()),
            ),
            _ => Ok(()),
        }
    }

    pub fn include_dir(&self) -> PathBuf {
        match self {
            Provisioning::SourceFile {
                include_dir: Some(dir),
                ..
            } => dir.clone(),
            _ => PathBuf::from(DEFAULT_INCLUDE_DIR),
        }
    }

    pub fn source_path(&self) -> PathBuf {
        match self {
            Provisioning::SourceFile {
                path: Some(path), ..
            } => path.clone(),
            _ => PathBuf::from(DEFAULT_KERNEL_PATH),
        }
    }

    /// One line describing the kernel source, for the diagnostics log.
    pub fn describe(&self) -> String {
        match self {
            Provisioning::PrecompiledBinary { dir } => match dir {
                Some(dir) => format!("loading pre-compiled kernels in : {}", dir.display()),
                None => "loading pre-compiled kernels next to the executable".to_string(),
            },
            Provisioning::EmbeddedBinary(blob) => {
                format!("loading embedded kernel binary ({} bytes)", blob.len())
            }
            Provisioning::EmbeddedSource(source) => {
                format!("compiling embedded kernel source ({} bytes)", source.len())
            }
            Provisioning::SourceFile { .. } => format!(
                "compiling kernels at path : {} in : {}",
                self.source_path().display(),
                self.include_dir().display()
            ),
        }
    }
}

/// Vendor specific fast math switch handed to kernel compilers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastMath {
    Nvidia,
    Generic,
}

impl FastMath {
    pub fn for_device(props: &DeviceProperties) -> Self {
        if props.is_nvidia() {
            FastMath::Nvidia
        } else {
            FastMath::Generic
        }
    }

    pub fn flag(self) -> &'static str {
        match self {
            FastMath::Nvidia => "--use_fast_math",
            FastMath::Generic => "-ffast-math",
        }
    }
}

/// Compile options every provisioning mode receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelOptions {
    /// Macro definitions; an empty value defines a bare flag.
    pub defines: Vec<(String, String)>,
    pub include_dirs: Vec<PathBuf>,
    pub fast_math: FastMath,
}

impl KernelOptions {
    pub fn new(config: &DeviceConfiguration, props: &DeviceProperties, include_dir: &Path) -> Self {
        let defines = vec![
            ("OVERWRITE".to_string(), String::new()),
            (
                "COUNT_WG_SIZE_VAL".to_string(),
                config.count_threads_per_block.to_string(),
            ),
            (
                "SCAN_WG_SIZE_VAL".to_string(),
                config.scan_threads_per_block.to_string(),
            ),
            (
                "SORT_WG_SIZE_VAL".to_string(),
                config.sort_threads_per_block.to_string(),
            ),
            (
                "SORT_NUM_WARPS_PER_BLOCK_VAL".to_string(),
                config.sort_warps_per_block.to_string(),
            ),
        ];

        Self {
            defines,
            include_dirs: vec![include_dir.to_path_buf()],
            fast_math: FastMath::for_device(props),
        }
    }

    pub fn define(&self, name: &str) -> Option<&str> {
        self.defines
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// The options as a compiler command line.
    pub fn compiler_args(&self) -> Vec<String> {
        let mut args = vec![self.fast_math.flag().to_string()];
        args.extend(
            self.include_dirs
                .iter()
                .map(|dir| format!("-I{}", dir.display())),
        );
        args.extend(self.defines.iter().map(|(name, value)| {
            if value.is_empty() {
                format!("-D{}", name)
            } else {
                format!("-D{}={}", name, value)
            }
        }));
        args
    }
}

/// Turns a kernel role into a launchable handle, one method per
/// provisioning mode.
pub trait KernelProvider<D: Device> {
    fn load_precompiled(
        &self,
        device: &D,
        path: &Path,
        name: &str,
        options: &KernelOptions,
    ) -> Result<D::Kernel>;

    fn load_embedded_binary(
        &self,
        device: &D,
        blob: &[u8],
        name: &str,
        options: &KernelOptions,
    ) -> Result<D::Kernel>;

    fn compile_embedded_source(
        &self,
        device: &D,
        source: &str,
        name: &str,
        options: &KernelOptions,
    ) -> Result<D::Kernel>;

    fn compile_source_file(
        &self,
        device: &D,
        path: &Path,
        name: &str,
        options: &KernelOptions,
    ) -> Result<D::Kernel>;

    /// Register and memory footprint, when the backend can report it.
    fn kernel_info(&self, _device: &D, _kernel: &D::Kernel) -> Option<KernelInfo> {
        None
    }

    /// File name of the pre-built binary matching the device vendor.
    fn binary_file_name(&self, props: &DeviceProperties) -> String {
        if props.is_nvidia() {
            "radix_sort_kernels.fatbin".to_string()
        } else {
            "radix_sort_kernels.hipfb".to_string()
        }
    }

    fn resolve(
        &self,
        device: &D,
        role: KernelRole,
        provisioning: &Provisioning,
        options: &KernelOptions,
    ) -> Result<D::Kernel> {
        let name = role.name();
        match provisioning {
            Provisioning::PrecompiledBinary { dir } => {
                let dir = match dir {
                    Some(dir) => dir.clone(),
                    None => executable_dir()?,
                };
                let path = dir.join(self.binary_file_name(&device.properties()));
                self.load_precompiled(device, &path, name, options)
            }
            Provisioning::EmbeddedBinary(blob) => {
                self.load_embedded_binary(device, blob, name, options)
            }
            Provisioning::EmbeddedSource(source) => {
                self.compile_embedded_source(device, source, name, options)
            }
            Provisioning::SourceFile { .. } => {
                self.compile_source_file(device, &provisioning.source_path(), name, options)
            }
        }
    }
}

fn executable_dir() -> Result<PathBuf> {
    let exe = std::env::current_exe().map_err(|source| RadixSortError::Io {
        path: PathBuf::from("<current executable>"),
        source,
    })?;
    Ok(exe
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(".")))
}

/// Resolved kernel handles, indexed by role.
pub struct KernelRegistry<K> {
    kernels: Vec<K>,
}

impl<K> KernelRegistry<K> {
    /// Resolves every role through `provider`.
    pub fn build<D, P>(
        device: &D,
        provider: &P,
        provisioning: &Provisioning,
        options: &KernelOptions,
        flags: Flags,
    ) -> Result<Self>
    where
        D: Device<Kernel = K>,
        P: KernelProvider<D>,
    {
        if flags.contains(Flags::LOG) {
            log::info!("kernel options: {}", options.compiler_args().join(" "));
        }

        let mut kernels = Vec::with_capacity(KernelRole::ALL.len());
        for role in KernelRole::ALL {
            let kernel = provider.resolve(device, role, provisioning, options)?;
            if flags.contains(Flags::LOG) {
                log_kernel_info(role, provider.kernel_info(device, &kernel));
            }
            kernels.push(kernel);
        }

        Ok(Self { kernels })
    }

    pub fn get(&self, role: KernelRole) -> &K {
        &self.kernels[role.index()]
    }
}

fn log_kernel_info(role: KernelRole, info: Option<KernelInfo>) {
    match info {
        Some(info) => log::info!(
            "Function: {}, vgpr : shared = {} : {} : {}",
            role.name(),
            info.registers,
            info.shared_bytes,
            info.constant_bytes
        ),
        None => log::info!("Function: {}, footprint unavailable", role.name()),
    }
}
