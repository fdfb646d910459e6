//! Device backends.

pub mod wgpu;

pub use self::wgpu::{WgpuBuffer, WgpuDevice, WgpuKernel, WgpuKernelProvider};
