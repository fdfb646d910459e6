//! Host side driver of a GPU radix sort for `u32` keys and key-value pairs.
//!
//! A [`RadixSort`] sizes its launch geometry from the device capabilities,
//! resolves its seven kernels through a [`KernelProvider`] and owns the
//! scratch buffers the passes share. Small inputs go to a single block
//! resident kernel; larger ones run one count, scan and scatter pass per
//! 8 bit digit, ping-ponging between the caller's buffers.
//!
//! The [`Device`] trait abstracts the accelerator; [`backend::WgpuDevice`]
//! implements it over `wgpu`.

pub mod backend;
pub mod buffers;
pub mod config;
pub mod device;
#[cfg(any(test, feature = "emulation"))]
pub mod emulated;
pub mod error;
pub mod kernels;
pub mod radix_sort;
pub mod scan;

pub use crate::config::{DeviceConfiguration, Flags, SortOptions};
pub use crate::device::{Device, DeviceProperties, KernelArg, KernelInfo, LaunchDims};
pub use crate::error::{RadixSortError, Result};
pub use crate::kernels::{KernelOptions, KernelProvider, KernelRole, Provisioning};
pub use crate::radix_sort::{KeyValueBuffers, RadixSort};
pub use crate::scan::{exclusive_scan, ScanStrategy};
