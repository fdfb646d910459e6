use std::path::PathBuf;

use thiserror::Error;

/// Errors reported by the sorter and its device backends.
#[derive(Debug, Error)]
pub enum RadixSortError {
    #[error("invalid bit range [{start_bit}, {end_bit}): keys are {key_bits} bits wide")]
    InvalidBitRange {
        start_bit: u32,
        end_bit: u32,
        key_bits: u32,
    },
    #[error("{what} holds {capacity} elements, {requested} requested")]
    CapacityExceeded {
        what: &'static str,
        requested: usize,
        capacity: usize,
    },
    #[error("invalid provisioning: {0}")]
    InvalidProvisioning(String),
    #[error("failed to load kernel {name}: {reason}")]
    KernelLoad { name: String, reason: String },
    #[error("failed to read {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("kernel launch {kernel} failed: {reason}")]
    Launch { kernel: String, reason: String },
    #[error("device transfer failed: {0}")]
    Transfer(String),
    #[error("no compatible adapter found")]
    NoAdapter,
    #[error(transparent)]
    RequestDevice(#[from] wgpu::RequestDeviceError),
}

pub type Result<T> = std::result::Result<T, RadixSortError>;
