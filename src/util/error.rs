//! Error types for acceleration structure management.

use thiserror::Error;

/// Main error type for device and acceleration structure operations.
///
/// Contract violations (building an empty mesh, lean-updating a dirty TLAS)
/// are not represented here; those panic at the call site.
#[derive(Error, Debug)]
pub enum Error {
    /// Generic GPU-level failure reported by the device layer
    #[error("Device error: {0}")]
    Device(String),

    /// Allocation exceeded the device memory budget
    #[error("Out of device memory: requested {requested} bytes ({available} available)")]
    OutOfMemory { requested: u64, available: u64 },

    /// Handle does not name a live resource
    #[error("Invalid {kind} handle: {id}")]
    InvalidHandle { kind: &'static str, id: u64 },

    /// Host write to a buffer that is not host visible
    #[error("Buffer is not host visible: {0}")]
    NotHostVisible(String),

    /// Byte range outside of a buffer
    #[error("Range {offset}+{size} out of bounds (capacity: {capacity})")]
    OutOfBounds { offset: u64, size: u64, capacity: u64 },

    /// Device address does not resolve to any buffer
    #[error("Unresolved device address: {0:#x}")]
    UnresolvedAddress(u64),

    /// Acceleration structure build rejected by the device
    #[error("Acceleration structure build failed: {0}")]
    BuildFailed(String),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an "other" error from a string.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Create a device error.
    pub fn device(msg: impl Into<String>) -> Self {
        Self::Device(msg.into())
    }

    /// Create a build failure error.
    pub fn build_failed(msg: impl Into<String>) -> Self {
        Self::BuildFailed(msg.into())
    }
}

/// Result type alias for acceleration structure operations.
pub type Result<T> = std::result::Result<T, Error>;
