//! Device resources owned by the builders.
//!
//! - [`ManagedBuffer`] - named device buffer with grow-only reallocation
//! - [`DualBuffer`] - device buffer fed through per-frame staging slots

mod buffer;
mod dual_buffer;

pub use buffer::ManagedBuffer;
pub use dual_buffer::DualBuffer;

/// Capability shared by everything that holds device memory.
pub trait DeviceResource {
    /// True while device memory is allocated.
    fn exists(&self) -> bool;
    /// Release device memory. Safe to call repeatedly.
    fn destroy(&mut self);
    fn name(&self) -> &str;
}
