//! Utility types and functions.
//!
//! - [`Error`] / [`Result`] - Error handling
//! - [`TransformMatrix`] - packed 3x4 instance transform, plus glam re-exports
//! - [`grown_capacity`] / [`align_up`] - buffer sizing policy

mod capacity;
mod error;
mod math;

pub use capacity::*;
pub use error::*;
pub use math::*;
