//! # rtaccel
//!
//! Acceleration structure management for a real-time ray tracer: per-mesh
//! bottom-level structures, one top-level structure per scene with static
//! and animated instances, the geometry metadata that lets hit shaders find
//! per-triangle materials, and double-buffered per-frame uploads.
//!
//! ## Modules
//!
//! - [`util`] - Errors, math and capacity policy
//! - [`config`] - Builder configuration (JSON)
//! - [`device`] - Device trait, command recording, headless reference device
//! - [`resource`] - Managed and double-buffered device buffers
//! - [`scene`] - Meshes, geometry store and transform sources
//! - [`accel`] - BLAS, geometry metadata, instances and TLAS
//! - [`bench`] - Host-side phase timing
//!
//! ## Example
//!
//! ```ignore
//! use rtaccel::prelude::*;
//!
//! let ctx: Context = Arc::new(HeadlessDevice::new());
//! let store = GeometryStore::create(&ctx, &vertices, &indices)?;
//! let mut blas = Blas::new();
//! blas.create_or_update(&ctx, mesh, &store, None)?;
//!
//! let mut tlas = Tlas::new(&ctx, AccelConfig::default());
//! tlas.add_instance_static(&blas.instance_ref(), Mat4::IDENTITY);
//! tlas.create_or_update()?;
//! ```

pub mod accel;
pub mod bench;
pub mod config;
pub mod device;
pub mod resource;
pub mod scene;
pub mod util;

// Re-export commonly used types
pub use config::AccelConfig;
pub use util::{Error, Result};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::accel::{Blas, BlasInstance, BlasRef, GeometryInstanceFlags, InstanceId, Tlas};
    pub use crate::bench::HostBenchmark;
    pub use crate::config::AccelConfig;
    pub use crate::device::{CommandBuffer, Context, Device, HeadlessDevice};
    pub use crate::resource::{DeviceResource, DualBuffer, ManagedBuffer};
    pub use crate::scene::{GeometryStore, Mesh, MeshInstance, Primitive, TransformNode, TransformSource, Vertex};
    pub use crate::util::{Error, Mat4, Result, Vec3};
    pub use std::sync::Arc;
}
