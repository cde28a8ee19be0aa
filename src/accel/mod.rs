//! Acceleration structure builders.
//!
//! ## Build flow
//! ```text
//! Mesh ─▶ Blas ─▶ GeometryMetaBuffer ─▶ instance array ─▶ Tlas
//!                  (record offsets)      (static | animated)
//! ```
//! Per frame only the animated tail of the instance array is re-uploaded and
//! the TLAS is refit with [`Tlas::update_lean`].

mod blas;
mod geometry_meta;
mod instance;
mod tlas;

pub use blas::{
    Blas, BlasId, BlasRef, BENCH_BUILD, BENCH_CREATE, BENCH_CREATE_BUILD_STRUCTS,
    BENCH_GET_BUILD_SIZES, BENCH_RESET,
};
pub use geometry_meta::{pack_geometry_meta, GeometryMeta, GeometryMetaBuffer, GeometryMetaOffsets};
pub use instance::{BlasInstance, GeometryInstanceFlags, InstanceId, InstanceTransform};
pub use tlas::Tlas;
