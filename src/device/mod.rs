//! Device collaborator interface.
//!
//! The acceleration structure builders only talk to the GPU through the
//! [`Device`] trait: buffer allocation, acceleration structure objects, build
//! size queries and command submission. [`HeadlessDevice`] is a CPU
//! reference implementation of that contract.
//!
//! ## Submission model
//! ```text
//! CommandBuffer (recorded on host) ──submit_and_wait──▶ executed, caller blocked
//!                                  └─submit──────────▶ retired by frame pacing
//! ```

mod arena;
mod command;
mod headless;

pub use arena::{ResourceArena, ResourceEntry, ResourceId, ResourceKind};
pub use command::*;
pub use headless::{BuiltStructure, DeviceStats, HeadlessDevice};

use std::sync::Arc;

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use smallvec::SmallVec;

use crate::util::{Result, TransformMatrix};

/// GPU virtual address.
pub type DeviceAddress = u64;

/// Shared handle to the device, cloned into every resource that must release
/// itself.
pub type Context = Arc<dyn Device>;

/// Opaque buffer handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferHandle(pub u64);

/// Opaque acceleration structure handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AccelStructHandle(pub u64);

bitflags! {
    /// How a buffer will be used.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const TRANSFER_SRC = 1 << 0;
        const TRANSFER_DST = 1 << 1;
        const STORAGE = 1 << 2;
        const SHADER_DEVICE_ADDRESS = 1 << 3;
        const ACCEL_STRUCT_STORAGE = 1 << 4;
        const ACCEL_STRUCT_BUILD_INPUT = 1 << 5;
        const VERTEX = 1 << 6;
        const INDEX = 1 << 7;
    }
}

/// Where a buffer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MemoryLocation {
    /// Device local, written only through transfers
    #[default]
    DeviceLocal,
    /// Host visible and persistently mapped (staging)
    HostVisible,
}

/// Buffer creation parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDesc {
    pub name: String,
    pub size: u64,
    pub usage: BufferUsage,
    pub location: MemoryLocation,
    /// Required alignment of the device address (0 = device default)
    pub alignment: u64,
}

impl BufferDesc {
    /// Device local buffer.
    pub fn new(name: impl Into<String>, size: u64, usage: BufferUsage) -> Self {
        Self {
            name: name.into(),
            size,
            usage,
            location: MemoryLocation::DeviceLocal,
            alignment: 0,
        }
    }

    /// Host visible staging buffer.
    pub fn staging(name: impl Into<String>, size: u64) -> Self {
        Self {
            location: MemoryLocation::HostVisible,
            ..Self::new(name, size, BufferUsage::TRANSFER_SRC)
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn with_alignment(mut self, alignment: u64) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn with_location(mut self, location: MemoryLocation) -> Self {
        self.location = location;
        self
    }
}

/// Acceleration structure level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccelStructType {
    BottomLevel,
    TopLevel,
}

/// Acceleration structure object placed into a region of a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccelStructDesc {
    pub name: String,
    pub ty: AccelStructType,
    pub buffer: BufferHandle,
    pub offset: u64,
    pub size: u64,
}

bitflags! {
    /// Acceleration structure build flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BuildFlags: u32 {
        /// Allow later refits (update mode builds)
        const ALLOW_UPDATE = 1 << 0;
        const ALLOW_COMPACTION = 1 << 1;
        const PREFER_FAST_TRACE = 1 << 2;
        const PREFER_FAST_BUILD = 1 << 3;
    }
}

bitflags! {
    /// Per-geometry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct GeometryFlags: u32 {
        const OPAQUE = 1 << 0;
        const NO_DUPLICATE_ANY_HIT = 1 << 1;
    }
}

/// Build a structure from scratch, or refit an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuildMode {
    Build,
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VertexFormat {
    #[default]
    R32G32B32Float,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IndexType {
    #[default]
    U32,
}

impl IndexType {
    pub fn size(self) -> u64 {
        match self {
            IndexType::U32 => 4,
        }
    }
}

/// Triangle input referencing shared vertex/index buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriangleGeometry {
    pub vertex_address: DeviceAddress,
    pub vertex_stride: u64,
    pub vertex_format: VertexFormat,
    /// Highest vertex index referenced by this geometry
    pub max_vertex: u32,
    pub index_address: DeviceAddress,
    pub index_type: IndexType,
    pub flags: GeometryFlags,
}

/// Instance array input for a top-level build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceGeometry {
    pub data_address: DeviceAddress,
    pub flags: GeometryFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryData {
    Triangles(TriangleGeometry),
    Instances(InstanceGeometry),
}

/// Per-geometry range, the build counterpart of an indexed draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BuildRange {
    /// Triangles or instances consumed
    pub primitive_count: u32,
    /// Byte offset into the index buffer (triangles) or instance buffer
    pub primitive_offset: u32,
    pub first_vertex: u32,
    pub transform_offset: u32,
}

/// Everything a build or refit command needs besides the ranges.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildGeometryInfo {
    pub ty: AccelStructType,
    pub flags: BuildFlags,
    pub mode: BuildMode,
    pub src: Option<AccelStructHandle>,
    pub dst: Option<AccelStructHandle>,
    pub geometries: SmallVec<[GeometryData; 4]>,
    pub scratch_address: DeviceAddress,
}

impl BuildGeometryInfo {
    pub fn new(ty: AccelStructType, flags: BuildFlags, mode: BuildMode) -> Self {
        Self {
            ty,
            flags,
            mode,
            src: None,
            dst: None,
            geometries: SmallVec::new(),
            scratch_address: 0,
        }
    }
}

/// Storage and scratch requirements reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BuildSizes {
    pub acceleration_structure_size: u64,
    pub update_scratch_size: u64,
    pub build_scratch_size: u64,
}

/// Device limits relevant to acceleration structures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceProperties {
    pub min_scratch_offset_alignment: u64,
    /// Largest value representable in an instance custom index
    pub max_instance_custom_index: u32,
}

impl Default for DeviceProperties {
    fn default() -> Self {
        Self {
            min_scratch_offset_alignment: 128,
            max_instance_custom_index: INSTANCE_CUSTOM_INDEX_MAX,
        }
    }
}

/// Custom indices are 24 bits wide.
pub const INSTANCE_CUSTOM_INDEX_MAX: u32 = (1 << 24) - 1;

/// GPU instance record of a top-level structure (64 bytes).
///
/// Custom index and mask share one word (24 + 8 bits), as do the shader
/// binding table offset and instance flags.
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct AccelStructInstance {
    pub transform: TransformMatrix,
    pub custom_index_and_mask: u32,
    pub sbt_offset_and_flags: u32,
    pub acceleration_structure_reference: u64,
}

impl AccelStructInstance {
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;

    pub fn new(reference: DeviceAddress) -> Self {
        Self {
            transform: TransformMatrix::IDENTITY,
            custom_index_and_mask: 0,
            sbt_offset_and_flags: 0,
            acceleration_structure_reference: reference,
        }
    }

    #[inline]
    pub fn custom_index(&self) -> u32 {
        self.custom_index_and_mask & INSTANCE_CUSTOM_INDEX_MAX
    }

    pub fn set_custom_index(&mut self, index: u32) {
        assert!(index <= INSTANCE_CUSTOM_INDEX_MAX, "custom index {index} exceeds 24 bits");
        self.custom_index_and_mask = (self.custom_index_and_mask & !INSTANCE_CUSTOM_INDEX_MAX) | index;
    }

    #[inline]
    pub fn mask(&self) -> u8 {
        (self.custom_index_and_mask >> 24) as u8
    }

    pub fn set_mask(&mut self, mask: u8) {
        self.custom_index_and_mask = (self.custom_index_and_mask & INSTANCE_CUSTOM_INDEX_MAX) | ((mask as u32) << 24);
    }

    #[inline]
    pub fn sbt_offset(&self) -> u32 {
        self.sbt_offset_and_flags & INSTANCE_CUSTOM_INDEX_MAX
    }

    pub fn set_sbt_offset(&mut self, offset: u32) {
        assert!(offset <= INSTANCE_CUSTOM_INDEX_MAX, "sbt offset {offset} exceeds 24 bits");
        self.sbt_offset_and_flags = (self.sbt_offset_and_flags & !INSTANCE_CUSTOM_INDEX_MAX) | offset;
    }

    #[inline]
    pub fn flags(&self) -> u8 {
        (self.sbt_offset_and_flags >> 24) as u8
    }

    pub fn set_flags(&mut self, flags: u8) {
        self.sbt_offset_and_flags = (self.sbt_offset_and_flags & INSTANCE_CUSTOM_INDEX_MAX) | ((flags as u32) << 24);
    }
}

/// The GPU as seen by the acceleration structure layer.
///
/// Implementations use interior mutability; all methods take `&self`.
/// Destruction is infallible, unknown handles are ignored.
pub trait Device: Send + Sync {
    fn properties(&self) -> DeviceProperties;

    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferHandle>;
    fn destroy_buffer(&self, buffer: BufferHandle);
    fn buffer_device_address(&self, buffer: BufferHandle) -> Result<DeviceAddress>;
    /// Write through the persistent mapping of a host visible buffer.
    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<()>;
    /// Debug name shown in leak reports and captures.
    fn set_buffer_name(&self, buffer: BufferHandle, name: &str);

    fn create_acceleration_structure(&self, desc: &AccelStructDesc) -> Result<AccelStructHandle>;
    fn destroy_acceleration_structure(&self, accel: AccelStructHandle);
    fn acceleration_structure_address(&self, accel: AccelStructHandle) -> Result<DeviceAddress>;

    /// Storage and scratch sizes for a build over `max_primitive_counts`
    /// (one entry per geometry).
    fn build_sizes(&self, info: &BuildGeometryInfo, max_primitive_counts: &[u32]) -> Result<BuildSizes>;

    /// Submit and block until the GPU has finished.
    fn submit_and_wait(&self, commands: CommandBuffer) -> Result<()>;
    /// Submit without waiting. Completion is tracked by the caller's frame
    /// fences.
    fn submit(&self, commands: CommandBuffer) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_layout() {
        assert_eq!(AccelStructInstance::SIZE, 64);
    }

    #[test]
    fn test_instance_bitfields() {
        let mut inst = AccelStructInstance::new(0xABCD);
        inst.set_mask(0xFF);
        inst.set_custom_index(0x12_3456);
        assert_eq!(inst.custom_index(), 0x12_3456);
        assert_eq!(inst.mask(), 0xFF);

        inst.set_custom_index(7);
        assert_eq!(inst.custom_index(), 7);
        assert_eq!(inst.mask(), 0xFF);

        inst.set_flags(0x3);
        inst.set_sbt_offset(42);
        assert_eq!(inst.flags(), 0x3);
        assert_eq!(inst.sbt_offset(), 42);
        assert_eq!(inst.acceleration_structure_reference, 0xABCD);
    }

    #[test]
    #[should_panic(expected = "exceeds 24 bits")]
    fn test_custom_index_overflow() {
        AccelStructInstance::new(0).set_custom_index(1 << 24);
    }
}
