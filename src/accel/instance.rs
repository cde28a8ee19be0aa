//! Instance descriptors: one placement of a BLAS in the TLAS.

use std::fmt;

use bitflags::bitflags;

use super::blas::BlasRef;
use crate::device::AccelStructInstance;
use crate::scene::TransformSource;
use crate::util::{Mat4, TransformMatrix};

/// Sequential instance id, unique within one TLAS and never reused.
pub type InstanceId = u64;

bitflags! {
    /// Per-instance traversal flags (high 8 bits of the SBT word).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct GeometryInstanceFlags: u8 {
        const TRIANGLE_FACING_CULL_DISABLE = 1 << 0;
        const TRIANGLE_FLIP_FACING = 1 << 1;
        const FORCE_OPAQUE = 1 << 2;
        const FORCE_NO_OPAQUE = 1 << 3;
    }
}

/// Where an instance's world transform comes from.
pub enum InstanceTransform {
    Fixed(Mat4),
    /// Resampled on every lean update
    Animated(Box<dyn TransformSource>),
}

impl fmt::Debug for InstanceTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceTransform::Fixed(m) => f.debug_tuple("Fixed").field(m).finish(),
            InstanceTransform::Animated(_) => f.write_str("Animated(..)"),
        }
    }
}

/// An instance of a BLAS with its packed GPU record.
#[derive(Debug)]
pub struct BlasInstance {
    id: InstanceId,
    blas: BlasRef,
    transform: InstanceTransform,
    record: AccelStructInstance,
    flags: GeometryInstanceFlags,
    /// Source generation the packed transform was sampled at
    sampled_generation: Option<u64>,
}

impl BlasInstance {
    pub fn new_static(id: InstanceId, blas: BlasRef, transform: Mat4) -> Self {
        let mut instance = Self::with_transform(id, blas, InstanceTransform::Fixed(transform));
        instance.record.transform = TransformMatrix::from_mat4(&transform);
        instance
    }

    /// Animated instance. The source is sampled once immediately.
    pub fn new_animated(id: InstanceId, blas: BlasRef, source: Box<dyn TransformSource>) -> Self {
        let mut instance = Self::with_transform(id, blas, InstanceTransform::Animated(source));
        instance.update();
        instance
    }

    fn with_transform(id: InstanceId, blas: BlasRef, transform: InstanceTransform) -> Self {
        let mut record = AccelStructInstance::new(blas.device_address());
        record.set_mask(0xFF);
        Self {
            id,
            blas,
            transform,
            record,
            flags: GeometryInstanceFlags::empty(),
            sampled_generation: None,
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn blas(&self) -> &BlasRef {
        &self.blas
    }

    pub fn transform(&self) -> &InstanceTransform {
        &self.transform
    }

    pub fn is_animated(&self) -> bool {
        matches!(self.transform, InstanceTransform::Animated(_))
    }

    /// Resample an animated transform into the packed record. No-op for
    /// fixed transforms and for sources whose generation has not moved.
    pub fn update(&mut self) {
        if let InstanceTransform::Animated(source) = &self.transform {
            // read before sampling: a concurrent change forces another resample
            let generation = source.generation();
            if generation.is_some() && generation == self.sampled_generation {
                return;
            }
            self.record.transform = TransformMatrix::from_mat4(&source.sample());
            self.sampled_generation = generation;
        }
    }

    /// Store the BLAS's first metadata record offset as the custom index.
    pub fn set_geometry_meta_offset(&mut self, offset: u32) {
        self.record.set_custom_index(offset);
    }

    pub fn geometry_meta_offset(&self) -> u32 {
        self.record.custom_index()
    }

    pub fn set_mask(&mut self, mask: u8) {
        self.record.set_mask(mask);
    }

    pub fn mask(&self) -> u8 {
        self.record.mask()
    }

    pub fn set_shader_binding_table_offset(&mut self, offset: u32) {
        self.record.set_sbt_offset(offset);
    }

    pub fn shader_binding_table_offset(&self) -> u32 {
        self.record.sbt_offset()
    }

    pub fn set_flags(&mut self, flags: GeometryInstanceFlags) {
        self.flags = flags;
        self.record.set_flags(flags.bits());
    }

    /// OR `flags` into the current flags.
    pub fn add_flags(&mut self, flags: GeometryInstanceFlags) {
        self.set_flags(self.flags | flags);
    }

    pub fn flags(&self) -> GeometryInstanceFlags {
        self.flags
    }

    /// The GPU record, referencing the BLAS's current device address.
    pub fn packed(&self) -> AccelStructInstance {
        let mut record = self.record;
        record.acceleration_structure_reference = self.blas.device_address();
        record
    }
}
