//! Per-primitive material lookup for hit shaders.
//!
//! Every BLAS in use contributes one [`GeometryMeta`] record per primitive,
//! in primitive order. An instance's custom index is the offset of its
//! BLAS's first record, so a shader finds a triangle's record at
//! `instanceCustomIndex + geometryIndex`.

use std::collections::BTreeMap;

use bytemuck::{Pod, Zeroable};

use super::blas::{unbuilt_error, BlasId, BlasRef};
use crate::device::{BufferDesc, BufferUsage, Context};
use crate::resource::ManagedBuffer;
use crate::util::Result;

/// GPU record describing one primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable, Default)]
#[repr(C)]
pub struct GeometryMeta {
    pub material_index: i32,
    /// First index of the primitive's range in the shared index buffer
    pub index_buffer_offset: u32,
}

/// Record offset of each BLAS's first primitive.
pub type GeometryMetaOffsets = BTreeMap<BlasId, u32>;

/// Flatten `used` into records, returning them with each BLAS's offset.
///
/// Iterates in `BlasId` order.
pub fn pack_geometry_meta(used: &BTreeMap<BlasId, BlasRef>) -> Result<(Vec<GeometryMeta>, GeometryMetaOffsets)> {
    let mut records = Vec::new();
    let mut offsets = GeometryMetaOffsets::new();
    for (id, blas) in used {
        let mesh = blas.mesh().ok_or_else(|| unbuilt_error(blas))?;
        offsets.insert(*id, records.len() as u32);
        records.extend(mesh.primitives.iter().map(|p| GeometryMeta {
            material_index: p.material_index,
            index_buffer_offset: p.first_index,
        }));
    }
    Ok((records, offsets))
}

/// Device buffer holding the packed [`GeometryMeta`] records.
#[derive(Debug)]
pub struct GeometryMetaBuffer {
    buffer: ManagedBuffer,
    record_count: u32,
    headroom: f32,
}

impl Default for GeometryMetaBuffer {
    fn default() -> Self {
        Self::new(0.0)
    }
}

impl GeometryMetaBuffer {
    pub fn new(headroom: f32) -> Self {
        Self {
            buffer: ManagedBuffer::new(),
            record_count: 0,
            headroom,
        }
    }

    /// Rebuild the records for `used` and upload them in one transfer.
    ///
    /// The buffer only grows. With no records nothing is uploaded.
    #[tracing::instrument(skip_all, fields(blas_count = used.len()))]
    pub fn create_or_update(&mut self, ctx: &Context, used: &BTreeMap<BlasId, BlasRef>) -> Result<GeometryMetaOffsets> {
        let (records, offsets) = pack_geometry_meta(used)?;
        self.record_count = records.len() as u32;
        if records.is_empty() {
            return Ok(offsets);
        }

        let bytes: &[u8] = bytemuck::cast_slice(&records);
        self.buffer.ensure_capacity(
            ctx,
            &BufferDesc::new(
                "Geometry Meta Buffer",
                bytes.len() as u64,
                BufferUsage::STORAGE | BufferUsage::TRANSFER_DST | BufferUsage::SHADER_DEVICE_ADDRESS,
            ),
            self.headroom,
        )?;
        self.buffer.write_device_local(0, bytes)?;
        tracing::debug!(records = self.record_count, "geometry metadata uploaded");
        Ok(offsets)
    }

    /// Records written by the last rebuild.
    pub fn record_count(&self) -> u32 {
        self.record_count
    }

    pub fn buffer(&self) -> &ManagedBuffer {
        &self.buffer
    }

    pub fn exists(&self) -> bool {
        self.buffer.exists()
    }

    pub fn destroy(&mut self) {
        self.buffer.destroy();
        self.record_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_layout() {
        assert_eq!(std::mem::size_of::<GeometryMeta>(), 8);
    }

    #[test]
    fn test_empty_set() {
        let (records, offsets) = pack_geometry_meta(&BTreeMap::new()).unwrap();
        assert!(records.is_empty());
        assert!(offsets.is_empty());
    }
}
