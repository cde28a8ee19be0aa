//! Scene-side inputs consumed by the builders.
//!
//! - [`Mesh`] / [`Primitive`] - triangle ranges over shared index data
//! - [`GeometryStore`] - the scene-wide vertex and index buffers
//! - [`TransformSource`] / [`TransformNode`] - per-instance world transforms
//! - [`MeshInstance`] - a node placing a built BLAS into the scene

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use parking_lot::RwLock;

use crate::accel::BlasRef;
use crate::device::{BufferDesc, BufferUsage, Context, DeviceAddress};
use crate::resource::ManagedBuffer;
use crate::util::{Mat4, Result};

/// Vertex layout of the shared vertex buffer. Position comes first.
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable, Default)]
#[repr(C)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
}

impl Vertex {
    pub fn new(position: [f32; 3]) -> Self {
        Self {
            position,
            ..Default::default()
        }
    }
}

/// A range of the shared index buffer drawn with one material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Primitive {
    pub material_index: i32,
    /// First index of the range (in indices, not bytes)
    pub first_index: u32,
    pub index_count: u32,
    /// Highest vertex index the range references
    pub highest_referenced_index: u32,
}

impl Primitive {
    pub fn new(material_index: i32, first_index: u32, index_count: u32, highest_referenced_index: u32) -> Self {
        Self {
            material_index,
            first_index,
            index_count,
            highest_referenced_index,
        }
    }

    #[inline]
    pub fn triangle_count(&self) -> u32 {
        self.index_count / 3
    }

    /// Byte offset of the range in a `u32` index buffer.
    #[inline]
    pub fn index_byte_offset(&self) -> u32 {
        self.first_index * std::mem::size_of::<u32>() as u32
    }
}

/// Ordered primitive list. Primitive order defines the metadata layout.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Mesh {
    pub name: String,
    pub primitives: Vec<Primitive>,
}

impl Mesh {
    pub fn new(name: impl Into<String>, primitives: Vec<Primitive>) -> Self {
        Self {
            name: name.into(),
            primitives,
        }
    }

    pub fn triangle_count(&self) -> u64 {
        self.primitives.iter().map(|p| p.triangle_count() as u64).sum()
    }
}

/// Scene-wide vertex and index buffers shared by every mesh.
#[derive(Debug)]
pub struct GeometryStore {
    vertices: ManagedBuffer,
    indices: ManagedBuffer,
    vertex_count: u32,
    index_count: u32,
}

impl GeometryStore {
    /// Upload vertices and indices into device local buffers.
    pub fn create(ctx: &Context, vertices: &[Vertex], indices: &[u32]) -> Result<Self> {
        let usage = BufferUsage::STORAGE
            | BufferUsage::TRANSFER_DST
            | BufferUsage::SHADER_DEVICE_ADDRESS
            | BufferUsage::ACCEL_STRUCT_BUILD_INPUT;

        let vertex_bytes: &[u8] = bytemuck::cast_slice(vertices);
        let mut vertex_buffer = ManagedBuffer::new();
        vertex_buffer.create(
            ctx,
            BufferDesc::new("Vertices", vertex_bytes.len() as u64, usage | BufferUsage::VERTEX),
        )?;
        vertex_buffer.write_device_local(0, vertex_bytes)?;

        let index_bytes: &[u8] = bytemuck::cast_slice(indices);
        let mut index_buffer = ManagedBuffer::new();
        index_buffer.create(
            ctx,
            BufferDesc::new("Indices", index_bytes.len() as u64, usage | BufferUsage::INDEX),
        )?;
        index_buffer.write_device_local(0, index_bytes)?;

        Ok(Self {
            vertices: vertex_buffer,
            indices: index_buffer,
            vertex_count: vertices.len() as u32,
            index_count: indices.len() as u32,
        })
    }

    pub fn vertex_address(&self) -> DeviceAddress {
        self.vertices.device_address()
    }

    pub fn index_address(&self) -> DeviceAddress {
        self.indices.device_address()
    }

    pub fn vertex_stride(&self) -> u64 {
        std::mem::size_of::<Vertex>() as u64
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    pub fn vertex_buffer(&self) -> &ManagedBuffer {
        &self.vertices
    }

    pub fn index_buffer(&self) -> &ManagedBuffer {
        &self.indices
    }

    pub fn destroy(&mut self) {
        self.vertices.destroy();
        self.indices.destroy();
    }
}

/// Source of an animated instance's current world transform.
pub trait TransformSource: Send + Sync {
    fn sample(&self) -> Mat4;

    /// Change counter, if the source tracks one. While it is unchanged the
    /// last sample is reused. `None` means resample every time.
    fn generation(&self) -> Option<u64> {
        None
    }
}

impl<F> TransformSource for F
where
    F: Fn() -> Mat4 + Send + Sync,
{
    fn sample(&self) -> Mat4 {
        self()
    }
}

#[derive(Debug)]
struct NodeState {
    name: String,
    global: Mat4,
    is_static: bool,
    generation: u64,
}

/// Shared scene graph node: world matrix, static flag and a change counter.
///
/// Clones share state, so the scene can move a node while an animated
/// instance samples it.
#[derive(Debug, Clone)]
pub struct TransformNode {
    inner: Arc<RwLock<NodeState>>,
}

impl TransformNode {
    pub fn new(name: impl Into<String>, global: Mat4, is_static: bool) -> Self {
        Self {
            inner: Arc::new(RwLock::new(NodeState {
                name: name.into(),
                global,
                is_static,
                generation: 0,
            })),
        }
    }

    pub fn name(&self) -> String {
        self.inner.read().name.clone()
    }

    pub fn global(&self) -> Mat4 {
        self.inner.read().global
    }

    pub fn set_global(&self, global: Mat4) {
        let mut state = self.inner.write();
        state.global = global;
        state.generation += 1;
    }

    pub fn is_static(&self) -> bool {
        self.inner.read().is_static
    }

    pub fn set_static(&self, is_static: bool) {
        let mut state = self.inner.write();
        state.is_static = is_static;
        state.generation += 1;
    }

    /// Incremented on every change.
    pub fn generation(&self) -> u64 {
        self.inner.read().generation
    }
}

impl TransformSource for TransformNode {
    fn sample(&self) -> Mat4 {
        self.global()
    }

    fn generation(&self) -> Option<u64> {
        Some(TransformNode::generation(self))
    }
}

/// Scene node carrying a mesh whose BLAS has been built.
#[derive(Debug, Clone)]
pub struct MeshInstance {
    pub node: TransformNode,
    pub blas: BlasRef,
}

impl MeshInstance {
    pub fn new(node: TransformNode, blas: BlasRef) -> Self {
        Self { node, blas }
    }
}
