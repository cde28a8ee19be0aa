//! Bottom-level acceleration structures, one per mesh.
//!
//! A build is synchronous: it records a single build command, submits it
//! and waits. The structure's storage buffer is reused across rebuilds and
//! only reallocated when the new size requirement exceeds it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::bench::HostBenchmark;
use crate::config::AccelConfig;
use crate::device::{
    AccelStructDesc, AccelStructHandle, AccelStructType, BufferDesc, BufferUsage, BuildFlags,
    BuildGeometryInfo, BuildMode, BuildRange, CommandBuffer, Context, DeviceAddress,
    GeometryData, GeometryFlags, IndexType, TriangleGeometry, VertexFormat,
};
use crate::resource::{DeviceResource, ManagedBuffer};
use crate::scene::{GeometryStore, Mesh};
use crate::util::{Error, Result};

pub const BENCH_RESET: &str = "Reset";
pub const BENCH_CREATE_BUILD_STRUCTS: &str = "Create Build Structs";
pub const BENCH_GET_BUILD_SIZES: &str = "Get Build Sizes";
pub const BENCH_CREATE: &str = "Create";
pub const BENCH_BUILD: &str = "Build";

static NEXT_BLAS_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique BLAS identity. Orders metadata records deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlasId(u64);

impl BlasId {
    fn next() -> Self {
        Self(NEXT_BLAS_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BlasId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Default)]
struct Published {
    address: DeviceAddress,
    mesh: Option<Arc<Mesh>>,
}

#[derive(Debug)]
struct Shared {
    id: BlasId,
    published: RwLock<Published>,
}

/// Non-owning view of a [`Blas`] held by instances.
///
/// Always observes the latest build: a rebuilt BLAS republishes its address
/// and mesh, and the next TLAS rebuild picks them up.
#[derive(Debug, Clone)]
pub struct BlasRef(Arc<Shared>);

impl BlasRef {
    pub fn id(&self) -> BlasId {
        self.0.id
    }

    /// Device address of the last build, 0 if not built.
    pub fn device_address(&self) -> DeviceAddress {
        self.0.published.read().address
    }

    pub fn is_built(&self) -> bool {
        self.device_address() != 0
    }

    pub fn mesh(&self) -> Option<Arc<Mesh>> {
        self.0.published.read().mesh.clone()
    }

    /// Primitive (geometry) count of the last build.
    pub fn primitive_count(&self) -> usize {
        self.0
            .published
            .read()
            .mesh
            .as_ref()
            .map_or(0, |m| m.primitives.len())
    }
}

impl PartialEq for BlasRef {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for BlasRef {}

/// Bottom-level acceleration structure over one mesh.
///
/// The structure handle is valid exactly while the storage buffer exists.
pub struct Blas {
    shared: Arc<Shared>,
    name: String,
    ctx: Option<Context>,
    buffer: ManagedBuffer,
    handle: Option<AccelStructHandle>,
    flags: BuildFlags,
    structure_headroom: f32,
}

impl Default for Blas {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Blas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blas")
            .field("name", &self.name)
            .field("handle", &self.handle)
            .field("buffer", &self.buffer)
            .finish()
    }
}

impl Blas {
    pub fn new() -> Self {
        Self::with_config(&AccelConfig::default())
    }

    pub fn with_config(config: &AccelConfig) -> Self {
        let id = BlasId::next();
        let flags = if config.prefer_fast_trace {
            BuildFlags::PREFER_FAST_TRACE
        } else {
            BuildFlags::PREFER_FAST_BUILD
        };
        Self {
            shared: Arc::new(Shared {
                id,
                published: RwLock::new(Published::default()),
            }),
            name: format!("Blas {id}"),
            ctx: None,
            buffer: ManagedBuffer::new(),
            handle: None,
            flags,
            structure_headroom: config.structure_headroom,
        }
    }

    pub fn id(&self) -> BlasId {
        self.shared.id
    }

    pub fn handle(&self) -> Option<AccelStructHandle> {
        self.handle
    }

    pub fn device_address(&self) -> DeviceAddress {
        self.shared.published.read().address
    }

    pub fn mesh(&self) -> Option<Arc<Mesh>> {
        self.shared.published.read().mesh.clone()
    }

    pub fn buffer(&self) -> &ManagedBuffer {
        &self.buffer
    }

    /// Shareable reference for instances.
    pub fn instance_ref(&self) -> BlasRef {
        BlasRef(self.shared.clone())
    }

    /// Build (or rebuild) the structure over `mesh`, blocking until done.
    ///
    /// Panics if the mesh has no primitives or a primitive's index count is
    /// not a multiple of 3.
    #[tracing::instrument(skip_all, fields(blas = %self.shared.id, mesh = %mesh.name, primitives = mesh.primitives.len()))]
    pub fn create_or_update(
        &mut self,
        ctx: &Context,
        mesh: Arc<Mesh>,
        geometry: &GeometryStore,
        mut bench: Option<&mut HostBenchmark>,
    ) -> Result<()> {
        assert!(!mesh.primitives.is_empty(), "cannot build {} over mesh \"{}\" without primitives", self.name, mesh.name);
        for (i, primitive) in mesh.primitives.iter().enumerate() {
            assert!(
                primitive.index_count % 3 == 0,
                "primitive {i} of mesh \"{}\" has {} indices, not a multiple of 3",
                mesh.name,
                primitive.index_count
            );
        }
        if let Some(bench) = bench.as_deref_mut() {
            bench.begin();
        }
        let mut mark = |id: &'static str| {
            if let Some(bench) = bench.as_deref_mut() {
                bench.log_timestamp(id);
            }
        };

        self.destroy_handle();
        self.ctx = Some(ctx.clone());
        mark(BENCH_RESET);

        let mut geometries: SmallVec<[GeometryData; 4]> = SmallVec::with_capacity(mesh.primitives.len());
        let mut ranges = Vec::with_capacity(mesh.primitives.len());
        let mut counts = Vec::with_capacity(mesh.primitives.len());
        for primitive in &mesh.primitives {
            geometries.push(GeometryData::Triangles(TriangleGeometry {
                vertex_address: geometry.vertex_address(),
                vertex_stride: geometry.vertex_stride(),
                vertex_format: VertexFormat::R32G32B32Float,
                max_vertex: primitive.highest_referenced_index,
                index_address: geometry.index_address(),
                index_type: IndexType::U32,
                flags: GeometryFlags::OPAQUE,
            }));
            ranges.push(BuildRange {
                primitive_count: primitive.triangle_count(),
                primitive_offset: primitive.index_byte_offset(),
                ..Default::default()
            });
            counts.push(primitive.triangle_count());
        }
        let mut info = BuildGeometryInfo::new(AccelStructType::BottomLevel, self.flags, BuildMode::Build);
        info.geometries = geometries;
        mark(BENCH_CREATE_BUILD_STRUCTS);

        let sizes = ctx.build_sizes(&info, &counts)?;
        mark(BENCH_GET_BUILD_SIZES);

        self.buffer.ensure_capacity(
            ctx,
            &BufferDesc::new(
                self.name.clone(),
                sizes.acceleration_structure_size,
                BufferUsage::ACCEL_STRUCT_STORAGE | BufferUsage::SHADER_DEVICE_ADDRESS,
            ),
            self.structure_headroom,
        )?;
        let handle = ctx.create_acceleration_structure(&AccelStructDesc {
            name: self.name.clone(),
            ty: AccelStructType::BottomLevel,
            buffer: self.buffer.require_handle()?,
            offset: 0,
            size: sizes.acceleration_structure_size,
        })?;
        self.handle = Some(handle);

        let mut scratch = ManagedBuffer::new();
        scratch.create(
            ctx,
            BufferDesc::new(
                format!("Scratch for {}", self.name),
                sizes.build_scratch_size,
                BufferUsage::STORAGE | BufferUsage::SHADER_DEVICE_ADDRESS,
            )
            .with_alignment(ctx.properties().min_scratch_offset_alignment),
        )?;
        mark(BENCH_CREATE);

        info.dst = Some(handle);
        info.scratch_address = scratch.device_address();
        let mut cmd = CommandBuffer::new(format!("build {}", self.name));
        cmd.build_acceleration_structure(info, ranges);
        ctx.submit_and_wait(cmd)?;
        scratch.destroy();
        mark(BENCH_BUILD);

        let address = ctx.acceleration_structure_address(handle)?;
        {
            let mut published = self.shared.published.write();
            published.address = address;
            published.mesh = Some(mesh);
        }
        if let Some(bench) = bench {
            bench.end();
        }
        tracing::debug!(address, size = self.buffer.size(), "blas built");
        Ok(())
    }

    fn destroy_handle(&mut self) {
        if let (Some(ctx), Some(handle)) = (self.ctx.as_ref(), self.handle.take()) {
            ctx.destroy_acceleration_structure(handle);
        }
        self.shared.published.write().address = 0;
    }

    pub fn exists(&self) -> bool {
        self.handle.is_some()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Release the structure and its buffer. Idempotent.
    pub fn destroy(&mut self) {
        self.destroy_handle();
        self.buffer.destroy();
    }
}

impl DeviceResource for Blas {
    fn exists(&self) -> bool {
        Blas::exists(self)
    }

    fn destroy(&mut self) {
        Blas::destroy(self)
    }

    fn name(&self) -> &str {
        Blas::name(self)
    }
}

impl Drop for Blas {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Error for a TLAS rebuild that references a BLAS without a live build.
pub(crate) fn unbuilt_error(blas: &BlasRef) -> Error {
    Error::build_failed(format!("Blas {} is referenced but not built", blas.id()))
}
