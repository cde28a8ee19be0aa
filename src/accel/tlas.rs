//! Top-level acceleration structure over static and animated instances.
//!
//! ## State machine
//! ```text
//!            add / remove / clear / instance_mut
//!   Clean ───────────────────────────────────────▶ Dirty
//!     ▲                                              │
//!     └────────────── create_or_update ──────────────┘
//! ```
//! `create_or_update` is a no-op while clean. `update_lean` refits animated
//! transforms and is only valid while clean.
//!
//! ## Instance array layout
//! ```text
//! [ static 0 .. static S-1 | animated 0 .. animated A-1 ]
//!                            ^ S * 64 bytes, the only range a lean update touches
//! ```

use std::collections::BTreeMap;

use smallvec::smallvec;

use super::blas::{unbuilt_error, BlasId, BlasRef};
use super::geometry_meta::GeometryMetaBuffer;
use super::instance::{BlasInstance, InstanceId};
use crate::config::AccelConfig;
use crate::device::{
    AccelStructDesc, AccelStructHandle, AccelStructInstance, AccelStructType, AccessFlags,
    BufferDesc, BufferUsage, BuildFlags, BuildGeometryInfo, BuildMode, BuildRange, CommandBuffer,
    Context, DeviceAddress, GeometryData, GeometryFlags, InstanceGeometry, MemoryBarrier,
};
use crate::resource::{DeviceResource, DualBuffer, ManagedBuffer};
use crate::scene::{MeshInstance, TransformSource};
use crate::util::{grown_capacity, Error, Mat4, Result};

/// Top-level acceleration structure and everything it owns.
pub struct Tlas {
    ctx: Context,
    config: AccelConfig,
    name: String,
    next_id: InstanceId,
    static_instances: BTreeMap<InstanceId, BlasInstance>,
    animated_instances: BTreeMap<InstanceId, BlasInstance>,
    dirty: bool,
    flags: BuildFlags,
    instance_buffer: DualBuffer,
    buffer: ManagedBuffer,
    scratch: ManagedBuffer,
    handle: Option<AccelStructHandle>,
    address: DeviceAddress,
    geometry_meta: GeometryMetaBuffer,
    /// Instances consumed by the last full build
    built_instance_count: u32,
}

impl std::fmt::Debug for Tlas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tlas")
            .field("name", &self.name)
            .field("static", &self.static_instances.len())
            .field("animated", &self.animated_instances.len())
            .field("dirty", &self.dirty)
            .field("handle", &self.handle)
            .finish()
    }
}

impl Tlas {
    /// Empty, dirty TLAS. Nothing is allocated until the first rebuild.
    pub fn new(ctx: &Context, config: AccelConfig) -> Self {
        let mut flags = BuildFlags::ALLOW_UPDATE;
        flags |= if config.prefer_fast_trace {
            BuildFlags::PREFER_FAST_TRACE
        } else {
            BuildFlags::PREFER_FAST_BUILD
        };
        Self {
            ctx: ctx.clone(),
            name: "Tlas".to_string(),
            next_id: 0,
            static_instances: BTreeMap::new(),
            animated_instances: BTreeMap::new(),
            dirty: true,
            flags,
            instance_buffer: DualBuffer::new(),
            buffer: ManagedBuffer::new(),
            scratch: ManagedBuffer::new(),
            handle: None,
            address: 0,
            geometry_meta: GeometryMetaBuffer::new(config.metadata_headroom),
            built_instance_count: 0,
            config,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn next_instance_id(&mut self) -> InstanceId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn configure(&self, mut instance: BlasInstance) -> BlasInstance {
        instance.set_mask(self.config.default_instance_mask);
        instance
    }

    /// Add an instance with a fixed world transform.
    pub fn add_instance_static(&mut self, blas: &BlasRef, transform: Mat4) -> InstanceId {
        let id = self.next_instance_id();
        let instance = self.configure(BlasInstance::new_static(id, blas.clone(), transform));
        self.static_instances.insert(id, instance);
        self.dirty = true;
        id
    }

    /// Add an instance whose transform is resampled on every lean update.
    pub fn add_instance_animated(&mut self, blas: &BlasRef, source: Box<dyn TransformSource>) -> InstanceId {
        let id = self.next_instance_id();
        let instance = self.configure(BlasInstance::new_animated(id, blas.clone(), source));
        self.animated_instances.insert(id, instance);
        self.dirty = true;
        id
    }

    /// Static or animated depending on the node's static flag.
    pub fn add_instance_auto(&mut self, mesh_instance: &MeshInstance) -> InstanceId {
        if mesh_instance.node.is_static() {
            self.add_instance_static(&mesh_instance.blas, mesh_instance.node.global())
        } else {
            self.add_instance_animated(&mesh_instance.blas, Box::new(mesh_instance.node.clone()))
        }
    }

    /// Remove `id` from whichever collection holds it. Always marks the
    /// TLAS dirty, even when `id` is unknown. Returns whether it was found.
    pub fn remove_instance(&mut self, id: InstanceId) -> bool {
        let removed = self.static_instances.remove(&id).is_some() || self.animated_instances.remove(&id).is_some();
        self.dirty = true;
        removed
    }

    pub fn clear_instances(&mut self) {
        self.static_instances.clear();
        self.animated_instances.clear();
        self.dirty = true;
    }

    pub fn instance(&self, id: InstanceId) -> Option<&BlasInstance> {
        self.static_instances
            .get(&id)
            .or_else(|| self.animated_instances.get(&id))
    }

    /// Mutable access for mask, flags or SBT offset changes. Marks the TLAS
    /// dirty when the instance exists.
    pub fn instance_mut(&mut self, id: InstanceId) -> Option<&mut BlasInstance> {
        let instance = match self.static_instances.get_mut(&id) {
            Some(instance) => Some(instance),
            None => self.animated_instances.get_mut(&id),
        };
        if instance.is_some() {
            self.dirty = true;
        }
        instance
    }

    pub fn static_instances(&self) -> impl Iterator<Item = &BlasInstance> {
        self.static_instances.values()
    }

    pub fn animated_instances(&self) -> impl Iterator<Item = &BlasInstance> {
        self.animated_instances.values()
    }

    pub fn instance_count(&self) -> usize {
        self.static_instances.len() + self.animated_instances.len()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn handle(&self) -> Option<AccelStructHandle> {
        self.handle
    }

    /// Address of the last successful build, 0 when there is none.
    pub fn device_address(&self) -> DeviceAddress {
        self.address
    }

    pub fn geometry_meta_buffer(&self) -> &GeometryMetaBuffer {
        &self.geometry_meta
    }

    pub fn instance_buffer(&self) -> &DualBuffer {
        &self.instance_buffer
    }

    pub fn buffer(&self) -> &ManagedBuffer {
        &self.buffer
    }

    pub fn scratch_buffer(&self) -> &ManagedBuffer {
        &self.scratch
    }

    fn instance_geometry(&self) -> GeometryData {
        GeometryData::Instances(InstanceGeometry {
            data_address: self.instance_buffer.device_buffer().device_address(),
            flags: GeometryFlags::OPAQUE,
        })
    }

    /// Full rebuild when dirty, no-op when clean. Blocks until the build has
    /// executed.
    pub fn create_or_update(&mut self) -> Result<()> {
        if !self.dirty {
            tracing::trace!(tlas = %self.name, "clean, skipping rebuild");
            return Ok(());
        }
        let _span = tracing::info_span!(
            "tlas_rebuild",
            tlas = %self.name,
            static_count = self.static_instances.len(),
            animated_count = self.animated_instances.len()
        )
        .entered();

        // distinct BLASes in use
        let mut used: BTreeMap<BlasId, BlasRef> = BTreeMap::new();
        for instance in self.static_instances.values().chain(self.animated_instances.values()) {
            let blas = instance.blas();
            if !blas.is_built() {
                return Err(unbuilt_error(blas));
            }
            used.entry(blas.id()).or_insert_with(|| blas.clone());
        }

        let offsets = self.geometry_meta.create_or_update(&self.ctx, &used)?;
        let max_custom_index = self.ctx.properties().max_instance_custom_index;
        if let Some((id, offset)) = offsets.iter().find(|(_, offset)| **offset > max_custom_index) {
            return Err(Error::build_failed(format!(
                "metadata offset {offset} of Blas {id} exceeds the device's custom index limit {max_custom_index}"
            )));
        }

        // static first, animated last
        let mut records: Vec<AccelStructInstance> = Vec::with_capacity(self.instance_count());
        for instance in self
            .static_instances
            .values_mut()
            .chain(self.animated_instances.values_mut())
        {
            let offset = offsets
                .get(&instance.blas().id())
                .copied()
                .ok_or_else(|| unbuilt_error(instance.blas()))?;
            instance.set_geometry_meta_offset(offset);
            records.push(instance.packed());
        }
        let instance_count = records.len() as u32;

        // the instance buffer always holds at least one record
        let instance_bytes = records.len().max(1) as u64 * AccelStructInstance::SIZE;
        if let Some(capacity) = grown_capacity(self.instance_buffer.size(), instance_bytes, self.config.instance_headroom) {
            tracing::debug!(from = self.instance_buffer.size(), to = capacity, "growing instance buffer");
            self.instance_buffer.create(
                &self.ctx,
                &BufferDesc::new(
                    format!("{} Instances", self.name),
                    capacity,
                    BufferUsage::ACCEL_STRUCT_BUILD_INPUT | BufferUsage::SHADER_DEVICE_ADDRESS | BufferUsage::STORAGE,
                ),
                self.config.frames_in_flight,
            )?;
        }
        self.instance_buffer.stage_full_buffer(0, bytemuck::cast_slice(&records))?;

        let mut info = BuildGeometryInfo::new(AccelStructType::TopLevel, self.flags, BuildMode::Build);
        info.geometries = smallvec![self.instance_geometry()];
        let sizes = self.ctx.build_sizes(&info, &[instance_count])?;

        // the structure lives in `buffer`, so it goes before the buffer does
        if self.buffer.size() < sizes.acceleration_structure_size {
            self.destroy_handle();
        }
        self.buffer.ensure_capacity(
            &self.ctx,
            &BufferDesc::new(
                self.name.clone(),
                sizes.acceleration_structure_size,
                BufferUsage::ACCEL_STRUCT_STORAGE | BufferUsage::SHADER_DEVICE_ADDRESS,
            ),
            self.config.structure_headroom,
        )?;
        self.scratch.ensure_capacity(
            &self.ctx,
            &BufferDesc::new(
                format!("Scratch for {}", self.name),
                sizes.build_scratch_size.max(sizes.update_scratch_size),
                BufferUsage::STORAGE | BufferUsage::SHADER_DEVICE_ADDRESS,
            )
            .with_alignment(self.ctx.properties().min_scratch_offset_alignment),
            self.config.structure_headroom,
        )?;

        let handle = match self.handle {
            Some(handle) => {
                info.mode = BuildMode::Update;
                info.src = Some(handle);
                handle
            }
            None => {
                let handle = self.ctx.create_acceleration_structure(&AccelStructDesc {
                    name: self.name.clone(),
                    ty: AccelStructType::TopLevel,
                    buffer: self.buffer.require_handle()?,
                    offset: 0,
                    size: self.buffer.size(),
                })?;
                self.handle = Some(handle);
                handle
            }
        };
        info.dst = Some(handle);
        info.scratch_address = self.scratch.device_address();
        let mode = info.mode;

        let mut cmd = CommandBuffer::new(format!("rebuild {}", self.name));
        self.instance_buffer.cmd_copy_to_device(0, &mut cmd)?;
        cmd.memory_barrier(MemoryBarrier::transfer_to_build(AccessFlags::ACCEL_STRUCT_READ));
        cmd.build_acceleration_structure(
            info,
            vec![BuildRange {
                primitive_count: instance_count,
                ..Default::default()
            }],
        );
        if let Err(err) = self.ctx.submit_and_wait(cmd) {
            // a structure that failed to build cannot serve as an update source
            self.destroy_handle();
            return Err(err);
        }

        self.address = self.ctx.acceleration_structure_address(handle)?;
        self.built_instance_count = instance_count;
        self.dirty = false;
        tracing::debug!(instances = instance_count, ?mode, address = self.address, "tlas built");
        Ok(())
    }

    /// Record a refit of the animated instances' transforms into `cmd`.
    ///
    /// Records nothing when there are no animated instances. Panics if the
    /// TLAS is dirty. Nothing is submitted or waited on here; `frame`
    /// selects the staging slot.
    pub fn update_lean(&mut self, cmd: &mut CommandBuffer, frame: u64) -> Result<()> {
        if self.animated_instances.is_empty() {
            return Ok(());
        }
        assert!(
            !self.dirty,
            "{}: update_lean on a dirty TLAS, call create_or_update first",
            self.name
        );
        let handle = self
            .handle
            .ok_or_else(|| Error::other(format!("{} has no built structure", self.name)))?;

        let records: Vec<AccelStructInstance> = self
            .animated_instances
            .values_mut()
            .map(|instance| {
                instance.update();
                instance.packed()
            })
            .collect();
        let offset = self.static_instances.len() as u64 * AccelStructInstance::SIZE;
        self.instance_buffer
            .stage_section(frame, bytemuck::cast_slice(&records), offset)?;
        self.instance_buffer.cmd_copy_to_device(frame, cmd)?;
        cmd.memory_barrier(MemoryBarrier::transfer_to_build(AccessFlags::ACCEL_STRUCT_WRITE));

        let mut info = BuildGeometryInfo::new(AccelStructType::TopLevel, self.flags, BuildMode::Update);
        info.src = Some(handle);
        info.dst = Some(handle);
        info.scratch_address = self.scratch.device_address();
        info.geometries = smallvec![self.instance_geometry()];
        cmd.build_acceleration_structure(
            info,
            vec![BuildRange {
                primitive_count: self.built_instance_count,
                ..Default::default()
            }],
        );
        tracing::trace!(tlas = %self.name, frame, animated = records.len(), "lean update recorded");
        Ok(())
    }

    fn destroy_handle(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.ctx.destroy_acceleration_structure(handle);
        }
        self.address = 0;
    }

    pub fn exists(&self) -> bool {
        self.handle.is_some()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Drop all instances and release every device resource. Idempotent.
    pub fn destroy(&mut self) {
        self.static_instances.clear();
        self.animated_instances.clear();
        self.destroy_handle();
        self.instance_buffer.destroy();
        self.scratch.destroy();
        self.buffer.destroy();
        self.geometry_meta.destroy();
        self.built_instance_count = 0;
        self.dirty = true;
    }
}

impl DeviceResource for Tlas {
    fn exists(&self) -> bool {
        Tlas::exists(self)
    }

    fn destroy(&mut self) {
        Tlas::destroy(self)
    }

    fn name(&self) -> &str {
        Tlas::name(self)
    }
}

impl Drop for Tlas {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::Blas;
    use crate::device::HeadlessDevice;
    use crate::scene::{GeometryStore, Mesh, Primitive, TransformNode, Vertex};
    use crate::util::Vec3;
    use std::sync::Arc;

    struct Fixture {
        device: Arc<HeadlessDevice>,
        ctx: Context,
        _store: GeometryStore,
        blas: Blas,
    }

    fn fixture() -> Fixture {
        let device = Arc::new(HeadlessDevice::new());
        let ctx: Context = device.clone();
        let vertices: Vec<Vertex> = (0..3).map(|i| Vertex::new([i as f32, 1.0, 0.0])).collect();
        let store = GeometryStore::create(&ctx, &vertices, &[0, 1, 2]).unwrap();
        let mut blas = Blas::new();
        let mesh = Arc::new(Mesh::new("tri", vec![Primitive::new(0, 0, 3, 2)]));
        blas.create_or_update(&ctx, mesh, &store, None).unwrap();
        Fixture { device, ctx, _store: store, blas }
    }

    #[test]
    fn test_starts_dirty() {
        let f = fixture();
        let tlas = Tlas::new(&f.ctx, AccelConfig::default());
        assert!(tlas.is_dirty());
        assert!(!tlas.exists());
        assert_eq!(tlas.device_address(), 0);
    }

    #[test]
    fn test_ids_are_sequential() {
        let f = fixture();
        let mut tlas = Tlas::new(&f.ctx, AccelConfig::default());
        let r = f.blas.instance_ref();
        let a = tlas.add_instance_static(&r, Mat4::IDENTITY);
        let b = tlas.add_instance_animated(&r, Box::new(|| Mat4::IDENTITY));
        assert_eq!(b, a + 1);
        assert!(tlas.remove_instance(a));
        let c = tlas.add_instance_static(&r, Mat4::IDENTITY);
        assert_eq!(c, b + 1);
    }

    #[test]
    fn test_rebuild_then_noop() {
        let f = fixture();
        let mut tlas = Tlas::new(&f.ctx, AccelConfig::default());
        tlas.add_instance_static(&f.blas.instance_ref(), Mat4::IDENTITY);
        tlas.create_or_update().unwrap();
        assert!(!tlas.is_dirty());
        assert_ne!(tlas.device_address(), 0);

        let before = f.device.stats();
        tlas.create_or_update().unwrap();
        assert_eq!(f.device.stats(), before);
    }

    #[test]
    fn test_second_rebuild_refits_in_place() {
        let f = fixture();
        let mut tlas = Tlas::new(&f.ctx, AccelConfig::default());
        let r = f.blas.instance_ref();
        tlas.add_instance_static(&r, Mat4::IDENTITY);
        tlas.create_or_update().unwrap();
        let handle = tlas.handle();

        tlas.add_instance_static(&r, Mat4::from_translation(Vec3::Y));
        tlas.create_or_update().unwrap();
        assert_eq!(tlas.handle(), handle);
        let built = f.device.built_structure(handle.unwrap()).unwrap();
        assert_eq!(built.last_mode, BuildMode::Update);
        assert_eq!(built.instances.len(), 2);
    }

    #[test]
    fn test_instance_mut_marks_dirty() {
        let f = fixture();
        let mut tlas = Tlas::new(&f.ctx, AccelConfig::default());
        let id = tlas.add_instance_static(&f.blas.instance_ref(), Mat4::IDENTITY);
        tlas.create_or_update().unwrap();

        assert!(tlas.instance_mut(id + 100).is_none());
        assert!(!tlas.is_dirty());
        tlas.instance_mut(id).unwrap().set_mask(0x0F);
        assert!(tlas.is_dirty());
        tlas.create_or_update().unwrap();
        let built = f.device.built_structure(tlas.handle().unwrap()).unwrap();
        assert_eq!(built.instances[0].mask(), 0x0F);
    }

    #[test]
    fn test_add_instance_auto() {
        let f = fixture();
        let mut tlas = Tlas::new(&f.ctx, AccelConfig::default());
        let r = f.blas.instance_ref();
        let fixed = tlas.add_instance_auto(&MeshInstance::new(TransformNode::new("a", Mat4::IDENTITY, true), r.clone()));
        let moving = tlas.add_instance_auto(&MeshInstance::new(TransformNode::new("b", Mat4::IDENTITY, false), r));
        assert!(!tlas.instance(fixed).unwrap().is_animated());
        assert!(tlas.instance(moving).unwrap().is_animated());
    }

    #[test]
    fn test_unbuilt_blas_is_rejected() {
        let f = fixture();
        let mut tlas = Tlas::new(&f.ctx, AccelConfig::default());
        let unbuilt = Blas::new();
        tlas.add_instance_static(&unbuilt.instance_ref(), Mat4::IDENTITY);
        assert!(matches!(tlas.create_or_update(), Err(Error::BuildFailed(_))));
        assert!(tlas.is_dirty());
    }

    #[test]
    fn test_default_mask_from_config() {
        let f = fixture();
        let config = AccelConfig { default_instance_mask: 0x01, ..Default::default() };
        let mut tlas = Tlas::new(&f.ctx, config);
        let id = tlas.add_instance_static(&f.blas.instance_ref(), Mat4::IDENTITY);
        assert_eq!(tlas.instance(id).unwrap().mask(), 0x01);
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let f = fixture();
        let mut tlas = Tlas::new(&f.ctx, AccelConfig::default());
        tlas.add_instance_static(&f.blas.instance_ref(), Mat4::IDENTITY);
        tlas.create_or_update().unwrap();
        tlas.destroy();
        tlas.destroy();
        assert_eq!(tlas.instance_count(), 0);
        assert_eq!(tlas.device_address(), 0);
        assert!(tlas.is_dirty());
        // geometry store (2) plus the blas buffer and structure
        assert_eq!(f.device.live_count(), 4);
    }
}
