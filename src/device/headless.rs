//! CPU reference implementation of [`Device`].
//!
//! Buffers are plain byte vectors placed at synthetic device addresses.
//! Copies execute on submission, so buffer contents can be inspected after a
//! `submit`. Builds are validated the way a driver would reject them
//! (storage and scratch capacity, update preconditions, input ranges) and
//! snapshot their inputs into a [`BuiltStructure`].

use std::collections::HashMap;

use parking_lot::Mutex;

use super::arena::{ResourceArena, ResourceEntry, ResourceId, ResourceKind};
use super::{
    AccelStructDesc, AccelStructHandle, AccelStructInstance, AccelStructType, BufferDesc,
    BufferHandle, BufferUsage, BuildFlags, BuildGeometryInfo, BuildMode, BuildRange,
    BuildSizes, Command, CommandBuffer, Device, DeviceAddress, DeviceProperties, GeometryData,
    MemoryLocation,
};
use crate::util::{align_up, Error, Result};

/// First synthetic device address handed out.
const BASE_ADDRESS: DeviceAddress = 0x1000_0000;
/// Default placement alignment of buffers.
const BUFFER_ALIGNMENT: u64 = 256;
/// Storage alignment of acceleration structures.
const ACCEL_STRUCT_ALIGNMENT: u64 = 256;

/// What the device last built into an acceleration structure.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltStructure {
    pub ty: AccelStructType,
    pub flags: BuildFlags,
    pub last_mode: BuildMode,
    pub geometry_count: usize,
    pub primitive_counts: Vec<u32>,
    /// Instance records read at build time (top level only)
    pub instances: Vec<AccelStructInstance>,
    /// Full builds this structure has seen
    pub builds: u32,
    /// Refits this structure has seen
    pub updates: u32,
}

/// Counters over the lifetime of a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub buffers_created: u64,
    pub buffers_destroyed: u64,
    pub accels_created: u64,
    pub accels_destroyed: u64,
    pub host_writes: u64,
    pub submissions: u64,
    pub waits: u64,
    pub barriers: u64,
    pub copies: u64,
    pub copy_regions: u64,
    pub bytes_copied: u64,
    pub builds: u64,
    pub updates: u64,
}

struct BufferState {
    desc: BufferDesc,
    address: DeviceAddress,
    data: Vec<u8>,
}

struct AccelState {
    desc: AccelStructDesc,
    address: DeviceAddress,
    built: Option<BuiltStructure>,
}

struct State {
    arena: ResourceArena,
    buffers: HashMap<ResourceId, BufferState>,
    accels: HashMap<ResourceId, AccelState>,
    next_address: DeviceAddress,
    allocated: u64,
    memory_budget: Option<u64>,
    last_submission: Option<CommandBuffer>,
    stats: DeviceStats,
}

impl State {
    fn new() -> Self {
        Self {
            arena: ResourceArena::new(),
            buffers: HashMap::new(),
            accels: HashMap::new(),
            next_address: BASE_ADDRESS,
            allocated: 0,
            memory_budget: None,
            last_submission: None,
            stats: DeviceStats::default(),
        }
    }

    fn buffer(&self, handle: BufferHandle) -> Result<&BufferState> {
        self.buffers
            .get(&handle.0)
            .ok_or(Error::InvalidHandle { kind: "buffer", id: handle.0 })
    }

    fn accel(&self, handle: AccelStructHandle) -> Result<&AccelState> {
        self.accels
            .get(&handle.0)
            .ok_or(Error::InvalidHandle { kind: "acceleration structure", id: handle.0 })
    }

    /// Map a device address to (buffer, byte offset within it).
    fn resolve(&self, address: DeviceAddress) -> Result<(ResourceId, u64)> {
        self.buffers
            .iter()
            .find(|(_, b)| address >= b.address && address < b.address + b.desc.size)
            .map(|(id, b)| (*id, address - b.address))
            .ok_or(Error::UnresolvedAddress(address))
    }

    /// Bytes `[address, address + len)`, which must lie inside one buffer.
    fn read_range(&self, address: DeviceAddress, len: u64) -> Result<&[u8]> {
        let (id, offset) = self.resolve(address)?;
        let buffer = &self.buffers[&id];
        check_range(offset, len, buffer.desc.size)?;
        Ok(&buffer.data[offset as usize..(offset + len) as usize])
    }
}

fn check_range(offset: u64, size: u64, capacity: u64) -> Result<()> {
    match offset.checked_add(size) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(Error::OutOfBounds { offset, size, capacity }),
    }
}

/// Headless device with optional memory budget.
pub struct HeadlessDevice {
    properties: DeviceProperties,
    state: Mutex<State>,
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessDevice {
    pub fn new() -> Self {
        Self::with_properties(DeviceProperties::default())
    }

    pub fn with_properties(properties: DeviceProperties) -> Self {
        Self {
            properties,
            state: Mutex::new(State::new()),
        }
    }

    /// Fail allocations once `bytes` are in use.
    pub fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.state.get_mut().memory_budget = Some(bytes);
        self
    }

    /// Change the budget of a live device. `None` lifts it.
    pub fn set_memory_budget(&self, bytes: Option<u64>) {
        self.state.lock().memory_budget = bytes;
    }

    /// Commands of the most recent `submit` or `submit_and_wait`.
    pub fn last_submission(&self) -> Option<CommandBuffer> {
        self.state.lock().last_submission.clone()
    }

    pub fn stats(&self) -> DeviceStats {
        self.state.lock().stats
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.state.lock().allocated
    }

    /// Host readback of any buffer, device local or not.
    pub fn read_buffer(&self, buffer: BufferHandle, offset: u64, len: u64) -> Result<Vec<u8>> {
        let state = self.state.lock();
        let b = state.buffer(buffer)?;
        check_range(offset, len, b.desc.size)?;
        Ok(b.data[offset as usize..(offset + len) as usize].to_vec())
    }

    /// Readback of `count` POD elements starting at `offset`.
    pub fn read_pod<T: bytemuck::Pod>(&self, buffer: BufferHandle, offset: u64, count: usize) -> Result<Vec<T>> {
        let bytes = self.read_buffer(buffer, offset, (count * std::mem::size_of::<T>()) as u64)?;
        Ok(bytemuck::pod_collect_to_vec(&bytes))
    }

    pub fn buffer_desc(&self, buffer: BufferHandle) -> Option<BufferDesc> {
        self.state.lock().buffers.get(&buffer.0).map(|b| b.desc.clone())
    }

    pub fn accel_desc(&self, accel: AccelStructHandle) -> Option<AccelStructDesc> {
        self.state.lock().accels.get(&accel.0).map(|a| a.desc.clone())
    }

    pub fn built_structure(&self, accel: AccelStructHandle) -> Option<BuiltStructure> {
        self.state.lock().accels.get(&accel.0).and_then(|a| a.built.clone())
    }

    pub fn live_count(&self) -> usize {
        self.state.lock().arena.live_count()
    }

    pub fn live_count_of(&self, kind: ResourceKind) -> usize {
        self.state.lock().arena.live_count_of(kind)
    }

    pub fn live_resources(&self) -> Vec<(ResourceId, ResourceEntry)> {
        self.state
            .lock()
            .arena
            .live()
            .map(|(id, e)| (id, e.clone()))
            .collect()
    }

    /// Report (and return) every resource still alive.
    pub fn dump_live(&self) -> Vec<String> {
        self.state.lock().arena.dump_live()
    }

    fn sizes_for(&self, ty: AccelStructType, counts: &[u32]) -> BuildSizes {
        let prims: u64 = counts.iter().map(|&c| c as u64).sum();
        let geometries = counts.len() as u64;
        let align = self.properties.min_scratch_offset_alignment;
        match ty {
            AccelStructType::BottomLevel => BuildSizes {
                acceleration_structure_size: align_up(1024 + 64 * geometries + 128 * prims, ACCEL_STRUCT_ALIGNMENT),
                build_scratch_size: align_up(512 + 96 * prims, align),
                update_scratch_size: align_up(256 + 32 * prims, align),
            },
            AccelStructType::TopLevel => BuildSizes {
                acceleration_structure_size: align_up(1024 + 128 * prims, ACCEL_STRUCT_ALIGNMENT),
                build_scratch_size: align_up(512 + 64 * prims, align),
                update_scratch_size: align_up(256 + 32 * prims, align),
            },
        }
    }

    fn execute(&self, state: &mut State, commands: Vec<Command>) -> Result<()> {
        for command in commands {
            match command {
                Command::PipelineBarrier { buffers, .. } => {
                    for barrier in &buffers {
                        state.buffer(barrier.buffer)?;
                    }
                    state.stats.barriers += 1;
                }
                Command::CopyBuffer { src, dst, regions } => {
                    let src_size = state.buffer(src)?.desc.size;
                    let dst_size = state.buffer(dst)?.desc.size;
                    for region in &regions {
                        check_range(region.src_offset, region.size, src_size)?;
                        check_range(region.dst_offset, region.size, dst_size)?;
                        let (from, to) = (region.src_offset as usize, region.dst_offset as usize);
                        let len = region.size as usize;
                        let bytes = state.buffers[&src.0].data[from..from + len].to_vec();
                        if let Some(target) = state.buffers.get_mut(&dst.0) {
                            target.data[to..to + len].copy_from_slice(&bytes);
                        }
                        state.stats.bytes_copied += region.size;
                    }
                    state.stats.copies += 1;
                    state.stats.copy_regions += regions.len() as u64;
                }
                Command::BuildAccelerationStructure { info, ranges } => {
                    self.execute_build(state, &info, &ranges)?;
                }
            }
        }
        Ok(())
    }

    fn execute_build(&self, state: &mut State, info: &BuildGeometryInfo, ranges: &[BuildRange]) -> Result<()> {
        let dst = info.dst.ok_or_else(|| Error::build_failed("missing destination structure"))?;
        if ranges.len() != info.geometries.len() {
            return Err(Error::build_failed(format!(
                "{} build ranges for {} geometries",
                ranges.len(),
                info.geometries.len()
            )));
        }
        let counts: Vec<u32> = ranges.iter().map(|r| r.primitive_count).collect();
        let sizes = self.sizes_for(info.ty, &counts);

        let dst_state = state.accel(dst)?;
        if dst_state.desc.ty != info.ty {
            return Err(Error::build_failed("structure type does not match build type"));
        }
        if sizes.acceleration_structure_size > dst_state.desc.size {
            return Err(Error::build_failed(format!(
                "structure storage too small: need {}, have {}",
                sizes.acceleration_structure_size, dst_state.desc.size
            )));
        }

        // scratch
        let scratch_needed = match info.mode {
            BuildMode::Build => sizes.build_scratch_size,
            BuildMode::Update => sizes.update_scratch_size,
        };
        if info.scratch_address % self.properties.min_scratch_offset_alignment.max(1) != 0 {
            return Err(Error::build_failed(format!("misaligned scratch address {:#x}", info.scratch_address)));
        }
        let (scratch_id, scratch_offset) = state.resolve(info.scratch_address)?;
        let scratch_capacity = state.buffers[&scratch_id].desc.size - scratch_offset;
        if scratch_capacity < scratch_needed {
            return Err(Error::build_failed(format!(
                "scratch too small: need {scratch_needed}, have {scratch_capacity}"
            )));
        }

        // refit preconditions
        let mut history = (0u32, 0u32);
        if let Some(built) = &dst_state.built {
            history = (built.builds, built.updates);
        }
        if info.mode == BuildMode::Update {
            let src = info.src.ok_or_else(|| Error::build_failed("update without source structure"))?;
            let src_built = state
                .accel(src)?
                .built
                .as_ref()
                .ok_or_else(|| Error::build_failed("update source was never built"))?;
            if !src_built.flags.contains(BuildFlags::ALLOW_UPDATE) || !info.flags.contains(BuildFlags::ALLOW_UPDATE) {
                return Err(Error::build_failed("update requires ALLOW_UPDATE on both builds"));
            }
            if src_built.geometry_count != info.geometries.len() {
                return Err(Error::build_failed("update changes geometry count"));
            }
            history = (src_built.builds, src_built.updates);
        }

        // inputs
        let mut instances = Vec::new();
        for (geometry, range) in info.geometries.iter().zip(ranges) {
            match geometry {
                GeometryData::Triangles(tri) => {
                    if info.ty != AccelStructType::BottomLevel {
                        return Err(Error::build_failed("triangle geometry in a top-level build"));
                    }
                    state.resolve(tri.vertex_address)?;
                    let index_bytes = range.primitive_count as u64 * 3 * tri.index_type.size();
                    state.read_range(tri.index_address + range.primitive_offset as u64, index_bytes)?;
                }
                GeometryData::Instances(inst) => {
                    if info.ty != AccelStructType::TopLevel {
                        return Err(Error::build_failed("instance geometry in a bottom-level build"));
                    }
                    let bytes = state.read_range(
                        inst.data_address + range.primitive_offset as u64,
                        range.primitive_count as u64 * AccelStructInstance::SIZE,
                    )?;
                    instances = bytemuck::pod_collect_to_vec(bytes);
                }
            }
        }

        let (builds, updates) = match info.mode {
            BuildMode::Build => (history.0 + 1, history.1),
            BuildMode::Update => (history.0, history.1 + 1),
        };
        let built = BuiltStructure {
            ty: info.ty,
            flags: info.flags,
            last_mode: info.mode,
            geometry_count: info.geometries.len(),
            primitive_counts: counts,
            instances,
            builds,
            updates,
        };
        if let Some(target) = state.accels.get_mut(&dst.0) {
            target.built = Some(built);
        }
        match info.mode {
            BuildMode::Build => state.stats.builds += 1,
            BuildMode::Update => state.stats.updates += 1,
        }
        Ok(())
    }
}

impl Device for HeadlessDevice {
    fn properties(&self) -> DeviceProperties {
        self.properties
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferHandle> {
        if desc.size == 0 {
            return Err(Error::device(format!("zero-sized buffer \"{}\"", desc.name)));
        }
        let mut state = self.state.lock();
        if let Some(budget) = state.memory_budget {
            let available = budget.saturating_sub(state.allocated);
            if desc.size > available {
                return Err(Error::OutOfMemory { requested: desc.size, available });
            }
        }

        let address = align_up(state.next_address, desc.alignment.max(BUFFER_ALIGNMENT));
        state.next_address = address + align_up(desc.size, BUFFER_ALIGNMENT);
        state.allocated += desc.size;

        let kind = match desc.location {
            MemoryLocation::DeviceLocal => ResourceKind::DeviceBuffer,
            MemoryLocation::HostVisible => ResourceKind::StagingBuffer,
        };
        let id = state.arena.insert(kind, desc.name.clone(), desc.size);
        state.buffers.insert(
            id,
            BufferState {
                desc: desc.clone(),
                address,
                data: vec![0u8; desc.size as usize],
            },
        );
        state.stats.buffers_created += 1;
        tracing::trace!(id, name = %desc.name, size = desc.size, address, "buffer created");
        Ok(BufferHandle(id))
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        let mut state = self.state.lock();
        let Some(removed) = state.buffers.remove(&buffer.0) else {
            tracing::warn!(id = buffer.0, "destroy of unknown buffer");
            return;
        };
        if state.accels.values().any(|a| a.desc.buffer == buffer) {
            tracing::warn!(name = %removed.desc.name, "buffer destroyed while an acceleration structure still uses it");
        }
        state.arena.remove(buffer.0);
        state.allocated -= removed.desc.size;
        state.stats.buffers_destroyed += 1;
    }

    fn buffer_device_address(&self, buffer: BufferHandle) -> Result<DeviceAddress> {
        Ok(self.state.lock().buffer(buffer)?.address)
    }

    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let b = state.buffer(buffer)?;
        if b.desc.location != MemoryLocation::HostVisible {
            return Err(Error::NotHostVisible(b.desc.name.clone()));
        }
        check_range(offset, data.len() as u64, b.desc.size)?;
        if let Some(b) = state.buffers.get_mut(&buffer.0) {
            b.data[offset as usize..offset as usize + data.len()].copy_from_slice(data);
        }
        state.stats.host_writes += 1;
        Ok(())
    }

    fn set_buffer_name(&self, buffer: BufferHandle, name: &str) {
        let mut state = self.state.lock();
        if let Some(b) = state.buffers.get_mut(&buffer.0) {
            b.desc.name = name.to_string();
            state.arena.rename(buffer.0, name);
        }
    }

    fn create_acceleration_structure(&self, desc: &AccelStructDesc) -> Result<AccelStructHandle> {
        let mut state = self.state.lock();
        let buffer = state.buffer(desc.buffer)?;
        if !buffer.desc.usage.contains(BufferUsage::ACCEL_STRUCT_STORAGE) {
            return Err(Error::device(format!(
                "buffer \"{}\" lacks acceleration structure storage usage",
                buffer.desc.name
            )));
        }
        check_range(desc.offset, desc.size, buffer.desc.size)?;
        let address = buffer.address + desc.offset;

        let id = state.arena.insert(ResourceKind::AccelerationStructure, desc.name.clone(), desc.size);
        state.accels.insert(
            id,
            AccelState {
                desc: desc.clone(),
                address,
                built: None,
            },
        );
        state.stats.accels_created += 1;
        Ok(AccelStructHandle(id))
    }

    fn destroy_acceleration_structure(&self, accel: AccelStructHandle) {
        let mut state = self.state.lock();
        if state.accels.remove(&accel.0).is_none() {
            tracing::warn!(id = accel.0, "destroy of unknown acceleration structure");
            return;
        }
        state.arena.remove(accel.0);
        state.stats.accels_destroyed += 1;
    }

    fn acceleration_structure_address(&self, accel: AccelStructHandle) -> Result<DeviceAddress> {
        Ok(self.state.lock().accel(accel)?.address)
    }

    fn build_sizes(&self, info: &BuildGeometryInfo, max_primitive_counts: &[u32]) -> Result<BuildSizes> {
        if max_primitive_counts.len() != info.geometries.len() {
            return Err(Error::device(format!(
                "primitive count length should match geometry count (expected: {}, actual: {})",
                info.geometries.len(),
                max_primitive_counts.len()
            )));
        }
        if info.ty == AccelStructType::TopLevel && info.geometries.len() != 1 {
            return Err(Error::device("top-level builds take exactly one instance geometry"));
        }
        Ok(self.sizes_for(info.ty, max_primitive_counts))
    }

    fn submit_and_wait(&self, commands: CommandBuffer) -> Result<()> {
        let mut state = self.state.lock();
        state.stats.submissions += 1;
        state.stats.waits += 1;
        state.last_submission = Some(commands.clone());
        self.execute(&mut state, commands.into_commands())
    }

    fn submit(&self, commands: CommandBuffer) -> Result<()> {
        let mut state = self.state.lock();
        state.stats.submissions += 1;
        state.last_submission = Some(commands.clone());
        self.execute(&mut state, commands.into_commands())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{BufferCopy, InstanceGeometry, GeometryFlags};

    fn staging(device: &HeadlessDevice, size: u64) -> BufferHandle {
        device.create_buffer(&BufferDesc::staging("staging", size)).unwrap()
    }

    #[test]
    fn test_buffer_lifecycle() {
        let device = HeadlessDevice::new();
        let a = device
            .create_buffer(&BufferDesc::new("a", 100, BufferUsage::STORAGE))
            .unwrap();
        let b = staging(&device, 100);
        assert_ne!(
            device.buffer_device_address(a).unwrap(),
            device.buffer_device_address(b).unwrap()
        );
        assert_eq!(device.live_count(), 2);
        assert_eq!(device.allocated_bytes(), 200);

        device.destroy_buffer(a);
        device.destroy_buffer(a);
        assert_eq!(device.live_count(), 1);
        assert!(matches!(
            device.buffer_device_address(a),
            Err(Error::InvalidHandle { kind: "buffer", .. })
        ));
    }

    #[test]
    fn test_alignment_is_respected() {
        let device = HeadlessDevice::new();
        let _pad = staging(&device, 3);
        let aligned = device
            .create_buffer(&BufferDesc::new("scratch", 64, BufferUsage::STORAGE).with_alignment(4096))
            .unwrap();
        assert_eq!(device.buffer_device_address(aligned).unwrap() % 4096, 0);
    }

    #[test]
    fn test_host_write_requires_host_visible() {
        let device = HeadlessDevice::new();
        let local = device
            .create_buffer(&BufferDesc::new("local", 16, BufferUsage::TRANSFER_DST))
            .unwrap();
        assert!(matches!(
            device.write_buffer(local, 0, &[1, 2, 3]),
            Err(Error::NotHostVisible(_))
        ));

        let host = staging(&device, 16);
        device.write_buffer(host, 4, &[1, 2, 3]).unwrap();
        assert_eq!(device.read_buffer(host, 4, 3).unwrap(), vec![1, 2, 3]);
        assert!(matches!(
            device.write_buffer(host, 15, &[1, 2]),
            Err(Error::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_copy_executes_on_submit() {
        let device = HeadlessDevice::new();
        let src = staging(&device, 8);
        let dst = device
            .create_buffer(&BufferDesc::new("dst", 8, BufferUsage::TRANSFER_DST))
            .unwrap();
        device.write_buffer(src, 0, &[9, 8, 7, 6, 5, 4, 3, 2]).unwrap();

        let mut cmd = CommandBuffer::new("copy");
        cmd.copy_buffer(
            src,
            dst,
            vec![
                BufferCopy { src_offset: 0, dst_offset: 4, size: 2 },
                BufferCopy { src_offset: 6, dst_offset: 0, size: 2 },
            ],
        );
        device.submit(cmd).unwrap();

        assert_eq!(device.read_buffer(dst, 0, 8).unwrap(), vec![3, 2, 0, 0, 9, 8, 0, 0]);
        let stats = device.stats();
        assert_eq!(stats.copies, 1);
        assert_eq!(stats.copy_regions, 2);
        assert_eq!(stats.waits, 0);
    }

    #[test]
    fn test_memory_budget() {
        let device = HeadlessDevice::new().with_memory_budget(128);
        staging(&device, 100);
        let err = device.create_buffer(&BufferDesc::staging("big", 64)).unwrap_err();
        assert!(matches!(err, Error::OutOfMemory { requested: 64, available: 28 }));

        device.set_memory_budget(None);
        device.create_buffer(&BufferDesc::staging("big", 64)).unwrap();
        assert_eq!(device.allocated_bytes(), 164);
    }

    #[test]
    fn test_accel_requires_storage_usage() {
        let device = HeadlessDevice::new();
        let plain = device
            .create_buffer(&BufferDesc::new("plain", 4096, BufferUsage::STORAGE))
            .unwrap();
        let desc = AccelStructDesc {
            name: "tlas".into(),
            ty: AccelStructType::TopLevel,
            buffer: plain,
            offset: 0,
            size: 4096,
        };
        assert!(device.create_acceleration_structure(&desc).is_err());
    }

    #[test]
    fn test_update_requires_allow_update() {
        let device = HeadlessDevice::new();
        let instances = staging(&device, AccelStructInstance::SIZE);
        device
            .write_buffer(instances, 0, bytemuck::bytes_of(&AccelStructInstance::new(0)))
            .unwrap();
        let storage = device
            .create_buffer(&BufferDesc::new("storage", 4096, BufferUsage::ACCEL_STRUCT_STORAGE))
            .unwrap();
        let scratch = device
            .create_buffer(&BufferDesc::new("scratch", 4096, BufferUsage::STORAGE).with_alignment(128))
            .unwrap();
        let tlas = device
            .create_acceleration_structure(&AccelStructDesc {
                name: "tlas".into(),
                ty: AccelStructType::TopLevel,
                buffer: storage,
                offset: 0,
                size: 4096,
            })
            .unwrap();

        let mut info = BuildGeometryInfo::new(AccelStructType::TopLevel, BuildFlags::PREFER_FAST_TRACE, BuildMode::Build);
        info.dst = Some(tlas);
        info.scratch_address = device.buffer_device_address(scratch).unwrap();
        info.geometries.push(GeometryData::Instances(InstanceGeometry {
            data_address: device.buffer_device_address(instances).unwrap(),
            flags: GeometryFlags::OPAQUE,
        }));
        let ranges = vec![BuildRange { primitive_count: 1, ..Default::default() }];

        let mut cmd = CommandBuffer::new("build");
        cmd.build_acceleration_structure(info.clone(), ranges.clone());
        device.submit_and_wait(cmd).unwrap();
        assert_eq!(device.built_structure(tlas).unwrap().instances.len(), 1);

        info.mode = BuildMode::Update;
        info.src = Some(tlas);
        let mut cmd = CommandBuffer::new("refit");
        cmd.build_acceleration_structure(info, ranges);
        assert!(matches!(device.submit_and_wait(cmd), Err(Error::BuildFailed(_))));
    }
}
