//! Double-buffered host to device uploads.
//!
//! One device local buffer plus one host visible staging slot per frame in
//! flight. Writes land in slot `frame % slots` immediately and are queued as
//! copy regions; `cmd_copy_to_device` replays the queue for that slot into
//! the device buffer.
//!
//! ```text
//! stage_section(frame, ..) ─▶ staging[frame % n] ─┐
//!                                                 ├─ cmd_copy_to_device(frame) ─▶ device buffer
//!          pending[frame % n]: [BufferCopy, ..] ──┘
//! ```
//!
//! Slot reuse is safe only once the GPU has retired the frame that last
//! read it; frame pacing is the caller's responsibility.

use smallvec::SmallVec;

use super::{DeviceResource, ManagedBuffer};
use crate::device::{
    AccessFlags, BufferBarrier, BufferCopy, BufferDesc, BufferUsage, CommandBuffer, Context,
    PipelineStages, WHOLE_SIZE,
};
use crate::util::Result;

#[derive(Debug, Default)]
pub struct DualBuffer {
    name: String,
    device: ManagedBuffer,
    staging: SmallVec<[ManagedBuffer; 3]>,
    pending: SmallVec<[Vec<BufferCopy>; 3]>,
}

impl DualBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the device buffer described by `desc` and `staging_count`
    /// staging slots of the same size. Any previous allocation is released.
    ///
    /// On failure nothing stays allocated and `exists()` is false.
    pub fn create(&mut self, ctx: &Context, desc: &BufferDesc, staging_count: u32) -> Result<()> {
        assert!(staging_count > 0, "DualBuffer needs at least one staging slot");
        self.destroy();
        self.name = desc.name.clone();
        if let Err(err) = self.allocate(ctx, desc, staging_count) {
            self.destroy();
            return Err(err);
        }
        Ok(())
    }

    fn allocate(&mut self, ctx: &Context, desc: &BufferDesc, staging_count: u32) -> Result<()> {
        let mut device_desc = desc.clone();
        device_desc.usage |= BufferUsage::TRANSFER_DST;
        self.device.create(ctx, device_desc)?;

        for i in 0..staging_count {
            let mut slot = ManagedBuffer::new();
            slot.create(ctx, BufferDesc::staging(staging_name(&self.name, i), desc.size))?;
            self.staging.push(slot);
            self.pending.push(Vec::new());
        }
        Ok(())
    }

    fn slot(&self, frame: u64) -> usize {
        (frame % self.staging.len() as u64) as usize
    }

    /// Write `data` at `dest_offset` into the staging slot of `frame` and
    /// queue the matching copy. Regions accumulate until replayed.
    pub fn stage_section(&mut self, frame: u64, data: &[u8], dest_offset: u64) -> Result<()> {
        assert!(self.exists(), "stage_section on unallocated DualBuffer \"{}\"", self.name);
        if data.is_empty() {
            return Ok(());
        }
        let slot = self.slot(frame);
        self.staging[slot].write_host(dest_offset, data)?;
        self.pending[slot].push(BufferCopy {
            src_offset: dest_offset,
            dst_offset: dest_offset,
            size: data.len() as u64,
        });
        Ok(())
    }

    pub fn stage_full_buffer(&mut self, frame: u64, data: &[u8]) -> Result<()> {
        self.stage_section(frame, data, 0)
    }

    /// Record the queued copies of `frame`'s slot, preceded by the barrier
    /// that orders them after host writes and prior device reads. Returns
    /// `false` (recording nothing) when the queue is empty.
    pub fn cmd_copy_to_device(&mut self, frame: u64, cmd: &mut CommandBuffer) -> Result<bool> {
        if !self.exists() {
            return Ok(false);
        }
        let slot = self.slot(frame);
        if self.pending[slot].is_empty() {
            return Ok(false);
        }
        let dst = self.device.require_handle()?;
        let src = self.staging[slot].require_handle()?;

        cmd.pipeline_barrier(
            Vec::new(),
            vec![
                BufferBarrier {
                    buffer: dst,
                    src_stages: PipelineStages::ALL_COMMANDS,
                    src_access: AccessFlags::MEMORY_READ | AccessFlags::MEMORY_WRITE,
                    dst_stages: PipelineStages::TRANSFER,
                    dst_access: AccessFlags::TRANSFER_WRITE,
                    offset: 0,
                    size: WHOLE_SIZE,
                },
                BufferBarrier {
                    buffer: src,
                    src_stages: PipelineStages::HOST | PipelineStages::TRANSFER,
                    src_access: AccessFlags::HOST_WRITE,
                    dst_stages: PipelineStages::TRANSFER,
                    dst_access: AccessFlags::TRANSFER_READ,
                    offset: 0,
                    size: WHOLE_SIZE,
                },
            ],
        );
        cmd.copy_buffer(src, dst, std::mem::take(&mut self.pending[slot]));
        Ok(true)
    }

    /// Barrier from the copy's transfer write to the next consumer.
    pub fn cmd_prepare_for_read(
        &self,
        cmd: &mut CommandBuffer,
        dst_stages: PipelineStages,
        dst_access: AccessFlags,
    ) -> Result<()> {
        cmd.pipeline_barrier(
            Vec::new(),
            vec![BufferBarrier {
                buffer: self.device.require_handle()?,
                src_stages: PipelineStages::TRANSFER,
                src_access: AccessFlags::TRANSFER_WRITE,
                dst_stages,
                dst_access,
                offset: 0,
                size: WHOLE_SIZE,
            }],
        );
        Ok(())
    }

    /// Regions queued for `frame`'s slot and not yet recorded.
    pub fn pending_copies(&self, frame: u64) -> &[BufferCopy] {
        if self.staging.is_empty() {
            return &[];
        }
        &self.pending[self.slot(frame)]
    }

    /// Rename the buffer. Staging slots follow as `Staging for "<name>" #i`.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
        self.device.set_name(self.name.clone());
        for (i, slot) in self.staging.iter_mut().enumerate() {
            slot.set_name(staging_name(&self.name, i as u32));
        }
    }

    pub fn device_buffer(&self) -> &ManagedBuffer {
        &self.device
    }

    pub fn staging_buffer(&self, slot: usize) -> Option<&ManagedBuffer> {
        self.staging.get(slot)
    }

    pub fn staging_count(&self) -> usize {
        self.staging.len()
    }

    pub fn size(&self) -> u64 {
        self.device.size()
    }

    pub fn exists(&self) -> bool {
        self.device.exists()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn destroy(&mut self) {
        self.device.destroy();
        self.staging.clear();
        self.pending.clear();
    }
}

fn staging_name(name: &str, index: u32) -> String {
    format!("Staging for \"{name}\" #{index}")
}

impl DeviceResource for DualBuffer {
    fn exists(&self) -> bool {
        DualBuffer::exists(self)
    }

    fn destroy(&mut self) {
        DualBuffer::destroy(self)
    }

    fn name(&self) -> &str {
        DualBuffer::name(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Command, HeadlessDevice};
    use std::sync::Arc;

    fn setup(slots: u32) -> (Arc<HeadlessDevice>, Context, DualBuffer) {
        let device = Arc::new(HeadlessDevice::new());
        let ctx: Context = device.clone();
        let mut buffer = DualBuffer::new();
        buffer
            .create(&ctx, &BufferDesc::new("instances", 64, BufferUsage::STORAGE), slots)
            .unwrap();
        (device, ctx, buffer)
    }

    #[test]
    fn test_staging_slots_are_named() {
        let (device, _ctx, buffer) = setup(2);
        assert_eq!(buffer.staging_count(), 2);
        assert_eq!(buffer.staging_buffer(1).unwrap().name(), "Staging for \"instances\" #1");
        assert_eq!(device.live_count(), 3);
    }

    #[test]
    fn test_set_name_propagates() {
        let (device, _ctx, mut buffer) = setup(2);
        buffer.set_name("tlas instances");
        assert_eq!(buffer.device_buffer().name(), "tlas instances");
        let handle = buffer.staging_buffer(0).unwrap().handle().unwrap();
        assert_eq!(device.buffer_desc(handle).unwrap().name, "Staging for \"tlas instances\" #0");
    }

    #[test]
    fn test_failed_create_releases_everything() {
        // room for the device buffer and one staging slot, not two
        let device = Arc::new(HeadlessDevice::new().with_memory_budget(150));
        let ctx: Context = device.clone();
        let mut buffer = DualBuffer::new();
        let desc = BufferDesc::new("instances", 64, BufferUsage::STORAGE);

        let err = buffer.create(&ctx, &desc, 2).unwrap_err();
        assert!(matches!(err, crate::util::Error::OutOfMemory { requested: 64, .. }));
        assert!(!buffer.exists());
        assert_eq!(buffer.staging_count(), 0);
        assert_eq!(device.live_count(), 0);
        assert_eq!(device.allocated_bytes(), 0);

        device.set_memory_budget(None);
        buffer.create(&ctx, &desc, 2).unwrap();
        buffer.stage_full_buffer(0, &[1; 64]).unwrap();
        assert_eq!(buffer.pending_copies(0).len(), 1);
    }

    #[test]
    fn test_copy_barriers_guard_both_buffers() {
        let (_device, _ctx, mut buffer) = setup(2);
        buffer.stage_section(1, &[7; 16], 16).unwrap();
        let mut cmd = CommandBuffer::new("frame");
        buffer.cmd_copy_to_device(1, &mut cmd).unwrap();

        let dst = buffer.device_buffer().handle().unwrap();
        let src = buffer.staging_buffer(1).unwrap().handle().unwrap();
        let Command::PipelineBarrier { memory, buffers } = &cmd.commands()[0] else {
            panic!("expected barrier first, got {:?}", cmd.commands()[0]);
        };
        assert!(memory.is_empty());
        assert_eq!(buffers.len(), 2);

        // earlier consumers of the device buffer finish before the transfer writes it
        let device_barrier = buffers.iter().find(|b| b.buffer == dst).expect("no device buffer barrier");
        assert_eq!(device_barrier.src_stages, PipelineStages::ALL_COMMANDS);
        assert_eq!(device_barrier.src_access, AccessFlags::MEMORY_READ | AccessFlags::MEMORY_WRITE);
        assert_eq!(device_barrier.dst_stages, PipelineStages::TRANSFER);
        assert_eq!(device_barrier.dst_access, AccessFlags::TRANSFER_WRITE);

        // host writes to the slot become visible to the transfer read
        let staging_barrier = buffers.iter().find(|b| b.buffer == src).expect("no staging barrier");
        assert!(staging_barrier.src_stages.contains(PipelineStages::HOST));
        assert_eq!(staging_barrier.src_access, AccessFlags::HOST_WRITE);
        assert_eq!(staging_barrier.dst_stages, PipelineStages::TRANSFER);
        assert_eq!(staging_barrier.dst_access, AccessFlags::TRANSFER_READ);

        match &cmd.commands()[1] {
            Command::CopyBuffer { src: from, dst: to, .. } => {
                assert_eq!(*from, src);
                assert_eq!(*to, dst);
            }
            other => panic!("expected copy, got {other:?}"),
        }
    }

    #[test]
    fn test_copy_with_empty_queue_records_nothing() {
        let (_device, _ctx, mut buffer) = setup(2);
        let mut cmd = CommandBuffer::new("frame");
        assert!(!buffer.cmd_copy_to_device(0, &mut cmd).unwrap());
        assert!(cmd.is_empty());
    }

    #[test]
    fn test_stage_and_copy() {
        let (device, ctx, mut buffer) = setup(2);
        buffer.stage_section(5, &[1, 2, 3, 4], 8).unwrap();
        buffer.stage_section(5, &[9, 9], 0).unwrap();
        // slot of frame 5 is 1; slot 0 is untouched
        assert_eq!(buffer.pending_copies(5).len(), 2);
        assert!(buffer.pending_copies(4).is_empty());

        let mut cmd = CommandBuffer::new("frame");
        assert!(buffer.cmd_copy_to_device(5, &mut cmd).unwrap());
        assert_eq!(cmd.barrier_count(), 1);
        assert_eq!(cmd.copy_count(), 1);
        match &cmd.commands()[1] {
            Command::CopyBuffer { regions, .. } => {
                assert_eq!(regions[0], BufferCopy { src_offset: 8, dst_offset: 8, size: 4 });
                assert_eq!(regions[1], BufferCopy { src_offset: 0, dst_offset: 0, size: 2 });
            }
            other => panic!("expected copy, got {other:?}"),
        }
        assert!(buffer.pending_copies(5).is_empty());

        ctx.submit(cmd).unwrap();
        let handle = buffer.device_buffer().handle().unwrap();
        assert_eq!(device.read_buffer(handle, 0, 12).unwrap(), vec![9, 9, 0, 0, 0, 0, 0, 0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_overlapping_stages_last_write_wins() {
        let (device, ctx, mut buffer) = setup(1);
        buffer.stage_section(0, &[1, 1, 1, 1], 0).unwrap();
        buffer.stage_section(0, &[2, 2], 2).unwrap();
        let mut cmd = CommandBuffer::new("frame");
        buffer.cmd_copy_to_device(0, &mut cmd).unwrap();
        ctx.submit(cmd).unwrap();

        let handle = buffer.device_buffer().handle().unwrap();
        assert_eq!(device.read_buffer(handle, 0, 4).unwrap(), vec![1, 1, 2, 2]);
    }

    #[test]
    fn test_prepare_for_read() {
        let (_device, _ctx, buffer) = setup(2);
        let mut cmd = CommandBuffer::new("frame");
        buffer
            .cmd_prepare_for_read(&mut cmd, PipelineStages::ACCEL_STRUCT_BUILD, AccessFlags::ACCEL_STRUCT_READ)
            .unwrap();
        match &cmd.commands()[0] {
            Command::PipelineBarrier { buffers, .. } => {
                assert_eq!(buffers[0].src_access, AccessFlags::TRANSFER_WRITE);
                assert_eq!(buffers[0].dst_stages, PipelineStages::ACCEL_STRUCT_BUILD);
            }
            other => panic!("expected barrier, got {other:?}"),
        }
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let (device, _ctx, mut buffer) = setup(3);
        buffer.destroy();
        buffer.destroy();
        assert!(!buffer.exists());
        assert_eq!(device.live_count(), 0);
        assert!(buffer.pending_copies(0).is_empty());
    }
}
