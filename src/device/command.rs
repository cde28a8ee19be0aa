//! Host-side command recording.

use bitflags::bitflags;

use super::{BufferHandle, BuildGeometryInfo, BuildRange};

bitflags! {
    /// Pipeline stages used in barriers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PipelineStages: u32 {
        const HOST = 1 << 0;
        const TRANSFER = 1 << 1;
        const ACCEL_STRUCT_BUILD = 1 << 2;
        const COMPUTE_SHADER = 1 << 3;
        const RAY_TRACING_SHADER = 1 << 4;
        const ALL_COMMANDS = 1 << 5;
    }
}

bitflags! {
    /// Memory access types used in barriers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessFlags: u32 {
        const HOST_WRITE = 1 << 0;
        const TRANSFER_READ = 1 << 1;
        const TRANSFER_WRITE = 1 << 2;
        const ACCEL_STRUCT_READ = 1 << 3;
        const ACCEL_STRUCT_WRITE = 1 << 4;
        const SHADER_READ = 1 << 5;
        const MEMORY_READ = 1 << 6;
        const MEMORY_WRITE = 1 << 7;
    }
}

/// Size value meaning "to the end of the buffer".
pub const WHOLE_SIZE: u64 = u64::MAX;

/// Global memory dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBarrier {
    pub src_stages: PipelineStages,
    pub src_access: AccessFlags,
    pub dst_stages: PipelineStages,
    pub dst_access: AccessFlags,
}

impl MemoryBarrier {
    /// Transfer writes made visible to an acceleration structure build.
    pub fn transfer_to_build(dst_access: AccessFlags) -> Self {
        Self {
            src_stages: PipelineStages::TRANSFER,
            src_access: AccessFlags::TRANSFER_WRITE,
            dst_stages: PipelineStages::ACCEL_STRUCT_BUILD,
            dst_access,
        }
    }
}

/// Memory dependency restricted to one buffer range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBarrier {
    pub buffer: BufferHandle,
    pub src_stages: PipelineStages,
    pub src_access: AccessFlags,
    pub dst_stages: PipelineStages,
    pub dst_access: AccessFlags,
    pub offset: u64,
    pub size: u64,
}

/// One region of a buffer-to-buffer copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferCopy {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    PipelineBarrier {
        memory: Vec<MemoryBarrier>,
        buffers: Vec<BufferBarrier>,
    },
    CopyBuffer {
        src: BufferHandle,
        dst: BufferHandle,
        regions: Vec<BufferCopy>,
    },
    BuildAccelerationStructure {
        info: BuildGeometryInfo,
        ranges: Vec<BuildRange>,
    },
}

/// Ordered list of recorded commands.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandBuffer {
    label: String,
    commands: Vec<Command>,
}

impl CommandBuffer {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            commands: Vec::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pipeline_barrier(&mut self, memory: Vec<MemoryBarrier>, buffers: Vec<BufferBarrier>) {
        self.commands.push(Command::PipelineBarrier { memory, buffers });
    }

    pub fn memory_barrier(&mut self, barrier: MemoryBarrier) {
        self.pipeline_barrier(vec![barrier], Vec::new());
    }

    pub fn copy_buffer(&mut self, src: BufferHandle, dst: BufferHandle, regions: Vec<BufferCopy>) {
        self.commands.push(Command::CopyBuffer { src, dst, regions });
    }

    pub fn build_acceleration_structure(&mut self, info: BuildGeometryInfo, ranges: Vec<BuildRange>) {
        self.commands.push(Command::BuildAccelerationStructure { info, ranges });
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn into_commands(self) -> Vec<Command> {
        self.commands
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn barrier_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|c| matches!(c, Command::PipelineBarrier { .. }))
            .count()
    }

    pub fn copy_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|c| matches!(c, Command::CopyBuffer { .. }))
            .count()
    }

    pub fn build_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|c| matches!(c, Command::BuildAccelerationStructure { .. }))
            .count()
    }
}
