//! Named device buffer with a never-shrink reallocation policy.

use super::DeviceResource;
use crate::device::{
    BufferCopy, BufferDesc, BufferHandle, BufferUsage, CommandBuffer, Context, DeviceAddress,
    MemoryLocation,
};
use crate::util::{grown_capacity, Error, Result};

/// A device buffer that remembers its device, releasing itself on drop.
///
/// An unallocated `ManagedBuffer` reports size 0 and address 0.
pub struct ManagedBuffer {
    ctx: Option<Context>,
    handle: Option<BufferHandle>,
    desc: BufferDesc,
    address: DeviceAddress,
}

impl Default for ManagedBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ManagedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedBuffer")
            .field("name", &self.desc.name)
            .field("handle", &self.handle)
            .field("size", &self.size())
            .field("address", &format_args!("{:#x}", self.address))
            .finish()
    }
}

impl ManagedBuffer {
    pub fn new() -> Self {
        Self {
            ctx: None,
            handle: None,
            desc: BufferDesc::new("", 0, BufferUsage::empty()),
            address: 0,
        }
    }

    /// Allocate according to `desc`, releasing any previous allocation first.
    pub fn create(&mut self, ctx: &Context, desc: BufferDesc) -> Result<()> {
        self.destroy();
        let handle = ctx.create_buffer(&desc)?;
        let address = match ctx.buffer_device_address(handle) {
            Ok(address) => address,
            Err(err) => {
                ctx.destroy_buffer(handle);
                return Err(err);
            }
        };
        tracing::debug!(name = %desc.name, size = desc.size, "buffer allocated");
        self.ctx = Some(ctx.clone());
        self.handle = Some(handle);
        self.address = address;
        self.desc = desc;
        Ok(())
    }

    /// Allocated size in bytes, 0 when unallocated.
    pub fn size(&self) -> u64 {
        if self.handle.is_some() {
            self.desc.size
        } else {
            0
        }
    }

    pub fn handle(&self) -> Option<BufferHandle> {
        self.handle
    }

    pub fn device_address(&self) -> DeviceAddress {
        self.address
    }

    pub fn desc(&self) -> &BufferDesc {
        &self.desc
    }

    /// Handle of a buffer that must be allocated.
    pub(crate) fn require_handle(&self) -> Result<BufferHandle> {
        self.handle.ok_or(Error::InvalidHandle { kind: "buffer", id: 0 })
    }

    fn require_ctx(&self) -> Result<&Context> {
        self.ctx
            .as_ref()
            .ok_or_else(|| Error::other(format!("buffer \"{}\" is not allocated", self.desc.name)))
    }

    /// Write through the persistent mapping. Host visible buffers only.
    pub fn write_host(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.require_ctx()?.write_buffer(self.require_handle()?, offset, data)
    }

    /// Upload into a device local buffer through a temporary staging buffer,
    /// blocking until the copy has executed.
    pub fn write_device_local(&self, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let ctx = self.require_ctx()?;
        let dst = self.require_handle()?;
        if self.desc.location == MemoryLocation::HostVisible {
            return ctx.write_buffer(dst, offset, data);
        }

        let staging = ctx.create_buffer(&BufferDesc::staging(
            format!("Staging for \"{}\"", self.desc.name),
            data.len() as u64,
        ))?;
        let result = ctx.write_buffer(staging, 0, data).and_then(|_| {
            let mut cmd = CommandBuffer::new("upload");
            cmd.copy_buffer(
                staging,
                dst,
                vec![BufferCopy { src_offset: 0, dst_offset: offset, size: data.len() as u64 }],
            );
            ctx.submit_and_wait(cmd)
        });
        ctx.destroy_buffer(staging);
        result
    }

    /// Make sure at least `desc.size` bytes are allocated.
    ///
    /// Reallocates (contents are not preserved) to `desc.size` plus
    /// `headroom` only when the current allocation is too small. Returns
    /// whether a reallocation happened.
    pub fn ensure_capacity(&mut self, ctx: &Context, desc: &BufferDesc, headroom: f32) -> Result<bool> {
        match grown_capacity(self.size(), desc.size, headroom) {
            None => Ok(false),
            Some(capacity) => {
                tracing::debug!(
                    name = %desc.name,
                    from = self.size(),
                    to = capacity,
                    required = desc.size,
                    "growing buffer"
                );
                self.create(ctx, desc.clone().with_size(capacity))?;
                Ok(true)
            }
        }
    }

    pub fn exists(&self) -> bool {
        self.handle.is_some()
    }

    pub fn name(&self) -> &str {
        &self.desc.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.desc.name = name.into();
        if let (Some(ctx), Some(handle)) = (self.ctx.as_ref(), self.handle) {
            ctx.set_buffer_name(handle, &self.desc.name);
        }
    }

    pub fn destroy(&mut self) {
        if let (Some(ctx), Some(handle)) = (self.ctx.as_ref(), self.handle.take()) {
            ctx.destroy_buffer(handle);
        }
        self.address = 0;
    }
}

impl DeviceResource for ManagedBuffer {
    fn exists(&self) -> bool {
        ManagedBuffer::exists(self)
    }

    fn destroy(&mut self) {
        ManagedBuffer::destroy(self)
    }

    fn name(&self) -> &str {
        ManagedBuffer::name(self)
    }
}

impl Drop for ManagedBuffer {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HeadlessDevice;
    use std::sync::Arc;

    fn setup() -> (Arc<HeadlessDevice>, Context) {
        let device = Arc::new(HeadlessDevice::new());
        let ctx: Context = device.clone();
        (device, ctx)
    }

    #[test]
    fn test_unallocated() {
        let buffer = ManagedBuffer::new();
        assert!(!buffer.exists());
        assert_eq!(buffer.size(), 0);
        assert_eq!(buffer.device_address(), 0);
        assert!(buffer.write_host(0, &[1]).is_err());
    }

    #[test]
    fn test_ensure_capacity_never_shrinks() {
        let (device, ctx) = setup();
        let mut buffer = ManagedBuffer::new();
        let desc = BufferDesc::new("grow", 640, BufferUsage::STORAGE);

        assert!(buffer.ensure_capacity(&ctx, &desc, 0.25).unwrap());
        assert_eq!(buffer.size(), 800);
        assert!(!buffer.ensure_capacity(&ctx, &desc.clone().with_size(800), 0.25).unwrap());
        assert!(!buffer.ensure_capacity(&ctx, &desc.clone().with_size(10), 0.25).unwrap());
        assert_eq!(buffer.size(), 800);

        assert!(buffer.ensure_capacity(&ctx, &desc.with_size(801), 0.0).unwrap());
        assert_eq!(buffer.size(), 801);
        // the old allocation was released
        assert_eq!(device.live_count(), 1);
    }

    #[test]
    fn test_write_device_local_uses_transient_staging() {
        let (device, ctx) = setup();
        let mut buffer = ManagedBuffer::new();
        buffer
            .create(&ctx, BufferDesc::new("local", 16, BufferUsage::TRANSFER_DST))
            .unwrap();
        buffer.write_device_local(8, &[1, 2, 3, 4]).unwrap();

        let handle = buffer.handle().unwrap();
        assert_eq!(device.read_buffer(handle, 8, 4).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(device.live_count(), 1);
        assert_eq!(device.stats().waits, 1);
    }

    #[test]
    fn test_drop_releases() {
        let (device, ctx) = setup();
        {
            let mut buffer = ManagedBuffer::new();
            buffer.create(&ctx, BufferDesc::staging("tmp", 4)).unwrap();
            buffer.write_host(0, &[7; 4]).unwrap();
            assert_eq!(device.live_count(), 1);
        }
        assert_eq!(device.live_count(), 0);
    }
}
