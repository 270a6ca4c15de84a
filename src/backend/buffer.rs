// GPU buffers for vertex, index, uniform and staging data
//
// Memory comes from the shared gpu-allocator. A buffer owns its allocation
// and frees it on drop, after the buffer object itself is destroyed.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use super::allocator::AllocationKind;
use super::device::VulkanDevice;

#[derive(Default)]
pub struct Buffer {
    raw: vk::Buffer,
    allocation: Option<Allocation>,
    size: vk::DeviceSize,
    owner: Option<Arc<VulkanDevice>>,
}

impl Buffer {
    pub(crate) fn new(
        device: &Arc<VulkanDevice>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        kind: AllocationKind,
        name: &str,
    ) -> Result<Self> {
        if size == 0 {
            anyhow::bail!("Buffer '{}' must not be empty", name);
        }

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let raw = unsafe { device.device.create_buffer(&buffer_info, None) }
            .with_context(|| format!("Failed to create buffer '{}'", name))?;

        let requirements = unsafe { device.device.get_buffer_memory_requirements(raw) };

        let allocation = match device.allocator.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: kind.buffer_scheme(raw),
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_buffer(raw, None) };
                return Err(e);
            }
        };

        let bound = unsafe {
            device
                .device
                .bind_buffer_memory(raw, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            unsafe { device.device.destroy_buffer(raw, None) };
            device.allocator.free(allocation)?;
            return Err(e).with_context(|| format!("Failed to bind memory for buffer '{}'", name));
        }

        log::trace!("Created buffer '{}' ({} bytes, {:?})", name, size, location);

        Ok(Self {
            raw,
            allocation: Some(allocation),
            size,
            owner: Some(Arc::clone(device)),
        })
    }

    pub fn raw(&self) -> vk::Buffer {
        self.raw
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn is_null(&self) -> bool {
        self.owner.is_none()
    }

    pub fn is_dedicated(&self) -> bool {
        self.allocation.as_ref().is_some_and(|a| a.is_dedicated())
    }

    pub fn is_host_visible(&self) -> bool {
        self.allocation
            .as_ref()
            .is_some_and(|a| a.mapped_ptr().is_some())
    }

    /// Copy bytes into the start of the buffer.
    ///
    /// Fails if the buffer was not created host-visible or `data` does not fit.
    pub fn upload(&mut self, data: &[u8]) -> Result<()> {
        if data.len() as vk::DeviceSize > self.size {
            anyhow::bail!(
                "Upload of {} bytes exceeds buffer size {}",
                data.len(),
                self.size
            );
        }
        let mapped = self
            .allocation
            .as_mut()
            .and_then(|a| a.mapped_slice_mut())
            .context("Buffer memory is not host-visible")?;
        mapped[..data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn upload_slice<T: bytemuck::Pod>(&mut self, data: &[T]) -> Result<()> {
        self.upload(bytemuck::cast_slice(data))
    }

    /// Host view of the buffer contents (host-visible buffers only)
    pub fn read(&self) -> Result<&[u8]> {
        let mapped = self
            .allocation
            .as_ref()
            .and_then(|a| a.mapped_slice())
            .context("Buffer memory is not host-visible")?;
        Ok(&mapped[..self.size as usize])
    }

    /// Move the buffer out, leaving `self` null
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let Some(owner) = self.owner.take() else {
            return;
        };
        unsafe { owner.device.destroy_buffer(self.raw, None) };
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = owner.allocator.free(allocation) {
                log::error!("{:#}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_buffer_rejects_host_access() {
        let mut buffer = Buffer::default();
        assert!(buffer.is_null());
        assert!(!buffer.is_host_visible());
        assert!(buffer.upload(&[]).is_err());
        assert!(buffer.read().is_err());
    }

    #[test]
    fn upload_larger_than_buffer_is_rejected() {
        let mut buffer = Buffer::default();
        assert!(buffer.upload(&[1, 2, 3]).is_err());
    }
}
