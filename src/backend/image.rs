// Allocator-backed 2D images (depth buffers, textures, offscreen targets)

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use super::allocator::AllocationKind;
use super::device::VulkanDevice;

#[derive(Default)]
pub struct Image {
    raw: vk::Image,
    allocation: Option<Allocation>,
    format: vk::Format,
    extent: vk::Extent2D,
    owner: Option<Arc<VulkanDevice>>,
}

impl Image {
    pub(crate) fn new_2d(
        device: &Arc<VulkanDevice>,
        format: vk::Format,
        extent: vk::Extent2D,
        usage: vk::ImageUsageFlags,
        location: MemoryLocation,
        kind: AllocationKind,
        name: &str,
    ) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let raw = unsafe { device.device.create_image(&image_info, None) }
            .with_context(|| format!("Failed to create image '{}'", name))?;

        let requirements = unsafe { device.device.get_image_memory_requirements(raw) };

        let allocation = match device.allocator.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: false,
            allocation_scheme: kind.image_scheme(raw),
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_image(raw, None) };
                return Err(e);
            }
        };

        let bound = unsafe {
            device
                .device
                .bind_image_memory(raw, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            unsafe { device.device.destroy_image(raw, None) };
            device.allocator.free(allocation)?;
            return Err(e).with_context(|| format!("Failed to bind memory for image '{}'", name));
        }

        Ok(Self {
            raw,
            allocation: Some(allocation),
            format,
            extent,
            owner: Some(Arc::clone(device)),
        })
    }

    pub fn raw(&self) -> vk::Image {
        self.raw
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn is_null(&self) -> bool {
        self.owner.is_none()
    }

    /// Move the image out, leaving `self` null
    pub fn is_dedicated(&self) -> bool {
        self.allocation.as_ref().is_some_and(|a| a.is_dedicated())
    }

    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        let Some(owner) = self.owner.take() else {
            return;
        };
        unsafe { owner.device.destroy_image(self.raw, None) };
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = owner.allocator.free(allocation) {
                log::error!("{:#}", e);
            }
        }
    }
}

/// Aspect mask matching an image format
pub fn aspect_for(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aspect_follows_format() {
        assert_eq!(aspect_for(vk::Format::D32_SFLOAT), vk::ImageAspectFlags::DEPTH);
        assert_eq!(
            aspect_for(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(aspect_for(vk::Format::B8G8R8A8_UNORM), vk::ImageAspectFlags::COLOR);
    }

    #[test]
    fn taking_from_a_null_image_stays_null() {
        let mut image = Image::default();
        let moved = image.take();
        assert!(image.is_null());
        assert!(moved.is_null());
    }
}
