// Owned device objects
//
// `Owned<T>` pairs a raw Vulkan handle with the device that created it.
// Move-only: Rust moves already leave nothing behind, and `take()` gives the
// explicit "source becomes null" transfer. Dropping a null handle is a no-op.

use ash::vk;
use std::fmt;
use std::sync::Arc;

use super::device::VulkanDevice;

/// A raw Vulkan handle destroyed through `ash::Device`
pub trait DeviceObject: Copy + Default + PartialEq + fmt::Debug {
    /// # Safety
    /// The handle must have been created from `device` and must no longer be
    /// referenced by pending GPU work.
    unsafe fn destroy(self, device: &ash::Device);
}

macro_rules! device_object {
    ($($ty:ty => $destroy:ident),* $(,)?) => {
        $(
            impl DeviceObject for $ty {
                unsafe fn destroy(self, device: &ash::Device) {
                    device.$destroy(self, None);
                }
            }
        )*
    };
}

device_object! {
    vk::RenderPass => destroy_render_pass,
    vk::Framebuffer => destroy_framebuffer,
    vk::ImageView => destroy_image_view,
    vk::ShaderModule => destroy_shader_module,
    vk::PipelineLayout => destroy_pipeline_layout,
    vk::Pipeline => destroy_pipeline,
    vk::DescriptorSetLayout => destroy_descriptor_set_layout,
    vk::DescriptorPool => destroy_descriptor_pool,
    vk::Sampler => destroy_sampler,
    vk::Fence => destroy_fence,
    vk::Semaphore => destroy_semaphore,
    vk::CommandPool => destroy_command_pool,
}

pub struct Owned<T: DeviceObject> {
    raw: T,
    owner: Option<Arc<VulkanDevice>>,
}

pub type RenderPass = Owned<vk::RenderPass>;
pub type Framebuffer = Owned<vk::Framebuffer>;
pub type ImageView = Owned<vk::ImageView>;
pub type ShaderModule = Owned<vk::ShaderModule>;
pub type PipelineLayout = Owned<vk::PipelineLayout>;
pub type DescriptorSetLayout = Owned<vk::DescriptorSetLayout>;
pub type Sampler = Owned<vk::Sampler>;
pub type Fence = Owned<vk::Fence>;
pub type Semaphore = Owned<vk::Semaphore>;
pub type CommandPool = Owned<vk::CommandPool>;

impl<T: DeviceObject> Owned<T> {
    pub(crate) fn new(device: &Arc<VulkanDevice>, raw: T) -> Self {
        device.track_object();
        Self {
            raw,
            owner: Some(Arc::clone(device)),
        }
    }

    pub fn raw(&self) -> T {
        self.raw
    }

    pub fn is_null(&self) -> bool {
        self.owner.is_none() || self.raw == T::default()
    }

    /// Move the handle out, leaving `self` null
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }
}

impl<T: DeviceObject> Default for Owned<T> {
    fn default() -> Self {
        Self {
            raw: T::default(),
            owner: None,
        }
    }
}

impl<T: DeviceObject> fmt::Debug for Owned<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Owned").field(&self.raw).finish()
    }
}

impl<T: DeviceObject> Drop for Owned<T> {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.take() {
            if self.raw != T::default() {
                unsafe { self.raw.destroy(&owner.device) };
            }
            owner.untrack_object();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_handle_is_null_and_drop_is_a_no_op() {
        let pass = RenderPass::default();
        assert!(pass.is_null());
        assert_eq!(pass.raw(), vk::RenderPass::null());
        drop(pass);

        let mut pipeline: Owned<vk::Pipeline> = Owned::default();
        let moved = pipeline.take();
        assert!(pipeline.is_null());
        assert!(moved.is_null());
    }
}
