// Graphics context - owner of the device and factory for every handle
//
// Wraps the shared `VulkanDevice` together with the descriptor pool. Every
// factory returns either a valid owning handle or an error naming the call
// that failed; the application decides whether that is fatal.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use super::allocator::AllocationKind;
use super::buffer::Buffer;
use super::device::VulkanDevice;
use super::handle::{
    CommandPool, DescriptorSetLayout, Fence, Framebuffer, ImageView, Owned, PipelineLayout,
    RenderPass, Sampler, Semaphore, ShaderModule,
};
use super::image::{aspect_for, Image};
use super::surface::WindowSurface;
use crate::config::Config;

const DESCRIPTOR_TYPES: [vk::DescriptorType; 11] = [
    vk::DescriptorType::SAMPLER,
    vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
    vk::DescriptorType::SAMPLED_IMAGE,
    vk::DescriptorType::STORAGE_IMAGE,
    vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
    vk::DescriptorType::STORAGE_TEXEL_BUFFER,
    vk::DescriptorType::UNIFORM_BUFFER,
    vk::DescriptorType::STORAGE_BUFFER,
    vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
    vk::DescriptorType::STORAGE_BUFFER_DYNAMIC,
    vk::DescriptorType::INPUT_ATTACHMENT,
];

/// One binding of a descriptor set layout, one descriptor each
#[derive(Debug, Clone, Copy)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub ty: vk::DescriptorType,
    pub stages: vk::ShaderStageFlags,
}

pub struct GraphicsContext {
    descriptor_pool: Owned<vk::DescriptorPool>,
    device: Arc<VulkanDevice>,
}

impl GraphicsContext {
    /// Context presenting to `window`
    pub fn new(config: &Config, window: &dyn WindowSurface) -> Result<Self> {
        Self::with_device(config, VulkanDevice::new(config, Some(window))?)
    }

    /// Context without a surface; only a graphics queue is required
    pub fn headless(config: &Config) -> Result<Self> {
        Self::with_device(config, VulkanDevice::new(config, None)?)
    }

    fn with_device(config: &Config, device: Arc<VulkanDevice>) -> Result<Self> {
        let budget = config.graphics.descriptor_pool_size;
        let pool_sizes = descriptor_pool_sizes(budget);
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(budget)
            .pool_sizes(&pool_sizes);

        let pool = unsafe { device.device.create_descriptor_pool(&pool_info, None) }
            .context("Failed to create descriptor pool")?;

        log::info!("Descriptor pool created ({} descriptors per type)", budget);

        Ok(Self {
            descriptor_pool: Owned::new(&device, pool),
            device,
        })
    }

    pub fn device(&self) -> &Arc<VulkanDevice> {
        &self.device
    }

    pub fn raw(&self) -> &ash::Device {
        &self.device.device
    }

    pub fn is_headless(&self) -> bool {
        self.device.surface().is_none()
    }

    pub fn wait_idle(&self) -> Result<()> {
        self.device.wait_idle()
    }

    /// Device objects currently held by `Owned` handles, the descriptor pool
    /// included
    pub fn live_objects(&self) -> usize {
        self.device.live_objects()
    }

    /// Allocations currently held through this context's allocator
    pub fn live_allocations(&self) -> usize {
        self.device.allocator.live_allocations()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Memory-backed resources
    // ─────────────────────────────────────────────────────────────────────

    pub fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<Buffer> {
        self.create_buffer_with_kind(size, usage, location, AllocationKind::Shared, name)
    }

    /// Same as `create_buffer` with an explicit allocation kind
    pub fn create_buffer_with_kind(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        kind: AllocationKind,
        name: &str,
    ) -> Result<Buffer> {
        Buffer::new(&self.device, size, usage, location, kind, name)
    }

    pub fn create_image_2d(
        &self,
        format: vk::Format,
        extent: vk::Extent2D,
        usage: vk::ImageUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<Image> {
        self.create_image_2d_with_kind(format, extent, usage, location, AllocationKind::Shared, name)
    }

    /// Same as `create_image_2d` with an explicit allocation kind
    pub fn create_image_2d_with_kind(
        &self,
        format: vk::Format,
        extent: vk::Extent2D,
        usage: vk::ImageUsageFlags,
        location: MemoryLocation,
        kind: AllocationKind,
        name: &str,
    ) -> Result<Image> {
        Image::new_2d(&self.device, format, extent, usage, location, kind, name)
    }

    pub fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    ) -> Result<ImageView> {
        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        let view = unsafe { self.raw().create_image_view(&view_info, None) }
            .context("Failed to create image view")?;
        Ok(Owned::new(&self.device, view))
    }

    /// View over a whole allocator-backed image, aspect derived from format
    pub fn create_image_view_2d(&self, image: &Image) -> Result<ImageView> {
        self.create_image_view(image.raw(), image.format(), aspect_for(image.format()))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Render passes and framebuffers
    // ─────────────────────────────────────────────────────────────────────

    pub fn create_render_pass(
        &self,
        color_formats: &[vk::Format],
        depth_format: Option<vk::Format>,
        for_present: bool,
    ) -> Result<RenderPass> {
        let attachments = render_pass_attachments(color_formats, depth_format, for_present);

        let color_refs: Vec<_> = (0..color_formats.len() as u32)
            .map(|attachment| vk::AttachmentReference {
                attachment,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            })
            .collect();
        let depth_ref = vk::AttachmentReference {
            attachment: color_formats.len() as u32,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };

        let mut subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if depth_format.is_some() {
            subpass = subpass.depth_stencil_attachment(&depth_ref);
        }
        let subpasses = [subpass.build()];

        let stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
        let dependencies = [vk::SubpassDependency::builder()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(stages)
            .dst_stage_mask(stages)
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            )
            .build()];

        let render_pass_info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        let render_pass = unsafe { self.raw().create_render_pass(&render_pass_info, None) }
            .context("Failed to create render pass")?;
        Ok(Owned::new(&self.device, render_pass))
    }

    pub fn create_framebuffer(
        &self,
        render_pass: &RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> Result<Framebuffer> {
        let framebuffer_info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass.raw())
            .attachments(attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        let framebuffer = unsafe { self.raw().create_framebuffer(&framebuffer_info, None) }
            .context("Failed to create framebuffer")?;
        Ok(Owned::new(&self.device, framebuffer))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Pipeline objects
    // ─────────────────────────────────────────────────────────────────────

    pub fn create_shader_module(&self, code: &[u32]) -> Result<ShaderModule> {
        let module_info = vk::ShaderModuleCreateInfo::builder().code(code);
        let module = unsafe { self.raw().create_shader_module(&module_info, None) }
            .context("Failed to create shader module")?;
        Ok(Owned::new(&self.device, module))
    }

    pub fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<PipelineLayout> {
        let layout_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(set_layouts)
            .push_constant_ranges(push_constant_ranges);
        let layout = unsafe { self.raw().create_pipeline_layout(&layout_info, None) }
            .context("Failed to create pipeline layout")?;
        Ok(Owned::new(&self.device, layout))
    }

    pub fn create_graphics_pipeline(
        &self,
        create_info: &vk::GraphicsPipelineCreateInfo,
    ) -> Result<Owned<vk::Pipeline>> {
        let pipelines = unsafe {
            self.raw().create_graphics_pipelines(
                vk::PipelineCache::null(),
                std::slice::from_ref(create_info),
                None,
            )
        }
        .map_err(|(_, e)| e)
        .context("Failed to create graphics pipeline")?;

        let pipeline = pipelines
            .into_iter()
            .next()
            .context("Driver returned no pipeline")?;
        Ok(Owned::new(&self.device, pipeline))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Descriptors
    // ─────────────────────────────────────────────────────────────────────

    pub fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorBinding],
    ) -> Result<DescriptorSetLayout> {
        let bindings: Vec<_> = bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(b.binding)
                    .descriptor_type(b.ty)
                    .descriptor_count(1)
                    .stage_flags(b.stages)
                    .build()
            })
            .collect();

        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        let layout = unsafe { self.raw().create_descriptor_set_layout(&layout_info, None) }
            .context("Failed to create descriptor set layout")?;
        Ok(Owned::new(&self.device, layout))
    }

    pub fn allocate_descriptor_set(&self, layout: &DescriptorSetLayout) -> Result<vk::DescriptorSet> {
        let layouts = [layout.raw()];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.descriptor_pool.raw())
            .set_layouts(&layouts);

        let sets = unsafe { self.raw().allocate_descriptor_sets(&alloc_info) }
            .context("Failed to allocate descriptor set")?;
        sets.into_iter().next().context("Driver returned no descriptor set")
    }

    pub fn free_descriptor_set(&self, set: vk::DescriptorSet) -> Result<()> {
        unsafe {
            self.raw()
                .free_descriptor_sets(self.descriptor_pool.raw(), &[set])
        }
        .context("Failed to free descriptor set")
    }

    pub fn write_descriptor_set(&self, writes: &[vk::WriteDescriptorSet]) {
        unsafe { self.raw().update_descriptor_sets(writes, &[]) };
    }

    // ─────────────────────────────────────────────────────────────────────
    // Samplers and synchronization
    // ─────────────────────────────────────────────────────────────────────

    pub fn create_sampler(
        &self,
        filter: vk::Filter,
        address_mode: vk::SamplerAddressMode,
    ) -> Result<Sampler> {
        let sampler_info = vk::SamplerCreateInfo::builder()
            .mag_filter(filter)
            .min_filter(filter)
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .address_mode_u(address_mode)
            .address_mode_v(address_mode)
            .address_mode_w(address_mode)
            .max_lod(vk::LOD_CLAMP_NONE);
        let sampler = unsafe { self.raw().create_sampler(&sampler_info, None) }
            .context("Failed to create sampler")?;
        Ok(Owned::new(&self.device, sampler))
    }

    pub fn create_fence(&self, signaled: bool) -> Result<Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let fence_info = vk::FenceCreateInfo::builder().flags(flags);
        let fence = unsafe { self.raw().create_fence(&fence_info, None) }
            .context("Failed to create fence")?;
        Ok(Owned::new(&self.device, fence))
    }

    pub fn create_semaphore(&self) -> Result<Semaphore> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let semaphore = unsafe { self.raw().create_semaphore(&semaphore_info, None) }
            .context("Failed to create semaphore")?;
        Ok(Owned::new(&self.device, semaphore))
    }

    /// Command pool on the graphics queue family whose buffers can be reset
    /// individually
    pub fn create_command_pool(&self) -> Result<CommandPool> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(self.device.graphics_queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let pool = unsafe { self.raw().create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;
        Ok(Owned::new(&self.device, pool))
    }

    /// Primary command buffer, freed together with its pool
    pub fn allocate_command_buffer(&self, pool: &CommandPool) -> Result<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool.raw())
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.raw().allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate command buffer")?;
        buffers.into_iter().next().context("Driver returned no command buffer")
    }
}

impl Drop for GraphicsContext {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            log::error!("{:#}", e);
        }
    }
}

/// Same budget for every descriptor type
pub fn descriptor_pool_sizes(budget: u32) -> Vec<vk::DescriptorPoolSize> {
    DESCRIPTOR_TYPES
        .iter()
        .map(|&ty| vk::DescriptorPoolSize {
            ty,
            descriptor_count: budget,
        })
        .collect()
}

/// Color attachments first, then the optional depth attachment. All cleared
/// on load and stored.
pub fn render_pass_attachments(
    color_formats: &[vk::Format],
    depth_format: Option<vk::Format>,
    for_present: bool,
) -> Vec<vk::AttachmentDescription> {
    let color_final = if for_present {
        vk::ImageLayout::PRESENT_SRC_KHR
    } else {
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
    };

    let colors = color_formats.iter().map(|&format| vk::AttachmentDescription {
        format,
        samples: vk::SampleCountFlags::TYPE_1,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::STORE,
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        final_layout: color_final,
        ..Default::default()
    });

    let depth = depth_format.map(|format| vk::AttachmentDescription {
        format,
        samples: vk::SampleCountFlags::TYPE_1,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::STORE,
        stencil_load_op: vk::AttachmentLoadOp::CLEAR,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        ..Default::default()
    });

    colors.chain(depth).collect()
}
