// Sampled RGBA8 textures uploaded through a staging buffer
//
// Decoding image files is the caller's job; this takes raw RGBA8 pixels.

use anyhow::Result;
use ash::vk;
use gpu_allocator::MemoryLocation;

use super::context::GraphicsContext;
use super::handle::{ImageView, Sampler};
use super::image::Image;
use super::immediate::ImmediateSubmitter;

pub const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

pub struct Texture {
    // Field order is drop order: sampler and view before the image
    sampler: Sampler,
    view: ImageView,
    image: Image,
}

impl Texture {
    pub fn from_rgba8(
        ctx: &GraphicsContext,
        submitter: &mut ImmediateSubmitter,
        width: u32,
        height: u32,
        pixels: &[u8],
    ) -> Result<Self> {
        let expected = rgba8_size(width, height);
        if pixels.len() as u64 != expected || expected == 0 {
            anyhow::bail!(
                "Texture {}x{} needs {} bytes of RGBA8, got {}",
                width,
                height,
                expected,
                pixels.len()
            );
        }

        let mut staging = ctx.create_buffer(
            expected,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
            "texture staging",
        )?;
        staging.upload(pixels)?;

        let extent = vk::Extent2D { width, height };
        let image = ctx.create_image_2d(
            TEXTURE_FORMAT,
            extent,
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
            "texture",
        )?;

        let (src, dst) = (staging.raw(), image.raw());
        submitter.submit(|device, cmd| unsafe {
            transition(
                device,
                cmd,
                dst,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            );

            let region = vk::BufferImageCopy {
                buffer_offset: 0,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                image_offset: vk::Offset3D::default(),
                image_extent: vk::Extent3D {
                    width,
                    height,
                    depth: 1,
                },
            };
            device.cmd_copy_buffer_to_image(
                cmd,
                src,
                dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );

            transition(
                device,
                cmd,
                dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            );
        })?;

        let view = ctx.create_image_view_2d(&image)?;
        let sampler = ctx.create_sampler(vk::Filter::NEAREST, vk::SamplerAddressMode::REPEAT)?;

        log::debug!("Uploaded {}x{} texture", width, height);

        Ok(Self {
            sampler,
            view,
            image,
        })
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.image.extent()
    }

    pub fn view(&self) -> vk::ImageView {
        self.view.raw()
    }

    pub fn sampler(&self) -> vk::Sampler {
        self.sampler.raw()
    }

    /// Write this texture as a combined image sampler at `binding` of `set`
    pub fn bind_to_descriptor_set(&self, ctx: &GraphicsContext, set: vk::DescriptorSet, binding: u32) {
        let image_info = [vk::DescriptorImageInfo {
            sampler: self.sampler(),
            image_view: self.view(),
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(set)
            .dst_binding(binding)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(&image_info)
            .build();
        ctx.write_descriptor_set(&[write]);
    }
}

pub fn rgba8_size(width: u32, height: u32) -> u64 {
    width as u64 * height as u64 * 4
}

/// Layout transition for a single-mip color image
unsafe fn transition(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) {
    let (src_access, dst_access, src_stage, dst_stage) = barrier_masks(old_layout, new_layout);

    let barrier = vk::ImageMemoryBarrier::builder()
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        })
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .build();

    device.cmd_pipeline_barrier(
        cmd,
        src_stage,
        dst_stage,
        vk::DependencyFlags::empty(),
        &[],
        &[],
        &[barrier],
    );
}

fn barrier_masks(
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) -> (
    vk::AccessFlags,
    vk::AccessFlags,
    vk::PipelineStageFlags,
    vk::PipelineStageFlags,
) {
    match (old_layout, new_layout) {
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL) => (
            vk::AccessFlags::empty(),
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
        ),
        (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL) => (
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
        ),
        _ => (
            vk::AccessFlags::MEMORY_WRITE,
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::PipelineStageFlags::ALL_COMMANDS,
        ),
    }
}
