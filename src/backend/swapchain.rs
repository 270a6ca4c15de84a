// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen, plus
// one depth image per presentable image (same count, same index).
// Built once at startup: the window is fixed-size, there is no recreation.

use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::vk;
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use super::context::GraphicsContext;
use super::device::VulkanDevice;
use super::frame::PresentChain;
use super::handle::ImageView;
use super::image::Image;
use super::surface::WindowSurface;

pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

pub struct Swapchain {
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub images: Vec<vk::Image>,
    color_views: Vec<ImageView>,
    depth_images: Vec<Image>,
    depth_views: Vec<ImageView>,
    swapchain: vk::SwapchainKHR,
    loader: khr::Swapchain,
    // Outlives the swapchain
    _device: Arc<VulkanDevice>,
}

impl Swapchain {
    pub fn new(ctx: &GraphicsContext, window: &dyn WindowSurface) -> Result<Self> {
        let device = Arc::clone(ctx.device());
        let surface = device
            .surface()
            .context("Cannot create a swapchain on a headless context")?;

        let caps = unsafe {
            surface
                .loader
                .get_physical_device_surface_capabilities(device.physical_device, surface.surface)
        }
        .context("Failed to query surface capabilities")?;

        let extent = choose_extent(&caps, window.framebuffer_size());
        let image_count = choose_image_count(&caps);
        let (sharing_mode, family_indices) =
            sharing_mode(device.graphics_queue_family, device.present_queue_family);

        log::info!(
            "Creating swapchain: {}x{}, {} images, {:?}",
            extent.width,
            extent.height,
            image_count,
            surface.present_mode
        );

        let loader = khr::Swapchain::new(&device.instance, &device.device);

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface.surface)
            .min_image_count(image_count)
            .image_format(surface.format.format)
            .image_color_space(surface.format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(&family_indices)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(surface.present_mode)
            .clipped(true);

        let swapchain = unsafe { loader.create_swapchain(&create_info, None) }
            .context("Failed to create swapchain")?;

        // From here on `Self` owns the swapchain, so early returns clean up
        let mut this = Self {
            format: surface.format.format,
            extent,
            images: Vec::new(),
            color_views: Vec::new(),
            depth_images: Vec::new(),
            depth_views: Vec::new(),
            swapchain,
            loader,
            _device: Arc::clone(&device),
        };

        this.images = unsafe { this.loader.get_swapchain_images(swapchain) }
            .context("Failed to get swapchain images")?;

        for (index, &image) in this.images.iter().enumerate() {
            this.color_views.push(ctx.create_image_view(
                image,
                this.format,
                vk::ImageAspectFlags::COLOR,
            )?);

            let depth = ctx.create_image_2d(
                DEPTH_FORMAT,
                extent,
                vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                MemoryLocation::GpuOnly,
                &format!("swapchain depth {}", index),
            )?;
            this.depth_views.push(ctx.create_image_view_2d(&depth)?);
            this.depth_images.push(depth);
        }

        log::info!("Created swapchain with {} images", this.images.len());

        Ok(this)
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn color_view(&self, index: usize) -> vk::ImageView {
        self.color_views[index].raw()
    }

    pub fn depth_view(&self, index: usize) -> vk::ImageView {
        self.depth_views[index].raw()
    }

    pub fn depth_format(&self) -> vk::Format {
        DEPTH_FORMAT
    }
}

impl PresentChain for Swapchain {
    /// Acquire next image for rendering, signaling `semaphore` when ready.
    /// Returns the image index and whether the swapchain is suboptimal.
    fn acquire_next_image(
        &self,
        timeout: u64,
        semaphore: vk::Semaphore,
    ) -> std::result::Result<(u32, bool), vk::Result> {
        unsafe {
            self.loader
                .acquire_next_image(self.swapchain, timeout, semaphore, vk::Fence::null())
        }
    }

    /// Present rendered image to screen. Returns whether the swapchain is
    /// suboptimal.
    fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> std::result::Result<bool, vk::Result> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        unsafe { self.loader.queue_present(queue, &present_info) }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        // Views before the images they look at; the presentable images belong
        // to the swapchain itself
        self.depth_views.clear();
        self.depth_images.clear();
        self.color_views.clear();
        self.images.clear();
        unsafe { self.loader.destroy_swapchain(self.swapchain, None) };
        log::debug!("Swapchain destroyed");
    }
}

/// Surface extent: the window's framebuffer size clamped into the surface
/// bounds when the surface leaves the choice to us, otherwise the surface's
/// own extent.
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, framebuffer: (u32, u32)) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX || caps.current_extent.height != u32::MAX {
        return caps.current_extent;
    }
    let (width, height) = framebuffer;
    vk::Extent2D {
        width: width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// One more than the minimum, capped by the maximum when one is reported
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let wanted = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        wanted.min(caps.max_image_count)
    } else {
        wanted
    }
}

/// Concurrent sharing across two families, exclusive otherwise
pub fn sharing_mode(graphics_family: u32, present_family: u32) -> (vk::SharingMode, Vec<u32>) {
    if graphics_family != present_family {
        (vk::SharingMode::CONCURRENT, vec![graphics_family, present_family])
    } else {
        (vk::SharingMode::EXCLUSIVE, Vec::new())
    }
}
