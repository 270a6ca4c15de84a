// GPU-backed checks against a headless context.
//
// Each test skips (with a note on stderr) when no Vulkan loader or device is
// available, so the suite stays green on machines without a GPU.

use anyhow::Result;
use ash::vk;
use gpu_allocator::MemoryLocation;
use paced_renderer::backend::allocator::AllocationKind;
use paced_renderer::backend::context::DescriptorBinding;
use paced_renderer::backend::handle::Owned;
use paced_renderer::backend::mesh::Mesh;
use paced_renderer::backend::shader::{load_spirv, ShaderCompiler, ShaderStage};
use paced_renderer::backend::surface::WindowSurface;
use paced_renderer::backend::texture::Texture;
use paced_renderer::backend::{
    FrameError, FrameScheduler, GraphicsContext, ImmediateSubmitter, PipelineBuilder,
    PresentChain, Swapchain,
};
use paced_renderer::config::Config;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::cell::{Cell, RefCell};
use std::ffi::CStr;

const EMPTY_VERT: &[u8] = include_bytes!("data/empty.vert.spv");
const EMPTY_FRAG: &[u8] = include_bytes!("data/empty.frag.spv");
const TIMEOUT_NS: u64 = 1_000_000_000;

fn headless() -> Option<GraphicsContext> {
    let mut config = Config::default();
    config.debug.validation_layers = false;
    config.graphics.descriptor_pool_size = 16;

    match GraphicsContext::headless(&config) {
        Ok(ctx) => Some(ctx),
        Err(e) => {
            eprintln!("skipping GPU test: {:#}", e);
            None
        }
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 + 7) as u8).collect()
}

#[test]
fn host_visible_upload_round_trips() -> Result<()> {
    let Some(ctx) = headless() else { return Ok(()) };

    for size in [1usize, 64, 1 << 20] {
        let data = pattern(size);
        let mut buffer = ctx.create_buffer(
            size as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
            "round trip",
        )?;
        buffer.upload(&data)?;
        assert_eq!(buffer.read()?, data.as_slice(), "size {}", size);
    }
    Ok(())
}

#[test]
fn upload_to_device_local_memory_is_rejected() -> Result<()> {
    let Some(ctx) = headless() else { return Ok(()) };

    let mut buffer = ctx.create_buffer(
        64,
        vk::BufferUsageFlags::TRANSFER_DST,
        MemoryLocation::GpuOnly,
        "device local",
    )?;
    // Some integrated GPUs map device-local memory; only check when unmapped
    if !buffer.is_host_visible() {
        assert!(buffer.upload(&[0; 64]).is_err());
    }

    let mut small = ctx.create_buffer(
        4,
        vk::BufferUsageFlags::TRANSFER_SRC,
        MemoryLocation::CpuToGpu,
        "small",
    )?;
    assert!(small.upload(&[0; 8]).is_err());
    Ok(())
}

#[test]
fn dropping_handles_releases_their_allocations() -> Result<()> {
    let Some(ctx) = headless() else { return Ok(()) };
    let baseline = ctx.live_allocations();

    {
        let _buffer = ctx.create_buffer(
            256,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            MemoryLocation::CpuToGpu,
            "uniforms",
        )?;
        let _image = ctx.create_image_2d(
            vk::Format::R8G8B8A8_UNORM,
            vk::Extent2D {
                width: 16,
                height: 16,
            },
            vk::ImageUsageFlags::SAMPLED,
            MemoryLocation::GpuOnly,
            "image",
        )?;
        assert_eq!(ctx.live_allocations(), baseline + 2);
    }

    assert_eq!(ctx.live_allocations(), baseline);
    Ok(())
}

#[test]
fn take_moves_ownership_and_nulls_the_source() -> Result<()> {
    let Some(ctx) = headless() else { return Ok(()) };
    let baseline = ctx.live_allocations();

    let mut a = ctx.create_buffer(
        64,
        vk::BufferUsageFlags::VERTEX_BUFFER,
        MemoryLocation::CpuToGpu,
        "a",
    )?;
    let raw = a.raw();
    let b = a.take();

    assert!(a.is_null());
    assert_eq!(b.raw(), raw);
    assert_eq!(ctx.live_allocations(), baseline + 1);

    drop(a);
    assert_eq!(ctx.live_allocations(), baseline + 1);
    drop(b);
    assert_eq!(ctx.live_allocations(), baseline);

    let mut fence = ctx.create_fence(true)?;
    let raw_fence = fence.raw();
    let moved = fence.take();
    assert!(fence.is_null());
    assert_eq!(moved.raw(), raw_fence);

    let null: Owned<vk::Fence> = Owned::default();
    drop(null);
    Ok(())
}

#[test]
fn immediate_submit_copies_through_device_local_buffer() -> Result<()> {
    let Some(ctx) = headless() else { return Ok(()) };
    let mut submitter = ImmediateSubmitter::new(&ctx)?;
    let data = pattern(256);

    let mut staging = ctx.create_buffer(
        256,
        vk::BufferUsageFlags::TRANSFER_SRC,
        MemoryLocation::CpuToGpu,
        "staging",
    )?;
    staging.upload(&data)?;

    let device_local = ctx.create_buffer(
        256,
        vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
        MemoryLocation::GpuOnly,
        "device local",
    )?;
    let readback = ctx.create_buffer(
        256,
        vk::BufferUsageFlags::TRANSFER_DST,
        MemoryLocation::GpuToCpu,
        "readback",
    )?;

    submitter.copy_buffer(&staging, &device_local, 256)?;
    submitter.copy_buffer(&device_local, &readback, 256)?;

    assert_eq!(readback.read()?, data.as_slice());

    // Submitter is reusable and returns the closure's value
    let answer = submitter.submit(|_, _| 42)?;
    assert_eq!(answer, 42);

    assert!(submitter.copy_buffer(&staging, &device_local, 512).is_err());
    Ok(())
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct Vertex {
    position: [f32; 2],
}

#[test]
fn mesh_and_texture_upload_through_staging() -> Result<()> {
    let Some(ctx) = headless() else { return Ok(()) };
    let mut submitter = ImmediateSubmitter::new(&ctx)?;

    let vertices = [
        Vertex { position: [0.0, 0.5] },
        Vertex { position: [-0.5, -0.5] },
        Vertex { position: [0.5, -0.5] },
    ];
    let mesh = Mesh::upload(&ctx, &mut submitter, &vertices)?;
    assert_eq!(mesh.vertex_count(), 3);
    assert_eq!(mesh.vertex_buffer().size(), 24);

    let pixels = pattern(2 * 2 * 4);
    let texture = Texture::from_rgba8(&ctx, &mut submitter, 2, 2, &pixels)?;
    assert_eq!(texture.extent().width, 2);
    assert!(Texture::from_rgba8(&ctx, &mut submitter, 2, 2, &pixels[..15]).is_err());

    let layout = ctx.create_descriptor_set_layout(&[DescriptorBinding {
        binding: 0,
        ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        stages: vk::ShaderStageFlags::FRAGMENT,
    }])?;
    let set = ctx.allocate_descriptor_set(&layout)?;
    texture.bind_to_descriptor_set(&ctx, set, 0);
    ctx.free_descriptor_set(set)?;
    Ok(())
}

#[test]
fn offscreen_render_pass_and_framebuffer() -> Result<()> {
    let Some(ctx) = headless() else { return Ok(()) };
    let extent = vk::Extent2D {
        width: 32,
        height: 32,
    };

    let target = ctx.create_image_2d(
        vk::Format::R8G8B8A8_UNORM,
        extent,
        vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
        MemoryLocation::GpuOnly,
        "offscreen color",
    )?;
    let depth = ctx.create_image_2d(
        vk::Format::D32_SFLOAT,
        extent,
        vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        MemoryLocation::GpuOnly,
        "offscreen depth",
    )?;
    let color_view = ctx.create_image_view_2d(&target)?;
    let depth_view = ctx.create_image_view_2d(&depth)?;

    let render_pass = ctx.create_render_pass(
        &[vk::Format::R8G8B8A8_UNORM],
        Some(vk::Format::D32_SFLOAT),
        false,
    )?;
    let framebuffer =
        ctx.create_framebuffer(&render_pass, &[color_view.raw(), depth_view.raw()], extent)?;
    assert!(!framebuffer.is_null());

    // Reverse creation order
    drop(framebuffer);
    drop(render_pass);
    drop((color_view, depth_view));
    drop((target, depth));
    ctx.wait_idle()
}

struct NoWindow;

impl WindowSurface for NoWindow {
    fn raw_handles(&self) -> Result<(RawDisplayHandle, RawWindowHandle)> {
        anyhow::bail!("no window")
    }

    fn framebuffer_size(&self) -> (u32, u32) {
        (0, 0)
    }
}

#[test]
fn swapchain_requires_a_surface() {
    let Some(ctx) = headless() else { return };
    assert!(ctx.is_headless());
    assert!(Swapchain::new(&ctx, &NoWindow).is_err());
}

/// A window whose handles cannot be obtained, but which needs no instance
/// extensions: device creation gets past the instance before failing.
struct UnreachableWindow;

impl WindowSurface for UnreachableWindow {
    fn raw_handles(&self) -> Result<(RawDisplayHandle, RawWindowHandle)> {
        anyhow::bail!("window already closed")
    }

    fn framebuffer_size(&self) -> (u32, u32) {
        (0, 0)
    }

    fn required_extensions(&self) -> Result<Vec<&'static CStr>> {
        Ok(Vec::new())
    }
}

#[test]
fn failed_surface_creation_releases_the_instance() -> Result<()> {
    let Some(ctx) = headless() else { return Ok(()) };
    drop(ctx);

    let mut config = Config::default();
    config.debug.validation_layers = false;
    for _ in 0..8 {
        assert!(GraphicsContext::new(&config, &UnreachableWindow).is_err());
    }

    // Still able to build a working context afterwards
    let ctx = GraphicsContext::headless(&config)?;
    ctx.wait_idle()
}

#[test]
fn dedicated_allocations_are_honoured() -> Result<()> {
    let Some(ctx) = headless() else { return Ok(()) };
    let baseline = ctx.live_allocations();
    let extent = vk::Extent2D {
        width: 64,
        height: 64,
    };

    let dedicated = ctx.create_image_2d_with_kind(
        vk::Format::R8G8B8A8_UNORM,
        extent,
        vk::ImageUsageFlags::SAMPLED,
        MemoryLocation::GpuOnly,
        AllocationKind::Dedicated,
        "dedicated image",
    )?;
    let shared = ctx.create_image_2d(
        vk::Format::R8G8B8A8_UNORM,
        extent,
        vk::ImageUsageFlags::SAMPLED,
        MemoryLocation::GpuOnly,
        "shared image",
    )?;
    assert!(dedicated.is_dedicated());
    assert!(!shared.is_dedicated());

    let buffer = ctx.create_buffer_with_kind(
        256,
        vk::BufferUsageFlags::UNIFORM_BUFFER,
        MemoryLocation::CpuToGpu,
        AllocationKind::Dedicated,
        "dedicated buffer",
    )?;
    assert!(buffer.is_dedicated());
    assert_eq!(ctx.live_allocations(), baseline + 3);

    drop((dedicated, shared, buffer));
    assert_eq!(ctx.live_allocations(), baseline);
    Ok(())
}

/// Compiler returning prebuilt SPIR-V, recording how many device objects
/// existed at each call and optionally failing one call.
struct PrebuiltCompiler<'a> {
    ctx: &'a GraphicsContext,
    fail_on_call: Option<usize>,
    objects_at_call: RefCell<Vec<usize>>,
}

impl<'a> PrebuiltCompiler<'a> {
    fn new(ctx: &'a GraphicsContext, fail_on_call: Option<usize>) -> Self {
        Self {
            ctx,
            fail_on_call,
            objects_at_call: RefCell::new(Vec::new()),
        }
    }

    fn calls(&self) -> usize {
        self.objects_at_call.borrow().len()
    }
}

impl ShaderCompiler for PrebuiltCompiler<'_> {
    fn compile(&self, stage: ShaderStage, _source: &str, _preamble: &str) -> Result<Vec<u32>> {
        let mut seen = self.objects_at_call.borrow_mut();
        seen.push(self.ctx.live_objects());
        if self.fail_on_call == Some(seen.len()) {
            anyhow::bail!("{:?} stage failed to compile", stage);
        }
        match stage {
            ShaderStage::Vertex => load_spirv(EMPTY_VERT),
            ShaderStage::Fragment => load_spirv(EMPTY_FRAG),
            other => anyhow::bail!("no prebuilt SPIR-V for {:?}", other),
        }
    }
}

fn offscreen_pass(ctx: &GraphicsContext) -> Result<Owned<vk::RenderPass>> {
    ctx.create_render_pass(
        &[vk::Format::R8G8B8A8_UNORM],
        Some(vk::Format::D32_SFLOAT),
        false,
    )
}

const EXTENT: vk::Extent2D = vk::Extent2D {
    width: 32,
    height: 32,
};

#[test]
fn pipeline_builds_layout_then_modules_then_pipeline() -> Result<()> {
    let Some(ctx) = headless() else { return Ok(()) };
    let render_pass = offscreen_pass(&ctx)?;
    let baseline = ctx.live_objects();

    let compiler = PrebuiltCompiler::new(&ctx, None);
    let pipeline = PipelineBuilder::new(&ctx, &compiler)
        .stage(ShaderStage::Vertex, "")
        .stage(ShaderStage::Fragment, "")
        .push_constant_size(64)
        .build(render_pass.raw(), EXTENT)?;

    // Layout exists before the first compile, one module more before the second
    assert_eq!(*compiler.objects_at_call.borrow(), vec![baseline + 1, baseline + 2]);
    assert_ne!(pipeline.raw(), vk::Pipeline::null());
    assert_ne!(pipeline.layout(), vk::PipelineLayout::null());
    // Layout, two modules, pipeline
    assert_eq!(ctx.live_objects(), baseline + 4);

    drop(pipeline);
    assert_eq!(ctx.live_objects(), baseline);
    Ok(())
}

#[test]
fn failed_stage_compile_fails_the_build_without_leaks() -> Result<()> {
    let Some(ctx) = headless() else { return Ok(()) };
    let render_pass = offscreen_pass(&ctx)?;
    let objects = ctx.live_objects();
    let allocations = ctx.live_allocations();

    let compiler = PrebuiltCompiler::new(&ctx, Some(2));
    let result = PipelineBuilder::new(&ctx, &compiler)
        .stage(ShaderStage::Vertex, "")
        .stage(ShaderStage::Fragment, "")
        .push_constant_size(16)
        .build(render_pass.raw(), EXTENT);

    let err = result.err().expect("build should fail");
    assert!(format!("{:#}", err).contains("Fragment"));
    assert_eq!(compiler.calls(), 2);
    assert_eq!(ctx.live_objects(), objects);
    assert_eq!(ctx.live_allocations(), allocations);
    Ok(())
}

#[test]
fn invalid_push_constant_size_fails_before_any_compile() -> Result<()> {
    let Some(ctx) = headless() else { return Ok(()) };
    let render_pass = offscreen_pass(&ctx)?;
    let objects = ctx.live_objects();

    for size in [0, 6] {
        let compiler = PrebuiltCompiler::new(&ctx, None);
        let result = PipelineBuilder::new(&ctx, &compiler)
            .stage(ShaderStage::Vertex, "")
            .push_constant_size(size)
            .build(render_pass.raw(), EXTENT);
        assert!(result.is_err(), "size {}", size);
        assert_eq!(compiler.calls(), 0);
    }
    assert_eq!(ctx.live_objects(), objects);
    Ok(())
}

/// Present chain without a surface. Acquire signals the semaphore through an
/// empty submit and present consumes the wait semaphores the same way, so
/// the scheduler runs its real fence and semaphore cycle headless.
struct OffscreenChain {
    device: ash::Device,
    queue: vk::Queue,
    image_count: u32,
    next: Cell<u32>,
    acquire_error: Cell<Option<vk::Result>>,
    presented: RefCell<Vec<u32>>,
}

impl OffscreenChain {
    fn new(ctx: &GraphicsContext, image_count: u32) -> Self {
        Self {
            device: ctx.raw().clone(),
            queue: ctx.device().graphics_queue,
            image_count,
            next: Cell::new(0),
            acquire_error: Cell::new(None),
            presented: RefCell::new(Vec::new()),
        }
    }

    fn failing(ctx: &GraphicsContext, error: vk::Result) -> Self {
        let chain = Self::new(ctx, 1);
        chain.acquire_error.set(Some(error));
        chain
    }
}

impl PresentChain for OffscreenChain {
    fn acquire_next_image(
        &self,
        _timeout_ns: u64,
        signal: vk::Semaphore,
    ) -> std::result::Result<(u32, bool), vk::Result> {
        if let Some(error) = self.acquire_error.get() {
            return Err(error);
        }

        let signal = [signal];
        let submit = vk::SubmitInfo::builder().signal_semaphores(&signal);
        unsafe {
            self.device
                .queue_submit(self.queue, &[submit.build()], vk::Fence::null())?
        };

        let index = self.next.get();
        self.next.set((index + 1) % self.image_count);
        Ok((index, false))
    }

    fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> std::result::Result<bool, vk::Result> {
        let stages = vec![vk::PipelineStageFlags::ALL_COMMANDS; wait_semaphores.len()];
        let submit = vk::SubmitInfo::builder()
            .wait_semaphores(wait_semaphores)
            .wait_dst_stage_mask(&stages);
        unsafe {
            self.device
                .queue_submit(queue, &[submit.build()], vk::Fence::null())?
        };

        self.presented.borrow_mut().push(image_index);
        Ok(false)
    }
}

#[test]
fn scheduler_stays_within_buffering_depth() -> Result<()> {
    let Some(ctx) = headless() else { return Ok(()) };
    let chain = OffscreenChain::new(&ctx, 3);
    let mut scheduler: FrameScheduler = FrameScheduler::new(&ctx, TIMEOUT_NS)?;
    let depth = scheduler.buffering_depth();

    for frame in 0..8u64 {
        let context = scheduler.begin_frame(&chain)?;
        assert_eq!(context.frame_number, frame);
        assert_eq!(context.slot_index, frame as usize % depth);
        assert!(scheduler.in_flight() <= depth - 1);

        scheduler.end_frame(&chain)?;
        assert!(scheduler.in_flight() <= depth);
    }

    assert_eq!(scheduler.frame_count(), 8);
    assert_eq!(*chain.presented.borrow(), vec![0, 1, 2, 0, 1, 2, 0, 1]);
    Ok(())
}

#[test]
fn deeper_scheduler_keeps_the_same_bound() -> Result<()> {
    let Some(ctx) = headless() else { return Ok(()) };
    let chain = OffscreenChain::new(&ctx, 2);
    let mut scheduler = FrameScheduler::<3>::new(&ctx, TIMEOUT_NS)?;

    for _ in 0..9 {
        scheduler.begin_frame(&chain)?;
        assert!(scheduler.in_flight() <= 2);
        scheduler.end_frame(&chain)?;
    }
    assert_eq!(scheduler.buffering_depth(), 3);
    Ok(())
}

#[test]
fn scheduler_rejects_out_of_order_calls() -> Result<()> {
    let Some(ctx) = headless() else { return Ok(()) };
    let chain = OffscreenChain::new(&ctx, 2);
    let mut scheduler: FrameScheduler = FrameScheduler::new(&ctx, TIMEOUT_NS)?;

    assert!(matches!(
        scheduler.end_frame(&chain),
        Err(FrameError::InvalidState(_))
    ));

    scheduler.begin_frame(&chain)?;
    assert!(matches!(
        scheduler.begin_frame(&chain),
        Err(FrameError::InvalidState(_))
    ));

    // The frame begun first can still be finished
    scheduler.end_frame(&chain)?;
    assert_eq!(scheduler.frame_count(), 1);
    assert_eq!(chain.presented.borrow().len(), 1);
    Ok(())
}

#[test]
fn acquire_failures_surface_as_typed_frame_errors() -> Result<()> {
    let Some(ctx) = headless() else { return Ok(()) };

    let cases = [
        (vk::Result::ERROR_OUT_OF_DATE_KHR, FrameError::OutOfDate),
        (vk::Result::TIMEOUT, FrameError::AcquireTimeout),
        (vk::Result::ERROR_DEVICE_LOST, FrameError::DeviceLost),
    ];
    for (result, expected) in cases {
        // A scheduler that returned an error is not driven again
        let mut scheduler: FrameScheduler = FrameScheduler::new(&ctx, TIMEOUT_NS)?;
        let chain = OffscreenChain::failing(&ctx, result);
        assert_eq!(scheduler.begin_frame(&chain).err(), Some(expected));
        assert_eq!(scheduler.frame_count(), 0);
    }
    Ok(())
}
