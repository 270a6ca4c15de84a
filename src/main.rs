// =============================================================================
// PACED RENDERER - demo application
// =============================================================================
//
// Draws a spinning triangle through the paced-renderer core.
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  winit event loop (window, input)                               │
// │    └── GraphicsContext (device, queues, allocator, pool)        │
// │          └── Swapchain + render pass + framebuffers             │
// │                └── Pipeline, mesh (uploaded by immediate submit)│
// │                      └── FrameScheduler (fences, semaphores)    │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. Wait for the slot's fence, acquire swapchain image
// 2. Record render pass: clear, bind pipeline, push transform, draw
// 3. Submit, present, advance slot
//
// Every failure is fatal: it is logged and the process exits.
//
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use glam::Mat4;
use paced_renderer::backend::fatal::OrExit;
use paced_renderer::backend::handle::{Framebuffer, RenderPass};
use paced_renderer::backend::mesh::Mesh;
use paced_renderer::backend::overlay::{FpsOverlay, Overlay};
use paced_renderer::backend::pipeline::VertexLayout;
use paced_renderer::backend::shader::{GlslcCompiler, ShaderStage};
use paced_renderer::backend::{
    FrameScheduler, GraphicsContext, ImmediateSubmitter, Pipeline, PipelineBuilder, Swapchain,
};
use paced_renderer::config::Config;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    window::{Window, WindowAttributes},
};

const TRIANGLE_VERT: &str = include_str!("../shaders/triangle.vert");
const TRIANGLE_FRAG: &str = include_str!("../shaders/triangle.frag");

#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct Vertex {
    position: [f32; 3],
    color: [f32; 3],
}

const TRIANGLE: [Vertex; 3] = [
    Vertex {
        position: [0.0, 0.6, 0.0],
        color: [1.0, 0.0, 0.0],
    },
    Vertex {
        position: [-0.6, -0.5, 0.0],
        color: [0.0, 1.0, 0.0],
    },
    Vertex {
        position: [0.6, -0.5, 0.0],
        color: [0.0, 0.0, 1.0],
    },
];

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml
    let (config, source) = Config::load();

    init_logging(&config);
    log::info!("Starting paced renderer");
    source.report();
    log::debug!("Config: {:?}", config);
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        config.window.title
    );

    let event_loop = EventLoop::new().context("Failed to create event loop")?;
    // Render continuously instead of waiting for input
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = App::new(config);
    event_loop
        .run_app(&mut app)
        .context("Event loop terminated with an error")?;

    Ok(())
}

fn init_logging(config: &Config) {
    use env_logger::{Builder, Env, Target};

    let mut builder = Builder::from_env(Env::default().default_filter_or("info"));

    if config.debug.log_to_file {
        match std::fs::File::create(&config.debug.log_file) {
            Ok(mut file) => {
                let _ = writeln!(file, "=== Paced Renderer Log ===");
                let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
                let _ = writeln!(file);
                builder.target(Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!(
                "Cannot open log file {}: {}. Logging to stderr.",
                config.debug.log_file, e
            ),
        }
    }

    builder.init();
}

// =============================================================================
// RENDERER STATE
// =============================================================================

/// All GPU state of the demo.
///
/// IMPORTANT: Field order is drop order, the reverse of creation order.
/// The context goes last.
struct Renderer {
    overlay: Option<FpsOverlay>,
    scheduler: FrameScheduler,
    pipeline: Pipeline,
    mesh: Mesh,
    _submitter: ImmediateSubmitter,
    framebuffers: Vec<Framebuffer>,
    render_pass: RenderPass,
    swapchain: Swapchain,
    ctx: GraphicsContext,

    clear_color: [f32; 4],
    started: Instant,
}

impl Renderer {
    fn new(config: &Config, window: &Arc<Window>) -> Result<Self> {
        let ctx = GraphicsContext::new(config, window.as_ref())?;
        let swapchain = Swapchain::new(&ctx, window.as_ref())?;

        let render_pass = ctx.create_render_pass(
            &[swapchain.format],
            Some(swapchain.depth_format()),
            true,
        )?;

        // Color view i pairs with depth view i
        let framebuffers = (0..swapchain.image_count())
            .map(|i| {
                ctx.create_framebuffer(
                    &render_pass,
                    &[swapchain.color_view(i), swapchain.depth_view(i)],
                    swapchain.extent,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let mut submitter = ImmediateSubmitter::new(&ctx)?;
        let mesh = Mesh::upload(&ctx, &mut submitter, &TRIANGLE)?;

        let compiler = GlslcCompiler::default();
        let pipeline = PipelineBuilder::new(&ctx, &compiler)
            .stage(ShaderStage::Vertex, TRIANGLE_VERT)
            .stage(ShaderStage::Fragment, TRIANGLE_FRAG)
            .vertex_layout(VertexLayout::interleaved(
                std::mem::size_of::<Vertex>() as u32,
                &[
                    (0, vk::Format::R32G32B32_SFLOAT, 0),
                    (1, vk::Format::R32G32B32_SFLOAT, 12),
                ],
            ))
            .push_constant_size(std::mem::size_of::<Mat4>() as u32)
            .cull_mode(vk::CullModeFlags::NONE)
            .build(render_pass.raw(), swapchain.extent)?;

        let scheduler: FrameScheduler =
            FrameScheduler::new(&ctx, config.graphics.frame_timeout_ns())?;

        let overlay = if config.debug.show_fps {
            let title_window = Arc::clone(window);
            let mut overlay = FpsOverlay::new(
                config.window.title.clone(),
                Box::new(move |title: String| title_window.set_title(&title)),
            );
            overlay.init(render_pass.raw(), scheduler.buffering_depth())?;
            Some(overlay)
        } else {
            None
        };

        Ok(Self {
            overlay,
            scheduler,
            pipeline,
            mesh,
            _submitter: submitter,
            framebuffers,
            render_pass,
            swapchain,
            ctx,
            clear_color: config.graphics.clear_color,
            started: Instant::now(),
        })
    }

    // =========================================================================
    // FRAME
    // =========================================================================

    fn render_frame(&mut self) -> Result<()> {
        let frame = self.scheduler.begin_frame(&self.swapchain)?;
        let cmd = frame.command_buffer;
        let device = self.ctx.raw();

        if let Some(overlay) = self.overlay.as_mut() {
            overlay.new_frame();
        }

        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: self.clear_color,
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];

        let render_pass_begin = vk::RenderPassBeginInfo::builder()
            .render_pass(self.render_pass.raw())
            .framebuffer(self.framebuffers[frame.image_index as usize].raw())
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: self.swapchain.extent,
            })
            .clear_values(&clear_values);

        unsafe {
            device.cmd_begin_render_pass(cmd, &render_pass_begin, vk::SubpassContents::INLINE);
        }

        self.pipeline.bind(device, cmd);
        let transform = Mat4::from_rotation_z(self.started.elapsed().as_secs_f32());
        self.pipeline.push_constants(device, cmd, &transform)?;
        self.mesh.bind_and_draw(device, cmd);

        if let Some(overlay) = self.overlay.as_mut() {
            overlay.render(device, cmd);
        }

        unsafe { device.cmd_end_render_pass(cmd) };

        self.scheduler.end_frame(&self.swapchain)?;
        log::trace!("Frame {} on slot {}", frame.frame_number, frame.slot_index);
        Ok(())
    }

    /// Wait for the GPU, then drop everything in reverse creation order
    fn shutdown(mut self) {
        log::info!(
            "Cleaning up after {} frames...",
            self.scheduler.frame_count()
        );
        if let Err(e) = self.ctx.wait_idle() {
            log::error!("{:#}", e);
        }
        if let Some(overlay) = self.overlay.as_mut() {
            overlay.shutdown();
        }
        drop(self);
        log::info!("Cleanup complete");
    }
}

// =============================================================================
// APPLICATION
// =============================================================================

struct App {
    config: Config,
    // Declared before the window so GPU state is gone before the surface's
    // window
    renderer: Option<Renderer>,
    window: Option<Arc<Window>>,
}

impl App {
    fn new(config: Config) -> Self {
        Self {
            config,
            renderer: None,
            window: None,
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        // Fixed-size window: there is no swapchain recreation path
        let window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_resizable(false)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        let window = Arc::new(
            event_loop
                .create_window(window_attributes)
                .or_exit("Failed to create window"),
        );

        let renderer =
            Renderer::new(&self.config, &window).or_exit("Failed to initialize Vulkan");

        self.renderer = Some(renderer);
        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }

            WindowEvent::RedrawRequested => {
                if let Some(renderer) = self.renderer.as_mut() {
                    renderer.render_frame().or_exit("Frame failed");
                }
            }

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed()
                    && event.physical_key == PhysicalKey::Code(KeyCode::Escape)
                {
                    log::info!("ESC pressed, exiting...");
                    event_loop.exit();
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(renderer) = self.renderer.take() {
            renderer.shutdown();
        }
    }
}
