// Backend module - Vulkan abstraction layer
//
// Design: thin wrapper around ash with owning handles
// Every handle keeps the device alive; the device is destroyed last.

pub mod allocator;
pub mod buffer;
pub mod context;
pub mod device;
pub mod fatal;
pub mod frame;
pub mod handle;
pub mod image;
pub mod immediate;
pub mod mesh;
pub mod overlay;
pub mod physical;
pub mod pipeline;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod texture;

pub use context::GraphicsContext;
pub use device::VulkanDevice;
pub use frame::{FrameContext, FrameError, FrameScheduler, PresentChain, BUFFERING_DEPTH};
pub use immediate::ImmediateSubmitter;
pub use pipeline::{Pipeline, PipelineBuilder};
pub use swapchain::Swapchain;
