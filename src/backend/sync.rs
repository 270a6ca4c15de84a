// Synchronization primitives for one buffering slot
//
// Fences for GPU-CPU and semaphores for GPU-GPU sync. One slot per frame in
// flight; the fence starts signaled so the first wait on a fresh slot returns
// immediately.

use anyhow::Result;
use ash::vk;

use super::context::GraphicsContext;
use super::handle::{CommandPool, Fence, Semaphore};

pub struct FrameSlot {
    pub command_buffer: vk::CommandBuffer,
    /// Signaled by the acquire, waited on by the submit
    pub image_ready: Semaphore,
    /// Signaled by the submit, waited on by the present
    pub render_complete: Semaphore,
    /// Signaled when this slot's last submission finished on the GPU
    pub render_fence: Fence,
    // Frees `command_buffer` on drop
    command_pool: CommandPool,
}

impl FrameSlot {
    pub fn new(ctx: &GraphicsContext) -> Result<Self> {
        let command_pool = ctx.create_command_pool()?;
        let command_buffer = ctx.allocate_command_buffer(&command_pool)?;

        Ok(Self {
            command_buffer,
            image_ready: ctx.create_semaphore()?,
            render_complete: ctx.create_semaphore()?,
            render_fence: ctx.create_fence(true)?,
            command_pool,
        })
    }

    pub fn command_pool(&self) -> vk::CommandPool {
        self.command_pool.raw()
    }
}
