// Immediate submit
//
// Synchronous one-shot command execution for setup-time transfers. Uses its
// own pool, command buffer and fence, so it never touches the frame slots.
// Every call stalls the calling thread until the GPU is done: never use it
// for per-frame streaming.

use anyhow::{Context, Result};
use ash::vk;

use super::buffer::Buffer;
use super::context::GraphicsContext;
use super::handle::{CommandPool, Fence};

pub struct ImmediateSubmitter {
    command_buffer: vk::CommandBuffer,
    fence: Fence,
    // Frees `command_buffer` on drop
    _pool: CommandPool,
    device: ash::Device,
    queue: vk::Queue,
}

impl ImmediateSubmitter {
    pub fn new(ctx: &GraphicsContext) -> Result<Self> {
        let pool = ctx.create_command_pool()?;
        let command_buffer = ctx.allocate_command_buffer(&pool)?;

        Ok(Self {
            command_buffer,
            fence: ctx.create_fence(false)?,
            _pool: pool,
            device: ctx.raw().clone(),
            queue: ctx.device().graphics_queue,
        })
    }

    /// Record with `record`, submit, and block until the GPU finished.
    pub fn submit<R>(&mut self, record: impl FnOnce(&ash::Device, vk::CommandBuffer) -> R) -> Result<R> {
        let fence = [self.fence.raw()];
        let cmd = self.command_buffer;

        let result = unsafe {
            self.device
                .reset_fences(&fence)
                .context("Failed to reset immediate-submit fence")?;
            self.device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .context("Failed to reset immediate-submit command buffer")?;

            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.device
                .begin_command_buffer(cmd, &begin_info)
                .context("Failed to begin immediate-submit command buffer")?;

            let result = record(&self.device, cmd);

            self.device
                .end_command_buffer(cmd)
                .context("Failed to end immediate-submit command buffer")?;

            let command_buffers = [cmd];
            let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
            self.device
                .queue_submit(self.queue, &[submit_info.build()], self.fence.raw())
                .context("Failed to submit immediate commands")?;

            self.device
                .wait_for_fences(&fence, true, u64::MAX)
                .context("Failed to wait for immediate commands")?;

            result
        };

        Ok(result)
    }

    /// Copy `size` bytes from the start of `src` to the start of `dst`
    pub fn copy_buffer(&mut self, src: &Buffer, dst: &Buffer, size: vk::DeviceSize) -> Result<()> {
        if size > src.size() || size > dst.size() {
            anyhow::bail!(
                "Copy of {} bytes exceeds buffer sizes ({} -> {})",
                size,
                src.size(),
                dst.size()
            );
        }

        let (src, dst) = (src.raw(), dst.raw());
        self.submit(|device, cmd| unsafe {
            let region = vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size,
            };
            device.cmd_copy_buffer(cmd, src, dst, &[region]);
        })
    }
}
