// Device-local vertex buffers uploaded through a staging buffer

use anyhow::Result;
use ash::vk;
use gpu_allocator::MemoryLocation;

use super::buffer::Buffer;
use super::context::GraphicsContext;
use super::immediate::ImmediateSubmitter;

pub struct Mesh {
    vertex_buffer: Buffer,
    vertex_count: u32,
}

impl Mesh {
    pub fn upload<V: bytemuck::Pod>(
        ctx: &GraphicsContext,
        submitter: &mut ImmediateSubmitter,
        vertices: &[V],
    ) -> Result<Self> {
        let bytes: &[u8] = bytemuck::cast_slice(vertices);
        let size = bytes.len() as vk::DeviceSize;

        let mut staging = ctx.create_buffer(
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
            "mesh staging",
        )?;
        staging.upload(bytes)?;

        let vertex_buffer = ctx.create_buffer(
            size,
            vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
            "mesh vertices",
        )?;
        submitter.copy_buffer(&staging, &vertex_buffer, size)?;

        log::debug!("Uploaded mesh with {} vertices", vertices.len());

        Ok(Self {
            vertex_buffer,
            vertex_count: vertices.len() as u32,
        })
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    pub fn vertex_buffer(&self) -> &Buffer {
        &self.vertex_buffer
    }

    pub fn bind_and_draw(&self, device: &ash::Device, cmd: vk::CommandBuffer) {
        unsafe {
            device.cmd_bind_vertex_buffers(cmd, 0, &[self.vertex_buffer.raw()], &[0]);
            device.cmd_draw(cmd, self.vertex_count, 1, 0, 0);
        }
    }
}
