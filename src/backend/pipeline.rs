// Graphics pipeline creation and management
//
// The graphics pipeline defines how vertices are processed and rasterized.
// It includes: vertex input, shaders, rasterization, depth/stencil, blending.
//
// Creation order is layout -> shader modules -> pipeline; `Pipeline` drops
// in exactly the reverse order.

use anyhow::{Context, Result};
use ash::vk;
use std::ffi::CStr;

use super::context::GraphicsContext;
use super::handle::{Owned, PipelineLayout, ShaderModule};
use super::shader::{ShaderCompiler, ShaderStage};

const ENTRY_POINT: &CStr = c"main";

/// Vertex input bindings and attributes
#[derive(Debug, Clone, Default)]
pub struct VertexLayout {
    pub bindings: Vec<vk::VertexInputBindingDescription>,
    pub attributes: Vec<vk::VertexInputAttributeDescription>,
}

impl VertexLayout {
    /// One interleaved per-vertex binding at slot 0
    pub fn interleaved(stride: u32, attributes: &[(u32, vk::Format, u32)]) -> Self {
        Self {
            bindings: vec![vk::VertexInputBindingDescription {
                binding: 0,
                stride,
                input_rate: vk::VertexInputRate::VERTEX,
            }],
            attributes: attributes
                .iter()
                .map(|&(location, format, offset)| vk::VertexInputAttributeDescription {
                    location,
                    binding: 0,
                    format,
                    offset,
                })
                .collect(),
        }
    }
}

pub struct Pipeline {
    // Field order is drop order
    pipeline: Owned<vk::Pipeline>,
    _shader_modules: Vec<ShaderModule>,
    layout: PipelineLayout,
    push_constant_size: u32,
}

impl Pipeline {
    pub fn raw(&self) -> vk::Pipeline {
        self.pipeline.raw()
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout.raw()
    }

    pub fn bind(&self, device: &ash::Device, cmd: vk::CommandBuffer) {
        unsafe { device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.raw()) };
    }

    pub fn bind_descriptor_set(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        set_index: u32,
        set: vk::DescriptorSet,
    ) {
        unsafe {
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.layout(),
                set_index,
                &[set],
                &[],
            )
        };
    }

    /// Push `value` at offset 0, visible to all graphics stages
    pub fn push_constants<T: bytemuck::Pod>(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        value: &T,
    ) -> Result<()> {
        let bytes = bytemuck::bytes_of(value);
        if bytes.len() as u32 > self.push_constant_size {
            anyhow::bail!(
                "Push constant of {} bytes exceeds the declared range of {}",
                bytes.len(),
                self.push_constant_size
            );
        }
        unsafe {
            device.cmd_push_constants(
                cmd,
                self.layout(),
                vk::ShaderStageFlags::ALL_GRAPHICS,
                0,
                bytes,
            )
        };
        Ok(())
    }
}

pub struct PipelineBuilder<'a> {
    ctx: &'a GraphicsContext,
    compiler: &'a dyn ShaderCompiler,
    stages: Vec<(ShaderStage, String)>,
    preamble: String,
    set_layouts: Vec<vk::DescriptorSetLayout>,
    push_constant_size: u32,
    vertex_layout: VertexLayout,
    topology: vk::PrimitiveTopology,
    polygon_mode: vk::PolygonMode,
    cull_mode: vk::CullModeFlags,
    front_face: vk::FrontFace,
    depth_test: bool,
    depth_write: bool,
    depth_compare: vk::CompareOp,
    subpass: u32,
}

impl<'a> PipelineBuilder<'a> {
    pub fn new(ctx: &'a GraphicsContext, compiler: &'a dyn ShaderCompiler) -> Self {
        Self {
            ctx,
            compiler,
            stages: Vec::new(),
            preamble: String::new(),
            set_layouts: Vec::new(),
            push_constant_size: 0,
            vertex_layout: VertexLayout::default(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            depth_test: true,
            depth_write: true,
            depth_compare: vk::CompareOp::LESS,
            subpass: 0,
        }
    }

    pub fn stage(mut self, stage: ShaderStage, source: impl Into<String>) -> Self {
        self.stages.push((stage, source.into()));
        self
    }

    /// Text injected after the `#version` line of every stage
    pub fn preamble(mut self, preamble: impl Into<String>) -> Self {
        self.preamble = preamble.into();
        self
    }

    pub fn descriptor_set_layouts(mut self, layouts: &[vk::DescriptorSetLayout]) -> Self {
        self.set_layouts = layouts.to_vec();
        self
    }

    /// Bytes of the layout's single push-constant range. Required: non-zero
    /// and a multiple of 4
    pub fn push_constant_size(mut self, size: u32) -> Self {
        self.push_constant_size = size;
        self
    }

    pub fn vertex_layout(mut self, layout: VertexLayout) -> Self {
        self.vertex_layout = layout;
        self
    }

    pub fn topology(mut self, topology: vk::PrimitiveTopology) -> Self {
        self.topology = topology;
        self
    }

    pub fn polygon_mode(mut self, mode: vk::PolygonMode) -> Self {
        self.polygon_mode = mode;
        self
    }

    pub fn cull_mode(mut self, mode: vk::CullModeFlags) -> Self {
        self.cull_mode = mode;
        self
    }

    pub fn front_face(mut self, face: vk::FrontFace) -> Self {
        self.front_face = face;
        self
    }

    pub fn depth(mut self, test: bool, write: bool, compare: vk::CompareOp) -> Self {
        self.depth_test = test;
        self.depth_write = write;
        self.depth_compare = compare;
        self
    }

    pub fn subpass(mut self, subpass: u32) -> Self {
        self.subpass = subpass;
        self
    }

    pub fn build(self, render_pass: vk::RenderPass, extent: vk::Extent2D) -> Result<Pipeline> {
        if self.stages.is_empty() {
            anyhow::bail!("Pipeline needs at least one shader stage");
        }

        // 1. Layout
        let push_ranges = [push_constant_range(self.push_constant_size)?];
        let layout = self
            .ctx
            .create_pipeline_layout(&self.set_layouts, &push_ranges)?;

        // 2. Shader modules
        let mut shader_modules = Vec::with_capacity(self.stages.len());
        let mut stage_infos = Vec::with_capacity(self.stages.len());
        for (stage, source) in &self.stages {
            let code = self
                .compiler
                .compile(*stage, source, &self.preamble)
                .with_context(|| format!("Failed to build {:?} stage", stage))?;
            let module = self.ctx.create_shader_module(&code)?;
            stage_infos.push(
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(stage.to_vk())
                    .module(module.raw())
                    .name(ENTRY_POINT)
                    .build(),
            );
            shader_modules.push(module);
        }

        // 3. Fixed function state
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&self.vertex_layout.bindings)
            .vertex_attribute_descriptions(&self.vertex_layout.attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(self.topology)
            .primitive_restart_enable(false);

        let viewports = [flipped_viewport(extent)];
        let scissors = [vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        }];
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewports(&viewports)
            .scissors(&scissors);

        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(self.polygon_mode)
            .line_width(1.0)
            .cull_mode(self.cull_mode)
            .front_face(self.front_face)
            .depth_bias_enable(false);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(self.depth_test)
            .depth_write_enable(self.depth_write)
            .depth_compare_op(self.depth_compare)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        // Opaque, no blending
        let color_blend_attachments = [vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)
            .build()];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        // 4. Pipeline
        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stage_infos)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .layout(layout.raw())
            .render_pass(render_pass)
            .subpass(self.subpass);

        let pipeline = self.ctx.create_graphics_pipeline(&pipeline_info)?;

        log::info!(
            "Graphics pipeline created ({} stages, {} push constant bytes)",
            shader_modules.len(),
            self.push_constant_size
        );

        Ok(Pipeline {
            pipeline,
            _shader_modules: shader_modules,
            layout,
            push_constant_size: self.push_constant_size,
        })
    }
}

/// Full-extent viewport with Y pointing down: origin at the bottom edge and
/// negative height
pub fn flipped_viewport(extent: vk::Extent2D) -> vk::Viewport {
    vk::Viewport {
        x: 0.0,
        y: extent.height as f32,
        width: extent.width as f32,
        height: -(extent.height as f32),
        min_depth: 0.0,
        max_depth: 1.0,
    }
}

/// The layout's one range, at offset 0, visible to every graphics stage
pub fn push_constant_range(size: u32) -> Result<vk::PushConstantRange> {
    if size == 0 {
        anyhow::bail!("Pipeline layout needs a push constant range of at least 4 bytes");
    }
    if size % 4 != 0 {
        anyhow::bail!("Push constant size {} is not a multiple of 4", size);
    }
    Ok(vk::PushConstantRange {
        stage_flags: vk::ShaderStageFlags::ALL_GRAPHICS,
        offset: 0,
        size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn viewport_is_flipped_to_top_down() {
        let viewport = flipped_viewport(vk::Extent2D {
            width: 800,
            height: 600,
        });
        assert_eq!(viewport.y, 600.0);
        assert_eq!(viewport.height, -600.0);
        assert_eq!(viewport.width, 800.0);
        assert_eq!((viewport.min_depth, viewport.max_depth), (0.0, 1.0));
    }

    #[test]
    fn single_push_constant_range_spans_all_graphics_stages() {
        let range = push_constant_range(64).unwrap();
        assert_eq!(range.offset, 0);
        assert_eq!(range.size, 64);
        assert_eq!(range.stage_flags, vk::ShaderStageFlags::ALL_GRAPHICS);
    }

    #[test]
    fn push_constant_range_is_never_empty_or_misaligned() {
        assert!(push_constant_range(0).is_err());
        assert!(push_constant_range(6).is_err());
        assert!(push_constant_range(4).is_ok());
    }

    #[test]
    fn interleaved_layout_uses_binding_zero() {
        let layout = VertexLayout::interleaved(
            24,
            &[
                (0, vk::Format::R32G32B32_SFLOAT, 0),
                (1, vk::Format::R32G32B32_SFLOAT, 12),
            ],
        );
        assert_eq!(layout.bindings.len(), 1);
        assert_eq!(layout.bindings[0].stride, 24);
        assert!(layout.attributes.iter().all(|a| a.binding == 0));
        assert_eq!(layout.attributes[1].offset, 12);
    }
}
