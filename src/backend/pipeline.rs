// Graphics pipeline construction
//
// Fixed-function state is collected in an immutable [`PipelineDesc`] value
// built by pure `with_*` transformations, then assembled into one pipeline
// targeting dynamic rendering. Viewport and scissor are dynamic states set
// per draw; only their counts are baked in.

use ash::vk;

/// Fixed-function description of one graphics pipeline.
///
/// `PipelineDesc::default()` is the engine baseline: opaque filled
/// triangles, no culling, no depth test, single-sampled. Start a fresh
/// value for every pipeline instead of mutating a shared one.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PipelineDesc {
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub samples: vk::SampleCountFlags,
    pub blend_enabled: bool,
    pub depth_test_enabled: bool,
    pub color_format: vk::Format,
    pub depth_format: vk::Format,
}

impl Default for PipelineDesc {
    fn default() -> Self {
        Self {
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::NONE,
            front_face: vk::FrontFace::CLOCKWISE,
            samples: vk::SampleCountFlags::TYPE_1,
            blend_enabled: false,
            depth_test_enabled: false,
            color_format: vk::Format::UNDEFINED,
            depth_format: vk::Format::UNDEFINED,
        }
    }
}

impl PipelineDesc {
    pub fn with_topology(self, topology: vk::PrimitiveTopology) -> Self {
        Self { topology, ..self }
    }

    pub fn with_polygon_mode(self, polygon_mode: vk::PolygonMode) -> Self {
        Self {
            polygon_mode,
            ..self
        }
    }

    pub fn with_cull_mode(self, cull_mode: vk::CullModeFlags, front_face: vk::FrontFace) -> Self {
        Self {
            cull_mode,
            front_face,
            ..self
        }
    }

    pub fn with_color_format(self, color_format: vk::Format) -> Self {
        Self {
            color_format,
            ..self
        }
    }

    pub fn with_depth_format(self, depth_format: vk::Format) -> Self {
        Self {
            depth_format,
            ..self
        }
    }

    fn input_assembly(&self) -> vk::PipelineInputAssemblyStateCreateInfo<'static> {
        vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(self.topology)
            .primitive_restart_enable(false)
    }

    fn rasterization(&self) -> vk::PipelineRasterizationStateCreateInfo<'static> {
        vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(self.polygon_mode)
            .cull_mode(self.cull_mode)
            .front_face(self.front_face)
            .line_width(1.0)
    }

    fn multisample(&self) -> vk::PipelineMultisampleStateCreateInfo<'static> {
        vk::PipelineMultisampleStateCreateInfo::default()
            .sample_shading_enable(false)
            .rasterization_samples(self.samples)
    }

    fn depth_stencil(&self) -> vk::PipelineDepthStencilStateCreateInfo<'static> {
        vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(self.depth_test_enabled)
            .depth_write_enable(self.depth_test_enabled)
            .depth_compare_op(if self.depth_test_enabled {
                vk::CompareOp::LESS
            } else {
                vk::CompareOp::NEVER
            })
            .min_depth_bounds(0.0)
            .max_depth_bounds(1.0)
    }

    fn color_blend_attachment(&self) -> vk::PipelineColorBlendAttachmentState {
        vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(self.blend_enabled)
    }

    /// Assemble the pipeline.
    ///
    /// Returns `None` on creation failure so callers can tell a
    /// misconfigured description from a runtime device error; the Vulkan
    /// result code is logged here.
    pub fn build(
        &self,
        device: &ash::Device,
        layout: vk::PipelineLayout,
        vertex_shader: vk::ShaderModule,
        fragment_shader: vk::ShaderModule,
    ) -> Option<vk::Pipeline> {
        let entry_point = c"main";

        let shader_stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vertex_shader)
                .name(entry_point),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(fragment_shader)
                .name(entry_point),
        ];

        // Vertices are pulled through a buffer device address, so the
        // fixed-function vertex input stage stays empty.
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default();

        let input_assembly = self.input_assembly();

        // Viewport and scissor are dynamic; only their counts are static
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization = self.rasterization();
        let multisample = self.multisample();
        let depth_stencil = self.depth_stencil();

        let blend_attachments = [self.color_blend_attachment()];
        let color_blend = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(&blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let color_formats = [self.color_format];
        let mut rendering_info = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(&color_formats)
            .depth_attachment_format(self.depth_format);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .push_next(&mut rendering_info);

        let result = unsafe {
            device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        };

        match result {
            Ok(pipelines) => Some(pipelines[0]),
            Err((_, e)) => {
                log::error!("Graphics pipeline creation failed: {:?}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_opaque_unculled_triangles() {
        let desc = PipelineDesc::default();
        assert_eq!(desc.topology, vk::PrimitiveTopology::TRIANGLE_LIST);
        assert_eq!(desc.polygon_mode, vk::PolygonMode::FILL);
        assert_eq!(desc.cull_mode, vk::CullModeFlags::NONE);
        assert_eq!(desc.samples, vk::SampleCountFlags::TYPE_1);
        assert!(!desc.blend_enabled);
        assert!(!desc.depth_test_enabled);
        assert_eq!(desc.color_format, vk::Format::UNDEFINED);
        assert_eq!(desc.depth_format, vk::Format::UNDEFINED);
    }

    #[test]
    fn transformations_are_pure() {
        let base = PipelineDesc::default();
        let derived = base
            .with_topology(vk::PrimitiveTopology::LINE_LIST)
            .with_cull_mode(vk::CullModeFlags::BACK, vk::FrontFace::COUNTER_CLOCKWISE)
            .with_color_format(vk::Format::R16G16B16A16_SFLOAT);

        // The base value is untouched
        assert_eq!(base, PipelineDesc::default());

        assert_eq!(derived.topology, vk::PrimitiveTopology::LINE_LIST);
        assert_eq!(derived.cull_mode, vk::CullModeFlags::BACK);
        assert_eq!(derived.front_face, vk::FrontFace::COUNTER_CLOCKWISE);
        assert_eq!(derived.color_format, vk::Format::R16G16B16A16_SFLOAT);
        // Untouched fragments keep their defaults
        assert_eq!(derived.polygon_mode, vk::PolygonMode::FILL);
    }

    #[test]
    fn fragments_reflect_description() {
        let desc = PipelineDesc::default()
            .with_topology(vk::PrimitiveTopology::POINT_LIST)
            .with_polygon_mode(vk::PolygonMode::LINE);

        assert_eq!(
            desc.input_assembly().topology,
            vk::PrimitiveTopology::POINT_LIST
        );
        assert_eq!(desc.rasterization().polygon_mode, vk::PolygonMode::LINE);
        assert_eq!(desc.rasterization().line_width, 1.0);
        assert_eq!(
            desc.multisample().rasterization_samples,
            vk::SampleCountFlags::TYPE_1
        );
    }

    #[test]
    fn depth_test_disabled_never_compares() {
        let state = PipelineDesc::default().depth_stencil();
        assert_eq!(state.depth_test_enable, vk::FALSE);
        assert_eq!(state.depth_write_enable, vk::FALSE);
        assert_eq!(state.depth_compare_op, vk::CompareOp::NEVER);
    }

    #[test]
    fn opaque_blending_writes_all_channels() {
        let attachment = PipelineDesc::default().color_blend_attachment();
        assert_eq!(attachment.blend_enable, vk::FALSE);
        assert_eq!(attachment.color_write_mask, vk::ColorComponentFlags::RGBA);
    }
}
