use std::{ffi::CString, sync::Arc};

use anyhow::{Context, Result};
use ash::vk;

use crate::{
    engine::{DestructObject, EngineShared, TsCell, MAX_BOUND_USF},
    types::{BlendMode, ComputePipelineInfo, GraphicsPipelineInfo},
    uniform::UniformSetFactory,
};

/// A `VkPipelineLayout` over one to four uniform-set factories, the Vulkan
/// required floor for `maxBoundDescriptorSets`.
pub struct PipelineLayout {
    pub(crate) engine: Arc<EngineShared>,
    pub(crate) factories: Vec<Arc<UniformSetFactory>>,
    pub(crate) handle: vk::PipelineLayout,
}

impl PipelineLayout {
    pub(crate) fn new(
        engine: Arc<EngineShared>,
        factories: &[Arc<UniformSetFactory>],
    ) -> Result<Arc<PipelineLayout>> {
        if factories.is_empty() || factories.len() > MAX_BOUND_USF {
            return Err(anyhow::anyhow!(
                "invalid factory count {}",
                factories.len()
            ));
        }

        let layouts = factories
            .iter()
            .map(|factory| factory.layout)
            .collect::<Vec<_>>();

        let layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&layouts);
        let handle = unsafe {
            engine
                .device()
                .create_pipeline_layout(&layout_info, None)
                .context("vkCreatePipelineLayout failed")?
        };

        Ok(Arc::new(PipelineLayout {
            engine,
            factories: factories.to_vec(),
            handle,
        }))
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        self.engine
            .delete_object(DestructObject::PipelineLayout {
                handle: self.handle,
            });
    }
}

/// A graphics pipeline bound to one renderer's render pass.
pub struct GraphicsPipeline {
    pub(crate) engine: Arc<EngineShared>,
    pub(crate) pipeline_layout: Arc<PipelineLayout>,
    pub(crate) renderer: Arc<crate::renderer::Renderer>,
    pub(crate) handle: vk::Pipeline,
    pub(crate) ts: TsCell,
}

impl GraphicsPipeline {
    pub(crate) fn new(
        engine: Arc<EngineShared>,
        info: GraphicsPipelineInfo,
    ) -> Result<Arc<GraphicsPipeline>> {
        let vs = engine.shader_module(&info.vs)?;
        let fs = engine.shader_module(&info.fs)?;

        let entry_point = CString::new("main").unwrap();
        let shader_stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vs)
                .name(entry_point.as_c_str()),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(fs)
                .name(entry_point.as_c_str()),
        ];

        // one vertex buffer per attribute
        let mut vertex_bindings = Vec::with_capacity(info.vertex_buffers.len());
        let mut vertex_attributes = Vec::with_capacity(info.vertex_buffers.len());
        for (index, vbi) in info.vertex_buffers.iter().enumerate() {
            debug_assert!((1..=4).contains(&vbi.components));
            vertex_bindings.push(
                vk::VertexInputBindingDescription::default()
                    .binding(index as u32)
                    .stride(vbi.format.attribute_size(vbi.components))
                    .input_rate(vk::VertexInputRate::VERTEX),
            );
            vertex_attributes.push(
                vk::VertexInputAttributeDescription::default()
                    .location(vbi.location)
                    .binding(index as u32)
                    .format(vbi.format.to_vulkan_format(vbi.components))
                    .offset(0),
            );
        }

        let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&vertex_bindings)
            .vertex_attribute_descriptions(&vertex_attributes);

        let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(info.primitive.to_vulkan_topology())
            .primitive_restart_enable(info.primitive_restart);

        // viewport and scissor are dynamic; only the counts matter here
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization_state = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(if info.cull_back {
                vk::CullModeFlags::BACK
            } else {
                vk::CullModeFlags::NONE
            })
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .line_width(1.0);

        let samples = match info.renderer.msaa_sample_count() {
            4 => vk::SampleCountFlags::TYPE_4,
            _ => vk::SampleCountFlags::TYPE_1,
        };
        let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(samples)
            .sample_shading_enable(false)
            .min_sample_shading(1.0);

        let depth_stencil_state = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(info.depth_test)
            .depth_write_enable(info.depth_write)
            .depth_compare_op(vk::CompareOp::LESS)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false)
            .min_depth_bounds(0.0)
            .max_depth_bounds(1.0);

        let blend_attachment = match info.blend_mode {
            BlendMode::Disabled => vk::PipelineColorBlendAttachmentState::default()
                .blend_enable(false)
                .color_write_mask(vk::ColorComponentFlags::RGBA),
            BlendMode::Transparency => vk::PipelineColorBlendAttachmentState::default()
                .blend_enable(true)
                .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
                .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                .color_blend_op(vk::BlendOp::ADD)
                .src_alpha_blend_factor(vk::BlendFactor::ONE)
                .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                .alpha_blend_op(vk::BlendOp::ADD)
                .color_write_mask(vk::ColorComponentFlags::RGBA),
        };

        let color_blend_state = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .logic_op(vk::LogicOp::COPY)
            .attachments(std::slice::from_ref(&blend_attachment))
            .blend_constants([0.0, 0.0, 0.0, 0.0]);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input_state)
            .input_assembly_state(&input_assembly_state)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization_state)
            .multisample_state(&multisample_state)
            .depth_stencil_state(&depth_stencil_state)
            .color_blend_state(&color_blend_state)
            .dynamic_state(&dynamic_state)
            .layout(info.pipeline_layout.handle)
            .render_pass(info.renderer.render_pass())
            .subpass(0);

        let handle = unsafe {
            engine
                .device()
                .create_graphics_pipelines(
                    engine.pipeline_cache(),
                    std::slice::from_ref(&pipeline_info),
                    None,
                )
                .map_err(|(_, err)| err)
                .context("vkCreateGraphicsPipelines failed")?[0]
        };

        Ok(Arc::new(GraphicsPipeline {
            engine,
            pipeline_layout: info.pipeline_layout,
            renderer: info.renderer,
            handle,
            ts: TsCell::new(),
        }))
    }

    pub fn layout(&self) -> &Arc<PipelineLayout> {
        &self.pipeline_layout
    }
}

impl Drop for GraphicsPipeline {
    fn drop(&mut self) {
        self.engine
            .delete_object(DestructObject::GraphicsPipeline {
                ts: self.ts.get(),
                handle: self.handle,
            });
    }
}

pub struct ComputePipeline {
    pub(crate) engine: Arc<EngineShared>,
    pub(crate) pipeline_layout: Arc<PipelineLayout>,
    pub(crate) handle: vk::Pipeline,
    pub(crate) ts: TsCell,
}

impl ComputePipeline {
    pub(crate) fn new(
        engine: Arc<EngineShared>,
        info: ComputePipelineInfo,
    ) -> Result<Arc<ComputePipeline>> {
        let cs = engine.shader_module(&info.cs)?;

        let entry_point = CString::new("main").unwrap();
        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(cs)
            .name(entry_point.as_c_str());

        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(info.pipeline_layout.handle);

        let handle = unsafe {
            engine
                .device()
                .create_compute_pipelines(
                    engine.pipeline_cache(),
                    std::slice::from_ref(&pipeline_info),
                    None,
                )
                .map_err(|(_, err)| err)
                .context("vkCreateComputePipelines failed")?[0]
        };

        Ok(Arc::new(ComputePipeline {
            engine,
            pipeline_layout: info.pipeline_layout,
            handle,
            ts: TsCell::new(),
        }))
    }

    pub fn layout(&self) -> &Arc<PipelineLayout> {
        &self.pipeline_layout
    }
}

impl Drop for ComputePipeline {
    fn drop(&mut self) {
        self.engine
            .delete_object(DestructObject::ComputePipeline {
                ts: self.ts.get(),
                handle: self.handle,
            });
    }
}
