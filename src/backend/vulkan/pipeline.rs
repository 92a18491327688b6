//! Graphics pipeline construction from a laid-out shader config (C7, §4.10).

use anyhow::{Context, Result};
use ash::vk;

use crate::render_pass::RenderPassDomain;
use crate::shader_config::{CullMode, ShaderConfig, UniformScope};

pub struct VulkanPipeline {
    pub pipeline: vk::Pipeline,
    pub pipeline_layout: vk::PipelineLayout,
    pub global_set_layout: vk::DescriptorSetLayout,
    pub instance_set_layout: Option<vk::DescriptorSetLayout>,
    pub descriptor_pool: vk::DescriptorPool,
    pub global_descriptor_set: vk::DescriptorSet,
}

fn to_vk_cull_mode(mode: CullMode) -> vk::CullModeFlags {
    match mode {
        CullMode::None => vk::CullModeFlags::NONE,
        CullMode::Front => vk::CullModeFlags::FRONT,
        CullMode::Back => vk::CullModeFlags::BACK,
        CullMode::FrontAndBack => vk::CullModeFlags::FRONT_AND_BACK,
    }
}

/// Opaque blend for WORLD-family domains, alpha blend for UI/POST; depth
/// write disabled for domains that draw after the depth buffer is final
/// (§4.10).
fn blend_and_depth_state(domain: RenderPassDomain) -> (bool, bool, bool) {
    // (blend_enable, depth_test_enable, depth_write_enable)
    match domain {
        RenderPassDomain::World | RenderPassDomain::Skybox | RenderPassDomain::Shadow => (false, true, true),
        RenderPassDomain::WorldTransparent => (true, true, false),
        RenderPassDomain::Ui | RenderPassDomain::Post => (true, false, false),
        RenderPassDomain::Compute => (false, false, false),
    }
}

fn descriptor_set_layout_for_scope(
    device: &ash::Device,
    config: &ShaderConfig,
    scope: UniformScope,
    stage_flags: vk::ShaderStageFlags,
) -> Result<Option<vk::DescriptorSetLayout>> {
    let ubo_size = match scope {
        UniformScope::Global => config.global_ubo_size,
        UniformScope::Instance => config.instance_ubo_size,
        UniformScope::Local => 0,
    };
    let texture_count = match scope {
        UniformScope::Global => config.global_texture_count,
        UniformScope::Instance => config.instance_texture_count,
        UniformScope::Local => 0,
    };
    if ubo_size == 0 && texture_count == 0 {
        return Ok(None);
    }

    let mut bindings = Vec::new();
    if ubo_size > 0 {
        bindings.push(
            vk::DescriptorSetLayoutBinding::builder()
                .binding(0)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(1)
                .stage_flags(stage_flags)
                .build(),
        );
    }
    for slot in 0..texture_count {
        bindings.push(
            vk::DescriptorSetLayoutBinding::builder()
                .binding(1 + slot)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::FRAGMENT)
                .build(),
        );
    }

    let create_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
    let layout = unsafe { device.create_descriptor_set_layout(&create_info, None) }.context("vkCreateDescriptorSetLayout failed")?;
    Ok(Some(layout))
}

/// Builds descriptor-set layouts for `{global, instance}`, a push-constant
/// range for `LOCAL` (if `use_local`), and the graphics pipeline itself.
/// `render_pass`/`vertex_input`/shader modules are supplied by the caller
/// since they depend on already-loaded SPIR-V and an existing render pass.
#[allow(clippy::too_many_arguments)]
pub fn create_graphics_pipeline(
    device: &ash::Device,
    config: &ShaderConfig,
    domain: RenderPassDomain,
    render_pass: vk::RenderPass,
    extent: vk::Extent2D,
    vertex_binding: vk::VertexInputBindingDescription,
    vertex_attributes: &[vk::VertexInputAttributeDescription],
    shader_stages: &[vk::PipelineShaderStageCreateInfo],
    max_instance_states: u32,
) -> Result<VulkanPipeline> {
    let global_set_layout = descriptor_set_layout_for_scope(device, config, UniformScope::Global, vk::ShaderStageFlags::ALL_GRAPHICS)?
        .context("every pipeline carries at least a global descriptor set")?;
    let instance_set_layout = descriptor_set_layout_for_scope(device, config, UniformScope::Instance, vk::ShaderStageFlags::ALL_GRAPHICS)?;

    let mut set_layouts = vec![global_set_layout];
    if let Some(layout) = instance_set_layout {
        set_layouts.push(layout);
    }

    let push_constant_ranges: Vec<vk::PushConstantRange> = if config.use_local && config.push_constant_size > 0 {
        vec![vk::PushConstantRange::builder()
            .stage_flags(vk::ShaderStageFlags::VERTEX)
            .offset(0)
            .size(config.push_constant_stride)
            .build()]
    } else {
        Vec::new()
    };

    let layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&set_layouts).push_constant_ranges(&push_constant_ranges);
    let pipeline_layout = unsafe { device.create_pipeline_layout(&layout_info, None) }.context("vkCreatePipelineLayout failed")?;

    let (blend_enable, depth_test_enable, depth_write_enable) = blend_and_depth_state(domain);

    let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_binding_descriptions(std::slice::from_ref(&vertex_binding))
        .vertex_attribute_descriptions(vertex_attributes);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder().topology(vk::PrimitiveTopology::TRIANGLE_LIST);

    let viewport = vk::Viewport { x: 0.0, y: 0.0, width: extent.width as f32, height: extent.height as f32, min_depth: 0.0, max_depth: 1.0 };
    let scissor = vk::Rect2D { offset: vk::Offset2D { x: 0, y: 0 }, extent };
    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewports(std::slice::from_ref(&viewport))
        .scissors(std::slice::from_ref(&scissor));

    let rasterization_state = vk::PipelineRasterizationStateCreateInfo::builder()
        .polygon_mode(vk::PolygonMode::FILL)
        .cull_mode(to_vk_cull_mode(config.cull_mode))
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .line_width(1.0);

    let multisample_state = vk::PipelineMultisampleStateCreateInfo::builder().rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let depth_stencil_state = vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(depth_test_enable)
        .depth_write_enable(depth_write_enable)
        .depth_compare_op(vk::CompareOp::LESS_OR_EQUAL);

    let color_blend_attachment = if blend_enable {
        vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
            .alpha_blend_op(vk::BlendOp::ADD)
            .build()
    } else {
        vk::PipelineColorBlendAttachmentState::builder().color_write_mask(vk::ColorComponentFlags::RGBA).build()
    };
    let color_blend_state = vk::PipelineColorBlendStateCreateInfo::builder().attachments(std::slice::from_ref(&color_blend_attachment));

    let create_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(shader_stages)
        .vertex_input_state(&vertex_input_state)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization_state)
        .multisample_state(&multisample_state)
        .depth_stencil_state(&depth_stencil_state)
        .color_blend_state(&color_blend_state)
        .layout(pipeline_layout)
        .render_pass(render_pass)
        .subpass(0);

    let pipeline = unsafe { device.create_graphics_pipelines(vk::PipelineCache::null(), std::slice::from_ref(&create_info), None) }
        .map_err(|(_, err)| err)
        .context("vkCreateGraphicsPipelines failed")?[0];

    let pool_sizes = descriptor_pool_sizes(config, max_instance_states);
    let pool_info = vk::DescriptorPoolCreateInfo::builder()
        .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
        .pool_sizes(&pool_sizes)
        .max_sets(max_instance_states + 1);
    let descriptor_pool = unsafe { device.create_descriptor_pool(&pool_info, None) }.context("vkCreateDescriptorPool failed")?;

    let global_alloc_info = vk::DescriptorSetAllocateInfo::builder()
        .descriptor_pool(descriptor_pool)
        .set_layouts(std::slice::from_ref(&global_set_layout));
    let global_descriptor_set = unsafe { device.allocate_descriptor_sets(&global_alloc_info) }.context("vkAllocateDescriptorSets failed")?[0];

    Ok(VulkanPipeline { pipeline, pipeline_layout, global_set_layout, instance_set_layout, descriptor_pool, global_descriptor_set })
}

fn descriptor_pool_sizes(config: &ShaderConfig, max_instance_states: u32) -> Vec<vk::DescriptorPoolSize> {
    let mut sizes = Vec::new();
    let ubo_count = 1 + if config.use_instance { max_instance_states } else { 0 };
    if ubo_count > 0 {
        sizes.push(vk::DescriptorPoolSize { ty: vk::DescriptorType::UNIFORM_BUFFER, descriptor_count: ubo_count });
    }
    let sampler_count = config.global_texture_count + config.instance_texture_count * max_instance_states;
    if sampler_count > 0 {
        sizes.push(vk::DescriptorPoolSize { ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER, descriptor_count: sampler_count });
    }
    sizes
}

/// Allocates one instance descriptor set from the pipeline's pool, for
/// `acquire_instance_state` (§4.10).
pub fn allocate_instance_descriptor_set(device: &ash::Device, pipeline: &VulkanPipeline) -> Result<vk::DescriptorSet> {
    let layout = pipeline.instance_set_layout.context("pipeline has no instance scope")?;
    let alloc_info = vk::DescriptorSetAllocateInfo::builder()
        .descriptor_pool(pipeline.descriptor_pool)
        .set_layouts(std::slice::from_ref(&layout));
    let set = unsafe { device.allocate_descriptor_sets(&alloc_info) }.context("vkAllocateDescriptorSets failed")?[0];
    Ok(set)
}

/// Returns a descriptor set to the pool so a future `acquire_instance_state`
/// can reuse the slot.
pub fn free_instance_descriptor_set(device: &ash::Device, pipeline: &VulkanPipeline, set: vk::DescriptorSet) {
    unsafe {
        let _ = device.free_descriptor_sets(pipeline.descriptor_pool, &[set]);
    }
}

pub fn destroy_pipeline(device: &ash::Device, pipeline: &mut VulkanPipeline) {
    unsafe {
        device.destroy_descriptor_pool(pipeline.descriptor_pool, None);
        if let Some(layout) = pipeline.instance_set_layout {
            device.destroy_descriptor_set_layout(layout, None);
        }
        device.destroy_descriptor_set_layout(pipeline.global_set_layout, None);
        device.destroy_pipeline_layout(pipeline.pipeline_layout, None);
        device.destroy_pipeline(pipeline.pipeline, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ui_and_post_disable_depth_write_and_enable_blend() {
        let (blend, depth_test, depth_write) = blend_and_depth_state(RenderPassDomain::Ui);
        assert!(blend);
        assert!(!depth_test);
        assert!(!depth_write);

        let (blend, _, depth_write) = blend_and_depth_state(RenderPassDomain::Post);
        assert!(blend);
        assert!(!depth_write);
    }

    #[test]
    fn world_is_opaque_with_depth_write() {
        let (blend, depth_test, depth_write) = blend_and_depth_state(RenderPassDomain::World);
        assert!(!blend);
        assert!(depth_test);
        assert!(depth_write);
    }

    #[test]
    fn cull_mode_translation_is_total() {
        assert_eq!(to_vk_cull_mode(CullMode::None), vk::CullModeFlags::NONE);
        assert_eq!(to_vk_cull_mode(CullMode::FrontAndBack), vk::CullModeFlags::FRONT_AND_BACK);
    }
}
