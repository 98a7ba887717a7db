// Graphics pipeline construction
//
// Both the layer renderer and the distortion mesh draw through pipelines
// built here. They only differ in vertex layout, blending and culling.

use ash::vk;

use super::{create_shader_module, PipelineCache};
use crate::device::Device;
use crate::{Result, StrataError};
use utils::log;

use std::ffi::CStr;

/// How fragments are combined with what is already in the framebuffer
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BlendState {
    /// Overwrite the destination
    Opaque,
    /// Source color was already multiplied by alpha
    Premultiplied,
    /// Source color still has to be multiplied by alpha
    Unpremultiplied,
}

impl BlendState {
    pub fn for_layer(premultiplied: bool) -> Self {
        match premultiplied {
            true => BlendState::Premultiplied,
            false => BlendState::Unpremultiplied,
        }
    }

    fn attachment(&self) -> vk::PipelineColorBlendAttachmentState {
        let src = match self {
            BlendState::Unpremultiplied => vk::BlendFactor::SRC_ALPHA,
            _ => vk::BlendFactor::ONE,
        };

        vk::PipelineColorBlendAttachmentState {
            blend_enable: match self {
                BlendState::Opaque => vk::FALSE,
                _ => vk::TRUE,
            },
            // blend the new contents over the old
            src_color_blend_factor: src,
            dst_color_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            color_blend_op: vk::BlendOp::ADD,
            src_alpha_blend_factor: vk::BlendFactor::ONE,
            dst_alpha_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            alpha_blend_op: vk::BlendOp::ADD,
            color_write_mask: vk::ColorComponentFlags::RGBA,
        }
    }
}

/// Everything that differs between our graphics pipelines
pub struct GraphicsPipelineDesc<'a> {
    pub vert: &'a [u32],
    pub frag: &'a [u32],
    /// Size of one vertex in bytes, 0 for pipelines without vertex input
    pub vertex_stride: u32,
    /// (location, format, offset) of every vertex attribute
    pub attributes: &'a [(u32, vk::Format, u32)],
    pub blend: BlendState,
    pub cull_back: bool,
}

/// Configure and create a graphics pipeline
///
/// Viewport and scissor are dynamic, everything else is fixed. There is
/// no depth test, layers are composited strictly in order.
pub fn create_graphics_pipeline(
    dev: &Device,
    cache: &PipelineCache,
    layout: vk::PipelineLayout,
    pass: vk::RenderPass,
    desc: &GraphicsPipelineDesc,
) -> Result<vk::Pipeline> {
    let vert = create_shader_module(dev, desc.vert)?;
    let frag = match create_shader_module(dev, desc.frag) {
        Ok(f) => f,
        Err(e) => {
            unsafe { dev.dev.destroy_shader_module(vert, None) };
            return Err(e);
        }
    };

    let entrypoint = unsafe { CStr::from_bytes_with_nul_unchecked(b"main\0") };
    let stages = [
        vk::PipelineShaderStageCreateInfo::builder()
            .module(vert)
            .name(entrypoint)
            .stage(vk::ShaderStageFlags::VERTEX)
            .build(),
        vk::PipelineShaderStageCreateInfo::builder()
            .module(frag)
            .name(entrypoint)
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .build(),
    ];

    // This binds our vertex input to location 0 to be passed to the shader
    let vertex_bindings = [vk::VertexInputBindingDescription {
        binding: 0,
        stride: desc.vertex_stride,
        input_rate: vk::VertexInputRate::VERTEX,
    }];
    let vertex_attributes: Vec<vk::VertexInputAttributeDescription> = desc
        .attributes
        .iter()
        .map(|(location, format, offset)| vk::VertexInputAttributeDescription {
            binding: 0,
            location: *location,
            format: *format,
            offset: *offset,
        })
        .collect();

    let mut vertex_info = vk::PipelineVertexInputStateCreateInfo::builder();
    if desc.vertex_stride > 0 {
        vertex_info = vertex_info
            .vertex_binding_descriptions(&vertex_bindings)
            .vertex_attribute_descriptions(&vertex_attributes);
    }

    // input assembly describes how to turn the vertex
    // and index buffers into primatives
    let assembly = vk::PipelineInputAssemblyStateCreateInfo {
        topology: vk::PrimitiveTopology::TRIANGLE_LIST,
        ..Default::default()
    };

    // set at draw time
    let viewport_info = vk::PipelineViewportStateCreateInfo::builder()
        .viewport_count(1)
        .scissor_count(1);

    let raster_info = vk::PipelineRasterizationStateCreateInfo {
        front_face: vk::FrontFace::COUNTER_CLOCKWISE,
        cull_mode: match desc.cull_back {
            true => vk::CullModeFlags::BACK,
            false => vk::CullModeFlags::NONE,
        },
        line_width: 1.0,
        polygon_mode: vk::PolygonMode::FILL,
        ..Default::default()
    };

    // combines all of the fragments found at a pixel for anti-aliasing
    // just disable this
    let multisample_info = vk::PipelineMultisampleStateCreateInfo {
        rasterization_samples: vk::SampleCountFlags::TYPE_1,
        ..Default::default()
    };

    let depth_info = vk::PipelineDepthStencilStateCreateInfo {
        depth_test_enable: vk::FALSE,
        depth_write_enable: vk::FALSE,
        max_depth_bounds: 1.0,
        ..Default::default()
    };

    let blend_attachment_states = [desc.blend.attachment()];
    let blend_info = vk::PipelineColorBlendStateCreateInfo::builder()
        .logic_op(vk::LogicOp::CLEAR)
        .attachments(&blend_attachment_states);

    // dynamic state specifies what parts of the pipeline will be
    // specified at draw time. The distortion pass moves the viewport
    // between eyes.
    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_info = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

    let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(&stages)
        .vertex_input_state(&vertex_info)
        .input_assembly_state(&assembly)
        .viewport_state(&viewport_info)
        .rasterization_state(&raster_info)
        .multisample_state(&multisample_info)
        .depth_stencil_state(&depth_info)
        .color_blend_state(&blend_info)
        .dynamic_state(&dynamic_info)
        .layout(layout)
        .render_pass(pass)
        .build();

    let ret = unsafe {
        dev.dev
            .create_graphics_pipelines(cache.handle(), &[pipeline_info], None)
    };

    // Modules are only needed during creation
    unsafe {
        dev.dev.destroy_shader_module(vert, None);
        dev.dev.destroy_shader_module(frag, None);
    }

    match ret {
        Ok(pipes) => pipes.get(0).cloned().ok_or(StrataError::GPU_ERROR),
        Err((_, e)) => {
            log::error!("Could not create graphics pipeline: {:?}", e);
            Err(StrataError::GPU_ERROR)
        }
    }
}

/// Create a renderpass with a single color attachment
///
/// The attachment is cleared on load. `initial` is the layout the image
/// is in when the pass starts and `final_layout` where it is left.
pub fn create_color_pass(
    dev: &Device,
    format: vk::Format,
    initial: vk::ImageLayout,
    final_layout: vk::ImageLayout,
) -> Result<vk::RenderPass> {
    let attachments = [vk::AttachmentDescription {
        format: format,
        samples: vk::SampleCountFlags::TYPE_1,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::STORE,
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: initial,
        final_layout: final_layout,
        ..Default::default()
    }];

    // identify which of the above attachments
    let color_refs = [vk::AttachmentReference {
        attachment: 0, // index into the attachments variable
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    }];

    // wait for whoever used the image before us, and make our writes
    // visible to the sampling that follows
    let dependencies = [
        vk::SubpassDependency {
            src_subpass: vk::SUBPASS_EXTERNAL,
            dst_subpass: 0,
            src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::FRAGMENT_SHADER,
            dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            src_access_mask: vk::AccessFlags::SHADER_READ,
            dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_READ
                | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            ..Default::default()
        },
        vk::SubpassDependency {
            src_subpass: 0,
            dst_subpass: vk::SUBPASS_EXTERNAL,
            src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            dst_stage_mask: vk::PipelineStageFlags::FRAGMENT_SHADER
                | vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            src_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            dst_access_mask: vk::AccessFlags::SHADER_READ,
            ..Default::default()
        },
    ];

    // our render pass only has one subpass, which only does graphical ops
    let subpasses = [vk::SubpassDescription::builder()
        .color_attachments(&color_refs)
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .build()];

    let create_info = vk::RenderPassCreateInfo::builder()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    unsafe {
        dev.dev
            .create_render_pass(&create_info, None)
            .map_err(|_| StrataError::GPU_ERROR)
    }
}
