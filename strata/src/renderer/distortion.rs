// Stage two of composition
//
// The distortion engine writes the final image into the target. The
// graphics engine draws the distortion mesh sampling the layer
// renderer's scratch images. The compute engine composites the layers
// itself and then warps its scratch image in a second dispatch.
//
// Both can skip stage one and sample a single projection layer directly.
use ash::vk;
use cgmath::{Matrix4, SquareMatrix};

use super::layer_renderer::{background_color, layer_ubo, sampler_kind_for};
use super::{CompositeLayer, FrameComposition, FramePlan, RenderMode, TargetConfig};
use crate::descpool::{Descriptor, DescriptorSystem, LayoutBinding};
use crate::device::{Device, SamplerKind};
use crate::display::{create_target_view, Target};
use crate::hmd::{DistortionMesh, DISTORTION_VERTEX_STRIDE};
use crate::image::{ImageCreateInfo, ImageResources, SampledImage};
use crate::layers::{BlendMode, LayerKind, LayerType, Pose, MAX_LAYERS};
use crate::math;
use crate::pipelines::compute::{Pass, WORKGROUP_SIZE};
use crate::pipelines::{
    create_color_pass, create_graphics_pipeline, create_pipeline_layout, shader_names, BlendState,
    GraphicsPipelineDesc, PipelineCache, ShaderBlobs,
};
use crate::{Result, StrataError};
use utils::log;

use std::sync::Arc;

/// The most layers one compute layer dispatch blends
pub const COMPUTE_MAX_LAYERS: usize = MAX_LAYERS;

/// What the distortion engine samples this frame
pub struct DistortionInput<'a> {
    pub frame: &'a FrameComposition,
    pub plan: &'a FramePlan,
    /// The layer renderer's per eye images, graphics path only
    pub scratch: Option<[SampledImage; 2]>,
    /// World pose of each eye sampled right before recording
    pub fresh_poses: [Pose; 2],
}

impl<'a> DistortionInput<'a> {
    /// The projection layer sampled by the fast path
    fn fast_path_layer(&self) -> Option<&'a CompositeLayer> {
        self.plan
            .fast_path_layer()
            .and_then(|i| self.frame.layers.get(i))
    }
}

/// Normalized sampling window of a projection layer for one eye
fn projection_post_transform(layer: &CompositeLayer, eye: usize) -> Result<[f32; 4]> {
    let img = layer.color_image(eye).ok_or(StrataError::INVALID)?;
    let sub = layer.data.sub_image(eye);
    let r = math::post_transform(&sub.rect, img.width, img.height, layer.data.flip_y);
    Ok([r.r_pos.0, r.r_pos.1, r.r_size.0, r.r_size.1])
}

/// The second stage of the renderer
pub trait DistortionEngine: Send {
    /// Build everything tied to the target's images
    fn create_target_resources(&mut self, target: &dyn Target, config: &TargetConfig)
        -> Result<()>;

    fn destroy_target_resources(&mut self);

    /// Does this engine blend the layers itself, without the layer renderer
    fn composites_layers(&self) -> bool;

    /// Update uniforms and descriptors for drawing into target image `index`
    fn prepare(&mut self, input: &DistortionInput, index: u32) -> Result<()>;

    /// Only clear target image `index` this frame
    fn prepare_clear(&mut self, index: u32);

    /// Record the commands prepared for target image `index`
    fn record(&self, cbuf: vk::CommandBuffer, index: u32);

    /// The pipeline stage that first touches the target image
    fn wait_stage(&self) -> vk::PipelineStageFlags;
}

/// Uniforms of one eye's distortion draw, std140
#[derive(Debug, Copy, Clone)]
#[repr(C)]
struct MeshUbo {
    vertex_rot: [[f32; 4]; 2],
    post_transform: [f32; 4],
}

/// Distortion through the mesh and a graphics pipeline
pub struct GraphicsDistortion {
    gd_dev: Arc<Device>,
    gd_cache: Arc<PipelineCache>,
    gd_pipeline: Option<vk::Pipeline>,
    gd_pass: vk::RenderPass,
    gd_pipeline_layout: vk::PipelineLayout,
    gd_descs: DescriptorSystem,
    gd_eye_descs: Vec<Descriptor>,
    gd_ubos: Vec<(vk::Buffer, vk::DeviceMemory)>,
    gd_vbuf: (vk::Buffer, vk::DeviceMemory),
    gd_ibuf: (vk::Buffer, vk::DeviceMemory),
    gd_mesh: DistortionMesh,
    /// One per target image
    gd_framebuffers: Vec<vk::Framebuffer>,
    gd_config: Option<TargetConfig>,
    gd_vert: Vec<u32>,
    gd_frag: Vec<u32>,
    gd_clear_only: bool,
}

impl GraphicsDistortion {
    pub fn new(
        dev: Arc<Device>,
        cache: Arc<PipelineCache>,
        shaders: &ShaderBlobs,
        mesh: &DistortionMesh,
    ) -> Result<Self> {
        let mut descs = DescriptorSystem::new(
            dev.clone(),
            &[
                LayoutBinding::new(
                    0,
                    vk::DescriptorType::UNIFORM_BUFFER,
                    1,
                    vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                ),
                LayoutBinding::new(
                    1,
                    vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    1,
                    vk::ShaderStageFlags::FRAGMENT,
                ),
            ],
        )?;
        let eye_descs = vec![descs.alloc_descriptor()?, descs.alloc_descriptor()?];

        let vbuf = dev.create_buffer(vk::BufferUsageFlags::VERTEX_BUFFER, mesh.vertices.as_slice())?;
        let ibuf = match dev.create_buffer(vk::BufferUsageFlags::INDEX_BUFFER, mesh.indices.as_slice()) {
            Ok(b) => b,
            Err(e) => {
                dev.destroy_buffer(vbuf.0, vbuf.1);
                return Err(e);
            }
        };

        let mut ret = Self {
            gd_dev: dev.clone(),
            gd_cache: cache,
            gd_pipeline: None,
            gd_pass: vk::RenderPass::null(),
            gd_pipeline_layout: vk::PipelineLayout::null(),
            gd_descs: descs,
            gd_eye_descs: eye_descs,
            gd_ubos: Vec::new(),
            gd_vbuf: vbuf,
            gd_ibuf: ibuf,
            gd_mesh: mesh.clone(),
            gd_framebuffers: Vec::new(),
            gd_config: None,
            gd_vert: shaders.get(shader_names::MESH_VERT)?.to_vec(),
            gd_frag: shaders.get(shader_names::MESH_FRAG)?.to_vec(),
            gd_clear_only: true,
        };

        ret.gd_pipeline_layout = create_pipeline_layout(&dev, ret.gd_descs.layout())?;
        for _ in 0..2 {
            let ubo = dev.create_buffer_with_size(
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                std::mem::size_of::<MeshUbo>() as u64,
            )?;
            ret.gd_ubos.push(ubo);
        }

        Ok(ret)
    }

    /// Point one eye's set at `view` sampled through `post_transform`
    fn update_eye(
        &self,
        eye: usize,
        config: &TargetConfig,
        view: vk::ImageView,
        sampler: SamplerKind,
        post_transform: [f32; 4],
    ) -> Result<()> {
        let ubo = MeshUbo {
            vertex_rot: math::mat2_to_std140(&config.views[eye].vertex_rot),
            post_transform: post_transform,
        };
        let (buf, mem) = self.gd_ubos[eye];
        self.gd_dev.update_memory(mem, 0, &[ubo])?;

        let buf_info = [vk::DescriptorBufferInfo {
            buffer: buf,
            offset: 0,
            range: std::mem::size_of::<MeshUbo>() as u64,
        }];
        let img_info = [vk::DescriptorImageInfo {
            sampler: self.gd_dev.sampler(sampler),
            image_view: view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }];
        let set = self.gd_eye_descs[eye].d_set;
        let writes = [
            vk::WriteDescriptorSet::builder()
                .dst_set(set)
                .dst_binding(0)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .buffer_info(&buf_info)
                .build(),
            vk::WriteDescriptorSet::builder()
                .dst_set(set)
                .dst_binding(1)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .image_info(&img_info)
                .build(),
        ];
        unsafe { self.gd_dev.dev.update_descriptor_sets(&writes, &[]) };
        Ok(())
    }
}

impl DistortionEngine for GraphicsDistortion {
    fn create_target_resources(
        &mut self,
        target: &dyn Target,
        config: &TargetConfig,
    ) -> Result<()> {
        self.destroy_target_resources();

        self.gd_pass = create_color_pass(
            &self.gd_dev,
            target.format(),
            vk::ImageLayout::UNDEFINED,
            target.final_layout(),
        )?;

        let stride = (DISTORTION_VERTEX_STRIDE * std::mem::size_of::<f32>()) as u32;
        // position, then the uv of the red, green and blue channels
        let attributes = [
            (0, vk::Format::R32G32_SFLOAT, 0),
            (1, vk::Format::R32G32_SFLOAT, 8),
            (2, vk::Format::R32G32_SFLOAT, 16),
            (3, vk::Format::R32G32_SFLOAT, 24),
        ];
        let desc = GraphicsPipelineDesc {
            vert: &self.gd_vert,
            frag: &self.gd_frag,
            vertex_stride: stride,
            attributes: &attributes,
            blend: BlendState::Opaque,
            cull_back: false,
        };
        self.gd_pipeline = Some(create_graphics_pipeline(
            &self.gd_dev,
            &self.gd_cache,
            self.gd_pipeline_layout,
            self.gd_pass,
            &desc,
        )?);

        for image in target.images().iter() {
            let attachments = [image.view];
            let fb_info = vk::FramebufferCreateInfo::builder()
                .render_pass(self.gd_pass)
                .attachments(&attachments)
                .width(config.extent.width)
                .height(config.extent.height)
                .layers(1);
            let fb = unsafe {
                self.gd_dev
                    .dev
                    .create_framebuffer(&fb_info, None)
                    .map_err(|e| {
                        log::error!("Could not create target framebuffer: {:?}", e);
                        StrataError::GPU_ERROR
                    })?
            };
            self.gd_framebuffers.push(fb);
        }

        self.gd_config = Some(*config);
        Ok(())
    }

    fn destroy_target_resources(&mut self) {
        let dev = &self.gd_dev.dev;
        unsafe {
            for fb in self.gd_framebuffers.drain(..) {
                dev.destroy_framebuffer(fb, None);
            }
            if let Some(p) = self.gd_pipeline.take() {
                dev.destroy_pipeline(p, None);
            }
            if self.gd_pass != vk::RenderPass::null() {
                dev.destroy_render_pass(self.gd_pass, None);
                self.gd_pass = vk::RenderPass::null();
            }
        }
        self.gd_config = None;
    }

    fn composites_layers(&self) -> bool {
        false
    }

    fn prepare(&mut self, input: &DistortionInput, index: u32) -> Result<()> {
        let config = self.gd_config.ok_or(StrataError::INVALID)?;
        if index as usize >= self.gd_framebuffers.len() {
            return Err(StrataError::INVALID);
        }
        self.gd_clear_only = true;

        match input.plan.mode {
            RenderMode::FastProjection { .. } => {
                let layer = input.fast_path_layer().ok_or(StrataError::INVALID)?;
                for eye in 0..2 {
                    let img = layer.color_image(eye).ok_or(StrataError::INVALID)?;
                    self.update_eye(
                        eye,
                        &config,
                        img.view(layer.data.blends_alpha()),
                        SamplerKind::ClampToBorderBlack,
                        projection_post_transform(layer, eye)?,
                    )?;
                }
            }
            RenderMode::Layered => {
                let scratch = input.scratch.ok_or(StrataError::INVALID)?;
                for eye in 0..2 {
                    self.update_eye(
                        eye,
                        &config,
                        scratch[eye].view_alpha,
                        SamplerKind::ClampToBorderBlack,
                        [0.0, 0.0, 1.0, 1.0],
                    )?;
                }
            }
        }

        self.gd_clear_only = false;
        Ok(())
    }

    fn prepare_clear(&mut self, _index: u32) {
        self.gd_clear_only = true;
    }

    fn record(&self, cbuf: vk::CommandBuffer, index: u32) {
        let (config, pipeline, fb) = match (
            self.gd_config,
            self.gd_pipeline,
            self.gd_framebuffers.get(index as usize),
        ) {
            (Some(c), Some(p), Some(fb)) => (c, p, *fb),
            _ => return,
        };
        let dev = &self.gd_dev.dev;

        let clear_values = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: [0.0, 0.0, 0.0, 1.0],
            },
        }];
        let info = vk::RenderPassBeginInfo::builder()
            .render_pass(self.gd_pass)
            .framebuffer(fb)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: config.extent,
            })
            .clear_values(&clear_values);

        unsafe {
            dev.cmd_begin_render_pass(cbuf, &info, vk::SubpassContents::INLINE);

            if !self.gd_clear_only {
                dev.cmd_bind_pipeline(cbuf, vk::PipelineBindPoint::GRAPHICS, pipeline);
                dev.cmd_bind_vertex_buffers(cbuf, 0, &[self.gd_vbuf.0], &[0]);
                dev.cmd_bind_index_buffer(cbuf, self.gd_ibuf.0, 0, vk::IndexType::UINT32);

                for eye in 0..2 {
                    let vp = config.views[eye].viewport;
                    let viewport = vk::Viewport {
                        x: vp.x as f32,
                        y: vp.y as f32,
                        width: vp.w as f32,
                        height: vp.h as f32,
                        min_depth: 0.0,
                        max_depth: 1.0,
                    };
                    let scissor = vk::Rect2D {
                        offset: vk::Offset2D {
                            x: vp.x as i32,
                            y: vp.y as i32,
                        },
                        extent: vk::Extent2D {
                            width: vp.w,
                            height: vp.h,
                        },
                    };
                    dev.cmd_set_viewport(cbuf, 0, &[viewport]);
                    dev.cmd_set_scissor(cbuf, 0, &[scissor]);
                    dev.cmd_bind_descriptor_sets(
                        cbuf,
                        vk::PipelineBindPoint::GRAPHICS,
                        self.gd_pipeline_layout,
                        0,
                        &[self.gd_eye_descs[eye].d_set],
                        &[],
                    );
                    dev.cmd_draw_indexed(
                        cbuf,
                        self.gd_mesh.index_counts[eye],
                        1,
                        self.gd_mesh.index_offsets[eye],
                        self.gd_mesh.vertex_offsets[eye] as i32,
                        0,
                    );
                }
            }

            dev.cmd_end_render_pass(cbuf);
        }
    }

    fn wait_stage(&self) -> vk::PipelineStageFlags {
        vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
    }
}

impl Drop for GraphicsDistortion {
    fn drop(&mut self) {
        self.destroy_target_resources();
        unsafe {
            self.gd_dev
                .dev
                .destroy_pipeline_layout(self.gd_pipeline_layout, None);
        }
        for (buf, mem) in self.gd_ubos.drain(..) {
            self.gd_dev.destroy_buffer(buf, mem);
        }
        self.gd_dev.destroy_buffer(self.gd_vbuf.0, self.gd_vbuf.1);
        self.gd_dev.destroy_buffer(self.gd_ibuf.0, self.gd_ibuf.1);
    }
}

/// Uniforms of the layer dispatch for one view, std140
#[derive(Debug, Copy, Clone)]
#[repr(C)]
struct ComputeLayerUbo {
    /// x offset into the scratch image, width, height, layer count
    view: [u32; 4],
    clear_color: [f32; 4],
    /// type, premultiplied, blend alpha, view space
    layer_info: [[u32; 4]; COMPUTE_MAX_LAYERS],
    post_transforms: [[f32; 4]; COMPUTE_MAX_LAYERS],
    params: [[f32; 4]; COMPUTE_MAX_LAYERS],
    /// clip space of the view to the layer's model space
    inv_mvps: [[[f32; 4]; 4]; COMPUTE_MAX_LAYERS],
}

/// Uniforms of the distortion and projection dispatches, std140
#[derive(Debug, Copy, Clone)]
#[repr(C)]
struct ComputeDistortionUbo {
    /// target viewport of each view
    views: [[u32; 4]; 2],
    /// grid resolution, first vertex of each view
    grid: [u32; 4],
    /// uv to tangent space of the target fov, for time-warp
    pre_transforms: [[f32; 4]; 2],
    post_transforms: [[f32; 4]; 2],
    vertex_rot: [[[f32; 4]; 2]; 2],
    timewarp: [[[f32; 4]; 4]; 2],
}

/// Per target image resources of the compute engine
struct ComputeTargetImage {
    image: vk::Image,
    view: vk::ImageView,
    clear_set: Descriptor,
    distortion_set: Descriptor,
}

/// Which work the compute engine records this frame
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ComputeWork {
    Clear,
    Layered,
    Projection,
    ProjectionTimewarp,
}

/// Composition and distortion through compute shaders
pub struct ComputeDistortion {
    cd_dev: Arc<Device>,
    cd_budget: u32,
    cd_clear: Pass,
    cd_layer: Pass,
    cd_distortion: Pass,
    cd_projection: Pass,
    cd_projection_timewarp: Pass,
    cd_mesh: DistortionMesh,
    cd_mesh_buf: (vk::Buffer, vk::DeviceMemory),
    cd_layer_ubos: Vec<(vk::Buffer, vk::DeviceMemory)>,
    cd_distortion_ubo: (vk::Buffer, vk::DeviceMemory),
    cd_clear_ubo: (vk::Buffer, vk::DeviceMemory),
    cd_layer_sets: Vec<Descriptor>,
    /// 2x view width by view height, written as unorm and read as sRGB
    cd_scratch: Option<ImageResources>,
    cd_scratch_storage_view: vk::ImageView,
    cd_scratch_sampled_view: vk::ImageView,
    cd_view_size: (u32, u32),
    cd_targets: Vec<ComputeTargetImage>,
    cd_config: Option<TargetConfig>,
    cd_final_layout: vk::ImageLayout,
    cd_work: ComputeWork,
}

impl ComputeDistortion {
    /// `sampler_budget` is the number of layer samplers the layer
    /// dispatch binds
    pub fn new(
        dev: Arc<Device>,
        cache: &PipelineCache,
        shaders: &ShaderBlobs,
        mesh: &DistortionMesh,
        sampler_budget: u32,
    ) -> Result<Self> {
        let budget = sampler_budget.clamp(1, COMPUTE_MAX_LAYERS as u32);
        let stage = vk::ShaderStageFlags::COMPUTE;

        let clear = Pass::new(
            dev.clone(),
            cache,
            &[
                LayoutBinding::new(0, vk::DescriptorType::STORAGE_IMAGE, 1, stage),
                LayoutBinding::new(1, vk::DescriptorType::UNIFORM_BUFFER, 1, stage),
            ],
            shaders.get(shader_names::CLEAR_COMP)?,
        )?;
        let mut layer = Pass::new(
            dev.clone(),
            cache,
            &[
                LayoutBinding::new(0, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, budget, stage),
                LayoutBinding::new(1, vk::DescriptorType::STORAGE_IMAGE, 1, stage),
                LayoutBinding::new(2, vk::DescriptorType::UNIFORM_BUFFER, 1, stage),
            ],
            shaders.get(shader_names::LAYER_COMP)?,
        )?;
        // distortion and both projection passes share one layout
        let distortion_bindings = [
            LayoutBinding::new(0, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 2, stage),
            LayoutBinding::new(1, vk::DescriptorType::STORAGE_IMAGE, 1, stage),
            LayoutBinding::new(2, vk::DescriptorType::STORAGE_BUFFER, 1, stage),
            LayoutBinding::new(3, vk::DescriptorType::UNIFORM_BUFFER, 1, stage),
        ];
        let distortion = Pass::new(
            dev.clone(),
            cache,
            &distortion_bindings,
            shaders.get(shader_names::DISTORTION_COMP)?,
        )?;
        let projection = Pass::new(
            dev.clone(),
            cache,
            &distortion_bindings,
            shaders.get(shader_names::PROJECTION_COMP)?,
        )?;
        let projection_timewarp = Pass::new(
            dev.clone(),
            cache,
            &distortion_bindings,
            shaders.get(shader_names::PROJECTION_TIMEWARP_COMP)?,
        )?;

        let layer_sets = vec![layer.alloc_descriptor()?, layer.alloc_descriptor()?];

        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let mesh_buf =
            dev.create_buffer(vk::BufferUsageFlags::STORAGE_BUFFER, mesh.vertices.as_slice())?;

        let mut ret = Self {
            cd_dev: dev.clone(),
            cd_budget: budget,
            cd_clear: clear,
            cd_layer: layer,
            cd_distortion: distortion,
            cd_projection: projection,
            cd_projection_timewarp: projection_timewarp,
            cd_mesh: mesh.clone(),
            cd_mesh_buf: mesh_buf,
            cd_layer_ubos: Vec::new(),
            cd_distortion_ubo: (vk::Buffer::null(), vk::DeviceMemory::null()),
            cd_clear_ubo: (vk::Buffer::null(), vk::DeviceMemory::null()),
            cd_layer_sets: layer_sets,
            cd_scratch: None,
            cd_scratch_storage_view: vk::ImageView::null(),
            cd_scratch_sampled_view: vk::ImageView::null(),
            cd_view_size: (0, 0),
            cd_targets: Vec::new(),
            cd_config: None,
            cd_final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
            cd_work: ComputeWork::Clear,
        };

        for _ in 0..2 {
            let ubo = dev.create_buffer_with_size(
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                host,
                std::mem::size_of::<ComputeLayerUbo>() as u64,
            )?;
            ret.cd_layer_ubos.push(ubo);
        }
        ret.cd_distortion_ubo = dev.create_buffer_with_size(
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            host,
            std::mem::size_of::<ComputeDistortionUbo>() as u64,
        )?;
        ret.cd_clear_ubo = dev.create_buffer(
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            &[background_color(BlendMode::Opaque)],
        )?;

        log::debug!("Created compute distortion with {} layer samplers", budget);
        Ok(ret)
    }

    pub fn sampler_budget(&self) -> u32 {
        self.cd_budget
    }

    fn destroy_scratch(&mut self) {
        unsafe {
            if self.cd_scratch_storage_view != vk::ImageView::null() {
                self.cd_dev
                    .dev
                    .destroy_image_view(self.cd_scratch_storage_view, None);
            }
            if self.cd_scratch_sampled_view != vk::ImageView::null() {
                self.cd_dev
                    .dev
                    .destroy_image_view(self.cd_scratch_sampled_view, None);
            }
        }
        self.cd_scratch_storage_view = vk::ImageView::null();
        self.cd_scratch_sampled_view = vk::ImageView::null();
        self.cd_scratch = None;
    }

    fn create_scratch(&mut self, view_size: (u32, u32)) -> Result<()> {
        if self.cd_scratch.is_some() && self.cd_view_size == view_size {
            return Ok(());
        }
        self.destroy_scratch();

        let mut info = ImageCreateInfo::new(
            view_size.0 * 2,
            view_size.1,
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::SAMPLED,
        );
        info.mutable_format = true;
        let scratch = ImageResources::allocate_local(&self.cd_dev, &info)?;

        self.cd_scratch_storage_view =
            create_target_view(&self.cd_dev.dev, scratch.image(), vk::Format::R8G8B8A8_UNORM)?;
        self.cd_scratch_sampled_view =
            create_target_view(&self.cd_dev.dev, scratch.image(), vk::Format::R8G8B8A8_SRGB)?;
        self.cd_scratch = Some(scratch);
        self.cd_view_size = view_size;
        Ok(())
    }

    /// Write the storage image and uniform bindings shared by all
    /// distortion sets
    fn write_distortion_set(&self, set: vk::DescriptorSet, sources: [vk::ImageView; 2], target: vk::ImageView, layout: vk::ImageLayout) {
        let img_info = [
            vk::DescriptorImageInfo {
                sampler: self.cd_dev.sampler(SamplerKind::ClampToBorderBlack),
                image_view: sources[0],
                image_layout: layout,
            },
            vk::DescriptorImageInfo {
                sampler: self.cd_dev.sampler(SamplerKind::ClampToBorderBlack),
                image_view: sources[1],
                image_layout: layout,
            },
        ];
        let target_info = [vk::DescriptorImageInfo {
            sampler: vk::Sampler::null(),
            image_view: target,
            image_layout: vk::ImageLayout::GENERAL,
        }];
        let mesh_info = [vk::DescriptorBufferInfo {
            buffer: self.cd_mesh_buf.0,
            offset: 0,
            range: vk::WHOLE_SIZE,
        }];
        let ubo_info = [vk::DescriptorBufferInfo {
            buffer: self.cd_distortion_ubo.0,
            offset: 0,
            range: std::mem::size_of::<ComputeDistortionUbo>() as u64,
        }];
        let writes = [
            vk::WriteDescriptorSet::builder()
                .dst_set(set)
                .dst_binding(0)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .image_info(&img_info)
                .build(),
            vk::WriteDescriptorSet::builder()
                .dst_set(set)
                .dst_binding(1)
                .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                .image_info(&target_info)
                .build(),
            vk::WriteDescriptorSet::builder()
                .dst_set(set)
                .dst_binding(2)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .buffer_info(&mesh_info)
                .build(),
            vk::WriteDescriptorSet::builder()
                .dst_set(set)
                .dst_binding(3)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .buffer_info(&ubo_info)
                .build(),
        ];
        unsafe { self.cd_dev.dev.update_descriptor_sets(&writes, &[]) };
    }

    fn distortion_ubo(&self, config: &TargetConfig, post_transforms: [[f32; 4]; 2]) -> ComputeDistortionUbo {
        let vp = |eye: usize| {
            let v = config.views[eye].viewport;
            [v.x, v.y, v.w, v.h]
        };
        let identity = math::mat4_to_array(&Matrix4::identity());

        ComputeDistortionUbo {
            views: [vp(0), vp(1)],
            grid: [
                self.cd_mesh.resolution,
                self.cd_mesh.vertex_offsets[0],
                self.cd_mesh.vertex_offsets[1],
                0,
            ],
            pre_transforms: [[1.0, 1.0, 0.0, 0.0]; 2],
            post_transforms: post_transforms,
            vertex_rot: [
                math::mat2_to_std140(&config.views[0].vertex_rot),
                math::mat2_to_std140(&config.views[1].vertex_rot),
            ],
            timewarp: [identity, identity],
        }
    }

    /// Fill both layer dispatches
    fn prepare_layers(&mut self, input: &DistortionInput) -> Result<()> {
        let scratch_view = self.cd_scratch_storage_view;
        let (w, h) = self.cd_view_size;
        let clear_color = background_color(input.frame.blend);

        for eye in 0..2 {
            let mut ubo = ComputeLayerUbo {
                view: [eye as u32 * w, w, h, 0],
                clear_color: clear_color,
                layer_info: [[0; 4]; COMPUTE_MAX_LAYERS],
                post_transforms: [[0.0; 4]; COMPUTE_MAX_LAYERS],
                params: [[0.0; 4]; COMPUTE_MAX_LAYERS],
                inv_mvps: [[[0.0; 4]; 4]; COMPUTE_MAX_LAYERS],
            };
            let mut images = Vec::new();

            for (i, layer) in input.frame.layers.iter().enumerate() {
                let ty = match input.plan.layer_types.get(i) {
                    Some(LayerType::Max) | None => continue,
                    Some(t) => *t,
                };
                if !layer.data.visibility().visible_to(eye) {
                    continue;
                }
                let img = match layer.color_image(eye) {
                    Some(img) => img,
                    None => continue,
                };
                let n = images.len();
                if n >= self.cd_budget as usize {
                    break;
                }

                let u = layer_ubo(layer, input.frame, eye);
                let inv_mvp = match &layer.data.kind {
                    LayerKind::Cube(_) | LayerKind::Equirect1(_) | LayerKind::Equirect2(_) => {
                        Matrix4::from(u.vp_inv)
                    }
                    _ => {
                        let vp = match layer.data.view_space() {
                            true => Matrix4::from(u.vp_eye),
                            false => Matrix4::from(u.vp_world),
                        };
                        (vp * Matrix4::from(u.model))
                            .invert()
                            .unwrap_or_else(Matrix4::identity)
                    }
                };

                ubo.layer_info[n] = [
                    ty as u32,
                    layer.data.premultiplied() as u32,
                    layer.data.blends_alpha() as u32,
                    layer.data.view_space() as u32,
                ];
                ubo.post_transforms[n] = u.post_transform;
                ubo.params[n] = u.params;
                ubo.inv_mvps[n] = math::mat4_to_array(&inv_mvp);
                images.push((img.view(layer.data.blends_alpha()), sampler_kind_for(ty)));
            }
            ubo.view[3] = images.len() as u32;

            let (buf, mem) = self.cd_layer_ubos[eye];
            self.cd_dev.update_memory(mem, 0, &[ubo])?;

            // Unused sampler slots still need a valid image
            let fill = images
                .get(0)
                .cloned()
                .unwrap_or((self.cd_scratch_sampled_view, SamplerKind::ClampToEdge));
            let img_info: Vec<vk::DescriptorImageInfo> = (0..self.cd_budget as usize)
                .map(|i| {
                    let (view, kind) = images.get(i).cloned().unwrap_or(fill);
                    vk::DescriptorImageInfo {
                        sampler: self.cd_dev.sampler(kind),
                        image_view: view,
                        image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    }
                })
                .collect();
            let storage_info = [vk::DescriptorImageInfo {
                sampler: vk::Sampler::null(),
                image_view: scratch_view,
                image_layout: vk::ImageLayout::GENERAL,
            }];
            let ubo_info = [vk::DescriptorBufferInfo {
                buffer: buf,
                offset: 0,
                range: std::mem::size_of::<ComputeLayerUbo>() as u64,
            }];
            let set = self.cd_layer_sets[eye].d_set;
            let writes = [
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(0)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .image_info(&img_info)
                    .build(),
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(1)
                    .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                    .image_info(&storage_info)
                    .build(),
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(2)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .buffer_info(&ubo_info)
                    .build(),
            ];
            unsafe { self.cd_dev.dev.update_descriptor_sets(&writes, &[]) };
        }

        Ok(())
    }

    fn image_barrier(
        &self,
        cbuf: vk::CommandBuffer,
        image: vk::Image,
        old: vk::ImageLayout,
        new: vk::ImageLayout,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
        dst_stage: vk::PipelineStageFlags,
    ) {
        let barrier = vk::ImageMemoryBarrier::builder()
            .old_layout(old)
            .new_layout(new)
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .image(image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            })
            .build();
        unsafe {
            self.cd_dev.dev.cmd_pipeline_barrier(
                cbuf,
                vk::PipelineStageFlags::TOP_OF_PIPE | vk::PipelineStageFlags::COMPUTE_SHADER,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
    }
}

impl DistortionEngine for ComputeDistortion {
    fn create_target_resources(
        &mut self,
        target: &dyn Target,
        config: &TargetConfig,
    ) -> Result<()> {
        self.destroy_target_resources();

        // The scratch image is sized by the largest view
        let w = config.views.iter().map(|v| v.viewport.w).max().unwrap_or(1).max(1);
        let h = config.views.iter().map(|v| v.viewport.h).max().unwrap_or(1).max(1);
        self.create_scratch((w, h))?;

        for image in target.images().iter() {
            let clear_set = self.cd_clear.alloc_descriptor()?;
            let distortion_set = self.cd_distortion.alloc_descriptor()?;

            let target_info = [vk::DescriptorImageInfo {
                sampler: vk::Sampler::null(),
                image_view: image.view,
                image_layout: vk::ImageLayout::GENERAL,
            }];
            let ubo_info = [vk::DescriptorBufferInfo {
                buffer: self.cd_clear_ubo.0,
                offset: 0,
                range: vk::WHOLE_SIZE,
            }];
            let writes = [
                vk::WriteDescriptorSet::builder()
                    .dst_set(clear_set.d_set)
                    .dst_binding(0)
                    .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                    .image_info(&target_info)
                    .build(),
                vk::WriteDescriptorSet::builder()
                    .dst_set(clear_set.d_set)
                    .dst_binding(1)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .buffer_info(&ubo_info)
                    .build(),
            ];
            unsafe { self.cd_dev.dev.update_descriptor_sets(&writes, &[]) };

            self.cd_targets.push(ComputeTargetImage {
                image: image.image,
                view: image.view,
                clear_set: clear_set,
                distortion_set: distortion_set,
            });
        }

        self.cd_final_layout = target.final_layout();
        self.cd_config = Some(*config);
        Ok(())
    }

    fn destroy_target_resources(&mut self) {
        self.cd_targets.clear();
        self.cd_config = None;
    }

    fn composites_layers(&self) -> bool {
        true
    }

    fn prepare(&mut self, input: &DistortionInput, index: u32) -> Result<()> {
        let config = self.cd_config.ok_or(StrataError::INVALID)?;
        let (target_view, set) = match self.cd_targets.get(index as usize) {
            Some(t) => (t.view, t.distortion_set.d_set),
            None => return Err(StrataError::INVALID),
        };
        self.cd_work = ComputeWork::Clear;

        let work = match input.plan.mode {
            RenderMode::FastProjection { timewarp } => {
                let layer = input.fast_path_layer().ok_or(StrataError::INVALID)?;
                let mut sources = [vk::ImageView::null(); 2];
                let mut posts = [[0.0; 4]; 2];
                for eye in 0..2 {
                    let img = layer.color_image(eye).ok_or(StrataError::INVALID)?;
                    sources[eye] = img.view(layer.data.blends_alpha());
                    posts[eye] = projection_post_transform(layer, eye)?;
                }

                let mut ubo = self.distortion_ubo(&config, posts);
                if timewarp {
                    let views = match &layer.data.kind {
                        LayerKind::StereoProjection { l, r }
                        | LayerKind::StereoProjectionDepth { l, r, .. } => [*l, *r],
                        _ => return Err(StrataError::INVALID),
                    };
                    for eye in 0..2 {
                        ubo.pre_transforms[eye] = math::uv_to_tanangle(&input.frame.views[eye].fov);
                        ubo.timewarp[eye] = math::mat4_to_array(&math::timewarp_matrix(
                            &views[eye].fov,
                            &views[eye].pose,
                            &input.fresh_poses[eye],
                        ));
                    }
                }
                self.cd_dev.update_memory(self.cd_distortion_ubo.1, 0, &[ubo])?;
                self.write_distortion_set(
                    set,
                    sources,
                    target_view,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                );

                match timewarp {
                    true => ComputeWork::ProjectionTimewarp,
                    false => ComputeWork::Projection,
                }
            }
            RenderMode::Layered if input.plan.visible_count() == 0 => ComputeWork::Clear,
            RenderMode::Layered => {
                self.prepare_layers(input)?;

                // each eye reads its half of the scratch image
                let ubo = self.distortion_ubo(&config, [[0.0, 0.0, 0.5, 1.0], [0.5, 0.0, 0.5, 1.0]]);
                self.cd_dev.update_memory(self.cd_distortion_ubo.1, 0, &[ubo])?;
                let scratch = self.cd_scratch_sampled_view;
                self.write_distortion_set(set, [scratch, scratch], target_view, vk::ImageLayout::GENERAL);
                ComputeWork::Layered
            }
        };

        self.cd_work = work;
        Ok(())
    }

    fn prepare_clear(&mut self, _index: u32) {
        self.cd_work = ComputeWork::Clear;
    }

    fn record(&self, cbuf: vk::CommandBuffer, index: u32) {
        let (config, target) = match (self.cd_config, self.cd_targets.get(index as usize)) {
            (Some(c), Some(t)) => (c, t),
            _ => return,
        };
        let views: Vec<(u32, u32)> = config
            .views
            .iter()
            .map(|v| (v.viewport.w, v.viewport.h))
            .collect();
        let target_groups = math::dispatch_dims(&views);
        let whole_target = (
            (config.extent.width + WORKGROUP_SIZE - 1) / WORKGROUP_SIZE,
            (config.extent.height + WORKGROUP_SIZE - 1) / WORKGROUP_SIZE,
            1,
        );

        let image = target.image;
        self.image_barrier(
            cbuf,
            image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::GENERAL,
            vk::AccessFlags::empty(),
            vk::AccessFlags::SHADER_WRITE,
            vk::PipelineStageFlags::COMPUTE_SHADER,
        );

        match self.cd_work {
            ComputeWork::Clear => {
                self.cd_clear.dispatch(cbuf, target.clear_set.d_set, whole_target);
            }
            ComputeWork::Projection => {
                self.cd_projection
                    .dispatch(cbuf, target.distortion_set.d_set, target_groups);
            }
            ComputeWork::ProjectionTimewarp => {
                self.cd_projection_timewarp
                    .dispatch(cbuf, target.distortion_set.d_set, target_groups);
            }
            ComputeWork::Layered => {
                if let Some(scratch) = self.cd_scratch.as_ref() {
                    self.image_barrier(
                        cbuf,
                        scratch.image(),
                        vk::ImageLayout::UNDEFINED,
                        vk::ImageLayout::GENERAL,
                        vk::AccessFlags::empty(),
                        vk::AccessFlags::SHADER_WRITE,
                        vk::PipelineStageFlags::COMPUTE_SHADER,
                    );
                    let layer_groups = math::dispatch_dims(&[self.cd_view_size]);
                    for eye in 0..2 {
                        self.cd_layer
                            .dispatch(cbuf, self.cd_layer_sets[eye].d_set, layer_groups);
                    }
                    // layer writes must land before distortion samples them
                    self.image_barrier(
                        cbuf,
                        scratch.image(),
                        vk::ImageLayout::GENERAL,
                        vk::ImageLayout::GENERAL,
                        vk::AccessFlags::SHADER_WRITE,
                        vk::AccessFlags::SHADER_READ,
                        vk::PipelineStageFlags::COMPUTE_SHADER,
                    );
                }
                self.cd_distortion
                    .dispatch(cbuf, target.distortion_set.d_set, target_groups);
            }
        }

        self.image_barrier(
            cbuf,
            image,
            vk::ImageLayout::GENERAL,
            self.cd_final_layout,
            vk::AccessFlags::SHADER_WRITE,
            vk::AccessFlags::MEMORY_READ,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        );
    }

    fn wait_stage(&self) -> vk::PipelineStageFlags {
        vk::PipelineStageFlags::COMPUTE_SHADER
    }
}

impl Drop for ComputeDistortion {
    fn drop(&mut self) {
        self.destroy_target_resources();
        self.destroy_scratch();
        for (buf, mem) in self.cd_layer_ubos.drain(..) {
            self.cd_dev.destroy_buffer(buf, mem);
        }
        self.cd_dev
            .destroy_buffer(self.cd_distortion_ubo.0, self.cd_distortion_ubo.1);
        self.cd_dev.destroy_buffer(self.cd_clear_ubo.0, self.cd_clear_ubo.1);
        self.cd_dev.destroy_buffer(self.cd_mesh_buf.0, self.cd_mesh_buf.1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_ubos_are_std140_sized() {
        assert_eq!(std::mem::size_of::<MeshUbo>(), 48);
        assert_eq!(
            std::mem::size_of::<ComputeDistortionUbo>(),
            2 * 16 + 16 + 2 * 16 + 2 * 16 + 2 * 32 + 2 * 64
        );
        assert_eq!(
            std::mem::size_of::<ComputeLayerUbo>(),
            32 + COMPUTE_MAX_LAYERS * (16 * 3 + 64)
        );
    }
}
