// Stage one of composition
//
// Every layer is drawn as textured geometry into one scratch
// framebuffer per eye. The distortion engine samples those afterwards.
use ash::vk;
use cgmath::{Matrix4, Rotation, SquareMatrix};

use super::{CompositeLayer, FrameComposition, FramePlan};
use crate::descpool::{Descriptor, DescriptorSystem, LayoutBinding};
use crate::device::{Device, SamplerKind};
use crate::image::{ImageCreateInfo, ImageResources, SampledImage};
use crate::layers::{BlendMode, LayerKind, LayerType, Pose};
use crate::math::{self, Vertex, QUAD_VERTICES};
use crate::pipelines::{
    create_color_pass, create_graphics_pipeline, create_pipeline_layout, shader_names, BlendState,
    GraphicsPipelineDesc, PipelineCache, ShaderBlobs,
};
use crate::{Result, StrataError};
use utils::log;

use std::collections::HashMap;
use std::sync::Arc;

/// Segments used to tessellate a cylinder layer
const CYLINDER_SUBDIVISIONS: u32 = 64;
/// Distinct cylinder angles we keep meshes for
const MAX_CACHED_CYLINDERS: usize = 16;
const SCRATCH_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;

/// Uniforms of one layer as seen by one eye
///
/// Laid out for std140.
#[derive(Debug, Copy, Clone)]
#[repr(C)]
pub(crate) struct LayerUbo {
    pub(crate) model: [[f32; 4]; 4],
    pub(crate) vp_world: [[f32; 4]; 4],
    pub(crate) vp_eye: [[f32; 4]; 4],
    /// Inverse view projection for the fullscreen layer kinds
    pub(crate) vp_inv: [[f32; 4]; 4],
    /// offset and extent of the sub image in uv space
    pub(crate) post_transform: [f32; 4],
    /// cylinder: radius, angle, aspect. equirect1: scale, bias.
    /// equirect2: radius, horizontal, upper, lower angle.
    pub(crate) params: [f32; 4],
    pub(crate) flip_y: u32,
    pub(crate) layer_type: u32,
    pub(crate) view_space: u32,
    _pad: u32,
}

/// Which shader pair draws a layer type
fn shaders_for(ty: LayerType) -> Option<(&'static str, &'static str)> {
    match ty {
        LayerType::StereoProjection | LayerType::StereoProjectionDepth => Some((
            shader_names::LAYER_PROJECTION_VERT,
            shader_names::LAYER_PROJECTION_FRAG,
        )),
        LayerType::Quad => Some((shader_names::LAYER_QUAD_VERT, shader_names::LAYER_QUAD_FRAG)),
        LayerType::Cylinder => Some((
            shader_names::LAYER_CYLINDER_VERT,
            shader_names::LAYER_CYLINDER_FRAG,
        )),
        LayerType::Cube => Some((shader_names::LAYER_CUBE_VERT, shader_names::LAYER_CUBE_FRAG)),
        LayerType::Equirect1 => Some((
            shader_names::LAYER_EQUIRECT1_VERT,
            shader_names::LAYER_EQUIRECT1_FRAG,
        )),
        LayerType::Equirect2 => Some((
            shader_names::LAYER_EQUIRECT2_VERT,
            shader_names::LAYER_EQUIRECT2_FRAG,
        )),
        LayerType::Max => None,
    }
}

/// The address mode used when sampling a layer's color
pub fn sampler_kind_for(ty: LayerType) -> SamplerKind {
    match ty {
        LayerType::StereoProjection | LayerType::StereoProjectionDepth => {
            SamplerKind::ClampToBorderBlack
        }
        // edge clamping keeps the border color from bleeding in. A
        // cylinder is a bent quad, its edges bleed the same way.
        LayerType::Quad | LayerType::Cylinder => SamplerKind::ClampToEdge,
        _ => SamplerKind::Repeat,
    }
}

/// The clear color behind every layer
pub fn background_color(blend: BlendMode) -> [f32; 4] {
    match blend {
        BlendMode::Opaque => [0.0, 0.0, 0.0, 1.0],
        _ => [0.0, 0.0, 0.0, 0.0],
    }
}

struct MeshBuffer {
    buf: vk::Buffer,
    mem: vk::DeviceMemory,
    count: u32,
}

/// The uniform buffer and set one layer uses for one eye
struct EyeSlot {
    ubo: vk::Buffer,
    mem: vk::DeviceMemory,
    desc: Descriptor,
}

/// One recorded draw
#[derive(Copy, Clone)]
struct Draw {
    slot: usize,
    pipeline: vk::Pipeline,
    vbuf: vk::Buffer,
    count: u32,
}

/// Fill the uniforms of one layer for one eye
pub(crate) fn layer_ubo(layer: &CompositeLayer, frame: &FrameComposition, eye: usize) -> LayerUbo {
    let view = &frame.views[eye];
    let proj = math::projection_from_fov(&view.fov);
    let vp_world = proj * math::view_from_pose(&view.world_pose);
    let vp_eye = proj * math::view_from_pose(&view.eye_pose);
    let view_space = layer.data.view_space();

    let sub = layer.data.sub_image(eye);
    let (w, h) = layer
        .color_image(eye)
        .map(|i| (i.width, i.height))
        .unwrap_or((1, 1));
    let post = math::post_transform(&sub.rect, w, h, layer.data.flip_y);

    // Fullscreen kinds only care about the direction of each pixel
    let fullscreen_inv = |pose: &Pose| {
        let eye_pose = match view_space {
            true => &view.eye_pose,
            false => &view.world_pose,
        };
        let rot_view = Matrix4::from(eye_pose.rotation().invert());
        (proj * rot_view * Matrix4::from(pose.rotation()))
            .invert()
            .unwrap_or_else(Matrix4::identity)
    };

    let mut vp_inv = Matrix4::identity();
    let mut params = [0.0; 4];
    let model = match &layer.data.kind {
        LayerKind::StereoProjection { l, r } | LayerKind::StereoProjectionDepth { l, r, .. } => {
            let pv = match eye {
                0 => l,
                _ => r,
            };
            math::projection_quad_model(&pv.fov, &pv.pose)
        }
        LayerKind::Quad(q) => math::quad_model_for_eye(&q.pose, q.size, q.visibility.visible_to(eye)),
        LayerKind::Cylinder(c) => {
            params = [c.radius, c.central_angle, c.aspect_ratio, 0.0];
            math::cylinder_model(c)
        }
        LayerKind::Cube(c) => {
            vp_inv = fullscreen_inv(&c.pose);
            Matrix4::identity()
        }
        LayerKind::Equirect1(e) => {
            vp_inv = fullscreen_inv(&e.pose);
            params = [e.scale[0], e.scale[1], e.bias[0], e.bias[1]];
            Matrix4::identity()
        }
        LayerKind::Equirect2(e) => {
            vp_inv = fullscreen_inv(&e.pose);
            params = [
                e.radius,
                e.central_horizontal_angle,
                e.upper_vertical_angle,
                e.lower_vertical_angle,
            ];
            Matrix4::identity()
        }
    };

    LayerUbo {
        model: math::mat4_to_array(&model),
        vp_world: math::mat4_to_array(&vp_world),
        vp_eye: math::mat4_to_array(&vp_eye),
        vp_inv: math::mat4_to_array(&vp_inv),
        post_transform: [post.r_pos.0, post.r_pos.1, post.r_size.0, post.r_size.1],
        params: params,
        flip_y: layer.data.flip_y as u32,
        layer_type: layer.data.layer_type() as u32,
        view_space: view_space as u32,
        _pad: 0,
    }
}

pub struct LayerRenderer {
    lr_dev: Arc<Device>,
    lr_extent: vk::Extent2D,
    lr_images: Vec<ImageResources>,
    lr_pass: vk::RenderPass,
    lr_framebuffers: Vec<vk::Framebuffer>,
    lr_descs: DescriptorSystem,
    lr_pipeline_layout: vk::PipelineLayout,
    /// Keyed by layer type and premultiplied alpha
    lr_pipelines: HashMap<(LayerType, bool), vk::Pipeline>,
    lr_quad: MeshBuffer,
    /// Keyed by the bits of the central angle
    lr_cylinders: HashMap<u32, MeshBuffer>,
    /// Per layer index, one slot per eye
    lr_slots: Vec<[EyeSlot; 2]>,
    /// The draws prepared for the current frame, per eye
    lr_draws: [Vec<Draw>; 2],
    lr_clear: [f32; 4],
}

impl LayerRenderer {
    /// Create the scratch framebuffers and every layer pipeline
    pub fn new(
        dev: Arc<Device>,
        cache: &PipelineCache,
        shaders: &ShaderBlobs,
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let info = ImageCreateInfo::new(
            extent.width,
            extent.height,
            SCRATCH_FORMAT,
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
        );
        let images = vec![
            ImageResources::allocate_local(&dev, &info)?,
            ImageResources::allocate_local(&dev, &info)?,
        ];

        let descs = DescriptorSystem::new(
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

        let (quad_buf, quad_mem) =
            dev.create_buffer(vk::BufferUsageFlags::VERTEX_BUFFER, &QUAD_VERTICES)?;

        // From here on Drop cleans up after us
        let mut ret = Self {
            lr_dev: dev.clone(),
            lr_extent: extent,
            lr_images: images,
            lr_pass: vk::RenderPass::null(),
            lr_framebuffers: Vec::new(),
            lr_descs: descs,
            lr_pipeline_layout: vk::PipelineLayout::null(),
            lr_pipelines: HashMap::new(),
            lr_quad: MeshBuffer {
                buf: quad_buf,
                mem: quad_mem,
                count: QUAD_VERTICES.len() as u32,
            },
            lr_cylinders: HashMap::new(),
            lr_slots: Vec::new(),
            lr_draws: [Vec::new(), Vec::new()],
            lr_clear: background_color(BlendMode::Opaque),
        };

        ret.lr_pass = create_color_pass(
            &dev,
            SCRATCH_FORMAT,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )?;
        ret.lr_pipeline_layout = create_pipeline_layout(&dev, ret.lr_descs.layout())?;

        for image in ret.lr_images.iter() {
            let view = image.sampled(0).ok_or(StrataError::GPU_ERROR)?.view_alpha;
            let attachments = [view];
            let fb_info = vk::FramebufferCreateInfo::builder()
                .render_pass(ret.lr_pass)
                .attachments(&attachments)
                .width(extent.width)
                .height(extent.height)
                .layers(1);
            let fb = unsafe {
                dev.dev.create_framebuffer(&fb_info, None).map_err(|e| {
                    log::error!("Could not create layer framebuffer: {:?}", e);
                    StrataError::GPU_ERROR
                })?
            };
            ret.lr_framebuffers.push(fb);
        }

        let attributes = [
            (0, vk::Format::R32G32B32_SFLOAT, 0),
            (1, vk::Format::R32G32_SFLOAT, 12),
        ];
        for ty in [
            LayerType::StereoProjection,
            LayerType::Quad,
            LayerType::Cylinder,
            LayerType::Cube,
            LayerType::Equirect1,
            LayerType::Equirect2,
        ] {
            let (vert, frag) = match shaders_for(ty) {
                Some(s) => s,
                None => continue,
            };
            for premultiplied in [true, false] {
                let desc = GraphicsPipelineDesc {
                    vert: shaders.get(vert)?,
                    frag: shaders.get(frag)?,
                    vertex_stride: std::mem::size_of::<Vertex>() as u32,
                    attributes: &attributes,
                    blend: BlendState::for_layer(premultiplied),
                    // only quads rely on culling to hide them from one eye
                    cull_back: ty == LayerType::Quad,
                };
                let pipe =
                    create_graphics_pipeline(&dev, cache, ret.lr_pipeline_layout, ret.lr_pass, &desc)?;
                ret.lr_pipelines.insert((ty, premultiplied), pipe);
            }
        }

        log::debug!(
            "Created layer renderer with {}x{} scratch images",
            extent.width,
            extent.height
        );
        Ok(ret)
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.lr_extent
    }

    /// The scratch framebuffer of each eye, for the distortion pass
    pub fn eye_images(&self) -> Result<[SampledImage; 2]> {
        Ok([
            self.lr_images[0].sampled(0).ok_or(StrataError::INVALID)?,
            self.lr_images[1].sampled(0).ok_or(StrataError::INVALID)?,
        ])
    }

    fn pipeline_for(&self, ty: LayerType, premultiplied: bool) -> Option<vk::Pipeline> {
        let key = match ty {
            LayerType::StereoProjectionDepth => LayerType::StereoProjection,
            t => t,
        };
        self.lr_pipelines.get(&(key, premultiplied)).cloned()
    }

    fn make_slot(dev: &Device, descs: &mut DescriptorSystem) -> Result<EyeSlot> {
        let (ubo, mem) = dev.create_buffer_with_size(
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            std::mem::size_of::<LayerUbo>() as u64,
        )?;
        let desc = match descs.alloc_descriptor() {
            Ok(d) => d,
            Err(e) => {
                dev.destroy_buffer(ubo, mem);
                return Err(e);
            }
        };
        Ok(EyeSlot {
            ubo: ubo,
            mem: mem,
            desc: desc,
        })
    }

    fn ensure_slots(&mut self, count: usize) -> Result<()> {
        while self.lr_slots.len() < count {
            let left = Self::make_slot(&self.lr_dev, &mut self.lr_descs)?;
            let right = match Self::make_slot(&self.lr_dev, &mut self.lr_descs) {
                Ok(r) => r,
                Err(e) => {
                    self.lr_dev.destroy_buffer(left.ubo, left.mem);
                    return Err(e);
                }
            };
            self.lr_slots.push([left, right]);
        }
        Ok(())
    }

    /// Get the strip for a cylinder angle, generating it if needed
    fn cylinder_mesh(&mut self, central_angle: f32) -> Result<(vk::Buffer, u32)> {
        let key = central_angle.to_bits();
        if let Some(m) = self.lr_cylinders.get(&key) {
            return Ok((m.buf, m.count));
        }

        if self.lr_cylinders.len() >= MAX_CACHED_CYLINDERS {
            // Old meshes may still be referenced by in flight frames,
            // prepare is only called once those are done.
            for (_, m) in self.lr_cylinders.drain() {
                self.lr_dev.destroy_buffer(m.buf, m.mem);
            }
        }

        let strip = math::cylinder_strip(central_angle, CYLINDER_SUBDIVISIONS);
        let (buf, mem) = self
            .lr_dev
            .create_buffer(vk::BufferUsageFlags::VERTEX_BUFFER, strip.as_slice())?;
        let count = strip.len() as u32;
        self.lr_cylinders.insert(
            key,
            MeshBuffer {
                buf: buf,
                mem: mem,
                count: count,
            },
        );
        Ok((buf, count))
    }

    /// Update uniforms and descriptors for this frame
    ///
    /// Must be called before recording, and only once the previous
    /// frame's commands are done with these resources. Returns the number
    /// of layers that will be drawn.
    pub fn prepare(&mut self, frame: &FrameComposition, plan: &FramePlan) -> Result<usize> {
        self.lr_draws = [Vec::new(), Vec::new()];
        self.lr_clear = background_color(frame.blend);
        self.ensure_slots(frame.layers.len())?;

        let mut drawn = 0;
        for (i, layer) in frame.layers.iter().enumerate() {
            let ty = match plan.layer_types.get(i) {
                Some(LayerType::Max) | None => continue,
                Some(t) => *t,
            };
            let pipeline = match self.pipeline_for(ty, layer.data.premultiplied()) {
                Some(p) => p,
                None => continue,
            };
            let (vbuf, count) = match &layer.data.kind {
                LayerKind::Cylinder(c) => self.cylinder_mesh(c.central_angle)?,
                _ => (self.lr_quad.buf, self.lr_quad.count),
            };
            let visibility = layer.data.visibility();

            for eye in 0..2 {
                // Hidden quads are still drawn, culling removes them
                if ty != LayerType::Quad && !visibility.visible_to(eye) {
                    continue;
                }
                let image = match layer.color_image(eye) {
                    Some(img) => img,
                    None => continue,
                };

                let slot = &self.lr_slots[i][eye];
                let ubo = layer_ubo(layer, frame, eye);
                self.lr_dev.update_memory(slot.mem, 0, &[ubo])?;

                let buf_info = [vk::DescriptorBufferInfo {
                    buffer: slot.ubo,
                    offset: 0,
                    range: std::mem::size_of::<LayerUbo>() as u64,
                }];
                let img_info = [vk::DescriptorImageInfo {
                    sampler: self.lr_dev.sampler(sampler_kind_for(ty)),
                    image_view: image.view(layer.data.blends_alpha()),
                    image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                }];
                let writes = [
                    vk::WriteDescriptorSet::builder()
                        .dst_set(slot.desc.d_set)
                        .dst_binding(0)
                        .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                        .buffer_info(&buf_info)
                        .build(),
                    vk::WriteDescriptorSet::builder()
                        .dst_set(slot.desc.d_set)
                        .dst_binding(1)
                        .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                        .image_info(&img_info)
                        .build(),
                ];
                unsafe { self.lr_dev.dev.update_descriptor_sets(&writes, &[]) };

                self.lr_draws[eye].push(Draw {
                    slot: i,
                    pipeline: pipeline,
                    vbuf: vbuf,
                    count: count,
                });
            }
            drawn += 1;
        }

        Ok(drawn)
    }

    /// Drop whatever `prepare` set up, leaving only the clear
    pub fn clear_draws(&mut self) {
        self.lr_draws = [Vec::new(), Vec::new()];
    }

    /// Record both eye passes into `cbuf`
    pub fn record(&self, cbuf: vk::CommandBuffer) {
        let dev = &self.lr_dev.dev;
        let clear_values = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: self.lr_clear,
            },
        }];
        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: self.lr_extent,
        };
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: self.lr_extent.width as f32,
            height: self.lr_extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };

        for eye in 0..2 {
            let info = vk::RenderPassBeginInfo::builder()
                .render_pass(self.lr_pass)
                .framebuffer(self.lr_framebuffers[eye])
                .render_area(render_area)
                .clear_values(&clear_values);

            unsafe {
                dev.cmd_begin_render_pass(cbuf, &info, vk::SubpassContents::INLINE);
                dev.cmd_set_viewport(cbuf, 0, &[viewport]);
                dev.cmd_set_scissor(cbuf, 0, &[render_area]);

                for draw in self.lr_draws[eye].iter() {
                    let set = self.lr_slots[draw.slot][eye].desc.d_set;
                    dev.cmd_bind_pipeline(cbuf, vk::PipelineBindPoint::GRAPHICS, draw.pipeline);
                    dev.cmd_bind_descriptor_sets(
                        cbuf,
                        vk::PipelineBindPoint::GRAPHICS,
                        self.lr_pipeline_layout,
                        0,
                        &[set],
                        &[],
                    );
                    dev.cmd_bind_vertex_buffers(cbuf, 0, &[draw.vbuf], &[0]);
                    dev.cmd_draw(cbuf, draw.count, 1, 0, 0);
                }

                dev.cmd_end_render_pass(cbuf);
            }
        }
    }
}

impl Drop for LayerRenderer {
    fn drop(&mut self) {
        let dev = &self.lr_dev;
        unsafe {
            for (_, p) in self.lr_pipelines.drain() {
                dev.dev.destroy_pipeline(p, None);
            }
            for fb in self.lr_framebuffers.drain(..) {
                dev.dev.destroy_framebuffer(fb, None);
            }
            dev.dev.destroy_pipeline_layout(self.lr_pipeline_layout, None);
            dev.dev.destroy_render_pass(self.lr_pass, None);
        }
        for slots in self.lr_slots.drain(..) {
            for s in slots.iter() {
                dev.destroy_buffer(s.ubo, s.mem);
            }
        }
        for (_, m) in self.lr_cylinders.drain() {
            dev.destroy_buffer(m.buf, m.mem);
        }
        dev.destroy_buffer(self.lr_quad.buf, self.lr_quad.mem);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ubo_is_std140_sized() {
        // four mat4, two vec4, four uints
        assert_eq!(std::mem::size_of::<LayerUbo>(), 4 * 64 + 2 * 16 + 16);
    }

    #[test]
    fn samplers_per_kind() {
        assert_eq!(
            sampler_kind_for(LayerType::StereoProjection),
            SamplerKind::ClampToBorderBlack
        );
        assert_eq!(sampler_kind_for(LayerType::Quad), SamplerKind::ClampToEdge);
        assert_eq!(sampler_kind_for(LayerType::Cylinder), SamplerKind::ClampToEdge);
        assert_eq!(sampler_kind_for(LayerType::Equirect2), SamplerKind::Repeat);
        assert_eq!(sampler_kind_for(LayerType::Cube), SamplerKind::Repeat);
    }

    #[test]
    fn every_drawable_kind_has_shaders() {
        for ty in [
            LayerType::StereoProjection,
            LayerType::StereoProjectionDepth,
            LayerType::Quad,
            LayerType::Cylinder,
            LayerType::Cube,
            LayerType::Equirect1,
            LayerType::Equirect2,
        ] {
            assert!(shaders_for(ty).is_some());
        }
        assert!(shaders_for(LayerType::Max).is_none());
    }

    #[test]
    fn background_is_transparent_when_blending() {
        assert_eq!(background_color(BlendMode::Opaque)[3], 1.0);
        assert_eq!(background_color(BlendMode::Additive)[3], 0.0);
    }
}
