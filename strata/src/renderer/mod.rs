// The compositing renderer
//
// A frame is composited in two stages. The layer renderer draws all
// layers into one scratch image per eye, then the distortion engine
// warps those into the target. When a frame is a single projection
// layer the first stage is skipped and the distortion engine samples
// the client's images directly.
//
// Deciding what to draw is separate from recording it: `plan_frame` is
// pure and decides the render mode and which layers are dropped.
pub mod distortion;
pub mod layer_renderer;
mod vulkan;

pub use vulkan::{RendererCreateInfo, VulkanRenderer};

use ash::vk;
use cgmath::Matrix2;

use crate::display::{transform_rotates_90, Target, TargetCreateInfo};
use crate::hmd::{HmdView, Viewport};
use crate::image::SampledImage;
use crate::layers::{BlendMode, EyeVisibility, Fov, LayerData, LayerKind, LayerType, Pose};
use crate::math;
use crate::Result;
use utils::log;

/// One layer ready to be composited
#[derive(Debug, Clone, PartialEq)]
pub struct CompositeLayer {
    pub data: LayerData,
    /// Views of every referenced swapchain image, in the order
    /// left, right, left depth, right depth for projection layers
    pub images: Vec<SampledImage>,
}

impl CompositeLayer {
    pub fn new(data: LayerData, images: Vec<SampledImage>) -> Self {
        Self {
            data: data,
            images: images,
        }
    }

    /// The color image sampled for `eye`
    pub fn color_image(&self, eye: usize) -> Option<&SampledImage> {
        match self.data.layer_type().is_projection() {
            true => self.images.get(eye),
            false => self.images.get(0),
        }
    }
}

/// Where one eye is this frame
#[derive(Debug, Default, Copy, Clone, PartialEq)]
pub struct ViewState {
    pub fov: Fov,
    /// Eye pose in the base space
    pub world_pose: Pose,
    /// Eye pose relative to the head, used for view space layers
    pub eye_pose: Pose,
}

/// Everything needed to composite one frame
#[derive(Debug, Clone, PartialEq)]
pub struct FrameComposition {
    pub frame_id: i64,
    pub predicted_display_time: i64,
    /// Layers in compositing order, first is drawn first
    pub layers: Vec<CompositeLayer>,
    pub views: [ViewState; 2],
    pub blend: BlendMode,
}

impl FrameComposition {
    pub fn new(frame_id: i64, predicted_display_time: i64) -> Self {
        Self {
            frame_id: frame_id,
            predicted_display_time: predicted_display_time,
            layers: Vec::new(),
            views: [ViewState::default(); 2],
            blend: BlendMode::Opaque,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RenderMode {
    /// Both stages run
    Layered,
    /// One projection layer goes straight to distortion
    FastProjection { timewarp: bool },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PlanParams {
    pub use_compute: bool,
    pub use_timewarp: bool,
    /// The most layers one frame may sample from
    pub sampler_budget: u32,
}

/// The decisions made for one frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramePlan {
    pub mode: RenderMode,
    /// The type each layer is drawn as, `LayerType::Max` is skipped
    pub layer_types: Vec<LayerType>,
}

impl FramePlan {
    pub fn visible_count(&self) -> usize {
        self.layer_types
            .iter()
            .filter(|t| **t != LayerType::Max)
            .count()
    }

    /// Index of the layer used by the fast path
    pub fn fast_path_layer(&self) -> Option<usize> {
        match self.mode {
            RenderMode::FastProjection { .. } => {
                self.layer_types.iter().position(|t| *t != LayerType::Max)
            }
            RenderMode::Layered => None,
        }
    }
}

/// Decide how to render a frame
///
/// Layers beyond the sampler budget, degenerate cylinders and layers
/// missing images are tagged `Max`. Once the budget is used up every
/// later layer is dropped too, layers are never partially composited.
pub fn plan_frame(layers: &[CompositeLayer], params: &PlanParams) -> FramePlan {
    let budget = params.sampler_budget as usize;
    let mut layer_types = Vec::with_capacity(layers.len());
    let mut used = 0;

    for (i, layer) in layers.iter().enumerate() {
        let ty = layer.data.layer_type();

        let drawable = match &layer.data.kind {
            LayerKind::Cylinder(c) => math::cylinder_is_visible(c),
            _ => true,
        };
        if !drawable {
            log::debug!("Layer {} is a degenerate cylinder, skipping", i);
            layer_types.push(LayerType::Max);
            continue;
        }

        let needed = match ty.is_projection() {
            true => 2,
            false => 1,
        };
        if layer.images.len() < needed {
            log::warn!("Layer {} has {} images, needs {}", i, layer.images.len(), needed);
            layer_types.push(LayerType::Max);
            continue;
        }

        if used >= budget {
            log::warn!(
                "Layer {} exceeds the sampler budget of {}, skipping it",
                i,
                budget
            );
            layer_types.push(LayerType::Max);
            continue;
        }

        used += 1;
        layer_types.push(ty);
    }

    // Layers hidden from both eyes don't count towards the fast path
    let visible: Vec<usize> = layer_types
        .iter()
        .enumerate()
        .filter(|(i, t)| {
            **t != LayerType::Max && layers[*i].data.visibility() != EyeVisibility::None
        })
        .map(|(i, _)| i)
        .collect();

    let mode = match visible.as_slice() {
        [only] if layer_types[*only].is_projection() => RenderMode::FastProjection {
            timewarp: params.use_compute && params.use_timewarp,
        },
        _ => RenderMode::Layered,
    };

    FramePlan {
        mode: mode,
        layer_types: layer_types,
    }
}

/// Placement of one eye in the target
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct TargetView {
    /// Viewport in target pixels
    pub viewport: Viewport,
    /// Rotation applied to the distortion vertices
    pub vertex_rot: Matrix2<f32>,
}

/// How the views map onto the current target images
///
/// Computed once when the target is (re)created.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct TargetConfig {
    pub extent: vk::Extent2D,
    /// The display engine wants a 90 degree rotated image
    pub pre_rotate: bool,
    pub views: [TargetView; 2],
}

impl TargetConfig {
    pub fn new(
        hmd_views: &[HmdView; 2],
        screen: (u32, u32),
        extent: vk::Extent2D,
        transform: vk::SurfaceTransformFlagsKHR,
    ) -> Self {
        let pre_rotate = transform_rotates_90(transform);
        let (screen_w, screen_h) = match pre_rotate {
            true => (screen.1, screen.0),
            false => (screen.0, screen.1),
        };

        let scale_x = extent.width as f32 / screen_w.max(1) as f32;
        let scale_y = extent.height as f32 / screen_h.max(1) as f32;

        let make_view = |v: &HmdView| {
            let vp = match pre_rotate {
                true => Viewport {
                    x: v.viewport.y,
                    y: v.viewport.x,
                    w: v.viewport.h,
                    h: v.viewport.w,
                },
                false => v.viewport,
            };

            TargetView {
                viewport: Viewport {
                    x: (vp.x as f32 * scale_x) as u32,
                    y: (vp.y as f32 * scale_y) as u32,
                    w: (vp.w as f32 * scale_x) as u32,
                    h: (vp.h as f32 * scale_y) as u32,
                },
                vertex_rot: match pre_rotate {
                    true => v.rot * math::rotation_90_cw(),
                    false => v.rot,
                },
            }
        };

        Self {
            extent: extent,
            pre_rotate: pre_rotate,
            views: [make_view(&hmd_views[0]), make_view(&hmd_views[1])],
        }
    }
}

/// What happened while drawing a frame
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DrawReport {
    pub mode: RenderMode,
    pub layers_drawn: usize,
    /// Work was handed to the GPU and the target image's fence is armed
    pub submitted: bool,
}

/// The GPU half of the native compositor
pub trait Renderer: Send {
    /// Adjust the target parameters to what this renderer writes with
    fn adjust_target_info(&self, info: &mut TargetCreateInfo);

    /// Build everything that depends on the target's images
    fn create_renderings(&mut self, target: &dyn Target) -> Result<TargetConfig>;

    /// Drop everything that depends on the target's images
    fn close_renderings(&mut self);

    fn has_renderings(&self) -> bool;

    /// Parameters for `plan_frame`
    fn plan_params(&self) -> PlanParams;

    /// Record and submit the frame into target image `index`
    fn draw(
        &mut self,
        target: &dyn Target,
        index: u32,
        frame: &FrameComposition,
        plan: &FramePlan,
    ) -> Result<DrawReport>;

    /// Wait for the work submitted for target image `index`
    fn wait_for_fence(&mut self, index: u32) -> Result<()>;

    /// vkDeviceWaitIdle under the queue lock
    fn wait_idle(&self) -> Result<()>;

    /// GPU duration of the last completed frame
    fn gpu_duration_ns(&mut self) -> Option<i64>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{CylinderData, ProjectionView, QuadData};

    fn image() -> SampledImage {
        SampledImage {
            width: 1024,
            height: 1024,
            ..Default::default()
        }
    }

    fn projection() -> CompositeLayer {
        CompositeLayer::new(
            LayerData::new(LayerKind::StereoProjection {
                l: ProjectionView::default(),
                r: ProjectionView::default(),
            }),
            vec![image(), image()],
        )
    }

    fn quad(visibility: EyeVisibility) -> CompositeLayer {
        CompositeLayer::new(
            LayerData::new(LayerKind::Quad(QuadData {
                visibility: visibility,
                size: [1.0, 1.0],
                ..Default::default()
            })),
            vec![image()],
        )
    }

    fn params(budget: u32) -> PlanParams {
        PlanParams {
            use_compute: false,
            use_timewarp: false,
            sampler_budget: budget,
        }
    }

    #[test]
    fn single_projection_takes_fast_path() {
        let plan = plan_frame(&[projection()], &params(16));
        assert_eq!(plan.mode, RenderMode::FastProjection { timewarp: false });
        assert_eq!(plan.fast_path_layer(), Some(0));

        let compute = PlanParams {
            use_compute: true,
            use_timewarp: true,
            sampler_budget: 16,
        };
        let plan = plan_frame(&[projection()], &compute);
        assert_eq!(plan.mode, RenderMode::FastProjection { timewarp: true });
    }

    #[test]
    fn projection_and_quad_are_layered() {
        let plan = plan_frame(&[projection(), quad(EyeVisibility::Both)], &params(16));
        assert_eq!(plan.mode, RenderMode::Layered);
        assert_eq!(plan.visible_count(), 2);
        assert_eq!(plan.fast_path_layer(), None);
    }

    #[test]
    fn hidden_quad_keeps_fast_path() {
        let plan = plan_frame(&[projection(), quad(EyeVisibility::None)], &params(16));
        assert!(matches!(plan.mode, RenderMode::FastProjection { .. }));
        // still drawn, the quad is culled per eye
        assert_eq!(plan.layer_types[1], LayerType::Quad);
    }

    #[test]
    fn degenerate_cylinder_is_skipped() {
        let cyl = CompositeLayer::new(
            LayerData::new(LayerKind::Cylinder(CylinderData {
                radius: 0.0,
                central_angle: 1.0,
                aspect_ratio: 1.0,
                ..Default::default()
            })),
            vec![image()],
        );
        let plan = plan_frame(&[cyl, quad(EyeVisibility::Both)], &params(16));
        assert_eq!(plan.layer_types, vec![LayerType::Max, LayerType::Quad]);
    }

    #[test]
    fn no_layers_is_layered() {
        let plan = plan_frame(&[], &params(16));
        assert_eq!(plan.mode, RenderMode::Layered);
        assert_eq!(plan.visible_count(), 0);
    }

    #[test]
    fn target_config_without_rotation() {
        let view = |x| HmdView {
            viewport: Viewport { x: x, y: 0, w: 1440, h: 1600 },
            display: (1440, 1600),
            rot: Matrix2::new(1.0, 0.0, 0.0, 1.0),
            fov: Fov::default(),
        };
        let views = [view(0), view(1440)];
        let extent = vk::Extent2D { width: 1440, height: 800 };

        let config = TargetConfig::new(
            &views,
            (2880, 1600),
            extent,
            vk::SurfaceTransformFlagsKHR::IDENTITY,
        );
        assert!(!config.pre_rotate);
        assert_eq!(config.views[1].viewport, Viewport { x: 720, y: 0, w: 720, h: 800 });
        assert_eq!(config.views[0].vertex_rot, views[0].rot);
    }

    #[test]
    fn target_config_rotated() {
        let view = |y| HmdView {
            viewport: Viewport { x: 0, y: y, w: 1600, h: 1440 },
            display: (1440, 1600),
            rot: Matrix2::new(1.0, 0.0, 0.0, 1.0),
            fov: Fov::default(),
        };
        let views = [view(0), view(1440)];
        let extent = vk::Extent2D { width: 2880, height: 1600 };

        let config = TargetConfig::new(
            &views,
            (1600, 2880),
            extent,
            vk::SurfaceTransformFlagsKHR::ROTATE_90,
        );
        assert!(config.pre_rotate);
        assert_eq!(config.views[1].viewport, Viewport { x: 1440, y: 0, w: 1440, h: 1600 });
        assert_eq!(config.views[0].vertex_rot, math::rotation_90_cw());
    }
}
