/// Strata tests
///
/// Most of these run without a GPU. The ones that need a Vulkan device
/// are ignored by default, run them with `--ignored` on a machine that
/// has one.
use crate as st;
use st::hmd::DISTORTION_VERTEX_STRIDE;
use st::{
    plan_frame, CompositeLayer, DistortionMesh, EyeVisibility, Fov, HeadDevice, HmdView,
    LayerData, LayerKind, LayerType, PlanParams, Pose, ProjectionView, QuadData, RenderMode,
    SampledImage, Viewport,
};

use cgmath::Matrix2;
use std::sync::Arc;

/// A head device with identity distortion
struct FlatHmd;

impl HeadDevice for FlatHmd {
    fn name(&self) -> &str {
        "flat"
    }

    fn screen_size(&self) -> (u32, u32) {
        (2560, 1440)
    }

    fn views(&self) -> [HmdView; 2] {
        let view = |x| HmdView {
            viewport: Viewport {
                x: x,
                y: 0,
                w: 1280,
                h: 1440,
            },
            display: (1280, 1440),
            rot: Matrix2::new(1.0, 0.0, 0.0, 1.0),
            fov: Fov::new(-0.8, 0.8, 0.8, -0.8),
        };
        [view(0), view(1280)]
    }

    fn nominal_frame_interval_ns(&self) -> i64 {
        11_111_111
    }

    fn head_pose(&self, _at_ns: i64) -> Pose {
        Pose::identity()
    }

    fn eye_poses(&self) -> [Pose; 2] {
        [Pose::identity(), Pose::identity()]
    }

    fn compute_distortion(&self, _view: usize, u: f32, v: f32) -> [[f32; 2]; 3] {
        [[u, v], [u, v], [u, v]]
    }
}

fn image() -> SampledImage {
    SampledImage {
        width: 256,
        height: 256,
        ..Default::default()
    }
}

fn quad() -> CompositeLayer {
    CompositeLayer::new(
        LayerData::new(LayerKind::Quad(QuadData {
            visibility: EyeVisibility::Both,
            size: [1.0, 1.0],
            ..Default::default()
        })),
        vec![image()],
    )
}

#[test]
fn distortion_mesh_covers_both_views() {
    let mesh = DistortionMesh::generate(&FlatHmd, 4);

    assert_eq!(mesh.resolution, 4);
    // 5x5 vertices per view
    assert_eq!(mesh.vertex_count(), 50);
    assert_eq!(mesh.vertices.len(), 50 * DISTORTION_VERTEX_STRIDE);
    assert_eq!(mesh.vertex_offsets, [0, 25]);
    // two triangles per cell
    assert_eq!(mesh.index_counts, [96, 96]);
    assert_eq!(mesh.index_offsets, [0, 96]);

    // indices are local to each view
    assert!(mesh.indices.iter().all(|i| *i < 25));

    // corners land on the edges of clip space, identity uvs
    let first = &mesh.vertices[0..DISTORTION_VERTEX_STRIDE];
    assert_eq!(first, &[-1.0, -1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
    let last = &mesh.vertices[(24 * DISTORTION_VERTEX_STRIDE)..(25 * DISTORTION_VERTEX_STRIDE)];
    assert_eq!(last, &[1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0]);
}

#[test]
fn zero_resolution_mesh_has_one_cell() {
    let mesh = DistortionMesh::generate(&FlatHmd, 0);
    assert_eq!(mesh.resolution, 1);
    assert_eq!(mesh.vertex_count(), 8);
    assert_eq!(mesh.index_counts, [6, 6]);
}

#[test]
fn layers_over_budget_are_dropped() {
    // twenty quads with a budget of sixteen samplers
    let layers: Vec<CompositeLayer> = (0..20).map(|_| quad()).collect();
    let params = PlanParams {
        use_compute: true,
        use_timewarp: false,
        sampler_budget: 16,
    };
    let plan = plan_frame(&layers, &params);

    assert_eq!(plan.mode, RenderMode::Layered);
    assert_eq!(plan.visible_count(), 16);
    assert!(plan.layer_types[..16].iter().all(|t| *t == LayerType::Quad));
    assert!(plan.layer_types[16..].iter().all(|t| *t == LayerType::Max));
}

#[test]
fn budget_applies_to_graphics_path() {
    let layers: Vec<CompositeLayer> = (0..3).map(|_| quad()).collect();
    let params = PlanParams {
        use_compute: false,
        use_timewarp: false,
        sampler_budget: 2,
    };
    let plan = plan_frame(&layers, &params);
    assert_eq!(
        plan.layer_types,
        vec![LayerType::Quad, LayerType::Quad, LayerType::Max]
    );
}

#[test]
fn projection_missing_an_image_is_skipped() {
    let layer = CompositeLayer::new(
        LayerData::new(LayerKind::StereoProjection {
            l: ProjectionView::default(),
            r: ProjectionView::default(),
        }),
        vec![image()],
    );
    let params = PlanParams {
        use_compute: false,
        use_timewarp: false,
        sampler_budget: 16,
    };
    let plan = plan_frame(&[layer], &params);
    assert_eq!(plan.layer_types, vec![LayerType::Max]);
    assert_eq!(plan.mode, RenderMode::Layered);
}

#[test]
fn fast_path_skips_invisible_layers() {
    let proj = CompositeLayer::new(
        LayerData::new(LayerKind::StereoProjection {
            l: ProjectionView::default(),
            r: ProjectionView::default(),
        }),
        vec![image(), image()],
    );
    let params = PlanParams {
        use_compute: true,
        use_timewarp: true,
        sampler_budget: 1,
    };
    // the quad doesn't fit the budget, leaving one projection layer
    let plan = plan_frame(&[proj, quad()], &params);
    assert_eq!(plan.mode, RenderMode::FastProjection { timewarp: true });
    assert_eq!(plan.fast_path_layer(), Some(0));
}

#[test]
fn target_config_follows_head_device() {
    let hmd: Arc<dyn HeadDevice> = Arc::new(FlatHmd);
    let config = st::TargetConfig::new(
        &hmd.views(),
        hmd.screen_size(),
        st::vk::Extent2D {
            width: 1280,
            height: 720,
        },
        st::vk::SurfaceTransformFlagsKHR::IDENTITY,
    );

    assert_eq!(
        config.views[1].viewport,
        Viewport {
            x: 640,
            y: 0,
            w: 640,
            h: 720
        }
    );
}

/// Create a device and run a few frames through a headless target
#[test]
#[ignore = "needs a Vulkan device"]
fn headless_target_round_robin() {
    use st::Target;

    let info = st::CreateInfo::builder().validation(false).build();
    let inst = Arc::new(st::Instance::new(&info).unwrap());
    let dev = Arc::new(st::Device::new(inst, &info).unwrap());

    let mut target = st::HeadlessTarget::new(dev.clone(), 11_111_111);
    assert!(target.check_ready());
    target
        .create_images(&st::TargetCreateInfo::new(640, 480))
        .unwrap();
    assert!(target.has_images());
    assert_eq!(target.images().len(), 3);

    let first = target.acquire().unwrap();
    target.present(first, 0, 0).unwrap();
    let second = target.acquire().unwrap();
    assert_ne!(first, second);
    target.present(second, 0, 0).unwrap();
}
