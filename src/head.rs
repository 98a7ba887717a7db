// A simulated head mounted display
//
// Used when no real device driver is attached, and by the tests. The
// head sits still at the tracking origin and the lenses don't distort.
use crate::config::{Config, FovOverride};
use cgmath::Matrix2;
use strata::{BlendMode, Fov, HeadDevice, HmdView, Pose, Viewport};

/// Distance between the eyes in metres
pub const DEFAULT_IPD: f32 = 0.063;
const PANEL_WIDTH: u32 = 1440;
const PANEL_HEIGHT: u32 = 1600;
/// 45 degrees to each side
const HALF_FOV: f32 = std::f32::consts::FRAC_PI_4;

pub struct SimulatedHmd {
    sh_views: [HmdView; 2],
    sh_ipd: f32,
    sh_origin: [f32; 3],
    sh_interval: i64,
    /// Radial distortion coefficient, zero keeps panel coordinates
    sh_k1: f32,
}

impl SimulatedHmd {
    pub fn new(frame_interval_ns: i64) -> Self {
        let view = |x| HmdView {
            viewport: Viewport {
                x: x,
                y: 0,
                w: PANEL_WIDTH,
                h: PANEL_HEIGHT,
            },
            display: (PANEL_WIDTH, PANEL_HEIGHT),
            rot: Matrix2::new(1.0, 0.0, 0.0, 1.0),
            fov: Fov::new(-HALF_FOV, HALF_FOV, HALF_FOV, -HALF_FOV),
        };

        Self {
            sh_views: [view(0), view(PANEL_WIDTH)],
            sh_ipd: DEFAULT_IPD,
            sh_origin: [0.0; 3],
            sh_interval: frame_interval_ns,
            sh_k1: 0.0,
        }
    }

    /// Create one with the overrides from `config` applied
    pub fn from_config(config: &Config) -> Self {
        let mut ret = Self::new(config.nominal_frame_interval_ns);
        ret.override_left_fov(&config.fov_override);
        ret.sh_origin = config.tracking_origin_offset;
        ret
    }

    fn override_left_fov(&mut self, over: &FovOverride) {
        let fov = &mut self.sh_views[0].fov;
        if let Some(a) = over.left {
            fov.angle_left = a;
        }
        if let Some(a) = over.right {
            fov.angle_right = a;
        }
        if let Some(a) = over.up {
            fov.angle_up = a;
        }
        if let Some(a) = over.down {
            fov.angle_down = a;
        }
    }

    pub fn set_ipd(&mut self, ipd: f32) {
        self.sh_ipd = ipd;
    }

    pub fn set_k1(&mut self, k1: f32) {
        self.sh_k1 = k1;
    }
}

impl HeadDevice for SimulatedHmd {
    fn name(&self) -> &str {
        "Simulated HMD"
    }

    fn screen_size(&self) -> (u32, u32) {
        (PANEL_WIDTH * 2, PANEL_HEIGHT)
    }

    fn views(&self) -> [HmdView; 2] {
        self.sh_views
    }

    fn nominal_frame_interval_ns(&self) -> i64 {
        self.sh_interval
    }

    fn head_pose(&self, _at_ns: i64) -> Pose {
        Pose {
            orientation: [0.0, 0.0, 0.0, 1.0],
            position: self.sh_origin,
        }
    }

    fn eye_poses(&self) -> [Pose; 2] {
        let half = self.sh_ipd / 2.0;
        let eye = |x| Pose {
            orientation: [0.0, 0.0, 0.0, 1.0],
            position: [x, 0.0, 0.0],
        };
        [eye(-half), eye(half)]
    }

    fn compute_distortion(&self, _view: usize, u: f32, v: f32) -> [[f32; 2]; 3] {
        // r^2 from the lens center
        let (x, y) = (u - 0.5, v - 0.5);
        let scale = 1.0 + self.sh_k1 * (x * x + y * y);
        let uv = [0.5 + x * scale, 0.5 + y * scale];
        [uv, uv, uv]
    }

    fn blend_modes(&self) -> &[BlendMode] {
        &[BlendMode::Opaque, BlendMode::Additive, BlendMode::AlphaBlend]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eyes_are_one_ipd_apart() {
        let hmd = SimulatedHmd::new(16_666_667);
        let eyes = hmd.eye_poses();
        let dist = eyes[1].position[0] - eyes[0].position[0];
        assert!((dist - DEFAULT_IPD).abs() < 1e-6);
        assert_eq!(hmd.views()[1].viewport.x, 1440);
        assert_eq!(hmd.screen_size(), (2880, 1600));
    }

    #[test]
    fn no_distortion_by_default() {
        let hmd = SimulatedHmd::new(16_666_667);
        assert_eq!(hmd.compute_distortion(0, 0.25, 0.75), [[0.25, 0.75]; 3]);
    }

    #[test]
    fn config_overrides() {
        let mut config = Config::default();
        config.fov_override.left = Some(-0.5);
        config.tracking_origin_offset = [0.0, 1.6, 0.0];
        let hmd = SimulatedHmd::from_config(&config);

        assert_eq!(hmd.views()[0].fov.angle_left, -0.5);
        // the right eye is untouched
        assert_eq!(hmd.views()[1].fov.angle_left, -HALF_FOV);
        assert_eq!(hmd.head_pose(0).position, [0.0, 1.6, 0.0]);
    }
}
