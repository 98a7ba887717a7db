// Head mounted display description
//
// The compositor doesn't talk to device drivers. Anything that can
// describe its panels and lenses and report a head pose implements
// HeadDevice.
use cgmath::Matrix2;

use crate::layers::{BlendMode, Fov, Pose};

/// A rect in physical panel pixels
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Viewport {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

/// The description of one eye
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct HmdView {
    /// Where on the panel this eye is scanned out
    pub viewport: Viewport,
    /// The recommended per-eye render size
    pub display: (u32, u32),
    /// Rotation applied to the distortion mesh for this eye
    pub rot: Matrix2<f32>,
    pub fov: Fov,
}

pub trait HeadDevice: Send + Sync {
    fn name(&self) -> &str;

    /// Size of the whole panel in pixels
    fn screen_size(&self) -> (u32, u32);

    fn views(&self) -> [HmdView; 2];

    fn nominal_frame_interval_ns(&self) -> i64;

    /// The head pose in tracking space predicted for `at_ns`
    fn head_pose(&self, at_ns: i64) -> Pose;

    /// The pose of each eye relative to the head
    fn eye_poses(&self) -> [Pose; 2];

    /// Map a [0,1] panel coordinate of `view` to the [0,1] coordinates
    /// to sample for the red, green, and blue channels.
    fn compute_distortion(&self, view: usize, u: f32, v: f32) -> [[f32; 2]; 3];

    fn blend_modes(&self) -> &[BlendMode] {
        &[BlendMode::Opaque]
    }
}

/// Floats per distortion vertex: position xy then uv for r, g and b
pub const DISTORTION_VERTEX_STRIDE: usize = 8;

/// A precomputed distortion mesh covering both views
///
/// Positions are in [-1,1] normalized device coordinates of the view's
/// viewport. Drawn as an indexed triangle list.
#[derive(Debug, Clone, PartialEq)]
pub struct DistortionMesh {
    /// Grid cells along each side of one view
    pub resolution: u32,
    pub vertices: Vec<f32>,
    pub indices: Vec<u32>,
    /// First index of each view
    pub index_offsets: [u32; 2],
    pub index_counts: [u32; 2],
    /// Added to the indices of each view
    pub vertex_offsets: [u32; 2],
}

impl DistortionMesh {
    /// Sample the head device's distortion over a `resolution` grid
    pub fn generate(hmd: &dyn HeadDevice, resolution: u32) -> Self {
        let res = resolution.max(1);
        let row = res + 1;

        let mut vertices = Vec::new();
        let mut indices = Vec::new();
        let mut index_offsets = [0; 2];
        let mut index_counts = [0; 2];
        let mut vertex_offsets = [0; 2];

        for view in 0..2 {
            vertex_offsets[view] = (vertices.len() / DISTORTION_VERTEX_STRIDE) as u32;
            index_offsets[view] = indices.len() as u32;

            for y in 0..row {
                for x in 0..row {
                    let u = x as f32 / res as f32;
                    let v = y as f32 / res as f32;
                    let uvs = hmd.compute_distortion(view, u, v);

                    vertices.push(u * 2.0 - 1.0);
                    vertices.push(v * 2.0 - 1.0);
                    for c in uvs.iter() {
                        vertices.push(c[0]);
                        vertices.push(c[1]);
                    }
                }
            }

            for y in 0..res {
                for x in 0..res {
                    let i = y * row + x;
                    indices.extend_from_slice(&[i, i + 1, i + row, i + 1, i + row + 1, i + row]);
                }
            }

            index_counts[view] = indices.len() as u32 - index_offsets[view];
        }

        Self {
            resolution: res,
            vertices: vertices,
            indices: indices,
            index_offsets: index_offsets,
            index_counts: index_counts,
            vertex_offsets: vertex_offsets,
        }
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len() / DISTORTION_VERTEX_STRIDE
    }
}
