// View, projection and layer geometry helpers
//
// Everything here is plain cgmath so that it can be tested without a
// GPU. Matrices follow the Vulkan clip space convention: y points down
// and depth goes from 0 to 1.
use cgmath::{Matrix2, Matrix4, Quaternion, Rotation, SquareMatrix, Vector3};

use crate::layers::{CylinderData, Fov, Pose};
use utils::region::Rect;

pub const NEAR_PLANE: f32 = 0.001;
pub const FAR_PLANE: f32 = 100.0;

/// One vertex of the layer quad and cylinder meshes
#[derive(Debug, Copy, Clone, PartialEq)]
#[repr(C)]
pub struct Vertex {
    pub pos: [f32; 3],
    pub uv: [f32; 2],
}

/// A unit quad centered on the origin, two triangles
pub const QUAD_VERTICES: [Vertex; 6] = [
    Vertex { pos: [-0.5, -0.5, 0.0], uv: [0.0, 1.0] },
    Vertex { pos: [0.5, -0.5, 0.0], uv: [1.0, 1.0] },
    Vertex { pos: [0.5, 0.5, 0.0], uv: [1.0, 0.0] },
    Vertex { pos: [0.5, 0.5, 0.0], uv: [1.0, 0.0] },
    Vertex { pos: [-0.5, 0.5, 0.0], uv: [0.0, 0.0] },
    Vertex { pos: [-0.5, -0.5, 0.0], uv: [0.0, 1.0] },
];

/// Rotates the distortion mesh when the display is scanned out sideways
pub fn rotation_90_cw() -> Matrix2<f32> {
    // cgmath is column major
    Matrix2::new(0.0, -1.0, 1.0, 0.0)
}

/// Asymmetric frustum for one eye
///
/// Uses the NEAR_PLANE/FAR_PLANE clip distances.
pub fn projection_from_fov(fov: &Fov) -> Matrix4<f32> {
    let tan_left = fov.angle_left.tan();
    let tan_right = fov.angle_right.tan();
    let tan_down = fov.angle_down.tan();
    let tan_up = fov.angle_up.tan();

    let tan_width = tan_right - tan_left;
    // y is down in Vulkan clip space
    let tan_height = tan_down - tan_up;

    let a11 = 2.0 / tan_width;
    let a22 = 2.0 / tan_height;
    let a31 = (tan_right + tan_left) / tan_width;
    let a32 = (tan_up + tan_down) / tan_height;
    let a33 = -FAR_PLANE / (FAR_PLANE - NEAR_PLANE);
    let a43 = -(FAR_PLANE * NEAR_PLANE) / (FAR_PLANE - NEAR_PLANE);

    #[rustfmt::skip]
    let ret = Matrix4::new(
        a11, 0.0, 0.0, 0.0,
        0.0, a22, 0.0, 0.0,
        a31, a32, a33, -1.0,
        0.0, 0.0, a43, 0.0,
    );
    ret
}

/// The rigid transform of a pose, as a matrix
pub fn pose_matrix(pose: &Pose) -> Matrix4<f32> {
    Matrix4::from_translation(pose.translation()) * Matrix4::from(pose.rotation())
}

/// The view matrix of something placed at `pose`
pub fn view_from_pose(pose: &Pose) -> Matrix4<f32> {
    pose_matrix(pose)
        .invert()
        .unwrap_or_else(Matrix4::identity)
}

/// Compose two poses, `a` applied after `b`
pub fn pose_multiply(a: &Pose, b: &Pose) -> Pose {
    let rot = a.rotation() * b.rotation();
    let pos = a.rotation().rotate_vector(b.translation()) + a.translation();
    Pose::from_cgmath(rot, pos)
}

/// Model matrix of a quad of `size` meters at `pose`
pub fn quad_model(pose: &Pose, size: [f32; 2]) -> Matrix4<f32> {
    pose_matrix(pose) * Matrix4::from_nonuniform_scale(size[0], size[1], 1.0)
}

/// Model matrix of a quad layer as seen by one eye
///
/// For an eye that must not see the layer the quad is mirrored, which
/// turns its front face away and lets back face culling drop it.
pub fn quad_model_for_eye(pose: &Pose, size: [f32; 2], visible: bool) -> Matrix4<f32> {
    match visible {
        true => quad_model(pose, size),
        false => quad_model(pose, size) * Matrix4::from_nonuniform_scale(-1.0, 1.0, 1.0),
    }
}

/// Model matrix placing the unit quad where a projection layer's image
/// plane is, one meter in front of the layer's pose
pub fn projection_quad_model(fov: &Fov, pose: &Pose) -> Matrix4<f32> {
    let tan_left = fov.angle_left.tan();
    let tan_right = fov.angle_right.tan();
    let tan_down = fov.angle_down.tan();
    let tan_up = fov.angle_up.tan();

    let center = Vector3::new((tan_left + tan_right) / 2.0, (tan_up + tan_down) / 2.0, -1.0);
    pose_matrix(pose)
        * Matrix4::from_translation(center)
        * Matrix4::from_nonuniform_scale(tan_right - tan_left, tan_up - tan_down, 1.0)
}

/// Cylinders with no radius or a degenerate aspect can't be drawn
pub fn cylinder_is_visible(c: &CylinderData) -> bool {
    c.radius > 0.0
        && c.radius.is_finite()
        && c.aspect_ratio.is_finite()
        && c.aspect_ratio > 0.0
        && c.central_angle > 0.0
}

/// Height of the cylinder section in meters
pub fn cylinder_height(c: &CylinderData) -> f32 {
    c.radius * c.central_angle / c.aspect_ratio
}

/// Model matrix for a cylinder strip generated by `cylinder_strip`
pub fn cylinder_model(c: &CylinderData) -> Matrix4<f32> {
    pose_matrix(&c.pose) * Matrix4::from_nonuniform_scale(c.radius, cylinder_height(c), c.radius)
}

/// Vertex strip of a unit radius, unit height cylinder section
///
/// The section is centered on -Z and spans `central_angle` radians.
/// Drawn as a triangle list.
pub fn cylinder_strip(central_angle: f32, subdivisions: u32) -> Vec<Vertex> {
    let subdivisions = subdivisions.max(1);
    let mut ret = Vec::with_capacity(subdivisions as usize * 6);

    let column = |i: u32| {
        let t = i as f32 / subdivisions as f32;
        let angle = -central_angle / 2.0 + central_angle * t;
        (angle.sin(), -angle.cos(), t)
    };

    for i in 0..subdivisions {
        let (x0, z0, u0) = column(i);
        let (x1, z1, u1) = column(i + 1);

        let bl = Vertex { pos: [x0, -0.5, z0], uv: [u0, 1.0] };
        let br = Vertex { pos: [x1, -0.5, z1], uv: [u1, 1.0] };
        let tr = Vertex { pos: [x1, 0.5, z1], uv: [u1, 0.0] };
        let tl = Vertex { pos: [x0, 0.5, z0], uv: [u0, 0.0] };

        ret.extend_from_slice(&[bl, br, tr, tr, tl, bl]);
    }

    ret
}

/// Normalized sampling window of a sub image
///
/// With `flip_y` the window starts at the bottom and has a negative
/// height, which inverts the image vertically when sampled.
pub fn post_transform(rect: &Rect<i32>, width: u32, height: u32, flip_y: bool) -> Rect<f32> {
    let mut ret = rect.normalize(width, height);

    if flip_y {
        ret.r_pos.1 += ret.r_size.1;
        ret.r_size.1 = -ret.r_size.1;
    }

    ret
}

/// Scale and offset from [0,1] uv to tangent space for `fov`
///
/// Returns (scale_x, scale_y, offset_x, offset_y).
pub fn uv_to_tanangle(fov: &Fov) -> [f32; 4] {
    let tan_left = fov.angle_left.tan();
    let tan_right = fov.angle_right.tan();
    let tan_down = fov.angle_down.tan();
    let tan_up = fov.angle_up.tan();

    let tan_width = tan_right - tan_left;
    let tan_height = tan_up - tan_down;

    let offset_x = ((tan_right + tan_left) - tan_width) / 2.0;
    let offset_y = (-(tan_up + tan_down) - tan_height) / 2.0;

    [tan_width, tan_height, offset_x, offset_y]
}

/// Reprojection from the freshly sampled eye orientation to the one the
/// client rendered with
///
/// Takes a direction in the new eye space and returns the clip space
/// position it had in the client's image.
pub fn timewarp_matrix(src_fov: &Fov, src_pose: &Pose, new_pose: &Pose) -> Matrix4<f32> {
    let src_rot: Quaternion<f32> = src_pose.rotation();
    let new_rot: Quaternion<f32> = new_pose.rotation();

    let src_inv = Matrix4::from(src_rot.invert());
    projection_from_fov(src_fov) * src_inv * Matrix4::from(new_rot)
}

/// Workgroup counts for the compute distortion, 8x8 local size with one
/// layer of work per view
pub fn dispatch_dims(views: &[(u32, u32)]) -> (u32, u32, u32) {
    let w = views.iter().map(|v| v.0).max().unwrap_or(0);
    let h = views.iter().map(|v| v.1).max().unwrap_or(0);

    ((w + 7) / 8, (h + 7) / 8, views.len() as u32)
}

pub fn mat4_to_array(m: &Matrix4<f32>) -> [[f32; 4]; 4] {
    (*m).into()
}

/// A mat2 laid out as std140 columns
pub fn mat2_to_std140(m: &Matrix2<f32>) -> [[f32; 4]; 2] {
    [[m.x.x, m.x.y, 0.0, 0.0], [m.y.x, m.y.y, 0.0, 0.0]]
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgmath::{Rad, Rotation3, Vector4};

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-4
    }

    #[test]
    fn symmetric_projection() {
        let fov = Fov::new(-0.7, 0.7, 0.7, -0.7);
        let p = projection_from_fov(&fov);

        // a point straight ahead lands in the center
        let v = p * Vector4::new(0.0, 0.0, -1.0, 1.0);
        assert!(approx(v.x / v.w, 0.0));
        assert!(approx(v.y / v.w, 0.0));

        // depth is in [0,1] between the planes
        let near = p * Vector4::new(0.0, 0.0, -NEAR_PLANE, 1.0);
        let far = p * Vector4::new(0.0, 0.0, -FAR_PLANE, 1.0);
        assert!(approx(near.z / near.w, 0.0));
        assert!(approx(far.z / far.w, 1.0));

        // up in view space is negative y in clip space
        let up = p * Vector4::new(0.0, 0.5, -1.0, 1.0);
        assert!(up.y / up.w < 0.0);
    }

    #[test]
    fn flip_y_inverts_window() {
        let rect = Rect::new(0, 0, 512, 256);
        let plain = post_transform(&rect, 512, 512, false);
        assert_eq!(plain, Rect::new(0.0, 0.0, 1.0, 0.5));

        let flipped = post_transform(&rect, 512, 512, true);
        assert_eq!(flipped, Rect::new(0.0, 0.5, 1.0, -0.5));
    }

    #[test]
    fn tanangle_covers_fov() {
        let fov = Fov::new(-0.7, 0.7, 0.7, -0.7);
        let t = uv_to_tanangle(&fov);
        let tan = 0.7f32.tan();

        assert!(approx(t[0], 2.0 * tan));
        assert!(approx(t[1], 2.0 * tan));
        // uv 0 maps to the left edge, uv 1 to the right edge
        assert!(approx(t[2], -tan));
        assert!(approx(0.0 * t[0] + t[2], -tan));
        assert!(approx(1.0 * t[0] + t[2], tan));
    }

    #[test]
    fn timewarp_without_motion_is_projection() {
        let fov = Fov::new(-0.5, 0.6, 0.55, -0.45);
        let pose = Pose::from_cgmath(
            Quaternion::from(cgmath::Euler::new(Rad(0.1), Rad(0.2), Rad(0.0))),
            Vector3::new(0.0, 1.6, 0.0),
        );
        let tw = timewarp_matrix(&fov, &pose, &pose);
        let p = projection_from_fov(&fov);

        let a = mat4_to_array(&tw);
        let b = mat4_to_array(&p);
        for c in 0..4 {
            for r in 0..4 {
                assert!(approx(a[c][r], b[c][r]));
            }
        }
    }

    #[test]
    fn dispatch_rounds_up() {
        assert_eq!(dispatch_dims(&[(1440, 1600), (1440, 1601)]), (180, 201, 2));
        assert_eq!(dispatch_dims(&[(1, 1)]), (1, 1, 1));
    }

    #[test]
    fn cylinder_visibility() {
        let mut c = CylinderData {
            radius: 1.0,
            central_angle: 1.0,
            aspect_ratio: 2.0,
            ..Default::default()
        };
        assert!(cylinder_is_visible(&c));
        assert!(approx(cylinder_height(&c), 0.5));

        c.aspect_ratio = f32::INFINITY;
        assert!(!cylinder_is_visible(&c));
        c.aspect_ratio = 2.0;
        c.radius = 0.0;
        assert!(!cylinder_is_visible(&c));
    }

    #[test]
    fn strip_spans_angle() {
        let strip = cylinder_strip(std::f32::consts::FRAC_PI_2, 4);
        assert_eq!(strip.len(), 24);
        let first = strip[0];
        assert!(approx(first.pos[0], -(std::f32::consts::FRAC_PI_4).sin()));
        assert!(approx(first.uv[0], 0.0));
    }

    #[test]
    fn pose_composition() {
        let a = Pose::from_cgmath(
            Quaternion::from_angle_y(Rad(std::f32::consts::FRAC_PI_2)),
            Vector3::new(0.0, 1.0, 0.0),
        );
        let b = Pose::from_cgmath(Quaternion::new(1.0, 0.0, 0.0, 0.0), Vector3::new(0.0, 0.0, -1.0));
        let c = pose_multiply(&a, &b);
        // -Z rotated a quarter turn about Y becomes -X
        assert!(approx(c.position[0], -1.0));
        assert!(approx(c.position[1], 1.0));
        assert!(approx(c.position[2], 0.0));
    }

    #[test]
    fn rotation_matrix() {
        let r = rotation_90_cw();
        let v = r * cgmath::Vector2::new(1.0, 0.0);
        assert!(approx(v.x, 0.0));
        assert!(approx(v.y, -1.0));
    }

    #[test]
    fn projection_quad_fills_its_fov() {
        let fov = Fov::new(-0.7, 0.7, 0.7, -0.7);
        let mvp = projection_from_fov(&fov) * projection_quad_model(&fov, &Pose::identity());

        let corner = mvp * Vector4::new(0.5, 0.5, 0.0, 1.0);
        assert!(approx(corner.x / corner.w, 1.0));
        assert!(approx(corner.y / corner.w, -1.0));
    }

    #[test]
    fn hidden_quad_is_mirrored() {
        let shown = quad_model_for_eye(&Pose::identity(), [2.0, 1.0], true);
        let hidden = quad_model_for_eye(&Pose::identity(), [2.0, 1.0], false);

        let p = Vector4::new(0.5, 0.0, 0.0, 1.0);
        assert!(approx((shown * p).x, 1.0));
        assert!(approx((hidden * p).x, -1.0));
    }
}
