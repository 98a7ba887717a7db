// Composition layer descriptions
//
// These are the trivially copyable per-layer parameters a client submits
// each frame. They carry no GPU handles so they can be sent across
// threads and processes as plain data.
use bitflags::bitflags;
use cgmath::{Quaternion, Vector3};
use serde::{Deserialize, Serialize};
use utils::region::Rect;

/// Maximum number of layers one client may submit per frame
pub const MAX_LAYERS: usize = 16;

/// The kind of a layer
///
/// `Max` is not a real layer kind, layers tagged with it are invisible
/// and skipped by the renderer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LayerType {
    StereoProjection,
    StereoProjectionDepth,
    Quad,
    Cube,
    Cylinder,
    Equirect1,
    Equirect2,
    Max,
}

impl LayerType {
    pub fn is_projection(&self) -> bool {
        matches!(
            self,
            LayerType::StereoProjection | LayerType::StereoProjectionDepth
        )
    }

    /// How many swapchains a layer of this kind references
    pub fn swapchain_count(&self) -> usize {
        match self {
            LayerType::StereoProjection => 2,
            LayerType::StereoProjectionDepth => 4,
            LayerType::Max => 0,
            _ => 1,
        }
    }
}

bitflags! {
    #[derive(Serialize, Deserialize, Default)]
    pub struct LayerCompositionFlags: u32 {
        const CORRECT_CHROMATIC_ABERRATION = 1 << 0;
        /// Blend using the alpha channel of the layer
        const BLEND_TEXTURE_SOURCE_ALPHA = 1 << 1;
        /// Color is not premultiplied by alpha
        const UNPREMULTIPLIED_ALPHA = 1 << 2;
        /// The pose is relative to the viewer, not the world
        const VIEW_SPACE = 1 << 3;
        /// Depth information is attached
        const DEPTH = 1 << 4;
    }
}

/// Which eyes a layer is visible to
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EyeVisibility {
    None,
    Left,
    Right,
    Both,
}

impl Default for EyeVisibility {
    fn default() -> Self {
        EyeVisibility::Both
    }
}

impl EyeVisibility {
    pub fn visible_to(&self, eye: usize) -> bool {
        match self {
            EyeVisibility::None => false,
            EyeVisibility::Left => eye == 0,
            EyeVisibility::Right => eye == 1,
            EyeVisibility::Both => true,
        }
    }
}

/// How the composited image is combined with the real world
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlendMode {
    Opaque,
    Additive,
    AlphaBlend,
}

impl Default for BlendMode {
    fn default() -> Self {
        BlendMode::Opaque
    }
}

/// Asymmetric field of view, tangent space angles in radians
#[derive(Debug, Default, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fov {
    pub angle_left: f32,
    pub angle_right: f32,
    pub angle_up: f32,
    pub angle_down: f32,
}

impl Fov {
    pub fn new(angle_left: f32, angle_right: f32, angle_up: f32, angle_down: f32) -> Self {
        Self {
            angle_left: angle_left,
            angle_right: angle_right,
            angle_up: angle_up,
            angle_down: angle_down,
        }
    }
}

/// A rigid transform. Orientation is a unit quaternion (x, y, z, w).
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub orientation: [f32; 4],
    pub position: [f32; 3],
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}

impl Pose {
    pub fn identity() -> Self {
        Self {
            orientation: [0.0, 0.0, 0.0, 1.0],
            position: [0.0, 0.0, 0.0],
        }
    }

    pub fn from_cgmath(rot: Quaternion<f32>, pos: Vector3<f32>) -> Self {
        Self {
            orientation: [rot.v.x, rot.v.y, rot.v.z, rot.s],
            position: [pos.x, pos.y, pos.z],
        }
    }

    pub fn rotation(&self) -> Quaternion<f32> {
        let o = self.orientation;
        Quaternion::new(o[3], o[0], o[1], o[2])
    }

    pub fn translation(&self) -> Vector3<f32> {
        Vector3::new(self.position[0], self.position[1], self.position[2])
    }
}

/// Which part of which swapchain image to sample
#[derive(Debug, Default, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubImage {
    pub image_index: u32,
    pub array_index: u32,
    pub rect: Rect<i32>,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionView {
    pub sub: SubImage,
    pub fov: Fov,
    pub pose: Pose,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthData {
    pub sub: SubImage,
    pub min_depth: f32,
    pub max_depth: f32,
    pub near_z: f32,
    pub far_z: f32,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuadData {
    pub visibility: EyeVisibility,
    pub sub: SubImage,
    pub pose: Pose,
    /// Width and height in meters
    pub size: [f32; 2],
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct CubeData {
    pub visibility: EyeVisibility,
    pub sub: SubImage,
    pub pose: Pose,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct CylinderData {
    pub visibility: EyeVisibility,
    pub sub: SubImage,
    pub pose: Pose,
    pub radius: f32,
    pub central_angle: f32,
    pub aspect_ratio: f32,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Equirect1Data {
    pub visibility: EyeVisibility,
    pub sub: SubImage,
    pub pose: Pose,
    pub radius: f32,
    pub scale: [f32; 2],
    pub bias: [f32; 2],
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Equirect2Data {
    pub visibility: EyeVisibility,
    pub sub: SubImage,
    pub pose: Pose,
    pub radius: f32,
    pub central_horizontal_angle: f32,
    pub upper_vertical_angle: f32,
    pub lower_vertical_angle: f32,
}

/// Per kind geometric parameters
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub enum LayerKind {
    StereoProjection {
        l: ProjectionView,
        r: ProjectionView,
    },
    StereoProjectionDepth {
        l: ProjectionView,
        r: ProjectionView,
        l_d: DepthData,
        r_d: DepthData,
    },
    Quad(QuadData),
    Cube(CubeData),
    Cylinder(CylinderData),
    Equirect1(Equirect1Data),
    Equirect2(Equirect2Data),
}

/// Everything a client says about one layer
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerData {
    pub flags: LayerCompositionFlags,
    /// Do not display before this time
    pub timestamp: i64,
    /// The images are stored upside down, as OpenGL does
    pub flip_y: bool,
    pub kind: LayerKind,
}

impl LayerData {
    pub fn new(kind: LayerKind) -> Self {
        Self {
            flags: LayerCompositionFlags::empty(),
            timestamp: 0,
            flip_y: false,
            kind: kind,
        }
    }

    pub fn layer_type(&self) -> LayerType {
        match self.kind {
            LayerKind::StereoProjection { .. } => LayerType::StereoProjection,
            LayerKind::StereoProjectionDepth { .. } => LayerType::StereoProjectionDepth,
            LayerKind::Quad(_) => LayerType::Quad,
            LayerKind::Cube(_) => LayerType::Cube,
            LayerKind::Cylinder(_) => LayerType::Cylinder,
            LayerKind::Equirect1(_) => LayerType::Equirect1,
            LayerKind::Equirect2(_) => LayerType::Equirect2,
        }
    }

    pub fn blends_alpha(&self) -> bool {
        self.flags
            .contains(LayerCompositionFlags::BLEND_TEXTURE_SOURCE_ALPHA)
    }

    pub fn premultiplied(&self) -> bool {
        !self.flags
            .contains(LayerCompositionFlags::UNPREMULTIPLIED_ALPHA)
    }

    pub fn view_space(&self) -> bool {
        self.flags.contains(LayerCompositionFlags::VIEW_SPACE)
    }

    /// Which eyes see this layer, projection layers are always both
    pub fn visibility(&self) -> EyeVisibility {
        match &self.kind {
            LayerKind::Quad(q) => q.visibility,
            LayerKind::Cube(c) => c.visibility,
            LayerKind::Cylinder(c) => c.visibility,
            LayerKind::Equirect1(e) => e.visibility,
            LayerKind::Equirect2(e) => e.visibility,
            _ => EyeVisibility::Both,
        }
    }

    /// The color sub image sampled for `eye`
    pub fn sub_image(&self, eye: usize) -> SubImage {
        match &self.kind {
            LayerKind::StereoProjection { l, r } | LayerKind::StereoProjectionDepth { l, r, .. } => {
                match eye {
                    0 => l.sub,
                    _ => r.sub,
                }
            }
            LayerKind::Quad(q) => q.sub,
            LayerKind::Cube(c) => c.sub,
            LayerKind::Cylinder(c) => c.sub,
            LayerKind::Equirect1(e) => e.sub,
            LayerKind::Equirect2(e) => e.sub,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visibility_per_eye() {
        assert!(EyeVisibility::Both.visible_to(0));
        assert!(EyeVisibility::Left.visible_to(0));
        assert!(!EyeVisibility::Left.visible_to(1));
        assert!(!EyeVisibility::None.visible_to(1));
    }

    #[test]
    fn projection_defaults() {
        let data = LayerData::new(LayerKind::StereoProjection {
            l: ProjectionView::default(),
            r: ProjectionView::default(),
        });
        assert_eq!(data.layer_type(), LayerType::StereoProjection);
        assert_eq!(data.visibility(), EyeVisibility::Both);
        assert!(data.premultiplied());
        assert!(!data.blends_alpha());
        assert_eq!(LayerType::StereoProjectionDepth.swapchain_count(), 4);
    }
}
