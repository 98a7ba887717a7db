// The compositor contract
//
// This is the interface an XR runtime's API layer drives once per
// session. The native compositor, the per-client compositors of the
// multi-client compositor, the client API shims and the mock all
// implement it, and callers never need to know which one they hold.
use bitflags::bitflags;
use thiserror::Error;

use strata::{
    BlendMode, CompositorFence, CompositorSemaphore, HeadDevice, LayerData, LayerType,
    NativeImage, SampledImage, StrataError,
};
use utils::pacing::PacingError;

use std::os::fd::OwnedFd;
use std::sync::Arc;

/// Contract result codes, success is `Ok`
#[derive(Error, Eq, PartialEq, Debug, Copy, Clone)]
#[allow(non_camel_case_types)]
pub enum XrError {
    #[error("Operation timed out")]
    TIMEOUT,
    #[error("The target is out of date")]
    OUT_OF_DATE,
    #[error("GPU failure")]
    GPU_ERROR,
    #[error("Invalid call")]
    INVALID,
    #[error("Out of resources")]
    OUT_OF_RESOURCES,
    #[error("Could not start or stop a thread")]
    THREADING_FAILURE,
}

pub type XrResult<T> = std::result::Result<T, XrError>;

impl From<StrataError> for XrError {
    fn from(err: StrataError) -> Self {
        match err {
            StrataError::TIMEOUT | StrataError::NOT_READY => XrError::TIMEOUT,
            StrataError::OUT_OF_DATE | StrataError::SUBOPTIMAL => XrError::OUT_OF_DATE,
            StrataError::INVALID
            | StrataError::INVALID_FORMAT
            | StrataError::NO_IMAGE_AVAILABLE => XrError::INVALID,
            StrataError::OUT_OF_RESOURCES => XrError::OUT_OF_RESOURCES,
            StrataError::THREADING_FAILURE => XrError::THREADING_FAILURE,
            _ => XrError::GPU_ERROR,
        }
    }
}

impl From<PacingError> for XrError {
    fn from(_err: PacingError) -> Self {
        XrError::INVALID
    }
}

bitflags! {
    pub struct SwapchainCreateFlags: u32 {
        const PROTECTED_CONTENT = 1 << 0;
        /// Only one image, the client renders it once
        const STATIC_IMAGE = 1 << 1;
    }
}

bitflags! {
    pub struct SwapchainUsageFlags: u32 {
        const COLOR = 1 << 0;
        const DEPTH_STENCIL = 1 << 1;
        const UNORDERED_ACCESS = 1 << 2;
        const TRANSFER_SRC = 1 << 3;
        const TRANSFER_DST = 1 << 4;
        const SAMPLED = 1 << 5;
        const MUTABLE_FORMAT = 1 << 6;
        const INPUT_ATTACHMENT = 1 << 7;
    }
}

/// How the client wants its swapchain images
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SwapchainCreateInfo {
    pub create: SwapchainCreateFlags,
    pub usage: SwapchainUsageFlags,
    /// A VkFormat value
    pub format: i64,
    pub sample_count: u32,
    pub width: u32,
    pub height: u32,
    /// 6 for cube maps, 1 otherwise
    pub face_count: u32,
    pub array_size: u32,
    pub mip_count: u32,
}

impl SwapchainCreateInfo {
    pub fn new(width: u32, height: u32, format: i64) -> Self {
        Self {
            create: SwapchainCreateFlags::empty(),
            usage: SwapchainUsageFlags::COLOR | SwapchainUsageFlags::SAMPLED,
            format: format,
            sample_count: 1,
            width: width,
            height: height,
            face_count: 1,
            array_size: 1,
            mip_count: 1,
        }
    }

    /// Static swapchains get a single image
    pub fn image_count(&self) -> u32 {
        match self.create.contains(SwapchainCreateFlags::STATIC_IMAGE) {
            true => 1,
            false => 3,
        }
    }

    pub fn validate(&self) -> XrResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(XrError::INVALID);
        }
        if self.face_count != 1 && self.face_count != 6 {
            return Err(XrError::INVALID);
        }
        if self.array_size == 0 || self.mip_count == 0 || self.sample_count == 0 {
            return Err(XrError::INVALID);
        }
        if self.create.contains(SwapchainCreateFlags::PROTECTED_CONTENT) {
            // valid, but we can't do it
            return Err(XrError::INVALID);
        }
        Ok(())
    }
}

/// A set of images the client renders into
///
/// Swapchains are shared through `Arc`. Layer entries hold a reference
/// for as long as the compositor may sample from them.
pub trait Swapchain: Send + Sync {
    fn info(&self) -> &SwapchainCreateInfo;

    fn image_count(&self) -> u32;

    /// Get the index of the next image to render into
    fn acquire_image(&self) -> XrResult<u32>;

    /// Wait until the compositor is done reading image `index`
    fn wait_image(&self, timeout_ns: i64, index: u32) -> XrResult<()>;

    /// Hand image `index` back to the compositor
    fn release_image(&self, index: u32) -> XrResult<()>;

    /// The views the compositor samples for one array layer of an image
    fn sampled(&self, index: u32, array_index: u32) -> Option<SampledImage>;

    /// Duplicated native handles of every image
    fn native_images(&self) -> XrResult<Vec<NativeImage>>;

    /// The compositor side swapchain wrapped by a client API shim
    fn native(&self) -> Option<Arc<dyn Swapchain>> {
        None
    }
}

/// Resolve a swapchain to the one the native compositor created
pub fn native_swapchain(sc: &Arc<dyn Swapchain>) -> Arc<dyn Swapchain> {
    match sc.native() {
        Some(inner) => inner,
        None => sc.clone(),
    }
}

/// Recommended and largest render size of one view
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct ViewSizeInfo {
    pub recommended: (u32, u32),
    pub max: (u32, u32),
}

/// What a client needs to know before creating swapchains
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CompositorInfo {
    /// Supported swapchain formats, most preferred first
    pub formats: Vec<i64>,
    pub views: [ViewSizeInfo; 2],
}

impl CompositorInfo {
    /// Size the views from the head device, scaled by `viewport_scale`
    pub fn new(hmd: &dyn HeadDevice, viewport_scale: f32, formats: Vec<i64>) -> Self {
        let views = hmd.views();
        let size = |i: usize| {
            let (w, h) = views[i].display;
            ViewSizeInfo {
                recommended: (
                    (w as f32 * viewport_scale) as u32,
                    (h as f32 * viewport_scale) as u32,
                ),
                max: (w * 2, h * 2),
            }
        };

        Self {
            formats: formats,
            views: [size(0), size(1)],
        }
    }
}

/// A fence or sync file handed over with a commit
///
/// An invalid handle means the client already waited for its work.
#[derive(Debug, Default)]
pub struct GraphicsSyncHandle(Option<OwnedFd>);

impl GraphicsSyncHandle {
    pub fn invalid() -> Self {
        Self(None)
    }

    pub fn from_fd(fd: OwnedFd) -> Self {
        Self(Some(fd))
    }

    pub fn is_valid(&self) -> bool {
        self.0.is_some()
    }

    pub fn take(self) -> Option<OwnedFd> {
        self.0
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ViewType {
    Mono,
    Stereo,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FramePoint {
    Woke,
    Begin,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Event {
    None,
    StateChange { visible: bool, focused: bool },
    OverlayChange { visible: bool },
}

/// The result of `predict_frame`
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct FramePrediction {
    pub frame_id: i64,
    pub wake_time: i64,
    pub predicted_gpu_time: i64,
    pub predicted_display_time: i64,
    pub predicted_display_period: i64,
}

/// The result of `wait_frame`
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct FrameTiming {
    pub frame_id: i64,
    pub predicted_display_time: i64,
    pub predicted_display_period: i64,
}

/// One submitted layer and the swapchains it samples
///
/// Swapchains are ordered left, right, left depth, right depth for
/// projection layers.
#[derive(Clone)]
pub struct LayerEntry {
    pub xdev: Arc<dyn HeadDevice>,
    pub swapchains: Vec<Arc<dyn Swapchain>>,
    pub data: LayerData,
}

impl LayerEntry {
    /// Check the number of swapchains matches the layer type
    pub fn new(
        xdev: Arc<dyn HeadDevice>,
        swapchains: Vec<Arc<dyn Swapchain>>,
        data: &LayerData,
        expected: LayerType,
    ) -> XrResult<Self> {
        if data.layer_type() != expected || swapchains.len() != expected.swapchain_count() {
            return Err(XrError::INVALID);
        }

        Ok(Self {
            xdev: xdev,
            swapchains: swapchains,
            data: *data,
        })
    }
}

/// The layers of one frame and when they should be shown
///
/// Clearing a slot drops its swapchain references.
#[derive(Clone, Default)]
pub struct LayerSlot {
    pub layers: Vec<LayerEntry>,
    pub display_time: i64,
    pub blend: BlendMode,
    pub active: bool,
}

impl LayerSlot {
    /// An empty slot ready to be filled
    pub fn begin(display_time: i64, blend: BlendMode) -> Self {
        Self {
            layers: Vec::new(),
            display_time: display_time,
            blend: blend,
            active: true,
        }
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// The operations an XR session performs on its compositor
///
/// Every method may be called from the session's thread while the
/// compositor's own threads are running, implementations synchronize
/// internally.
pub trait Compositor: Send + Sync {
    fn info(&self) -> CompositorInfo;

    fn create_swapchain(&self, info: &SwapchainCreateInfo) -> XrResult<Arc<dyn Swapchain>>;

    /// Wrap images allocated elsewhere, the handles are duplicated
    fn import_swapchain(
        &self,
        info: &SwapchainCreateInfo,
        native_images: &[NativeImage],
    ) -> XrResult<Arc<dyn Swapchain>>;

    fn import_fence(&self, handle: GraphicsSyncHandle) -> XrResult<Box<dyn CompositorFence>>;

    /// Create a timeline semaphore and a native handle clients signal it with
    fn create_semaphore(&self) -> XrResult<(OwnedFd, Arc<dyn CompositorSemaphore>)>;

    fn begin_session(&self, view_type: ViewType) -> XrResult<()>;

    fn end_session(&self) -> XrResult<()>;

    fn predict_frame(&self) -> XrResult<FramePrediction>;

    fn mark_frame(&self, frame_id: i64, point: FramePoint, when_ns: i64) -> XrResult<()>;

    /// Sleep until the client should start its next frame
    fn wait_frame(&self) -> XrResult<FrameTiming>;

    fn begin_frame(&self, frame_id: i64) -> XrResult<()>;

    fn discard_frame(&self, frame_id: i64) -> XrResult<()>;

    fn layer_begin(&self, frame_id: i64, display_time_ns: i64, blend: BlendMode) -> XrResult<()>;

    /// Append one layer to the frame between `layer_begin` and `layer_commit`
    fn add_layer(&self, entry: LayerEntry) -> XrResult<()>;

    fn layer_commit(&self, frame_id: i64, sync: GraphicsSyncHandle) -> XrResult<()>;

    fn layer_commit_with_semaphore(
        &self,
        frame_id: i64,
        semaphore: Arc<dyn CompositorSemaphore>,
        value: u64,
    ) -> XrResult<()>;

    fn poll_events(&self) -> XrResult<Event>;

    fn layer_stereo_projection(
        &self,
        xdev: &Arc<dyn HeadDevice>,
        l: &Arc<dyn Swapchain>,
        r: &Arc<dyn Swapchain>,
        data: &LayerData,
    ) -> XrResult<()> {
        self.add_layer(LayerEntry::new(
            xdev.clone(),
            vec![l.clone(), r.clone()],
            data,
            LayerType::StereoProjection,
        )?)
    }

    fn layer_stereo_projection_depth(
        &self,
        xdev: &Arc<dyn HeadDevice>,
        l: &Arc<dyn Swapchain>,
        r: &Arc<dyn Swapchain>,
        l_d: &Arc<dyn Swapchain>,
        r_d: &Arc<dyn Swapchain>,
        data: &LayerData,
    ) -> XrResult<()> {
        self.add_layer(LayerEntry::new(
            xdev.clone(),
            vec![l.clone(), r.clone(), l_d.clone(), r_d.clone()],
            data,
            LayerType::StereoProjectionDepth,
        )?)
    }

    fn layer_quad(
        &self,
        xdev: &Arc<dyn HeadDevice>,
        sc: &Arc<dyn Swapchain>,
        data: &LayerData,
    ) -> XrResult<()> {
        self.add_layer(LayerEntry::new(xdev.clone(), vec![sc.clone()], data, LayerType::Quad)?)
    }

    fn layer_cube(
        &self,
        xdev: &Arc<dyn HeadDevice>,
        sc: &Arc<dyn Swapchain>,
        data: &LayerData,
    ) -> XrResult<()> {
        self.add_layer(LayerEntry::new(xdev.clone(), vec![sc.clone()], data, LayerType::Cube)?)
    }

    fn layer_cylinder(
        &self,
        xdev: &Arc<dyn HeadDevice>,
        sc: &Arc<dyn Swapchain>,
        data: &LayerData,
    ) -> XrResult<()> {
        self.add_layer(LayerEntry::new(
            xdev.clone(),
            vec![sc.clone()],
            data,
            LayerType::Cylinder,
        )?)
    }

    fn layer_equirect1(
        &self,
        xdev: &Arc<dyn HeadDevice>,
        sc: &Arc<dyn Swapchain>,
        data: &LayerData,
    ) -> XrResult<()> {
        self.add_layer(LayerEntry::new(
            xdev.clone(),
            vec![sc.clone()],
            data,
            LayerType::Equirect1,
        )?)
    }

    fn layer_equirect2(
        &self,
        xdev: &Arc<dyn HeadDevice>,
        sc: &Arc<dyn Swapchain>,
        data: &LayerData,
    ) -> XrResult<()> {
        self.add_layer(LayerEntry::new(
            xdev.clone(),
            vec![sc.clone()],
            data,
            LayerType::Equirect2,
        )?)
    }
}

/// Host side controls of the multi-client compositor
pub trait MultiControl {
    fn set_state(&self, visible: bool, focused: bool) -> XrResult<()>;

    fn set_z_order(&self, z_order: i64) -> XrResult<()>;

    fn set_main_app_visibility(&self, visible: bool) -> XrResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_swapchains_have_one_image() {
        let mut info = SwapchainCreateInfo::new(64, 64, 43);
        assert_eq!(info.image_count(), 3);
        info.create |= SwapchainCreateFlags::STATIC_IMAGE;
        assert_eq!(info.image_count(), 1);
    }

    #[test]
    fn create_info_validation() {
        let mut info = SwapchainCreateInfo::new(64, 64, 43);
        assert!(info.validate().is_ok());
        info.face_count = 2;
        assert_eq!(info.validate(), Err(XrError::INVALID));
        info.face_count = 6;
        info.width = 0;
        assert_eq!(info.validate(), Err(XrError::INVALID));
    }

    #[test]
    fn library_errors_map_to_results() {
        assert_eq!(XrError::from(StrataError::SUBOPTIMAL), XrError::OUT_OF_DATE);
        assert_eq!(XrError::from(StrataError::PRESENT_FAILED), XrError::GPU_ERROR);
        assert_eq!(XrError::from(StrataError::NOT_READY), XrError::TIMEOUT);
        assert_eq!(XrError::from(PacingError::UnknownFrame(3)), XrError::INVALID);
    }
}
