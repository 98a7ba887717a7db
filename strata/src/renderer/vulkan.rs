// The Vulkan renderer
//
// Owns per target image command buffers and fences and drives the two
// composition stages. Layer uniforms and descriptors are shared between
// target images, so only one frame is ever recorded while another is in
// flight on the GPU.
use ash::vk;

use super::distortion::{ComputeDistortion, DistortionEngine, DistortionInput, GraphicsDistortion};
use super::layer_renderer::LayerRenderer;
use super::{
    DrawReport, FrameComposition, FramePlan, PlanParams, RenderMode, Renderer, TargetConfig,
};
use crate::device::Device;
use crate::display::{unorm_format, Target, TargetCreateInfo};
use crate::hmd::{DistortionMesh, HeadDevice};
use crate::layers::MAX_LAYERS;
use crate::math;
use crate::pipelines::{PipelineCache, ShaderBlobs};
use crate::{Result, StrataError};
use utils::{log, timing};

use std::sync::Arc;

/// How long we wait on a frame's fence before giving up
const FENCE_TIMEOUT_NS: u64 = 1_000_000_000;

/// Renderer parameters
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RendererCreateInfo {
    /// Composite and distort with compute shaders
    pub use_compute: bool,
    /// Reproject single projection layers on the compute path
    pub use_timewarp: bool,
    /// Upper bound on the layers composited per frame
    pub max_layers: u32,
    /// Grid cells per side of the distortion mesh
    pub mesh_resolution: u32,
}

impl Default for RendererCreateInfo {
    fn default() -> Self {
        Self {
            use_compute: false,
            use_timewarp: true,
            max_layers: MAX_LAYERS as u32,
            mesh_resolution: 64,
        }
    }
}

/// Command buffer and fence of one target image
struct FrameResources {
    cbuf: vk::CommandBuffer,
    fence: vk::Fence,
    /// The fence will be signaled by submitted work
    submitted: bool,
}

pub struct VulkanRenderer {
    r_dev: Arc<Device>,
    r_hmd: Arc<dyn HeadDevice>,
    r_cache: Arc<PipelineCache>,
    r_shaders: ShaderBlobs,
    r_info: RendererCreateInfo,
    r_budget: u32,
    r_layers: Option<LayerRenderer>,
    r_distortion: Box<dyn DistortionEngine>,
    r_frames: Vec<FrameResources>,
    r_config: Option<TargetConfig>,
    /// Start and end timestamps of the last frame
    r_query_pool: vk::QueryPool,
    r_last_submitted: Option<u32>,
    r_timestamps_pending: bool,
}

impl VulkanRenderer {
    pub fn new(
        dev: Arc<Device>,
        hmd: Arc<dyn HeadDevice>,
        shaders: ShaderBlobs,
        info: &RendererCreateInfo,
    ) -> Result<Self> {
        let cache = Arc::new(PipelineCache::new(dev.clone())?);
        let mesh = DistortionMesh::generate(hmd.as_ref(), info.mesh_resolution);

        // The compute path binds every layer at once, so it is limited by
        // how many samplers one stage can see
        let mut budget = info.max_layers.min(MAX_LAYERS as u32);
        let distortion: Box<dyn DistortionEngine> = match info.use_compute {
            true => {
                budget = budget.min(dev.max_per_stage_sampled_images());
                let engine = ComputeDistortion::new(dev.clone(), &cache, &shaders, &mesh, budget)?;
                budget = engine.sampler_budget();
                Box::new(engine)
            }
            false => Box::new(GraphicsDistortion::new(
                dev.clone(),
                cache.clone(),
                &shaders,
                &mesh,
            )?),
        };

        let pool_info = vk::QueryPoolCreateInfo::builder()
            .query_type(vk::QueryType::TIMESTAMP)
            .query_count(2);
        let query_pool = unsafe {
            dev.dev
                .create_query_pool(&pool_info, None)
                .map_err(StrataError::from)?
        };

        log::info!(
            "Created {} renderer for {}, compositing up to {} layers",
            match info.use_compute {
                true => "compute",
                false => "graphics",
            },
            hmd.name(),
            budget
        );

        Ok(Self {
            r_dev: dev,
            r_hmd: hmd,
            r_cache: cache,
            r_shaders: shaders,
            r_info: *info,
            r_budget: budget,
            r_layers: None,
            r_distortion: distortion,
            r_frames: Vec::new(),
            r_config: None,
            r_query_pool: query_pool,
            r_last_submitted: None,
            r_timestamps_pending: false,
        })
    }

    /// The size of the layer renderer's scratch images
    fn scratch_extent(&self) -> vk::Extent2D {
        let views = self.r_hmd.views();
        vk::Extent2D {
            width: views.iter().map(|v| v.display.0).max().unwrap_or(1).max(1),
            height: views.iter().map(|v| v.display.1).max().unwrap_or(1).max(1),
        }
    }

    fn destroy_frames(&mut self) {
        for f in self.r_frames.drain(..) {
            unsafe { self.r_dev.dev.destroy_fence(f.fence, None) };
            self.r_dev.free_cbuf(f.cbuf);
        }
        self.r_last_submitted = None;
        self.r_timestamps_pending = false;
    }

    /// World pose of each eye right now, for time-warp
    fn fresh_poses(&self) -> [crate::layers::Pose; 2] {
        let head = self.r_hmd.head_pose(timing::get_current_ns());
        let eyes = self.r_hmd.eye_poses();
        [
            math::pose_multiply(&head, &eyes[0]),
            math::pose_multiply(&head, &eyes[1]),
        ]
    }

    fn record(
        &mut self,
        index: u32,
        frame: &FrameComposition,
        plan: &FramePlan,
    ) -> Result<usize> {
        let layered = plan.mode == RenderMode::Layered;
        let use_layer_renderer = layered && !self.r_distortion.composites_layers();

        // Stage one, a failure leaves the eyes cleared
        let mut drawn = 0;
        let mut scratch = None;
        if use_layer_renderer {
            if let Some(layers) = self.r_layers.as_mut() {
                drawn = match layers.prepare(frame, plan) {
                    Ok(n) => n,
                    Err(e) => {
                        log::error!("Could not prepare layers for frame {}: {}", frame.frame_id, e);
                        layers.clear_draws();
                        0
                    }
                };
                scratch = Some(layers.eye_images()?);
            }
        }

        let input = DistortionInput {
            frame: frame,
            plan: plan,
            scratch: scratch,
            fresh_poses: self.fresh_poses(),
        };
        match self.r_distortion.prepare(&input, index) {
            Ok(()) => {
                if !use_layer_renderer {
                    drawn = plan.visible_count();
                }
            }
            Err(e) => {
                log::error!("Could not prepare distortion for frame {}: {}", frame.frame_id, e);
                self.r_distortion.prepare_clear(index);
                drawn = 0;
            }
        }

        let cbuf = self.r_frames[index as usize].cbuf;
        self.r_dev.cbuf_begin_recording(cbuf)?;
        unsafe {
            self.r_dev
                .dev
                .cmd_reset_query_pool(cbuf, self.r_query_pool, 0, 2);
            self.r_dev.dev.cmd_write_timestamp(
                cbuf,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                self.r_query_pool,
                0,
            );
        }

        if use_layer_renderer {
            if let Some(layers) = self.r_layers.as_ref() {
                layers.record(cbuf);
            }
        }
        self.r_distortion.record(cbuf, index);

        unsafe {
            self.r_dev.dev.cmd_write_timestamp(
                cbuf,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                self.r_query_pool,
                1,
            );
        }
        self.r_dev.cbuf_end_recording(cbuf)?;

        Ok(drawn)
    }

    fn submit(&mut self, target: &dyn Target, index: u32) -> Result<()> {
        let sync = target.sync();
        let frame = &self.r_frames[index as usize];

        let mut wait_semas = Vec::new();
        let mut wait_stages = Vec::new();
        if sync.present_complete != vk::Semaphore::null() {
            wait_semas.push(sync.present_complete);
            wait_stages.push(self.r_distortion.wait_stage());
        }
        let mut signal_semas = Vec::new();
        if sync.render_complete != vk::Semaphore::null() {
            signal_semas.push(sync.render_complete);
        }

        let cbufs = [frame.cbuf];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semas)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&cbufs)
            .signal_semaphores(&signal_semas)
            .build();

        unsafe {
            self.r_dev
                .dev
                .reset_fences(&[frame.fence])
                .map_err(StrataError::from)?;
        }
        self.r_dev.queue_submit_locked(&[submit_info], frame.fence)?;

        self.r_frames[index as usize].submitted = true;
        self.r_last_submitted = Some(index);
        self.r_timestamps_pending = true;
        Ok(())
    }
}

impl Renderer for VulkanRenderer {
    fn adjust_target_info(&self, info: &mut TargetCreateInfo) {
        match self.r_info.use_compute {
            true => {
                info.format = unorm_format(info.format);
                info.usage = vk::ImageUsageFlags::STORAGE;
            }
            false => info.usage = vk::ImageUsageFlags::COLOR_ATTACHMENT,
        }
    }

    fn create_renderings(&mut self, target: &dyn Target) -> Result<TargetConfig> {
        self.close_renderings();

        let config = TargetConfig::new(
            &self.r_hmd.views(),
            self.r_hmd.screen_size(),
            target.extent(),
            target.surface_transform(),
        );

        if !self.r_distortion.composites_layers() {
            let extent = self.scratch_extent();
            let rebuild = match self.r_layers.as_ref() {
                Some(l) => l.extent() != extent,
                None => true,
            };
            if rebuild {
                self.r_layers = None;
                self.r_layers = Some(LayerRenderer::new(
                    self.r_dev.clone(),
                    &self.r_cache,
                    &self.r_shaders,
                    extent,
                )?);
            }
        }

        self.r_distortion.create_target_resources(target, &config)?;

        for _ in target.images().iter() {
            let cbuf = self.r_dev.allocate_cbuf()?;
            let fence = match self.r_dev.create_fence(false) {
                Ok(f) => f,
                Err(e) => {
                    self.r_dev.free_cbuf(cbuf);
                    return Err(e);
                }
            };
            self.r_frames.push(FrameResources {
                cbuf: cbuf,
                fence: fence,
                submitted: false,
            });
        }

        log::debug!(
            "Created renderings for {} {}x{} images (pre-rotate {})",
            self.r_frames.len(),
            config.extent.width,
            config.extent.height,
            config.pre_rotate
        );
        self.r_config = Some(config);
        Ok(config)
    }

    fn close_renderings(&mut self) {
        if self.r_frames.is_empty() && self.r_config.is_none() {
            return;
        }

        if let Err(e) = self.wait_idle() {
            log::error!("Could not idle the device before closing renderings: {}", e);
        }
        self.destroy_frames();
        self.r_distortion.destroy_target_resources();
        self.r_config = None;
    }

    fn has_renderings(&self) -> bool {
        self.r_config.is_some()
    }

    fn plan_params(&self) -> PlanParams {
        PlanParams {
            use_compute: self.r_info.use_compute,
            use_timewarp: self.r_info.use_timewarp,
            sampler_budget: self.r_budget,
        }
    }

    fn draw(
        &mut self,
        target: &dyn Target,
        index: u32,
        frame: &FrameComposition,
        plan: &FramePlan,
    ) -> Result<DrawReport> {
        if self.r_config.is_none() || index as usize >= self.r_frames.len() {
            log::error!("Draw into target image {} without renderings", index);
            return Err(StrataError::INVALID);
        }

        // Shared resources may still be read by the previous frame
        if let Some(last) = self.r_last_submitted {
            self.wait_for_fence(last)?;
        }
        self.wait_for_fence(index)?;

        let drawn = self.record(index, frame, plan)?;
        self.submit(target, index)?;

        Ok(DrawReport {
            mode: plan.mode,
            layers_drawn: drawn,
            submitted: true,
        })
    }

    fn wait_for_fence(&mut self, index: u32) -> Result<()> {
        let frame = match self.r_frames.get_mut(index as usize) {
            Some(f) => f,
            None => return Ok(()),
        };
        if !frame.submitted {
            return Ok(());
        }

        match self.r_dev.wait_for_fence(frame.fence, FENCE_TIMEOUT_NS) {
            Ok(()) => {
                frame.submitted = false;
                Ok(())
            }
            Err(StrataError::TIMEOUT) => {
                log::error!("Timed out waiting for target image {}", index);
                Err(StrataError::TIMEOUT)
            }
            Err(e) => Err(e),
        }
    }

    fn wait_idle(&self) -> Result<()> {
        self.r_dev.wait_idle_locked()
    }

    fn gpu_duration_ns(&mut self) -> Option<i64> {
        if !self.r_timestamps_pending {
            return None;
        }

        let mut stamps = [0u64; 2];
        let res = unsafe {
            self.r_dev.dev.get_query_pool_results(
                self.r_query_pool,
                0,
                2,
                &mut stamps,
                vk::QueryResultFlags::TYPE_64,
            )
        };
        match res {
            Ok(()) => {
                self.r_timestamps_pending = false;
                let ticks = stamps[1].saturating_sub(stamps[0]);
                Some((ticks as f64 * self.r_dev.timestamp_period() as f64) as i64)
            }
            // Not done yet, try again next frame
            Err(vk::Result::NOT_READY) => None,
            Err(e) => {
                log::debug!("Could not read timestamps: {:?}", e);
                self.r_timestamps_pending = false;
                None
            }
        }
    }
}

impl Drop for VulkanRenderer {
    fn drop(&mut self) {
        self.close_renderings();
        self.r_layers = None;
        unsafe {
            self.r_dev
                .dev
                .destroy_query_pool(self.r_query_pool, None);
        }
    }
}
