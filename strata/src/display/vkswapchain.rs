/// Targets that use VkSwapchainKHR
///
/// These targets have the per-frame images controlled by the Vulkan
/// presentation engine. The surface comes either from the host (a
/// window) or from VK_KHR_display, see `vkd2d`.
use ash::extensions::khr;
use ash::vk;

use super::{create_target_view, Target, TargetCreateInfo, TargetImage, TargetSync};
use crate::device::Device;
use crate::{Result, StrataError};
use utils::log;
use utils::pacing::{CompositorPacer, FakeCompositorPacer};
use utils::timing;

use std::sync::Arc;

/// VkSwapchainKHR based outputs
pub struct VkSwapchainTarget {
    sc_dev: Arc<Device>,
    sc_name: String,
    /// the actual surface (KHR extension)
    sc_surface: vk::SurfaceKHR,
    sc_surface_loader: khr::Surface,
    /// loads swapchain extension
    sc_swapchain_loader: khr::Swapchain,
    /// the actual swapchain
    sc_swapchain: vk::SwapchainKHR,
    /// VK_GOOGLE_display_timing entrypoints, if supported
    sc_timing_fn: Option<vk::GoogleDisplayTimingFn>,
    sc_images: Vec<TargetImage>,
    sc_extent: vk::Extent2D,
    sc_format: vk::Format,
    sc_transform: vk::SurfaceTransformFlagsKHR,
    /// Signaled by acquire, consumed by the render submission
    sc_present_sema: vk::Semaphore,
    /// Signaled by the render submission, consumed by present
    sc_render_sema: vk::Semaphore,
    /// Bumped on every present, used as the display timing present id
    sc_present_id: u32,
    sc_pacer: FakeCompositorPacer,
}

impl VkSwapchainTarget {
    /// Wrap a surface created by the host
    ///
    /// Ownership of `surface` moves to the target, it is destroyed when
    /// the target is dropped.
    pub fn new(
        dev: Arc<Device>,
        surface: vk::SurfaceKHR,
        name: &str,
        frame_interval_ns: i64,
    ) -> Result<Self> {
        let entry = &dev.inst.loader;
        let inst = &dev.inst.inst;
        let surface_loader = khr::Surface::new(entry, inst);

        // the queue we render on also has to present
        let supported = unsafe {
            surface_loader
                .get_physical_device_surface_support(dev.pdev, dev.queue_family, surface)
                .or(Err(StrataError::VK_SURF_NOT_SUPPORTED))?
        };
        if !supported {
            log::error!("Queue family {} can not present to {}", dev.queue_family, name);
            return Err(StrataError::VK_SURF_NOT_SUPPORTED);
        }

        let timing_fn = match dev.supports_display_timing() {
            true => Some(vk::GoogleDisplayTimingFn::load(|fn_name| unsafe {
                std::mem::transmute(
                    (inst.fp_v1_0().get_device_proc_addr)(dev.dev.handle(), fn_name.as_ptr()),
                )
            })),
            false => None,
        };

        Ok(Self {
            sc_swapchain_loader: khr::Swapchain::new(inst, &dev.dev),
            sc_surface_loader: surface_loader,
            sc_surface: surface,
            sc_name: name.to_string(),
            sc_swapchain: vk::SwapchainKHR::null(),
            sc_timing_fn: timing_fn,
            sc_images: Vec::new(),
            sc_extent: vk::Extent2D::default(),
            sc_format: vk::Format::UNDEFINED,
            sc_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            sc_present_sema: dev.create_binary_semaphore()?,
            sc_render_sema: dev.create_binary_semaphore()?,
            sc_present_id: 0,
            sc_pacer: FakeCompositorPacer::new(frame_interval_ns, timing::get_current_ns()),
            sc_dev: dev,
        })
    }

    /// choose a vkSurfaceFormatKHR for the vkSurfaceKHR
    ///
    /// Prefers the requested format, then whatever the surface lists
    /// first.
    fn select_surface_format(&self, info: &TargetCreateInfo) -> Result<vk::SurfaceFormatKHR> {
        let formats = unsafe {
            self.sc_surface_loader
                .get_physical_device_surface_formats(self.sc_dev.pdev, self.sc_surface)
                .or(Err(StrataError::INVALID))?
        };

        if let Some(fmt) = formats
            .iter()
            .find(|f| f.format == info.format && f.color_space == info.color_space)
        {
            return Ok(*fmt);
        }

        formats
            .iter()
            .map(|fmt| match fmt.format {
                // if the surface does not specify a desired format
                // then we can choose our own
                vk::Format::UNDEFINED => vk::SurfaceFormatKHR {
                    format: info.format,
                    color_space: info.color_space,
                },
                // if the surface has a desired format we will just
                // use that
                _ => *fmt,
            })
            .nth(0)
            .ok_or(StrataError::INVALID_FORMAT)
    }

    fn select_present_mode(&self, wanted: vk::PresentModeKHR) -> vk::PresentModeKHR {
        let modes = unsafe {
            self.sc_surface_loader
                .get_physical_device_surface_present_modes(self.sc_dev.pdev, self.sc_surface)
                .unwrap_or_default()
        };

        match modes.contains(&wanted) {
            true => wanted,
            // FIFO is always available
            false => {
                log::warn!("Present mode {:?} not supported, using FIFO", wanted);
                vk::PresentModeKHR::FIFO
            }
        }
    }

    /// Tear down all the swapchain-dependent vulkan objects we have created.
    fn destroy_images(&mut self) {
        unsafe {
            for image in self.sc_images.drain(..) {
                self.sc_dev.dev.destroy_image_view(image.view, None);
            }
        }
    }

    fn destroy_swapchain(&mut self) {
        self.destroy_images();
        unsafe {
            self.sc_swapchain_loader
                .destroy_swapchain(self.sc_swapchain, None);
        }
        self.sc_swapchain = vk::SwapchainKHR::null();
    }

    /// Get the vkImage's for the swapchain, and create vkImageViews for them
    fn select_images_and_views(&mut self, format: vk::Format) -> Result<()> {
        let images = unsafe {
            self.sc_swapchain_loader
                .get_swapchain_images(self.sc_swapchain)
                .or(Err(StrataError::COULD_NOT_CREATE_IMAGE))?
        };

        for image in images.iter() {
            let view = create_target_view(&self.sc_dev.dev, *image, format)?;
            self.sc_images.push(TargetImage {
                image: *image,
                view: view,
            });
        }

        Ok(())
    }

    /// Ask the presentation engine how the previous frames went
    fn read_past_timings(&mut self) {
        let timing_fn = match self.sc_timing_fn.as_ref() {
            Some(f) => f,
            None => return,
        };
        if self.sc_swapchain == vk::SwapchainKHR::null() {
            return;
        }

        let dev = self.sc_dev.dev.handle();
        let mut count = 0;
        let res = unsafe {
            (timing_fn.get_past_presentation_timing_google)(
                dev,
                self.sc_swapchain,
                &mut count,
                std::ptr::null_mut(),
            )
        };
        if res != vk::Result::SUCCESS || count == 0 {
            return;
        }

        let mut timings = vec![vk::PastPresentationTimingGOOGLE::default(); count as usize];
        let res = unsafe {
            (timing_fn.get_past_presentation_timing_google)(
                dev,
                self.sc_swapchain,
                &mut count,
                timings.as_mut_ptr(),
            )
        };
        if res != vk::Result::SUCCESS && res != vk::Result::INCOMPLETE {
            log::debug!("vkGetPastPresentationTimingGOOGLE failed: {:?}", res);
            return;
        }

        let now = timing::get_current_ns();
        for t in timings.iter().take(count as usize) {
            self.sc_pacer.info(
                t.present_id as i64,
                t.desired_present_time as i64,
                t.actual_present_time as i64,
                t.earliest_present_time as i64,
                t.present_margin as i64,
                now,
            );
        }
    }
}

impl Target for VkSwapchainTarget {
    fn name(&self) -> &str {
        &self.sc_name
    }

    fn check_ready(&mut self) -> bool {
        self.sc_surface != vk::SurfaceKHR::null()
    }

    /// Populates this target with a new vkSwapchain
    ///
    /// The old swapchain is handed to the driver as `old_swapchain` and
    /// destroyed afterwards.
    fn create_images(&mut self, info: &TargetCreateInfo) -> Result<()> {
        // first wait for the device to finish working
        self.sc_dev.wait_idle_locked()?;
        self.destroy_images();

        // A suboptimal acquire leaves the semaphore signaled, start over
        // with a fresh one
        let sema = self.sc_dev.create_binary_semaphore()?;
        unsafe { self.sc_dev.dev.destroy_semaphore(self.sc_present_sema, None) };
        self.sc_present_sema = sema;

        let caps = unsafe {
            self.sc_surface_loader
                .get_physical_device_surface_capabilities(self.sc_dev.pdev, self.sc_surface)
                .or(Err(StrataError::VK_SURF_NOT_SUPPORTED))?
        };
        let surface_format = self.select_surface_format(info)?;
        let present_mode = self.select_present_mode(info.present_mode);

        // one more than the minimum so that we can hold an image while
        // another is being scanned out
        let mut image_count = caps.min_image_count + 1;
        if caps.max_image_count > 0 && image_count > caps.max_image_count {
            image_count = caps.max_image_count;
        }

        // A current_extent of u32::MAX means the surface size is decided
        // by the swapchain
        let extent = match caps.current_extent.width {
            u32::MAX => vk::Extent2D {
                width: info.width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
                height: info
                    .height
                    .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
            },
            _ => caps.current_extent,
        };

        let usage = match caps.supported_usage_flags.contains(info.usage) {
            true => info.usage,
            false => {
                log::error!(
                    "Surface does not support usage {:?}, supported {:?}",
                    info.usage,
                    caps.supported_usage_flags
                );
                return Err(StrataError::VK_SURF_NOT_SUPPORTED);
            }
        };

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .flags(vk::SwapchainCreateFlagsKHR::empty())
            .surface(self.sc_surface)
            .min_image_count(image_count)
            .image_color_space(surface_format.color_space)
            .image_format(surface_format.format)
            .image_extent(extent)
            .image_usage(usage)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .image_array_layers(1)
            .old_swapchain(self.sc_swapchain);

        // views for all of the swapchains images will be set up in
        // select_images_and_views
        let new_swapchain = unsafe {
            self.sc_swapchain_loader
                .create_swapchain(&create_info, None)
                .or(Err(StrataError::COULD_NOT_CREATE_SWAPCHAIN))?
        };

        // Now that we recreated the swapchain destroy the old one
        self.destroy_swapchain();
        self.sc_swapchain = new_swapchain;
        self.sc_extent = extent;
        self.sc_format = surface_format.format;
        self.sc_transform = caps.current_transform;

        self.select_images_and_views(surface_format.format)?;

        log::info!(
            "{}: created {} images {}x{} {:?} {:?} transform {:?}",
            self.sc_name,
            self.sc_images.len(),
            extent.width,
            extent.height,
            surface_format.format,
            present_mode,
            caps.current_transform
        );

        Ok(())
    }

    fn has_images(&self) -> bool {
        !self.sc_images.is_empty()
    }

    fn images(&self) -> &[TargetImage] {
        &self.sc_images
    }

    fn extent(&self) -> vk::Extent2D {
        self.sc_extent
    }

    fn format(&self) -> vk::Format {
        self.sc_format
    }

    fn surface_transform(&self) -> vk::SurfaceTransformFlagsKHR {
        self.sc_transform
    }

    /// Get the next swapchain image to render to
    ///
    /// If the next image is not ready (i.e. if Vulkan returned NOT_READY or
    /// TIMEOUT), then this will loop on calling `vkAcquireNextImageKHR` until
    /// it gets a valid image.
    fn acquire(&mut self) -> Result<u32> {
        loop {
            return match unsafe {
                self.sc_swapchain_loader.acquire_next_image(
                    self.sc_swapchain,
                    u64::MAX,
                    self.sc_present_sema, // signals presentation
                    vk::Fence::null(),
                )
            } {
                Ok((index, false)) => Ok(index),
                // The image is acquired and the semaphore will be
                // signaled, so the caller has to either use or
                // recreate it.
                Ok((_, true)) => Err(StrataError::SUBOPTIMAL),
                Err(vk::Result::NOT_READY) | Err(vk::Result::TIMEOUT) => {
                    log::debug!("vkAcquireNextImageKHR: not ready, trying again");
                    continue;
                }
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(StrataError::OUT_OF_DATE),
                Err(vk::Result::SUBOPTIMAL_KHR) => Err(StrataError::SUBOPTIMAL),
                // the call did not succeed
                Err(e) => {
                    log::error!("vkAcquireNextImageKHR failed: {:?}", e);
                    Err(StrataError::NO_IMAGE_AVAILABLE)
                }
            };
        }
    }

    /// Present the swapchain image to the screen.
    ///
    /// With display timing we also tell the presentation engine when we
    /// want this image to hit the glass.
    fn present(&mut self, index: u32, desired_present_time_ns: i64, _slop: i64) -> Result<()> {
        let wait_semas = [self.sc_render_sema];
        let swapchains = [self.sc_swapchain];
        let indices = [index];

        self.sc_present_id = self.sc_present_id.wrapping_add(1);
        let times = [vk::PresentTimeGOOGLE {
            present_id: self.sc_present_id,
            desired_present_time: desired_present_time_ns.max(0) as u64,
        }];
        let mut times_info = vk::PresentTimesInfoGOOGLE::builder().times(&times).build();

        let mut info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semas)
            .swapchains(&swapchains)
            .image_indices(&indices);
        if self.sc_timing_fn.is_some() {
            info = info.push_next(&mut times_info);
        }

        let queue = self.sc_dev.lock_queue();
        let ret = unsafe {
            match self.sc_swapchain_loader.queue_present(*queue, &info) {
                Ok(false) => Ok(()),
                Ok(true) => Err(StrataError::SUBOPTIMAL),
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(StrataError::OUT_OF_DATE),
                Err(vk::Result::SUBOPTIMAL_KHR) => Err(StrataError::SUBOPTIMAL),
                Err(e) => {
                    log::error!("vkQueuePresentKHR failed: {:?}", e);
                    Err(StrataError::PRESENT_FAILED)
                }
            }
        };
        drop(queue);

        ret
    }

    fn sync(&self) -> TargetSync {
        TargetSync {
            present_complete: self.sc_present_sema,
            render_complete: self.sc_render_sema,
        }
    }

    fn pacer(&mut self) -> &mut dyn CompositorPacer {
        &mut self.sc_pacer
    }

    fn update_timings(&mut self) {
        self.read_past_timings();
    }
}

impl Drop for VkSwapchainTarget {
    fn drop(&mut self) {
        log::debug!("Destroying swapchain for {}", self.sc_name);
        if let Err(e) = self.sc_dev.wait_idle_locked() {
            log::error!("Could not idle device while destroying {}: {:?}", self.sc_name, e);
        }
        self.destroy_swapchain();
        unsafe {
            self.sc_dev.dev.destroy_semaphore(self.sc_present_sema, None);
            self.sc_dev.dev.destroy_semaphore(self.sc_render_sema, None);
            self.sc_surface_loader
                .destroy_surface(self.sc_surface, None);
        }
    }
}
