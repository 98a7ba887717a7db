/// The Vulkan Direct 2 Display (VK_KHR_display) target
///
/// This presents to an HMD panel using the Vulkan extensions, without a
/// window system in between. Once the surface is created everything is
/// a normal VkSwapchainKHR.
use ash::extensions::khr;
use ash::vk;

use super::vkswapchain::VkSwapchainTarget;
use super::{Target, TargetCreateInfo, TargetImage, TargetSync};
use crate::device::Device;
use crate::{Result, StrataError};
use utils::log;
use utils::pacing::CompositorPacer;

use std::sync::Arc;

/// One mode a display can be driven with
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DisplayModeInfo {
    pub index: usize,
    pub width: u32,
    pub height: u32,
    /// Refresh rate in millihertz
    pub refresh_rate: u32,
}

impl DisplayModeInfo {
    /// The frame period of this mode, if the driver reported a rate
    pub fn period_ns(&self) -> Option<i64> {
        match self.refresh_rate {
            0 => None,
            r => Some(1_000_000_000_000 / r as i64),
        }
    }
}

/// A physical display driven directly
pub struct DirectTarget {
    dt_swapchain: VkSwapchainTarget,
    dt_mode: DisplayModeInfo,
}

impl DirectTarget {
    fn first_display(
        loader: &khr::Display,
        pdev: vk::PhysicalDevice,
    ) -> Result<vk::DisplayPropertiesKHR> {
        // This is essentially a list of the available displays.
        // Despite having a display_name member, the names are very
        // unhelpful. (e.x. "monitor").
        let props = unsafe {
            loader
                .get_physical_device_display_properties(pdev)
                .or(Err(StrataError::VK_SURF_NOT_SUPPORTED))?
        };
        props.get(0).cloned().ok_or_else(|| {
            log::error!("No displays are available for direct mode");
            StrataError::VK_SURF_NOT_SUPPORTED
        })
    }

    fn modes(
        loader: &khr::Display,
        pdev: vk::PhysicalDevice,
        display: vk::DisplayKHR,
    ) -> Result<Vec<vk::DisplayModePropertiesKHR>> {
        unsafe {
            loader
                .get_display_mode_properties(pdev, display)
                .or(Err(StrataError::VK_SURF_NOT_SUPPORTED))
        }
    }

    fn mode_info(index: usize, props: &vk::DisplayModePropertiesKHR) -> DisplayModeInfo {
        DisplayModeInfo {
            index: index,
            width: props.parameters.visible_region.width,
            height: props.parameters.visible_region.height,
            refresh_rate: props.parameters.refresh_rate,
        }
    }

    /// List the modes of the first display
    pub fn list_modes(dev: &Device) -> Result<Vec<DisplayModeInfo>> {
        let loader = khr::Display::new(&dev.inst.loader, &dev.inst.inst);
        let display = Self::first_display(&loader, dev.pdev)?;

        Ok(Self::modes(&loader, dev.pdev, display.display)?
            .iter()
            .enumerate()
            .map(|(i, m)| Self::mode_info(i, m))
            .collect())
    }

    /// Log every mode of the first display
    pub fn print_modes(dev: &Device) -> Result<()> {
        for m in Self::list_modes(dev)?.iter() {
            log::info!(
                "mode {}: {}x{}@{:.2}",
                m.index,
                m.width,
                m.height,
                m.refresh_rate as f64 / 1000.0
            );
        }
        Ok(())
    }

    /// Choose the plane to scan out on
    ///
    /// Picks the first plane that can drive `display`.
    fn select_plane(
        loader: &khr::Display,
        pdev: vk::PhysicalDevice,
        display: vk::DisplayKHR,
    ) -> Result<u32> {
        let plane_props = unsafe {
            loader
                .get_physical_device_display_plane_properties(pdev)
                .or(Err(StrataError::VK_SURF_NOT_SUPPORTED))?
        };

        for i in 0..plane_props.len() as u32 {
            let supported = unsafe {
                loader
                    .get_display_plane_supported_displays(pdev, i)
                    .unwrap_or_default()
            };
            if supported.contains(&display) {
                return Ok(i);
            }
        }

        log::error!("No display plane supports the selected display");
        Err(StrataError::VK_SURF_NOT_SUPPORTED)
    }

    /// Open the first display in the mode `desired_mode`
    ///
    /// Without a desired mode the display's first (preferred) mode is
    /// used. `frame_interval_ns` is only used if the mode has no
    /// refresh rate.
    pub fn new(dev: Arc<Device>, desired_mode: Option<usize>, frame_interval_ns: i64) -> Result<Self> {
        let loader = khr::Display::new(&dev.inst.loader, &dev.inst.inst);
        let dpy = Self::first_display(&loader, dev.pdev)?;
        let modes = Self::modes(&loader, dev.pdev, dpy.display)?;

        let index = match desired_mode {
            Some(i) if i < modes.len() => i,
            Some(i) => {
                log::warn!(
                    "Requested mode {} but the display only has {} modes, using mode 0",
                    i,
                    modes.len()
                );
                0
            }
            None => 0,
        };
        let mode_props = modes.get(index).ok_or(StrataError::VK_SURF_NOT_SUPPORTED)?;
        let mode_info = Self::mode_info(index, mode_props);
        let plane = Self::select_plane(&loader, dev.pdev, dpy.display)?;

        log::info!(
            "Direct mode on {:?} ({}x{} mm): mode {} {}x{}, plane {}",
            dpy.display,
            dpy.physical_dimensions.width,
            dpy.physical_dimensions.height,
            index,
            mode_info.width,
            mode_info.height,
            plane
        );

        // Finally we can create our surface to render to. From this
        // point on everything is normal
        let surf_info = vk::DisplaySurfaceCreateInfoKHR::builder()
            .display_mode(mode_props.display_mode)
            .plane_index(plane)
            .transform(vk::SurfaceTransformFlagsKHR::IDENTITY)
            .alpha_mode(vk::DisplayPlaneAlphaFlagsKHR::OPAQUE)
            .image_extent(mode_props.parameters.visible_region);

        let surface = unsafe {
            loader
                .create_display_plane_surface(&surf_info, None)
                .or(Err(StrataError::VK_SURF_NOT_SUPPORTED))?
        };

        let period = mode_info.period_ns().unwrap_or(frame_interval_ns);
        Ok(Self {
            dt_swapchain: VkSwapchainTarget::new(dev, surface, "direct", period)?,
            dt_mode: mode_info,
        })
    }

    pub fn mode(&self) -> &DisplayModeInfo {
        &self.dt_mode
    }
}

impl Target for DirectTarget {
    fn name(&self) -> &str {
        self.dt_swapchain.name()
    }

    fn check_ready(&mut self) -> bool {
        self.dt_swapchain.check_ready()
    }

    fn create_images(&mut self, info: &TargetCreateInfo) -> Result<()> {
        // The display plane is always the size of the mode
        let mut info = *info;
        info.width = self.dt_mode.width;
        info.height = self.dt_mode.height;
        self.dt_swapchain.create_images(&info)
    }

    fn has_images(&self) -> bool {
        self.dt_swapchain.has_images()
    }

    fn images(&self) -> &[TargetImage] {
        self.dt_swapchain.images()
    }

    fn extent(&self) -> vk::Extent2D {
        self.dt_swapchain.extent()
    }

    fn format(&self) -> vk::Format {
        self.dt_swapchain.format()
    }

    fn surface_transform(&self) -> vk::SurfaceTransformFlagsKHR {
        self.dt_swapchain.surface_transform()
    }

    fn acquire(&mut self) -> Result<u32> {
        self.dt_swapchain.acquire()
    }

    fn present(&mut self, index: u32, desired_present_time_ns: i64, present_slop_ns: i64) -> Result<()> {
        self.dt_swapchain
            .present(index, desired_present_time_ns, present_slop_ns)
    }

    fn sync(&self) -> TargetSync {
        self.dt_swapchain.sync()
    }

    fn pacer(&mut self) -> &mut dyn CompositorPacer {
        self.dt_swapchain.pacer()
    }

    fn update_timings(&mut self) {
        self.dt_swapchain.update_timings()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_period_from_refresh() {
        let mode = DisplayModeInfo {
            index: 0,
            width: 2880,
            height: 1600,
            refresh_rate: 90_000,
        };
        assert_eq!(mode.period_ns(), Some(11_111_111));

        let unknown = DisplayModeInfo {
            refresh_rate: 0,
            ..mode
        };
        assert_eq!(unknown.period_ns(), None);
    }
}
