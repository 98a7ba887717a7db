// Bring up the Vulkan side of the native compositor
use super::resources::VkResources;
use super::NativeCompositor;
use crate::compositor::{XrError, XrResult};
use crate::config::{Config, TargetKind};

use strata::{
    vk, CreateInfo, Device, DirectTarget, HeadDevice, HeadlessTarget, Instance, ShaderBlobs,
    Target, VkSwapchainTarget, VulkanRenderer,
};
use utils::log;

use std::sync::Arc;

pub fn create_device(config: &Config) -> XrResult<Arc<Device>> {
    let mut builder = CreateInfo::builder()
        .selected_gpu_index(config.selected_gpu_index)
        .validation(config.validation);
    if matches!(config.target, TargetKind::Auto | TargetKind::Direct) || config.print_modes {
        builder = builder.enable_direct_mode();
    }
    let info = builder.build();

    let inst = Arc::new(Instance::new(&info)?);
    Ok(Arc::new(Device::new(inst, &info)?))
}

/// Pick the presentation target described by `config`
///
/// Window targets need a surface created by the host.
pub fn create_target(
    dev: &Arc<Device>,
    config: &Config,
    surface: Option<vk::SurfaceKHR>,
) -> XrResult<Box<dyn Target>> {
    let interval = config.nominal_frame_interval_ns;

    match config.target {
        TargetKind::Headless => Ok(Box::new(HeadlessTarget::new(dev.clone(), interval))),
        TargetKind::Window => {
            let surface = surface.ok_or_else(|| {
                log::error!("A window target needs a surface from the host");
                XrError::INVALID
            })?;
            Ok(Box::new(VkSwapchainTarget::new(
                dev.clone(),
                surface,
                "window",
                interval,
            )?))
        }
        TargetKind::Direct => Ok(Box::new(DirectTarget::new(
            dev.clone(),
            config.desired_mode,
            interval,
        )?)),
        TargetKind::Auto => {
            if let Some(surface) = surface {
                return Ok(Box::new(VkSwapchainTarget::new(
                    dev.clone(),
                    surface,
                    "window",
                    interval,
                )?));
            }
            match DirectTarget::new(dev.clone(), config.desired_mode, interval) {
                Ok(t) => Ok(Box::new(t)),
                Err(e) => {
                    log::info!("No direct mode display ({:?}), running headless", e);
                    Ok(Box::new(HeadlessTarget::new(dev.clone(), interval)))
                }
            }
        }
    }
}

/// Create a native compositor rendering with Vulkan
pub fn create_native_compositor(
    config: &Config,
    hmd: Arc<dyn HeadDevice>,
    surface: Option<vk::SurfaceKHR>,
) -> XrResult<NativeCompositor> {
    config.validate()?;
    let dev = create_device(config)?;

    let target = create_target(&dev, config, surface)?;
    let shaders = ShaderBlobs::load_dir(&config.shader_dir)?;
    let renderer = VulkanRenderer::new(dev.clone(), hmd.clone(), shaders, &config.renderer_info())?;

    Ok(NativeCompositor::new(
        target,
        Box::new(renderer),
        Arc::new(VkResources::new(dev)),
        hmd,
        config,
    ))
}
