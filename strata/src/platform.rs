// This module handles flagging the available behaviors
// supported by the device. Things like memory export, fence
// import, display timing, etc
use ash::extensions::khr;
use ash::{vk, Instance};

use crate::{Result, StrataError};
use std::ffi::CStr;
use utils::log;

/// The available vulkan capabilities.
///
/// This is composed of two parts: flags for available features, and
/// lists of extensions to enable. The extension lists will be constructed
/// from the flags to avoid keeping them in memory forever.
pub struct VKDeviceFeatures {
    /// Can this device export and import memory as opaque fds. Mandatory,
    /// all client images are shared this way.
    pub vkc_supports_ext_mem: bool,
    /// Can client fences be imported as sync fds
    pub vkc_supports_ext_fence: bool,
    /// Can semaphores be exported/imported, needed for timeline sync
    pub vkc_supports_ext_semaphore: bool,
    /// Does the device support presenting to a surface
    pub vkc_supports_swapchain: bool,
    /// Can the swapchain present at a requested time
    pub vkc_supports_display_timing: bool,

    // The following are the lists of extensions that map to the above features
    vkc_ext_mem_exts: [*const i8; 2],
    vkc_ext_fence_exts: [*const i8; 2],
    vkc_ext_semaphore_exts: [*const i8; 2],
    vkc_swapchain_exts: [*const i8; 1],
    vkc_display_timing_exts: [*const i8; 1],
}

// The raw extension name pointers are all 'static
unsafe impl Send for VKDeviceFeatures {}
unsafe impl Sync for VKDeviceFeatures {}

fn contains_extensions(exts: &[vk::ExtensionProperties], req: &[*const i8]) -> bool {
    req.iter().all(|r| {
        let rstr = unsafe { CStr::from_ptr(*r as *const std::os::raw::c_char) };

        exts.iter().any(|e| {
            let estr = unsafe { CStr::from_ptr(&e.extension_name as *const std::os::raw::c_char) };
            rstr == estr
        })
    })
}

impl VKDeviceFeatures {
    pub fn new(inst: &Instance, pdev: vk::PhysicalDevice) -> Result<Self> {
        let mut ret = Self {
            vkc_supports_ext_mem: false,
            vkc_supports_ext_fence: false,
            vkc_supports_ext_semaphore: false,
            vkc_supports_swapchain: false,
            vkc_supports_display_timing: false,
            vkc_ext_mem_exts: [
                vk::KhrExternalMemoryFn::name().as_ptr(),
                khr::ExternalMemoryFd::name().as_ptr(),
            ],
            vkc_ext_fence_exts: [
                vk::KhrExternalFenceFn::name().as_ptr(),
                khr::ExternalFenceFd::name().as_ptr(),
            ],
            vkc_ext_semaphore_exts: [
                vk::KhrExternalSemaphoreFn::name().as_ptr(),
                khr::ExternalSemaphoreFd::name().as_ptr(),
            ],
            vkc_swapchain_exts: [khr::Swapchain::name().as_ptr()],
            vkc_display_timing_exts: [vk::GoogleDisplayTimingFn::name().as_ptr()],
        };

        let exts = unsafe {
            inst.enumerate_device_extension_properties(pdev)
                .map_err(StrataError::from)?
        };

        match contains_extensions(exts.as_slice(), &ret.vkc_ext_mem_exts) {
            true => ret.vkc_supports_ext_mem = true,
            false => log::error!("This vulkan device does not support external memory fds"),
        }
        match contains_extensions(exts.as_slice(), &ret.vkc_ext_fence_exts) {
            true => ret.vkc_supports_ext_fence = true,
            false => log::warn!("This vulkan device can not import fences, sync files will be polled"),
        }
        match contains_extensions(exts.as_slice(), &ret.vkc_ext_semaphore_exts) {
            true => ret.vkc_supports_ext_semaphore = true,
            false => log::warn!("This vulkan device does not support external semaphores"),
        }
        match contains_extensions(exts.as_slice(), &ret.vkc_swapchain_exts) {
            true => ret.vkc_supports_swapchain = true,
            false => log::warn!("This vulkan device can not present to surfaces"),
        }
        match contains_extensions(exts.as_slice(), &ret.vkc_display_timing_exts) {
            true => ret.vkc_supports_display_timing = true,
            false => log::debug!("VK_GOOGLE_display_timing not available, using fake pacing"),
        }

        Ok(ret)
    }

    pub fn get_device_extensions(&self) -> Vec<*const i8> {
        let mut ret = Vec::new();

        let lists: [(bool, &[*const i8]); 5] = [
            (self.vkc_supports_ext_mem, &self.vkc_ext_mem_exts),
            (self.vkc_supports_ext_fence, &self.vkc_ext_fence_exts),
            (self.vkc_supports_ext_semaphore, &self.vkc_ext_semaphore_exts),
            (self.vkc_supports_swapchain, &self.vkc_swapchain_exts),
            (self.vkc_supports_display_timing, &self.vkc_display_timing_exts),
        ];
        for (supported, exts) in lists.iter() {
            if *supported {
                ret.extend_from_slice(exts);
            }
        }

        ret
    }
}
