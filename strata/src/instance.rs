// Vulkan rendering instance
//
// This holds all of the common instance code for the Vulkan context

use ash::extensions::{ext, khr};
use ash::{vk, Entry};

use crate::{CreateInfo, Result, StrataError};
use utils::log;

use std::ffi::{CStr, CString};
use std::os::raw::c_void;

// this happy little debug callback is from the ash examples
// all it does is print any errors/warnings thrown.
unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_types: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> u32 {
    let msg = match p_callback_data.as_ref() {
        Some(data) if !data.p_message.is_null() => CStr::from_ptr(data.p_message).to_string_lossy(),
        _ => "(no message)".into(),
    };

    if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!("[VK][{:?}] {}", message_types, msg);
    } else if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::warn!("[VK][{:?}] {}", message_types, msg);
    } else {
        log::trace!("[VK][{:?}] {}", message_types, msg);
    }
    vk::FALSE
}

/// A Vulkan Instance
///
/// This holds our basic vulkan session data. We use this to create
/// any devices and such which strata will use internally to render.
pub struct Instance {
    /// debug callback sugar mentioned earlier
    debug: Option<(ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,

    /// the entry just loads function pointers from the dynamic library
    /// I am calling it a loader, because that's what it does
    pub(crate) loader: Entry,
    /// the big vulkan instance.
    pub(crate) inst: ash::Instance,
}

impl Instance {
    /// Creates a new debug reporter and registers our function
    /// for debug callbacks so we get nice error messages
    fn setup_debug(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                    | vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION,
            )
            .pfn_user_callback(Some(vulkan_debug_callback));

        let dr_loader = ext::DebugUtils::new(entry, instance);
        let callback = unsafe {
            dr_loader
                .create_debug_utils_messenger(&debug_info, None)
                .map_err(StrataError::from)?
        };
        Ok((dr_loader, callback))
    }

    /// The instance extensions needed for the targets we were asked to
    /// support.
    fn extension_names(info: &CreateInfo) -> Vec<*const i8> {
        let mut ret = vec![
            khr::Surface::name().as_ptr(),
            vk::KhrGetPhysicalDeviceProperties2Fn::name().as_ptr(),
            vk::KhrExternalMemoryCapabilitiesFn::name().as_ptr(),
            vk::KhrExternalFenceCapabilitiesFn::name().as_ptr(),
            vk::KhrExternalSemaphoreCapabilitiesFn::name().as_ptr(),
        ];

        if info.enable_direct_mode {
            ret.push(khr::Display::name().as_ptr());
        }
        for ext in info.surface_extensions.iter() {
            ret.push(ext.as_ptr());
        }
        if info.validation {
            ret.push(ext::DebugUtils::name().as_ptr());
        }

        ret
    }

    /// Create a vkInstance
    ///
    /// Most of the create info entries are straightforward, with
    /// some basic extensions being enabled. The Vulkan library is loaded
    /// at runtime so that systems without it get an error instead of a
    /// link failure.
    pub fn new(info: &CreateInfo) -> Result<Self> {
        let entry = unsafe { Entry::load() }.map_err(|e| {
            log::error!("Could not load the Vulkan library: {}", e);
            StrataError::VK_NOT_ALL_EXTENSIONS_AVAILABLE
        })?;
        let app_name = CString::new("Strata").or(Err(StrataError::INVALID))?;

        let mut layer_names = Vec::new();
        if info.validation {
            layer_names.push(CString::new("VK_LAYER_KHRONOS_validation").or(Err(StrataError::INVALID))?);
        }
        let layer_names_raw: Vec<*const i8> = layer_names
            .iter()
            .map(|raw_name: &CString| raw_name.as_ptr())
            .collect();

        let extension_names_raw = Self::extension_names(info);

        let appinfo = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(0)
            .engine_name(&app_name)
            .engine_version(0)
            .api_version(vk::API_VERSION_1_2)
            .build();

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&appinfo)
            .enabled_layer_names(&layer_names_raw)
            .enabled_extension_names(&extension_names_raw)
            .build();

        let instance: ash::Instance = unsafe {
            entry.create_instance(&create_info, None).map_err(|e| {
                log::error!("Instance creation error: {:?}", e);
                StrataError::from(e)
            })?
        };

        let debug = match info.validation {
            true => Some(Self::setup_debug(&entry, &instance)?),
            false => None,
        };

        Ok(Self {
            loader: entry,
            inst: instance,
            debug: debug,
        })
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        unsafe {
            if let Some((loader, callback)) = self.debug.take() {
                loader.destroy_debug_utils_messenger(callback, None);
            }
            self.inst.destroy_instance(None);
        }
    }
}
