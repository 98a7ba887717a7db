// Vulkan device representation
//
// This stores per-GPU state: the Vulkan Device objects, the one queue we
// render and present with, the command pool, and the samplers every
// layer draw picks from.

use ash::extensions::khr;
use ash::vk;

use crate::instance::Instance;
use crate::platform::VKDeviceFeatures;
use crate::{CreateInfo, Result, StrataError};
use utils::log;

use std::sync::{Arc, Mutex, MutexGuard};

/// The sampler flavors used during composition
///
/// Projection and quad color use border clamping so that nothing
/// outside of the sub image bleeds in. Depth is clamped to the edge to
/// keep it stable at the borders, and equirect/cube layers wrap around.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SamplerKind {
    ClampToBorderBlack,
    ClampToEdge,
    Repeat,
}

/// Strata Device
///
/// This holds all of the Vulkan logic for one GPU.
pub struct Device {
    pub(crate) inst: Arc<Instance>,
    /// the logical device we are using
    pub(crate) dev: ash::Device,
    /// Details about what this device supports
    pub(crate) dev_features: VKDeviceFeatures,
    /// the physical device selected to display to
    pub(crate) pdev: vk::PhysicalDevice,
    pub(crate) mem_props: vk::PhysicalDeviceMemoryProperties,
    pub(crate) limits: vk::PhysicalDeviceLimits,
    /// Graphics and compute capable queue family
    pub(crate) queue_family: u32,
    /// needed for vkGetMemoryFdKHR
    pub(crate) external_mem_fd_loader: khr::ExternalMemoryFd,
    pub(crate) external_fence_fd_loader: khr::ExternalFenceFd,
    pub(crate) external_semaphore_fd_loader: khr::ExternalSemaphoreFd,
    /// Our queue. All submits and device idle waits go through this lock.
    pub(crate) d_queue: Mutex<vk::Queue>,
    /// All command buffer allocations go through this lock
    pub(crate) d_cmd_pool: Mutex<vk::CommandPool>,
    d_sampler_border: vk::Sampler,
    d_sampler_edge: vk::Sampler,
    d_sampler_repeat: vk::Sampler,
}

impl Device {
    /// Create a vkDevice from a vkPhysicalDevice
    ///
    /// Create a logical device for interfacing with the physical device.
    /// once again we specify any device extensions we need, external
    /// memory being the most important one.
    ///
    /// A queue is created in the specified queue family.
    fn create_device(
        dev_features: &VKDeviceFeatures,
        inst: &ash::Instance,
        pdev: vk::PhysicalDevice,
        queue_family: u32,
    ) -> Result<ash::Device> {
        let dev_extension_names = dev_features.get_device_extensions();

        let features = vk::PhysicalDeviceFeatures::builder()
            .shader_storage_image_write_without_format(true)
            .build();
        let mut vulkan12_features = vk::PhysicalDeviceVulkan12Features::builder()
            .timeline_semaphore(true)
            .host_query_reset(true)
            .build();

        // for now we only have one queue, so one priority
        let priorities = [1.0];
        let queue_infos = [vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family)
            .queue_priorities(&priorities)
            .build()];

        let dev_create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(dev_extension_names.as_slice())
            .enabled_features(&features)
            .push_next(&mut vulkan12_features)
            .build();

        unsafe {
            inst.create_device(pdev, &dev_create_info, None)
                .map_err(StrataError::from)
        }
    }

    /// Choose a queue family
    ///
    /// returns an index into the array of queue types. The compositor
    /// records graphics and compute work on the same queue.
    fn select_queue_family(inst: &ash::Instance, pdev: vk::PhysicalDevice) -> Option<u32> {
        let flags = vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE;

        // get the properties per queue family
        unsafe { inst.get_physical_device_queue_family_properties(pdev) }
            .iter()
            .position(|info| info.queue_flags.contains(flags))
            .map(|index| index as u32)
    }

    /// Choose a vkPhysicalDevice and queue family index.
    ///
    /// Uses the configured GPU index if there is one, otherwise the
    /// first physical device with a usable queue.
    fn select_pdev(
        inst: &ash::Instance,
        selected: Option<usize>,
    ) -> Result<(vk::PhysicalDevice, u32)> {
        let pdevices = unsafe {
            inst.enumerate_physical_devices()
                .map_err(StrataError::from)?
        };

        if let Some(index) = selected {
            let pdev = *pdevices.get(index).ok_or_else(|| {
                log::error!(
                    "GPU index {} requested but only {} GPUs present",
                    index,
                    pdevices.len()
                );
                StrataError::INVALID
            })?;
            let family = Self::select_queue_family(inst, pdev).ok_or(StrataError::INVALID)?;
            return Ok((pdev, family));
        }

        pdevices
            .iter()
            .find_map(|pdev| Self::select_queue_family(inst, *pdev).map(|f| (*pdev, f)))
            .ok_or_else(|| {
                log::error!("Couldn't find suitable device.");
                StrataError::INVALID
            })
    }

    /// Create a new Device
    ///
    /// This creates a new device for the chosen physical device
    /// in the Instance.
    pub fn new(instance: Arc<Instance>, info: &CreateInfo) -> Result<Self> {
        let (pdev, queue_family) = Self::select_pdev(&instance.inst, info.selected_gpu_index)?;

        let dev_features = VKDeviceFeatures::new(&instance.inst, pdev)?;
        if !dev_features.vkc_supports_ext_mem {
            return Err(StrataError::VK_NOT_ALL_EXTENSIONS_AVAILABLE);
        }
        let mem_props = unsafe { instance.inst.get_physical_device_memory_properties(pdev) };
        let props = unsafe { instance.inst.get_physical_device_properties(pdev) };

        let dev = Self::create_device(&dev_features, &instance.inst, pdev, queue_family)?;
        let queue = unsafe { dev.get_device_queue(queue_family, 0) };

        let pool_create_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family);
        let pool = unsafe {
            dev.create_command_pool(&pool_create_info, None)
                .map_err(StrataError::from)?
        };

        let border = Self::create_sampler(&dev, SamplerKind::ClampToBorderBlack)?;
        let edge = Self::create_sampler(&dev, SamplerKind::ClampToEdge)?;
        let repeat = Self::create_sampler(&dev, SamplerKind::Repeat)?;

        log::info!(
            "Selected GPU {:?} (queue family {})",
            unsafe { std::ffi::CStr::from_ptr(props.device_name.as_ptr()) },
            queue_family
        );

        Ok(Self {
            external_mem_fd_loader: khr::ExternalMemoryFd::new(&instance.inst, &dev),
            external_fence_fd_loader: khr::ExternalFenceFd::new(&instance.inst, &dev),
            external_semaphore_fd_loader: khr::ExternalSemaphoreFd::new(&instance.inst, &dev),
            inst: instance,
            dev: dev,
            dev_features: dev_features,
            pdev: pdev,
            mem_props: mem_props,
            limits: props.limits,
            queue_family: queue_family,
            d_queue: Mutex::new(queue),
            d_cmd_pool: Mutex::new(pool),
            d_sampler_border: border,
            d_sampler_edge: edge,
            d_sampler_repeat: repeat,
        })
    }

    /// Create an image sampler
    ///
    /// Samplers are used to filter data from an image when
    /// it is referenced from a shader. The address mode decides what
    /// is returned outside of [0,1).
    fn create_sampler(dev: &ash::Device, kind: SamplerKind) -> Result<vk::Sampler> {
        let mode = match kind {
            SamplerKind::ClampToBorderBlack => vk::SamplerAddressMode::CLAMP_TO_BORDER,
            SamplerKind::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
            SamplerKind::Repeat => vk::SamplerAddressMode::REPEAT,
        };

        let info = vk::SamplerCreateInfo::builder()
            // filter for magnified (oversampled) pixels
            .mag_filter(vk::Filter::LINEAR)
            // filter for minified (undersampled) pixels
            .min_filter(vk::Filter::LINEAR)
            .address_mode_u(mode)
            .address_mode_v(mode)
            .address_mode_w(mode)
            // disable this for performance
            .anisotropy_enable(false)
            .border_color(vk::BorderColor::FLOAT_OPAQUE_BLACK)
            // texture coords are [0,1)
            .unnormalized_coordinates(false)
            .compare_enable(false)
            .compare_op(vk::CompareOp::ALWAYS)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR);

        unsafe { dev.create_sampler(&info, None).map_err(StrataError::from) }
    }

    /// Get one of the shared samplers
    pub fn sampler(&self, kind: SamplerKind) -> vk::Sampler {
        match kind {
            SamplerKind::ClampToBorderBlack => self.d_sampler_border,
            SamplerKind::ClampToEdge => self.d_sampler_edge,
            SamplerKind::Repeat => self.d_sampler_repeat,
        }
    }

    /// The number of sampled images one shader stage may access
    pub fn max_per_stage_sampled_images(&self) -> u32 {
        self.limits.max_per_stage_descriptor_sampled_images
    }

    /// Nanoseconds per timestamp query tick
    pub fn timestamp_period(&self) -> f32 {
        self.limits.timestamp_period
    }

    pub fn supports_display_timing(&self) -> bool {
        self.dev_features.vkc_supports_display_timing
    }

    pub fn supports_fence_import(&self) -> bool {
        self.dev_features.vkc_supports_ext_fence
    }

    pub fn supports_semaphore_export(&self) -> bool {
        self.dev_features.vkc_supports_ext_semaphore
    }

    /// Check if `format` can be used for images with `usage`
    pub fn is_format_supported(&self, format: vk::Format, usage: vk::ImageUsageFlags) -> bool {
        let props = unsafe {
            self.inst
                .inst
                .get_physical_device_format_properties(self.pdev, format)
        };
        let features = props.optimal_tiling_features;

        let checks = [
            (
                vk::ImageUsageFlags::COLOR_ATTACHMENT,
                vk::FormatFeatureFlags::COLOR_ATTACHMENT,
            ),
            (
                vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
            ),
            (
                vk::ImageUsageFlags::SAMPLED,
                vk::FormatFeatureFlags::SAMPLED_IMAGE,
            ),
            (
                vk::ImageUsageFlags::STORAGE,
                vk::FormatFeatureFlags::STORAGE_IMAGE,
            ),
        ];

        checks
            .iter()
            .all(|(u, f)| !usage.contains(*u) || features.contains(*f))
    }

    /// Returns the formats from `candidates` that support `usage`
    pub fn supported_formats(
        &self,
        candidates: &[vk::Format],
        usage: vk::ImageUsageFlags,
    ) -> Vec<vk::Format> {
        candidates
            .iter()
            .cloned()
            .filter(|f| self.is_format_supported(*f, usage))
            .collect()
    }

    /// Lock the queue for submission
    ///
    /// The guard is released on every exit path, so callers can use `?`
    /// freely while holding it.
    pub(crate) fn lock_queue(&self) -> MutexGuard<vk::Queue> {
        self.d_queue.lock().unwrap()
    }

    /// Submit work to the queue with the queue lock held
    pub(crate) fn queue_submit_locked(
        &self,
        submits: &[vk::SubmitInfo],
        fence: vk::Fence,
    ) -> Result<()> {
        let queue = self.lock_queue();
        unsafe {
            self.dev
                .queue_submit(*queue, submits, fence)
                .map_err(|e| {
                    log::error!("Queue submit failed: {:?}", e);
                    StrataError::from(e)
                })
        }
    }

    /// vkDeviceWaitIdle with the queue lock held
    ///
    /// Vulkan requires all queues of the device to be externally
    /// synchronized during this call.
    pub fn wait_idle_locked(&self) -> Result<()> {
        let _queue = self.lock_queue();
        unsafe { self.dev.device_wait_idle().map_err(StrataError::from) }
    }

    /// Allocate a vkCommandBuffer
    ///
    /// Command buffers are constructed once, and can be executed
    /// many times. Command buffer is shortened to `cbuf` in
    /// many areas of the code.
    pub(crate) fn allocate_cbuf(&self) -> Result<vk::CommandBuffer> {
        let pool = self.d_cmd_pool.lock().unwrap();
        let cbuf_allocate_info = vk::CommandBufferAllocateInfo::builder()
            .command_buffer_count(1)
            .command_pool(*pool)
            .level(vk::CommandBufferLevel::PRIMARY);

        let cbufs = unsafe {
            self.dev
                .allocate_command_buffers(&cbuf_allocate_info)
                .map_err(StrataError::from)?
        };
        cbufs.get(0).cloned().ok_or(StrataError::OUT_OF_RESOURCES)
    }

    pub(crate) fn free_cbuf(&self, cbuf: vk::CommandBuffer) {
        let pool = self.d_cmd_pool.lock().unwrap();
        unsafe { self.dev.free_command_buffers(*pool, &[cbuf]) };
    }

    /// Start recording a one-time-submit command buffer
    pub(crate) fn cbuf_begin_recording(&self, cbuf: vk::CommandBuffer) -> Result<()> {
        let record_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            self.dev
                .reset_command_buffer(cbuf, vk::CommandBufferResetFlags::empty())
                .map_err(StrataError::from)?;
            self.dev
                .begin_command_buffer(cbuf, &record_info)
                .map_err(StrataError::from)
        }
    }

    pub(crate) fn cbuf_end_recording(&self, cbuf: vk::CommandBuffer) -> Result<()> {
        unsafe { self.dev.end_command_buffer(cbuf).map_err(StrataError::from) }
    }

    /// Record and synchronously run a command buffer
    ///
    /// Used during setup for layout transitions. `record` fills the
    /// command buffer, then we submit it and wait for it to finish.
    pub(crate) fn run_once<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let cbuf = self.allocate_cbuf()?;
        let res = (|| {
            self.cbuf_begin_recording(cbuf)?;
            record(&self.dev, cbuf);
            self.cbuf_end_recording(cbuf)?;

            let fence = self.create_fence(false)?;
            let cbufs = [cbuf];
            let submit = vk::SubmitInfo::builder().command_buffers(&cbufs).build();
            let ret = self
                .queue_submit_locked(&[submit], fence)
                .and_then(|_| self.wait_for_fence(fence, u64::MAX));
            unsafe { self.dev.destroy_fence(fence, None) };
            ret
        })();
        self.free_cbuf(cbuf);
        res
    }

    pub(crate) fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let flags = match signaled {
            true => vk::FenceCreateFlags::SIGNALED,
            false => vk::FenceCreateFlags::empty(),
        };
        let info = vk::FenceCreateInfo::builder().flags(flags);
        unsafe { self.dev.create_fence(&info, None).map_err(StrataError::from) }
    }

    pub(crate) fn create_binary_semaphore(&self) -> Result<vk::Semaphore> {
        let info = vk::SemaphoreCreateInfo::builder();
        unsafe { self.dev.create_semaphore(&info, None).map_err(StrataError::from) }
    }

    /// Wait on a fence, timing out after `timeout_ns`
    pub(crate) fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<()> {
        unsafe {
            self.dev
                .wait_for_fences(&[fence], true, timeout_ns)
                .map_err(StrataError::from)
        }
    }

    pub(crate) fn find_memory_type_index(
        props: &vk::PhysicalDeviceMemoryProperties,
        reqs: &vk::MemoryRequirements,
        flags: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        // for each memory type
        for (i, ref mem_type) in props.memory_types.iter().enumerate() {
            // Bit i of memoryBitTypes will be set if the resource supports
            // the ith memory type in props.
            //
            // ash autogenerates common operations for bitfield style structs
            // they can be found in `vk_bitflags_wrapped`
            if (reqs.memory_type_bits >> i) & 1 == 1 && mem_type.property_flags.contains(flags) {
                return Some(i as u32);
            }
        }
        None
    }

    /// Allocates a buffer/memory pair of size `size`.
    ///
    /// The memory is bound to the buffer before returning.
    pub(crate) fn create_buffer_with_size(
        &self,
        usage: vk::BufferUsageFlags,
        flags: vk::MemoryPropertyFlags,
        size: u64,
    ) -> Result<(vk::Buffer, vk::DeviceMemory)> {
        let create_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .build();

        let buffer = unsafe {
            self.dev
                .create_buffer(&create_info, None)
                .map_err(StrataError::from)?
        };
        let req = unsafe { self.dev.get_buffer_memory_requirements(buffer) };
        // find the memory type that best suits our requirements
        let index = Self::find_memory_type_index(&self.mem_props, &req, flags)
            .ok_or(StrataError::OUT_OF_RESOURCES)?;

        // now we need to allocate memory to back the buffer
        let alloc_info = vk::MemoryAllocateInfo {
            allocation_size: req.size,
            memory_type_index: index,
            ..Default::default()
        };

        unsafe {
            let memory = self
                .dev
                .allocate_memory(&alloc_info, None)
                .map_err(StrataError::from)?;
            self.dev
                .bind_buffer_memory(buffer, memory, 0)
                .map_err(StrataError::from)?;
            Ok((buffer, memory))
        }
    }

    /// Writes `data` to `memory`
    ///
    /// This is a helper method for mapping and updating the value stored
    /// in device memory Memory needs to be host visible and coherent.
    /// This does not flush after writing.
    pub(crate) fn update_memory<T: Copy>(
        &self,
        memory: vk::DeviceMemory,
        offset: u64,
        data: &[T],
    ) -> Result<()> {
        if data.len() == 0 {
            return Ok(());
        }

        // Now we copy our data into the buffer
        let data_size = std::mem::size_of_val(data) as u64;
        unsafe {
            let ptr = self
                .dev
                .map_memory(memory, offset, data_size, vk::MemoryMapFlags::empty())
                .map_err(StrataError::from)?;

            // rust doesn't have a raw memcpy, so we need to transform the void
            // ptr to a slice. This is unsafe as the length needs to be correct
            let dst = std::slice::from_raw_parts_mut(ptr as *mut T, data.len());
            dst.copy_from_slice(data);

            self.dev.unmap_memory(memory);
        }
        Ok(())
    }

    /// allocates a host visible buffer/memory pair and fills it with `data`
    ///
    /// Both are returned, as both need to be destroyed when they are done.
    pub(crate) fn create_buffer<T: Copy>(
        &self,
        usage: vk::BufferUsageFlags,
        data: &[T],
    ) -> Result<(vk::Buffer, vk::DeviceMemory)> {
        let size = std::mem::size_of_val(data).max(1) as u64;
        let (buffer, memory) = self.create_buffer_with_size(
            usage,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            size,
        )?;

        self.update_memory(memory, 0, data)?;
        Ok((buffer, memory))
    }

    /// Wrapper for freeing device memory
    ///
    /// Having this in one place lets us quickly handle any additional
    /// allocation tracking
    pub(crate) unsafe fn free_memory(&self, mem: vk::DeviceMemory) {
        self.dev.free_memory(mem, None);
    }

    pub(crate) fn destroy_buffer(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) {
        unsafe {
            self.dev.destroy_buffer(buffer, None);
            self.dev.free_memory(memory, None);
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            let _ = self.dev.device_wait_idle();
            self.dev.destroy_sampler(self.d_sampler_border, None);
            self.dev.destroy_sampler(self.d_sampler_edge, None);
            self.dev.destroy_sampler(self.d_sampler_repeat, None);
            self.dev
                .destroy_command_pool(*self.d_cmd_pool.get_mut().unwrap(), None);
            self.dev.destroy_device(None);
        }
    }
}
