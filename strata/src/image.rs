// Shareable GPU images
//
// Client swapchain images are allocated here with exportable memory so
// that their backing can be handed to another process or another API as
// an opaque fd. The same code imports those fds back into Vulkan images.
extern crate ash;
extern crate nix;

use super::device::Device;
use crate::{Result, StrataError};
use utils::log;

use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;

use ash::vk;
use nix::fcntl::{fcntl, FcntlArg};

/// A native, shareable handle to one image's memory
///
/// On POSIX systems this is an opaque memory fd.
#[derive(Debug)]
pub struct NativeImage {
    /// Size of the allocation in bytes
    pub size: u64,
    pub fd: OwnedFd,
    /// The memory was allocated dedicated to its image, importers must
    /// do the same.
    pub use_dedicated_allocation: bool,
}

impl NativeImage {
    /// Duplicate the handle, the copy is closed on exec
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            size: self.size,
            fd: dup_fd(&self.fd)?,
            use_dedicated_allocation: self.use_dedicated_allocation,
        })
    }
}

fn dup_fd(fd: &OwnedFd) -> Result<OwnedFd> {
    // It is possible that the fd may be bad since the program that
    // owns it was killed. If that is the case just return an error.
    match fcntl(fd.as_raw_fd(), FcntlArg::F_DUPFD_CLOEXEC(0)) {
        Ok(f) => Ok(unsafe { OwnedFd::from_raw_fd(f) }),
        Err(e) => {
            log::debug!("could not dup fd {:?}", e);
            Err(StrataError::INVALID)
        }
    }
}

/// The parameters of one swapchain image
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct ImageCreateInfo {
    pub width: u32,
    pub height: u32,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    /// 6 for cube maps
    pub face_count: u32,
    pub array_size: u32,
    pub mip_count: u32,
    /// Allow views with a different format, for sRGB/unorm aliasing
    pub mutable_format: bool,
}

impl ImageCreateInfo {
    pub fn new(width: u32, height: u32, format: vk::Format, usage: vk::ImageUsageFlags) -> Self {
        Self {
            width: width,
            height: height,
            format: format,
            usage: usage,
            face_count: 1,
            array_size: 1,
            mip_count: 1,
            mutable_format: false,
        }
    }

    pub fn layer_count(&self) -> u32 {
        self.face_count.max(1) * self.array_size.max(1)
    }

    pub fn is_depth(&self) -> bool {
        is_depth_format(self.format)
    }
}

pub fn is_depth_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM
            | vk::Format::X8_D24_UNORM_PACK32
            | vk::Format::D32_SFLOAT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

fn aspect_for_format(format: vk::Format) -> vk::ImageAspectFlags {
    match is_depth_format(format) {
        true => vk::ImageAspectFlags::DEPTH,
        false => vk::ImageAspectFlags::COLOR,
    }
}

/// The views a layer draw needs from one array layer of an image
///
/// This is plain handle data, the owning `ImageResources` must outlive
/// any frame it is used in.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct SampledImage {
    pub view_alpha: vk::ImageView,
    /// Same image with alpha swizzled to one
    pub view_no_alpha: vk::ImageView,
    pub width: u32,
    pub height: u32,
    pub is_depth: bool,
}

impl SampledImage {
    /// Pick the view matching whether the layer wants alpha blending
    pub fn view(&self, blend_alpha: bool) -> vk::ImageView {
        match blend_alpha {
            true => self.view_alpha,
            false => self.view_no_alpha,
        }
    }
}

/// A Vulkan image with its memory and views
pub struct ImageResources {
    ir_dev: Arc<Device>,
    pub(crate) ir_image: vk::Image,
    ir_memory: vk::DeviceMemory,
    pub(crate) ir_info: ImageCreateInfo,
    /// One view per array layer
    ir_views_alpha: Vec<vk::ImageView>,
    ir_views_no_alpha: Vec<vk::ImageView>,
    /// A view of every layer, used for storage writes
    pub(crate) ir_full_view: vk::ImageView,
}

impl ImageResources {
    fn create_vk_image(
        dev: &Device,
        info: &ImageCreateInfo,
        external: bool,
    ) -> Result<vk::Image> {
        let mut ext_mem_info = vk::ExternalMemoryImageCreateInfo::builder()
            .handle_types(vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD)
            .build();

        let mut flags = vk::ImageCreateFlags::empty();
        if info.mutable_format {
            flags |= vk::ImageCreateFlags::MUTABLE_FORMAT;
        }
        if info.face_count == 6 {
            flags |= vk::ImageCreateFlags::CUBE_COMPATIBLE;
        }

        let mut builder = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(info.format)
            .extent(vk::Extent3D {
                width: info.width,
                height: info.height,
                depth: 1,
            })
            .mip_levels(info.mip_count.max(1))
            .array_layers(info.layer_count())
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(info.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .flags(flags);
        if external {
            builder = builder.push_next(&mut ext_mem_info);
        }

        unsafe {
            dev.dev.create_image(&builder.build(), None).map_err(|e| {
                log::error!("Could not create {:?} image: {:?}", info.format, e);
                StrataError::COULD_NOT_CREATE_IMAGE
            })
        }
    }

    fn create_views(
        dev: &Device,
        image: vk::Image,
        info: &ImageCreateInfo,
    ) -> Result<(Vec<vk::ImageView>, Vec<vk::ImageView>, vk::ImageView)> {
        let aspect = aspect_for_format(info.format);
        let faces = info.face_count.max(1);
        let view_type = match faces {
            6 => vk::ImageViewType::CUBE,
            _ => vk::ImageViewType::TYPE_2D,
        };

        let make_view = |base: u32, count: u32, ty: vk::ImageViewType, alpha: bool| {
            let components = vk::ComponentMapping {
                r: vk::ComponentSwizzle::IDENTITY,
                g: vk::ComponentSwizzle::IDENTITY,
                b: vk::ComponentSwizzle::IDENTITY,
                a: match alpha {
                    true => vk::ComponentSwizzle::IDENTITY,
                    false => vk::ComponentSwizzle::ONE,
                },
            };
            let view_info = vk::ImageViewCreateInfo::builder()
                .subresource_range(
                    vk::ImageSubresourceRange::builder()
                        .aspect_mask(aspect)
                        .base_mip_level(0)
                        .level_count(1)
                        .base_array_layer(base)
                        .layer_count(count)
                        .build(),
                )
                .components(components)
                .image(image)
                .format(info.format)
                .view_type(ty);

            unsafe {
                dev.dev
                    .create_image_view(&view_info, None)
                    .map_err(StrataError::from)
            }
        };

        let mut alpha = Vec::new();
        let mut no_alpha = Vec::new();
        for i in 0..info.array_size.max(1) {
            alpha.push(make_view(i * faces, faces, view_type, true)?);
            no_alpha.push(make_view(i * faces, faces, view_type, false)?);
        }
        let full = make_view(0, info.layer_count(), vk::ImageViewType::TYPE_2D_ARRAY, true)?;

        Ok((alpha, no_alpha, full))
    }

    /// Transition every layer to the layout the compositor samples from
    fn transition_to_read(dev: &Device, image: vk::Image, info: &ImageCreateInfo) -> Result<()> {
        let layout = match info.is_depth() {
            true => vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
            false => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        };
        dev.run_once(|d, cbuf| {
            let barrier = vk::ImageMemoryBarrier::builder()
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(layout)
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(vk::AccessFlags::SHADER_READ)
                .image(image)
                .subresource_range(
                    vk::ImageSubresourceRange::builder()
                        .aspect_mask(aspect_for_format(info.format))
                        .level_count(vk::REMAINING_MIP_LEVELS)
                        .layer_count(vk::REMAINING_ARRAY_LAYERS)
                        .build(),
                )
                .build();
            unsafe {
                d.cmd_pipeline_barrier(
                    cbuf,
                    vk::PipelineStageFlags::TOP_OF_PIPE,
                    vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::COMPUTE_SHADER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[barrier],
                )
            };
        })
    }

    fn finish(
        dev: Arc<Device>,
        image: vk::Image,
        memory: vk::DeviceMemory,
        info: ImageCreateInfo,
    ) -> Result<Self> {
        unsafe {
            dev.dev
                .bind_image_memory(image, memory, 0)
                .map_err(StrataError::from)?;
        }

        let (alpha, no_alpha, full) = Self::create_views(&dev, image, &info)?;
        Ok(Self {
            ir_dev: dev,
            ir_image: image,
            ir_memory: memory,
            ir_info: info,
            ir_views_alpha: alpha,
            ir_views_no_alpha: no_alpha,
            ir_full_view: full,
        })
    }

    /// Allocate an image whose memory can be shared with other processes
    ///
    /// Returns the image and a native handle to its memory. The image is
    /// left in the layout the compositor samples from.
    pub fn allocate_exportable(
        dev: &Arc<Device>,
        info: &ImageCreateInfo,
    ) -> Result<(Self, NativeImage)> {
        let image = Self::create_vk_image(dev, info, true)?;
        let reqs = unsafe { dev.dev.get_image_memory_requirements(image) };
        let index = match Device::find_memory_type_index(
            &dev.mem_props,
            &reqs,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ) {
            Some(i) => i,
            None => {
                unsafe { dev.dev.destroy_image(image, None) };
                return Err(StrataError::OUT_OF_RESOURCES);
            }
        };

        let mut export_info = vk::ExportMemoryAllocateInfo::builder()
            .handle_types(vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD)
            .build();
        let mut dedicated_alloc_info = vk::MemoryDedicatedAllocateInfo::builder()
            .image(image)
            .build();
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(reqs.size)
            .memory_type_index(index)
            .push_next(&mut export_info)
            .push_next(&mut dedicated_alloc_info)
            .build();

        let memory = match unsafe { dev.dev.allocate_memory(&alloc_info, None) } {
            Ok(m) => m,
            Err(e) => {
                unsafe { dev.dev.destroy_image(image, None) };
                return Err(StrataError::from(e));
            }
        };

        let ret = Self::finish(dev.clone(), image, memory, *info)?;

        let fd_info = vk::MemoryGetFdInfoKHR::builder()
            .memory(memory)
            .handle_type(vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD)
            .build();
        let fd = unsafe {
            dev.external_mem_fd_loader
                .get_memory_fd(&fd_info)
                .map_err(StrataError::from)?
        };

        Self::transition_to_read(dev, image, info)?;

        log::debug!(
            "Allocated exportable {}x{} {:?} image {:?} (fd {})",
            info.width,
            info.height,
            info.format,
            image,
            fd
        );

        Ok((
            ret,
            NativeImage {
                size: reqs.size,
                fd: unsafe { OwnedFd::from_raw_fd(fd) },
                use_dedicated_allocation: true,
            },
        ))
    }

    /// Import an image from a native handle
    ///
    /// The handle is duplicated, the caller keeps ownership of `native`.
    pub fn import(dev: &Arc<Device>, info: &ImageCreateInfo, native: &NativeImage) -> Result<Self> {
        let image = Self::create_vk_image(dev, info, true)?;
        let reqs = unsafe { dev.dev.get_image_memory_requirements(image) };

        if reqs.size > native.size {
            log::error!(
                "Imported memory is {} bytes but the image needs {}",
                native.size,
                reqs.size
            );
            unsafe { dev.dev.destroy_image(image, None) };
            return Err(StrataError::INVALID);
        }

        let index = match Device::find_memory_type_index(
            &dev.mem_props,
            &reqs,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ) {
            Some(i) => i,
            None => {
                unsafe { dev.dev.destroy_image(image, None) };
                return Err(StrataError::OUT_OF_RESOURCES);
            }
        };

        // need to dup the fd since the implementation will
        // take ownership of it on success
        let fd = match dup_fd(&native.fd) {
            Ok(fd) => fd,
            Err(e) => {
                unsafe { dev.dev.destroy_image(image, None) };
                return Err(e);
            }
        };
        let mut import_fd_info = vk::ImportMemoryFdInfoKHR::builder()
            .handle_type(vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD)
            .fd(fd.as_raw_fd())
            .build();
        let mut dedicated_alloc_info = vk::MemoryDedicatedAllocateInfo::builder()
            .image(image)
            .build();

        // We need to import from the fd, so we will
        // add a VkImportMemoryFdInfoKHR struct to the next ptr
        // here to tell vulkan that we should import mem
        // instead of allocating it.
        let mut alloc_builder = vk::MemoryAllocateInfo::builder()
            .allocation_size(native.size)
            .memory_type_index(index)
            .push_next(&mut import_fd_info);
        if native.use_dedicated_allocation {
            alloc_builder = alloc_builder.push_next(&mut dedicated_alloc_info);
        }

        let memory = match unsafe { dev.dev.allocate_memory(&alloc_builder.build(), None) } {
            Ok(m) => {
                // Vulkan owns the fd now
                std::mem::forget(fd);
                m
            }
            Err(e) => {
                unsafe { dev.dev.destroy_image(image, None) };
                return Err(StrataError::from(e));
            }
        };

        log::debug!("Imported {}x{} {:?} image {:?}", info.width, info.height, info.format, image);
        Self::finish(dev.clone(), image, memory, *info)
    }

    /// Allocate a device local image that is never shared
    ///
    /// Used for scratch framebuffers and headless targets.
    pub fn allocate_local(dev: &Arc<Device>, info: &ImageCreateInfo) -> Result<Self> {
        let image = Self::create_vk_image(dev, info, false)?;
        let reqs = unsafe { dev.dev.get_image_memory_requirements(image) };
        let index = Device::find_memory_type_index(
            &dev.mem_props,
            &reqs,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
        .ok_or(StrataError::OUT_OF_RESOURCES)?;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(reqs.size)
            .memory_type_index(index)
            .build();
        let memory = match unsafe { dev.dev.allocate_memory(&alloc_info, None) } {
            Ok(m) => m,
            Err(e) => {
                unsafe { dev.dev.destroy_image(image, None) };
                return Err(StrataError::from(e));
            }
        };

        Self::finish(dev.clone(), image, memory, *info)
    }

    /// Views for one array layer
    pub fn sampled(&self, array_index: u32) -> Option<SampledImage> {
        let i = array_index as usize;
        Some(SampledImage {
            view_alpha: *self.ir_views_alpha.get(i)?,
            view_no_alpha: *self.ir_views_no_alpha.get(i)?,
            width: self.ir_info.width,
            height: self.ir_info.height,
            is_depth: self.ir_info.is_depth(),
        })
    }

    pub fn info(&self) -> &ImageCreateInfo {
        &self.ir_info
    }

    pub fn image(&self) -> vk::Image {
        self.ir_image
    }
}

impl Drop for ImageResources {
    fn drop(&mut self) {
        unsafe {
            for v in self.ir_views_alpha.iter().chain(self.ir_views_no_alpha.iter()) {
                self.ir_dev.dev.destroy_image_view(*v, None);
            }
            self.ir_dev.dev.destroy_image_view(self.ir_full_view, None);
            self.ir_dev.dev.destroy_image(self.ir_image, None);
            self.ir_dev.free_memory(self.ir_memory);
        }
    }
}
