// Synchronization primitives shared with clients
//
// Clients hand us either a fence (as a sync file) or a timeline
// semaphore plus a value for every frame they commit. The compositor
// only needs to wait on these, so they are exposed as small traits that
// the runtime can also implement for tests.
extern crate nix;

use crate::device::Device;
use crate::{Result, StrataError};
use utils::log;

use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;

use ash::vk;
use nix::poll::{poll, PollFd, PollFlags};

/// A one-shot fence signaled by client GPU work
pub trait CompositorFence: Send {
    /// Block until the fence signals
    ///
    /// Returns `TIMEOUT` if `timeout_ns` passed first, the fence may be
    /// waited on again afterwards.
    fn wait(&mut self, timeout_ns: u64) -> Result<()>;
}

/// A timeline semaphore shared with a client
pub trait CompositorSemaphore: Send + Sync {
    /// Block until the timeline reaches `value`
    fn wait(&self, value: u64, timeout_ns: u64) -> Result<()>;
}

/// A fence imported into Vulkan from a sync file
pub struct VkFence {
    f_dev: Arc<Device>,
    f_fence: vk::Fence,
}

impl VkFence {
    /// Import a sync file fd as a temporary fence payload
    ///
    /// Ownership of the fd moves to Vulkan on success.
    pub fn import(dev: &Arc<Device>, fd: OwnedFd) -> Result<Self> {
        if !dev.supports_fence_import() {
            return Err(StrataError::VK_NOT_ALL_EXTENSIONS_AVAILABLE);
        }

        let fence = dev.create_fence(false)?;
        let info = vk::ImportFenceFdInfoKHR::builder()
            .fence(fence)
            .flags(vk::FenceImportFlags::TEMPORARY)
            .handle_type(vk::ExternalFenceHandleTypeFlags::SYNC_FD)
            .fd(fd.as_raw_fd())
            .build();

        match unsafe { dev.external_fence_fd_loader.import_fence_fd(&info) } {
            Ok(()) => {
                // Vulkan closes the fd from now on
                std::mem::forget(fd);
                Ok(Self {
                    f_dev: dev.clone(),
                    f_fence: fence,
                })
            }
            Err(e) => {
                log::error!("Could not import fence fd: {:?}", e);
                unsafe { dev.dev.destroy_fence(fence, None) };
                Err(StrataError::from(e))
            }
        }
    }
}

impl CompositorFence for VkFence {
    fn wait(&mut self, timeout_ns: u64) -> Result<()> {
        self.f_dev.wait_for_fence(self.f_fence, timeout_ns)
    }
}

impl Drop for VkFence {
    fn drop(&mut self) {
        unsafe { self.f_dev.dev.destroy_fence(self.f_fence, None) };
    }
}

/// Export a sync file that signals once all work submitted to the
/// queue so far has completed
///
/// Clients hand this to the compositor in place of their own fence.
pub fn export_queue_sync_file(dev: &Arc<Device>) -> Result<OwnedFd> {
    if !dev.supports_fence_import() {
        return Err(StrataError::VK_NOT_ALL_EXTENSIONS_AVAILABLE);
    }

    let mut export_info = vk::ExportFenceCreateInfo::builder()
        .handle_types(vk::ExternalFenceHandleTypeFlags::SYNC_FD)
        .build();
    let info = vk::FenceCreateInfo::builder()
        .push_next(&mut export_info)
        .build();
    let fence = unsafe { dev.dev.create_fence(&info, None).map_err(StrataError::from)? };

    // An empty batch still orders after everything before it
    let ret = dev.queue_submit_locked(&[], fence).and_then(|_| {
        let fd_info = vk::FenceGetFdInfoKHR::builder()
            .fence(fence)
            .handle_type(vk::ExternalFenceHandleTypeFlags::SYNC_FD)
            .build();
        unsafe {
            dev.external_fence_fd_loader
                .get_fence_fd(&fd_info)
                .map_err(StrataError::from)
        }
    });
    unsafe { dev.dev.destroy_fence(fence, None) };

    let fd = ret?;
    if fd < 0 {
        // Already signaled, there is nothing to wait on. Hand out a fd
        // that polls readable right away.
        let (rd, wr) = nix::unistd::pipe().or(Err(StrataError::OUT_OF_RESOURCES))?;
        nix::unistd::write(&wr, &[1u8]).or(Err(StrataError::OUT_OF_RESOURCES))?;
        return Ok(rd);
    }

    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// A sync file waited on with poll(2)
///
/// Used when the device can't import fences, or when the handle never
/// needs to touch the GPU.
pub struct SyncFileFence {
    sf_fd: OwnedFd,
}

impl SyncFileFence {
    pub fn new(fd: OwnedFd) -> Self {
        Self { sf_fd: fd }
    }
}

impl CompositorFence for SyncFileFence {
    fn wait(&mut self, timeout_ns: u64) -> Result<()> {
        let ms = (timeout_ns / 1_000_000).min(u16::MAX as u64) as u16;
        let mut fds = [PollFd::new(self.sf_fd.as_fd(), PollFlags::POLLIN)];

        match poll(&mut fds, ms) {
            Ok(0) => Err(StrataError::TIMEOUT),
            Ok(_) => Ok(()),
            Err(nix::errno::Errno::EINTR) => Err(StrataError::TIMEOUT),
            Err(e) => {
                log::error!("poll on sync file failed: {}", e);
                Err(StrataError::GPU_ERROR)
            }
        }
    }
}

/// An exportable Vulkan timeline semaphore
pub struct VkTimelineSemaphore {
    s_dev: Arc<Device>,
    s_sema: vk::Semaphore,
}

impl VkTimelineSemaphore {
    fn create(dev: &Arc<Device>, exportable: bool) -> Result<vk::Semaphore> {
        let mut timeline_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0)
            .build();
        let mut export_info = vk::ExportSemaphoreCreateInfo::builder()
            .handle_types(vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_FD)
            .build();

        let mut builder = vk::SemaphoreCreateInfo::builder().push_next(&mut timeline_info);
        if exportable {
            builder = builder.push_next(&mut export_info);
        }

        unsafe {
            dev.dev
                .create_semaphore(&builder.build(), None)
                .map_err(StrataError::from)
        }
    }

    /// Create a timeline semaphore and a native handle to share it
    pub fn new_exported(dev: &Arc<Device>) -> Result<(Self, OwnedFd)> {
        if !dev.supports_semaphore_export() {
            return Err(StrataError::VK_NOT_ALL_EXTENSIONS_AVAILABLE);
        }

        let sema = Self {
            s_dev: dev.clone(),
            s_sema: Self::create(dev, true)?,
        };

        let info = vk::SemaphoreGetFdInfoKHR::builder()
            .semaphore(sema.s_sema)
            .handle_type(vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_FD)
            .build();
        let fd = unsafe {
            dev.external_semaphore_fd_loader
                .get_semaphore_fd(&info)
                .map_err(StrataError::from)?
        };

        Ok((sema, unsafe { OwnedFd::from_raw_fd(fd) }))
    }

    /// Import a timeline semaphore from a native handle
    pub fn import(dev: &Arc<Device>, fd: OwnedFd) -> Result<Self> {
        let sema = Self {
            s_dev: dev.clone(),
            s_sema: Self::create(dev, false)?,
        };

        let info = vk::ImportSemaphoreFdInfoKHR::builder()
            .semaphore(sema.s_sema)
            .handle_type(vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_FD)
            .fd(fd.as_raw_fd())
            .build();
        unsafe {
            dev.external_semaphore_fd_loader
                .import_semaphore_fd(&info)
                .map_err(StrataError::from)?
        };
        std::mem::forget(fd);

        Ok(sema)
    }

    /// Signal `value` from the host
    pub fn signal(&self, value: u64) -> Result<()> {
        let info = vk::SemaphoreSignalInfo::builder()
            .semaphore(self.s_sema)
            .value(value)
            .build();
        unsafe { self.s_dev.dev.signal_semaphore(&info).map_err(StrataError::from) }
    }

    /// Signal `value` on the queue after all work submitted so far
    pub fn signal_on_queue(&self, value: u64) -> Result<()> {
        let semas = [self.s_sema];
        let values = [value];
        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::builder()
            .signal_semaphore_values(&values)
            .build();
        let submit = vk::SubmitInfo::builder()
            .signal_semaphores(&semas)
            .push_next(&mut timeline_info)
            .build();

        self.s_dev.queue_submit_locked(&[submit], vk::Fence::null())
    }

    pub fn value(&self) -> Result<u64> {
        unsafe {
            self.s_dev
                .dev
                .get_semaphore_counter_value(self.s_sema)
                .map_err(StrataError::from)
        }
    }

    pub fn handle(&self) -> vk::Semaphore {
        self.s_sema
    }
}

impl CompositorSemaphore for VkTimelineSemaphore {
    fn wait(&self, value: u64, timeout_ns: u64) -> Result<()> {
        let semas = [self.s_sema];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::builder()
            .semaphores(&semas)
            .values(&values)
            .build();

        unsafe {
            self.s_dev
                .dev
                .wait_semaphores(&wait_info, timeout_ns)
                .map_err(StrataError::from)
        }
    }
}

impl Drop for VkTimelineSemaphore {
    fn drop(&mut self) {
        unsafe { self.s_dev.dev.destroy_semaphore(self.s_sema, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_file_times_out_then_signals() {
        // A pipe's read end becomes readable once something is written,
        // which is the same readiness a sync file reports on signal.
        let (rd, wr) = nix::unistd::pipe().unwrap();
        let mut fence = SyncFileFence::new(rd);

        assert_eq!(fence.wait(1_000_000), Err(StrataError::TIMEOUT));

        nix::unistd::write(&wr, &[1u8]).unwrap();
        assert_eq!(fence.wait(100_000_000), Ok(()));
    }
}
