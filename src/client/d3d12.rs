// D3D12 guest
//
// D3D12 fences are timelines, so the shim shares the compositor's
// timeline semaphore with the application's device and signals it from
// the application's queue. Shared resources and fences are opened from
// the same fd handles the other shims use.
use super::{ClientShim, GuestApi};
use crate::compositor::*;

use strata::NativeImage;
use utils::log;

use std::os::fd::OwnedFd;
use std::sync::Arc;

/// The parts of an application's D3D12 device the shim needs
pub trait D3d12Device: Send + Sync {
    /// An opened shared resource
    type Resource: Send + Sync + 'static;

    /// Open the compositor's image as a shared resource
    fn open_shared_resource(
        &self,
        info: &SwapchainCreateInfo,
        native: &NativeImage,
    ) -> XrResult<Self::Resource>;

    /// Open the compositor's timeline as a shared fence
    fn open_shared_fence(&self, fd: OwnedFd) -> XrResult<()>;

    /// Signal the shared fence from the application's queue
    fn queue_signal(&self, value: u64) -> XrResult<()>;

    /// Block until the application's queue is idle
    fn wait_idle(&self) -> XrResult<()>;
}

pub struct D3d12Guest<D: D3d12Device> {
    dg_dev: D,
}

impl<D: D3d12Device> D3d12Guest<D> {
    pub fn new(dev: D) -> Self {
        Self { dg_dev: dev }
    }

    pub fn device(&self) -> &D {
        &self.dg_dev
    }
}

impl<D: D3d12Device> GuestApi for D3d12Guest<D> {
    type Image = D::Resource;

    fn name(&self) -> &'static str {
        "d3d12"
    }

    fn import_images(
        &self,
        info: &SwapchainCreateInfo,
        native_images: &[NativeImage],
    ) -> XrResult<Vec<D::Resource>> {
        native_images
            .iter()
            .map(|n| self.dg_dev.open_shared_resource(info, n))
            .collect()
    }

    fn import_timeline(&self, fd: OwnedFd) -> XrResult<bool> {
        match self.dg_dev.open_shared_fence(fd) {
            Ok(()) => Ok(true),
            Err(e) => {
                log::warn!("Could not open the compositor timeline as a fence: {:?}", e);
                Ok(false)
            }
        }
    }

    fn signal_timeline(&self, value: u64) -> XrResult<()> {
        self.dg_dev.queue_signal(value)
    }

    fn export_sync(&self) -> XrResult<GraphicsSyncHandle> {
        // without a shared fence all we can do is wait here
        self.dg_dev.wait_idle()?;
        Ok(GraphicsSyncHandle::invalid())
    }
}

pub type D3d12Client<D> = ClientShim<D3d12Guest<D>>;

/// Put a D3D12 application on top of `native`
pub fn create_d3d12_client<D: D3d12Device + 'static>(
    native: Arc<dyn Compositor>,
    dev: D,
) -> XrResult<D3d12Client<D>> {
    ClientShim::new(native, Arc::new(D3d12Guest::new(dev)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockCompositor;
    use strata::BlendMode;
    use utils::timing::NS_PER_MS;

    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeDevice {
        signals: Mutex<Vec<u64>>,
        idles: Mutex<u32>,
        fence_fails: bool,
    }

    impl D3d12Device for FakeDevice {
        type Resource = u64;

        fn open_shared_resource(
            &self,
            _info: &SwapchainCreateInfo,
            _native: &NativeImage,
        ) -> XrResult<u64> {
            Ok(1)
        }

        fn open_shared_fence(&self, _fd: OwnedFd) -> XrResult<()> {
            match self.fence_fails {
                true => Err(XrError::GPU_ERROR),
                false => Ok(()),
            }
        }

        fn queue_signal(&self, value: u64) -> XrResult<()> {
            self.signals.lock().unwrap().push(value);
            Ok(())
        }

        fn wait_idle(&self) -> XrResult<()> {
            *self.idles.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn run_frame<D: D3d12Device + 'static>(client: &D3d12Client<D>, native: &MockCompositor) {
        let t = client.wait_frame().unwrap();
        client.begin_frame(t.frame_id).unwrap();
        client
            .layer_begin(t.frame_id, t.predicted_display_time, BlendMode::Opaque)
            .unwrap();

        // the mock compositor waits for the value on the commit
        if let Some(sem) = native.resources().semaphores().last() {
            sem.signal(u64::MAX);
        }
        client
            .layer_commit(t.frame_id, GraphicsSyncHandle::invalid())
            .unwrap();
    }

    #[test]
    fn commits_signal_increasing_timeline_values() {
        let native = Arc::new(MockCompositor::new(16 * NS_PER_MS));
        let client = create_d3d12_client(native.clone(), FakeDevice::default()).unwrap();
        assert!(client.uses_timeline());

        run_frame(&client, &native);
        run_frame(&client, &native);

        assert_eq!(*client.guest().device().signals.lock().unwrap(), vec![1, 2]);
        assert_eq!(native.committed().len(), 2);
    }

    #[test]
    fn no_shared_fence_waits_idle() {
        let native = Arc::new(MockCompositor::new(16 * NS_PER_MS));
        let dev = FakeDevice {
            fence_fails: true,
            ..Default::default()
        };
        let client = create_d3d12_client(native.clone(), dev).unwrap();
        assert!(!client.uses_timeline());

        run_frame(&client, &native);
        assert_eq!(*client.guest().device().idles.lock().unwrap(), 1);
        assert!(client.guest().device().signals.lock().unwrap().is_empty());
    }
}
