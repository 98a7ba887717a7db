// OpenGL guest
//
// GL state is per thread, so every call into the guest makes a context
// current under a lock and puts the application's context back after.
// Fences have to be inserted on the application's own context, other
// work may use a shared one.
use super::{ClientShim, GuestApi};
use crate::compositor::*;

use strata::NativeImage;

use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex, MutexGuard};

/// Why a context is being made current
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ContextReason {
    /// Inserting a fence, needs the application's context
    Sync,
    /// Anything else
    Other,
}

/// The windowing glue of one GL application (EGL, GLX, WGL)
pub trait GlContext: Send + Sync {
    /// Whatever is needed to restore the current context later
    type Saved;

    fn save_current(&self) -> Self::Saved;

    fn make_current(&self, reason: ContextReason) -> XrResult<()>;

    fn restore(&self, saved: Self::Saved);

    /// Create textures backed by the given memory, returns their names
    fn import_memory(
        &self,
        info: &SwapchainCreateInfo,
        native_images: &[NativeImage],
    ) -> XrResult<Vec<u32>>;

    /// A native fence fd after the current commands, None if only
    /// glFinish is available
    fn insert_fence(&self) -> XrResult<Option<OwnedFd>>;

    fn finish(&self);
}

/// Restores the previous context when dropped
pub struct ContextGuard<'a, C: GlContext> {
    cg_ctx: &'a C,
    cg_saved: Option<C::Saved>,
    _cg_lock: MutexGuard<'a, ()>,
}

impl<'a, C: GlContext> Drop for ContextGuard<'a, C> {
    fn drop(&mut self) {
        if let Some(saved) = self.cg_saved.take() {
            self.cg_ctx.restore(saved);
        }
    }
}

pub struct GlGuest<C: GlContext> {
    gg_ctx: C,
    gg_lock: Mutex<()>,
}

impl<C: GlContext> GlGuest<C> {
    pub fn new(ctx: C) -> Self {
        Self {
            gg_ctx: ctx,
            gg_lock: Mutex::new(()),
        }
    }

    pub fn context(&self) -> &C {
        &self.gg_ctx
    }

    /// Make our context current until the guard is dropped
    pub fn enter(&self, reason: ContextReason) -> XrResult<ContextGuard<'_, C>> {
        let lock = self.gg_lock.lock().unwrap();
        let saved = self.gg_ctx.save_current();

        let mut guard = ContextGuard {
            cg_ctx: &self.gg_ctx,
            cg_saved: Some(saved),
            _cg_lock: lock,
        };

        if let Err(e) = self.gg_ctx.make_current(reason) {
            // nothing was changed
            guard.cg_saved = None;
            return Err(e);
        }
        Ok(guard)
    }
}

impl<C: GlContext> GuestApi for GlGuest<C> {
    type Image = u32;

    fn name(&self) -> &'static str {
        "opengl"
    }

    fn import_images(
        &self,
        info: &SwapchainCreateInfo,
        native_images: &[NativeImage],
    ) -> XrResult<Vec<u32>> {
        let _ctx = self.enter(ContextReason::Other)?;
        self.gg_ctx.import_memory(info, native_images)
    }

    fn export_sync(&self) -> XrResult<GraphicsSyncHandle> {
        let _ctx = self.enter(ContextReason::Sync)?;
        match self.gg_ctx.insert_fence()? {
            Some(fd) => Ok(GraphicsSyncHandle::from_fd(fd)),
            None => {
                self.gg_ctx.finish();
                Ok(GraphicsSyncHandle::invalid())
            }
        }
    }
}

pub type GlClient<C> = ClientShim<GlGuest<C>>;

/// Put a GL application on top of `native`
pub fn create_gl_client<C: GlContext + 'static>(
    native: Arc<dyn Compositor>,
    ctx: C,
) -> XrResult<GlClient<C>> {
    ClientShim::new(native, Arc::new(GlGuest::new(ctx)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockCompositor;
    use strata::BlendMode;
    use utils::timing::NS_PER_MS;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum GlCall {
        Save,
        Make(ContextReason),
        Restore(u32),
        Import(usize),
        Fence,
        Finish,
    }

    #[derive(Default)]
    struct FakeContext {
        calls: Mutex<Vec<GlCall>>,
        fail_make: bool,
    }

    impl FakeContext {
        fn calls(&self) -> Vec<GlCall> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl GlContext for FakeContext {
        type Saved = u32;

        fn save_current(&self) -> u32 {
            self.calls.lock().unwrap().push(GlCall::Save);
            7
        }

        fn make_current(&self, reason: ContextReason) -> XrResult<()> {
            if self.fail_make {
                return Err(XrError::INVALID);
            }
            self.calls.lock().unwrap().push(GlCall::Make(reason));
            Ok(())
        }

        fn restore(&self, saved: u32) {
            self.calls.lock().unwrap().push(GlCall::Restore(saved));
        }

        fn import_memory(
            &self,
            info: &SwapchainCreateInfo,
            native_images: &[NativeImage],
        ) -> XrResult<Vec<u32>> {
            self.calls
                .lock()
                .unwrap()
                .push(GlCall::Import(native_images.len()));
            Ok((1..=info.image_count()).collect())
        }

        fn insert_fence(&self) -> XrResult<Option<OwnedFd>> {
            self.calls.lock().unwrap().push(GlCall::Fence);
            Ok(None)
        }

        fn finish(&self) {
            self.calls.lock().unwrap().push(GlCall::Finish);
        }
    }

    #[test]
    fn context_is_restored_around_calls() {
        let native = Arc::new(MockCompositor::new(16 * NS_PER_MS));
        let client = create_gl_client(native.clone(), FakeContext::default()).unwrap();

        let info = SwapchainCreateInfo::new(32, 32, strata::vk::Format::R8G8B8A8_SRGB.as_raw() as i64);
        let sc = client.create_guest_swapchain(&info).unwrap();
        assert_eq!(sc.guest_images(), &[1, 2, 3]);

        let t = client.wait_frame().unwrap();
        client
            .layer_begin(t.frame_id, t.predicted_display_time, BlendMode::Opaque)
            .unwrap();
        client
            .layer_commit(t.frame_id, GraphicsSyncHandle::invalid())
            .unwrap();

        assert_eq!(
            client.guest().context().calls(),
            vec![
                GlCall::Save,
                GlCall::Make(ContextReason::Other),
                GlCall::Import(0),
                GlCall::Restore(7),
                GlCall::Save,
                GlCall::Make(ContextReason::Sync),
                GlCall::Fence,
                GlCall::Finish,
                GlCall::Restore(7),
            ]
        );
        assert_eq!(native.committed().len(), 1);
    }

    #[test]
    fn failed_make_current_restores_nothing() {
        let guest = GlGuest::new(FakeContext {
            fail_make: true,
            ..Default::default()
        });

        assert_eq!(guest.export_sync().err(), Some(XrError::INVALID));
        assert_eq!(guest.context().calls(), vec![GlCall::Save]);
    }
}
