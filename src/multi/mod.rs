// Multi-client compositing
//
// Each client session gets a `ClientCompositor`, all of them feed one
// `SystemCompositor` which drives the native compositor.
mod client;
mod system;

pub use client::{ClientCompositor, SlotSummary};
pub use system::{SessionState, SystemCompositor};

/// Layers a single client may submit per frame
pub const MAX_LAYERS: usize = strata::MAX_LAYERS;
/// Sessions the system compositor accepts at once
pub const MAX_CLIENTS: usize = 64;

/// How a new client session is stacked
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub is_overlay: bool,
    pub z_order: i64,
}
