//! # Squall
//!
//! The compositor side of an XR runtime. Client sessions hand us layers
//! drawn into swapchains, we composite them with lens distortion onto
//! the headset's display at the right time.
//!
//! * `compositor` - the contract every compositor implements.
//! * `native` - renders and presents frames through `strata`.
//! * `multi` - runs many client sessions on top of one native compositor.
//! * `client` - puts Vulkan, OpenGL and D3D12 applications on a compositor.
//! * `head` - a simulated headset used when no hardware is present.
//! * `config` - settings from a TOML file and the environment.
#![allow(non_camel_case_types)]

pub mod client;
pub mod compositor;
pub mod config;
pub mod head;
pub mod mock;
pub mod multi;
pub mod native;
pub mod swapchain;
pub mod sync;

#[cfg(test)]
mod tests;

pub use compositor::{Compositor, MultiControl, XrError, XrResult};
pub use config::Config;
pub use head::SimulatedHmd;
pub use multi::{ClientCompositor, SessionInfo, SessionState, SystemCompositor};
pub use native::NativeCompositor;
