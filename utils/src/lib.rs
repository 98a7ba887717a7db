// A set of helper structs shared by the compositor crates
//
// Logging, monotonic timing, and the frame pacing models live here
// since both the rendering library and the runtime need them.
pub mod timing;
#[macro_use]
pub mod logging;
pub mod log;
pub mod pacing;
pub mod region;

extern crate anyhow;
pub use anyhow::{anyhow, Context, Error, Result};

// Re-exported so the logging macros resolve from any crate
pub use tracing;

pub fn partial_max<T: PartialOrd>(a: T, b: T) -> T {
    if a > b {
        a
    } else {
        b
    }
}

pub fn partial_min<T: PartialOrd>(a: T, b: T) -> T {
    if a < b {
        a
    } else {
        b
    }
}
