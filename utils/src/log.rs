// This makes it easy to import the logging stuff

#![allow(unused_imports)]
pub use crate::debug;
pub use crate::error;
pub use crate::info;
pub use crate::profiling;
pub use crate::trace;
pub use crate::warn;
pub use crate::logging::LogLevel;
