// Category-based logging infrastructure
//
// This will be used from multiple threads, so the macros are thin
// wrappers around tracing and the only state is the global subscriber.
use std::str::FromStr;
use std::sync::Once;

use tracing_subscriber::EnvFilter;

#[allow(non_camel_case_types)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LogLevel {
    // in order of most verbose first
    trace,
    debug,
    info,
    warn,
    error,
}

impl LogLevel {
    pub fn get_name(&self) -> &'static str {
        match self {
            LogLevel::trace => "trace",
            LogLevel::debug => "debug",
            LogLevel::info => "info",
            LogLevel::warn => "warn",
            LogLevel::error => "error",
        }
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::info
    }
}

impl FromStr for LogLevel {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::trace),
            "debug" => Ok(LogLevel::debug),
            "info" => Ok(LogLevel::info),
            "warn" | "warning" => Ok(LogLevel::warn),
            "error" => Ok(LogLevel::error),
            other => Err(crate::anyhow!("Unknown log level: {}", other)),
        }
    }
}

static LOG_INIT: Once = Once::new();

/// Install the process wide log subscriber
///
/// `RUST_LOG` takes precedence over `level` if it is set. Calling this
/// more than once keeps the first subscriber.
pub fn init(level: LogLevel) {
    LOG_INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(level.get_name()));

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .try_init();
    });
}

#[macro_export]
macro_rules! trace {
    ($($format_args:tt)+) => ({
        $crate::tracing::trace!($($format_args)+)
    })
}

#[macro_export]
macro_rules! debug {
    ($($format_args:tt)+) => ({
        $crate::tracing::debug!($($format_args)+)
    })
}

#[macro_export]
macro_rules! info {
    ($($format_args:tt)+) => ({
        $crate::tracing::info!($($format_args)+)
    })
}

#[macro_export]
macro_rules! warn {
    ($($format_args:tt)+) => ({
        $crate::tracing::warn!($($format_args)+)
    })
}

#[macro_export]
macro_rules! error {
    ($($format_args:tt)+) => ({
        $crate::tracing::error!($($format_args)+)
    })
}

/// Frame timing output, filtered separately with `RUST_LOG=profiling=trace`
#[macro_export]
macro_rules! profiling {
    ($($format_args:tt)+) => ({
        $crate::tracing::trace!(target: "profiling", $($format_args)+)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_levels() {
        assert_eq!("trace".parse::<LogLevel>().unwrap(), LogLevel::trace);
        assert_eq!("WARN".parse::<LogLevel>().unwrap(), LogLevel::warn);
        assert_eq!("Error".parse::<LogLevel>().unwrap(), LogLevel::error);
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn init_twice() {
        init(LogLevel::debug);
        init(LogLevel::error);
        crate::debug!("logging initialized {}", 1);
    }
}
