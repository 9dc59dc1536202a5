// Category-based logging infrastructure
//
// This will be used from multiple threads, so it needs
// to be stateless. The only state is the level threshold,
// which is read once from WSI_DEBUG_LEVEL.
//
// Austin Shafer - 2020
use lazy_static::lazy_static;

/// Level used when WSI_DEBUG_LEVEL is unset or unparseable
pub const DEFAULT_LOG_LEVEL: u32 = 2;

lazy_static! {
    /// The highest level that will be printed
    pub static ref LOG_THRESHOLD: u32 = std::env::var("WSI_DEBUG_LEVEL")
        .ok()
        .and_then(|v| parse_level(&v))
        .unwrap_or(DEFAULT_LOG_LEVEL);
}

/// Parse a level threshold from its env var representation
///
/// Accepts either a number or one of the level names.
pub fn parse_level(value: &str) -> Option<u32> {
    let value = value.trim();
    if let Ok(num) = value.parse::<u32>() {
        return Some(num);
    }

    [
        LogLevel::critical,
        LogLevel::error,
        LogLevel::debug,
        LogLevel::info,
        LogLevel::profiling,
    ]
    .iter()
    .find(|l| l.get_name().eq_ignore_ascii_case(value))
    .map(|l| l.get_level())
}

#[allow(dead_code, non_camel_case_types)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LogLevel {
    // in order of highest priority
    critical, // Urgent and must always be displayed
    error,
    debug,     // debugging related, not verbose
    info,      // more verbose
    profiling, // profiling related timing
}

impl LogLevel {
    pub fn get_name(&self) -> &'static str {
        match self {
            LogLevel::critical => "critical",
            LogLevel::error => "error",
            LogLevel::debug => "debug",
            LogLevel::info => "info",
            LogLevel::profiling => "profiling",
        }
    }

    pub fn get_level(&self) -> u32 {
        match self {
            LogLevel::critical => 0,
            LogLevel::error => 1,
            LogLevel::debug => 2,
            LogLevel::info => 3,
            LogLevel::profiling => 4,
        }
    }

    /// Is this level at or below the configured threshold
    pub fn enabled(&self) -> bool {
        self.get_level() <= *LOG_THRESHOLD
    }
}

#[macro_export]
macro_rules! log_internal {
    ($loglevel:expr, $($format_args:tt)+) => ({
        let level = $loglevel;
        if level.enabled() {
            eprintln!("[{:?}]<{}> {}:{} - {}",
                     $crate::timing::get_current_millis(),
                     level.get_name(),
                     file!(),
                     line!(),
                     format!($($format_args)+)
            );
        }
    })
}

#[macro_export]
macro_rules! critical {
    ($($format_args:tt)+) => ({
        $crate::log_internal!($crate::logging::LogLevel::critical, $($format_args)+)
    })
}

#[macro_export]
macro_rules! error {
    ($($format_args:tt)+) => ({
        $crate::log_internal!($crate::logging::LogLevel::error, $($format_args)+)
    })
}

#[macro_export]
macro_rules! debug {
    ($($format_args:tt)+) => ({
        $crate::log_internal!($crate::logging::LogLevel::debug, $($format_args)+)
    })
}

#[macro_export]
macro_rules! info {
    ($($format_args:tt)+) => ({
        $crate::log_internal!($crate::logging::LogLevel::info, $($format_args)+)
    })
}

#[macro_export]
macro_rules! profiling {
    ($($format_args:tt)+) => ({
        $crate::log_internal!($crate::logging::LogLevel::profiling, $($format_args)+)
    })
}
