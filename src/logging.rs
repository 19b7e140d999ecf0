// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Logging setup for the offload runtime.
//!
//! The runtime logs through `tracing`:
//!
//! - `info` - library loading, device enumeration
//! - `debug` - transfers and kernel invocations
//! - `trace` - allocation bookkeeping and library search candidates
//! - `warn` - failures while releasing resources in destructors
//!
//! [`init_logging`] installs a global `tracing-subscriber` formatter once per
//! process. `RUST_LOG` always takes precedence over the configured level.

use crate::config::OffloadConfig;
use std::fmt;
use std::sync::Once;

/// Configuration for logging initialization.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default log level when `RUST_LOG` is not set.
    pub default_level: LogLevel,
    /// Include timestamps in log output.
    pub with_timestamps: bool,
    /// Include target (module path) in log output.
    pub with_target: bool,
    /// Include source file and line numbers.
    pub with_file_line: bool,
    /// Include the emitting thread name (stream workers are named).
    pub with_thread_names: bool,
    /// Use ANSI colors (disable for file output).
    pub with_ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            default_level: LogLevel::Info,
            with_timestamps: true,
            with_target: true,
            with_file_line: false,
            with_thread_names: false,
            with_ansi: true,
        }
    }
}

impl LogConfig {
    /// Create a new logging configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive a configuration from the runtime's debug verbosity.
    #[must_use]
    pub fn from_offload_config(config: &OffloadConfig) -> Self {
        Self::default().with_level(config.log_level())
    }

    /// Set the default log level.
    #[must_use]
    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.default_level = level;
        self
    }

    /// Enable or disable timestamps.
    #[must_use]
    pub fn with_timestamps(mut self, enable: bool) -> Self {
        self.with_timestamps = enable;
        self
    }

    /// Enable or disable ANSI colors.
    #[must_use]
    pub fn with_ansi(mut self, enable: bool) -> Self {
        self.with_ansi = enable;
        self
    }

    /// Enable or disable thread names.
    #[must_use]
    pub fn with_thread_names(mut self, enable: bool) -> Self {
        self.with_thread_names = enable;
        self
    }

    /// Verbose preset with file/line and stream thread names.
    #[must_use]
    pub fn development() -> Self {
        Self {
            default_level: LogLevel::Debug,
            with_timestamps: true,
            with_target: true,
            with_file_line: true,
            with_thread_names: true,
            with_ansi: true,
        }
    }

    /// Clean output without colors.
    #[must_use]
    pub fn production() -> Self {
        Self {
            default_level: LogLevel::Info,
            with_timestamps: true,
            with_target: false,
            with_file_line: false,
            with_thread_names: false,
            with_ansi: false,
        }
    }

    /// Minimal output for test harnesses.
    #[must_use]
    pub fn testing() -> Self {
        Self {
            default_level: LogLevel::Warn,
            with_timestamps: false,
            with_target: false,
            with_file_line: false,
            with_thread_names: false,
            with_ansi: false,
        }
    }
}

/// Log level enumeration.
///
/// Maps to tracing levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    /// Errors only.
    Error,
    /// Warnings and above.
    Warn,
    /// Informational messages and above.
    #[default]
    Info,
    /// Debug messages and above.
    Debug,
    /// All messages including trace.
    Trace,
}

impl LogLevel {
    /// Map a numeric debug verbosity onto a level.
    ///
    /// 0 logs warnings only, 1 adds transfers and invocations, 2 to 4 add
    /// allocations, 5 and above add library search and loading detail.
    #[must_use]
    pub fn from_debug_level(level: u32) -> Self {
        match level {
            0 => Self::Warn,
            1 => Self::Info,
            2..=4 => Self::Debug,
            _ => Self::Trace,
        }
    }

    /// Convert to a tracing filter string.
    fn as_filter_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

/// Guard ensuring logging is only initialized once.
static INIT_LOGGING: Once = Once::new();

/// Install the global tracing subscriber.
///
/// Subsequent calls are no-ops.
///
/// ```rust
/// use offload_core::{init_logging, LogConfig};
///
/// init_logging(&LogConfig::testing());
/// ```
pub fn init_logging(config: &LogConfig) {
    INIT_LOGGING.call_once(|| {
        let filter = std::env::var("RUST_LOG")
            .unwrap_or_else(|_| config.default_level.as_filter_str().to_string());

        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(config.with_ansi)
            .with_target(config.with_target)
            .with_thread_names(config.with_thread_names)
            .with_file(config.with_file_line)
            .with_line_number(config.with_file_line);

        // A subscriber installed elsewhere wins; ours is then dropped.
        let result = if config.with_timestamps {
            builder.try_init()
        } else {
            builder.without_time().try_init()
        };
        if let Err(err) = result {
            tracing::debug!("tracing subscriber already installed: {err}");
        }
    });
}

/// Log device memory usage.
///
/// ## Arguments
///
/// * `allocated_bytes` - Currently allocated bytes
/// * `peak_bytes` - Peak allocation
/// * `context` - Description of what is being tracked, only rendered when
///   `offload::memory` debug events are enabled
#[allow(clippy::cast_precision_loss)]
pub fn log_memory_usage(allocated_bytes: usize, peak_bytes: usize, context: impl fmt::Display) {
    if !tracing::enabled!(target: "offload::memory", tracing::Level::DEBUG) {
        return;
    }
    let allocated_mb = allocated_bytes as f64 / (1024.0 * 1024.0);
    let peak_mb = peak_bytes as f64 / (1024.0 * 1024.0);

    tracing::debug!(
        target: "offload::memory",
        allocated_mb = format!("{allocated_mb:.2}"),
        peak_mb = format!("{peak_mb:.2}"),
        context = %context,
        "Device memory usage"
    );
}
