// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Runtime configuration.
//!
//! ## Environment Variables
//!
//! - `OFFLOAD_DEBUG` - Debug verbosity (0-5), mapped onto a log level
//! - `OFFLOAD_TRACE` - Trace level; any value >= 1 records call traces
//! - `OFFLOAD_TRACE_STACKS` - Stack capture for traces: `none`, `compact` or `full`
//! - `OFFLOAD_LIBRARY_PATH` - Colon-separated directories searched for kernel libraries
//! - `OFFLOAD_HOST_DEVICES` - Number of devices emulated by the host engine (default 1)
//! - `OFFLOAD_DEVICE_MEMORY` - Capacity in bytes of each emulated device (0 = unlimited)
//!
//! Malformed numeric values are ignored with a warning and the default is kept.
//!
//! ## Example
//!
//! ```rust
//! use offload_core::{OffloadConfig, ValidatableConfig};
//!
//! let config = OffloadConfig::new()
//!     .with_library_path("/opt/kernels:/usr/local/lib")
//!     .with_host_devices(2);
//! config.validate()?;
//! assert_eq!(config.search_dirs().count(), 2);
//! # Ok::<(), offload_core::OffloadError>(())
//! ```

use crate::error::{OffloadError, Result};
use crate::logging::LogLevel;
use crate::trace::StackCapture;
use std::str::FromStr;

/// Upper bound on the number of emulated devices.
pub const MAX_DEVICES: usize = 64;

/// Configuration validation trait.
///
/// Configuration structs validate themselves before the runtime is built from
/// them.
pub trait ValidatableConfig: Clone + Send + Sync {
    /// Validate the configuration parameters.
    ///
    /// ## Errors
    ///
    /// Returns [`OffloadError::InvalidConfig`] if validation fails.
    fn validate(&self) -> Result<()>;
}

/// Offload runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffloadConfig {
    /// Debug verbosity, `None` when unset.
    pub debug_level: Option<u32>,
    /// Trace level; tracing is active for values >= 1.
    pub trace_level: u32,
    /// Stack capture granularity of recorded traces.
    pub trace_stacks: StackCapture,
    /// Colon-separated library search path.
    pub library_path: String,
    /// Devices emulated by the host engine.
    pub host_devices: usize,
    /// Capacity of each emulated device in bytes (0 = unlimited).
    pub device_memory: usize,
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            debug_level: None,
            trace_level: 0,
            trace_stacks: StackCapture::Compact,
            library_path: String::new(),
            host_devices: 1,
            device_memory: 0,
        }
    }
}

impl OffloadConfig {
    /// Create a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the debug verbosity.
    #[must_use]
    pub fn with_debug_level(mut self, level: u32) -> Self {
        self.debug_level = Some(level);
        self
    }

    /// Set the trace level.
    #[must_use]
    pub fn with_trace_level(mut self, level: u32) -> Self {
        self.trace_level = level;
        self
    }

    /// Set the stack capture granularity.
    #[must_use]
    pub fn with_trace_stacks(mut self, capture: StackCapture) -> Self {
        self.trace_stacks = capture;
        self
    }

    /// Set the library search path.
    #[must_use]
    pub fn with_library_path(mut self, path: impl Into<String>) -> Self {
        self.library_path = path.into();
        self
    }

    /// Set the number of emulated devices.
    #[must_use]
    pub fn with_host_devices(mut self, devices: usize) -> Self {
        self.host_devices = devices;
        self
    }

    /// Set the per-device capacity in bytes.
    #[must_use]
    pub fn with_device_memory(mut self, bytes: usize) -> Self {
        self.device_memory = bytes;
        self
    }

    /// Build configuration from `OFFLOAD_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(level) = parse_env("OFFLOAD_DEBUG") {
            config.debug_level = Some(level);
        }
        if let Some(level) = parse_env("OFFLOAD_TRACE") {
            config.trace_level = level;
        }
        if let Ok(val) = std::env::var("OFFLOAD_TRACE_STACKS") {
            config.trace_stacks = StackCapture::from_name(&val);
        }
        if let Ok(val) = std::env::var("OFFLOAD_LIBRARY_PATH") {
            config.library_path = val;
        }
        if let Some(devices) = parse_env("OFFLOAD_HOST_DEVICES") {
            config.host_devices = devices;
        }
        if let Some(bytes) = parse_env("OFFLOAD_DEVICE_MEMORY") {
            config.device_memory = bytes;
        }

        config
    }

    /// Non-empty directories of the library search path, in order.
    pub fn search_dirs(&self) -> impl Iterator<Item = &str> {
        self.library_path.split(':').filter(|dir| !dir.is_empty())
    }

    /// Log level implied by the debug verbosity.
    #[must_use]
    pub fn log_level(&self) -> LogLevel {
        self.debug_level
            .map_or(LogLevel::Warn, LogLevel::from_debug_level)
    }

    /// Whether call tracing is active.
    #[must_use]
    pub fn tracing_enabled(&self) -> bool {
        self.trace_level >= 1
    }
}

impl ValidatableConfig for OffloadConfig {
    fn validate(&self) -> Result<()> {
        if self.library_path.contains('\0') {
            return Err(OffloadError::invalid_config(
                "library search path contains a NUL byte",
            ));
        }
        if self.host_devices > MAX_DEVICES {
            return Err(OffloadError::invalid_config(format!(
                "host_devices must be <= {MAX_DEVICES}, got {}",
                self.host_devices
            )));
        }
        Ok(())
    }
}

fn parse_env<T: FromStr>(var: &str) -> Option<T> {
    let val = std::env::var(var).ok()?;
    match val.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!("{var}: ignoring malformed value '{val}'");
            None
        }
    }
}
