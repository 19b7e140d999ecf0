// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Error types for the offload runtime.
//!
//! Every fallible operation reports its failure at the call that caused it,
//! before any asynchronous work is enqueued. Faults raised by work that is
//! already executing on a device (for example an out-of-bounds access inside a
//! kernel) are outside the reach of these types.
//!
//! ## Error Hierarchy
//!
//! ```text
//! OffloadError
//! ├── InvalidArgument     - Malformed size, offset, alignment or arity
//! ├── UnsupportedLayout   - Host array is neither row- nor column-major
//! ├── UnsupportedType     - Element type outside the kernel type set
//! ├── ShapeMismatch       - Reshape or operand element counts disagree
//! ├── LibraryNotFound     - No loadable module on the search path
//! ├── SymbolNotFound      - Module does not export the kernel
//! ├── DeviceMismatch      - Kernel, array or stream on another device
//! ├── DeviceNotAvailable  - Requested device does not exist
//! ├── OutOfMemory         - Device capacity exhausted
//! ├── InvalidConfig       - Configuration validation failures
//! ├── Engine              - Engine-level failure
//! └── Io                  - File system errors
//! ```

use thiserror::Error;

/// Result type alias for offload operations.
pub type Result<T> = std::result::Result<T, OffloadError>;

/// Errors raised by the offload runtime.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum OffloadError {
    /// A size, offset, alignment or argument count is out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Host array storage order is not a supported contiguous layout.
    #[error("unsupported layout: {0}")]
    UnsupportedLayout(String),

    /// Element type is not in the supported kernel type set.
    #[error("unsupported type: {0}")]
    UnsupportedType(String),

    /// Element counts or shapes are incompatible.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape.
        expected: Vec<usize>,
        /// Actual shape received.
        actual: Vec<usize>,
    },

    /// No matching, architecture-valid module was found.
    #[error("cannot find library '{name}' in search path '{search_path}'")]
    LibraryNotFound {
        /// Requested library file name.
        name: String,
        /// Colon-separated search path that was scanned.
        search_path: String,
    },

    /// The loaded module does not export the requested kernel.
    #[error("kernel '{symbol}' not found in library '{library}'")]
    SymbolNotFound {
        /// Requested symbol name.
        symbol: String,
        /// Library the lookup was performed in.
        library: String,
    },

    /// An object was used with a stream of a different device.
    #[error("device mismatch: expected {expected}, got {actual}")]
    DeviceMismatch {
        /// Device the operation is bound to.
        expected: String,
        /// Device of the offending object.
        actual: String,
    },

    /// Requested device does not exist.
    #[error("device not available: {device}")]
    DeviceNotAvailable {
        /// Description of the unavailable device.
        device: String,
    },

    /// Device memory exhausted.
    #[error("out of memory: {message}")]
    OutOfMemory {
        /// Descriptive error message.
        message: String,
    },

    /// Invalid configuration parameter.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Engine-level failure.
    #[error("engine error: {0}")]
    Engine(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(String),
}

impl OffloadError {
    /// Create an invalid argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an unsupported layout error.
    pub fn unsupported_layout(msg: impl Into<String>) -> Self {
        Self::UnsupportedLayout(msg.into())
    }

    /// Create an unsupported type error.
    pub fn unsupported_type(msg: impl Into<String>) -> Self {
        Self::UnsupportedType(msg.into())
    }

    /// Create a shape mismatch error.
    pub fn shape_mismatch(expected: impl Into<Vec<usize>>, actual: impl Into<Vec<usize>>) -> Self {
        Self::ShapeMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create a device mismatch error.
    pub fn device_mismatch(expected: impl ToString, actual: impl ToString) -> Self {
        Self::DeviceMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Create a device not available error.
    pub fn device_not_available(device: impl Into<String>) -> Self {
        Self::DeviceNotAvailable {
            device: device.into(),
        }
    }

    /// Create an out of memory error.
    pub fn oom(msg: impl Into<String>) -> Self {
        Self::OutOfMemory {
            message: msg.into(),
        }
    }

    /// Create an invalid configuration error.
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create an engine error.
    pub fn engine(msg: impl Into<String>) -> Self {
        Self::Engine(msg.into())
    }

    /// Create an I/O error.
    pub fn io(msg: impl Into<String>) -> Self {
        Self::Io(msg.into())
    }
}

impl From<std::io::Error> for OffloadError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
