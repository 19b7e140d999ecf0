// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! # offload-core
//!
//! Stream-based offload runtime: manage memory on attached compute devices,
//! move data between host and device asynchronously, and invoke native
//! kernels with automatic copy-in/copy-out of host arrays.
//!
//! ## Design Philosophy
//!
//! **Explicit over implicit**: devices live in a [`DeviceRegistry`] the caller
//! owns, memory is released by dropping its handle, and data only moves when
//! a transfer is enqueued. Every argument error is reported by the call that
//! caused it; nothing is deferred to the next [`Stream::sync`].
//!
//! ## Modules
//!
//! - [`device`] - Device registry, device handles and stream creation
//! - [`stream`] - Ordered work queues: allocation, transfers, synchronisation
//! - [`library`] - Locating and loading kernel libraries, resolving kernels
//! - [`invoke`] - Kernel invocation and argument marshalling
//! - [`array`] / [`array_ops`] - Device-resident arrays and elementwise operations
//! - [`engine`] - The engine boundary and the in-process [`HostEngine`]
//! - [`config`], [`logging`], [`trace`] - Environment configuration, log setup, call tracing
//!
//! ## Quick Start
//!
//! ```rust
//! use offload_core::{kernel_args, kernels, DeviceRegistry, HostArray, HostEngine, OffloadConfig};
//! use std::sync::Arc;
//!
//! fn main() -> offload_core::Result<()> {
//!     let registry = DeviceRegistry::new(Arc::new(HostEngine::new(1)), OffloadConfig::default())?;
//!     let device = registry.device(0)?;
//!     let stream = device.default_stream()?;
//!
//!     let library = device.load_library(kernels::ARRAY_LIBRARY)?;
//!     let fill = library.kernel(kernels::symbols::FILL)?;
//!
//!     let host = HostArray::from_slice(&[1i64, 2, 3, 4]);
//!     let array = stream.bind(&host, true)?;
//!     // type code 0 selects int64 elements
//!     stream.invoke(&fill, &kernel_args![0, 4, &array, 7])?;
//!     array.update_host()?;
//!     stream.sync()?;
//!
//!     assert_eq!(host.to_vec::<i64>()?, vec![7, 7, 7, 7]);
//!     Ok(())
//! }
//! ```
//!
//! ## Environment
//!
//! [`OffloadConfig::from_env`] reads `OFFLOAD_DEBUG`, `OFFLOAD_TRACE`,
//! `OFFLOAD_TRACE_STACKS`, `OFFLOAD_LIBRARY_PATH`, `OFFLOAD_HOST_DEVICES` and
//! `OFFLOAD_DEVICE_MEMORY`.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod array;
pub mod array_ops;
pub mod config;
pub mod device;
pub mod dtype;
pub mod engine;
pub mod error;
pub mod host;
pub mod invoke;
pub mod kernels;
pub mod library;
pub mod logging;
pub mod memory;
pub mod stream;
pub mod trace;

// Re-exports for convenience
pub use array::DeviceArray;
pub use array_ops::Operand;
pub use config::{OffloadConfig, ValidatableConfig};
pub use device::{Device, DeviceId, DeviceRegistry};
pub use dtype::{Complex, DType, Element, Scalar};
pub use engine::{Engine, HostEngine, KernelModule, MemoryInfo};
pub use error::{OffloadError, Result};
pub use host::{HostArray, HostBuffer, Layout};
pub use invoke::{ArgClass, KernelArg, MAX_KERNEL_ARGS};
pub use library::{locate, Kernel, Library};
pub use logging::{init_logging, LogConfig, LogLevel};
pub use memory::{estimate_array_bytes, AllocOptions, DeviceAllocation, MemoryTracker};
pub use stream::Stream;
pub use trace::{StackCapture, TraceEvent, Tracer};
