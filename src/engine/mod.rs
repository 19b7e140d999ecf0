// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! The engine boundary.
//!
//! Everything above this module talks to devices only through the
//! [`Engine`] trait: stream creation and synchronisation, allocation,
//! enqueueing of transfers and kernel invocations, and module loading. All
//! calls are synchronous on the host; the work they enqueue executes
//! asynchronously in per-stream FIFO order.
//!
//! [`HostEngine`] is the reference implementation. It emulates devices in
//! host memory with one worker thread per stream.

mod host;
mod module;
mod queue;

pub use host::{HostEngine, HostEngineBuilder};
pub use module::{accepts_module_header, KernelModule};

use crate::device::DeviceId;
use crate::error::Result;
use crate::host::HostBuffer;
use std::ffi::c_void;
use std::fmt;
use std::path::{Path, PathBuf};

/// Native kernel calling convention.
///
/// `dims[i]` is 1 for array arguments (`ptrs[i]` is a device pointer or null)
/// and 0 for scalars (`ptrs[i]` points at the value in host memory).
/// `types[i]` is the element type code and `sizes[i]` the size in bytes.
pub type KernelFn = unsafe extern "C" fn(
    argc: i64,
    dims: *const i64,
    types: *const i64,
    ptrs: *const *mut c_void,
    sizes: *const i64,
);

/// Opaque device address ("fake pointer").
///
/// Only meaningful to the engine that issued it; use
/// [`Engine::translate_pointer`] for the real address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddr(u64);

impl DeviceAddr {
    /// The null address.
    pub const NULL: Self = Self(0);

    /// Wrap a raw engine address.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw engine address.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Check for the null address.
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for DeviceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Engine-level stream identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Engine-level handle of a loaded module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleHandle(pub u64);

/// Device memory figures in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    /// Bytes still available for allocation.
    pub allocatable: usize,
    /// Total device capacity.
    pub physical: usize,
}

/// Where a module comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleSource {
    /// A module compiled into the engine, by name.
    Builtin(String),
    /// A shared object on the file system.
    File(PathBuf),
}

impl fmt::Display for ModuleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Builtin(name) => write!(f, "<builtin>/{name}"),
            Self::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Value of one kernel argument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ArgValue {
    /// Null device pointer.
    Null,
    /// A device region passed by (translated) address.
    Device(DeviceAddr),
    /// A scalar held by the engine and passed by host address.
    Scalar([u64; 2]),
}

/// One row of the argument descriptor table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArgDescriptor {
    /// 1 for arrays, 0 for scalars.
    pub dims: i64,
    /// Element type code.
    pub type_code: i64,
    /// Argument value.
    pub value: ArgValue,
    /// Size in bytes.
    pub size: i64,
}

/// Work item enqueued on a stream.
#[derive(Debug, Clone)]
pub enum Operation {
    /// Copy host bytes into a device region.
    HostToDevice {
        /// Source buffer.
        src: HostBuffer,
        /// Byte offset into the source.
        src_offset: usize,
        /// Destination region.
        dst: DeviceAddr,
        /// Byte offset into the destination.
        dst_offset: usize,
        /// Bytes to copy.
        nbytes: usize,
    },
    /// Copy device bytes into a host buffer.
    DeviceToHost {
        /// Source region.
        src: DeviceAddr,
        /// Byte offset into the source.
        src_offset: usize,
        /// Destination buffer.
        dst: HostBuffer,
        /// Byte offset into the destination.
        dst_offset: usize,
        /// Bytes to copy.
        nbytes: usize,
    },
    /// Copy bytes between two device regions of the same device.
    DeviceToDevice {
        /// Source region.
        src: DeviceAddr,
        /// Byte offset into the source.
        src_offset: usize,
        /// Destination region.
        dst: DeviceAddr,
        /// Byte offset into the destination.
        dst_offset: usize,
        /// Bytes to copy.
        nbytes: usize,
    },
    /// Run a kernel with a descriptor table.
    Invoke {
        /// Module the kernel was resolved from; stays loaded until the call
        /// has returned.
        module: ModuleHandle,
        /// Kernel entry point.
        kernel: KernelFn,
        /// Kernel name, for diagnostics.
        name: String,
        /// Argument descriptors in call order.
        args: Vec<ArgDescriptor>,
    },
}

impl Operation {
    /// Short name for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::HostToDevice { .. } => "host_to_device",
            Self::DeviceToHost { .. } => "device_to_host",
            Self::DeviceToDevice { .. } => "device_to_device",
            Self::Invoke { .. } => "invoke",
        }
    }
}

/// Primitive device operations consumed by the runtime.
///
/// Implementations must validate enqueued work synchronously and report
/// failures from the enqueueing call. Work enqueued on one stream executes in
/// order; work on different streams may run concurrently.
pub trait Engine: Send + Sync {
    /// Number of devices, queried once when the registry is built.
    fn device_count(&self) -> usize;

    /// Create a stream on `device`.
    ///
    /// ## Errors
    ///
    /// Fails if the device does not exist or the stream cannot be started.
    fn stream_create(&self, device: DeviceId) -> Result<StreamId>;

    /// Destroy a stream after its queued work has run.
    ///
    /// ## Errors
    ///
    /// Fails for unknown streams.
    fn stream_destroy(&self, device: DeviceId, stream: StreamId) -> Result<()>;

    /// Block until all work enqueued on `stream` has completed.
    ///
    /// ## Errors
    ///
    /// Fails for unknown streams.
    fn stream_sync(&self, device: DeviceId, stream: StreamId) -> Result<()>;

    /// Reserve `nbytes` bytes aligned to `alignment`.
    ///
    /// ## Errors
    ///
    /// Fails on exhausted capacity or an invalid alignment.
    fn allocate(&self, device: DeviceId, nbytes: usize, alignment: usize) -> Result<DeviceAddr>;

    /// Release a region. Work already queued against it still completes.
    ///
    /// ## Errors
    ///
    /// Fails for unknown addresses.
    fn deallocate(&self, device: DeviceId, addr: DeviceAddr) -> Result<()>;

    /// Real device address behind `addr`.
    ///
    /// ## Errors
    ///
    /// Fails for unknown addresses.
    fn translate_pointer(&self, device: DeviceId, addr: DeviceAddr) -> Result<u64>;

    /// Memory figures of `device`.
    ///
    /// ## Errors
    ///
    /// Fails if the device does not exist.
    fn memory_info(&self, device: DeviceId) -> Result<MemoryInfo>;

    /// Validate and enqueue an operation on `stream`.
    ///
    /// ## Errors
    ///
    /// Fails for unknown streams or addresses and out-of-range transfers.
    fn enqueue(&self, device: DeviceId, stream: StreamId, op: Operation) -> Result<()>;

    /// Whether `name` refers to a module compiled into the engine.
    fn has_builtin_module(&self, name: &str) -> bool;

    /// Whether `path` is a module this engine can load.
    fn accepts_module(&self, path: &Path) -> bool;

    /// Load a module on `device`.
    ///
    /// ## Errors
    ///
    /// Fails if the module cannot be found or opened.
    fn load_module(&self, device: DeviceId, source: &ModuleSource) -> Result<ModuleHandle>;

    /// Unload a module, removing any staged files. Kernel calls already
    /// queued from the module still run before it is released.
    ///
    /// ## Errors
    ///
    /// Fails for unknown handles.
    fn unload_module(&self, device: DeviceId, module: ModuleHandle) -> Result<()>;

    /// Resolve `symbol` in a loaded module; `Ok(None)` if it is not exported.
    ///
    /// ## Errors
    ///
    /// Fails for unknown handles.
    fn find_kernel(
        &self,
        device: DeviceId,
        module: ModuleHandle,
        symbol: &str,
    ) -> Result<Option<KernelFn>>;
}
