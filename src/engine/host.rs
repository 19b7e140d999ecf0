// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Host-memory engine.
//!
//! Emulates a configurable number of devices inside the calling process:
//!
//! - device memory is a set of aligned heap regions addressed by opaque
//!   addresses issued from a counter;
//! - every stream owns a worker thread that drains its FIFO queue, so
//!   streams run concurrently while each stream stays ordered;
//! - enqueued work holds its regions, so releasing memory with work still
//!   outstanding never frees it under a running operation;
//! - kernels come from builtin [`KernelModule`]s or from native shared
//!   objects opened with `libloading`.

use super::module::{accepts_module_file, LoadedModule, NativeModule};
use super::queue::{StreamWorker, Task, TaskArg};
use super::{
    ArgValue, DeviceAddr, Engine, KernelFn, KernelModule, MemoryInfo, ModuleHandle, ModuleSource,
    Operation, StreamId,
};
use crate::config::OffloadConfig;
use crate::device::DeviceId;
use crate::error::{OffloadError, Result};
use crate::host::checked_end;
use crate::kernels;
use crate::logging::log_memory_usage;
use crate::memory::MemoryTracker;
use parking_lot::Mutex;
use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// An aligned, zero-initialised block of emulated device memory.
pub(crate) struct Region {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the region is plain memory; concurrent access is ordered by the
// stream queues, and cross-stream races are the caller's responsibility.
unsafe impl Send for Region {}
// SAFETY: as above.
unsafe impl Sync for Region {}

impl Region {
    pub(crate) fn new(nbytes: usize, alignment: usize) -> Result<Self> {
        if nbytes == 0 {
            return Err(OffloadError::invalid_argument("cannot allocate zero bytes"));
        }
        let layout = Layout::from_size_align(nbytes, alignment).map_err(|_| {
            OffloadError::invalid_argument(format!(
                "invalid alignment {alignment} for {nbytes} bytes"
            ))
        })?;
        // SAFETY: the layout has non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr)
            .ok_or_else(|| OffloadError::oom(format!("host allocation of {nbytes} bytes failed")))?;
        Ok(Self { ptr, layout })
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub(crate) fn len(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // SAFETY: allocated in `Region::new` with this layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

struct DeviceState {
    regions: Mutex<HashMap<DeviceAddr, Arc<Region>>>,
    modules: Mutex<HashMap<ModuleHandle, Arc<LoadedModule>>>,
    memory: MemoryTracker,
}

impl DeviceState {
    fn new(capacity: usize) -> Self {
        Self {
            regions: Mutex::new(HashMap::new()),
            modules: Mutex::new(HashMap::new()),
            memory: MemoryTracker::with_limit(capacity),
        }
    }

    fn region(&self, addr: DeviceAddr) -> Result<Arc<Region>> {
        self.regions.lock().get(&addr).cloned().ok_or_else(|| {
            OffloadError::invalid_argument(format!("unknown device address {addr}"))
        })
    }

    fn module(&self, handle: ModuleHandle) -> Result<Arc<LoadedModule>> {
        self.modules.lock().get(&handle).cloned().ok_or_else(|| {
            OffloadError::invalid_argument(format!("unknown module handle {}", handle.0))
        })
    }
}

/// Builder for [`HostEngine`].
#[derive(Debug, Default)]
pub struct HostEngineBuilder {
    devices: usize,
    device_memory: usize,
    modules: Vec<KernelModule>,
}

impl HostEngineBuilder {
    /// Number of emulated devices.
    #[must_use]
    pub fn devices(mut self, devices: usize) -> Self {
        self.devices = devices;
        self
    }

    /// Capacity of each device in bytes (0 = unlimited).
    #[must_use]
    pub fn device_memory(mut self, bytes: usize) -> Self {
        self.device_memory = bytes;
        self
    }

    /// Register an additional builtin module.
    #[must_use]
    pub fn module(mut self, module: KernelModule) -> Self {
        self.modules.push(module);
        self
    }

    /// Build the engine. The array kernel module is always registered.
    #[must_use]
    pub fn build(self) -> HostEngine {
        let mut builtins = HashMap::new();
        for module in std::iter::once(kernels::array_module()).chain(self.modules) {
            builtins.insert(module.name().to_string(), Arc::new(module));
        }
        tracing::info!(
            devices = self.devices,
            capacity = self.device_memory,
            "host engine ready"
        );
        HostEngine {
            devices: (0..self.devices)
                .map(|_| DeviceState::new(self.device_memory))
                .collect(),
            builtins,
            streams: Mutex::new(HashMap::new()),
            next_stream: AtomicU64::new(1),
            next_addr: AtomicU64::new(1),
            next_module: AtomicU64::new(1),
        }
    }
}

/// Engine emulating devices in host memory.
pub struct HostEngine {
    devices: Vec<DeviceState>,
    builtins: HashMap<String, Arc<KernelModule>>,
    streams: Mutex<HashMap<StreamId, StreamWorker>>,
    next_stream: AtomicU64,
    next_addr: AtomicU64,
    next_module: AtomicU64,
}

impl HostEngine {
    /// Engine with `devices` unlimited devices.
    #[must_use]
    pub fn new(devices: usize) -> Self {
        Self::builder().devices(devices).build()
    }

    /// Start building an engine.
    #[must_use]
    pub fn builder() -> HostEngineBuilder {
        HostEngineBuilder::default()
    }

    /// Engine sized from `OFFLOAD_HOST_DEVICES` / `OFFLOAD_DEVICE_MEMORY`.
    #[must_use]
    pub fn from_config(config: &OffloadConfig) -> Self {
        Self::builder()
            .devices(config.host_devices)
            .device_memory(config.device_memory)
            .build()
    }

    fn index(&self, device: DeviceId) -> Result<usize> {
        let index = device.index_or_default();
        if index < self.devices.len() {
            Ok(index)
        } else {
            Err(OffloadError::device_not_available(format!(
                "{device} (engine has {} devices)",
                self.devices.len()
            )))
        }
    }

    fn device(&self, device: DeviceId) -> Result<&DeviceState> {
        Ok(&self.devices[self.index(device)?])
    }

    fn resolve(&self, state: &DeviceState, op: Operation) -> Result<Task> {
        let nonzero = |nbytes: usize| {
            if nbytes == 0 {
                Err(OffloadError::invalid_argument("transfer of zero bytes"))
            } else {
                Ok(())
            }
        };
        Ok(match op {
            Operation::HostToDevice {
                src,
                src_offset,
                dst,
                dst_offset,
                nbytes,
            } => {
                nonzero(nbytes)?;
                let dst = state.region(dst)?;
                checked_end(src_offset, nbytes, src.len(), "host buffer")?;
                checked_end(dst_offset, nbytes, dst.len(), "device region")?;
                Task::HostToDevice {
                    src,
                    src_offset,
                    dst,
                    dst_offset,
                    nbytes,
                }
            }
            Operation::DeviceToHost {
                src,
                src_offset,
                dst,
                dst_offset,
                nbytes,
            } => {
                nonzero(nbytes)?;
                let src = state.region(src)?;
                checked_end(src_offset, nbytes, src.len(), "device region")?;
                checked_end(dst_offset, nbytes, dst.len(), "host buffer")?;
                Task::DeviceToHost {
                    src,
                    src_offset,
                    dst,
                    dst_offset,
                    nbytes,
                }
            }
            Operation::DeviceToDevice {
                src,
                src_offset,
                dst,
                dst_offset,
                nbytes,
            } => {
                nonzero(nbytes)?;
                let src = state.region(src)?;
                let dst = state.region(dst)?;
                checked_end(src_offset, nbytes, src.len(), "device region")?;
                checked_end(dst_offset, nbytes, dst.len(), "device region")?;
                Task::DeviceToDevice {
                    src,
                    src_offset,
                    dst,
                    dst_offset,
                    nbytes,
                }
            }
            Operation::Invoke {
                module,
                kernel,
                name,
                args,
            } => {
                let module = state.module(module)?;
                let mut dims = Vec::with_capacity(args.len());
                let mut types = Vec::with_capacity(args.len());
                let mut values = Vec::with_capacity(args.len());
                let mut sizes = Vec::with_capacity(args.len());
                for arg in args {
                    dims.push(arg.dims);
                    types.push(arg.type_code);
                    sizes.push(arg.size);
                    values.push(match arg.value {
                        ArgValue::Null => TaskArg::Null,
                        ArgValue::Device(addr) => TaskArg::Region(state.region(addr)?),
                        ArgValue::Scalar(words) => TaskArg::Scalar(Box::new(words)),
                    });
                }
                Task::Invoke {
                    module,
                    kernel,
                    name,
                    dims,
                    types,
                    values,
                    sizes,
                }
            }
        })
    }
}

impl Engine for HostEngine {
    fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn stream_create(&self, device: DeviceId) -> Result<StreamId> {
        let index = self.index(device)?;
        let id = StreamId(self.next_stream.fetch_add(1, Ordering::Relaxed));
        let worker = StreamWorker::spawn(id.0, index)?;
        self.streams.lock().insert(id, worker);
        tracing::trace!(%device, stream = %id, "stream created");
        Ok(id)
    }

    fn stream_destroy(&self, device: DeviceId, stream: StreamId) -> Result<()> {
        let worker = self.streams.lock().remove(&stream).ok_or_else(|| {
            OffloadError::invalid_argument(format!("unknown stream {stream} on {device}"))
        })?;
        // Joins the worker after its queue drains.
        drop(worker);
        tracing::trace!(%device, %stream, "stream destroyed");
        Ok(())
    }

    fn stream_sync(&self, device: DeviceId, stream: StreamId) -> Result<()> {
        let queue = self
            .streams
            .lock()
            .get(&stream)
            .map(|worker| Arc::clone(&worker.queue))
            .ok_or_else(|| {
                OffloadError::invalid_argument(format!("unknown stream {stream} on {device}"))
            })?;
        queue.wait_idle();
        Ok(())
    }

    fn allocate(&self, device: DeviceId, nbytes: usize, alignment: usize) -> Result<DeviceAddr> {
        let state = self.device(device)?;
        state.memory.allocate(nbytes)?;
        let region = match Region::new(nbytes, alignment) {
            Ok(region) => region,
            Err(err) => {
                state.memory.deallocate(nbytes);
                return Err(err);
            }
        };
        let addr = DeviceAddr::new(self.next_addr.fetch_add(1, Ordering::Relaxed) << 12);
        state.regions.lock().insert(addr, Arc::new(region));
        log_memory_usage(
            state.memory.allocated_bytes(),
            state.memory.peak_bytes(),
            format_args!("{device} after allocating {nbytes} bytes at {addr}"),
        );
        Ok(addr)
    }

    fn deallocate(&self, device: DeviceId, addr: DeviceAddr) -> Result<()> {
        let state = self.device(device)?;
        let region = state.regions.lock().remove(&addr).ok_or_else(|| {
            OffloadError::invalid_argument(format!("unknown device address {addr} on {device}"))
        })?;
        state.memory.deallocate(region.len());
        Ok(())
    }

    fn translate_pointer(&self, device: DeviceId, addr: DeviceAddr) -> Result<u64> {
        let region = self.device(device)?.region(addr)?;
        Ok(region.as_ptr() as u64)
    }

    fn memory_info(&self, device: DeviceId) -> Result<MemoryInfo> {
        let memory = &self.device(device)?.memory;
        let physical = match memory.limit_bytes() {
            0 => usize::MAX,
            limit => limit,
        };
        Ok(MemoryInfo {
            allocatable: memory.available_bytes(),
            physical,
        })
    }

    fn enqueue(&self, device: DeviceId, stream: StreamId, op: Operation) -> Result<()> {
        let index = self.index(device)?;
        let (queue, owner) = self
            .streams
            .lock()
            .get(&stream)
            .map(|worker| (Arc::clone(&worker.queue), worker.device))
            .ok_or_else(|| {
                OffloadError::invalid_argument(format!("unknown stream {stream} on {device}"))
            })?;
        if owner != index {
            return Err(OffloadError::device_mismatch(
                format!("device {owner}"),
                format!("device {index}"),
            ));
        }
        let kind = op.kind();
        let task = self.resolve(&self.devices[index], op)?;
        queue.push(task);
        tracing::trace!(%device, %stream, kind, "enqueued");
        Ok(())
    }

    fn has_builtin_module(&self, name: &str) -> bool {
        self.builtins.contains_key(name)
    }

    fn accepts_module(&self, path: &Path) -> bool {
        accepts_module_file(path)
    }

    fn load_module(&self, device: DeviceId, source: &ModuleSource) -> Result<ModuleHandle> {
        let state = self.device(device)?;
        let module = match source {
            ModuleSource::Builtin(name) => {
                let module = self.builtins.get(name).ok_or_else(|| {
                    OffloadError::engine(format!("no builtin module named '{name}'"))
                })?;
                LoadedModule::Builtin(Arc::clone(module))
            }
            ModuleSource::File(path) => LoadedModule::Native(NativeModule::stage(path)?),
        };
        let handle = ModuleHandle(self.next_module.fetch_add(1, Ordering::Relaxed));
        state.modules.lock().insert(handle, Arc::new(module));
        Ok(handle)
    }

    fn unload_module(&self, device: DeviceId, module: ModuleHandle) -> Result<()> {
        let state = self.device(device)?;
        let removed = state.modules.lock().remove(&module).ok_or_else(|| {
            OffloadError::invalid_argument(format!("unknown module handle {} on {device}", module.0))
        })?;
        if Arc::strong_count(&removed) > 1 {
            tracing::debug!(%device, module = module.0, "module still referenced by queued work");
        }
        Ok(())
    }

    fn find_kernel(
        &self,
        device: DeviceId,
        module: ModuleHandle,
        symbol: &str,
    ) -> Result<Option<KernelFn>> {
        Ok(self.device(device)?.module(module)?.get(symbol))
    }
}

impl fmt::Debug for HostEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostEngine")
            .field("devices", &self.devices.len())
            .field("builtins", &self.builtins.keys().collect::<Vec<_>>())
            .field("streams", &self.streams.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostBuffer;

    const DEV0: DeviceId = DeviceId::Index(0);

    #[test]
    fn test_region_alignment() {
        let region = Region::new(100, 4096).unwrap();
        assert_eq!(region.as_ptr() as usize % 4096, 0);
        assert_eq!(region.len(), 100);
        assert!(Region::new(8, 3).is_err());
        assert!(Region::new(0, 8).is_err());
    }

    #[test]
    fn test_transfer_roundtrip() {
        let engine = HostEngine::new(1);
        let stream = engine.stream_create(DEV0).unwrap();
        let addr = engine.allocate(DEV0, 16, 64).unwrap();
        let src = HostBuffer::from_slice(&[1u64, 2]);
        let dst = HostBuffer::zeroed(16);
        engine
            .enqueue(
                DEV0,
                stream,
                Operation::HostToDevice {
                    src,
                    src_offset: 0,
                    dst: addr,
                    dst_offset: 0,
                    nbytes: 16,
                },
            )
            .unwrap();
        engine
            .enqueue(
                DEV0,
                stream,
                Operation::DeviceToHost {
                    src: addr,
                    src_offset: 8,
                    dst: dst.clone(),
                    dst_offset: 0,
                    nbytes: 8,
                },
            )
            .unwrap();
        engine.stream_sync(DEV0, stream).unwrap();
        assert_eq!(dst.to_vec::<u64>(), vec![2, 0]);
        engine.deallocate(DEV0, addr).unwrap();
        engine.stream_destroy(DEV0, stream).unwrap();
    }

    #[test]
    fn test_out_of_range_rejected() {
        let engine = HostEngine::new(1);
        let stream = engine.stream_create(DEV0).unwrap();
        let addr = engine.allocate(DEV0, 8, 8).unwrap();
        let err = engine
            .enqueue(
                DEV0,
                stream,
                Operation::HostToDevice {
                    src: HostBuffer::zeroed(16),
                    src_offset: 0,
                    dst: addr,
                    dst_offset: 4,
                    nbytes: 8,
                },
            )
            .unwrap_err();
        assert!(matches!(err, OffloadError::InvalidArgument(_)));
    }

    #[test]
    fn test_capacity_limit() {
        let engine = HostEngine::builder().devices(2).device_memory(1024).build();
        let a = engine.allocate(DEV0, 1000, 64).unwrap();
        assert!(matches!(
            engine.allocate(DEV0, 100, 64),
            Err(OffloadError::OutOfMemory { .. })
        ));
        // Capacity is per device.
        assert!(engine.allocate(DeviceId::Index(1), 100, 64).is_ok());
        let info = engine.memory_info(DEV0).unwrap();
        assert_eq!(info.physical, 1024);
        assert_eq!(info.allocatable, 24);
        engine.deallocate(DEV0, a).unwrap();
        assert!(engine.allocate(DEV0, 100, 64).is_ok());
    }

    #[test]
    fn test_double_free_reported() {
        let engine = HostEngine::new(1);
        let addr = engine.allocate(DEV0, 8, 8).unwrap();
        engine.deallocate(DEV0, addr).unwrap();
        assert!(engine.deallocate(DEV0, addr).is_err());
        assert!(engine.translate_pointer(DEV0, addr).is_err());
    }

    #[test]
    fn test_any_maps_to_first_device() {
        let engine = HostEngine::new(1);
        let addr = engine.allocate(DeviceId::Any, 8, 8).unwrap();
        assert!(engine.translate_pointer(DEV0, addr).is_ok());

        let empty = HostEngine::new(0);
        assert!(matches!(
            empty.stream_create(DeviceId::Any),
            Err(OffloadError::DeviceNotAvailable { .. })
        ));
    }

    #[test]
    fn test_stream_device_checked() {
        let engine = HostEngine::new(2);
        let stream = engine.stream_create(DeviceId::Index(1)).unwrap();
        let addr = engine.allocate(DEV0, 8, 8).unwrap();
        let err = engine
            .enqueue(
                DEV0,
                stream,
                Operation::DeviceToDevice {
                    src: addr,
                    src_offset: 0,
                    dst: addr,
                    dst_offset: 0,
                    nbytes: 8,
                },
            )
            .unwrap_err();
        assert!(matches!(err, OffloadError::DeviceMismatch { .. }));
    }

    #[test]
    fn test_builtin_modules() {
        let engine = HostEngine::new(1);
        assert!(engine.has_builtin_module(kernels::ARRAY_LIBRARY));
        assert!(!engine.has_builtin_module("libmissing.so"));
        let handle = engine
            .load_module(DEV0, &ModuleSource::Builtin(kernels::ARRAY_LIBRARY.into()))
            .unwrap();
        assert!(engine
            .find_kernel(DEV0, handle, "offload_array_fill")
            .unwrap()
            .is_some());
        assert!(engine.find_kernel(DEV0, handle, "nope").unwrap().is_none());
        engine.unload_module(DEV0, handle).unwrap();
        assert!(engine.find_kernel(DEV0, handle, "offload_array_fill").is_err());
    }
}
