// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Streams: ordered, asynchronous work queues on one device.
//!
//! Everything enqueued through one [`Stream`] runs in enqueue order. Work on
//! different streams, even of the same device, is unordered; callers that need
//! cross-stream ordering must [`Stream::sync`] explicitly.
//!
//! Transfers and allocations validate their arguments before anything is
//! enqueued, so every argument error is reported by the call that caused it.
//!
//! ## Example
//!
//! ```rust
//! use offload_core::{DeviceRegistry, HostBuffer, HostEngine, OffloadConfig};
//! use std::sync::Arc;
//!
//! let registry = DeviceRegistry::new(Arc::new(HostEngine::new(1)), OffloadConfig::default())?;
//! let stream = registry.device(0)?.default_stream()?;
//!
//! let src = HostBuffer::from_slice(&[1u8, 2, 3, 4]);
//! let dst = HostBuffer::zeroed(4);
//! let mem = stream.allocate(4)?;
//! stream.host_to_device(&src, &mem, 4, 0, 0)?;
//! stream.device_to_host(&mem, &dst, 4, 0, 0)?;
//! stream.sync()?;
//! assert_eq!(dst.to_bytes(), vec![1, 2, 3, 4]);
//! # Ok::<(), offload_core::OffloadError>(())
//! ```

use crate::device::{Context, DeviceId};
use crate::engine::{Operation, StreamId};
use crate::error::{OffloadError, Result};
use crate::host::{checked_end, HostBuffer};
use crate::memory::{AllocOptions, DeviceAllocation};
use std::fmt;
use std::sync::Arc;

struct StreamInner {
    ctx: Arc<Context>,
    device: DeviceId,
    id: StreamId,
    ordinal: u64,
}

impl Drop for StreamInner {
    fn drop(&mut self) {
        if let Err(err) = self.ctx.engine.stream_destroy(self.device, self.id) {
            tracing::warn!(device = %self.device, stream = %self.id, "failed to destroy stream: {err}");
        }
    }
}

/// Handle to an engine stream; the stream is destroyed with its last handle.
#[derive(Clone)]
pub struct Stream {
    inner: Arc<StreamInner>,
}

impl Stream {
    pub(crate) fn create(ctx: Arc<Context>, device: DeviceId, ordinal: u64) -> Result<Self> {
        let id = ctx.engine.stream_create(device)?;
        tracing::debug!(%device, stream = %id, ordinal, "created stream");
        Ok(Self {
            inner: Arc::new(StreamInner {
                ctx,
                device,
                id,
                ordinal,
            }),
        })
    }

    pub(crate) fn context(&self) -> &Arc<Context> {
        &self.inner.ctx
    }

    /// Device this stream belongs to.
    #[must_use]
    pub fn device_id(&self) -> DeviceId {
        self.inner.device
    }

    /// Engine-level stream identifier.
    #[must_use]
    pub fn id(&self) -> StreamId {
        self.inner.id
    }

    /// Creation order of this stream on its device.
    #[must_use]
    pub fn ordinal(&self) -> u64 {
        self.inner.ordinal
    }

    /// Whether both handles refer to the same stream.
    #[must_use]
    pub fn same_stream(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn check_device(&self, device: DeviceId) -> Result<()> {
        if device == self.inner.device {
            Ok(())
        } else {
            Err(OffloadError::device_mismatch(self.inner.device, device))
        }
    }

    pub(crate) fn enqueue(&self, op: Operation) -> Result<()> {
        self.inner
            .ctx
            .engine
            .enqueue(self.inner.device, self.inner.id, op)
    }

    /// Block until all work enqueued on this stream has completed.
    ///
    /// ## Errors
    ///
    /// Fails if the engine no longer knows the stream.
    #[track_caller]
    pub fn sync(&self) -> Result<()> {
        let _trace = self.inner.ctx.tracer.start("sync", || self.to_string());
        tracing::debug!(device = %self.inner.device, stream = %self.inner.id, "synchronizing");
        self.inner
            .ctx
            .engine
            .stream_sync(self.inner.device, self.inner.id)
    }

    /// Allocate `nbytes` bytes with default options.
    ///
    /// ## Errors
    ///
    /// See [`Stream::allocate_with`].
    #[track_caller]
    pub fn allocate(&self, nbytes: usize) -> Result<DeviceAllocation> {
        self.allocate_with(nbytes, AllocOptions::default())
    }

    /// Allocate `nbytes` bytes on this stream's device.
    ///
    /// The call is synchronous: it neither waits for queued work nor overlaps
    /// with later enqueues.
    ///
    /// ## Errors
    ///
    /// Returns [`OffloadError::InvalidArgument`] for a zero size or an
    /// alignment that is not a power of two, before the engine is called, and
    /// [`OffloadError::OutOfMemory`] when the device is full.
    #[track_caller]
    pub fn allocate_with(&self, nbytes: usize, options: AllocOptions) -> Result<DeviceAllocation> {
        let _trace = self.inner.ctx.tracer.start("allocate", || {
            format!("{self} nbytes={nbytes} alignment={}", options.alignment)
        });
        if nbytes == 0 {
            return Err(OffloadError::invalid_argument(
                "cannot allocate a buffer of zero bytes",
            ));
        }
        if !options.alignment.is_power_of_two() {
            return Err(OffloadError::invalid_argument(format!(
                "alignment {} is not a power of two",
                options.alignment
            )));
        }
        let addr = self
            .inner
            .ctx
            .engine
            .allocate(self.inner.device, nbytes, options.alignment)?;
        tracing::debug!(
            device = %self.inner.device,
            %addr,
            nbytes,
            sticky = options.sticky,
            "allocated device memory"
        );
        Ok(DeviceAllocation::new(
            self.clone(),
            addr,
            nbytes,
            options.sticky,
        ))
    }

    /// Release an allocation now instead of at drop. No-op for sticky handles.
    ///
    /// ## Errors
    ///
    /// Returns [`OffloadError::DeviceMismatch`] for memory of another device.
    pub fn deallocate(&self, allocation: DeviceAllocation) -> Result<()> {
        self.check_device(allocation.device())?;
        allocation.release()
    }

    /// Real device address behind an allocation, for passing as a scalar.
    ///
    /// ## Errors
    ///
    /// Returns [`OffloadError::DeviceMismatch`] for memory of another device.
    pub fn translate_device_pointer(&self, allocation: &DeviceAllocation) -> Result<u64> {
        self.check_device(allocation.device())?;
        self.inner
            .ctx
            .engine
            .translate_pointer(self.inner.device, allocation.addr())
    }

    /// Enqueue a copy of `nbytes` bytes from host memory to device memory.
    ///
    /// ## Errors
    ///
    /// Returns [`OffloadError::InvalidArgument`] for a zero size or a range
    /// outside either buffer and [`OffloadError::DeviceMismatch`] for memory
    /// of another device.
    #[track_caller]
    pub fn host_to_device(
        &self,
        src: &HostBuffer,
        dst: &DeviceAllocation,
        nbytes: usize,
        src_offset: usize,
        dst_offset: usize,
    ) -> Result<()> {
        let _trace = self.inner.ctx.tracer.start("transfer_host2device", || {
            format!("{dst} nbytes={nbytes} offset_host={src_offset} offset_device={dst_offset}")
        });
        check_transfer(nbytes)?;
        self.check_device(dst.device())?;
        checked_end(src_offset, nbytes, src.len(), "host buffer")?;
        checked_end(dst_offset, nbytes, dst.nbytes(), "device allocation")?;
        tracing::debug!(
            device = %self.inner.device,
            stream = %self.inner.id,
            dst = %dst.addr(),
            nbytes,
            src_offset,
            dst_offset,
            "transfer host -> device"
        );
        self.enqueue(Operation::HostToDevice {
            src: src.clone(),
            src_offset,
            dst: dst.addr(),
            dst_offset,
            nbytes,
        })
    }

    /// Enqueue a copy of `nbytes` bytes from device memory to host memory.
    ///
    /// ## Errors
    ///
    /// As for [`Stream::host_to_device`].
    #[track_caller]
    pub fn device_to_host(
        &self,
        src: &DeviceAllocation,
        dst: &HostBuffer,
        nbytes: usize,
        src_offset: usize,
        dst_offset: usize,
    ) -> Result<()> {
        let _trace = self.inner.ctx.tracer.start("transfer_device2host", || {
            format!("{src} nbytes={nbytes} offset_device={src_offset} offset_host={dst_offset}")
        });
        check_transfer(nbytes)?;
        self.check_device(src.device())?;
        checked_end(src_offset, nbytes, src.nbytes(), "device allocation")?;
        checked_end(dst_offset, nbytes, dst.len(), "host buffer")?;
        tracing::debug!(
            device = %self.inner.device,
            stream = %self.inner.id,
            src = %src.addr(),
            nbytes,
            src_offset,
            dst_offset,
            "transfer device -> host"
        );
        self.enqueue(Operation::DeviceToHost {
            src: src.addr(),
            src_offset,
            dst: dst.clone(),
            dst_offset,
            nbytes,
        })
    }

    /// Enqueue a copy of `nbytes` bytes between two allocations of this device.
    ///
    /// ## Errors
    ///
    /// As for [`Stream::host_to_device`].
    #[track_caller]
    pub fn device_to_device(
        &self,
        src: &DeviceAllocation,
        dst: &DeviceAllocation,
        nbytes: usize,
        src_offset: usize,
        dst_offset: usize,
    ) -> Result<()> {
        let _trace = self.inner.ctx.tracer.start("transfer_device2device", || {
            format!("{src} -> {dst} nbytes={nbytes} offset_src={src_offset} offset_dst={dst_offset}")
        });
        check_transfer(nbytes)?;
        self.check_device(src.device())?;
        self.check_device(dst.device())?;
        checked_end(src_offset, nbytes, src.nbytes(), "source allocation")?;
        checked_end(dst_offset, nbytes, dst.nbytes(), "destination allocation")?;
        tracing::debug!(
            device = %self.inner.device,
            stream = %self.inner.id,
            src = %src.addr(),
            dst = %dst.addr(),
            nbytes,
            "transfer device -> device"
        );
        self.enqueue(Operation::DeviceToDevice {
            src: src.addr(),
            src_offset,
            dst: dst.addr(),
            dst_offset,
            nbytes,
        })
    }
}

fn check_transfer(nbytes: usize) -> Result<()> {
    if nbytes == 0 {
        return Err(OffloadError::invalid_argument(
            "transfer size must be positive",
        ));
    }
    Ok(())
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("device", &self.inner.device)
            .field("id", &self.inner.id)
            .field("ordinal", &self.inner.ordinal)
            .finish()
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream({}) on {}", self.inner.ordinal, self.inner.device)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::OffloadConfig;
    use crate::device::DeviceRegistry;
    use crate::engine::HostEngine;
    use crate::error::OffloadError;
    use crate::host::HostBuffer;
    use crate::memory::AllocOptions;
    use std::sync::Arc;

    fn registry() -> DeviceRegistry {
        DeviceRegistry::new(Arc::new(HostEngine::new(2)), OffloadConfig::default()).unwrap()
    }

    #[test]
    fn test_offset_transfers() {
        let registry = registry();
        let stream = registry.device(0).unwrap().default_stream().unwrap().clone();
        let src = HostBuffer::from_slice(&(0u8..16).collect::<Vec<_>>());
        let dst = HostBuffer::zeroed(16);
        let a = stream.allocate(16).unwrap();
        let b = stream.allocate(16).unwrap();

        stream.host_to_device(&src, &a, 8, 8, 0).unwrap();
        stream.device_to_device(&a, &b, 8, 0, 4).unwrap();
        stream.device_to_host(&b, &dst, 8, 4, 2).unwrap();
        stream.sync().unwrap();

        let bytes = dst.to_bytes();
        assert_eq!(&bytes[2..10], &[8, 9, 10, 11, 12, 13, 14, 15]);
        assert_eq!(bytes[0], 0);
    }

    #[test]
    fn test_transfer_validation() {
        let registry = registry();
        let stream = registry.device(0).unwrap().create_stream().unwrap();
        let mem = stream.allocate(8).unwrap();
        let host = HostBuffer::zeroed(8);

        assert!(matches!(
            stream.host_to_device(&host, &mem, 0, 0, 0),
            Err(OffloadError::InvalidArgument(_))
        ));
        assert!(matches!(
            stream.host_to_device(&host, &mem, 8, 1, 0),
            Err(OffloadError::InvalidArgument(_))
        ));
        assert!(matches!(
            stream.device_to_host(&mem, &host, 4, 6, 0),
            Err(OffloadError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_cross_device_rejected() {
        let registry = registry();
        let s0 = registry.device(0).unwrap().create_stream().unwrap();
        let s1 = registry.device(1).unwrap().create_stream().unwrap();
        let mem = s0.allocate(8).unwrap();
        let host = HostBuffer::zeroed(8);
        assert!(matches!(
            s1.host_to_device(&host, &mem, 8, 0, 0),
            Err(OffloadError::DeviceMismatch { .. })
        ));
        assert!(matches!(
            s1.translate_device_pointer(&mem),
            Err(OffloadError::DeviceMismatch { .. })
        ));
        assert!(s0.translate_device_pointer(&mem).unwrap() != 0);
    }

    #[test]
    fn test_allocation_validation() {
        let registry = registry();
        let stream = registry.device(0).unwrap().default_stream().unwrap().clone();
        assert!(matches!(
            stream.allocate(0),
            Err(OffloadError::InvalidArgument(_))
        ));
        assert!(matches!(
            stream.allocate_with(64, AllocOptions::new().with_alignment(48)),
            Err(OffloadError::InvalidArgument(_))
        ));
        let mem = stream
            .allocate_with(64, AllocOptions::new().with_alignment(4096))
            .unwrap();
        assert_eq!(stream.translate_device_pointer(&mem).unwrap() % 4096, 0);
    }

    #[test]
    fn test_explicit_deallocate_and_sticky() {
        let engine = Arc::new(HostEngine::builder().devices(1).device_memory(128).build());
        let registry = DeviceRegistry::new(engine, OffloadConfig::default()).unwrap();
        let device = registry.device(0).unwrap();
        let stream = device.default_stream().unwrap();

        let mem = stream.allocate(128).unwrap();
        assert_eq!(device.memory_info().unwrap().allocatable, 0);
        stream.deallocate(mem).unwrap();
        assert_eq!(device.memory_info().unwrap().allocatable, 128);

        let sticky = stream
            .allocate_with(64, AllocOptions::new().with_sticky(true))
            .unwrap();
        assert!(sticky.is_sticky());
        drop(sticky);
        // The region stays reserved after its sticky handle is gone.
        assert_eq!(device.memory_info().unwrap().allocatable, 64);
    }

    #[test]
    fn test_display() {
        let registry = registry();
        let stream = registry.device(1).unwrap().create_stream().unwrap();
        assert_eq!(stream.to_string(), "stream(1) on device(1)");
    }
}
