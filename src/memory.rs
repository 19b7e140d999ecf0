// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Device memory handles and capacity accounting.
//!
//! ## Ownership
//!
//! A [`DeviceAllocation`] is the host-side handle for one device region. It is
//! move-only: the region is released exactly once, either by
//! [`Stream::deallocate`](crate::Stream::deallocate) or when the handle is
//! dropped. A *sticky* handle never releases anything; views of a device
//! array hold sticky aliases of their base's allocation.
//!
//! Allocation and release are synchronous host calls. They do not wait for
//! work already queued on the stream; an engine keeps regions alive until
//! queued work referencing them has run.
//!
//! ## Capacity
//!
//! [`MemoryTracker`] counts bytes per device against an optional limit. The
//! host engine consults it before reserving a region so that an exhausted
//! device reports [`OffloadError::OutOfMemory`] instead of aborting.

use crate::device::DeviceId;
use crate::dtype::DType;
use crate::engine::DeviceAddr;
use crate::error::{OffloadError, Result};
use crate::stream::Stream;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Default alignment of device allocations in bytes.
pub const DEFAULT_ALIGNMENT: usize = 64;

/// Bytes required to store `shape` elements of `dtype`.
///
/// ## Example
///
/// ```rust
/// use offload_core::{estimate_array_bytes, DType};
///
/// assert_eq!(estimate_array_bytes(&[4, 4], DType::F64), 128);
/// ```
#[must_use]
pub fn estimate_array_bytes(shape: &[usize], dtype: DType) -> usize {
    let numel: usize = shape.iter().product();
    numel * dtype.size_in_bytes()
}

/// Byte accounting for one device.
///
/// Tracks allocated and peak usage with atomics so that any stream may
/// allocate concurrently.
///
/// ```rust
/// use offload_core::MemoryTracker;
///
/// let tracker = MemoryTracker::with_limit(1024);
/// tracker.allocate(512)?;
/// assert!(tracker.allocate(1024).is_err());
/// tracker.deallocate(512);
/// # Ok::<(), offload_core::OffloadError>(())
/// ```
#[derive(Debug, Default)]
pub struct MemoryTracker {
    /// Currently allocated bytes.
    allocated: AtomicUsize,
    /// Peak allocation during lifetime.
    peak: AtomicUsize,
    /// Capacity in bytes (0 = unlimited).
    limit: usize,
}

impl MemoryTracker {
    /// Create a tracker with no limit.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a tracker that refuses to exceed `limit_bytes` (0 = unlimited).
    #[must_use]
    pub fn with_limit(limit_bytes: usize) -> Self {
        Self {
            limit: limit_bytes,
            ..Self::default()
        }
    }

    /// Record an allocation.
    ///
    /// ## Errors
    ///
    /// Returns [`OffloadError::OutOfMemory`] if the allocation would exceed the
    /// limit. The tracker is left unchanged in that case.
    pub fn allocate(&self, bytes: usize) -> Result<()> {
        let mut current = self.allocated.load(Ordering::SeqCst);
        let updated = loop {
            let next = current
                .checked_add(bytes)
                .filter(|next| self.limit == 0 || *next <= self.limit)
                .ok_or_else(|| {
                    OffloadError::oom(format!(
                        "allocation of {bytes} bytes would exceed limit of {} bytes \
                         (current: {current} bytes)",
                        self.limit
                    ))
                })?;
            match self.allocated.compare_exchange_weak(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break next,
                Err(actual) => current = actual,
            }
        };
        self.peak.fetch_max(updated, Ordering::SeqCst);
        Ok(())
    }

    /// Record a release.
    pub fn deallocate(&self, bytes: usize) {
        self.allocated.fetch_sub(bytes, Ordering::SeqCst);
    }

    /// Currently allocated bytes.
    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        self.allocated.load(Ordering::SeqCst)
    }

    /// High-water mark.
    #[must_use]
    pub fn peak_bytes(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Configured limit (0 = unlimited).
    #[must_use]
    pub fn limit_bytes(&self) -> usize {
        self.limit
    }

    /// Bytes still available, `usize::MAX` when unlimited.
    #[must_use]
    pub fn available_bytes(&self) -> usize {
        if self.limit == 0 {
            usize::MAX
        } else {
            self.limit.saturating_sub(self.allocated_bytes())
        }
    }

}

/// Allocation parameters for [`Stream::allocate_with`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocOptions {
    /// Alignment in bytes, a power of two.
    pub alignment: usize,
    /// Suppress automatic release when the handle is dropped.
    pub sticky: bool,
}

impl Default for AllocOptions {
    fn default() -> Self {
        Self {
            alignment: DEFAULT_ALIGNMENT,
            sticky: false,
        }
    }
}

impl AllocOptions {
    /// Default options (64-byte alignment, not sticky).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the alignment.
    #[must_use]
    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    /// Mark the allocation sticky.
    #[must_use]
    pub fn with_sticky(mut self, sticky: bool) -> Self {
        self.sticky = sticky;
        self
    }
}

/// Owning handle to a device memory region ("fake pointer").
///
/// Carries the stream it was allocated through, the owning device, the opaque
/// engine address and the sticky flag.
pub struct DeviceAllocation {
    stream: Stream,
    addr: DeviceAddr,
    nbytes: usize,
    sticky: bool,
    live: bool,
}

impl DeviceAllocation {
    pub(crate) fn new(stream: Stream, addr: DeviceAddr, nbytes: usize, sticky: bool) -> Self {
        Self {
            stream,
            addr,
            nbytes,
            sticky,
            live: true,
        }
    }

    /// Sticky handle to the same region.
    pub(crate) fn alias(&self) -> Self {
        Self::new(self.stream.clone(), self.addr, self.nbytes, true)
    }

    /// Stream the region was allocated through.
    #[must_use]
    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    /// Device that owns the region.
    #[must_use]
    pub fn device(&self) -> DeviceId {
        self.stream.device_id()
    }

    /// Opaque engine address.
    #[must_use]
    pub fn addr(&self) -> DeviceAddr {
        self.addr
    }

    /// Size of the region in bytes.
    #[must_use]
    pub fn nbytes(&self) -> usize {
        self.nbytes
    }

    /// Whether dropping this handle leaves the region in place.
    #[must_use]
    pub fn is_sticky(&self) -> bool {
        self.sticky
    }

    /// Release the region now. No-op for sticky handles.
    pub(crate) fn release(mut self) -> Result<()> {
        self.release_region()
    }

    fn release_region(&mut self) -> Result<()> {
        if !self.live || self.sticky {
            return Ok(());
        }
        self.live = false;
        tracing::trace!(
            device = %self.device(),
            addr = %self.addr,
            nbytes = self.nbytes,
            "deallocating device memory"
        );
        self.stream
            .context()
            .engine
            .deallocate(self.device(), self.addr)
    }
}

impl Drop for DeviceAllocation {
    fn drop(&mut self) {
        if let Err(err) = self.release_region() {
            tracing::warn!(addr = %self.addr, "failed to release device memory: {err}");
        }
    }
}

impl fmt::Debug for DeviceAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceAllocation")
            .field("device", &self.device())
            .field("addr", &self.addr)
            .field("nbytes", &self.nbytes)
            .field("sticky", &self.sticky)
            .finish()
    }
}

impl fmt::Display for DeviceAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} bytes) on {}",
            self.addr,
            self.nbytes,
            self.device()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_array_bytes() {
        assert_eq!(estimate_array_bytes(&[10, 100], DType::F64), 8000);
        assert_eq!(estimate_array_bytes(&[3], DType::Complex128), 48);
        assert_eq!(estimate_array_bytes(&[0], DType::I64), 0);
    }

    #[test]
    fn test_memory_tracker_allocation() {
        let tracker = MemoryTracker::with_limit(1000);

        assert!(tracker.allocate(500).is_ok());
        assert!(tracker.allocate(400).is_ok());
        assert_eq!(tracker.allocated_bytes(), 900);

        let err = tracker.allocate(200).unwrap_err();
        assert!(matches!(err, OffloadError::OutOfMemory { .. }));
        assert_eq!(tracker.allocated_bytes(), 900);
        assert_eq!(tracker.available_bytes(), 100);

        tracker.deallocate(400);
        assert_eq!(tracker.allocated_bytes(), 500);
        assert!(tracker.allocate(200).is_ok());
    }

    #[test]
    fn test_memory_tracker_peak() {
        let tracker = MemoryTracker::new();

        tracker.allocate(100).unwrap();
        tracker.allocate(200).unwrap();
        assert_eq!(tracker.peak_bytes(), 300);

        tracker.deallocate(200);
        assert_eq!(tracker.peak_bytes(), 300);

        tracker.allocate(350).unwrap();
        assert_eq!(tracker.peak_bytes(), 450);
    }

    #[test]
    fn test_unlimited_available() {
        let tracker = MemoryTracker::with_limit(1000);
        tracker.allocate(500).unwrap();
        assert_eq!(tracker.available_bytes(), 500);
        assert_eq!(MemoryTracker::new().available_bytes(), usize::MAX);
    }

    #[test]
    fn test_alloc_options() {
        let opts = AllocOptions::new();
        assert_eq!(opts.alignment, DEFAULT_ALIGNMENT);
        assert!(!opts.sticky);

        let opts = opts.with_alignment(4096).with_sticky(true);
        assert_eq!(opts.alignment, 4096);
        assert!(opts.sticky);
    }
}
