// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Device-resident arrays.
//!
//! A [`DeviceArray`] pairs a [`HostArray`] with a device allocation of the
//! same size. Data moves only when asked: [`DeviceArray::update_device`]
//! copies host to device and [`DeviceArray::update_host`] copies back, both
//! asynchronously on the array's stream.
//!
//! [`DeviceArray::reshape`] and [`DeviceArray::ravel`] return views. A view
//! shares the device region and host storage of its base array through a
//! sticky handle, so dropping a view never frees memory. The view refers to
//! its base weakly; once the base is dropped the region is released and the
//! view can no longer be used on the device.
//!
//! ## Example
//!
//! ```rust
//! use offload_core::{DeviceRegistry, HostArray, HostEngine, OffloadConfig};
//! use std::sync::Arc;
//!
//! let registry = DeviceRegistry::new(Arc::new(HostEngine::new(1)), OffloadConfig::default())?;
//! let stream = registry.device(0)?.default_stream()?;
//!
//! let host = HostArray::from_slice(&[1.0f64, 2.0, 3.0, 4.0]);
//! let array = stream.bind(&host, true)?;
//! let matrix = array.reshape(&[2, 2])?;
//! assert!(matrix.is_view());
//! assert_eq!(matrix.to_vec::<f64>()?, vec![1.0, 2.0, 3.0, 4.0]);
//! # Ok::<(), offload_core::OffloadError>(())
//! ```

use crate::device::DeviceId;
use crate::dtype::{DType, Element, Scalar};
use crate::engine::DeviceAddr;
use crate::error::{OffloadError, Result};
use crate::host::{HostArray, Layout};
use crate::memory::DeviceAllocation;
use crate::stream::Stream;
use parking_lot::RwLock;
use std::fmt;
use std::sync::{Arc, Weak};

enum Backing {
    Owned(DeviceAllocation),
    View {
        alloc: DeviceAllocation,
        base: Weak<ArrayInner>,
    },
}

struct ArrayInner {
    host: HostArray,
    stream: RwLock<Stream>,
    backing: Backing,
}

/// A host array mirrored in device memory.
#[derive(Clone)]
pub struct DeviceArray {
    inner: Arc<ArrayInner>,
}

impl DeviceArray {
    fn from_parts(host: HostArray, stream: Stream, backing: Backing) -> Self {
        Self {
            inner: Arc::new(ArrayInner {
                host,
                stream: RwLock::new(stream),
                backing,
            }),
        }
    }

    /// Device region backing the array (a sticky alias for views).
    #[must_use]
    pub fn allocation(&self) -> &DeviceAllocation {
        match &self.inner.backing {
            Backing::Owned(alloc) | Backing::View { alloc, .. } => alloc,
        }
    }

    /// Address of the device region.
    ///
    /// Fails for a view whose base array no longer exists.
    pub(crate) fn device_addr(&self) -> Result<DeviceAddr> {
        match &self.inner.backing {
            Backing::Owned(alloc) => Ok(alloc.addr()),
            Backing::View { alloc, base } => {
                if base.strong_count() == 0 {
                    return Err(OffloadError::invalid_argument(format!(
                        "view of shape {:?} outlived its base array",
                        self.shape()
                    )));
                }
                Ok(alloc.addr())
            }
        }
    }

    /// Enqueue a copy of the host contents to the device.
    ///
    /// ## Errors
    ///
    /// Fails for a view whose base array no longer exists.
    #[track_caller]
    pub fn update_device(&self) -> Result<()> {
        let stream = self.stream();
        let _trace = stream
            .context()
            .tracer
            .start("update_device", || self.to_string());
        self.device_addr()?;
        stream.host_to_device(
            self.inner.host.buffer(),
            self.allocation(),
            self.nbytes(),
            0,
            0,
        )
    }

    /// Enqueue a copy of the device contents to the host.
    ///
    /// The host array reflects the device only after the stream is synced.
    ///
    /// ## Errors
    ///
    /// Fails for a view whose base array no longer exists.
    #[track_caller]
    pub fn update_host(&self) -> Result<&Self> {
        let stream = self.stream();
        let _trace = stream
            .context()
            .tracer
            .start("update_host", || self.to_string());
        self.device_addr()?;
        stream.device_to_host(
            self.allocation(),
            self.inner.host.buffer(),
            self.nbytes(),
            0,
            0,
        )?;
        Ok(self)
    }

    /// A view with a different shape over the same device and host storage.
    ///
    /// ## Errors
    ///
    /// Returns [`OffloadError::ShapeMismatch`] if the element count changes.
    pub fn reshape(&self, shape: &[usize]) -> Result<Self> {
        let host = self.inner.host.reshaped(shape)?;
        let base = match &self.inner.backing {
            Backing::Owned(_) => Arc::downgrade(&self.inner),
            Backing::View { base, .. } => base.clone(),
        };
        let backing = Backing::View {
            alloc: self.allocation().alias(),
            base,
        };
        Ok(Self::from_parts(host, self.stream(), backing))
    }

    /// One-dimensional view of all elements.
    ///
    /// ## Errors
    ///
    /// Never fails for a valid array; shares [`DeviceArray::reshape`]'s
    /// signature.
    pub fn ravel(&self) -> Result<Self> {
        self.reshape(&[self.size()])
    }

    /// The array owning the storage, for views whose base is still alive.
    #[must_use]
    pub fn base(&self) -> Option<Self> {
        match &self.inner.backing {
            Backing::Owned(_) => None,
            Backing::View { base, .. } => base.upgrade().map(|inner| Self { inner }),
        }
    }

    /// Whether the array borrows another array's storage.
    #[must_use]
    pub fn is_view(&self) -> bool {
        matches!(self.inner.backing, Backing::View { .. })
    }

    /// Use `stream` for all further operations on this array.
    ///
    /// ## Errors
    ///
    /// Returns [`OffloadError::DeviceMismatch`] for a stream of another device.
    pub fn assign_stream(&self, stream: &Stream) -> Result<()> {
        let current = self.device();
        if stream.device_id() != current {
            return Err(OffloadError::device_mismatch(current, stream.device_id()));
        }
        *self.inner.stream.write() = stream.clone();
        Ok(())
    }

    /// Enqueue a copy of `source` straight into device memory.
    ///
    /// The array's own host storage is left untouched.
    ///
    /// ## Errors
    ///
    /// Returns [`OffloadError::ShapeMismatch`] or
    /// [`OffloadError::UnsupportedType`] if `source` differs in shape or type.
    pub fn fill_from(&self, source: &HostArray) -> Result<&Self> {
        self.check_compatible(source.shape(), source.dtype())?;
        source.contiguous_layout()?;
        self.device_addr()?;
        self.stream()
            .host_to_device(source.buffer(), self.allocation(), self.nbytes(), 0, 0)?;
        Ok(self)
    }

    /// Copy the device contents to the host, wait, and return them.
    ///
    /// ## Errors
    ///
    /// Returns [`OffloadError::UnsupportedType`] if `T` does not match the
    /// element type.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        self.update_host()?;
        self.stream().sync()?;
        self.inner.host.to_vec()
    }

    pub(crate) fn check_compatible(&self, shape: &[usize], dtype: DType) -> Result<()> {
        if shape != self.shape() {
            return Err(OffloadError::shape_mismatch(self.shape(), shape));
        }
        if dtype != self.dtype() {
            return Err(OffloadError::unsupported_type(format!(
                "data types do not match: {} != {dtype}",
                self.dtype()
            )));
        }
        Ok(())
    }

    /// Size of the leading dimension, 1 for zero-dimensional arrays.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shape().first().copied().unwrap_or(1)
    }

    /// Whether the array holds no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Array shape.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        self.inner.host.shape()
    }

    /// Element type.
    #[must_use]
    pub fn dtype(&self) -> DType {
        self.inner.host.dtype()
    }

    /// Storage order.
    #[must_use]
    pub fn layout(&self) -> Layout {
        self.inner.host.layout()
    }

    /// Number of dimensions.
    #[must_use]
    pub fn ndim(&self) -> usize {
        self.inner.host.ndim()
    }

    /// Number of elements.
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.host.size()
    }

    /// Size in bytes.
    #[must_use]
    pub fn nbytes(&self) -> usize {
        self.inner.host.nbytes()
    }

    /// Device holding the array.
    #[must_use]
    pub fn device(&self) -> DeviceId {
        self.allocation().device()
    }

    /// Stream used for the array's operations.
    #[must_use]
    pub fn stream(&self) -> Stream {
        self.inner.stream.read().clone()
    }

    /// Host side of the array.
    #[must_use]
    pub fn host(&self) -> &HostArray {
        &self.inner.host
    }
}

impl fmt::Debug for DeviceArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceArray")
            .field("shape", &self.shape())
            .field("dtype", &self.dtype())
            .field("layout", &self.layout())
            .field("allocation", self.allocation())
            .field("view", &self.is_view())
            .finish()
    }
}

impl fmt::Display for DeviceArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "array(shape={:?}, dtype={}, order={}) on {}",
            self.shape(),
            self.dtype(),
            self.layout().code(),
            self.device()
        )
    }
}

impl Stream {
    /// Associate `host` with new device storage on this stream's device.
    ///
    /// Transfers later made through the returned array read and write `host`'s
    /// storage. With `update_device` the contents are copied over
    /// immediately; otherwise device memory is unspecified until
    /// [`DeviceArray::update_device`] is called.
    ///
    /// ## Errors
    ///
    /// Returns [`OffloadError::UnsupportedLayout`] for non-contiguous arrays
    /// and [`OffloadError::InvalidArgument`] for empty arrays.
    #[track_caller]
    pub fn bind(&self, host: &HostArray, update_device: bool) -> Result<DeviceArray> {
        let _trace = self.context().tracer.start("bind", || {
            format!("{self} shape={:?} dtype={} update_device={update_device}", host.shape(), host.dtype())
        });
        host.contiguous_layout()?;
        let alloc = self.allocate(host.nbytes())?;
        let array = DeviceArray::from_parts(host.clone(), self.clone(), Backing::Owned(alloc));
        tracing::debug!(array = %array, "bound host array");
        if update_device {
            array.update_device()?;
        }
        Ok(array)
    }

    /// As [`Stream::bind`], over a private copy of `host`.
    ///
    /// ## Errors
    ///
    /// As for [`Stream::bind`].
    #[track_caller]
    pub fn copy(&self, host: &HostArray, update_device: bool) -> Result<DeviceArray> {
        let _trace = self.context().tracer.start("copy", || {
            format!("{self} shape={:?} dtype={} update_device={update_device}", host.shape(), host.dtype())
        });
        host.contiguous_layout()?;
        self.bind(&host.deep_copy(), update_device)
    }

    /// New array with unspecified contents.
    ///
    /// With `update_host` the device contents are copied to the host array.
    ///
    /// ## Errors
    ///
    /// Returns [`OffloadError::InvalidArgument`] for an empty shape.
    pub fn empty(&self, shape: &[usize], dtype: DType, update_host: bool) -> Result<DeviceArray> {
        self.empty_with_layout(shape, dtype, Layout::RowMajor, update_host)
    }

    /// New array with the shape, type and storage order of `other`.
    ///
    /// ## Errors
    ///
    /// As for [`Stream::empty`].
    pub fn empty_like(&self, other: &DeviceArray, update_host: bool) -> Result<DeviceArray> {
        self.empty_with_layout(other.shape(), other.dtype(), other.layout(), update_host)
    }

    pub(crate) fn empty_with_layout(
        &self,
        shape: &[usize],
        dtype: DType,
        layout: Layout,
        update_host: bool,
    ) -> Result<DeviceArray> {
        let host = HostArray::zeros(shape, dtype).with_layout(layout);
        let array = self.bind(&host, false)?;
        if update_host {
            array.update_host()?;
        }
        Ok(array)
    }

    /// New array with every element set to zero.
    ///
    /// ## Errors
    ///
    /// As for [`Stream::bcast`].
    pub fn zeros(&self, shape: &[usize], dtype: DType, update_host: bool) -> Result<DeviceArray> {
        self.bcast(dtype.zero()?, shape, dtype, update_host)
    }

    /// Zero-filled array shaped like `other`.
    ///
    /// ## Errors
    ///
    /// As for [`Stream::bcast`].
    pub fn zeros_like(&self, other: &DeviceArray, update_host: bool) -> Result<DeviceArray> {
        self.zeros(other.shape(), other.dtype(), update_host)
    }

    /// New array with every element set to one.
    ///
    /// ## Errors
    ///
    /// As for [`Stream::bcast`].
    pub fn ones(&self, shape: &[usize], dtype: DType, update_host: bool) -> Result<DeviceArray> {
        self.bcast(dtype.one()?, shape, dtype, update_host)
    }

    /// One-filled array shaped like `other`.
    ///
    /// ## Errors
    ///
    /// As for [`Stream::bcast`].
    pub fn ones_like(&self, other: &DeviceArray, update_host: bool) -> Result<DeviceArray> {
        self.ones(other.shape(), other.dtype(), update_host)
    }

    /// New array with every element set to `value`, filled on the device.
    ///
    /// ## Errors
    ///
    /// Returns [`OffloadError::UnsupportedType`] if `value` cannot be
    /// represented as `dtype` or `dtype` has no kernel type code.
    pub fn bcast(
        &self,
        value: impl Into<Scalar>,
        shape: &[usize],
        dtype: DType,
        update_host: bool,
    ) -> Result<DeviceArray> {
        let value = value.into().coerce(dtype)?;
        let array = self.empty(shape, dtype, false)?;
        array.fill(value)?;
        if update_host {
            array.update_host()?;
        }
        Ok(array)
    }

    /// Array shaped like `other` with every element set to `value`.
    ///
    /// ## Errors
    ///
    /// As for [`Stream::bcast`].
    pub fn bcast_like(
        &self,
        value: impl Into<Scalar>,
        other: &DeviceArray,
        update_host: bool,
    ) -> Result<DeviceArray> {
        self.bcast(value, other.shape(), other.dtype(), update_host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OffloadConfig;
    use crate::device::DeviceRegistry;
    use crate::engine::HostEngine;

    fn registry() -> DeviceRegistry {
        DeviceRegistry::new(Arc::new(HostEngine::new(2)), OffloadConfig::default()).unwrap()
    }

    #[test]
    fn test_bind_round_trip() {
        let registry = registry();
        let stream = registry.device(0).unwrap().default_stream().unwrap().clone();
        let host = HostArray::from_vec(vec![1i64, 2, 3, 4, 5, 6], &[2, 3]).unwrap();
        let array = stream.bind(&host, true).unwrap();

        // Overwrite the host side, then restore it from the device.
        host.buffer().write_bytes(0, &[0u8; 48]).unwrap();
        array.update_host().unwrap();
        stream.sync().unwrap();
        assert_eq!(host.to_vec::<i64>().unwrap(), vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(array.len(), 2);
        assert_eq!(array.ndim(), 2);
    }

    #[test]
    fn test_bind_rejects_non_contiguous() {
        let registry = registry();
        let stream = registry.device(0).unwrap().default_stream().unwrap().clone();
        let host = HostArray::zeros(&[4, 4], DType::F64).with_strides(&[8, 2]);
        assert!(matches!(
            stream.bind(&host, true),
            Err(OffloadError::UnsupportedLayout(_))
        ));
    }

    #[test]
    fn test_copy_does_not_alias() {
        let registry = registry();
        let stream = registry.device(0).unwrap().default_stream().unwrap().clone();
        let host = HostArray::from_slice(&[1.0f64, 2.0]);
        let array = stream.copy(&host, true).unwrap();
        assert!(!array.host().buffer().ptr_eq(host.buffer()));

        array.fill(9.0).unwrap();
        assert_eq!(array.to_vec::<f64>().unwrap(), vec![9.0, 9.0]);
        assert_eq!(host.to_vec::<f64>().unwrap(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_copy_is_traced() {
        let config = OffloadConfig::new().with_trace_level(1);
        let registry = DeviceRegistry::new(Arc::new(HostEngine::new(1)), config).unwrap();
        let stream = registry.device(0).unwrap().default_stream().unwrap().clone();
        stream.copy(&HostArray::from_slice(&[1u64, 2]), false).unwrap();

        let functions: Vec<&str> = registry.tracer().events().iter().map(|e| e.function).collect();
        // Events are recorded as calls return, so the outer call comes last.
        assert_eq!(functions.last(), Some(&"copy"));
        assert!(functions.contains(&"bind"));
    }

    #[test]
    fn test_reshape_views_share_storage() {
        let engine = HostEngine::builder().devices(1).device_memory(1 << 16).build();
        let registry = DeviceRegistry::new(Arc::new(engine), OffloadConfig::default()).unwrap();
        let device = registry.device(0).unwrap();
        let stream = device.default_stream().unwrap().clone();
        let array = stream.bind(&HostArray::zeros(&[16], DType::F64), true).unwrap();
        let before = device.memory_info().unwrap().allocatable;

        let view = array.reshape(&[4, 4]).unwrap();
        assert_eq!(view.size(), 16);
        assert!(view.is_view());
        assert!(view.allocation().is_sticky());
        assert_eq!(view.allocation().addr(), array.allocation().addr());
        assert!(view.base().is_some());
        assert!(matches!(
            array.reshape(&[5, 5]),
            Err(OffloadError::ShapeMismatch { .. })
        ));

        let flat = view.ravel().unwrap();
        assert_eq!(flat.shape(), &[16]);
        drop(view);
        drop(flat);
        assert_eq!(device.memory_info().unwrap().allocatable, before);

        drop(array);
        assert!(device.memory_info().unwrap().allocatable > before);
    }

    #[test]
    fn test_view_outliving_base() {
        let registry = registry();
        let stream = registry.device(0).unwrap().default_stream().unwrap().clone();
        let array = stream.bind(&HostArray::zeros(&[4], DType::I64), true).unwrap();
        let view = array.ravel().unwrap();
        drop(array);
        assert!(view.base().is_none());
        assert!(matches!(
            view.update_device(),
            Err(OffloadError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_assign_stream() {
        let registry = registry();
        let d0 = registry.device(0).unwrap();
        let d1 = registry.device(1).unwrap();
        let array = d0
            .default_stream()
            .unwrap()
            .bind(&HostArray::zeros(&[2], DType::F64), false)
            .unwrap();

        let other = d0.create_stream().unwrap();
        array.assign_stream(&other).unwrap();
        assert!(array.stream().same_stream(&other));
        assert!(matches!(
            array.assign_stream(d1.default_stream().unwrap()),
            Err(OffloadError::DeviceMismatch { .. })
        ));
    }

    #[test]
    fn test_fill_from_checks_shape() {
        let registry = registry();
        let stream = registry.device(0).unwrap().default_stream().unwrap().clone();
        let array = stream.empty(&[3], DType::I64, false).unwrap();
        array.fill_from(&HostArray::from_slice(&[4i64, 5, 6])).unwrap();
        assert_eq!(array.to_vec::<i64>().unwrap(), vec![4, 5, 6]);

        assert!(matches!(
            array.fill_from(&HostArray::from_slice(&[1i64, 2])),
            Err(OffloadError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            array.fill_from(&HostArray::from_slice(&[1.0f64, 2.0, 3.0])),
            Err(OffloadError::UnsupportedType(_))
        ));
    }

    #[test]
    fn test_factories() {
        let registry = registry();
        let stream = registry.device(1).unwrap().default_stream().unwrap().clone();
        let zeros = stream.zeros(&[2, 2], DType::F64, true).unwrap();
        let ones = stream.ones_like(&zeros, true).unwrap();
        let sevens = stream.bcast(7, &[3], DType::U64, true).unwrap();
        stream.sync().unwrap();

        assert_eq!(zeros.host().to_vec::<f64>().unwrap(), vec![0.0; 4]);
        assert_eq!(ones.host().to_vec::<f64>().unwrap(), vec![1.0; 4]);
        assert_eq!(sevens.host().to_vec::<u64>().unwrap(), vec![7; 3]);
        assert_eq!(ones.device(), DeviceId::Index(1));

        assert!(matches!(
            stream.bcast(1.5, &[2], DType::I64, false),
            Err(OffloadError::UnsupportedType(_))
        ));
        assert!(matches!(
            stream.empty(&[0], DType::F64, false),
            Err(OffloadError::InvalidArgument(_))
        ));
    }
}
