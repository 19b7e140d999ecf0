// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Host-resident typed arrays.
//!
//! [`HostArray`] is the host side of every transfer: a shape, an element
//! type, a storage layout and a shared byte buffer. Clones and reshaped
//! copies share the same [`HostBuffer`], so a device-to-host transfer into one
//! of them is visible through all of them. Use [`HostArray::deep_copy`] for
//! private storage.

use crate::dtype::{DType, Element};
use crate::error::{OffloadError, Result};
use crate::memory::estimate_array_bytes;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// Shared, 8-byte aligned host storage.
///
/// The word-sized backing store keeps every supported element type aligned
/// when kernels read it in place.
#[derive(Clone)]
pub struct HostBuffer {
    words: Arc<RwLock<Vec<u64>>>,
    nbytes: usize,
}

impl HostBuffer {
    /// Allocate `nbytes` zeroed bytes.
    #[must_use]
    pub fn zeroed(nbytes: usize) -> Self {
        Self {
            words: Arc::new(RwLock::new(vec![0u64; nbytes.div_ceil(8)])),
            nbytes,
        }
    }

    /// Copy `bytes` into a new buffer.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let buffer = Self::zeroed(bytes.len());
        buffer.with_bytes_mut(|dst| dst.copy_from_slice(bytes));
        buffer
    }

    /// Copy a slice of plain-old-data values into a new buffer.
    #[must_use]
    pub fn from_slice<T: bytemuck::Pod>(values: &[T]) -> Self {
        Self::from_bytes(bytemuck::cast_slice(values))
    }

    /// Length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nbytes
    }

    /// Check if the buffer holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nbytes == 0
    }

    /// Snapshot of the buffer contents.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.with_bytes(<[u8]>::to_vec)
    }

    /// Read the buffer as a vector of `T`, ignoring any trailing partial element.
    #[must_use]
    pub fn to_vec<T: bytemuck::Pod>(&self) -> Vec<T> {
        let size = std::mem::size_of::<T>().max(1);
        self.with_bytes(|bytes| {
            bytes
                .chunks_exact(size)
                .map(bytemuck::pod_read_unaligned)
                .collect()
        })
    }

    /// Overwrite bytes starting at `offset`.
    ///
    /// ## Errors
    ///
    /// Returns [`OffloadError::InvalidArgument`] if the write runs past the end.
    pub fn write_bytes(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        let end = checked_end(offset, bytes.len(), self.nbytes, "host buffer")?;
        self.with_bytes_mut(|dst| dst[offset..end].copy_from_slice(bytes));
        Ok(())
    }

    /// Private copy of the buffer contents.
    #[must_use]
    pub fn deep_copy(&self) -> Self {
        Self {
            words: Arc::new(RwLock::new(self.words.read().clone())),
            nbytes: self.nbytes,
        }
    }

    /// Check if two handles share storage.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.words, &other.words)
    }

    pub(crate) fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let guard = self.words.read();
        let bytes: &[u8] = bytemuck::cast_slice(guard.as_slice());
        f(&bytes[..self.nbytes])
    }

    pub(crate) fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut guard = self.words.write();
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(guard.as_mut_slice());
        f(&mut bytes[..self.nbytes])
    }
}

impl fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBuffer")
            .field("nbytes", &self.nbytes)
            .finish_non_exhaustive()
    }
}

/// Compute `offset + len` and check it against `limit`.
pub(crate) fn checked_end(offset: usize, len: usize, limit: usize, what: &str) -> Result<usize> {
    offset
        .checked_add(len)
        .filter(|end| *end <= limit)
        .ok_or_else(|| {
            OffloadError::invalid_argument(format!(
                "range {offset}..{offset}+{len} exceeds {what} of {limit} bytes"
            ))
        })
}

/// Storage order of a multi-dimensional array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Layout {
    /// C order, last index varies fastest.
    #[default]
    RowMajor,
    /// Fortran order, first index varies fastest.
    ColumnMajor,
    /// Strided or otherwise non-contiguous storage.
    NonContiguous,
}

impl Layout {
    /// Detect the layout described by per-dimension element strides.
    ///
    /// Dimensions of extent one are ignored. When both orders match
    /// (vectors, scalars) the result is [`Layout::RowMajor`].
    #[must_use]
    pub fn from_strides(shape: &[usize], strides: &[isize]) -> Self {
        if shape.len() != strides.len() {
            return Self::NonContiguous;
        }
        let contiguous = |dims: &mut dyn Iterator<Item = (usize, isize)>| {
            let mut expected: isize = 1;
            for (extent, stride) in dims {
                if extent != 1 && stride != expected {
                    return false;
                }
                expected = expected.saturating_mul(isize::try_from(extent).unwrap_or(isize::MAX));
            }
            true
        };
        let pairs = || shape.iter().copied().zip(strides.iter().copied());
        if contiguous(&mut pairs().rev()) {
            Self::RowMajor
        } else if contiguous(&mut pairs()) {
            Self::ColumnMajor
        } else {
            Self::NonContiguous
        }
    }

    /// Short order code (`C` or `F`).
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::RowMajor => "C",
            Self::ColumnMajor => "F",
            Self::NonContiguous => "A",
        }
    }
}

/// A shaped, typed array in host memory.
#[derive(Debug, Clone)]
pub struct HostArray {
    shape: Vec<usize>,
    dtype: DType,
    layout: Layout,
    buffer: HostBuffer,
}

impl HostArray {
    /// Build an array from a vector of elements in row-major order.
    ///
    /// ## Errors
    ///
    /// Returns [`OffloadError::ShapeMismatch`] if the element count does not
    /// match `shape`.
    pub fn from_vec<T: Element>(data: Vec<T>, shape: &[usize]) -> Result<Self> {
        let size: usize = shape.iter().product();
        if size != data.len() {
            return Err(OffloadError::shape_mismatch(shape.to_vec(), vec![data.len()]));
        }
        Ok(Self {
            shape: shape.to_vec(),
            dtype: T::DTYPE,
            layout: Layout::RowMajor,
            buffer: HostBuffer::from_slice(&data),
        })
    }

    /// Build a one-dimensional array from a slice.
    #[must_use]
    pub fn from_slice<T: Element>(data: &[T]) -> Self {
        Self {
            shape: vec![data.len()],
            dtype: T::DTYPE,
            layout: Layout::RowMajor,
            buffer: HostBuffer::from_slice(data),
        }
    }

    /// Zero-initialised row-major array.
    #[must_use]
    pub fn zeros(shape: &[usize], dtype: DType) -> Self {
        Self {
            shape: shape.to_vec(),
            dtype,
            layout: Layout::RowMajor,
            buffer: HostBuffer::zeroed(estimate_array_bytes(shape, dtype)),
        }
    }

    /// Reinterpret the storage with an explicit layout.
    #[must_use]
    pub fn with_layout(mut self, layout: Layout) -> Self {
        self.layout = layout;
        self
    }

    /// Reinterpret the storage with per-dimension element strides.
    #[must_use]
    pub fn with_strides(mut self, strides: &[isize]) -> Self {
        self.layout = Layout::from_strides(&self.shape, strides);
        self
    }

    /// Array shape.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Element type.
    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Storage layout.
    #[must_use]
    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Number of dimensions.
    #[must_use]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Number of elements.
    #[must_use]
    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    /// Size in bytes.
    #[must_use]
    pub fn nbytes(&self) -> usize {
        estimate_array_bytes(&self.shape, self.dtype)
    }

    /// Backing storage.
    #[must_use]
    pub fn buffer(&self) -> &HostBuffer {
        &self.buffer
    }

    /// The layout, if it is one of the two contiguous orders.
    ///
    /// ## Errors
    ///
    /// Returns [`OffloadError::UnsupportedLayout`] for non-contiguous storage.
    pub fn contiguous_layout(&self) -> Result<Layout> {
        match self.layout {
            Layout::NonContiguous => Err(OffloadError::unsupported_layout(format!(
                "could not detect storage order of array with shape {:?}",
                self.shape
            ))),
            layout => Ok(layout),
        }
    }

    /// A new array over the same storage with a different shape.
    ///
    /// ## Errors
    ///
    /// Returns [`OffloadError::ShapeMismatch`] if the element count changes.
    pub fn reshaped(&self, shape: &[usize]) -> Result<Self> {
        let size: usize = shape.iter().product();
        if size != self.size() {
            return Err(OffloadError::shape_mismatch(self.shape.clone(), shape.to_vec()));
        }
        Ok(Self {
            shape: shape.to_vec(),
            dtype: self.dtype,
            layout: self.layout,
            buffer: self.buffer.clone(),
        })
    }

    /// Same shape and type over private storage.
    #[must_use]
    pub fn deep_copy(&self) -> Self {
        Self {
            shape: self.shape.clone(),
            dtype: self.dtype,
            layout: self.layout,
            buffer: self.buffer.deep_copy(),
        }
    }

    /// Copy the elements out in storage order.
    ///
    /// ## Errors
    ///
    /// Returns [`OffloadError::UnsupportedType`] if `T` does not match the
    /// array's element type.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        if T::DTYPE != self.dtype {
            return Err(OffloadError::unsupported_type(format!(
                "cannot read {} array as {}",
                self.dtype,
                T::DTYPE
            )));
        }
        Ok(self.buffer.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_detection() {
        assert_eq!(Layout::from_strides(&[3, 4], &[4, 1]), Layout::RowMajor);
        assert_eq!(Layout::from_strides(&[3, 4], &[1, 3]), Layout::ColumnMajor);
        assert_eq!(Layout::from_strides(&[3, 4], &[8, 2]), Layout::NonContiguous);
        assert_eq!(Layout::from_strides(&[5], &[1]), Layout::RowMajor);
        assert_eq!(Layout::from_strides(&[5], &[2]), Layout::NonContiguous);
        assert_eq!(Layout::from_strides(&[1, 4], &[99, 1]), Layout::RowMajor);
    }

    #[test]
    fn test_reshaped_shares_storage() {
        let a = HostArray::from_vec((0..16i64).collect(), &[16]).unwrap();
        let b = a.reshaped(&[4, 4]).unwrap();
        assert!(a.buffer().ptr_eq(b.buffer()));
        assert!(matches!(
            a.reshaped(&[5, 5]),
            Err(OffloadError::ShapeMismatch { .. })
        ));

        let c = a.deep_copy();
        assert!(!a.buffer().ptr_eq(c.buffer()));
        c.buffer().write_bytes(0, &[0xff; 8]).unwrap();
        assert_eq!(a.to_vec::<i64>().unwrap()[0], 0);
        assert_eq!(c.to_vec::<i64>().unwrap()[0], -1);
    }

    #[test]
    fn test_non_contiguous_rejected() {
        let a = HostArray::zeros(&[4, 4], DType::F64).with_strides(&[8, 2]);
        assert!(matches!(
            a.contiguous_layout(),
            Err(OffloadError::UnsupportedLayout(_))
        ));
        let f = HostArray::zeros(&[4, 2], DType::F64).with_strides(&[1, 4]);
        assert_eq!(f.contiguous_layout().unwrap(), Layout::ColumnMajor);
    }

    #[test]
    fn test_buffer_bounds() {
        let buffer = HostBuffer::zeroed(12);
        assert_eq!(buffer.len(), 12);
        assert!(buffer.write_bytes(8, &[1, 2, 3, 4]).is_ok());
        assert!(buffer.write_bytes(10, &[1, 2, 3]).is_err());
        assert_eq!(&buffer.to_bytes()[8..], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_typed_read() {
        let a = HostArray::from_slice(&[1.5f64, 2.5]);
        assert_eq!(a.nbytes(), 16);
        assert_eq!(a.to_vec::<f64>().unwrap(), vec![1.5, 2.5]);
        assert!(a.to_vec::<i64>().is_err());
    }
}
