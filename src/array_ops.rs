// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Elementwise operations on [`DeviceArray`]s.
//!
//! Each operation validates its operands, then enqueues one builtin kernel
//! from [`ARRAY_LIBRARY`] through [`Stream::invoke`] on the array's stream.
//! Operations with device and scalar operands complete asynchronously; a host
//! array operand is copied in and out, which synchronises the stream.

use crate::array::DeviceArray;
use crate::dtype::{Complex, DType, Scalar};
use crate::error::{OffloadError, Result};
use crate::host::HostArray;
use crate::invoke::KernelArg;
use crate::kernels::{symbols, ARRAY_LIBRARY};
use crate::library::{Kernel, Library};
use crate::stream::Stream;

/// Second operand of a binary operation.
#[derive(Debug, Clone, Copy)]
pub enum Operand<'a> {
    /// Device-resident array of the same shape and type.
    Device(&'a DeviceArray),
    /// Host array of the same shape and type.
    Host(&'a HostArray),
    /// Value applied to every element.
    Scalar(Scalar),
}

impl<'a> From<&'a DeviceArray> for Operand<'a> {
    fn from(array: &'a DeviceArray) -> Self {
        Self::Device(array)
    }
}

impl<'a> From<&'a HostArray> for Operand<'a> {
    fn from(array: &'a HostArray) -> Self {
        Self::Host(array)
    }
}

macro_rules! scalar_operand_from {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Operand<'_> {
                fn from(value: $ty) -> Self {
                    Self::Scalar(Scalar::from(value))
                }
            }
        )*
    };
}

scalar_operand_from!(Scalar, i32, i64, u64, usize, f64, Complex);

/// Array kernel library for `stream`'s device, loaded on first use.
fn array_kernel(stream: &Stream, symbol: &str) -> Result<Kernel> {
    let ctx = stream.context();
    let library = {
        let mut loaded = ctx.array_kernels.lock();
        match loaded.get(&stream.device_id()) {
            Some(library) => library.clone(),
            None => {
                let library = Library::load(ctx, stream.device_id(), ARRAY_LIBRARY)?;
                loaded.insert(stream.device_id(), library.clone());
                library
            }
        }
    };
    library.kernel(symbol)
}

fn count(n: usize) -> Scalar {
    Scalar::from(n)
}

impl DeviceArray {
    fn type_code(&self) -> Result<Scalar> {
        Ok(Scalar::Int(self.dtype().type_code()?))
    }

    /// Kernel argument and element increment for a binary operand.
    fn operand_arg<'a>(&self, operand: Operand<'a>) -> Result<(KernelArg<'a>, i64)> {
        match operand {
            Operand::Device(array) => {
                self.check_compatible(array.shape(), array.dtype())?;
                Ok((KernelArg::Device(array), 1))
            }
            Operand::Host(array) => {
                self.check_compatible(array.shape(), array.dtype())?;
                Ok((KernelArg::Host(array), 1))
            }
            Operand::Scalar(value) => Ok((KernelArg::Scalar(value.coerce(self.dtype())?), 0)),
        }
    }

    fn binary_into(&self, symbol: &str, operand: Operand<'_>, result: &DeviceArray) -> Result<()> {
        let stream = self.stream();
        let dt = self.type_code()?;
        let (y, incy) = self.operand_arg(operand)?;
        let kernel = array_kernel(&stream, symbol)?;
        stream.invoke(
            &kernel,
            &[
                dt.into(),
                count(self.size()).into(),
                self.into(),
                1.into(),
                y,
                incy.into(),
                result.into(),
                1.into(),
            ],
        )
    }

    fn binary(&self, symbol: &str, operand: Operand<'_>) -> Result<DeviceArray> {
        // Reject bad operands before allocating the result.
        self.operand_arg(operand)?;
        let result = self.stream().empty_like(self, false)?;
        self.binary_into(symbol, operand, &result)?;
        Ok(result)
    }

    /// Set every element to `value`.
    ///
    /// ## Errors
    ///
    /// Returns [`OffloadError::UnsupportedType`] if `value` cannot be
    /// represented in the array's element type.
    pub fn fill(&self, value: impl Into<Scalar>) -> Result<&Self> {
        let value = value.into().coerce(self.dtype())?;
        let stream = self.stream();
        let dt = self.type_code()?;
        let kernel = array_kernel(&stream, symbols::FILL)?;
        stream.invoke(
            &kernel,
            &[dt.into(), count(self.size()).into(), self.into(), value.into()],
        )?;
        Ok(self)
    }

    /// Set every element to zero.
    ///
    /// ## Errors
    ///
    /// As for [`DeviceArray::fill`].
    pub fn zero(&self) -> Result<&Self> {
        self.fill(self.dtype().zero()?)
    }

    /// Set every element to one.
    ///
    /// ## Errors
    ///
    /// As for [`DeviceArray::fill`].
    pub fn one(&self) -> Result<&Self> {
        self.fill(self.dtype().one()?)
    }

    /// Elementwise sum in a new array.
    ///
    /// ## Errors
    ///
    /// Returns [`OffloadError::ShapeMismatch`] or
    /// [`OffloadError::UnsupportedType`] for incompatible operands.
    pub fn add<'a>(&self, other: impl Into<Operand<'a>>) -> Result<DeviceArray> {
        self.binary(symbols::ADD, other.into())
    }

    /// Elementwise difference in a new array.
    ///
    /// ## Errors
    ///
    /// As for [`DeviceArray::add`].
    pub fn sub<'a>(&self, other: impl Into<Operand<'a>>) -> Result<DeviceArray> {
        self.binary(symbols::SUB, other.into())
    }

    /// Elementwise product in a new array.
    ///
    /// ## Errors
    ///
    /// As for [`DeviceArray::add`].
    pub fn mul<'a>(&self, other: impl Into<Operand<'a>>) -> Result<DeviceArray> {
        self.binary(symbols::MUL, other.into())
    }

    /// Elementwise power in a new array.
    ///
    /// ## Errors
    ///
    /// As for [`DeviceArray::add`].
    pub fn pow<'a>(&self, other: impl Into<Operand<'a>>) -> Result<DeviceArray> {
        self.binary(symbols::POW, other.into())
    }

    /// In-place elementwise sum.
    ///
    /// ## Errors
    ///
    /// As for [`DeviceArray::add`].
    pub fn add_assign<'a>(&self, other: impl Into<Operand<'a>>) -> Result<&Self> {
        self.binary_into(symbols::ADD, other.into(), self)?;
        Ok(self)
    }

    /// In-place elementwise difference.
    ///
    /// ## Errors
    ///
    /// As for [`DeviceArray::add`].
    pub fn sub_assign<'a>(&self, other: impl Into<Operand<'a>>) -> Result<&Self> {
        self.binary_into(symbols::SUB, other.into(), self)?;
        Ok(self)
    }

    /// In-place elementwise product.
    ///
    /// ## Errors
    ///
    /// As for [`DeviceArray::add`].
    pub fn mul_assign<'a>(&self, other: impl Into<Operand<'a>>) -> Result<&Self> {
        self.binary_into(symbols::MUL, other.into(), self)?;
        Ok(self)
    }

    /// In-place elementwise power.
    ///
    /// ## Errors
    ///
    /// As for [`DeviceArray::add`].
    pub fn pow_assign<'a>(&self, other: impl Into<Operand<'a>>) -> Result<&Self> {
        self.binary_into(symbols::POW, other.into(), self)?;
        Ok(self)
    }

    /// Absolute values in a new array; complex arrays yield `float64`.
    ///
    /// ## Errors
    ///
    /// Returns [`OffloadError::UnsupportedType`] for element types without a
    /// kernel type code.
    pub fn abs(&self) -> Result<DeviceArray> {
        let stream = self.stream();
        let dt = self.type_code()?;
        let result = if self.dtype().is_complex() {
            stream.empty_with_layout(self.shape(), DType::F64, self.layout(), false)?
        } else {
            stream.empty_like(self, false)?
        };
        let kernel = array_kernel(&stream, symbols::ABS)?;
        stream.invoke(
            &kernel,
            &[dt.into(), count(self.size()).into(), self.into(), (&result).into()],
        )?;
        Ok(result)
    }

    /// Elements in reverse order in a new array.
    ///
    /// ## Errors
    ///
    /// Returns [`OffloadError::InvalidArgument`] for multi-dimensional arrays.
    pub fn reverse(&self) -> Result<DeviceArray> {
        if self.ndim() > 1 {
            return Err(OffloadError::invalid_argument(format!(
                "cannot reverse array of shape {:?}, only one-dimensional arrays",
                self.shape()
            )));
        }
        let stream = self.stream();
        let dt = self.type_code()?;
        let result = stream.empty_like(self, false)?;
        let kernel = array_kernel(&stream, symbols::REVERSE)?;
        stream.invoke(
            &kernel,
            &[dt.into(), count(self.size()).into(), self.into(), (&result).into()],
        )?;
        Ok(result)
    }

    /// Overwrite elements `lower..upper` (clamped to the array size) with
    /// `source`, element by element from its start, or with one value.
    ///
    /// ## Errors
    ///
    /// Returns [`OffloadError::InvalidArgument`] if an array `source` holds
    /// fewer elements than the slice and [`OffloadError::UnsupportedType`] if
    /// its element type differs.
    pub fn set_slice<'a>(
        &self,
        lower: usize,
        upper: usize,
        source: impl Into<Operand<'a>>,
    ) -> Result<&Self> {
        let ub = upper.min(self.size());
        let lb = lower.min(ub);
        let (y, incy) = match source.into() {
            Operand::Device(array) => {
                self.check_slice_source(array.size(), array.dtype(), ub - lb)?;
                (KernelArg::Device(array), 1)
            }
            Operand::Host(array) => {
                self.check_slice_source(array.size(), array.dtype(), ub - lb)?;
                (KernelArg::Host(array), 1)
            }
            Operand::Scalar(value) => (KernelArg::Scalar(value.coerce(self.dtype())?), 0),
        };
        if lb == ub {
            return Ok(self);
        }
        let stream = self.stream();
        let dt = self.type_code()?;
        let kernel = array_kernel(&stream, symbols::SETSLICE)?;
        stream.invoke(
            &kernel,
            &[dt.into(), count(lb).into(), count(ub).into(), self.into(), y, incy.into()],
        )?;
        Ok(self)
    }

    fn check_slice_source(&self, size: usize, dtype: DType, needed: usize) -> Result<()> {
        if dtype != self.dtype() {
            return Err(OffloadError::unsupported_type(format!(
                "data types do not match: {} != {dtype}",
                self.dtype()
            )));
        }
        if size < needed {
            return Err(OffloadError::invalid_argument(format!(
                "slice of {needed} elements cannot be filled from {size} elements"
            )));
        }
        Ok(())
    }
}
