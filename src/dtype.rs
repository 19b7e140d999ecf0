// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Element types and scalar values understood by the offload runtime.
//!
//! Kernels receive an integer type code per argument. Only a small, closed set
//! of element types has a code; arrays of other element types can still be
//! moved between host and device, but any attempt to pass them to a kernel
//! fails with [`OffloadError::UnsupportedType`].
//!
//! | dtype        | code |
//! |--------------|------|
//! | `I64`        | 0    |
//! | `F64`        | 1    |
//! | `Complex128` | 2    |
//! | `U64`        | 3    |

use crate::error::{OffloadError, Result};
use bytemuck::{Pod, Zeroable};
use std::fmt;

/// Element type of a host or device array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// 32-bit signed integer (transfer only, no kernel type code).
    I32,
    /// 64-bit signed integer.
    I64,
    /// 64-bit unsigned integer.
    U64,
    /// 32-bit float (transfer only, no kernel type code).
    F32,
    /// 64-bit float.
    F64,
    /// Double-precision complex number.
    Complex128,
}

impl DType {
    /// Size in bytes of one element.
    #[must_use]
    pub fn size_in_bytes(self) -> usize {
        match self {
            Self::I32 | Self::F32 => 4,
            Self::I64 | Self::U64 | Self::F64 => 8,
            Self::Complex128 => 16,
        }
    }

    /// Human-readable name used in logs and error messages.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::I32 => "int32",
            Self::I64 => "int64",
            Self::U64 => "uint64",
            Self::F32 => "float32",
            Self::F64 => "float64",
            Self::Complex128 => "complex128",
        }
    }

    /// Integer code passed to kernels in the argument descriptor table.
    ///
    /// ## Errors
    ///
    /// Returns [`OffloadError::UnsupportedType`] for element types outside the
    /// kernel type set.
    pub fn type_code(self) -> Result<i64> {
        match self {
            Self::I64 => Ok(0),
            Self::F64 => Ok(1),
            Self::Complex128 => Ok(2),
            Self::U64 => Ok(3),
            Self::I32 | Self::F32 => Err(OffloadError::unsupported_type(format!(
                "{} has no kernel type code",
                self.name()
            ))),
        }
    }

    /// Inverse of [`DType::type_code`].
    #[must_use]
    pub fn from_type_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::I64),
            1 => Some(Self::F64),
            2 => Some(Self::Complex128),
            3 => Some(Self::U64),
            _ => None,
        }
    }

    /// Check if this is a complex type.
    #[must_use]
    pub fn is_complex(self) -> bool {
        matches!(self, Self::Complex128)
    }

    /// The additive identity as a scalar of this type.
    ///
    /// ## Errors
    ///
    /// Returns [`OffloadError::UnsupportedType`] when the type has no kernel
    /// representation.
    pub fn zero(self) -> Result<Scalar> {
        self.type_code()?;
        Ok(match self {
            Self::U64 => Scalar::UInt(0),
            Self::F64 => Scalar::Float(0.0),
            Self::Complex128 => Scalar::Complex(Complex::new(0.0, 0.0)),
            _ => Scalar::Int(0),
        })
    }

    /// The multiplicative identity as a scalar of this type.
    ///
    /// ## Errors
    ///
    /// Returns [`OffloadError::UnsupportedType`] when the type has no kernel
    /// representation.
    pub fn one(self) -> Result<Scalar> {
        self.type_code()?;
        Ok(match self {
            Self::U64 => Scalar::UInt(1),
            Self::F64 => Scalar::Float(1.0),
            Self::Complex128 => Scalar::Complex(Complex::new(1.0, 0.0)),
            _ => Scalar::Int(1),
        })
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Double-precision complex number with C layout (`re`, `im`).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct Complex {
    /// Real part.
    pub re: f64,
    /// Imaginary part.
    pub im: f64,
}

impl Complex {
    /// Create a complex number from its parts.
    #[must_use]
    pub const fn new(re: f64, im: f64) -> Self {
        Self { re, im }
    }

    /// Magnitude `|z|`.
    #[must_use]
    pub fn norm(self) -> f64 {
        self.re.hypot(self.im)
    }
}

/// Rust types that can be stored in host and device arrays.
pub trait Element: Pod + Send + Sync + 'static {
    /// Element type tag for this Rust type.
    const DTYPE: DType;
}

impl Element for i32 {
    const DTYPE: DType = DType::I32;
}

impl Element for i64 {
    const DTYPE: DType = DType::I64;
}

impl Element for u64 {
    const DTYPE: DType = DType::U64;
}

impl Element for f32 {
    const DTYPE: DType = DType::F32;
}

impl Element for f64 {
    const DTYPE: DType = DType::F64;
}

impl Element for Complex {
    const DTYPE: DType = DType::Complex128;
}

/// A single value passed by host address to a kernel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    /// Signed 64-bit integer.
    Int(i64),
    /// Unsigned 64-bit integer.
    UInt(u64),
    /// 64-bit float.
    Float(f64),
    /// Double-precision complex.
    Complex(Complex),
}

impl Scalar {
    /// Element type of the value.
    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::Int(_) => DType::I64,
            Self::UInt(_) => DType::U64,
            Self::Float(_) => DType::F64,
            Self::Complex(_) => DType::Complex128,
        }
    }

    /// Size in bytes of the value as seen by a kernel.
    #[must_use]
    pub fn size_in_bytes(&self) -> usize {
        self.dtype().size_in_bytes()
    }

    /// Raw storage handed to kernels; the value occupies the leading bytes.
    #[must_use]
    pub fn to_words(&self) -> [u64; 2] {
        match *self {
            Self::Int(v) => [u64::from_ne_bytes(v.to_ne_bytes()), 0],
            Self::UInt(v) => [v, 0],
            Self::Float(v) => [v.to_bits(), 0],
            Self::Complex(c) => [c.re.to_bits(), c.im.to_bits()],
        }
    }

    /// Convert the value to `dtype` where this is lossless.
    ///
    /// Integers convert between signed and unsigned when the value fits.
    /// No other cross-type conversion is performed.
    ///
    /// ## Errors
    ///
    /// Returns [`OffloadError::UnsupportedType`] if the value cannot be
    /// represented as `dtype`.
    pub fn coerce(self, dtype: DType) -> Result<Self> {
        let converted = match (self, dtype) {
            (Self::Int(_), DType::I64)
            | (Self::UInt(_), DType::U64)
            | (Self::Float(_), DType::F64)
            | (Self::Complex(_), DType::Complex128) => Some(self),
            (Self::Int(v), DType::U64) => u64::try_from(v).ok().map(Self::UInt),
            (Self::UInt(v), DType::I64) => i64::try_from(v).ok().map(Self::Int),
            _ => None,
        };
        converted.ok_or_else(|| {
            OffloadError::unsupported_type(format!(
                "data types do not match: {} != {}",
                dtype,
                self.dtype()
            ))
        })
    }
}

impl From<i32> for Scalar {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<usize> for Scalar {
    fn from(v: usize) -> Self {
        match i64::try_from(v) {
            Ok(v) => Self::Int(v),
            Err(_) => Self::UInt(v as u64),
        }
    }
}

impl From<u64> for Scalar {
    fn from(v: u64) -> Self {
        Self::UInt(v)
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<Complex> for Scalar {
    fn from(v: Complex) -> Self {
        Self::Complex(v)
    }
}
