// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Kernel invocation with copy-in/copy-out marshalling.
//!
//! [`Stream::invoke`] classifies each [`KernelArg`]:
//!
//! | class                     | pointer passed            | dims | size          |
//! |---------------------------|---------------------------|------|---------------|
//! | [`ArgClass::DeviceArray`] | existing device region    | 1    | array bytes   |
//! | [`ArgClass::Null`]        | null                      | 1    | 0             |
//! | [`ArgClass::CopyInOut`]   | transient device region   | 1    | array bytes   |
//! | [`ArgClass::Scalar`]      | host address of the value | 0    | value bytes   |
//!
//! and then enqueues, in order, the copy-ins of every host array, the kernel
//! and the copy-outs. When host arrays are present the call synchronises the
//! stream before returning so the host arrays hold the kernel's output;
//! invocations with only device arrays and scalars stay asynchronous.
//!
//! Every check (device, arity, types, layouts) runs before the first
//! allocation, so a failed call leaves no work behind.

use crate::array::DeviceArray;
use crate::dtype::{Complex, Scalar};
use crate::engine::{ArgDescriptor, ArgValue, Operation};
use crate::error::{OffloadError, Result};
use crate::host::HostArray;
use crate::library::Kernel;
use crate::memory::DeviceAllocation;
use crate::stream::Stream;

/// Maximum number of arguments a kernel can receive.
pub const MAX_KERNEL_ARGS: usize = 16;

/// One kernel argument.
#[derive(Debug, Clone, Copy)]
pub enum KernelArg<'a> {
    /// An array already resident on the device.
    Device(&'a DeviceArray),
    /// A host array copied in before and out after the kernel.
    Host(&'a HostArray),
    /// A value read in place by the kernel.
    Scalar(Scalar),
    /// A null array pointer.
    Null,
}

/// Marshalling class of a [`KernelArg`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgClass {
    /// Passed by its existing device address.
    DeviceArray,
    /// Passed as a null pointer with size 0.
    Null,
    /// Copied through a transient device region.
    CopyInOut,
    /// Passed by host address.
    Scalar,
}

impl KernelArg<'_> {
    /// How the argument will be marshalled.
    ///
    /// An empty host array is passed as a null pointer.
    #[must_use]
    pub fn class(&self) -> ArgClass {
        match self {
            Self::Device(_) => ArgClass::DeviceArray,
            Self::Host(array) if array.nbytes() == 0 => ArgClass::Null,
            Self::Host(_) => ArgClass::CopyInOut,
            Self::Scalar(_) => ArgClass::Scalar,
            Self::Null => ArgClass::Null,
        }
    }
}

impl<'a> From<&'a DeviceArray> for KernelArg<'a> {
    fn from(array: &'a DeviceArray) -> Self {
        Self::Device(array)
    }
}

impl<'a> From<&'a HostArray> for KernelArg<'a> {
    fn from(array: &'a HostArray) -> Self {
        Self::Host(array)
    }
}

impl From<Scalar> for KernelArg<'_> {
    fn from(value: Scalar) -> Self {
        Self::Scalar(value)
    }
}

macro_rules! scalar_arg_from {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for KernelArg<'_> {
                fn from(value: $ty) -> Self {
                    Self::Scalar(Scalar::from(value))
                }
            }
        )*
    };
}

scalar_arg_from!(i32, i64, u64, usize, f64, Complex);

/// Build a `Vec<KernelArg>` from heterogeneous values.
///
/// ```rust
/// use offload_core::{kernel_args, HostArray, KernelArg};
///
/// let host = HostArray::from_slice(&[1.0f64, 2.0]);
/// let args = kernel_args![&host, 2, 0.5, KernelArg::Null];
/// assert_eq!(args.len(), 4);
/// ```
#[macro_export]
macro_rules! kernel_args {
    () => {
        ::std::vec::Vec::<$crate::KernelArg<'_>>::new()
    };
    ($($arg:expr),+ $(,)?) => {
        vec![$($crate::KernelArg::from($arg)),+]
    };
}

/// Argument after validation, before any device work.
enum Planned<'a> {
    Ready(ArgDescriptor),
    CopyInOut { array: &'a HostArray, type_code: i64 },
}

impl Stream {
    /// Invoke `kernel` with `args` on this stream.
    ///
    /// ## Errors
    ///
    /// - [`OffloadError::DeviceMismatch`] if the kernel or a device array
    ///   belongs to another device
    /// - [`OffloadError::InvalidArgument`] for more than
    ///   [`MAX_KERNEL_ARGS`] arguments or a released view
    /// - [`OffloadError::UnsupportedType`] for arrays without a kernel type code
    /// - [`OffloadError::UnsupportedLayout`] for non-contiguous host arrays
    ///
    /// All of these are reported before anything is allocated or enqueued.
    #[track_caller]
    pub fn invoke(&self, kernel: &Kernel, args: &[KernelArg<'_>]) -> Result<()> {
        let _trace = self.context().tracer.start("invoke", || {
            format!("{self} kernel={} argc={}", kernel.name(), args.len())
        });

        if kernel.device() != self.device_id() {
            return Err(OffloadError::device_mismatch(
                format!("{} (stream)", self.device_id()),
                format!("{} (kernel '{}')", kernel.device(), kernel.name()),
            ));
        }
        if args.len() > MAX_KERNEL_ARGS {
            return Err(OffloadError::invalid_argument(format!(
                "kernel '{}' called with {} arguments, at most {MAX_KERNEL_ARGS} supported",
                kernel.name(),
                args.len()
            )));
        }

        let planned = args
            .iter()
            .map(|arg| self.plan(arg))
            .collect::<Result<Vec<_>>>()?;

        let mut transients: Vec<(DeviceAllocation, &HostArray)> = Vec::new();
        for plan in &planned {
            if let Planned::CopyInOut { array, .. } = plan {
                transients.push((self.allocate(array.nbytes())?, array));
            }
        }

        for (mem, array) in &transients {
            self.host_to_device(array.buffer(), mem, array.nbytes(), 0, 0)?;
        }

        let mut next_transient = transients.iter();
        let descriptors = planned
            .iter()
            .map(|plan| match plan {
                Planned::Ready(descriptor) => *descriptor,
                Planned::CopyInOut { array, type_code } => {
                    let addr = next_transient
                        .next()
                        .map_or(crate::engine::DeviceAddr::NULL, |(mem, _)| mem.addr());
                    array_descriptor(*type_code, ArgValue::Device(addr), array.nbytes())
                }
            })
            .collect::<Vec<_>>();

        tracing::debug!(
            device = %self.device_id(),
            stream = %self.id(),
            kernel = kernel.name(),
            argc = descriptors.len(),
            copy_in_out = transients.len(),
            "invoking kernel"
        );
        self.enqueue(Operation::Invoke {
            module: kernel.module(),
            kernel: kernel.func(),
            name: kernel.name().to_string(),
            args: descriptors,
        })?;

        for (mem, array) in &transients {
            self.device_to_host(mem, array.buffer(), array.nbytes(), 0, 0)?;
        }

        if !transients.is_empty() {
            self.sync()?;
        }
        Ok(())
    }

    fn plan<'a>(&self, arg: &KernelArg<'a>) -> Result<Planned<'a>> {
        Ok(match *arg {
            KernelArg::Device(array) => {
                self.check_device(array.device())?;
                let type_code = array.dtype().type_code()?;
                let addr = array.device_addr()?;
                Planned::Ready(array_descriptor(
                    type_code,
                    ArgValue::Device(addr),
                    array.nbytes(),
                ))
            }
            KernelArg::Host(array) => {
                let type_code = array.dtype().type_code()?;
                array.contiguous_layout()?;
                if array.nbytes() == 0 {
                    Planned::Ready(array_descriptor(type_code, ArgValue::Null, 0))
                } else {
                    Planned::CopyInOut { array, type_code }
                }
            }
            KernelArg::Scalar(value) => Planned::Ready(ArgDescriptor {
                dims: 0,
                type_code: value.dtype().type_code()?,
                value: ArgValue::Scalar(value.to_words()),
                size: byte_size(value.size_in_bytes()),
            }),
            KernelArg::Null => Planned::Ready(array_descriptor(0, ArgValue::Null, 0)),
        })
    }
}

fn array_descriptor(type_code: i64, value: ArgValue, nbytes: usize) -> ArgDescriptor {
    ArgDescriptor {
        dims: 1,
        type_code,
        value,
        size: byte_size(nbytes),
    }
}

fn byte_size(nbytes: usize) -> i64 {
    i64::try_from(nbytes).unwrap_or(i64::MAX)
}
