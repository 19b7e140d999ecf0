// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Builtin elementwise kernels backing the device array operations.
//!
//! Every kernel takes the element type code as its first argument and
//! dispatches on it. Counts, bounds and increments are `i64` scalars. Operand
//! pointers refer to elements of the dispatched type; a scalar operand is
//! passed by host address with an increment of zero.
//!
//! | symbol                      | arguments                            |
//! |-----------------------------|--------------------------------------|
//! | `offload_array_fill`        | `dt, n, x, value`                    |
//! | `offload_array_add`         | `dt, n, x, incx, y, incy, r, incr`   |
//! | `offload_array_sub`         | `dt, n, x, incx, y, incy, r, incr`   |
//! | `offload_array_mul`         | `dt, n, x, incx, y, incy, r, incr`   |
//! | `offload_array_pow`         | `dt, n, x, incx, y, incy, r, incr`   |
//! | `offload_array_abs`         | `dt, n, x, r` (complex → float64 `r`) |
//! | `offload_array_reverse`     | `dt, n, x, r`                        |
//! | `offload_array_setslice`    | `dt, lb, ub, x, y, incy`             |

use crate::dtype::{Complex, DType};
use crate::engine::KernelModule;
use std::ffi::c_void;

/// Name of the builtin array kernel module.
pub const ARRAY_LIBRARY: &str = "liboffload_array.so";

/// Kernel symbol names.
pub mod symbols {
    /// Broadcast a value.
    pub const FILL: &str = "offload_array_fill";
    /// `r = x + y`.
    pub const ADD: &str = "offload_array_add";
    /// `r = x - y`.
    pub const SUB: &str = "offload_array_sub";
    /// `r = x * y`.
    pub const MUL: &str = "offload_array_mul";
    /// `r = x ** y`.
    pub const POW: &str = "offload_array_pow";
    /// `r = |x|`.
    pub const ABS: &str = "offload_array_abs";
    /// `r = x[::-1]`.
    pub const REVERSE: &str = "offload_array_reverse";
    /// `x[lb..ub] = y`.
    pub const SETSLICE: &str = "offload_array_setslice";
}

/// The builtin module registered by every host engine.
#[must_use]
pub fn array_module() -> KernelModule {
    KernelModule::new(ARRAY_LIBRARY)
        .with_kernel(symbols::FILL, offload_array_fill)
        .with_kernel(symbols::ADD, offload_array_add)
        .with_kernel(symbols::SUB, offload_array_sub)
        .with_kernel(symbols::MUL, offload_array_mul)
        .with_kernel(symbols::POW, offload_array_pow)
        .with_kernel(symbols::ABS, offload_array_abs)
        .with_kernel(symbols::REVERSE, offload_array_reverse)
        .with_kernel(symbols::SETSLICE, offload_array_setslice)
}

trait Arith: Copy {
    type Abs: Copy;
    fn add(self, rhs: Self) -> Self;
    fn sub(self, rhs: Self) -> Self;
    fn mul(self, rhs: Self) -> Self;
    fn pow(self, rhs: Self) -> Self;
    fn abs(self) -> Self::Abs;
}

impl Arith for i64 {
    type Abs = i64;
    fn add(self, rhs: Self) -> Self {
        self.wrapping_add(rhs)
    }
    fn sub(self, rhs: Self) -> Self {
        self.wrapping_sub(rhs)
    }
    fn mul(self, rhs: Self) -> Self {
        self.wrapping_mul(rhs)
    }
    fn pow(self, rhs: Self) -> Self {
        match u32::try_from(rhs) {
            Ok(exp) => self.wrapping_pow(exp),
            // Negative exponents truncate towards zero.
            Err(_) if rhs < 0 => match self {
                1 => 1,
                -1 if rhs % 2 == 0 => 1,
                -1 => -1,
                _ => 0,
            },
            Err(_) => self.wrapping_pow(u32::MAX),
        }
    }
    fn abs(self) -> i64 {
        self.wrapping_abs()
    }
}

impl Arith for u64 {
    type Abs = u64;
    fn add(self, rhs: Self) -> Self {
        self.wrapping_add(rhs)
    }
    fn sub(self, rhs: Self) -> Self {
        self.wrapping_sub(rhs)
    }
    fn mul(self, rhs: Self) -> Self {
        self.wrapping_mul(rhs)
    }
    fn pow(self, rhs: Self) -> Self {
        self.wrapping_pow(u32::try_from(rhs).unwrap_or(u32::MAX))
    }
    fn abs(self) -> u64 {
        self
    }
}

impl Arith for f64 {
    type Abs = f64;
    fn add(self, rhs: Self) -> Self {
        self + rhs
    }
    fn sub(self, rhs: Self) -> Self {
        self - rhs
    }
    fn mul(self, rhs: Self) -> Self {
        self * rhs
    }
    fn pow(self, rhs: Self) -> Self {
        self.powf(rhs)
    }
    fn abs(self) -> f64 {
        f64::abs(self)
    }
}

impl Arith for Complex {
    type Abs = f64;
    fn add(self, rhs: Self) -> Self {
        Complex::new(self.re + rhs.re, self.im + rhs.im)
    }
    fn sub(self, rhs: Self) -> Self {
        Complex::new(self.re - rhs.re, self.im - rhs.im)
    }
    fn mul(self, rhs: Self) -> Self {
        Complex::new(
            self.re * rhs.re - self.im * rhs.im,
            self.re * rhs.im + self.im * rhs.re,
        )
    }
    fn pow(self, rhs: Self) -> Self {
        if self.re == 0.0 && self.im == 0.0 {
            return if rhs.re == 0.0 && rhs.im == 0.0 {
                Complex::new(1.0, 0.0)
            } else {
                Complex::new(0.0, 0.0)
            };
        }
        // z^w = exp(w * ln z)
        let ln = Complex::new(self.norm().ln(), self.im.atan2(self.re));
        let e = rhs.mul(ln);
        let scale = e.re.exp();
        Complex::new(scale * e.im.cos(), scale * e.im.sin())
    }
    fn abs(self) -> f64 {
        self.norm()
    }
}

/// Read the `i`-th `i64` scalar argument.
unsafe fn scalar_arg(ptrs: *const *mut c_void, i: usize) -> i64 {
    *(*ptrs.add(i)).cast::<i64>()
}

unsafe fn ptr_arg<T>(ptrs: *const *mut c_void, i: usize) -> *mut T {
    (*ptrs.add(i)).cast::<T>()
}

fn count(n: i64) -> isize {
    isize::try_from(n.max(0)).unwrap_or(0)
}

fn step(inc: i64) -> isize {
    isize::try_from(inc).unwrap_or(0)
}

/// Dispatch on the type code in argument 0.
macro_rules! dispatch {
    ($ptrs:expr, $body:ident) => {
        let code = scalar_arg($ptrs, 0);
        match DType::from_type_code(code) {
            Some(DType::I64) => $body::<i64>($ptrs),
            Some(DType::F64) => $body::<f64>($ptrs),
            Some(DType::Complex128) => $body::<Complex>($ptrs),
            Some(DType::U64) => $body::<u64>($ptrs),
            _ => tracing::error!("array kernel called with unknown type code {code}"),
        }
    };
}

unsafe fn binary<T: Arith>(ptrs: *const *mut c_void, op: fn(T, T) -> T) {
    let n = count(scalar_arg(ptrs, 1));
    let x = ptr_arg::<T>(ptrs, 2);
    let incx = step(scalar_arg(ptrs, 3));
    let y = ptr_arg::<T>(ptrs, 4);
    let incy = step(scalar_arg(ptrs, 5));
    let r = ptr_arg::<T>(ptrs, 6);
    let incr = step(scalar_arg(ptrs, 7));
    for i in 0..n {
        let value = op(x.offset(i * incx).read(), y.offset(i * incy).read());
        r.offset(i * incr).write(value);
    }
}

macro_rules! binary_kernel {
    ($name:ident, $method:ident) => {
        unsafe extern "C" fn $name(
            argc: i64,
            _dims: *const i64,
            _types: *const i64,
            ptrs: *const *mut c_void,
            _sizes: *const i64,
        ) {
            unsafe fn run<T: Arith>(ptrs: *const *mut c_void) {
                binary::<T>(ptrs, T::$method);
            }
            if argc >= 8 {
                dispatch!(ptrs, run);
            }
        }
    };
}

binary_kernel!(offload_array_add, add);
binary_kernel!(offload_array_sub, sub);
binary_kernel!(offload_array_mul, mul);
binary_kernel!(offload_array_pow, pow);

unsafe extern "C" fn offload_array_fill(
    argc: i64,
    _dims: *const i64,
    _types: *const i64,
    ptrs: *const *mut c_void,
    _sizes: *const i64,
) {
    unsafe fn run<T: Copy>(ptrs: *const *mut c_void) {
        let n = count(scalar_arg(ptrs, 1));
        let x = ptr_arg::<T>(ptrs, 2);
        let value = ptr_arg::<T>(ptrs, 3).read();
        for i in 0..n {
            x.offset(i).write(value);
        }
    }
    if argc >= 4 {
        dispatch!(ptrs, run);
    }
}

unsafe extern "C" fn offload_array_abs(
    argc: i64,
    _dims: *const i64,
    _types: *const i64,
    ptrs: *const *mut c_void,
    _sizes: *const i64,
) {
    unsafe fn run<T: Arith>(ptrs: *const *mut c_void) {
        let n = count(scalar_arg(ptrs, 1));
        let x = ptr_arg::<T>(ptrs, 2);
        let r = ptr_arg::<T::Abs>(ptrs, 3);
        for i in 0..n {
            r.offset(i).write(x.offset(i).read().abs());
        }
    }
    if argc >= 4 {
        dispatch!(ptrs, run);
    }
}

unsafe extern "C" fn offload_array_reverse(
    argc: i64,
    _dims: *const i64,
    _types: *const i64,
    ptrs: *const *mut c_void,
    _sizes: *const i64,
) {
    unsafe fn run<T: Copy>(ptrs: *const *mut c_void) {
        let n = count(scalar_arg(ptrs, 1));
        let x = ptr_arg::<T>(ptrs, 2);
        let r = ptr_arg::<T>(ptrs, 3);
        for i in 0..n {
            r.offset(i).write(x.offset(n - i - 1).read());
        }
    }
    if argc >= 4 {
        dispatch!(ptrs, run);
    }
}

unsafe extern "C" fn offload_array_setslice(
    argc: i64,
    _dims: *const i64,
    _types: *const i64,
    ptrs: *const *mut c_void,
    _sizes: *const i64,
) {
    unsafe fn run<T: Copy>(ptrs: *const *mut c_void) {
        let lb = count(scalar_arg(ptrs, 1));
        let ub = count(scalar_arg(ptrs, 2));
        let x = ptr_arg::<T>(ptrs, 3);
        let y = ptr_arg::<T>(ptrs, 4);
        let incy = step(scalar_arg(ptrs, 5));
        for i in 0..(ub - lb).max(0) {
            x.offset(lb + i).write(y.offset(i * incy).read());
        }
    }
    if argc >= 6 {
        dispatch!(ptrs, run);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Call a kernel directly with host pointers for every argument.
    fn call(kernel: crate::engine::KernelFn, ptrs: &[*mut c_void]) {
        let dims = vec![0i64; ptrs.len()];
        let types = vec![0i64; ptrs.len()];
        let sizes = vec![0i64; ptrs.len()];
        unsafe {
            kernel(
                ptrs.len() as i64,
                dims.as_ptr(),
                types.as_ptr(),
                ptrs.as_ptr(),
                sizes.as_ptr(),
            );
        }
    }

    fn p<T>(v: &mut T) -> *mut c_void {
        (v as *mut T).cast()
    }

    fn s<T>(v: &mut [T]) -> *mut c_void {
        v.as_mut_ptr().cast()
    }

    #[test]
    fn test_fill_f64() {
        let (mut dt, mut n, mut value) = (1i64, 3i64, 7.5f64);
        let mut x = [0.0f64; 4];
        call(offload_array_fill, &[p(&mut dt), p(&mut n), s(&mut x), p(&mut value)]);
        assert_eq!(x, [7.5, 7.5, 7.5, 0.0]);
    }

    #[test]
    fn test_unknown_type_code_leaves_memory() {
        let (mut dt, mut n, mut value) = (9i64, 2i64, 7.5f64);
        let mut x = [1.0f64, 2.0];
        call(offload_array_fill, &[p(&mut dt), p(&mut n), s(&mut x), p(&mut value)]);
        assert_eq!(x, [1.0, 2.0]);
    }

    #[test]
    fn test_add_with_scalar_operand() {
        let (mut dt, mut n, mut one, mut zero) = (0i64, 4i64, 1i64, 0i64);
        let mut x = [1i64, 2, 3, 4];
        let mut y = 10i64;
        let mut r = [0i64; 4];
        call(
            offload_array_add,
            &[
                p(&mut dt),
                p(&mut n),
                s(&mut x),
                p(&mut one),
                p(&mut y),
                p(&mut zero),
                s(&mut r),
                p(&mut 1i64),
            ],
        );
        assert_eq!(r, [11, 12, 13, 14]);
    }

    #[test]
    fn test_complex_mul_and_abs() {
        let (mut dt, mut n, mut inc) = (2i64, 2i64, 1i64);
        let mut x = [Complex::new(1.0, 2.0), Complex::new(3.0, 4.0)];
        let mut y = [Complex::new(0.0, 1.0), Complex::new(1.0, 0.0)];
        let mut r = [Complex::default(); 2];
        call(
            offload_array_mul,
            &[
                p(&mut dt),
                p(&mut n),
                s(&mut x),
                p(&mut inc),
                s(&mut y),
                p(&mut 1i64),
                s(&mut r),
                p(&mut 1i64),
            ],
        );
        assert_eq!(r[0], Complex::new(-2.0, 1.0));
        assert_eq!(r[1], Complex::new(3.0, 4.0));

        let mut out = [0.0f64; 2];
        call(offload_array_abs, &[p(&mut dt), p(&mut n), s(&mut r), s(&mut out)]);
        assert!((out[1] - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_reverse_and_setslice() {
        let (mut dt, mut n) = (3i64, 5i64);
        let mut x = [1u64, 2, 3, 4, 5];
        let mut r = [0u64; 5];
        call(offload_array_reverse, &[p(&mut dt), p(&mut n), s(&mut x), s(&mut r)]);
        assert_eq!(r, [5, 4, 3, 2, 1]);

        let (mut lb, mut ub, mut inc) = (1i64, 3i64, 1i64);
        let mut y = [9u64, 8];
        call(
            offload_array_setslice,
            &[p(&mut dt), p(&mut lb), p(&mut ub), s(&mut r), s(&mut y), p(&mut inc)],
        );
        assert_eq!(r, [5, 9, 8, 2, 1]);
    }

    #[test]
    fn test_integer_pow() {
        assert_eq!(Arith::pow(2i64, 10), 1024);
        assert_eq!(Arith::pow(2i64, -1), 0);
        assert_eq!(Arith::pow(-1i64, -3), -1);
        assert_eq!(Arith::pow(3u64, 3), 27);
        let c = Arith::pow(Complex::new(0.0, 1.0), Complex::new(2.0, 0.0));
        assert!((c.re + 1.0).abs() < 1e-12 && c.im.abs() < 1e-12);
    }

    #[test]
    fn test_array_module_symbols() {
        let module = array_module();
        assert_eq!(module.name(), ARRAY_LIBRARY);
        for symbol in [
            symbols::FILL,
            symbols::ADD,
            symbols::SUB,
            symbols::MUL,
            symbols::POW,
            symbols::ABS,
            symbols::REVERSE,
            symbols::SETSLICE,
        ] {
            assert!(module.get(symbol).is_some(), "{symbol}");
        }
    }
}
