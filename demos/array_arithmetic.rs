//! Example: Device Array Arithmetic
//!
//! This example binds host arrays to the device, combines them with the
//! builtin elementwise kernels, and reads the results back.
//!
//! Run with:
//!
//! ```bash
//! cargo run --example array_arithmetic
//! ```

use offload_core::{init_logging, Complex, DType, DeviceRegistry, HostArray, LogConfig, Result};

fn main() -> Result<()> {
    println!("=== Array Arithmetic Example ===\n");

    let registry = DeviceRegistry::from_env()?;
    init_logging(&LogConfig::from_offload_config(registry.config()));
    let stream = registry.device(0)?.default_stream()?;

    let a = stream.bind(&HostArray::from_slice(&[1.0f64, 2.0, 3.0, 4.0]), true)?;
    let b = stream.ones_like(&a, false)?;

    let sum = a.add(&b)?;
    let scaled = sum.mul(0.5)?;
    let squared = scaled.pow(2.0)?;
    println!("a            = {:?}", a.to_vec::<f64>()?);
    println!("(a + 1) / 2  = {:?}", scaled.to_vec::<f64>()?);
    println!("squared      = {:?}", squared.to_vec::<f64>()?);
    println!("reversed     = {:?}", squared.reverse()?.to_vec::<f64>()?);

    // In-place updates reuse the device buffer.
    a.add_assign(10.0)?.set_slice(0, 2, 0.0)?;
    println!("a (updated)  = {:?}", a.to_vec::<f64>()?);

    let matrix = a.reshape(&[2, 2])?;
    println!("\nview {matrix}, base alive: {}", matrix.base().is_some());

    let z = stream.bcast(Complex::new(3.0, 4.0), &[3], DType::Complex128, false)?;
    println!("|3+4i|       = {:?}", z.abs()?.to_vec::<f64>()?);

    Ok(())
}
