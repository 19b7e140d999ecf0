//! Example: Data Transfers
//!
//! This example moves a buffer to the device, copies it between two device
//! allocations, and reads it back, all on one stream.
//!
//! Run with:
//!
//! ```bash
//! cargo run --example data_transfer
//! ```

use offload_core::{init_logging, DeviceRegistry, HostArray, HostBuffer, LogConfig, Result};

fn main() -> Result<()> {
    println!("=== Data Transfer Example ===\n");

    let registry = DeviceRegistry::from_env()?;
    init_logging(&LogConfig::from_offload_config(registry.config()));

    let device = registry.device(0)?;
    let stream = device.default_stream()?;

    let a = HostArray::from_slice(&(0..16).map(f64::from).collect::<Vec<_>>());
    let b = HostBuffer::zeroed(a.nbytes());
    let nbytes = a.nbytes();

    let first = stream.allocate(nbytes)?;
    let second = stream.allocate(nbytes)?;

    stream.host_to_device(a.buffer(), &first, nbytes, 0, 0)?;
    stream.device_to_device(&first, &second, nbytes, 0, 0)?;

    println!("Before device_to_host: {:?}", b.to_vec::<f64>());
    stream.device_to_host(&second, &b, nbytes, 0, 0)?;
    stream.sync()?;
    println!("After device_to_host:  {:?}", b.to_vec::<f64>());

    // Offsets address sub-ranges of either side.
    let half = nbytes / 2;
    let c = HostBuffer::zeroed(nbytes);
    stream.device_to_host(&second, &c, half, half, 0)?;
    stream.sync()?;
    println!("Upper half at offset 0: {:?}", c.to_vec::<f64>());

    let info = device.memory_info()?;
    println!("\n{device}: {} bytes allocatable", info.allocatable);

    if registry.tracer().is_enabled() {
        println!("\n{}", registry.tracer().report());
    }
    Ok(())
}
