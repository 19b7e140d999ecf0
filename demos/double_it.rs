//! Example: Low-level Kernel Invocation
//!
//! This example registers a native kernel with the host engine, passes it a
//! translated device pointer as a plain scalar, and doubles 32 integers in
//! device memory.
//!
//! Run with:
//!
//! ```bash
//! cargo run --example double_it
//! ```

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

use offload_core::{
    init_logging, kernel_args, DeviceRegistry, HostBuffer, HostEngine, KernelModule, LogConfig,
    OffloadConfig, Result,
};
use std::ffi::c_void;
use std::sync::Arc;

/// `x[i] *= 2` for `n` int64 elements; `x` arrives as a raw address.
unsafe extern "C" fn doubleit_kernel(
    _argc: i64,
    _dims: *const i64,
    _types: *const i64,
    ptrs: *const *mut c_void,
    _sizes: *const i64,
) {
    let n = *(*ptrs).cast::<i64>();
    let x = *(*ptrs.add(1)).cast::<u64>() as usize as *mut i64;
    for i in 0..n as usize {
        *x.add(i) *= 2;
    }
}

fn main() -> Result<()> {
    println!("=== Double It Example ===\n");

    let config = OffloadConfig::from_env();
    init_logging(&LogConfig::from_offload_config(&config));

    let engine = HostEngine::builder()
        .devices(config.host_devices)
        .device_memory(config.device_memory)
        .module(KernelModule::new("libdouble_it.so").with_kernel("doubleit_kernel", doubleit_kernel))
        .build();
    let registry = DeviceRegistry::new(Arc::new(engine), config)?;

    let device = registry.device(0)?;
    let library = device.load_library("libdouble_it.so")?;
    let kernel = library.kernel("doubleit_kernel")?;
    let stream = device.default_stream()?;

    let values: Vec<i64> = (1..=32).collect();
    let host = HostBuffer::from_slice(&values);
    let mem = stream.allocate(host.len())?;
    let addr = stream.translate_device_pointer(&mem)?;

    stream.host_to_device(&host, &mem, host.len(), 0, 0)?;
    stream.invoke(&kernel, &kernel_args![32, addr])?;
    stream.device_to_host(&mem, &host, host.len(), 0, 0)?;
    stream.sync()?;

    println!("{:?}", host.to_vec::<i64>());
    Ok(())
}
