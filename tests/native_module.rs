// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Native shared-object modules loaded from the library search path.
//!
//! The kernel library is compiled from C at test time with the system C
//! compiler (`$CC`, default `cc`); the tests are skipped when none is
//! available.

#![cfg(target_os = "linux")]
#![allow(clippy::cast_possible_truncation)]

use offload_core::engine::ModuleSource;
use offload_core::{
    kernel_args, DType, DeviceRegistry, HostArray, HostEngine, KernelModule, OffloadConfig,
    OffloadError, Result,
};
use serial_test::serial;
use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

const NATIVE_LIBRARY: &str = "libnative_store.so";

const NATIVE_SOURCE: &str = r"
#include <stdint.h>

void offload_test_store(int64_t argc, const int64_t *dims, const int64_t *types,
                        void **ptrs, const int64_t *sizes) {
    int64_t n = *(const int64_t *)ptrs[0];
    int64_t *x = (int64_t *)ptrs[1];
    for (int64_t i = 0; i < n; ++i) {
        x[i] = 42 + i;
    }
}
";

/// Compile the kernel library into a fresh directory, or `None` without a C compiler.
fn build_or_skip() -> Option<TempDir> {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("store.c");
    std::fs::write(&source, NATIVE_SOURCE).unwrap();
    let compiler = std::env::var("CC").unwrap_or_else(|_| "cc".to_string());
    let status = Command::new(&compiler)
        .args(["-shared", "-fPIC", "-O1", "-o"])
        .arg(dir.path().join(NATIVE_LIBRARY))
        .arg(&source)
        .status();
    match status {
        Ok(status) if status.success() => Some(dir),
        Ok(status) => {
            eprintln!("Skipping native module test: {compiler} exited with {status}");
            None
        }
        Err(err) => {
            eprintln!("Skipping native module test: cannot run {compiler}: {err}");
            None
        }
    }
}

/// Spins until the `AtomicBool` whose address is scalar argument 0 is set.
unsafe extern "C" fn wait_for_gate(
    _argc: i64,
    _dims: *const i64,
    _types: *const i64,
    ptrs: *const *mut c_void,
    _sizes: *const i64,
) {
    let addr = *(*ptrs).cast::<u64>();
    let gate = &*(addr as usize as *const AtomicBool);
    while !gate.load(Ordering::Acquire) {
        std::thread::yield_now();
    }
}

/// Gate that holds a stream until opened; opens on drop so a failing test
/// never leaves a worker spinning.
struct Gate(&'static AtomicBool);

impl Gate {
    fn closed() -> Self {
        Self(Box::leak(Box::new(AtomicBool::new(false))))
    }

    fn addr(&self) -> u64 {
        (self.0 as *const AtomicBool) as usize as u64
    }

    fn open(&self) {
        self.0.store(true, Ordering::Release);
    }
}

impl Drop for Gate {
    fn drop(&mut self) {
        self.open();
    }
}

/// Points `TMPDIR` at a private directory so staged copies can be counted.
struct Staging {
    dir: TempDir,
    previous: Option<String>,
}

impl Staging {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let previous = std::env::var("TMPDIR").ok();
        std::env::set_var("TMPDIR", dir.path());
        Self { dir, previous }
    }

    fn staged(&self) -> usize {
        std::fs::read_dir(self.dir.path()).unwrap().count()
    }
}

impl Drop for Staging {
    fn drop(&mut self) {
        match &self.previous {
            Some(value) => std::env::set_var("TMPDIR", value),
            None => std::env::remove_var("TMPDIR"),
        }
    }
}

fn registry(library_dir: &Path) -> DeviceRegistry {
    let engine = HostEngine::builder()
        .devices(1)
        .module(KernelModule::new("libgate.so").with_kernel("wait_for_gate", wait_for_gate))
        .build();
    let config =
        OffloadConfig::new().with_library_path(format!("/nonexistent:{}", library_dir.display()));
    DeviceRegistry::new(Arc::new(engine), config).unwrap()
}

#[test]
#[serial]
fn test_native_library_load_invoke_unload() -> Result<()> {
    let Some(dir) = build_or_skip() else {
        return Ok(());
    };
    let staging = Staging::new();
    let registry = registry(dir.path());
    let device = registry.device(0)?;
    let stream = device.default_stream()?;

    let library = device.load_library(NATIVE_LIBRARY)?;
    assert_eq!(
        library.source(),
        &ModuleSource::File(PathBuf::from(dir.path()).join(NATIVE_LIBRARY))
    );
    assert_eq!(staging.staged(), 1);

    let kernel = library.kernel("offload_test_store")?;
    assert!(matches!(
        library.kernel("offload_test_missing"),
        Err(OffloadError::SymbolNotFound { .. })
    ));

    let host = HostArray::zeros(&[4], DType::I64);
    stream.invoke(&kernel, &kernel_args![4usize, &host])?;
    assert_eq!(host.to_vec::<i64>()?, vec![42, 43, 44, 45]);

    drop(kernel);
    drop(library);
    assert_eq!(staging.staged(), 0);
    Ok(())
}

#[test]
#[serial]
fn test_unloaded_library_outlives_queued_kernel() -> Result<()> {
    let Some(dir) = build_or_skip() else {
        return Ok(());
    };
    let staging = Staging::new();
    let registry = registry(dir.path());
    let device = registry.device(0)?;
    let stream = device.default_stream()?;
    let gate = Gate::closed();
    let wait = device.load_library("libgate.so")?.kernel("wait_for_gate")?;

    let values = stream.zeros(&[3], DType::I64, false)?;
    let library = device.load_library(NATIVE_LIBRARY)?;
    let kernel = library.kernel("offload_test_store")?;
    stream.invoke(&wait, &kernel_args![gate.addr()])?;
    stream.invoke(&kernel, &kernel_args![3usize, &values])?;

    // The call is still queued behind the gate; releasing every handle must
    // not unmap the image it will run from.
    drop(kernel);
    drop(library);
    assert_eq!(staging.staged(), 1);

    gate.open();
    stream.sync()?;
    assert_eq!(values.to_vec::<i64>()?, vec![42, 43, 44]);
    assert_eq!(staging.staged(), 0);
    Ok(())
}
