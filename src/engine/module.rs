// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Kernel modules: builtin tables and staged native shared objects.

use super::KernelFn;
use crate::error::{OffloadError, Result};
use std::collections::HashMap;
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempPath;

/// A named table of kernels compiled into the process.
///
/// ```rust
/// use offload_core::engine::KernelModule;
/// use std::ffi::c_void;
///
/// unsafe extern "C" fn noop(_: i64, _: *const i64, _: *const i64, _: *const *mut c_void, _: *const i64) {}
///
/// let module = KernelModule::new("libnoop.so").with_kernel("noop", noop);
/// assert!(module.get("noop").is_some());
/// ```
#[derive(Clone)]
pub struct KernelModule {
    name: String,
    kernels: HashMap<String, KernelFn>,
}

impl KernelModule {
    /// Create an empty module.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kernels: HashMap::new(),
        }
    }

    /// Add a kernel under `symbol`.
    #[must_use]
    pub fn with_kernel(mut self, symbol: impl Into<String>, kernel: KernelFn) -> Self {
        self.kernels.insert(symbol.into(), kernel);
        self
    }

    /// Module name as used by library lookup.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kernel exported under `symbol`.
    #[must_use]
    pub fn get(&self, symbol: &str) -> Option<KernelFn> {
        self.kernels.get(symbol).copied()
    }

    /// Exported symbol names.
    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.kernels.keys().map(String::as_str)
    }
}

impl fmt::Debug for KernelModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelModule")
            .field("name", &self.name)
            .field("kernels", &self.kernels.len())
            .finish()
    }
}

/// A shared object copied to a private temporary file and opened from there,
/// so each load gets its own image.
pub(crate) struct NativeModule {
    // Declared first: the library is closed before the staged file is removed.
    library: libloading::Library,
    staged: TempPath,
}

impl NativeModule {
    pub(crate) fn stage(path: &Path) -> Result<Self> {
        let mut staged = tempfile::Builder::new()
            .prefix("offload-lib-")
            .suffix(".so")
            .tempfile()?;
        let mut source = std::fs::File::open(path)?;
        std::io::copy(&mut source, staged.as_file_mut())?;
        let staged = staged.into_temp_path();

        // SAFETY: loading runs the module's initialisers; modules on the
        // search path are trusted kernel libraries.
        let library = unsafe { libloading::Library::new(&*staged) }.map_err(|err| {
            OffloadError::engine(format!("cannot open '{}': {err}", path.display()))
        })?;
        tracing::debug!(
            source = %path.display(),
            staged = %staged.display(),
            "staged native module"
        );
        Ok(Self { library, staged })
    }

    pub(crate) fn get(&self, symbol: &str) -> Option<KernelFn> {
        // SAFETY: exported kernels follow the `KernelFn` calling convention.
        unsafe { self.library.get::<KernelFn>(symbol.as_bytes()) }
            .ok()
            .map(|sym| *sym)
    }

}

/// A module as held by the engine and by queued invocations of its kernels.
///
/// Queued work keeps the module alive, so a native image stays mapped until
/// every kernel call enqueued from it has returned.
pub(crate) enum LoadedModule {
    Builtin(Arc<KernelModule>),
    Native(NativeModule),
}

impl LoadedModule {
    pub(crate) fn get(&self, symbol: &str) -> Option<KernelFn> {
        match self {
            Self::Builtin(module) => module.get(symbol),
            Self::Native(module) => module.get(symbol),
        }
    }
}

impl Drop for NativeModule {
    fn drop(&mut self) {
        tracing::trace!(staged = %self.staged.display(), "removing staged module");
    }
}

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const MACHO_MAGICS: [[u8; 4]; 5] = [
    [0xfe, 0xed, 0xfa, 0xce],
    [0xfe, 0xed, 0xfa, 0xcf],
    [0xce, 0xfa, 0xed, 0xfe],
    [0xcf, 0xfa, 0xed, 0xfe],
    [0xca, 0xfe, 0xba, 0xbe],
];

/// ELF `e_machine` of the host architecture, if known.
fn host_elf_machine() -> Option<u16> {
    if cfg!(target_arch = "x86_64") {
        Some(62)
    } else if cfg!(target_arch = "aarch64") {
        Some(183)
    } else if cfg!(target_arch = "x86") {
        Some(3)
    } else if cfg!(target_arch = "arm") {
        Some(40)
    } else if cfg!(target_arch = "riscv64") {
        Some(243)
    } else {
        None
    }
}

/// Check a module header against the host's binary format and architecture.
///
/// ELF objects must match the host `e_machine`; Mach-O and PE images are
/// accepted on their native platforms.
#[must_use]
pub fn accepts_module_header(header: &[u8]) -> bool {
    if header.len() >= 20 && header[..4] == ELF_MAGIC {
        if cfg!(any(target_os = "macos", windows)) {
            return false;
        }
        let raw = [header[18], header[19]];
        let machine = match header[5] {
            1 => u16::from_le_bytes(raw),
            2 => u16::from_be_bytes(raw),
            _ => return false,
        };
        return host_elf_machine().map_or(true, |host| host == machine);
    }
    if header.len() >= 4 && MACHO_MAGICS.iter().any(|magic| header[..4] == *magic) {
        return cfg!(target_os = "macos");
    }
    if header.len() >= 2 && header[..2] == *b"MZ" {
        return cfg!(windows);
    }
    false
}

/// Read the header of `path` and check it with [`accepts_module_header`].
pub(crate) fn accepts_module_file(path: &Path) -> bool {
    let mut header = [0u8; 20];
    let Ok(file) = std::fs::File::open(path) else {
        return false;
    };
    let mut read = 0;
    let mut take = file.take(header.len() as u64);
    while read < header.len() {
        match take.read(&mut header[read..]) {
            Ok(0) | Err(_) => break,
            Ok(n) => read += n,
        }
    }
    accepts_module_header(&header[..read])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn elf_header(machine: u16) -> Vec<u8> {
        let mut header = vec![0u8; 64];
        header[..4].copy_from_slice(&ELF_MAGIC);
        header[4] = 2;
        header[5] = 1;
        header[18..20].copy_from_slice(&machine.to_le_bytes());
        header
    }

    #[test]
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    fn test_elf_architecture_check() {
        assert!(accepts_module_header(&elf_header(62)));
        // Intel MIC (k1om) objects are not loadable on the host.
        assert!(!accepts_module_header(&elf_header(181)));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(!accepts_module_header(b"not a library at all"));
        assert!(!accepts_module_header(&[]));
        assert!(!accepts_module_header(&ELF_MAGIC));
    }

    #[test]
    fn test_header_from_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"#!/bin/sh\necho hi\n").unwrap();
        assert!(!accepts_module_file(file.path()));
        assert!(!accepts_module_file(Path::new("/nonexistent/libnothing.so")));
    }

    #[test]
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    fn test_elf_file_accepted() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), elf_header(62)).unwrap();
        assert!(accepts_module_file(file.path()));
    }

    #[test]
    fn test_kernel_module_table() {
        unsafe extern "C" fn k(
            _: i64,
            _: *const i64,
            _: *const i64,
            _: *const *mut std::ffi::c_void,
            _: *const i64,
        ) {
        }
        let module = KernelModule::new("libk.so").with_kernel("k", k);
        assert_eq!(module.name(), "libk.so");
        assert!(module.get("k").is_some());
        assert!(module.get("missing").is_none());
        assert_eq!(module.symbols().collect::<Vec<_>>(), vec!["k"]);
    }
}
