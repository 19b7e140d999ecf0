// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Kernel libraries and kernel handles.
//!
//! [`locate`] resolves a library name to a module the engine can load:
//! builtin modules first, then an explicit path, then each directory of the
//! colon-separated search path. Candidates whose binary header does not match
//! the host architecture are skipped.
//!
//! A [`Library`] is loaded on exactly one device and unloaded when its last
//! handle (including handles held by [`Kernel`]s) is dropped. Resolved kernel
//! entry points are cached per library and never invalidated.

use crate::device::{Context, DeviceId};
use crate::engine::{Engine, KernelFn, ModuleHandle, ModuleSource};
use crate::error::{OffloadError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Find a loadable module named `name`.
///
/// ## Errors
///
/// Returns [`OffloadError::LibraryNotFound`] when neither a builtin module nor
/// an architecture-valid file of that name exists.
pub fn locate(engine: &dyn Engine, name: &str, search_path: &str) -> Result<ModuleSource> {
    if engine.has_builtin_module(name) {
        tracing::trace!(name, "using builtin module");
        return Ok(ModuleSource::Builtin(name.to_string()));
    }

    let direct = Path::new(name);
    if direct.components().count() > 1 && direct.is_file() && engine.accepts_module(direct) {
        return Ok(ModuleSource::File(direct.to_path_buf()));
    }

    for dir in search_path.split(':').filter(|dir| !dir.is_empty()) {
        let candidate = Path::new(dir).join(name);
        tracing::trace!(candidate = %candidate.display(), "looking for library");
        if !candidate.is_file() {
            continue;
        }
        if engine.accepts_module(&candidate) {
            return Ok(ModuleSource::File(candidate));
        }
        tracing::trace!(
            candidate = %candidate.display(),
            "skipping library built for another architecture"
        );
    }

    Err(OffloadError::LibraryNotFound {
        name: name.to_string(),
        search_path: search_path.to_string(),
    })
}

struct LibraryInner {
    engine: Arc<dyn Engine>,
    device: DeviceId,
    name: String,
    source: ModuleSource,
    handle: ModuleHandle,
    cache: Mutex<HashMap<String, KernelFn>>,
}

impl Drop for LibraryInner {
    fn drop(&mut self) {
        tracing::debug!(device = %self.device, library = %self.name, "unloading library");
        if let Err(err) = self.engine.unload_module(self.device, self.handle) {
            tracing::warn!(library = %self.name, "failed to unload library: {err}");
        }
    }
}

/// A module loaded on one device.
#[derive(Clone)]
pub struct Library {
    inner: Arc<LibraryInner>,
}

impl Library {
    pub(crate) fn load(ctx: &Context, device: DeviceId, name: &str) -> Result<Self> {
        let source = locate(ctx.engine.as_ref(), name, &ctx.config.library_path)?;
        let handle = ctx.engine.load_module(device, &source)?;
        tracing::info!(%device, library = name, %source, "loaded library");
        Ok(Self {
            inner: Arc::new(LibraryInner {
                engine: Arc::clone(&ctx.engine),
                device,
                name: name.to_string(),
                source,
                handle,
                cache: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Name the library was requested by.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Device the library is loaded on.
    #[must_use]
    pub fn device(&self) -> DeviceId {
        self.inner.device
    }

    /// Resolved module location.
    #[must_use]
    pub fn source(&self) -> &ModuleSource {
        &self.inner.source
    }

    /// Number of kernels resolved so far.
    #[must_use]
    pub fn cached_kernels(&self) -> usize {
        self.inner.cache.lock().len()
    }

    /// Resolve a kernel by symbol name, consulting the cache first.
    ///
    /// ## Errors
    ///
    /// Returns [`OffloadError::SymbolNotFound`] if the module does not export
    /// `symbol`.
    pub fn kernel(&self, symbol: &str) -> Result<Kernel> {
        let mut cache = self.inner.cache.lock();
        let func = match cache.get(symbol) {
            Some(func) => *func,
            None => {
                let func = self
                    .inner
                    .engine
                    .find_kernel(self.inner.device, self.inner.handle, symbol)?
                    .ok_or_else(|| OffloadError::SymbolNotFound {
                        symbol: symbol.to_string(),
                        library: self.inner.name.clone(),
                    })?;
                tracing::trace!(library = %self.inner.name, symbol, "resolved kernel");
                cache.insert(symbol.to_string(), func);
                func
            }
        };
        Ok(Kernel {
            name: Arc::from(symbol),
            func,
            library: self.clone(),
        })
    }
}

impl fmt::Debug for Library {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Library")
            .field("name", &self.inner.name)
            .field("device", &self.inner.device)
            .field("source", &self.inner.source)
            .finish_non_exhaustive()
    }
}

/// A resolved kernel, invocable on streams of its library's device.
#[derive(Clone)]
pub struct Kernel {
    name: Arc<str>,
    func: KernelFn,
    library: Library,
}

impl Kernel {
    /// Symbol name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Device the kernel's library is loaded on.
    #[must_use]
    pub fn device(&self) -> DeviceId {
        self.library.device()
    }

    /// Library the kernel was resolved from.
    #[must_use]
    pub fn library(&self) -> &Library {
        &self.library
    }

    pub(crate) fn func(&self) -> KernelFn {
        self.func
    }

    pub(crate) fn module(&self) -> ModuleHandle {
        self.library.inner.handle
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("name", &self.name)
            .field("device", &self.device())
            .field("library", &self.library.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OffloadConfig;
    use crate::device::DeviceRegistry;
    use crate::engine::HostEngine;
    use crate::kernels::{symbols, ARRAY_LIBRARY};

    #[test]
    fn test_locate_builtin_first() {
        let engine = HostEngine::new(1);
        let source = locate(&engine, ARRAY_LIBRARY, "/nonexistent").unwrap();
        assert_eq!(source, ModuleSource::Builtin(ARRAY_LIBRARY.to_string()));
    }

    #[test]
    fn test_locate_not_found() {
        let engine = HostEngine::new(1);
        let dir = tempfile::tempdir().unwrap();
        let search_path = format!("{}::/nonexistent", dir.path().display());
        let err = locate(&engine, "libmissing.so", &search_path).unwrap_err();
        match err {
            OffloadError::LibraryNotFound { name, search_path: path } => {
                assert_eq!(name, "libmissing.so");
                assert_eq!(path, search_path);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_locate_skips_foreign_binaries() {
        let engine = HostEngine::new(1);
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("libfake.so"), b"definitely not an object").unwrap();
        let search_path = dir.path().display().to_string();
        assert!(matches!(
            locate(&engine, "libfake.so", &search_path),
            Err(OffloadError::LibraryNotFound { .. })
        ));
    }

    #[test]
    fn test_kernel_cache() {
        let registry =
            DeviceRegistry::new(Arc::new(HostEngine::new(1)), OffloadConfig::default()).unwrap();
        let library = registry.device(0).unwrap().load_library(ARRAY_LIBRARY).unwrap();
        assert_eq!(library.cached_kernels(), 0);

        let first = library.kernel(symbols::FILL).unwrap();
        let second = library.kernel(symbols::FILL).unwrap();
        assert_eq!(library.cached_kernels(), 1);
        assert_eq!(first.func() as usize, second.func() as usize);
        assert_eq!(first.device(), DeviceId::Index(0));

        assert!(matches!(
            library.kernel("offload_array_missing"),
            Err(OffloadError::SymbolNotFound { .. })
        ));
        assert_eq!(library.cached_kernels(), 1);
    }
}
