// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Device enumeration and device handles.
//!
//! A [`DeviceRegistry`] is built once from an engine and a configuration. It
//! queries the engine's device count a single time and creates one [`Device`]
//! per index plus the wildcard [`DeviceId::Any`] device. Each device owns a
//! default [`Stream`] created with it.
//!
//! An engine reporting zero devices still yields a valid registry; only the
//! `Any` device exists and it has no default stream.
//!
//! ## Example
//!
//! ```rust
//! use offload_core::{DeviceRegistry, HostEngine, OffloadConfig};
//! use std::sync::Arc;
//!
//! let registry = DeviceRegistry::new(Arc::new(HostEngine::new(2)), OffloadConfig::default())?;
//! assert_eq!(registry.number_of_devices(), 2);
//!
//! let device = registry.device(1)?;
//! let stream = device.create_stream()?;
//! stream.sync()?;
//! # Ok::<(), offload_core::OffloadError>(())
//! ```

use crate::config::{OffloadConfig, ValidatableConfig};
use crate::engine::{Engine, HostEngine, MemoryInfo};
use crate::error::{OffloadError, Result};
use crate::library::Library;
use crate::stream::Stream;
use crate::trace::Tracer;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Logical device identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceId {
    /// Unspecified device; the engine picks its default.
    Any,
    /// Device by index.
    Index(usize),
}

impl DeviceId {
    /// Index of the device that serves this id; `Any` maps to device 0.
    #[must_use]
    pub fn index_or_default(self) -> usize {
        match self {
            Self::Any => 0,
            Self::Index(index) => index,
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("device(any)"),
            Self::Index(index) => write!(f, "device({index})"),
        }
    }
}

/// State shared by every object created from one registry.
pub(crate) struct Context {
    pub(crate) engine: Arc<dyn Engine>,
    pub(crate) config: OffloadConfig,
    pub(crate) tracer: Tracer,
    /// Builtin array kernel library, loaded on first use per device.
    pub(crate) array_kernels: Mutex<HashMap<DeviceId, Library>>,
}

impl Context {
    fn new(engine: Arc<dyn Engine>, config: OffloadConfig) -> Self {
        Self {
            engine,
            tracer: Tracer::from_config(&config),
            config,
            array_kernels: Mutex::new(HashMap::new()),
        }
    }
}

struct DeviceInner {
    ctx: Arc<Context>,
    id: DeviceId,
    next_stream: AtomicU64,
    default_stream: Option<Stream>,
}

/// Handle to one device (or the `Any` device).
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    fn new(ctx: &Arc<Context>, id: DeviceId, with_default_stream: bool) -> Result<Self> {
        let next_stream = AtomicU64::new(0);
        let default_stream = if with_default_stream {
            let ordinal = next_stream.fetch_add(1, Ordering::Relaxed);
            Some(Stream::create(Arc::clone(ctx), id, ordinal)?)
        } else {
            None
        };
        Ok(Self {
            inner: Arc::new(DeviceInner {
                ctx: Arc::clone(ctx),
                id,
                next_stream,
                default_stream,
            }),
        })
    }

    /// Identifier of this device.
    #[must_use]
    pub fn id(&self) -> DeviceId {
        self.inner.id
    }

    /// Whether this is the wildcard device.
    #[must_use]
    pub fn is_any(&self) -> bool {
        self.inner.id == DeviceId::Any
    }

    /// The stream created together with the device.
    ///
    /// ## Errors
    ///
    /// Returns [`OffloadError::DeviceNotAvailable`] for the `Any` device of an
    /// engine without devices.
    pub fn default_stream(&self) -> Result<&Stream> {
        self.inner.default_stream.as_ref().ok_or_else(|| {
            OffloadError::device_not_available(format!("{} has no default stream", self.inner.id))
        })
    }

    /// Create an additional stream on this device.
    ///
    /// ## Errors
    ///
    /// Fails if the engine cannot create the stream.
    pub fn create_stream(&self) -> Result<Stream> {
        let ordinal = self.inner.next_stream.fetch_add(1, Ordering::Relaxed);
        Stream::create(Arc::clone(&self.inner.ctx), self.inner.id, ordinal)
    }

    /// Load a kernel library found on the configured search path.
    ///
    /// ## Errors
    ///
    /// Returns [`OffloadError::LibraryNotFound`] if no loadable module named
    /// `name` exists.
    #[track_caller]
    pub fn load_library(&self, name: &str) -> Result<Library> {
        let _trace = self
            .inner
            .ctx
            .tracer
            .start("load_library", || format!("device={} name={name}", self.inner.id));
        Library::load(&self.inner.ctx, self.inner.id, name)
    }

    /// Load several libraries in order, stopping at the first failure.
    ///
    /// ## Errors
    ///
    /// Propagates the first load failure.
    pub fn load_libraries(&self, names: &[&str]) -> Result<Vec<Library>> {
        names.iter().map(|name| self.load_library(name)).collect()
    }

    /// Memory figures reported by the engine.
    ///
    /// ## Errors
    ///
    /// Fails if the device does not exist in the engine.
    pub fn memory_info(&self) -> Result<MemoryInfo> {
        self.inner.ctx.engine.memory_info(self.inner.id)
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.inner.id)
            .field("default_stream", &self.inner.default_stream.is_some())
            .finish()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner.id, f)
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Device {}

/// Explicitly owned mapping from device ids to devices.
pub struct DeviceRegistry {
    ctx: Arc<Context>,
    devices: Vec<Device>,
    any: Device,
}

impl DeviceRegistry {
    /// Enumerate the devices of `engine`.
    ///
    /// ## Errors
    ///
    /// Fails if the configuration is invalid or a default stream cannot be
    /// created.
    pub fn new(engine: Arc<dyn Engine>, config: OffloadConfig) -> Result<Self> {
        config.validate()?;
        let ctx = Arc::new(Context::new(engine, config));
        let count = ctx.engine.device_count();
        let devices = (0..count)
            .map(|index| Device::new(&ctx, DeviceId::Index(index), true))
            .collect::<Result<Vec<_>>>()?;
        let any = Device::new(&ctx, DeviceId::Any, count > 0)?;
        tracing::info!(devices = count, "device registry ready");
        Ok(Self { ctx, devices, any })
    }

    /// Registry over a [`HostEngine`] configured from the environment.
    ///
    /// ## Errors
    ///
    /// Fails if the environment describes an invalid configuration.
    pub fn from_env() -> Result<Self> {
        let config = OffloadConfig::from_env();
        let engine = HostEngine::from_config(&config);
        Self::new(Arc::new(engine), config)
    }

    /// Number of devices, excluding `Any`.
    #[must_use]
    pub fn number_of_devices(&self) -> usize {
        self.devices.len()
    }

    /// Device by index.
    ///
    /// ## Errors
    ///
    /// Returns [`OffloadError::DeviceNotAvailable`] for an out-of-range index.
    pub fn device(&self, index: usize) -> Result<&Device> {
        self.devices.get(index).ok_or_else(|| {
            OffloadError::device_not_available(format!(
                "{} (registry has {} devices)",
                DeviceId::Index(index),
                self.devices.len()
            ))
        })
    }

    /// Device by identifier, including `Any`.
    ///
    /// ## Errors
    ///
    /// Returns [`OffloadError::DeviceNotAvailable`] for an out-of-range index.
    pub fn get(&self, id: DeviceId) -> Result<&Device> {
        match id {
            DeviceId::Any => Ok(&self.any),
            DeviceId::Index(index) => self.device(index),
        }
    }

    /// The wildcard device.
    #[must_use]
    pub fn any(&self) -> &Device {
        &self.any
    }

    /// Indexed devices in order.
    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter()
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &OffloadConfig {
        &self.ctx.config
    }

    /// Call tracer shared by all devices and streams.
    #[must_use]
    pub fn tracer(&self) -> &Tracer {
        &self.ctx.tracer
    }

    /// Underlying engine.
    #[must_use]
    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.ctx.engine
    }
}

impl fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &self.devices)
            .field("config", &self.ctx.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(devices: usize) -> DeviceRegistry {
        DeviceRegistry::new(Arc::new(HostEngine::new(devices)), OffloadConfig::default()).unwrap()
    }

    #[test]
    fn test_device_id_display() {
        assert_eq!(DeviceId::Any.to_string(), "device(any)");
        assert_eq!(DeviceId::Index(3).to_string(), "device(3)");
        assert_eq!(DeviceId::Any.index_or_default(), 0);
    }

    #[test]
    fn test_registry_enumerates_devices() {
        let registry = registry(3);
        assert_eq!(registry.number_of_devices(), 3);
        assert_eq!(registry.iter().count(), 3);
        assert_eq!(registry.device(2).unwrap().id(), DeviceId::Index(2));
        assert!(registry.any().is_any());
        assert!(matches!(
            registry.device(3),
            Err(OffloadError::DeviceNotAvailable { .. })
        ));
        assert_eq!(registry.get(DeviceId::Any).unwrap(), registry.any());
    }

    #[test]
    fn test_zero_devices_is_valid() {
        let registry = registry(0);
        assert_eq!(registry.number_of_devices(), 0);
        assert!(registry.any().default_stream().is_err());
        assert!(registry.device(0).is_err());
    }

    #[test]
    fn test_stream_ordinals_per_device() {
        let registry = registry(2);
        let device = registry.device(0).unwrap();
        assert_eq!(device.default_stream().unwrap().ordinal(), 0);
        assert_eq!(device.create_stream().unwrap().ordinal(), 1);
        assert_eq!(device.create_stream().unwrap().ordinal(), 2);
        let other = registry.device(1).unwrap();
        assert_eq!(other.create_stream().unwrap().ordinal(), 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = OffloadConfig::new().with_library_path("bad\0path");
        let result = DeviceRegistry::new(Arc::new(HostEngine::new(1)), config);
        assert!(matches!(result, Err(OffloadError::InvalidConfig(_))));
    }

    #[test]
    fn test_memory_info() {
        let registry = DeviceRegistry::new(
            Arc::new(HostEngine::builder().devices(1).device_memory(4096).build()),
            OffloadConfig::default(),
        )
        .unwrap();
        let info = registry.device(0).unwrap().memory_info().unwrap();
        assert_eq!(info.physical, 4096);
        assert_eq!(info.allocatable, 4096);
    }
}
