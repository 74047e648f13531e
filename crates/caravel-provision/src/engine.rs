//! Shared engine-version cache.
//!
//! Provisioning sessions select an engine implementation by declared
//! version. Loaded engines are shared across concurrently open sessions
//! through a reference-counted cache: acquiring increments, dropping the
//! handle decrements, and an entry is evicted when its count reaches zero.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use caravel_core::config::ProvisioningConfig;
use caravel_core::state::ProvisionedState;
use caravel_resolver::layout::ENGINE_VERSION;
use caravel_util::errors::{CaravelError, CaravelResult};

use crate::runtime::Provisioner;

/// The versioned interface boundary a session talks to.
///
/// Implementations are selected at startup by declared version, never by
/// runtime code loading.
pub trait ProvisioningEngine: Send + Sync {
    fn version(&self) -> &str;

    fn provision(
        &self,
        install_dir: &Path,
        config: &ProvisioningConfig,
    ) -> CaravelResult<ProvisionedState>;
}

impl ProvisioningEngine for Provisioner {
    fn version(&self) -> &str {
        ENGINE_VERSION
    }

    fn provision(
        &self,
        install_dir: &Path,
        config: &ProvisioningConfig,
    ) -> CaravelResult<ProvisionedState> {
        Provisioner::provision(self, install_dir, config)
    }
}

type EngineFactory = Box<dyn Fn() -> CaravelResult<Arc<dyn ProvisioningEngine>> + Send + Sync>;

struct CacheEntry {
    engine: Arc<dyn ProvisioningEngine>,
    refs: usize,
}

#[derive(Default)]
struct CacheInner {
    factories: HashMap<String, EngineFactory>,
    entries: HashMap<String, CacheEntry>,
}

/// Reference-counted cache of loaded engines, keyed by version.
#[derive(Default)]
pub struct EngineCache {
    inner: Mutex<CacheInner>,
}

impl EngineCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register the factory that loads the engine for a version.
    pub fn register<F>(&self, version: impl Into<String>, factory: F)
    where
        F: Fn() -> CaravelResult<Arc<dyn ProvisioningEngine>> + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock().expect("engine cache poisoned");
        inner.factories.insert(version.into(), Box::new(factory));
    }

    /// Acquire a handle on the engine for `version`, loading it on first
    /// use. The handle releases its reference when dropped.
    pub fn acquire(self: &Arc<Self>, version: &str) -> CaravelResult<EngineHandle> {
        let mut inner = self.inner.lock().expect("engine cache poisoned");
        if let Some(entry) = inner.entries.get_mut(version) {
            entry.refs += 1;
            return Ok(EngineHandle {
                cache: Arc::clone(self),
                version: version.to_string(),
                engine: Arc::clone(&entry.engine),
                released: false,
            });
        }
        let factory = inner.factories.get(version).ok_or_else(|| CaravelError::Config {
            message: format!("no engine registered for version `{version}`"),
        })?;
        let engine = factory()?;
        inner.entries.insert(
            version.to_string(),
            CacheEntry {
                engine: Arc::clone(&engine),
                refs: 1,
            },
        );
        Ok(EngineHandle {
            cache: Arc::clone(self),
            version: version.to_string(),
            engine,
            released: false,
        })
    }

    /// Drop one reference on a version's engine, evicting it at zero.
    ///
    /// Releasing a version with no live references is a no-op that is
    /// logged, not an error.
    pub fn release(&self, version: &str) {
        let mut inner = self.inner.lock().expect("engine cache poisoned");
        match inner.entries.get_mut(version) {
            Some(entry) if entry.refs > 1 => entry.refs -= 1,
            Some(_) => {
                inner.entries.remove(version);
                tracing::debug!("evicted engine {version}");
            }
            None => {
                tracing::warn!("release of engine {version} with no live references");
            }
        }
    }

    /// Number of currently loaded engines.
    pub fn loaded(&self) -> usize {
        self.inner.lock().expect("engine cache poisoned").entries.len()
    }
}

/// Scope guard over one acquired engine reference.
pub struct EngineHandle {
    cache: Arc<EngineCache>,
    version: String,
    engine: Arc<dyn ProvisioningEngine>,
    released: bool,
}

impl EngineHandle {
    pub fn engine(&self) -> &Arc<dyn ProvisioningEngine> {
        &self.engine
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Release explicitly instead of at end of scope.
    pub fn release(mut self) {
        self.released = true;
        self.cache.release(&self.version);
    }
}

impl std::ops::Deref for EngineHandle {
    type Target = dyn ProvisioningEngine;

    fn deref(&self) -> &Self::Target {
        self.engine.as_ref()
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        if !self.released {
            self.cache.release(&self.version);
        }
    }
}
