//! Name → constructor map for adapters.
//!
//! The registry is assembled once through [`AdapterRegistryBuilder`] and is
//! immutable afterwards. A process-wide instance can be installed at startup
//! with [`install_global`]; later reads go through [`global`].

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use serde::Serialize;
use thiserror::Error;

use crate::contract::{AdapterConfig, AdapterInfo, ErpAdapter, SupportedFeatures};
use crate::{memory, mystore, phc, primavera, saft, sage};

/// Builds an adapter instance from its connection settings.
pub type AdapterFactory = Arc<dyn Fn(AdapterConfig) -> Arc<dyn ErpAdapter> + Send + Sync>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("adapter not found: {0}")]
    AdapterNotFound(String),

    #[error("adapter '{0}' registered twice")]
    DuplicateAdapter(String),

    #[error("invalid configuration for adapter '{adapter}': {}", .errors.join("; "))]
    InvalidConfig { adapter: String, errors: Vec<String> },

    #[error("the global adapter registry is already installed")]
    AlreadyInstalled,
}

/// What a registered adapter is and which entity types it syncs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterDescriptor {
    pub name: String,
    pub info: AdapterInfo,
    pub features: SupportedFeatures,
}

#[derive(Default)]
pub struct AdapterRegistryBuilder {
    factories: BTreeMap<String, AdapterFactory>,
    duplicates: Vec<String>,
}

impl AdapterRegistryBuilder {
    pub fn register<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(AdapterConfig) -> Arc<dyn ErpAdapter> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.factories.contains_key(&name) {
            self.duplicates.push(name);
            return self;
        }
        self.factories.insert(name, Arc::new(factory));
        self
    }

    pub fn build(self) -> Result<AdapterRegistry, RegistryError> {
        if let Some(name) = self.duplicates.into_iter().next() {
            return Err(RegistryError::DuplicateAdapter(name));
        }
        Ok(AdapterRegistry {
            factories: self.factories,
        })
    }
}

/// Immutable adapter registry.
#[derive(Clone)]
pub struct AdapterRegistry {
    factories: BTreeMap<String, AdapterFactory>,
}

impl core::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("adapters", &self.list())
            .finish()
    }
}

impl AdapterRegistry {
    pub fn builder() -> AdapterRegistryBuilder {
        AdapterRegistryBuilder::default()
    }

    /// Every connector shipped with the crate.
    pub fn with_defaults() -> Self {
        Self {
            factories: default_builder().factories,
        }
    }

    /// Construct an adapter and check its configuration.
    pub fn create(
        &self,
        name: &str,
        config: AdapterConfig,
    ) -> Result<Arc<dyn ErpAdapter>, RegistryError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| RegistryError::AdapterNotFound(name.to_string()))?;
        let adapter = factory(config);
        let validation = adapter.validate_config();
        if !validation.valid {
            return Err(RegistryError::InvalidConfig {
                adapter: name.to_string(),
                errors: validation.errors,
            });
        }
        Ok(adapter)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// Describe every adapter. Instances are built from an empty
    /// configuration and never connected.
    pub fn describe(&self) -> Vec<AdapterDescriptor> {
        self.factories
            .iter()
            .map(|(name, factory)| {
                let adapter = factory(AdapterConfig::default());
                AdapterDescriptor {
                    name: name.clone(),
                    info: adapter.info(),
                    features: adapter.supported_features(),
                }
            })
            .collect()
    }
}

fn default_builder() -> AdapterRegistryBuilder {
    AdapterRegistry::builder()
        .register(saft::NAME, |c| Arc::new(saft::SaftAdapter::new(c)))
        .register(phc::NAME, |c| Arc::new(phc::adapter(c)))
        .register(primavera::NAME, |c| Arc::new(primavera::adapter(c)))
        .register(sage::NAME, |c| Arc::new(sage::adapter(c)))
        .register(mystore::NAME, |c| Arc::new(mystore::adapter(c)))
        .register(memory::NAME, |c| Arc::new(memory::MemoryAdapter::new(c)))
}

static GLOBAL: OnceLock<AdapterRegistry> = OnceLock::new();

/// Install the process-wide registry. Succeeds once; later calls fail.
pub fn install_global(registry: AdapterRegistry) -> Result<&'static AdapterRegistry, RegistryError> {
    GLOBAL
        .set(registry)
        .map_err(|_| RegistryError::AlreadyInstalled)?;
    GLOBAL.get().ok_or(RegistryError::AlreadyInstalled)
}

/// The process-wide registry; the default connectors when none was installed.
pub fn global() -> &'static AdapterRegistry {
    GLOBAL.get_or_init(AdapterRegistry::with_defaults)
}
