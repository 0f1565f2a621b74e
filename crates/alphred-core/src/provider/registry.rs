//! Provider registry -- a named collection of available adapters.
//!
//! Built once at process init and treated as read-only afterwards; the
//! executor resolves providers by the name stored on each run node.

use std::collections::HashMap;

use super::failure::{FailureKind, ProviderError};
use super::trait_def::Provider;

/// A collection of registered [`Provider`] implementations, keyed by name.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Box<dyn Provider>>,
}

impl ProviderRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider adapter.
    ///
    /// The provider is stored under the name returned by
    /// [`Provider::name`]. If a provider with the same name is already
    /// registered, it is replaced and the old one is returned.
    pub fn register(&mut self, provider: impl Provider + 'static) -> Option<Box<dyn Provider>> {
        let name = provider.name().to_string();
        self.providers.insert(name, Box::new(provider))
    }

    /// Look up a provider by name.
    pub fn get(&self, name: &str) -> Option<&dyn Provider> {
        self.providers.get(name).map(|b| b.as_ref())
    }

    /// Resolve a provider by name, failing with a configuration error
    /// when it is not registered.
    pub fn resolve(&self, name: &str) -> Result<&dyn Provider, ProviderError> {
        self.get(name).ok_or_else(|| {
            ProviderError::new(
                FailureKind::InvalidConfig,
                format!("no provider registered under {name:?}"),
            )
        })
    }

    /// List the names of all registered providers.
    pub fn list(&self) -> Vec<&str> {
        self.providers.keys().map(|s| s.as_str()).collect()
    }

    /// Return the number of registered providers.
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Return `true` if no providers are registered.
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}
