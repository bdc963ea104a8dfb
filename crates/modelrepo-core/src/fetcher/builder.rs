//! Builder for configuring a [`Fetcher`].

use super::Fetcher;
use crate::config::NetworkConfig;
use crate::credentials::CredentialResolver;
use crate::error::Result;
use crate::sources::{SourceAdapter, SourceRegistry};
use crate::store::{ContentStore, HashAlgorithm};
use crate::validation::Validator;
use std::path::PathBuf;
use std::sync::Arc;

/// Builder for configuring a [`Fetcher`].
///
/// # Example
///
/// ```rust,ignore
/// use modelrepo_core::{Fetcher, HashAlgorithm};
///
/// let fetcher = Fetcher::builder("/var/cache/models")
///     .algorithm(HashAlgorithm::Sha256)
///     .hf_endpoint("https://hf-mirror.example.com")
///     .build()?;
/// ```
pub struct FetcherBuilder {
    store_root: PathBuf,
    algorithm: HashAlgorithm,
    hf_endpoint: String,
    ollama_registry: String,
    adapters: Vec<Arc<dyn SourceAdapter>>,
    validators: Vec<Validator>,
    resolver: Option<CredentialResolver>,
}

impl FetcherBuilder {
    /// Create a builder for a store rooted at `store_root`.
    ///
    /// The HuggingFace endpoint defaults to `$HF_ENDPOINT`, falling back to
    /// the public hub.
    pub fn new(store_root: impl Into<PathBuf>) -> Self {
        let hf_endpoint = std::env::var(NetworkConfig::HF_ENDPOINT_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| NetworkConfig::HF_ENDPOINT.to_string());
        Self {
            store_root: store_root.into(),
            algorithm: HashAlgorithm::default(),
            hf_endpoint,
            ollama_registry: NetworkConfig::OLLAMA_REGISTRY.to_string(),
            adapters: Vec::new(),
            validators: Vec::new(),
            resolver: None,
        }
    }

    /// Hash algorithm for blobs and tree hashes. Fixed for the store's
    /// lifetime; mixing algorithms in one store is not supported.
    ///
    /// Default: sha256
    pub fn algorithm(mut self, algorithm: HashAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn hf_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.hf_endpoint = endpoint.into();
        self
    }

    pub fn ollama_registry(mut self, registry: impl Into<String>) -> Self {
        self.ollama_registry = registry.into();
        self
    }

    /// Register an adapter, replacing the built-in one of the same kind.
    pub fn with_adapter(mut self, adapter: Arc<dyn SourceAdapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    /// Add a validator that runs after the model spec's validators on every fetch.
    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validators.push(validator);
        self
    }

    /// Replace the environment-backed credential resolver.
    pub fn with_credential_resolver(mut self, resolver: CredentialResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Open the store and assemble the fetcher.
    pub fn build(self) -> Result<Fetcher> {
        let store = ContentStore::open(self.store_root, self.algorithm)?;

        let mut registry = SourceRegistry::with_defaults(&self.hf_endpoint, &self.ollama_registry);
        for adapter in self.adapters {
            registry.register(adapter);
        }

        Ok(Fetcher {
            store,
            registry,
            resolver: self.resolver.unwrap_or_default(),
            validators: self.validators,
        })
    }
}
