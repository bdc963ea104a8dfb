//! Source selection and adapter dispatch.

use super::{
    GitLfsSource, GitXetSource, HuggingFaceSource, MlflowSource, MockSource, OllamaSource,
    S3Source, SourceAdapter, SourceConfig, SourceKind, UrlSource,
};
use super::{GitAdapter, HuggingFaceAdapter, MlflowAdapter, MockAdapter, OllamaAdapter, S3Adapter, UrlAdapter};
use crate::error::{FetchError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// The `source` block of a model spec: one optional slot per kind.
///
/// Exactly one slot must be populated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SourceSelection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub huggingface: Option<HuggingFaceSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mlflow: Option<MlflowSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3Source>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_lfs: Option<GitLfsSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_xet: Option<GitXetSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<UrlSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ollama: Option<OllamaSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mock: Option<MockSource>,
}

impl SourceSelection {
    /// All populated slots, in declaration order.
    pub fn populated(&self) -> Vec<SourceConfig> {
        let mut configs = Vec::new();
        if let Some(c) = &self.huggingface {
            configs.push(SourceConfig::HuggingFace(c.clone()));
        }
        if let Some(c) = &self.mlflow {
            configs.push(SourceConfig::Mlflow(c.clone()));
        }
        if let Some(c) = &self.s3 {
            configs.push(SourceConfig::S3(c.clone()));
        }
        if let Some(c) = &self.git_lfs {
            configs.push(SourceConfig::GitLfs(c.clone()));
        }
        if let Some(c) = &self.git_xet {
            configs.push(SourceConfig::GitXet(c.clone()));
        }
        if let Some(c) = &self.url {
            configs.push(SourceConfig::Url(c.clone()));
        }
        if let Some(c) = &self.ollama {
            configs.push(SourceConfig::Ollama(c.clone()));
        }
        if let Some(c) = &self.mock {
            configs.push(SourceConfig::Mock(c.clone()));
        }
        configs
    }

    /// The single selected source.
    pub fn to_config(&self) -> Result<SourceConfig> {
        let mut configs = self.populated();
        match configs.len() {
            0 => Err(FetchError::config(format!(
                "source: no source specified; set exactly one of {}",
                SourceKind::ALL
                    .iter()
                    .map(|k| k.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
            1 => Ok(configs.remove(0)),
            _ => Err(FetchError::config(format!(
                "source: exactly one source may be specified, found {}",
                configs
                    .iter()
                    .map(|c| c.kind().as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }
}

/// Adapter table keyed by source kind.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    adapters: HashMap<SourceKind, Arc<dyn SourceAdapter>>,
}

impl std::fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.adapters.keys().collect();
        kinds.sort();
        f.debug_struct("SourceRegistry").field("kinds", &kinds).finish()
    }
}

impl SourceRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// One adapter per kind, talking to the given endpoints.
    pub fn with_defaults(hf_endpoint: &str, ollama_registry: &str) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(HuggingFaceAdapter::new(hf_endpoint)));
        registry.register(Arc::new(MlflowAdapter::new()));
        registry.register(Arc::new(S3Adapter::new()));
        registry.register(Arc::new(GitAdapter::lfs()));
        registry.register(Arc::new(GitAdapter::xet()));
        registry.register(Arc::new(UrlAdapter::new()));
        registry.register(Arc::new(OllamaAdapter::new(ollama_registry)));
        registry.register(Arc::new(MockAdapter::new()));
        registry
    }

    /// Add an adapter, replacing any existing one of the same kind.
    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) {
        debug!("Registering {} source adapter", adapter.kind());
        self.adapters.insert(adapter.kind(), adapter);
    }

    pub fn adapter(&self, kind: SourceKind) -> Result<Arc<dyn SourceAdapter>> {
        self.adapters
            .get(&kind)
            .cloned()
            .ok_or_else(|| FetchError::config(format!("source: no adapter registered for {}", kind)))
    }

    /// Pick the adapter for a selection. Pure lookup, no I/O.
    pub fn dispatch(
        &self,
        selection: &SourceSelection,
    ) -> Result<(Arc<dyn SourceAdapter>, SourceConfig)> {
        let config = selection.to_config()?;
        let adapter = self.adapter(config.kind())?;
        Ok((adapter, config))
    }
}
