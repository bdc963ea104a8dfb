//! Ollama registry source (OCI distribution API).
//!
//! A tag resolves to the sha256 of its manifest body. Listing re-fetches the
//! manifest by that digest, so a tag moved between resolution and listing
//! is detected instead of silently mixing two versions.

use super::{
    config_mismatch, FetchContext, FileManifest, ManifestEntry, OllamaSource, ResolvedRevision,
    SourceAdapter, SourceConfig, SourceKind,
};
use crate::credentials::CredentialScope;
use crate::error::{EmptyReason, FetchError, Result};
use crate::network::{send_checked, stream_download};
use crate::store::{ContentHash, HashAlgorithm};
use async_trait::async_trait;
use reqwest::header::ACCEPT;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use tracing::debug;

const DEFAULT_TAG: &str = "latest";
const OLLAMA_TOKEN_ENV: &str = "OLLAMA_REGISTRY_TOKEN";

/// Manifest media types the registry serves.
const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, \
                               application/vnd.oci.image.manifest.v1+json";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    config: Option<Layer>,
    #[serde(default)]
    layers: Vec<Layer>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Layer {
    media_type: String,
    digest: String,
    size: u64,
}

/// Snapshot file name for a layer media type.
fn layer_file_name(media_type: &str) -> String {
    match media_type.rsplit('.').next().unwrap_or(media_type) {
        "model" => "model.gguf".to_string(),
        "adapter" => "adapter.gguf".to_string(),
        "projector" => "projector.gguf".to_string(),
        "params" => "params.json".to_string(),
        "messages" => "messages.json".to_string(),
        "template" => "template".to_string(),
        "system" => "system".to_string(),
        "license" => "license".to_string(),
        _ if media_type.contains("container.image") || media_type.ends_with("config.v1+json") => {
            "config.json".to_string()
        }
        other => other
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect(),
    }
}

/// `name`, `name-2`, `name-3`, ... until unused.
fn unique_name(name: String, seen: &mut HashSet<String>) -> String {
    if seen.insert(name.clone()) {
        return name;
    }
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) => (stem.to_string(), format!(".{}", ext)),
        None => (name.clone(), String::new()),
    };
    (2..)
        .map(|n| format!("{}-{}{}", stem, n, ext))
        .find(|candidate| seen.insert(candidate.clone()))
        .unwrap_or(name)
}

#[derive(Debug, Clone)]
pub struct OllamaAdapter {
    registry: String,
}

impl OllamaAdapter {
    pub fn new(registry: &str) -> Self {
        Self {
            registry: registry.trim_end_matches('/').to_string(),
        }
    }

    fn manifest_url(&self, repository: &str, reference: &str) -> String {
        format!("{}/v2/{}/manifests/{}", self.registry, repository, reference)
    }

    fn blob_url(&self, repository: &str, digest: &str) -> String {
        format!("{}/v2/{}/blobs/{}", self.registry, repository, digest)
    }

    async fn fetch_manifest(
        &self,
        repository: &str,
        reference: &str,
        ctx: &FetchContext,
    ) -> Result<Vec<u8>> {
        let url = self.manifest_url(repository, reference);
        debug!("Fetching Ollama manifest {}", url);
        let response = send_checked(
            ctx.credentials
                .apply(ctx.clients.api.get(&url).header(ACCEPT, MANIFEST_ACCEPT)),
            self.kind(),
            &ctx.credentials,
            || FetchError::RevisionNotFound {
                source_kind: self.kind().to_string(),
                revision: reference.to_string(),
                hint: format!(
                    "check that '{}' exists in the registry and has tag '{}'",
                    repository, reference
                ),
            },
        )
        .await?;
        Ok(response.bytes().await?.to_vec())
    }
}

fn ollama_config(config: &SourceConfig) -> Result<&OllamaSource> {
    match config {
        SourceConfig::Ollama(c) => Ok(c),
        other => Err(config_mismatch(SourceKind::Ollama, other)),
    }
}

/// `library/<model>` unless a namespace is given.
fn repository(config: &OllamaSource) -> String {
    if config.model.contains('/') {
        config.model.clone()
    } else {
        format!("library/{}", config.model)
    }
}

/// Digest hex when the tag is already a manifest digest.
fn pinned_digest(tag: &str) -> Option<String> {
    let hex = tag.strip_prefix("sha256:").unwrap_or(tag);
    (hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit()))
        .then(|| hex.to_ascii_lowercase())
}

#[async_trait]
impl SourceAdapter for OllamaAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Ollama
    }

    fn credential_scope(&self) -> CredentialScope {
        CredentialScope {
            bearer_env: vec![OLLAMA_TOKEN_ENV],
            remediation: "the public Ollama registry needs no token; for a private registry \
                          set OLLAMA_REGISTRY_TOKEN",
            ..Default::default()
        }
    }

    async fn resolve_revision(
        &self,
        config: &SourceConfig,
        ctx: &FetchContext,
    ) -> Result<ResolvedRevision> {
        let cfg = ollama_config(config)?;
        let tag = cfg.tag.as_deref().unwrap_or(DEFAULT_TAG);
        if let Some(digest) = pinned_digest(tag) {
            return Ok(ResolvedRevision::new(digest, tag));
        }

        let body = self.fetch_manifest(&repository(cfg), tag, ctx).await?;
        Ok(ResolvedRevision::new(
            HashAlgorithm::Sha256.digest_hex(&body),
            tag,
        ))
    }

    async fn list_files(
        &self,
        config: &SourceConfig,
        revision: &ResolvedRevision,
        ctx: &FetchContext,
    ) -> Result<FileManifest> {
        let cfg = ollama_config(config)?;
        let repository = repository(cfg);
        let body = self
            .fetch_manifest(&repository, &format!("sha256:{}", revision.id), ctx)
            .await?;

        let actual = HashAlgorithm::Sha256.digest_hex(&body);
        if actual != revision.id {
            return Err(FetchError::HashMismatch {
                name: format!("{} manifest", repository),
                expected: format!("sha256:{}", revision.id),
                actual: format!("sha256:{}", actual),
            });
        }
        let manifest: Manifest = serde_json::from_slice(&body)?;

        let mut seen = HashSet::new();
        let entries = manifest
            .layers
            .iter()
            .chain(manifest.config.as_ref())
            .map(|layer| -> Result<ManifestEntry> {
                let digest: ContentHash = layer.digest.parse()?;
                Ok(ManifestEntry {
                    path: unique_name(layer_file_name(&layer.media_type), &mut seen),
                    locator: self.blob_url(&repository, &layer.digest),
                    size: Some(layer.size),
                    digest: Some(digest),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        if entries.is_empty() {
            return Err(FetchError::EmptyResult {
                source_kind: self.kind().to_string(),
                target: repository,
                reason: EmptyReason::SourceEmpty,
            });
        }
        Ok(FileManifest::new(entries))
    }

    async fn download_file(
        &self,
        entry: &ManifestEntry,
        destination: &Path,
        ctx: &FetchContext,
    ) -> Result<u64> {
        stream_download(ctx, self.kind(), &entry.locator, destination, entry.size).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_file_names() {
        assert_eq!(layer_file_name("application/vnd.ollama.image.model"), "model.gguf");
        assert_eq!(layer_file_name("application/vnd.ollama.image.params"), "params.json");
        assert_eq!(layer_file_name("application/vnd.ollama.image.template"), "template");
        assert_eq!(
            layer_file_name("application/vnd.docker.container.image.v1+json"),
            "config.json"
        );
    }

    #[test]
    fn test_duplicate_names_get_suffixes() {
        let mut seen = HashSet::new();
        assert_eq!(unique_name("license".into(), &mut seen), "license");
        assert_eq!(unique_name("license".into(), &mut seen), "license-2");
        assert_eq!(unique_name("model.gguf".into(), &mut seen), "model.gguf");
        assert_eq!(unique_name("model.gguf".into(), &mut seen), "model-2.gguf");
    }

    #[test]
    fn test_repository_defaults_to_library() {
        let config = OllamaSource {
            model: "llama3".into(),
            tag: None,
        };
        assert_eq!(repository(&config), "library/llama3");
        let config = OllamaSource {
            model: "someone/custom".into(),
            tag: None,
        };
        assert_eq!(repository(&config), "someone/custom");
    }

    #[test]
    fn test_pinned_digest_tags() {
        let hex = "ab".repeat(32);
        assert_eq!(pinned_digest(&format!("sha256:{}", hex)), Some(hex.clone()));
        assert_eq!(pinned_digest(&hex), Some(hex));
        assert_eq!(pinned_digest("latest"), None);
    }
}
