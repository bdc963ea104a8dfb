//! Plain HTTP(S) downloads with per-file pinned hashes.
//!
//! The revision is a digest of the (url, hash) list, so editing either
//! produces a new snapshot while re-running the same list reuses the old one.

use super::{
    config_mismatch, FetchContext, FileManifest, ManifestEntry, ResolvedRevision, SourceAdapter,
    SourceConfig, SourceKind, UrlSource,
};
use crate::credentials::CredentialScope;
use crate::error::{FetchError, Result};
use crate::network::stream_download;
use crate::store::{ContentHash, HashAlgorithm};
use async_trait::async_trait;
use std::path::Path;

const URL_TOKEN_ENV: &str = "URL_BEARER_TOKEN";

#[derive(Debug, Default)]
pub struct UrlAdapter;

impl UrlAdapter {
    pub fn new() -> Self {
        Self
    }
}

fn url_config(config: &SourceConfig) -> Result<&UrlSource> {
    match config {
        SourceConfig::Url(c) => Ok(c),
        other => Err(config_mismatch(SourceKind::Url, other)),
    }
}

/// Digest of the pinned list; order-sensitive like the list itself.
fn list_digest(config: &UrlSource) -> String {
    let mut hasher = HashAlgorithm::Sha256.hasher();
    for file in &config.urls {
        hasher.update(file.url.as_bytes());
        hasher.update(b"\0");
        hasher.update(file.hash.as_bytes());
        hasher.update(b"\n");
    }
    hasher.finalize_hex()[..40].to_string()
}

#[async_trait]
impl SourceAdapter for UrlAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Url
    }

    fn credential_scope(&self) -> CredentialScope {
        CredentialScope {
            bearer_env: vec![URL_TOKEN_ENV],
            remediation: "set URL_BEARER_TOKEN (or auth.tokenEnv) to a token the server accepts",
            ..Default::default()
        }
    }

    async fn resolve_revision(
        &self,
        config: &SourceConfig,
        _ctx: &FetchContext,
    ) -> Result<ResolvedRevision> {
        let cfg = url_config(config)?;
        Ok(ResolvedRevision::new(list_digest(cfg), "pinned"))
    }

    async fn list_files(
        &self,
        config: &SourceConfig,
        _revision: &ResolvedRevision,
        _ctx: &FetchContext,
    ) -> Result<FileManifest> {
        let cfg = url_config(config)?;
        let entries = cfg
            .urls
            .iter()
            .map(|file| -> Result<ManifestEntry> {
                let path = file.file_name().ok_or_else(|| {
                    FetchError::config(format!(
                        "source.url: cannot derive a file name from '{}'",
                        file.url
                    ))
                })?;
                let digest: ContentHash = file.hash.parse()?;
                Ok(ManifestEntry {
                    path,
                    locator: file.url.clone(),
                    size: None,
                    digest: Some(digest),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        if entries.is_empty() {
            return Err(FetchError::EmptyResult {
                source_kind: self.kind().to_string(),
                target: "urls".to_string(),
                reason: crate::error::EmptyReason::SourceEmpty,
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
