//! Deterministic in-memory source for tests.
//!
//! Files and revision ids are pure functions of the config, so two fetches
//! of the same mock spec always produce the same tree hash.

use super::{
    config_mismatch, filter_entries, is_commit_id, FetchContext, FileManifest, ManifestEntry,
    MockSource, ResolvedRevision, SourceAdapter, SourceConfig, SourceKind,
};
use crate::config::PathsConfig;
use crate::credentials::CredentialScope;
use crate::error::{AuthFailure, FetchError, Result};
use crate::store::{ContentHash, HashAlgorithm};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub const MOCK_TOKEN_ENV: &str = "MOCK_SOURCE_TOKEN";

/// Contents of the default mock tree.
pub fn default_files() -> BTreeMap<String, Vec<u8>> {
    let mut files = BTreeMap::new();
    files.insert(
        "config.json".to_string(),
        br#"{"architectures":["MockModel"],"model_type":"mock","hidden_size":8}"#.to_vec(),
    );
    files.insert("model.safetensors".to_string(), mock_safetensors());
    files
}

/// A minimal safetensors file: header length, JSON header, 8 data bytes.
fn mock_safetensors() -> Vec<u8> {
    let header = br#"{"weight":{"dtype":"F32","shape":[2],"data_offsets":[0,8]}}"#;
    let mut bytes = (header.len() as u64).to_le_bytes().to_vec();
    bytes.extend_from_slice(header);
    bytes.extend_from_slice(&[0, 0, 128, 63, 0, 0, 0, 64]);
    bytes
}

fn files_of(config: &MockSource) -> BTreeMap<String, Vec<u8>> {
    match &config.files {
        Some(files) => files
            .iter()
            .map(|(path, contents)| (path.clone(), contents.as_bytes().to_vec()))
            .collect(),
        None => default_files(),
    }
}

/// Mock adapter. Counts downloads so tests can assert cache reuse.
#[derive(Debug, Default)]
pub struct MockAdapter {
    downloads: AtomicUsize,
    /// Contents by sha256 hex, filled during listing.
    served: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `download_file` calls so far.
    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    fn check_auth(&self, config: &MockSource, ctx: &FetchContext) -> Result<()> {
        if config.require_auth && ctx.credentials.credential.is_none() {
            return Err(ctx.credentials.auth_error(
                SourceKind::Mock,
                AuthFailure::Missing,
                "mock source requires a token",
            ));
        }
        Ok(())
    }
}

fn mock_config(config: &SourceConfig) -> Result<&MockSource> {
    match config {
        SourceConfig::Mock(c) => Ok(c),
        other => Err(config_mismatch(SourceKind::Mock, other)),
    }
}

#[async_trait]
impl SourceAdapter for MockAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Mock
    }

    fn credential_scope(&self) -> CredentialScope {
        CredentialScope {
            bearer_env: vec![MOCK_TOKEN_ENV],
            remediation: "export MOCK_SOURCE_TOKEN=<any value> to satisfy requireAuth",
            ..Default::default()
        }
    }

    async fn resolve_revision(
        &self,
        config: &SourceConfig,
        ctx: &FetchContext,
    ) -> Result<ResolvedRevision> {
        let config = mock_config(config)?;
        self.check_auth(config, ctx)?;

        let requested = config
            .revision
            .clone()
            .unwrap_or_else(|| PathsConfig::DEFAULT_REF.to_string());
        if is_commit_id(&requested) {
            return Ok(ResolvedRevision::new(requested.clone(), requested));
        }

        // Derive a commit-like id from the requested name and contents.
        let mut hasher = HashAlgorithm::Sha256.hasher();
        hasher.update(requested.as_bytes());
        for (path, contents) in files_of(config) {
            hasher.update(path.as_bytes());
            hasher.update(&[0]);
            hasher.update(&contents);
        }
        let id = hasher.finalize_hex()[..40].to_string();
        Ok(ResolvedRevision::new(id, requested))
    }

    async fn list_files(
        &self,
        config: &SourceConfig,
        revision: &ResolvedRevision,
        ctx: &FetchContext,
    ) -> Result<FileManifest> {
        let config = mock_config(config)?;
        self.check_auth(config, ctx)?;

        let files = files_of(config);
        let mut served = self
            .served
            .lock()
            .map_err(|_| FetchError::Other("mock adapter state poisoned".into()))?;

        let entries = files
            .into_iter()
            .map(|(path, contents)| {
                // Keyed by content so one revision name can serve different trees.
                let locator = HashAlgorithm::Sha256.digest_hex(&contents);
                let entry = ManifestEntry {
                    path,
                    locator: locator.clone(),
                    size: Some(contents.len() as u64),
                    digest: Some(ContentHash::new(HashAlgorithm::Sha256, locator.clone())),
                };
                served.entry(locator).or_insert(contents);
                entry
            })
            .collect();

        Ok(FileManifest::new(filter_entries(
            SourceKind::Mock,
            &revision.id,
            entries,
            None,
        )?))
    }

    async fn download_file(
        &self,
        entry: &ManifestEntry,
        destination: &Path,
        ctx: &FetchContext,
    ) -> Result<u64> {
        ctx.cancel.check()?;
        self.downloads.fetch_add(1, Ordering::SeqCst);

        let contents = self
            .served
            .lock()
            .map_err(|_| FetchError::Other("mock adapter state poisoned".into()))?
            .get(&entry.locator)
            .cloned()
            .ok_or_else(|| FetchError::Network {
                message: format!("mock file {} was never listed", entry.locator),
                status: Some(404),
                cause: None,
            })?;

        tokio::fs::write(destination, &contents)
            .await
            .map_err(|e| FetchError::io_with_path(e, destination))?;
        ctx.progress.record(contents.len() as u64);
        Ok(contents.len() as u64)
    }
}
