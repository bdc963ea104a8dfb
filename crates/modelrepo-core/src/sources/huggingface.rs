//! HuggingFace Hub source.
//!
//! Uses the public Hub REST API:
//! - `GET /api/models/{repo}/revision/{rev}` resolves a branch or tag to a
//!   commit sha
//! - `GET /api/models/{repo}/tree/{sha}?recursive=true` lists files,
//!   following `Link: <...>; rel="next"` pagination
//! - `GET /{repo}/resolve/{sha}/{path}` downloads a file (LFS files
//!   redirect to the CDN)

use super::{
    config_mismatch, filter_entries, is_commit_id, FetchContext, FileManifest, HuggingFaceSource,
    ManifestEntry, ResolvedRevision, SourceAdapter, SourceConfig, SourceKind,
};
use crate::config::NetworkConfig;
use crate::credentials::{CredentialScope, DefaultCredentialFile, DefaultFileFormat};
use crate::error::{FetchError, Result};
use crate::network::{fetch_json, send_checked, stream_download};
use crate::store::{ContentHash, HashAlgorithm};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, LINK};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;
use url::Url;

/// HuggingFace environment variables for authentication tokens.
const HF_TOKEN_ENV_VARS: [&str; 2] = ["HF_TOKEN", "HUGGING_FACE_HUB_TOKEN"];

#[derive(Debug, Deserialize)]
struct RevisionInfo {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct TreeEntry {
    #[serde(rename = "type")]
    kind: String,
    path: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    lfs: Option<LfsPointer>,
}

#[derive(Debug, Deserialize)]
struct LfsPointer {
    oid: String,
    size: u64,
}

/// Adapter for HuggingFace Hub model repositories.
#[derive(Debug, Clone)]
pub struct HuggingFaceAdapter {
    endpoint: String,
    token_file: Option<PathBuf>,
}

impl HuggingFaceAdapter {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token_file: default_token_file(),
        }
    }

    /// Endpoint from `HF_ENDPOINT`, else huggingface.co.
    pub fn from_env() -> Self {
        Self::new(
            std::env::var(NetworkConfig::HF_ENDPOINT_ENV)
                .unwrap_or_else(|_| NetworkConfig::HF_ENDPOINT.to_string()),
        )
    }

    /// Override the cached-login token file (`None` disables it).
    pub fn with_token_file(mut self, path: Option<PathBuf>) -> Self {
        self.token_file = path;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Endpoint URL with each segment percent-encoded.
    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.endpoint).map_err(|e| {
            FetchError::config(format!("invalid HuggingFace endpoint '{}': {}", self.endpoint, e))
        })?;
        url.path_segments_mut()
            .map_err(|_| {
                FetchError::config(format!(
                    "HuggingFace endpoint '{}' cannot carry a path",
                    self.endpoint
                ))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

/// `$HF_HOME/token`, else `~/.cache/huggingface/token`.
fn default_token_file() -> Option<PathBuf> {
    match std::env::var_os("HF_HOME") {
        Some(home) => Some(PathBuf::from(home).join("token")),
        None => dirs::home_dir().map(|h| h.join(".cache").join("huggingface").join("token")),
    }
}

fn hf_config(config: &SourceConfig) -> Result<&HuggingFaceSource> {
    match config {
        SourceConfig::HuggingFace(c) => Ok(c),
        other => Err(config_mismatch(SourceKind::HuggingFace, other)),
    }
}

/// Target of a `rel="next"` entry in a `Link` header.
fn next_page(headers: &HeaderMap) -> Option<String> {
    let link = headers.get(LINK)?.to_str().ok()?;
    link.split(',').find_map(|part| {
        let (target, params) = part.split_once(';')?;
        params
            .split(';')
            .any(|p| p.trim() == r#"rel="next""#)
            .then(|| {
                target
                    .trim()
                    .trim_start_matches('<')
                    .trim_end_matches('>')
                    .to_string()
            })
    })
}

#[async_trait]
impl SourceAdapter for HuggingFaceAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::HuggingFace
    }

    fn credential_scope(&self) -> CredentialScope {
        CredentialScope {
            bearer_env: HF_TOKEN_ENV_VARS.to_vec(),
            default_file: self.token_file.clone().map(|path| DefaultCredentialFile {
                path,
                format: DefaultFileFormat::Token,
            }),
            remediation: "for gated or private repositories, accept the terms on the model page \
                          and create a read token at https://huggingface.co/settings/tokens",
            ..Default::default()
        }
    }

    async fn resolve_revision(
        &self,
        config: &SourceConfig,
        ctx: &FetchContext,
    ) -> Result<ResolvedRevision> {
        let cfg = hf_config(config)?;
        if is_commit_id(&cfg.revision) {
            return Ok(ResolvedRevision::new(cfg.revision.clone(), cfg.revision.clone()));
        }

        let mut segments = vec!["api", "models"];
        segments.extend(cfg.repo.split('/'));
        segments.extend(["revision", cfg.revision.as_str()]);
        let url = self.url(&segments)?;
        debug!("Resolving {}@{} via {}", cfg.repo, cfg.revision, url);

        let info: RevisionInfo = fetch_json(
            ctx.credentials.apply(ctx.clients.api.get(url)),
            self.kind(),
            &ctx.credentials,
            || FetchError::RevisionNotFound {
                source_kind: self.kind().to_string(),
                revision: cfg.revision.clone(),
                hint: format!(
                    "check that repository '{}' exists and that '{}' is a branch, tag or full commit sha",
                    cfg.repo, cfg.revision
                ),
            },
        )
        .await?;

        Ok(ResolvedRevision::new(info.sha, cfg.revision.clone()))
    }

    async fn list_files(
        &self,
        config: &SourceConfig,
        revision: &ResolvedRevision,
        ctx: &FetchContext,
    ) -> Result<FileManifest> {
        let cfg = hf_config(config)?;

        let mut segments = vec!["api", "models"];
        segments.extend(cfg.repo.split('/'));
        segments.extend(["tree", revision.id.as_str()]);
        let mut first = self.url(&segments)?;
        first.query_pairs_mut().append_pair("recursive", "true");

        let mut entries = Vec::new();
        let mut next = Some(first.to_string());
        while let Some(page_url) = next.take() {
            ctx.cancel.check()?;
            let response = send_checked(
                ctx.credentials.apply(ctx.clients.api.get(&page_url)),
                self.kind(),
                &ctx.credentials,
                || FetchError::RevisionNotFound {
                    source_kind: self.kind().to_string(),
                    revision: revision.id.clone(),
                    hint: format!("commit {} is not in repository '{}'", revision.id, cfg.repo),
                },
            )
            .await?;
            next = next_page(response.headers());
            let body = response.bytes().await?;
            let page: Vec<TreeEntry> = serde_json::from_slice(&body)?;

            for item in page.into_iter().filter(|e| e.kind == "file") {
                let mut file_segments: Vec<&str> = cfg.repo.split('/').collect();
                file_segments.extend(["resolve", revision.id.as_str()]);
                file_segments.extend(item.path.split('/'));
                let locator = self.url(&file_segments)?.to_string();

                let (size, digest) = match item.lfs {
                    Some(lfs) => (
                        Some(lfs.size),
                        Some(ContentHash::new(HashAlgorithm::Sha256, lfs.oid)),
                    ),
                    None => (item.size, None),
                };
                entries.push(ManifestEntry {
                    path: item.path,
                    locator,
                    size,
                    digest,
                });
            }
        }

        debug!("{} lists {} file(s) at {}", cfg.repo, entries.len(), revision.id);
        Ok(FileManifest::new(filter_entries(
            self.kind(),
            &cfg.repo,
            entries,
            cfg.files.as_deref(),
        )?))
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
    use reqwest::header::HeaderValue;

    #[test]
    fn test_next_page_from_link_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            LINK,
            HeaderValue::from_static(
                r#"<https://huggingface.co/api/models/a/b/tree/main?cursor=xyz>; rel="next""#,
            ),
        );
        assert_eq!(
            next_page(&headers).as_deref(),
            Some("https://huggingface.co/api/models/a/b/tree/main?cursor=xyz")
        );

        headers.insert(LINK, HeaderValue::from_static(r#"<https://x/prev>; rel="prev""#));
        assert_eq!(next_page(&headers), None);
    }

    #[test]
    fn test_urls_encode_segments() {
        let adapter = HuggingFaceAdapter::new("https://hf.example/");
        let url = adapter
            .url(&["api", "models", "org", "demo", "revision", "refs/pr/1"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://hf.example/api/models/org/demo/revision/refs%2Fpr%2F1"
        );
    }

    #[test]
    fn test_scope_names_hf_variables() {
        let adapter = HuggingFaceAdapter::new("https://hf.example").with_token_file(None);
        let scope = adapter.credential_scope();
        assert_eq!(scope.bearer_env, vec!["HF_TOKEN", "HUGGING_FACE_HUB_TOKEN"]);
        assert!(scope.default_file.is_none());
    }

    #[tokio::test]
    async fn test_commit_sha_resolves_without_network() {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = crate::sources::test_context(dir.path());
        let sha = "0123456789abcdef0123456789abcdef01234567";
        // Unroutable endpoint: any request would fail.
        let adapter = HuggingFaceAdapter::new("http://127.0.0.1:9");
        let config = SourceConfig::HuggingFace(HuggingFaceSource {
            repo: "org/demo".into(),
            revision: sha.into(),
            files: None,
        });
        let revision = adapter.resolve_revision(&config, &ctx).await.unwrap();
        assert_eq!(revision.id, sha);
    }
}
