//! Source adapters: where artifacts come from.
//!
//! Every remote kind implements [`SourceAdapter`] with the same three
//! steps: resolve a mutable reference to an immutable revision, list the
//! files of that revision, and download one file. The fetcher drives these
//! steps and never looks inside a [`SourceConfig`] variant itself.

pub(crate) mod command;
pub mod git;
pub mod huggingface;
pub mod mlflow;
pub mod mock;
pub mod ollama;
pub mod registry;
pub mod s3;
pub mod url;

pub use git::GitAdapter;
pub use huggingface::HuggingFaceAdapter;
pub use mlflow::MlflowAdapter;
pub use mock::MockAdapter;
pub use ollama::OllamaAdapter;
pub use registry::{SourceRegistry, SourceSelection};
pub use s3::S3Adapter;
pub use self::url::UrlAdapter;

use crate::cancel::CancellationToken;
use crate::config::PathsConfig;
use crate::credentials::{CredentialScope, ResolvedCredentials};
use crate::error::{EmptyReason, FetchError, Result};
use crate::network::{HttpClients, ProgressCounter, Throttle};
use crate::store::ContentHash;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

static COMMIT_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9a-f]{40}|[0-9a-f]{64})$").unwrap());

/// Discriminant of [`SourceConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SourceKind {
    HuggingFace,
    Mlflow,
    S3,
    GitLfs,
    GitXet,
    Url,
    Ollama,
    Mock,
}

impl SourceKind {
    pub const ALL: [SourceKind; 8] = [
        SourceKind::HuggingFace,
        SourceKind::Mlflow,
        SourceKind::S3,
        SourceKind::GitLfs,
        SourceKind::GitXet,
        SourceKind::Url,
        SourceKind::Ollama,
        SourceKind::Mock,
    ];

    /// Name of the model spec field selecting this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::HuggingFace => "huggingface",
            SourceKind::Mlflow => "mlflow",
            SourceKind::S3 => "s3",
            SourceKind::GitLfs => "gitLfs",
            SourceKind::GitXet => "gitXet",
            SourceKind::Url => "url",
            SourceKind::Ollama => "ollama",
            SourceKind::Mock => "mock",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_revision() -> String {
    PathsConfig::DEFAULT_REF.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HuggingFaceSource {
    /// `org/model`
    pub repo: String,
    #[serde(default = "default_revision")]
    pub revision: String,
    /// Include globs; all files when absent.
    #[serde(default)]
    pub files: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MlflowSource {
    pub tracking_uri: String,
    pub model_name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub stage: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct S3Source {
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GitLfsSource {
    pub url: String,
    #[serde(default = "default_revision")]
    pub rev: String,
    #[serde(default)]
    pub subdir: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GitXetSource {
    pub url: String,
    #[serde(default = "default_revision")]
    pub rev: String,
    /// LFS endpoint of the Xet storage service.
    pub endpoint: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UrlFile {
    pub url: String,
    /// `sha256:<hex>` or bare hex of the file bytes.
    pub hash: String,
    #[serde(default)]
    pub filename: Option<String>,
}

impl UrlFile {
    /// Snapshot path: `filename`, else the last URL path segment.
    pub fn file_name(&self) -> Option<String> {
        if let Some(name) = &self.filename {
            return Some(name.clone());
        }
        ::url::Url::parse(&self.url)
            .ok()?
            .path_segments()?
            .rev()
            .find(|s| !s.is_empty())
            .map(String::from)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UrlSource {
    pub urls: Vec<UrlFile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OllamaSource {
    /// `llama3` (library namespace) or `namespace/model`.
    pub model: String,
    #[serde(default)]
    pub tag: Option<String>,
}

/// Deterministic local source for tests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MockSource {
    /// Path → UTF-8 contents; a small config + weights set when absent.
    #[serde(default)]
    pub files: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default)]
    pub require_auth: bool,
}

/// Validated source selection, one variant per kind.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceConfig {
    HuggingFace(HuggingFaceSource),
    Mlflow(MlflowSource),
    S3(S3Source),
    GitLfs(GitLfsSource),
    GitXet(GitXetSource),
    Url(UrlSource),
    Ollama(OllamaSource),
    Mock(MockSource),
}

impl SourceConfig {
    pub fn kind(&self) -> SourceKind {
        match self {
            SourceConfig::HuggingFace(_) => SourceKind::HuggingFace,
            SourceConfig::Mlflow(_) => SourceKind::Mlflow,
            SourceConfig::S3(_) => SourceKind::S3,
            SourceConfig::GitLfs(_) => SourceKind::GitLfs,
            SourceConfig::GitXet(_) => SourceKind::GitXet,
            SourceConfig::Url(_) => SourceKind::Url,
            SourceConfig::Ollama(_) => SourceKind::Ollama,
            SourceConfig::Mock(_) => SourceKind::Mock,
        }
    }

    /// Human-readable origin, recorded in fetch metadata.
    pub fn descriptor(&self) -> String {
        match self {
            SourceConfig::HuggingFace(c) => format!("huggingface:{}@{}", c.repo, c.revision),
            SourceConfig::Mlflow(c) => format!(
                "mlflow:{}/{}@{}",
                c.tracking_uri.trim_end_matches('/'),
                c.model_name,
                c.version.as_deref().or(c.stage.as_deref()).unwrap_or("")
            ),
            SourceConfig::S3(c) => format!("s3://{}/{}", c.bucket, c.prefix),
            SourceConfig::GitLfs(c) => format!("git-lfs:{}@{}", c.url, c.rev),
            SourceConfig::GitXet(c) => format!("git-xet:{}@{}", c.url, c.rev),
            SourceConfig::Url(c) => format!("url:{} file(s)", c.urls.len()),
            SourceConfig::Ollama(c) => format!(
                "ollama:{}:{}",
                c.model,
                c.tag.as_deref().unwrap_or("latest")
            ),
            SourceConfig::Mock(c) => format!(
                "mock:{}",
                c.revision.as_deref().unwrap_or(PathsConfig::DEFAULT_REF)
            ),
        }
    }

    /// Structural checks specific to the source kind.
    pub fn validate(&self, errors: &mut Vec<String>) {
        let prefix = format!("source.{}", self.kind());
        let mut push = |msg: String| errors.push(format!("{}.{}", prefix, msg));

        match self {
            SourceConfig::HuggingFace(c) => {
                let parts: Vec<&str> = c.repo.split('/').collect();
                if parts.len() != 2 || parts.iter().any(|p| p.is_empty() || *p == "..") {
                    push(format!("repo: '{}' must look like 'org/model'", c.repo));
                }
                if c.revision.trim().is_empty() {
                    push("revision: must not be empty".to_string());
                }
                for pattern in c.files.iter().flatten() {
                    if let Err(e) = glob::Pattern::new(pattern) {
                        push(format!("files: invalid glob '{}': {}", pattern, e));
                    }
                }
            }
            SourceConfig::Mlflow(c) => {
                if !is_http_url(&c.tracking_uri) {
                    push(format!("trackingUri: '{}' is not an http(s) URL", c.tracking_uri));
                }
                if c.model_name.trim().is_empty() {
                    push("modelName: must not be empty".to_string());
                }
                match (&c.version, &c.stage) {
                    (Some(_), Some(_)) => {
                        push("version/stage: set exactly one, not both".to_string())
                    }
                    (None, None) => push("version/stage: one of them is required".to_string()),
                    _ => {}
                }
            }
            SourceConfig::S3(c) => {
                if c.bucket.trim().is_empty() || c.bucket.contains('/') {
                    push(format!("bucket: '{}' must be a bare bucket name", c.bucket));
                }
                if let Some(endpoint) = &c.endpoint {
                    if !is_http_url(endpoint) {
                        push(format!("endpoint: '{}' is not an http(s) URL", endpoint));
                    }
                }
            }
            SourceConfig::GitLfs(c) => {
                if c.url.trim().is_empty() {
                    push("url: must not be empty".to_string());
                }
                if c.rev.trim().is_empty() || c.rev.starts_with('-') {
                    push(format!("rev: '{}' is not a valid revision", c.rev));
                }
                if let Some(subdir) = &c.subdir {
                    if !is_safe_relpath(subdir) {
                        push(format!("subdir: '{}' must be a relative path", subdir));
                    }
                }
            }
            SourceConfig::GitXet(c) => {
                if c.url.trim().is_empty() {
                    push("url: must not be empty".to_string());
                }
                if c.rev.trim().is_empty() || c.rev.starts_with('-') {
                    push(format!("rev: '{}' is not a valid revision", c.rev));
                }
                if !is_http_url(&c.endpoint) {
                    push(format!("endpoint: '{}' is not an http(s) URL", c.endpoint));
                }
            }
            SourceConfig::Url(c) => {
                if c.urls.is_empty() {
                    push("urls: at least one file is required".to_string());
                }
                let mut seen = HashSet::new();
                for (i, file) in c.urls.iter().enumerate() {
                    if !is_http_url(&file.url) {
                        push(format!("urls[{}].url: '{}' is not an http(s) URL", i, file.url));
                    }
                    if let Err(e) = file.hash.parse::<ContentHash>() {
                        push(format!("urls[{}].hash: {}", i, e));
                    }
                    match file.file_name() {
                        Some(name) if is_safe_relpath(&name) => {
                            if !seen.insert(name.clone()) {
                                push(format!("urls[{}]: duplicate filename '{}'", i, name));
                            }
                        }
                        _ => push(format!(
                            "urls[{}].filename: cannot derive a safe file name from '{}'",
                            i, file.url
                        )),
                    }
                }
            }
            SourceConfig::Ollama(c) => {
                if c.model.trim().is_empty() || c.model.contains(':') {
                    push(format!(
                        "model: '{}' must be a model name; put the tag in 'tag'",
                        c.model
                    ));
                }
            }
            SourceConfig::Mock(c) => {
                if let Some(files) = &c.files {
                    if files.is_empty() {
                        push("files: must not be empty when set".to_string());
                    }
                    for path in files.keys() {
                        if !is_safe_relpath(path) {
                            push(format!("files: '{}' is not a safe relative path", path));
                        }
                    }
                }
            }
        }
    }
}

/// An immutable revision plus the reference it was resolved from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRevision {
    /// Commit id, model version, manifest digest or listing digest.
    pub id: String,
    /// What the caller asked for (branch, tag, stage, ...).
    pub requested: String,
    /// Adapter-private data carried from resolution to listing.
    pub context: BTreeMap<String, String>,
}

impl ResolvedRevision {
    pub fn new(id: impl Into<String>, requested: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            requested: requested.into(),
            context: BTreeMap::new(),
        }
    }

    pub fn with_context(mut self, key: &str, value: impl Into<String>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }
}

/// One file of a revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Relative, `/`-separated path inside the snapshot.
    pub path: String,
    /// Adapter-specific address (URL, object key, checkout path).
    pub locator: String,
    pub size: Option<u64>,
    /// Digest advertised by the source, enforced on ingest.
    pub digest: Option<ContentHash>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileManifest {
    pub entries: Vec<ManifestEntry>,
}

impl FileManifest {
    pub fn new(entries: Vec<ManifestEntry>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Everything an adapter may use during one fetch.
#[derive(Debug, Clone)]
pub struct FetchContext {
    pub credentials: ResolvedCredentials,
    pub clients: HttpClients,
    pub cancel: CancellationToken,
    pub progress: ProgressCounter,
    pub throttle: Option<Arc<Throttle>>,
    /// Scratch space removed when the fetch ends.
    pub work_dir: PathBuf,
}

#[cfg(test)]
pub(crate) fn test_context(work_dir: &Path) -> FetchContext {
    FetchContext {
        credentials: ResolvedCredentials::none(),
        clients: HttpClients::new(&crate::spec::NetworkSpec::default())
            .expect("default clients"),
        cancel: CancellationToken::new(),
        progress: ProgressCounter::new(),
        throttle: None,
        work_dir: work_dir.to_path_buf(),
    }
}

/// A remote artifact source.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Credentials this adapter is allowed to read.
    fn credential_scope(&self) -> CredentialScope;

    /// Environment variable names the fetch may consume.
    fn impure_credential_names(&self) -> Vec<String> {
        self.credential_scope().env_names()
    }

    /// Resolve a mutable reference to an immutable revision.
    ///
    /// Already-immutable identifiers are returned without network access.
    async fn resolve_revision(
        &self,
        config: &SourceConfig,
        ctx: &FetchContext,
    ) -> Result<ResolvedRevision>;

    /// List the files of a resolved revision, honoring include filters.
    async fn list_files(
        &self,
        config: &SourceConfig,
        revision: &ResolvedRevision,
        ctx: &FetchContext,
    ) -> Result<FileManifest>;

    /// Write one file to `destination`, returning the byte count.
    ///
    /// `destination` may already hold a partial download from a previous
    /// attempt.
    async fn download_file(
        &self,
        entry: &ManifestEntry,
        destination: &Path,
        ctx: &FetchContext,
    ) -> Result<u64>;
}

/// Error for an adapter handed another kind's config.
pub(crate) fn config_mismatch(expected: SourceKind, got: &SourceConfig) -> FetchError {
    FetchError::Other(format!(
        "{} adapter received a {} source config",
        expected,
        got.kind()
    ))
}

/// Full-length hex commit id (sha1 or sha256 object format).
pub fn is_commit_id(rev: &str) -> bool {
    COMMIT_ID.is_match(rev)
}

/// Relative, non-empty, without `..`, `.` or empty segments.
pub fn is_safe_relpath(path: &str) -> bool {
    !path.is_empty()
        && !path.starts_with('/')
        && !path.contains('\\')
        && path
            .split('/')
            .all(|seg| !seg.is_empty() && seg != "." && seg != "..")
}

fn is_http_url(raw: &str) -> bool {
    ::url::Url::parse(raw)
        .map(|u| matches!(u.scheme(), "http" | "https"))
        .unwrap_or(false)
}

/// Apply include globs to a full listing.
///
/// An empty listing and a listing emptied by the filters are reported
/// differently so the operator knows which one to fix.
pub fn filter_entries(
    kind: SourceKind,
    target: &str,
    entries: Vec<ManifestEntry>,
    patterns: Option<&[String]>,
) -> Result<Vec<ManifestEntry>> {
    if entries.is_empty() {
        return Err(FetchError::EmptyResult {
            source_kind: kind.to_string(),
            target: target.to_string(),
            reason: EmptyReason::SourceEmpty,
        });
    }
    let Some(patterns) = patterns else {
        return Ok(entries);
    };

    let compiled = patterns
        .iter()
        .map(|p| glob::Pattern::new(p))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| FetchError::config(format!("invalid include glob: {}", e)))?;

    let available = entries.len();
    let selected: Vec<ManifestEntry> = entries
        .into_iter()
        .filter(|entry| compiled.iter().any(|p| p.matches(&entry.path)))
        .collect();

    if selected.is_empty() {
        return Err(FetchError::EmptyResult {
            source_kind: kind.to_string(),
            target: target.to_string(),
            reason: EmptyReason::NoFilesMatchedFilters {
                patterns: patterns.to_vec(),
                available,
            },
        });
    }
    Ok(selected)
}
