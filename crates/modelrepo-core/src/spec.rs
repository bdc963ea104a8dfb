//! The model spec: everything one fetch invocation needs to know.
//!
//! A [`ModelSpec`] is plain data deserialized from camelCase JSON (or built
//! in code). [`ModelSpec::validate`] checks it in one pass and reports every
//! problem at once, before any network access.

use crate::config::{NetworkConfig, PathsConfig};
use crate::error::{FetchError, Result};
use crate::network::RetryConfig;
use crate::sources::{SourceConfig, SourceSelection};
use crate::store::layout::repo_dir_name;
use crate::store::{ContentHash, HashAlgorithm};
use crate::validation::ValidationSpec;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

static MODEL_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*(/[A-Za-z0-9._-]+)*$").unwrap());

/// Declarative description of one artifact to fetch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ModelSpec {
    pub name: String,
    #[serde(default)]
    pub source: SourceSelection,
    #[serde(default)]
    pub expected_hash: Option<String>,
    #[serde(default)]
    pub validation: ValidationSpec,
    #[serde(default)]
    pub network: NetworkSpec,
    #[serde(default)]
    pub auth: AuthSpec,
    #[serde(default)]
    pub integration: IntegrationSpec,
    /// Free-form annotations copied into the fetch metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Result of a successful [`ModelSpec::validate`].
#[derive(Debug, Clone)]
pub struct ValidatedSpec {
    pub expected_hash: ContentHash,
    pub source: SourceConfig,
    pub repo_dir_name: String,
}

impl ModelSpec {
    /// Parse a spec from JSON. Structural checks happen in [`validate`](Self::validate).
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| FetchError::Config {
            errors: vec![format!("malformed model spec: {}", e)],
        })
    }

    /// Check every field, collecting all errors.
    ///
    /// `algorithm` is the store's hash algorithm; the expected hash must
    /// use it.
    pub fn validate(&self, algorithm: HashAlgorithm) -> Result<ValidatedSpec> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push("name: must not be empty".to_string());
        } else if !MODEL_NAME.is_match(&self.name) || self.name.contains("..") {
            errors.push(format!(
                "name: '{}' may only contain letters, digits, '.', '_', '-' and '/' separators",
                self.name
            ));
        }

        let source = match self.source.to_config() {
            Ok(config) => {
                config.validate(&mut errors);
                Some(config)
            }
            Err(FetchError::Config { errors: source_errors }) => {
                errors.extend(source_errors);
                None
            }
            Err(other) => return Err(other),
        };

        let expected_hash = match self.expected_hash.as_deref() {
            None => {
                errors.push(
                    "expectedHash: required; run once with a placeholder and copy the actual hash from the mismatch error"
                        .to_string(),
                );
                None
            }
            Some(raw) => match raw.parse::<ContentHash>() {
                Ok(hash) if hash.algorithm != algorithm => {
                    errors.push(format!(
                        "expectedHash: uses {} but the store hashes with {}",
                        hash.algorithm, algorithm
                    ));
                    None
                }
                Ok(hash) => Some(hash),
                Err(FetchError::Config { errors: e }) => {
                    errors.extend(e.into_iter().map(|m| format!("expectedHash: {}", m)));
                    None
                }
                Err(other) => return Err(other),
            },
        };

        self.validation.validate(&mut errors);
        self.network.validate(&mut errors);
        self.auth.validate(&mut errors);
        self.integration.validate(&mut errors);

        match (source, expected_hash) {
            (Some(source), Some(expected_hash)) if errors.is_empty() => Ok(ValidatedSpec {
                expected_hash,
                source,
                repo_dir_name: self
                    .integration
                    .repo_dir_name
                    .clone()
                    .unwrap_or_else(|| repo_dir_name(&self.name)),
            }),
            _ => Err(FetchError::Config { errors }),
        }
    }
}

/// Network behavior of one fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NetworkSpec {
    #[serde(default)]
    pub timeout: TimeoutSpec,
    #[serde(default)]
    pub retry: RetrySpec,
    /// Bytes per second across all downloads of the fetch.
    #[serde(default)]
    pub bandwidth_limit: Option<u64>,
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default = "default_parallel_downloads")]
    pub parallel_downloads: usize,
}

fn default_parallel_downloads() -> usize {
    NetworkConfig::PARALLEL_DOWNLOADS
}

impl Default for NetworkSpec {
    fn default() -> Self {
        Self {
            timeout: TimeoutSpec::default(),
            retry: RetrySpec::default(),
            bandwidth_limit: None,
            proxy: None,
            parallel_downloads: default_parallel_downloads(),
        }
    }
}

impl NetworkSpec {
    fn validate(&self, errors: &mut Vec<String>) {
        if self.parallel_downloads == 0 {
            errors.push("network.parallelDownloads: must be at least 1".to_string());
        }
        if self.retry.max_attempts == 0 {
            errors.push("network.retry.maxAttempts: must be at least 1".to_string());
        }
        if !self.retry.base_delay_seconds.is_finite() || self.retry.base_delay_seconds < 0.0 {
            errors.push("network.retry.baseDelaySeconds: must be a non-negative number".to_string());
        }
        if self.bandwidth_limit == Some(0) {
            errors.push("network.bandwidthLimit: must be positive when set".to_string());
        }
        if let Some(proxy) = &self.proxy {
            if url::Url::parse(proxy).is_err() {
                errors.push(format!("network.proxy: '{}' is not a valid URL", proxy));
            }
        }
    }

    /// Retry policy derived from this spec.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new()
            .with_max_attempts(self.retry.max_attempts)
            .with_base_delay(Duration::from_secs_f64(self.retry.base_delay_seconds.max(0.0)))
            .with_max_elapsed(self.timeout.read())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TimeoutSpec {
    #[serde(default = "default_connect_seconds")]
    pub connect_seconds: u64,
    /// Overall bound per request and across retries; 0 means unbounded.
    #[serde(default)]
    pub read_seconds: u64,
}

fn default_connect_seconds() -> u64 {
    NetworkConfig::CONNECT_TIMEOUT_SECS
}

impl Default for TimeoutSpec {
    fn default() -> Self {
        Self {
            connect_seconds: default_connect_seconds(),
            read_seconds: 0,
        }
    }
}

impl TimeoutSpec {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_seconds)
    }

    pub fn read(&self) -> Option<Duration> {
        (self.read_seconds > 0).then(|| Duration::from_secs(self.read_seconds))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RetrySpec {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_seconds: f64,
}

fn default_max_attempts() -> u32 {
    NetworkConfig::MAX_ATTEMPTS
}

fn default_base_delay() -> f64 {
    NetworkConfig::RETRY_BASE_DELAY_SECS
}

impl Default for RetrySpec {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_seconds: default_base_delay(),
        }
    }
}

/// Where credentials come from. Secrets themselves never live in a model spec.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AuthSpec {
    /// Accepted by the parser only so it can be rejected with a clear error.
    #[serde(default, skip_serializing)]
    pub token: Option<String>,
    #[serde(default)]
    pub token_env: Option<String>,
    #[serde(default)]
    pub token_file: Option<PathBuf>,
}

impl fmt::Debug for AuthSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSpec")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("token_env", &self.token_env)
            .field("token_file", &self.token_file)
            .finish()
    }
}

impl AuthSpec {
    fn validate(&self, errors: &mut Vec<String>) {
        if self.token.is_some() {
            errors.push(
                "auth.token: inline secrets are not allowed; use auth.tokenEnv or auth.tokenFile"
                    .to_string(),
            );
        }
        if self.token_env.as_deref().is_some_and(|v| v.trim().is_empty()) {
            errors.push("auth.tokenEnv: must not be empty".to_string());
        }
    }
}

/// How the fetched artifact is exposed in the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct IntegrationSpec {
    /// Override for the `models--<name>` directory.
    #[serde(default)]
    pub repo_dir_name: Option<String>,
    /// Extra refs pointed at the fetched revision.
    #[serde(default)]
    pub ref_names: Vec<String>,
}

impl IntegrationSpec {
    fn validate(&self, errors: &mut Vec<String>) {
        if let Some(dir) = &self.repo_dir_name {
            if dir.is_empty() || dir.contains('/') || dir.contains('\\') || dir.starts_with('.') {
                errors.push(format!(
                    "integration.repoDirName: '{}' must be a single directory name",
                    dir
                ));
            }
        }
        for name in &self.ref_names {
            if !is_valid_ref_name(name) {
                errors.push(format!("integration.refNames: '{}' is not a valid ref name", name));
            }
        }
    }
}

/// Ref names may contain `/` but no empty, `.` or `..` segments.
pub fn is_valid_ref_name(name: &str) -> bool {
    !name.is_empty()
        && !name.chars().any(|c| c.is_whitespace() || c == '\\')
        && name
            .split('/')
            .all(|seg| !seg.is_empty() && seg != "." && seg != "..")
}

/// Refs written for a fetch: `main`, the requested reference when it
/// differs from the resolved id, and any extra names from the model spec.
pub fn ref_names(requested: &str, resolved_id: &str, extra: &[String]) -> Vec<String> {
    let mut names = vec![PathsConfig::DEFAULT_REF.to_string()];
    if requested != resolved_id && is_valid_ref_name(requested) {
        names.push(requested.to_string());
    }
    names.extend(extra.iter().cloned());
    let mut seen = std::collections::HashSet::new();
    names.retain(|n| seen.insert(n.clone()));
    names
}
