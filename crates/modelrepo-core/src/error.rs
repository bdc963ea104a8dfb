//! Error types for modelrepo.
//!
//! Every fatal condition a fetch can hit has its own variant so callers can
//! match on the failure class instead of parsing messages. Messages are
//! written for operators: they name the offending component, the expected
//! and actual values where there are any, and a next step for auth and
//! revision problems.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Why an authenticated request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    /// HTTP 401 with no credential configured.
    Missing,
    /// HTTP 401 although a credential was sent (expired, revoked, mistyped).
    Rejected,
    /// HTTP 403: the credential is valid but lacks access to the resource.
    Insufficient,
}

impl fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            AuthFailure::Missing => "credentials missing",
            AuthFailure::Rejected => "credentials rejected",
            AuthFailure::Insufficient => {
                "credentials insufficient, likely requires an access grant"
            }
        };
        f.write_str(text)
    }
}

/// Why a file listing came back empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmptyReason {
    /// The source has files, but none matched the include patterns.
    NoFilesMatchedFilters {
        patterns: Vec<String>,
        available: usize,
    },
    /// The source itself contains no files.
    SourceEmpty,
}

impl fmt::Display for EmptyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmptyReason::NoFilesMatchedFilters {
                patterns,
                available,
            } => write!(
                f,
                "no files matched filters [{}] ({} file(s) available)",
                patterns.join(", "),
                available
            ),
            EmptyReason::SourceEmpty => f.write_str("the source itself is empty"),
        }
    }
}

/// Main error type for modelrepo.
#[derive(Debug, Error)]
pub enum FetchError {
    // Configuration errors
    #[error("Invalid model spec ({} error(s)): {}", .errors.len(), .errors.join("; "))]
    Config { errors: Vec<String> },

    // Source errors
    #[error(
        "Authentication failed for {source_kind} source ({failure}): {detail}. \
         Channels checked: {}. Next step: {remediation}",
        .channels.join(", ")
    )]
    Auth {
        source_kind: String,
        failure: AuthFailure,
        detail: String,
        channels: Vec<String>,
        remediation: String,
    },

    #[error("Revision '{revision}' not found in {source_kind} source. Next step: {hint}")]
    RevisionNotFound {
        source_kind: String,
        revision: String,
        hint: String,
    },

    #[error("Nothing to fetch from {source_kind} source {target}: {reason}")]
    EmptyResult {
        source_kind: String,
        target: String,
        reason: EmptyReason,
    },

    // Network errors
    #[error("Network error: {message}")]
    Network {
        message: String,
        /// HTTP status, when the failure was an HTTP response.
        status: Option<u16>,
        /// Optional cause description
        cause: Option<String>,
    },

    #[error("Giving up after {attempts} attempt(s): {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<FetchError>,
    },

    #[error("External command `{program}` failed: {message}")]
    Command { program: String, message: String },

    // Store errors
    #[error(
        "Insufficient disk space at {path:?}: {required} bytes required, {available} bytes available"
    )]
    InsufficientSpace {
        path: PathBuf,
        required: u64,
        available: u64,
    },

    #[error(
        "Hash mismatch for {name}: expected {expected}, actual {actual}. \
         If the fetched content has been reviewed, set expectedHash to \"{actual}\""
    )]
    HashMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("Downloaded file {path} does not match its advertised digest: expected {expected}, actual {actual}")]
    FileHashMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    // Validation errors
    #[error("Validator '{validator}' failed with abort policy: {message} (unvalidated tree kept at {raw_snapshot:?})")]
    ValidationFailed {
        validator: String,
        message: String,
        raw_snapshot: PathBuf,
    },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Fetch cancelled")]
    Cancelled,

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for modelrepo operations.
pub type Result<T> = std::result::Result<T, FetchError>;

// Conversion implementations for common error types

impl From<std::io::Error> for FetchError {
    fn from(err: std::io::Error) -> Self {
        FetchError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(err: serde_json::Error) -> Self {
        FetchError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

/// Only transport failures stay status-less `Network` errors (and so get
/// retried); builder, redirect and decode errors never succeed on retry.
impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        let cause = std::error::Error::source(&err).map(|s| s.to_string());
        if let Some(status) = err.status() {
            return FetchError::Network {
                message: err.to_string(),
                status: Some(status.as_u16()),
                cause,
            };
        }

        if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
            let message = if err.is_timeout() {
                format!("request timed out: {}", err)
            } else if err.is_connect() {
                format!("connection failed: {}", err)
            } else {
                err.to_string()
            };
            FetchError::Network {
                message,
                status: None,
                cause,
            }
        } else if err.is_decode() {
            FetchError::Json {
                message: format!("Failed to decode response: {}", err),
                source: None,
            }
        } else {
            FetchError::Other(format!("HTTP client error: {}", err))
        }
    }
}

impl FetchError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        FetchError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Create a single-message configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        FetchError::Config {
            errors: vec![message.into()],
        }
    }

    /// Check if this error should trigger a retry.
    ///
    /// HTTP 429 and 5xx responses and connection-level failures are
    /// transient; every other status (401/403/404 in particular) is fatal.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Network { status, .. } => match status {
                None => true,
                Some(429) => true,
                Some(code) => (500..600).contains(code),
            },
            _ => false,
        }
    }

    /// Name of the component that raised this error, for reporting.
    pub fn component(&self) -> &'static str {
        match self {
            FetchError::Config { .. } => "model spec",
            FetchError::Auth { .. } => "credential resolver",
            FetchError::RevisionNotFound { .. }
            | FetchError::EmptyResult { .. }
            | FetchError::Command { .. } => "source adapter",
            FetchError::Network { .. } | FetchError::RetriesExhausted { .. } => "network",
            FetchError::InsufficientSpace { .. }
            | FetchError::FileHashMismatch { .. }
            | FetchError::Io { .. }
            | FetchError::Json { .. } => "cache builder",
            FetchError::HashMismatch { .. } => "hash verification",
            FetchError::ValidationFailed { .. } => "validator pipeline",
            FetchError::Cancelled | FetchError::Other(_) => "fetch orchestrator",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FetchError::HashMismatch {
            name: "org/demo".into(),
            expected: "sha256:aaaa".into(),
            actual: "sha256:bbbb".into(),
        };
        let text = err.to_string();
        assert!(text.contains("expected sha256:aaaa"));
        assert!(text.contains("actual sha256:bbbb"));
    }

    #[test]
    fn test_config_error_joins_all_messages() {
        let err = FetchError::Config {
            errors: vec!["name is empty".into(), "no source specified".into()],
        };
        let text = err.to_string();
        assert!(text.contains("2 error(s)"));
        assert!(text.contains("name is empty; no source specified"));
    }

    #[test]
    fn test_retryable_errors() {
        let transient = |status| FetchError::Network {
            message: "x".into(),
            status,
            cause: None,
        };
        assert!(transient(None).is_retryable());
        assert!(transient(Some(429)).is_retryable());
        assert!(transient(Some(503)).is_retryable());
        assert!(!transient(Some(401)).is_retryable());
        assert!(!transient(Some(403)).is_retryable());
        assert!(!transient(Some(404)).is_retryable());
        assert!(!FetchError::Cancelled.is_retryable());
    }

    #[test]
    fn test_reqwest_builder_error_is_fatal() {
        let err = reqwest::Client::new()
            .get("not a url")
            .build()
            .unwrap_err();
        let err = FetchError::from(err);
        assert!(!matches!(err, FetchError::Network { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_reqwest_connect_error_is_retryable() {
        // Port 1 is reserved and never listening on loopback.
        let err = reqwest::get("http://127.0.0.1:1/").await.unwrap_err();
        let err = FetchError::from(err);
        assert!(matches!(err, FetchError::Network { status: None, .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_auth_error_lists_channels() {
        let err = FetchError::Auth {
            source_kind: "huggingface".into(),
            failure: AuthFailure::Missing,
            detail: "HTTP 401".into(),
            channels: vec!["environment variable $HF_TOKEN (not set)".into()],
            remediation: "export HF_TOKEN".into(),
        };
        let text = err.to_string();
        assert!(text.contains("credentials missing"));
        assert!(text.contains("environment variable $HF_TOKEN"));
        assert!(text.contains("Next step: export HF_TOKEN"));
    }

    #[test]
    fn test_empty_reason_display() {
        let reason = EmptyReason::NoFilesMatchedFilters {
            patterns: vec!["*.gguf".into()],
            available: 3,
        };
        assert_eq!(
            reason.to_string(),
            "no files matched filters [*.gguf] (3 file(s) available)"
        );
    }
}
