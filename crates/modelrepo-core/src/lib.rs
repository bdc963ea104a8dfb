//! modelrepo core - verified, content-addressed fetching of ML model artifacts.
//!
//! A [`ModelSpec`] names one artifact, one source to fetch it from, and the
//! tree hash the fetched files must produce. [`Fetcher`] resolves the
//! source's revision, downloads the files into a HuggingFace-hub-compatible
//! cache (`blobs/`, `refs/`, `snapshots/`), refuses anything whose tree hash
//! differs, and then runs the validator pipeline over the verified tree.
//!
//! Sources: HuggingFace, MLflow, S3 (via the `aws` CLI), git with LFS or Xet
//! storage (via `git`), plain URLs, the Ollama registry, and a deterministic
//! mock for tests.
//!
//! # Example
//!
//! ```rust,ignore
//! use modelrepo_core::{Fetcher, ModelSpec};
//!
//! #[tokio::main]
//! async fn main() -> modelrepo_core::Result<()> {
//!     let fetcher = Fetcher::builder("/var/cache/models").build()?;
//!     let spec = ModelSpec::from_json(&std::fs::read_to_string("model.json")?)?;
//!
//!     let outcome = fetcher.run(&spec).await?;
//!     println!("{} -> {}", spec.name, outcome.artifact.snapshot_dir.display());
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod config;
pub mod credentials;
pub mod error;
pub mod fetcher;
pub mod network;
pub mod platform;
pub mod sources;
pub mod spec;
pub mod store;
pub mod validation;

// Re-export commonly used types
pub use cancel::{CancellationToken, CancelledError};
pub use credentials::{CredentialResolver, CredentialScope, ResolvedCredentials};
pub use error::{AuthFailure, EmptyReason, FetchError, Result};
pub use fetcher::{Artifact, FetchMetadata, FetchOutcome, Fetcher, FetcherBuilder, RawTree};
pub use network::RetryConfig;
pub use sources::{
    FetchContext, FileManifest, ManifestEntry, ResolvedRevision, SourceAdapter, SourceConfig,
    SourceKind, SourceRegistry, SourceSelection,
};
pub use spec::{AuthSpec, IntegrationSpec, ModelSpec, NetworkSpec};
pub use store::{ContentHash, ContentStore, HashAlgorithm};
pub use validation::{
    Check, CheckResult, FailurePolicy, ValidationReport, ValidationSpec, ValidationStatus,
    Validator,
};
