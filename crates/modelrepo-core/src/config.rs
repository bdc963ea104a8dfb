//! Centralized configuration constants for modelrepo.
//!
//! Defaults here back the `serde` defaults of [`crate::spec::ModelSpec`] and
//! the on-disk layout names used by the content store.

use std::time::Duration;

/// Network-related configuration.
pub struct NetworkConfig;

impl NetworkConfig {
    pub const USER_AGENT: &'static str = concat!("modelrepo/", env!("CARGO_PKG_VERSION"));
    pub const CONNECT_TIMEOUT_SECS: u64 = 30;
    pub const API_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
    pub const MAX_ATTEMPTS: u32 = 3;
    pub const RETRY_BASE_DELAY_SECS: f64 = 2.0;
    pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(60);
    pub const RETRY_EXPONENTIAL_BASE: f64 = 2.0;
    pub const PARALLEL_DOWNLOADS: usize = 4;
    pub const HF_ENDPOINT: &'static str = "https://huggingface.co";
    pub const HF_ENDPOINT_ENV: &'static str = "HF_ENDPOINT";
    pub const OLLAMA_REGISTRY: &'static str = "https://registry.ollama.ai";
}

/// Content store directory and file names.
pub struct PathsConfig;

impl PathsConfig {
    pub const BLOBS_DIR_NAME: &'static str = "blobs";
    pub const REFS_DIR_NAME: &'static str = "refs";
    pub const SNAPSHOTS_DIR_NAME: &'static str = "snapshots";
    pub const TMP_DIR_NAME: &'static str = "tmp";
    pub const REPO_DIR_PREFIX: &'static str = "models--";
    pub const STAGING_PREFIX: &'static str = ".staging-";
    pub const INCOMING_PREFIX: &'static str = ".incoming-";
    pub const METADATA_FILENAME: &'static str = "fetch-metadata.json";
    pub const DEFAULT_REF: &'static str = "main";
}

/// Validator pipeline defaults.
pub struct ValidationConfig;

impl ValidationConfig {
    pub const DEFAULT_TIMEOUT_SECS: u64 = 300;
    /// Extensions that mark a file as model weights.
    pub const WEIGHT_EXTENSIONS: &'static [&'static str] = &[
        "safetensors", "gguf", "ggml", "onnx", "bin", "pt", "pth", "ckpt", "pkl", "pickle",
        "joblib", "h5", "msgpack",
    ];
    /// Weight formats accepted by the default allow-list validator.
    pub const ALLOWED_WEIGHT_FORMATS: &'static [&'static str] = &["safetensors", "gguf", "onnx"];
    /// Manifest checked by the default manifest validator.
    pub const MANIFEST_FILENAME: &'static str = "config.json";
}
