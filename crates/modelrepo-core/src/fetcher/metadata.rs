//! Record written next to a fetched artifact.

use crate::error::Result;
use crate::platform::{atomic_read_json, atomic_write_json};
use crate::validation::ValidationReport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Contents of `fetch-metadata.json`.
///
/// Written once per successful fetch, after validation. A later fetch of
/// the same model replaces it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchMetadata {
    pub name: String,
    /// Human-readable source, e.g. `huggingface:org/demo@main`.
    pub source_descriptor: String,
    pub source_kind: String,
    pub resolved_revision: String,
    pub requested_revision: String,
    pub refs: Vec<String>,
    pub fetched_at: DateTime<Utc>,
    pub file_count: usize,
    pub total_bytes: u64,
    pub tree_hash: String,
    pub hash_algorithm: String,
    pub validation: ValidationReport,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl FetchMetadata {
    pub fn load(path: &Path) -> Result<Option<Self>> {
        atomic_read_json(path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        atomic_write_json(path, self)
    }
}
