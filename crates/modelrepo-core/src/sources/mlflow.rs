//! MLflow model registry source.
//!
//! A registered model version is immutable; a stage (`Production`,
//! `Staging`, ...) is a mutable pointer resolved through
//! `get-latest-versions`. Files are the run artifacts under the version's
//! source path, served by the tracking server's `get-artifact` endpoint.

use super::{
    config_mismatch, filter_entries, FetchContext, FileManifest, ManifestEntry, MlflowSource,
    ResolvedRevision, SourceAdapter, SourceConfig, SourceKind,
};
use crate::credentials::CredentialScope;
use crate::error::{FetchError, Result};
use crate::network::{fetch_json, stream_download};
use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use std::path::Path;
use tracing::debug;

const API_PREFIX: &str = "api/2.0/mlflow";

#[derive(Debug, Deserialize)]
struct ModelVersionResponse {
    model_version: ModelVersion,
}

#[derive(Debug, Deserialize)]
struct LatestVersionsResponse {
    #[serde(default)]
    model_versions: Vec<ModelVersion>,
}

#[derive(Debug, Deserialize)]
struct ModelVersion {
    version: String,
    #[serde(default)]
    source: String,
    #[serde(default)]
    run_id: String,
}

#[derive(Debug, Deserialize)]
struct ArtifactListing {
    #[serde(default)]
    files: Vec<ArtifactInfo>,
}

#[derive(Debug, Deserialize)]
struct ArtifactInfo {
    path: String,
    #[serde(default)]
    is_dir: bool,
    #[serde(default, deserialize_with = "int64_field")]
    file_size: Option<u64>,
}

/// Protobuf int64 fields arrive as JSON numbers or strings.
fn int64_field<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<u64>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }
    Ok(match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::Number(n)) => Some(n),
        Some(Raw::Text(s)) => s.parse().ok(),
        None => None,
    })
}

/// Artifact directory of a model version, relative to the run root.
fn artifact_path(source: &str, run_id: &str) -> String {
    if let Some(rest) = source.strip_prefix("runs:/") {
        return rest
            .strip_prefix(run_id)
            .unwrap_or(rest)
            .trim_matches('/')
            .to_string();
    }
    match source.split_once("/artifacts/") {
        Some((_, path)) => path.trim_matches('/').to_string(),
        None => String::new(),
    }
}

#[derive(Debug, Default)]
pub struct MlflowAdapter;

impl MlflowAdapter {
    pub fn new() -> Self {
        Self
    }

    fn api(config: &MlflowSource, endpoint: &str) -> String {
        format!(
            "{}/{}/{}",
            config.tracking_uri.trim_end_matches('/'),
            API_PREFIX,
            endpoint
        )
    }

    fn not_found(&self, config: &MlflowSource, what: &str) -> FetchError {
        FetchError::RevisionNotFound {
            source_kind: self.kind().to_string(),
            revision: what.to_string(),
            hint: format!(
                "check that registered model '{}' exists on {} and has that version or stage",
                config.model_name, config.tracking_uri
            ),
        }
    }

    async fn model_version(
        &self,
        config: &MlflowSource,
        version: &str,
        ctx: &FetchContext,
    ) -> Result<ModelVersion> {
        let request = ctx.clients.api.get(Self::api(config, "model-versions/get")).query(&[
            ("name", config.model_name.as_str()),
            ("version", version),
        ]);
        let response: ModelVersionResponse = fetch_json(
            ctx.credentials.apply(request),
            self.kind(),
            &ctx.credentials,
            || self.not_found(config, version),
        )
        .await?;
        Ok(response.model_version)
    }

    /// Every file under `root`, depth first.
    async fn list_artifacts(
        &self,
        config: &MlflowSource,
        run_id: &str,
        root: &str,
        ctx: &FetchContext,
    ) -> Result<Vec<ArtifactInfo>> {
        let mut files = Vec::new();
        let mut pending = vec![root.to_string()];
        while let Some(dir) = pending.pop() {
            ctx.cancel.check()?;
            let mut request = ctx
                .clients
                .api
                .get(Self::api(config, "artifacts/list"))
                .query(&[("run_id", run_id)]);
            if !dir.is_empty() {
                request = request.query(&[("path", dir.as_str())]);
            }
            let listing: ArtifactListing = fetch_json(
                ctx.credentials.apply(request),
                self.kind(),
                &ctx.credentials,
                || self.not_found(config, run_id),
            )
            .await?;
            for info in listing.files {
                if info.is_dir {
                    pending.push(info.path);
                } else {
                    files.push(info);
                }
            }
        }
        Ok(files)
    }
}

fn mlflow_config(config: &SourceConfig) -> Result<&MlflowSource> {
    match config {
        SourceConfig::Mlflow(c) => Ok(c),
        other => Err(config_mismatch(SourceKind::Mlflow, other)),
    }
}

#[async_trait]
impl SourceAdapter for MlflowAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Mlflow
    }

    fn credential_scope(&self) -> CredentialScope {
        CredentialScope {
            bearer_env: vec!["MLFLOW_TRACKING_TOKEN"],
            basic_env: Some(("MLFLOW_TRACKING_USERNAME", "MLFLOW_TRACKING_PASSWORD")),
            remediation: "set MLFLOW_TRACKING_TOKEN, or MLFLOW_TRACKING_USERNAME and \
                          MLFLOW_TRACKING_PASSWORD, for an account with read access to the model",
            ..Default::default()
        }
    }

    async fn resolve_revision(
        &self,
        config: &SourceConfig,
        ctx: &FetchContext,
    ) -> Result<ResolvedRevision> {
        let cfg = mlflow_config(config)?;
        if let Some(version) = &cfg.version {
            return Ok(ResolvedRevision::new(version.clone(), version.clone()));
        }
        let stage = cfg
            .stage
            .as_deref()
            .ok_or_else(|| FetchError::config("source.mlflow: version or stage is required"))?;

        let request = ctx
            .clients
            .api
            .post(Self::api(cfg, "registered-models/get-latest-versions"))
            .json(&serde_json::json!({ "name": cfg.model_name, "stages": [stage] }));
        let latest: LatestVersionsResponse = fetch_json(
            ctx.credentials.apply(request),
            self.kind(),
            &ctx.credentials,
            || self.not_found(cfg, stage),
        )
        .await?;

        let version = latest
            .model_versions
            .into_iter()
            .max_by_key(|v| v.version.parse::<u64>().unwrap_or(0))
            .ok_or_else(|| FetchError::RevisionNotFound {
                source_kind: self.kind().to_string(),
                revision: stage.to_string(),
                hint: format!(
                    "no version of '{}' is in stage '{}'; transition one or pin a version",
                    cfg.model_name, stage
                ),
            })?;
        debug!("{} stage {} is version {}", cfg.model_name, stage, version.version);
        Ok(ResolvedRevision::new(version.version, stage))
    }

    async fn list_files(
        &self,
        config: &SourceConfig,
        revision: &ResolvedRevision,
        ctx: &FetchContext,
    ) -> Result<FileManifest> {
        let cfg = mlflow_config(config)?;
        let version = self.model_version(cfg, &revision.id, ctx).await?;
        if version.run_id.is_empty() {
            return Err(FetchError::Other(format!(
                "{} version {} has no run; only run-backed versions can be fetched",
                cfg.model_name, revision.id
            )));
        }
        let root = artifact_path(&version.source, &version.run_id);
        let prefix = if root.is_empty() {
            String::new()
        } else {
            format!("{}/", root)
        };

        let base = cfg.tracking_uri.trim_end_matches('/');
        let entries = self
            .list_artifacts(cfg, &version.run_id, &root, ctx)
            .await?
            .into_iter()
            .map(|info| -> Result<ManifestEntry> {
                let mut locator = url::Url::parse(&format!("{}/get-artifact", base))
                    .map_err(|e| FetchError::config(format!("source.mlflow.trackingUri: {}", e)))?;
                locator
                    .query_pairs_mut()
                    .append_pair("path", &info.path)
                    .append_pair("run_uuid", &version.run_id);
                Ok(ManifestEntry {
                    path: info
                        .path
                        .strip_prefix(&prefix)
                        .unwrap_or(&info.path)
                        .to_string(),
                    locator: locator.to_string(),
                    size: info.file_size,
                    digest: None,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(FileManifest::new(filter_entries(
            self.kind(),
            &format!("{} v{}", cfg.model_name, revision.id),
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
        stream_download(ctx, self.kind(), &entry.locator, destination, entry.size).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::test_context;
    use tempfile::TempDir;

    #[test]
    fn test_artifact_path_from_source() {
        assert_eq!(artifact_path("runs:/abc123/model", "abc123"), "model");
        assert_eq!(
            artifact_path("s3://bucket/1/abc123/artifacts/model/", "abc123"),
            "model"
        );
        assert_eq!(
            artifact_path("mlflow-artifacts:/1/abc123/artifacts/nested/model", "abc123"),
            "nested/model"
        );
        assert_eq!(artifact_path("file:///tmp/elsewhere", "abc123"), "");
    }

    #[test]
    fn test_file_size_number_or_string() {
        let listing: ArtifactListing = serde_json::from_str(
            r#"{"files":[
                {"path":"model/MLmodel","is_dir":false,"file_size":"120"},
                {"path":"model/model.pkl","is_dir":false,"file_size":4096},
                {"path":"model/data","is_dir":true}
            ]}"#,
        )
        .unwrap();
        let sizes: Vec<_> = listing.files.iter().map(|f| f.file_size).collect();
        assert_eq!(sizes, vec![Some(120), Some(4096), None]);
    }

    #[tokio::test]
    async fn test_version_resolves_without_network() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(dir.path());
        let config = SourceConfig::Mlflow(MlflowSource {
            tracking_uri: "http://127.0.0.1:9".into(),
            model_name: "classifier".into(),
            version: Some("7".into()),
            stage: None,
        });
        let revision = MlflowAdapter::new()
            .resolve_revision(&config, &ctx)
            .await
            .unwrap();
        assert_eq!(revision.id, "7");
    }
}
