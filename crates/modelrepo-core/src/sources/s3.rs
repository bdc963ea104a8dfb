//! S3 (and S3-compatible) source, delegated to the `aws` CLI.
//!
//! Buckets have no commits, so the revision is a digest over the listing
//! (key, ETag, size). Listing again at download time and comparing digests
//! catches a prefix that changed mid-fetch.

use super::command::{run_tool, ToolOutput};
use super::{
    config_mismatch, filter_entries, FetchContext, FileManifest, ManifestEntry, ResolvedRevision,
    S3Source, SourceAdapter, SourceConfig, SourceKind,
};
use crate::credentials::{
    Credential, CredentialScope, DefaultCredentialFile, DefaultFileFormat,
};
use crate::error::{AuthFailure, FetchError, Result};
use crate::store::HashAlgorithm;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

const AWS_PROGRAM: &str = "aws";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListObjectsOutput {
    #[serde(default)]
    contents: Vec<S3Object>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct S3Object {
    key: String,
    size: u64,
    #[serde(default, rename = "ETag")]
    etag: String,
}

/// What `download_file` needs to address one object.
#[derive(Debug, Serialize, Deserialize)]
struct ObjectLocator {
    bucket: String,
    key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    endpoint: Option<String>,
}

#[derive(Debug, Clone)]
pub struct S3Adapter {
    credentials_file: Option<PathBuf>,
}

impl Default for S3Adapter {
    fn default() -> Self {
        Self::new()
    }
}

impl S3Adapter {
    pub fn new() -> Self {
        Self {
            credentials_file: dirs::home_dir().map(|h| h.join(".aws").join("credentials")),
        }
    }

    /// `aws` invocation with region, endpoint and resolved credentials.
    fn command(
        &self,
        args: &[&str],
        region: Option<&str>,
        endpoint: Option<&str>,
        ctx: &FetchContext,
    ) -> Command {
        let mut command = Command::new(AWS_PROGRAM);
        command.args(args).arg("--no-cli-pager");
        if let Some(region) = region {
            command.args(["--region", region]);
        }
        if let Some(endpoint) = endpoint {
            command.args(["--endpoint-url", endpoint]);
        }
        if let Some(Credential::Basic { username, password }) = &ctx.credentials.credential {
            command
                .env("AWS_ACCESS_KEY_ID", username)
                .env("AWS_SECRET_ACCESS_KEY", password);
        }
        command
    }

    async fn list_objects(&self, cfg: &S3Source, ctx: &FetchContext) -> Result<Vec<S3Object>> {
        let command = self.command(
            &[
                "s3api",
                "list-objects-v2",
                "--bucket",
                cfg.bucket.as_str(),
                "--prefix",
                cfg.prefix.as_str(),
                "--output",
                "json",
            ],
            cfg.region.as_deref(),
            cfg.endpoint.as_deref(),
            ctx,
        );
        let output = run_tool(command, AWS_PROGRAM, &ctx.cancel).await?;
        if !output.success {
            return Err(classify_failure(&output, &format!("s3://{}/{}", cfg.bucket, cfg.prefix), ctx));
        }
        // No matching keys prints nothing at all.
        if output.stdout.trim().is_empty() {
            return Ok(Vec::new());
        }
        let listing: ListObjectsOutput = serde_json::from_str(&output.stdout)?;
        Ok(listing
            .contents
            .into_iter()
            .filter(|o| !o.key.ends_with('/'))
            .collect())
    }
}

/// Digest of the listing, truncated like a commit id.
fn listing_digest(objects: &[S3Object]) -> String {
    let mut sorted: Vec<&S3Object> = objects.iter().collect();
    sorted.sort_by(|a, b| a.key.cmp(&b.key));
    let mut hasher = HashAlgorithm::Sha256.hasher();
    for object in sorted {
        hasher.update(format!("{}\0{}\0{}\n", object.key, object.etag, object.size).as_bytes());
    }
    hasher.finalize_hex()[..40].to_string()
}

/// Map `aws` stderr to a typed error.
fn classify_failure(output: &ToolOutput, target: &str, ctx: &FetchContext) -> FetchError {
    let stderr = output.stderr.as_str();
    let detail = output.summary();
    let has = |needles: &[&str]| needles.iter().any(|n| stderr.contains(n));

    if has(&["Unable to locate credentials", "NoCredentialProviders"]) {
        ctx.credentials
            .auth_error(SourceKind::S3, AuthFailure::Missing, detail)
    } else if has(&["InvalidAccessKeyId", "SignatureDoesNotMatch", "ExpiredToken", "InvalidToken"]) {
        ctx.credentials
            .auth_error(SourceKind::S3, AuthFailure::Rejected, detail)
    } else if has(&["AccessDenied", "Forbidden", "(403)"]) {
        ctx.credentials
            .auth_error(SourceKind::S3, AuthFailure::Insufficient, detail)
    } else if has(&["NoSuchBucket", "NoSuchKey", "(404)", "Not Found"]) {
        FetchError::RevisionNotFound {
            source_kind: SourceKind::S3.to_string(),
            revision: target.to_string(),
            hint: "check the bucket name, prefix and region".to_string(),
        }
    } else if has(&[
        "Could not connect",
        "Connect timeout",
        "Read timeout",
        "SlowDown",
        "InternalError",
        "ServiceUnavailable",
        "(500)",
        "(503)",
    ]) {
        FetchError::Network {
            message: format!("aws: {}", detail),
            status: None,
            cause: None,
        }
    } else {
        FetchError::Command {
            program: AWS_PROGRAM.to_string(),
            message: format!(
                "exited with {}: {}",
                output
                    .code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                detail
            ),
        }
    }
}

fn s3_config(config: &SourceConfig) -> Result<&S3Source> {
    match config {
        SourceConfig::S3(c) => Ok(c),
        other => Err(config_mismatch(SourceKind::S3, other)),
    }
}

#[async_trait]
impl SourceAdapter for S3Adapter {
    fn kind(&self) -> SourceKind {
        SourceKind::S3
    }

    fn credential_scope(&self) -> CredentialScope {
        CredentialScope {
            basic_env: Some(("AWS_ACCESS_KEY_ID", "AWS_SECRET_ACCESS_KEY")),
            passthrough_env: vec!["AWS_SESSION_TOKEN", "AWS_PROFILE", "AWS_REGION"],
            default_file: self.credentials_file.clone().map(|path| DefaultCredentialFile {
                path,
                format: DefaultFileFormat::ToolManaged,
            }),
            remediation: "configure AWS credentials with read access to the bucket \
                          (aws configure, or AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY)",
            ..Default::default()
        }
    }

    async fn resolve_revision(
        &self,
        config: &SourceConfig,
        ctx: &FetchContext,
    ) -> Result<ResolvedRevision> {
        let cfg = s3_config(config)?;
        let objects = self.list_objects(cfg, ctx).await?;
        let id = listing_digest(&objects);
        debug!("s3://{}/{} lists {} object(s), revision {}", cfg.bucket, cfg.prefix, objects.len(), id);
        Ok(ResolvedRevision::new(id, "latest"))
    }

    async fn list_files(
        &self,
        config: &SourceConfig,
        revision: &ResolvedRevision,
        ctx: &FetchContext,
    ) -> Result<FileManifest> {
        let cfg = s3_config(config)?;
        let target = format!("s3://{}/{}", cfg.bucket, cfg.prefix);
        let objects = self.list_objects(cfg, ctx).await?;
        let current = listing_digest(&objects);
        if current != revision.id {
            return Err(FetchError::Network {
                message: format!(
                    "{} changed during the fetch (listing {} became {})",
                    target, revision.id, current
                ),
                status: None,
                cause: None,
            });
        }

        let prefix = cfg.prefix.trim_end_matches('/');
        let entries = objects
            .into_iter()
            .map(|object| -> Result<ManifestEntry> {
                let path = object
                    .key
                    .strip_prefix(prefix)
                    .unwrap_or(&object.key)
                    .trim_start_matches('/')
                    .to_string();
                let locator = serde_json::to_string(&ObjectLocator {
                    bucket: cfg.bucket.clone(),
                    key: object.key,
                    region: cfg.region.clone(),
                    endpoint: cfg.endpoint.clone(),
                })?;
                Ok(ManifestEntry {
                    path,
                    locator,
                    size: Some(object.size),
                    digest: None,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(FileManifest::new(filter_entries(
            self.kind(),
            &target,
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
        let object: ObjectLocator = serde_json::from_str(&entry.locator)?;
        let uri = format!("s3://{}/{}", object.bucket, object.key);
        let destination_arg = destination.to_string_lossy();
        let command = self.command(
            &["s3", "cp", uri.as_str(), &*destination_arg, "--only-show-errors"],
            object.region.as_deref(),
            object.endpoint.as_deref(),
            ctx,
        );
        let output = run_tool(command, AWS_PROGRAM, &ctx.cancel).await?;
        if !output.success {
            return Err(classify_failure(&output, &uri, ctx));
        }

        let written = tokio::fs::metadata(destination)
            .await
            .map_err(|e| FetchError::io_with_path(e, destination))?
            .len();
        if let Some(size) = entry.size {
            if written != size {
                return Err(FetchError::Network {
                    message: format!("incomplete download of {}: {} of {} bytes", uri, written, size),
                    status: None,
                    cause: None,
                });
            }
        }
        ctx.progress.record(written);
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::test_context;
    use tempfile::TempDir;

    fn object(key: &str, etag: &str, size: u64) -> S3Object {
        S3Object {
            key: key.into(),
            size,
            etag: etag.into(),
        }
    }

    fn failed(stderr: &str) -> ToolOutput {
        ToolOutput {
            success: false,
            code: Some(254),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    #[test]
    fn test_listing_digest_ignores_order_and_tracks_etags() {
        let a = listing_digest(&[object("m/a", "\"1\"", 1), object("m/b", "\"2\"", 2)]);
        let b = listing_digest(&[object("m/b", "\"2\"", 2), object("m/a", "\"1\"", 1)]);
        let c = listing_digest(&[object("m/a", "\"9\"", 1), object("m/b", "\"2\"", 2)]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_list_output_parses() {
        let listing: ListObjectsOutput = serde_json::from_str(
            r#"{"Contents":[{"Key":"models/tiny/config.json","Size":42,"ETag":"\"abc\"","StorageClass":"STANDARD"}]}"#,
        )
        .unwrap();
        assert_eq!(listing.contents.len(), 1);
        assert_eq!(listing.contents[0].etag, "\"abc\"");
    }

    #[test]
    fn test_stderr_classification() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(dir.path());

        let err = classify_failure(&failed("Unable to locate credentials."), "s3://b/p", &ctx);
        assert!(matches!(err, FetchError::Auth { failure: AuthFailure::Missing, .. }));

        let err = classify_failure(
            &failed("An error occurred (AccessDenied) when calling the ListObjectsV2 operation"),
            "s3://b/p",
            &ctx,
        );
        assert!(matches!(err, FetchError::Auth { failure: AuthFailure::Insufficient, .. }));

        let err = classify_failure(
            &failed("An error occurred (NoSuchBucket) when calling the ListObjectsV2 operation"),
            "s3://b/p",
            &ctx,
        );
        assert!(matches!(err, FetchError::RevisionNotFound { .. }));

        let err = classify_failure(&failed("Could not connect to the endpoint URL"), "s3://b/p", &ctx);
        assert!(err.is_retryable());

        let err = classify_failure(&failed("something odd"), "s3://b/p", &ctx);
        assert!(matches!(err, FetchError::Command { .. }));
    }
}
