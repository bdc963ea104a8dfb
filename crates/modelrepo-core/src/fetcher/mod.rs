//! Fetch orchestrator.
//!
//! A fetch runs in two stages with a hash gate between them:
//!
//! 1. **Raw fetch**: validate the model spec, resolve the revision, list files,
//!    download into the blob pool, stage the snapshot, and compare its tree
//!    hash with `expectedHash`. Only a matching snapshot is published and
//!    gets refs.
//! 2. **Validation**: run the validator pipeline over the published
//!    snapshot and record the outcome in `fetch-metadata.json`.
//!
//! A mismatch or failure in stage 1 leaves no trace besides deduplicated
//! blobs. An aborting validator in stage 2 leaves the verified raw tree in
//! place and reports where it is.

mod builder;
pub mod metadata;

pub use builder::FetcherBuilder;
pub use metadata::FetchMetadata;

use crate::cancel::CancellationToken;
use crate::credentials::CredentialResolver;
use crate::error::{FetchError, Result};
use crate::network::{with_retry, HttpClients, ProgressCounter, RetryConfig, Throttle};
use crate::sources::{
    is_safe_relpath, FetchContext, ManifestEntry, ResolvedRevision, SourceAdapter,
    SourceRegistry, SourceSelection,
};
use crate::spec::{ref_names, ModelSpec};
use crate::store::{write_refs, BlobRecord, CacheBuilder, ContentHash, ContentStore};
use crate::validation::{ValidationPipeline, ValidationStatus, Validator};
use futures::{StreamExt, TryStreamExt};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// The validated artifact as exposed to consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// `<store>/models--<name>`
    pub root: PathBuf,
    pub snapshot_dir: PathBuf,
    pub metadata_path: PathBuf,
}

/// The hash-verified tree before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTree {
    pub snapshot_dir: PathBuf,
    pub tree_hash: ContentHash,
    pub revision: ResolvedRevision,
}

#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub artifact: Artifact,
    pub raw: RawTree,
    pub metadata: FetchMetadata,
}

/// Fetches model specs into one content store.
#[derive(Debug, Clone)]
pub struct Fetcher {
    store: ContentStore,
    registry: SourceRegistry,
    resolver: CredentialResolver,
    validators: Vec<Validator>,
}

impl Fetcher {
    pub fn builder(store_root: impl Into<PathBuf>) -> FetcherBuilder {
        FetcherBuilder::new(store_root)
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    /// Environment variables a fetch of `selection` may read.
    pub fn impure_credential_names(&self, selection: &SourceSelection) -> Result<Vec<String>> {
        let (adapter, _) = self.registry.dispatch(selection)?;
        Ok(adapter.impure_credential_names())
    }

    /// Fetch, verify and validate `spec`.
    pub async fn run(&self, spec: &ModelSpec) -> Result<FetchOutcome> {
        self.run_with_cancel(spec, CancellationToken::new()).await
    }

    /// [`run`](Self::run) with external cancellation.
    ///
    /// On cancellation in-flight downloads stop, and their temp files and
    /// the staged snapshot are removed.
    pub async fn run_with_cancel(
        &self,
        spec: &ModelSpec,
        cancel: CancellationToken,
    ) -> Result<FetchOutcome> {
        let started = Instant::now();

        let validated = spec.validate(self.store.algorithm())?;
        let pipeline = ValidationPipeline::from_spec(&spec.validation, &self.validators)?;
        let adapter = self.registry.adapter(validated.source.kind())?;
        let source = validated.source;
        let kind = adapter.kind();
        info!("Fetching {} from {}", spec.name, source.descriptor());

        cancel.check()?;
        let credentials = self.resolver.resolve(&adapter.credential_scope(), &spec.auth);

        // Scratch space for adapters; removed on every exit path.
        let work_dir = self.store.work_dir()?;
        let ctx = FetchContext {
            credentials,
            clients: HttpClients::new(&spec.network)?,
            cancel: cancel.clone(),
            progress: ProgressCounter::new(),
            throttle: spec
                .network
                .bandwidth_limit
                .map(|limit| Arc::new(Throttle::new(limit))),
            work_dir: work_dir.path().to_path_buf(),
        };
        let retry = spec.network.retry_config();

        // Stage 1: raw fetch
        let revision = with_retry(&retry, &cancel, "resolve revision", || {
            adapter.resolve_revision(&source, &ctx)
        })
        .await?;
        info!(
            "Resolved {} '{}' to {}",
            kind, revision.requested, revision.id
        );

        let manifest = with_retry(&retry, &cancel, "list files", || {
            adapter.list_files(&source, &revision, &ctx)
        })
        .await?;
        check_manifest_paths(&manifest.entries, &source.descriptor())?;
        info!("{} file(s) to materialize", manifest.len());

        let layout = self.store.layout(&validated.repo_dir_name);
        let mut builder = CacheBuilder::begin(&self.store, layout.clone(), &revision.id)?;

        let mut linked: Vec<(String, BlobRecord)> = Vec::with_capacity(manifest.len());
        let mut pending: Vec<&ManifestEntry> = Vec::new();
        for entry in &manifest.entries {
            match builder.lookup_existing(entry) {
                Some(record) => {
                    debug!("Reusing blob {} for {}", record.hash, entry.path);
                    linked.push((entry.path.clone(), record));
                }
                None => pending.push(entry),
            }
        }

        let required: u64 = pending.iter().filter_map(|e| e.size).sum();
        self.store.ensure_space(required)?;

        if !pending.is_empty() {
            info!(
                "Downloading {} file(s), {} already cached",
                pending.len(),
                linked.len()
            );
            let adapter_ref = adapter.as_ref();
            let builder_ref = &builder;
            let ctx_ref = &ctx;
            let retry_ref = &retry;
            let downloaded: Vec<(String, BlobRecord)> = futures::stream::iter(pending)
                .map(move |entry| {
                    self.download_entry(adapter_ref, entry, builder_ref, ctx_ref, retry_ref)
                })
                .buffer_unordered(spec.network.parallel_downloads.max(1))
                .try_collect()
                .await?;
            linked.extend(downloaded);
            info!("Downloaded {} bytes", ctx.progress.bytes());
        }

        for (path, record) in linked {
            builder.link(&path, record)?;
        }

        let actual = builder.tree_hash();
        if actual != validated.expected_hash {
            warn!(
                "Tree hash mismatch for {}: expected {}, actual {}",
                spec.name, validated.expected_hash, actual
            );
            builder.discard();
            return Err(FetchError::HashMismatch {
                name: spec.name.clone(),
                expected: validated.expected_hash.to_string(),
                actual: actual.to_string(),
            });
        }

        let file_count = builder.file_count();
        let total_bytes = builder.total_bytes();
        let snapshot_dir = builder.publish()?;
        info!("Verified {} ({})", spec.name, actual);

        // Stage 2: validation
        let report = pipeline.run(&snapshot_dir, &cancel).await?;
        if report.status == ValidationStatus::Aborted {
            let validator = report.aborted_by.clone().unwrap_or_default();
            let message = report
                .outcomes
                .iter()
                .find(|o| o.name == validator)
                .map(|o| o.message.clone())
                .unwrap_or_default();
            warn!(
                "{} rejected by validator {}, refs left unchanged",
                spec.name, validator
            );
            return Err(FetchError::ValidationFailed {
                validator,
                message,
                raw_snapshot: snapshot_dir,
            });
        }

        let refs = ref_names(
            &revision.requested,
            &revision.id,
            &spec.integration.ref_names,
        );
        let snapshot_name = snapshot_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| revision.id.clone());

        let metadata = FetchMetadata {
            name: spec.name.clone(),
            source_descriptor: source.descriptor(),
            source_kind: kind.as_str().to_string(),
            resolved_revision: revision.id.clone(),
            requested_revision: revision.requested.clone(),
            refs: refs.clone(),
            fetched_at: chrono::Utc::now(),
            file_count,
            total_bytes,
            tree_hash: actual.to_string(),
            hash_algorithm: self.store.algorithm().as_str().to_string(),
            validation: report,
            metadata: spec.metadata.clone(),
        };
        let metadata_path = layout.metadata_path();
        metadata.save(&metadata_path)?;
        write_refs(&layout, &refs, &snapshot_name)?;
        info!("Refs for {}: {} -> {}", spec.name, refs.join(", "), snapshot_name);

        info!(
            "Fetched {} in {:.1}s ({} files, {} bytes)",
            spec.name,
            started.elapsed().as_secs_f64(),
            file_count,
            total_bytes
        );

        Ok(FetchOutcome {
            artifact: Artifact {
                root: layout.root().to_path_buf(),
                snapshot_dir: snapshot_dir.clone(),
                metadata_path,
            },
            raw: RawTree {
                snapshot_dir,
                tree_hash: actual,
                revision,
            },
            metadata,
        })
    }

    /// Download one entry under the retry policy and move it into the pool.
    ///
    /// The same temp file is reused across attempts so adapters can resume.
    async fn download_entry(
        &self,
        adapter: &dyn SourceAdapter,
        entry: &ManifestEntry,
        builder: &CacheBuilder<'_>,
        ctx: &FetchContext,
        retry: &RetryConfig,
    ) -> Result<(String, BlobRecord)> {
        let incoming = self.store.incoming_file()?;
        let destination: &Path = &incoming;
        let what = format!("download {}", entry.path);

        let bytes = with_retry(retry, &ctx.cancel, &what, || {
            adapter.download_file(entry, destination, ctx)
        })
        .await?;
        debug!("Downloaded {} ({} bytes)", entry.path, bytes);

        let record = builder.ingest(entry, incoming).await?;
        Ok((entry.path.clone(), record))
    }
}

/// Reject listings with paths that could escape the snapshot or collide.
fn check_manifest_paths(entries: &[ManifestEntry], descriptor: &str) -> Result<()> {
    let mut seen = HashSet::new();
    for entry in entries {
        if !is_safe_relpath(&entry.path) {
            return Err(FetchError::Other(format!(
                "{} listed unsafe path '{}'",
                descriptor, entry.path
            )));
        }
        if !seen.insert(entry.path.as_str()) {
            return Err(FetchError::Other(format!(
                "{} listed '{}' more than once",
                descriptor, entry.path
            )));
        }
    }
    Ok(())
}
