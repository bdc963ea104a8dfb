//! Content-addressable artifact store.
//!
//! Layout (compatible with the HuggingFace hub cache):
//!
//! ```text
//! <root>/blobs/<hash>                                   shared blob pool
//! <root>/tmp/                                           in-flight downloads
//! <root>/models--<name>/blobs -> ../blobs
//! <root>/models--<name>/refs/<ref-name>                 revision id
//! <root>/models--<name>/snapshots/<revision>/<relpath>  -> ../../blobs/<hash>
//! <root>/models--<name>/fetch-metadata.json
//! ```
//!
//! Blobs are immutable and only ever appear under their final name by an
//! atomic rename, so concurrent writers of the same bytes converge.

pub mod builder;
pub mod hashing;
pub mod layout;

pub use builder::{write_refs, BlobRecord, CacheBuilder};
pub use hashing::{ContentHash, HashAlgorithm};
pub use layout::ArtifactLayout;

use crate::config::PathsConfig;
use crate::error::{FetchError, Result};
use crate::platform;
use std::path::{Path, PathBuf};
use tempfile::{TempDir, TempPath};
use tracing::debug;

/// A store root plus its hash algorithm.
#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
    algorithm: HashAlgorithm,
}

impl ContentStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>, algorithm: HashAlgorithm) -> Result<Self> {
        let root = root.into();
        for dir in [
            root.join(PathsConfig::BLOBS_DIR_NAME),
            root.join(PathsConfig::TMP_DIR_NAME),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| FetchError::io_with_path(e, &dir))?;
        }
        debug!("Opened content store at {} ({})", root.display(), algorithm);
        Ok(Self { root, algorithm })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.root.join(PathsConfig::BLOBS_DIR_NAME)
    }

    pub fn blob_path(&self, hex: &str) -> PathBuf {
        self.blobs_dir().join(hex)
    }

    pub fn has_blob(&self, hex: &str) -> bool {
        self.blob_path(hex).is_file()
    }

    /// Layout for one artifact directory inside this store.
    pub fn layout(&self, repo_dir_name: &str) -> ArtifactLayout {
        ArtifactLayout::new(&self.root, repo_dir_name)
    }

    /// Create an empty download target under `tmp/`.
    ///
    /// The file is deleted when the returned path is dropped, so a failed
    /// or cancelled download leaves nothing behind.
    pub fn incoming_file(&self) -> Result<TempPath> {
        let tmp = self.root.join(PathsConfig::TMP_DIR_NAME);
        let file = tempfile::Builder::new()
            .prefix(PathsConfig::INCOMING_PREFIX)
            .tempfile_in(&tmp)
            .map_err(|e| FetchError::io_with_path(e, &tmp))?;
        Ok(file.into_temp_path())
    }

    /// Scratch directory for adapters that need a working copy (git).
    pub fn work_dir(&self) -> Result<TempDir> {
        let tmp = self.root.join(PathsConfig::TMP_DIR_NAME);
        tempfile::Builder::new()
            .prefix("work-")
            .tempdir_in(&tmp)
            .map_err(|e| FetchError::io_with_path(e, &tmp))
    }

    /// Fail with `InsufficientSpace` when `required` bytes do not fit.
    ///
    /// Passes when the volume cannot be identified.
    pub fn ensure_space(&self, required: u64) -> Result<()> {
        if required == 0 {
            return Ok(());
        }
        match platform::available_space(&self.root) {
            Some(available) if available < required => Err(FetchError::InsufficientSpace {
                path: self.root.clone(),
                required,
                available,
            }),
            Some(available) => {
                debug!("Pre-flight: {} bytes required, {} available", required, available);
                Ok(())
            }
            None => {
                debug!("Pre-flight skipped: no disk found for {}", self.root.display());
                Ok(())
            }
        }
    }
}
