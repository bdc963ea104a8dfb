//! Cache builder: turns downloaded files into blobs, a staged snapshot,
//! and refs.
//!
//! A snapshot is assembled in `snapshots/.staging-<uuid>` and only renamed
//! to `snapshots/<revision>` by [`CacheBuilder::publish`], which the fetcher
//! calls after the tree hash matched. Published snapshots are append-only.
//! Dropping an unpublished builder removes the staging directory.

use super::hashing::{hash_file, hash_file_async, tree_hash, ContentHash};
use super::layout::{relative_blob_target, ArtifactLayout};
use super::ContentStore;
use crate::error::{FetchError, Result};
use crate::platform::{self, link_blob};
use crate::sources::ManifestEntry;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// A blob that backs one snapshot entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobRecord {
    /// Hex digest in the store's algorithm; also the blob file name.
    pub hash: String,
    pub size: u64,
    /// True when the blob was already in the pool before this fetch.
    pub reused: bool,
}

/// Per-fetch snapshot assembly.
pub struct CacheBuilder<'a> {
    store: &'a ContentStore,
    layout: ArtifactLayout,
    revision: String,
    staging: PathBuf,
    entries: BTreeMap<String, BlobRecord>,
    published: bool,
}

impl<'a> CacheBuilder<'a> {
    /// Prepare the artifact directory and a fresh staging area.
    pub fn begin(store: &'a ContentStore, layout: ArtifactLayout, revision: &str) -> Result<Self> {
        layout.ensure()?;
        let staging = layout.staging_dir();
        std::fs::create_dir_all(&staging).map_err(|e| FetchError::io_with_path(e, &staging))?;
        debug!("Staging snapshot for {} at {}", revision, staging.display());

        Ok(Self {
            store,
            layout,
            revision: revision.to_string(),
            staging,
            entries: BTreeMap::new(),
            published: false,
        })
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    /// Blob already present for this entry, if any.
    ///
    /// An advertised digest in the store's algorithm decides alone. Entries
    /// without one fall back to the link in an existing snapshot of the same
    /// revision.
    pub fn lookup_existing(&self, entry: &ManifestEntry) -> Option<BlobRecord> {
        let advertised = entry
            .digest
            .as_ref()
            .filter(|d| d.algorithm == self.store.algorithm())
            .map(|d| d.hex.clone());

        let hash = match advertised {
            Some(hash) => hash,
            None => {
                let existing = self.layout.snapshot_dir(&self.revision).join(&entry.path);
                std::fs::read_link(&existing)
                    .ok()?
                    .file_name()?
                    .to_str()
                    .map(String::from)?
            }
        };
        if !self.store.has_blob(&hash) {
            return None;
        }

        let size = std::fs::metadata(self.store.blob_path(&hash)).ok()?.len();
        Some(BlobRecord {
            hash,
            size,
            reused: true,
        })
    }

    /// Hash a downloaded file and move it into the blob pool.
    ///
    /// The source's advertised digest, when in the store's algorithm, must
    /// match. If the blob already exists the download is discarded.
    pub async fn ingest(&self, entry: &ManifestEntry, incoming: TempPath) -> Result<BlobRecord> {
        let (hash, size) = hash_file_async(&incoming, self.store.algorithm()).await?;

        if let Some(advertised) = entry
            .digest
            .as_ref()
            .filter(|d| d.algorithm == self.store.algorithm())
        {
            if advertised.hex != hash {
                return Err(FetchError::FileHashMismatch {
                    path: entry.path.clone(),
                    expected: advertised.to_string(),
                    actual: ContentHash::new(self.store.algorithm(), hash).to_string(),
                });
            }
        }

        if self.store.has_blob(&hash) {
            debug!("Blob {} already present, discarding download of {}", hash, entry.path);
            return Ok(BlobRecord {
                hash,
                size,
                reused: true,
            });
        }

        let blob_path = self.store.blob_path(&hash);
        incoming.persist(&blob_path).map_err(|e| FetchError::Io {
            message: format!("Failed to move {} into the blob pool", entry.path),
            path: Some(blob_path.clone()),
            source: Some(e.error),
        })?;
        debug!("Stored blob {} ({} bytes) for {}", hash, size, entry.path);

        Ok(BlobRecord {
            hash,
            size,
            reused: false,
        })
    }

    /// Add `relpath` to the staged snapshot.
    pub fn link(&mut self, relpath: &str, record: BlobRecord) -> Result<()> {
        let link_path = self.staging.join(relpath);
        let target = relative_blob_target(relpath, &record.hash);
        link_blob(&target, &self.store.blob_path(&record.hash), &link_path)?;
        self.entries.insert(relpath.to_string(), record);
        Ok(())
    }

    /// Tree hash of everything linked so far.
    pub fn tree_hash(&self) -> ContentHash {
        tree_hash(
            self.entries
                .iter()
                .map(|(path, record)| (path.as_str(), record.hash.as_str())),
            self.store.algorithm(),
        )
    }

    pub fn file_count(&self) -> usize {
        self.entries.len()
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.values().map(|r| r.size).sum()
    }

    /// Move the staged snapshot to `snapshots/<revision>`.
    ///
    /// An existing snapshot with identical entries is kept. Published
    /// snapshots are never modified: when `snapshots/<revision>` holds
    /// different entries, the staged tree goes to
    /// `snapshots/<revision>-<tree hash prefix>` instead.
    pub fn publish(mut self) -> Result<PathBuf> {
        let staged: BTreeMap<String, String> = self
            .entries
            .iter()
            .map(|(path, record)| (path.clone(), record.hash.clone()))
            .collect();
        let tree_prefix: String = self.tree_hash().hex.chars().take(12).collect();
        let candidates = [
            self.layout.snapshot_dir(&self.revision),
            self.layout.snapshot_dir(&format!("{}-{}", self.revision, tree_prefix)),
        ];

        for final_dir in candidates {
            if final_dir.exists() {
                if snapshot_entries(&final_dir, self.store)? == staged {
                    debug!("Snapshot {} already present and identical", final_dir.display());
                    self.published = true;
                    remove_dir_quietly(&self.staging);
                    return Ok(final_dir);
                }
                warn!(
                    "Snapshot {} holds different content, keeping it untouched",
                    final_dir.display()
                );
                continue;
            }

            if let Err(e) = std::fs::rename(&self.staging, &final_dir) {
                // A concurrent fetch of the same revision may have won the rename.
                if final_dir.exists() && snapshot_entries(&final_dir, self.store)? == staged {
                    self.published = true;
                    remove_dir_quietly(&self.staging);
                    return Ok(final_dir);
                }
                return Err(FetchError::io_with_path(e, &final_dir));
            }

            self.published = true;
            info!(
                "Published snapshot {} ({} files)",
                final_dir.display(),
                self.entries.len()
            );
            return Ok(final_dir);
        }

        Err(FetchError::Other(format!(
            "Every snapshot directory for revision {} holds different content",
            self.revision
        )))
    }

    /// Drop the staged snapshot without publishing.
    pub fn discard(self) {
        // Drop removes the staging directory
    }
}

impl Drop for CacheBuilder<'_> {
    fn drop(&mut self) {
        if !self.published {
            remove_dir_quietly(&self.staging);
        }
    }
}

fn remove_dir_quietly(dir: &Path) {
    if let Err(e) = std::fs::remove_dir_all(dir) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", dir.display(), e);
        }
    }
}

/// Map of relpath → blob hash for a published snapshot.
///
/// Symlinked entries are read from their link target; hardlinked or copied
/// entries (non-symlink platforms) are hashed.
fn snapshot_entries(dir: &Path, store: &ContentStore) -> Result<BTreeMap<String, String>> {
    let mut entries = BTreeMap::new();
    for item in WalkDir::new(dir).follow_links(false).min_depth(1) {
        let item = item.map_err(|e| FetchError::Io {
            message: format!("Failed to walk snapshot: {}", e),
            path: Some(dir.to_path_buf()),
            source: None,
        })?;
        if item.file_type().is_dir() {
            continue;
        }

        let relpath = item
            .path()
            .strip_prefix(dir)
            .map_err(|e| FetchError::Other(e.to_string()))?
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");

        let hash = if item.path_is_symlink() {
            std::fs::read_link(item.path())
                .map_err(|e| FetchError::io_with_path(e, item.path()))?
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        } else {
            hash_file(item.path(), store.algorithm())?.0
        };
        entries.insert(relpath, hash);
    }
    Ok(entries)
}

/// Point each ref at the snapshot directory `snapshot`, writing every ref
/// atomically.
pub fn write_refs(layout: &ArtifactLayout, names: &[String], snapshot: &str) -> Result<()> {
    for name in names {
        platform::atomic_write(&layout.ref_path(name), snapshot.as_bytes())?;
        debug!("Ref {} -> {}", name, snapshot);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::HashAlgorithm;
    use tempfile::TempDir;

    fn entry(path: &str) -> ManifestEntry {
        ManifestEntry {
            path: path.to_string(),
            locator: path.to_string(),
            size: None,
            digest: None,
        }
    }

    fn incoming(store: &ContentStore, bytes: &[u8]) -> TempPath {
        let path = store.incoming_file().unwrap();
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[tokio::test]
    async fn test_ingest_link_publish() {
        let dir = TempDir::new().unwrap();
        let store = ContentStore::open(dir.path(), HashAlgorithm::Sha256).unwrap();
        let layout = store.layout("models--org--demo");

        let mut builder = CacheBuilder::begin(&store, layout.clone(), "rev1").unwrap();
        let e = entry("sub/config.json");
        let record = builder.ingest(&e, incoming(&store, b"{}")).await.unwrap();
        assert!(!record.reused);
        builder.link(&e.path, record.clone()).unwrap();
        let snapshot = builder.publish().unwrap();

        let linked = snapshot.join("sub/config.json");
        assert_eq!(std::fs::read(&linked).unwrap(), b"{}");
        #[cfg(unix)]
        assert_eq!(
            std::fs::read_link(&linked).unwrap(),
            PathBuf::from("../../../blobs").join(&record.hash)
        );
        assert!(store.has_blob(&record.hash));
    }

    #[tokio::test]
    async fn test_duplicate_content_shares_blob() {
        let dir = TempDir::new().unwrap();
        let store = ContentStore::open(dir.path(), HashAlgorithm::Sha256).unwrap();
        let builder = CacheBuilder::begin(&store, store.layout("models--a"), "r").unwrap();

        let first = builder
            .ingest(&entry("a.bin"), incoming(&store, b"same"))
            .await
            .unwrap();
        let second = builder
            .ingest(&entry("b.bin"), incoming(&store, b"same"))
            .await
            .unwrap();

        assert_eq!(first.hash, second.hash);
        assert!(second.reused);
        assert_eq!(std::fs::read_dir(store.blobs_dir()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_advertised_digest_mismatch() {
        let dir = TempDir::new().unwrap();
        let store = ContentStore::open(dir.path(), HashAlgorithm::Sha256).unwrap();
        let builder = CacheBuilder::begin(&store, store.layout("models--a"), "r").unwrap();

        let mut e = entry("model.gguf");
        e.digest = Some(ContentHash::new(HashAlgorithm::Sha256, "0".repeat(64)));
        let err = builder
            .ingest(&e, incoming(&store, b"tampered"))
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::FileHashMismatch { .. }));
        assert_eq!(std::fs::read_dir(store.blobs_dir()).unwrap().count(), 0);
    }

    #[test]
    fn test_dropping_builder_removes_staging() {
        let dir = TempDir::new().unwrap();
        let store = ContentStore::open(dir.path(), HashAlgorithm::Sha256).unwrap();
        let layout = store.layout("models--a");
        let builder = CacheBuilder::begin(&store, layout.clone(), "r").unwrap();
        builder.discard();

        let leftovers: Vec<_> = std::fs::read_dir(layout.snapshots_dir())
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_lookup_existing_uses_published_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = ContentStore::open(dir.path(), HashAlgorithm::Sha256).unwrap();
        let layout = store.layout("models--a");

        let mut builder = CacheBuilder::begin(&store, layout.clone(), "r").unwrap();
        let e = entry("weights.safetensors");
        let record = builder.ingest(&e, incoming(&store, b"w")).await.unwrap();
        builder.link(&e.path, record.clone()).unwrap();
        builder.publish().unwrap();

        let again = CacheBuilder::begin(&store, layout, "r").unwrap();
        let found = again.lookup_existing(&e).expect("blob should be reused");
        assert_eq!(found.hash, record.hash);
        assert!(found.reused);
        assert!(again.lookup_existing(&entry("other.bin")).is_none());

        // A digest for different content wins over the existing link.
        let mut changed = entry("weights.safetensors");
        changed.digest = Some(ContentHash::new(
            HashAlgorithm::Sha256,
            HashAlgorithm::Sha256.digest_hex(b"new weights"),
        ));
        assert!(again.lookup_existing(&changed).is_none());
    }

    #[tokio::test]
    async fn test_publish_never_replaces_existing_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = ContentStore::open(dir.path(), HashAlgorithm::Sha256).unwrap();
        let layout = store.layout("models--a");

        let mut first = CacheBuilder::begin(&store, layout.clone(), "r").unwrap();
        let a = entry("a.json");
        let record = first.ingest(&a, incoming(&store, b"{}")).await.unwrap();
        first.link(&a.path, record).unwrap();
        let first_dir = first.publish().unwrap();

        let mut second = CacheBuilder::begin(&store, layout.clone(), "r").unwrap();
        let b = entry("b.json");
        let record = second.ingest(&b, incoming(&store, b"[]")).await.unwrap();
        second.link(&b.path, record).unwrap();
        let prefix: String = second.tree_hash().hex.chars().take(12).collect();
        let second_dir = second.publish().unwrap();

        assert_eq!(first_dir, layout.snapshot_dir("r"));
        assert_eq!(second_dir, layout.snapshot_dir(&format!("r-{}", prefix)));
        assert!(first_dir.join("a.json").exists());
        assert!(!first_dir.join("b.json").exists());
        assert!(second_dir.join("b.json").exists());
        assert!(!second_dir.join("a.json").exists());
    }

    #[test]
    fn test_write_refs() {
        let dir = TempDir::new().unwrap();
        let layout = ArtifactLayout::new(dir.path(), "models--a");
        write_refs(&layout, &["main".to_string(), "v1".to_string()], "abc").unwrap();
        assert_eq!(layout.read_ref("main").unwrap().as_deref(), Some("abc"));
        assert_eq!(layout.read_ref("v1").unwrap().as_deref(), Some("abc"));
    }
}
