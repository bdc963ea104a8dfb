//! Paths of one artifact directory (`models--<name>`) inside a store.

use crate::config::PathsConfig;
use crate::error::{FetchError, Result};
use crate::platform;
use std::path::{Path, PathBuf};

/// Directory name for a model: `models--` plus the name with `/` → `--`.
pub fn repo_dir_name(model_name: &str) -> String {
    format!(
        "{}{}",
        PathsConfig::REPO_DIR_PREFIX,
        model_name.replace('/', "--")
    )
}

/// Relative symlink target from `snapshots/<rev>/<relpath>` to the blob.
///
/// One `..` per path component climbs back to the snapshot directory, one
/// more leaves `snapshots/`, landing at the artifact root where `blobs`
/// lives.
pub fn relative_blob_target(relpath: &str, hash: &str) -> PathBuf {
    let depth = relpath.split('/').filter(|c| !c.is_empty()).count();
    let mut target = PathBuf::new();
    for _ in 0..depth + 1 {
        target.push("..");
    }
    target.push(PathsConfig::BLOBS_DIR_NAME);
    target.push(hash);
    target
}

/// Paths of a single artifact directory.
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    root: PathBuf,
}

impl ArtifactLayout {
    pub fn new(store_root: &Path, repo_dir_name: &str) -> Self {
        Self {
            root: store_root.join(repo_dir_name),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn refs_dir(&self) -> PathBuf {
        self.root.join(PathsConfig::REFS_DIR_NAME)
    }

    pub fn ref_path(&self, name: &str) -> PathBuf {
        self.refs_dir().join(name)
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.root.join(PathsConfig::SNAPSHOTS_DIR_NAME)
    }

    pub fn snapshot_dir(&self, revision: &str) -> PathBuf {
        self.snapshots_dir().join(revision)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.snapshots_dir().join(format!(
            "{}{}",
            PathsConfig::STAGING_PREFIX,
            uuid::Uuid::new_v4()
        ))
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.root.join(PathsConfig::METADATA_FILENAME)
    }

    /// Create `refs/`, `snapshots/` and the `blobs -> ../blobs` link.
    pub fn ensure(&self) -> Result<()> {
        for dir in [self.refs_dir(), self.snapshots_dir()] {
            std::fs::create_dir_all(&dir).map_err(|e| FetchError::io_with_path(e, &dir))?;
        }
        let link = self.root.join(PathsConfig::BLOBS_DIR_NAME);
        let target = Path::new("..").join(PathsConfig::BLOBS_DIR_NAME);
        platform::link_dir(&target, &link)?;
        Ok(())
    }

    /// Revision id a ref currently points at.
    pub fn read_ref(&self, name: &str) -> Result<Option<String>> {
        let path = self.ref_path(name);
        match std::fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(FetchError::io_with_path(e, path)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_dir_name() {
        assert_eq!(repo_dir_name("org/demo"), "models--org--demo");
        assert_eq!(repo_dir_name("plain"), "models--plain");
    }

    #[test]
    fn test_relative_target_depth() {
        assert_eq!(
            relative_blob_target("config.json", "ab"),
            PathBuf::from("../../blobs/ab")
        );
        assert_eq!(
            relative_blob_target("onnx/fp16/model.onnx", "cd"),
            PathBuf::from("../../../../blobs/cd")
        );
    }

    #[test]
    fn test_layout_paths() {
        let layout = ArtifactLayout::new(Path::new("/store"), "models--org--demo");
        assert_eq!(
            layout.snapshot_dir("abc"),
            PathBuf::from("/store/models--org--demo/snapshots/abc")
        );
        assert_eq!(
            layout.ref_path("main"),
            PathBuf::from("/store/models--org--demo/refs/main")
        );
        assert!(layout
            .staging_dir()
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(".staging-")));
    }

    #[test]
    fn test_read_missing_ref() {
        let dir = tempfile::TempDir::new().unwrap();
        let layout = ArtifactLayout::new(dir.path(), "models--x");
        assert_eq!(layout.read_ref("main").unwrap(), None);
    }
}
