//! Snapshot link creation.
//!
//! Snapshots point at blobs through relative symlinks so a store directory
//! can be moved as a whole. Where symlinks are unavailable (Windows without
//! developer mode) the link falls back to a hardlink, then to a copy.

use crate::error::{FetchError, Result};
use std::path::Path;
use tracing::debug;

/// How a snapshot entry was materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Symlink,
    Hardlink,
    Copy,
}

/// Link `link_path` to a blob.
///
/// `relative_target` is the symlink contents (relative to the link's
/// directory); `blob_path` is the absolute blob used for the fallbacks.
pub fn link_blob(relative_target: &Path, blob_path: &Path, link_path: &Path) -> Result<LinkType> {
    if let Some(parent) = link_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| FetchError::io_with_path(e, parent))?;
    }

    #[cfg(unix)]
    {
        if std::os::unix::fs::symlink(relative_target, link_path).is_ok() {
            return Ok(LinkType::Symlink);
        }
    }

    #[cfg(windows)]
    {
        if std::os::windows::fs::symlink_file(relative_target, link_path).is_ok() {
            return Ok(LinkType::Symlink);
        }
    }

    if std::fs::hard_link(blob_path, link_path).is_ok() {
        debug!("Symlink unavailable, hardlinked {}", link_path.display());
        return Ok(LinkType::Hardlink);
    }

    std::fs::copy(blob_path, link_path).map_err(|e| FetchError::io_with_path(e, link_path))?;
    debug!("Symlink and hardlink unavailable, copied {}", link_path.display());
    Ok(LinkType::Copy)
}

/// Create a directory symlink. Skipped (returns false) where unsupported.
pub fn link_dir(relative_target: &Path, link_path: &Path) -> Result<bool> {
    if link_path.symlink_metadata().is_ok() {
        return Ok(true);
    }

    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(relative_target, link_path)
            .map_err(|e| FetchError::io_with_path(e, link_path))?;
        Ok(true)
    }

    #[cfg(windows)]
    {
        Ok(std::os::windows::fs::symlink_dir(relative_target, link_path).is_ok())
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = relative_target;
        Ok(false)
    }
}
