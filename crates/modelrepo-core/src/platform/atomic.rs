//! Atomic file writes.
//!
//! Contents go to a uniquely named temp file in the target directory, are
//! synced to disk, and then renamed over the target. Readers observe either
//! the previous contents or the new ones, never a partial write.

use crate::error::{FetchError, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// Write `contents` to `path` atomically, creating parent directories.
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path.parent().ok_or_else(|| FetchError::Io {
        message: format!("{} has no parent directory", path.display()),
        path: Some(path.to_path_buf()),
        source: None,
    })?;
    fs::create_dir_all(parent).map_err(|e| FetchError::io_with_path(e, parent))?;

    let mut temp = NamedTempFile::new_in(parent).map_err(|e| FetchError::Io {
        message: format!("Failed to create temp file in {}", parent.display()),
        path: Some(parent.to_path_buf()),
        source: Some(e),
    })?;
    temp.write_all(contents)
        .and_then(|_| temp.as_file().sync_all())
        .map_err(|e| FetchError::Io {
            message: format!("Failed to write temp file for {}", path.display()),
            path: Some(temp.path().to_path_buf()),
            source: Some(e),
        })?;

    temp.persist(path).map_err(|e| FetchError::Io {
        message: format!("Failed to rename temp file to {}", path.display()),
        path: Some(path.to_path_buf()),
        source: Some(e.error),
    })?;
    Ok(())
}

/// Serialize `data` as pretty JSON and write it atomically.
pub fn atomic_write_json<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    let mut serialized = serde_json::to_string_pretty(data).map_err(|e| FetchError::Json {
        message: format!("Failed to serialize {}: {}", path.display(), e),
        source: Some(e),
    })?;
    serialized.push('\n');
    atomic_write(path, serialized.as_bytes())
}

/// Read and parse a JSON file.
///
/// Returns `None` if the file doesn't exist, or an error if parsing fails.
pub fn atomic_read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(FetchError::io_with_path(e, path)),
    };

    let data = serde_json::from_str(&contents).map_err(|e| FetchError::Json {
        message: format!("Failed to parse {}: {}", path.display(), e),
        source: Some(e),
    })?;
    Ok(Some(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn test_write_creates_parents_and_replaces() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("refs").join("main");

        atomic_write(&path, b"abc").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "abc");

        atomic_write(&path, b"def").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "def");

        // No temp files left behind
        let leftovers = fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn test_json_roundtrip_and_missing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("meta.json");

        let missing: Option<Sample> = atomic_read_json(&path).unwrap();
        assert!(missing.is_none());

        let sample = Sample {
            name: "demo".into(),
            count: 2,
        };
        atomic_write_json(&path, &sample).unwrap();
        let loaded: Option<Sample> = atomic_read_json(&path).unwrap();
        assert_eq!(loaded, Some(sample));
    }

    #[test]
    fn test_read_invalid_json_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(atomic_read_json::<Sample>(&path).is_err());
    }
}
