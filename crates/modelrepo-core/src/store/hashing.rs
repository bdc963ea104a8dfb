//! Streaming hash computation for blobs and snapshot trees.
//!
//! A store uses exactly one [`HashAlgorithm`]; blob names, tree hashes and
//! the `expectedHash` of a spec are all expressed in it.

use crate::error::{FetchError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

/// Chunk size for reading files (8MB, optimal for SSDs).
const CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Content hash algorithm of a store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Blake3,
}

impl HashAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Blake3 => "blake3",
        }
    }

    /// Start an incremental hasher for this algorithm.
    pub fn hasher(&self) -> StreamingHasher {
        match self {
            HashAlgorithm::Sha256 => StreamingHasher::Sha256(Sha256::new()),
            HashAlgorithm::Blake3 => StreamingHasher::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    /// Hash an in-memory buffer, returning lowercase hex.
    pub fn digest_hex(&self, bytes: &[u8]) -> String {
        let mut hasher = self.hasher();
        hasher.update(bytes);
        hasher.finalize_hex()
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Incremental hasher over either supported algorithm.
pub enum StreamingHasher {
    Sha256(Sha256),
    Blake3(Box<blake3::Hasher>),
}

impl StreamingHasher {
    pub fn update(&mut self, bytes: &[u8]) {
        match self {
            StreamingHasher::Sha256(h) => h.update(bytes),
            StreamingHasher::Blake3(h) => {
                h.update(bytes);
            }
        }
    }

    pub fn finalize_hex(self) -> String {
        match self {
            StreamingHasher::Sha256(h) => hex::encode(h.finalize()),
            StreamingHasher::Blake3(h) => h.finalize().to_hex().to_string(),
        }
    }
}

/// A hash value tagged with its algorithm, rendered as `<algorithm>:<hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentHash {
    pub algorithm: HashAlgorithm,
    pub hex: String,
}

impl ContentHash {
    pub fn new(algorithm: HashAlgorithm, hex: impl Into<String>) -> Self {
        Self {
            algorithm,
            hex: hex.into().to_ascii_lowercase(),
        }
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl FromStr for ContentHash {
    type Err = FetchError;

    /// Parse `sha256:<hex>`, `blake3:<hex>`, or a bare 64-char hex string
    /// (read as sha256).
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (algorithm, hex) = match s.split_once(':') {
            Some(("sha256", hex)) => (HashAlgorithm::Sha256, hex),
            Some(("blake3", hex)) => (HashAlgorithm::Blake3, hex),
            Some((other, _)) => {
                return Err(FetchError::config(format!(
                    "unsupported hash algorithm '{}' in '{}' (expected sha256 or blake3)",
                    other, s
                )))
            }
            None => (HashAlgorithm::Sha256, s),
        };
        if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(FetchError::config(format!(
                "malformed hash '{}': expected 64 hex characters",
                s
            )));
        }
        Ok(ContentHash::new(algorithm, hex))
    }
}

impl Serialize for ContentHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Hash a file on disk, returning lowercase hex and the byte count.
///
/// Blocking; call from `spawn_blocking` in async contexts.
pub fn hash_file(path: impl AsRef<Path>, algorithm: HashAlgorithm) -> Result<(String, u64)> {
    let path = path.as_ref();
    let mut file = std::fs::File::open(path).map_err(|e| FetchError::io_with_path(e, path))?;

    let mut hasher = algorithm.hasher();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut total: u64 = 0;
    loop {
        let bytes_read = file
            .read(&mut buffer)
            .map_err(|e| FetchError::io_with_path(e, path))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
        total += bytes_read as u64;
    }

    Ok((hasher.finalize_hex(), total))
}

/// Async wrapper around [`hash_file`].
pub async fn hash_file_async(
    path: impl AsRef<Path>,
    algorithm: HashAlgorithm,
) -> Result<(String, u64)> {
    let path = path.as_ref().to_path_buf();
    tokio::task::spawn_blocking(move || hash_file(&path, algorithm))
        .await
        .map_err(|e| FetchError::Other(format!("Hash computation task failed: {}", e)))?
}

/// Hash of a snapshot tree: the algorithm over the sorted
/// `"<relpath>\0<blob hex>\n"` lines.
///
/// Depends only on relative paths and file bytes, so the same content
/// always yields the same value regardless of source or fetch order.
pub fn tree_hash<'a>(
    entries: impl IntoIterator<Item = (&'a str, &'a str)>,
    algorithm: HashAlgorithm,
) -> ContentHash {
    let mut lines: Vec<(&str, &str)> = entries.into_iter().collect();
    lines.sort();

    let mut hasher = algorithm.hasher();
    for (path, blob) in lines {
        hasher.update(path.as_bytes());
        hasher.update(&[0]);
        hasher.update(blob.as_bytes());
        hasher.update(b"\n");
    }
    ContentHash::new(algorithm, hasher.finalize_hex())
}
