//! Weight file format detection from magic bytes.

use std::fmt;
use std::io::Read;
use std::path::Path;

/// Magic bytes for file format detection.
mod magic {
    pub const GGUF: &[u8; 4] = b"GGUF";
    /// Legacy GGML containers.
    pub const GGML: &[u8; 4] = b"lmgg";
    pub const GGJT: &[u8; 4] = b"ggjt";
    /// ZIP local file header (PyTorch archives, Keras)
    pub const ZIP: &[u8; 4] = &[0x50, 0x4B, 0x03, 0x04];
    /// HDF5 signature
    pub const HDF5: &[u8; 8] = &[0x89, b'H', b'D', b'F', 0x0D, 0x0A, 0x1A, 0x0A];
    /// Pickle PROTO opcode
    pub const PICKLE_PROTO: u8 = 0x80;
    pub const PICKLE_PROTO_MIN: u8 = 2;
    pub const PICKLE_PROTO_MAX: u8 = 5;
}

/// Safetensors headers above this are rejected as implausible.
const MAX_SAFETENSORS_HEADER: u64 = 100_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightFormat {
    Safetensors,
    Gguf,
    Ggml,
    Onnx,
    /// Raw pickle stream.
    Pickle,
    /// ZIP archive containing pickled data (`torch.save` since 1.6).
    PickleArchive,
    Hdf5,
    Unknown,
}

impl WeightFormat {
    pub const ALL: [WeightFormat; 7] = [
        WeightFormat::Safetensors,
        WeightFormat::Gguf,
        WeightFormat::Ggml,
        WeightFormat::Onnx,
        WeightFormat::Pickle,
        WeightFormat::PickleArchive,
        WeightFormat::Hdf5,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.as_str() == name)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WeightFormat::Safetensors => "safetensors",
            WeightFormat::Gguf => "gguf",
            WeightFormat::Ggml => "ggml",
            WeightFormat::Onnx => "onnx",
            WeightFormat::Pickle => "pickle",
            WeightFormat::PickleArchive => "pickle-archive",
            WeightFormat::Hdf5 => "hdf5",
            WeightFormat::Unknown => "unknown",
        }
    }

    /// Formats that can execute code when loaded.
    pub fn is_pickle(&self) -> bool {
        matches!(self, WeightFormat::Pickle | WeightFormat::PickleArchive)
    }
}

impl fmt::Display for WeightFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detect a format from the first bytes of a file and its extension.
///
/// Safetensors is checked before the pickle opcode: a safetensors header
/// length may start with 0x80.
pub fn detect_format(header: &[u8], extension: &str) -> WeightFormat {
    if header.len() >= 9 {
        let header_size = u64::from_le_bytes(header[..8].try_into().unwrap_or([0; 8]));
        if header_size > 0 && header_size < MAX_SAFETENSORS_HEADER && header[8] == b'{' {
            return WeightFormat::Safetensors;
        }
    }

    if header.len() >= 4 {
        if &header[..4] == magic::GGUF {
            return WeightFormat::Gguf;
        }
        if &header[..4] == magic::GGML || &header[..4] == magic::GGJT {
            return WeightFormat::Ggml;
        }
        if &header[..4] == magic::ZIP {
            // Refined by `inspect_file`, which can look inside.
            return WeightFormat::PickleArchive;
        }
    }
    if header.len() >= 8 && &header[..8] == magic::HDF5 {
        return WeightFormat::Hdf5;
    }

    if header.len() >= 2
        && header[0] == magic::PICKLE_PROTO
        && (magic::PICKLE_PROTO_MIN..=magic::PICKLE_PROTO_MAX).contains(&header[1])
    {
        return WeightFormat::Pickle;
    }

    // ONNX is plain protobuf with no magic.
    match extension {
        "onnx" => WeightFormat::Onnx,
        "pkl" | "pickle" | "joblib" => WeightFormat::Pickle,
        _ => WeightFormat::Unknown,
    }
}

/// True if the ZIP archive contains a pickle member.
fn zip_contains_pickle(path: &Path) -> bool {
    let Ok(file) = std::fs::File::open(path) else {
        return false;
    };
    let Ok(archive) = zip::ZipArchive::new(file) else {
        return false;
    };
    let found = archive
        .file_names()
        .any(|name| name.ends_with(".pkl") || name.ends_with("/data.pkl"));
    found
}

/// Detect the format of a file on disk.
pub fn inspect_file(path: &Path) -> std::io::Result<WeightFormat> {
    let mut file = std::fs::File::open(path)?;
    let mut header = [0u8; 16];
    let mut read = 0;
    while read < header.len() {
        let n = file.read(&mut header[read..])?;
        if n == 0 {
            break;
        }
        read += n;
    }

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    Ok(match detect_format(&header[..read], &extension) {
        WeightFormat::PickleArchive if !zip_contains_pickle(path) => WeightFormat::Unknown,
        format => format,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn safetensors_header(len: u64) -> Vec<u8> {
        let mut bytes = len.to_le_bytes().to_vec();
        bytes.extend_from_slice(b"{\"a\":1}");
        bytes
    }

    #[test]
    fn test_detect_safetensors() {
        assert_eq!(detect_format(&safetensors_header(64), ""), WeightFormat::Safetensors);
    }

    #[test]
    fn test_safetensors_header_starting_with_pickle_opcode() {
        // Header length 0x0280 begins with byte 0x80 followed by 0x02.
        let header = safetensors_header(0x0280);
        assert_eq!(header[0], 0x80);
        assert_eq!(header[1], 0x02);
        assert_eq!(detect_format(&header, "safetensors"), WeightFormat::Safetensors);
    }

    #[test]
    fn test_detect_pickle_and_gguf() {
        assert_eq!(detect_format(&[0x80, 0x04, 0x95, 0x00], "bin"), WeightFormat::Pickle);
        assert_eq!(detect_format(b"GGUF\x03\x00\x00\x00", "gguf"), WeightFormat::Gguf);
        assert_eq!(detect_format(b"\x08\x07\x12\x00", "onnx"), WeightFormat::Onnx);
        assert_eq!(detect_format(b"\x00\x00\x00\x00", "bin"), WeightFormat::Unknown);
    }

    #[test]
    fn test_zip_with_pickle_member() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.pt");
        {
            let file = std::fs::File::create(&path).unwrap();
            let mut zip = zip::ZipWriter::new(file);
            zip.start_file("archive/data.pkl", zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(&[0x80, 0x02, b'.']).unwrap();
            zip.finish().unwrap();
        }
        assert_eq!(inspect_file(&path).unwrap(), WeightFormat::PickleArchive);

        let plain = dir.path().join("plain.zip");
        {
            let file = std::fs::File::create(&plain).unwrap();
            let mut zip = zip::ZipWriter::new(file);
            zip.start_file("readme.txt", zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(b"hello").unwrap();
            zip.finish().unwrap();
        }
        assert_eq!(inspect_file(&plain).unwrap(), WeightFormat::Unknown);
    }
}
