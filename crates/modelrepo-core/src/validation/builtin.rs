//! Built-in checks and the default validator set.

use super::engine::{Check, CheckResult, Validator};
use super::format::inspect_file;
use super::{CheckSpec, ValidatorSpec, WeightFormat};
use crate::config::ValidationConfig;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use walkdir::WalkDir;

/// Names of the validators in [`default_validators`], in run order.
pub const DEFAULT_VALIDATOR_NAMES: [&str; 3] =
    ["no-pickle", "weight-format-allowlist", "manifest-parses"];

/// Files listed in failure messages before truncating.
const MAX_LISTED: usize = 10;

/// The safety validators that run unless `skipDefaults` is set.
pub fn default_validators() -> Vec<Validator> {
    let [no_pickle, allowlist, manifest] = DEFAULT_VALIDATOR_NAMES;
    vec![
        Validator::new(no_pickle, NoPickle)
            .with_description("reject pickled weights, which can execute code when loaded"),
        Validator::new(
            allowlist,
            AllowedFormats {
                formats: ValidationConfig::ALLOWED_WEIGHT_FORMATS
                    .iter()
                    .filter_map(|f| WeightFormat::from_name(f))
                    .collect(),
            },
        )
        .with_description("weight files must be safetensors, gguf or onnx"),
        Validator::new(
            manifest,
            JsonParses {
                path: ValidationConfig::MANIFEST_FILENAME.to_string(),
                required: false,
            },
        )
        .with_description("top-level config.json, if present, must be valid JSON"),
    ]
}

/// Build a validator from its declaration.
pub fn from_spec(spec: &ValidatorSpec) -> Validator {
    let check: Arc<dyn Check> = match &spec.check {
        CheckSpec::Command { program, args } => Arc::new(CommandCheck {
            program: program.clone(),
            args: args.clone(),
        }),
        CheckSpec::MaxTotalSize { bytes } => Arc::new(MaxTotalSize { bytes: *bytes }),
        CheckSpec::MaxFileSize { bytes } => Arc::new(MaxFileSize { bytes: *bytes }),
        CheckSpec::RequiredFiles { paths } => Arc::new(RequiredFiles {
            paths: paths.clone(),
        }),
        CheckSpec::ForbiddenExtensions { extensions } => Arc::new(ForbiddenExtensions {
            extensions: extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }),
        CheckSpec::AllowedFormats { formats } => Arc::new(AllowedFormats {
            formats: formats.iter().filter_map(|f| WeightFormat::from_name(f)).collect(),
        }),
        CheckSpec::JsonParses { path } => Arc::new(JsonParses {
            path: path.clone(),
            required: true,
        }),
        CheckSpec::NoPickle => Arc::new(NoPickle),
    };

    Validator {
        name: spec.name.clone(),
        description: spec.description.clone(),
        check,
        on_failure: spec.on_failure,
        timeout: spec.timeout_seconds.map(Duration::from_secs),
    }
}

/// A file in the tree, with symlinks followed.
struct TreeFile {
    relpath: String,
    path: PathBuf,
    size: u64,
}

impl TreeFile {
    fn extension(&self) -> String {
        self.path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default()
    }
}

fn tree_files(tree: &Path) -> std::io::Result<Vec<TreeFile>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(tree).follow_links(true).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::other)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(tree) else {
            continue;
        };
        let relpath = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let size = entry.metadata().map_err(std::io::Error::other)?.len();
        files.push(TreeFile {
            relpath,
            path: entry.path().to_path_buf(),
            size,
        });
    }
    Ok(files)
}

/// Run a file-walking check on the blocking pool.
async fn on_files<F>(tree: &Path, check: F) -> CheckResult
where
    F: FnOnce(Vec<TreeFile>) -> CheckResult + Send + 'static,
{
    let tree = tree.to_path_buf();
    let joined = tokio::task::spawn_blocking(move || match tree_files(&tree) {
        Ok(files) => check(files),
        Err(e) => CheckResult::fail(format!("cannot read tree {}: {}", tree.display(), e)),
    })
    .await;
    joined.unwrap_or_else(|e| CheckResult::fail(format!("check panicked: {}", e)))
}

/// "a, b, c and 4 more"
fn list(items: &[String]) -> String {
    let shown = items.iter().take(MAX_LISTED).cloned().collect::<Vec<_>>().join(", ");
    if items.len() > MAX_LISTED {
        format!("{} and {} more", shown, items.len() - MAX_LISTED)
    } else {
        shown
    }
}

pub struct NoPickle;

#[async_trait]
impl Check for NoPickle {
    async fn run(&self, tree: &Path) -> CheckResult {
        on_files(tree, |files| {
            let pickled: Vec<String> = files
                .iter()
                .filter_map(|f| match inspect_file(&f.path) {
                    Ok(format) if format.is_pickle() => Some(format!("{} ({})", f.relpath, format)),
                    Ok(_) => None,
                    Err(e) => Some(format!("{} (unreadable: {})", f.relpath, e)),
                })
                .collect();
            if pickled.is_empty() {
                CheckResult::pass(format!("{} file(s), no pickle data", files.len()))
            } else {
                CheckResult::fail(format!("pickle data found: {}", list(&pickled)))
            }
        })
        .await
    }
}

pub struct AllowedFormats {
    pub formats: Vec<WeightFormat>,
}

#[async_trait]
impl Check for AllowedFormats {
    async fn run(&self, tree: &Path) -> CheckResult {
        let allowed = self.formats.clone();
        on_files(tree, move |files| {
            let mut checked = 0;
            let mut rejected = Vec::new();
            for file in files
                .iter()
                .filter(|f| ValidationConfig::WEIGHT_EXTENSIONS.contains(&f.extension().as_str()))
            {
                checked += 1;
                match inspect_file(&file.path) {
                    Ok(format) if allowed.contains(&format) => {}
                    Ok(format) => rejected.push(format!("{} ({})", file.relpath, format)),
                    Err(e) => rejected.push(format!("{} (unreadable: {})", file.relpath, e)),
                }
            }
            if rejected.is_empty() {
                CheckResult::pass(format!("{} weight file(s) in allowed formats", checked))
            } else {
                let names: Vec<&str> = allowed.iter().map(|f| f.as_str()).collect();
                CheckResult::fail(format!(
                    "weight files outside allowed formats [{}]: {}",
                    names.join(", "),
                    list(&rejected)
                ))
            }
        })
        .await
    }
}

pub struct JsonParses {
    pub path: String,
    /// Fail when the file is absent instead of passing.
    pub required: bool,
}

#[async_trait]
impl Check for JsonParses {
    async fn run(&self, tree: &Path) -> CheckResult {
        let path = tree.join(&self.path);
        match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<serde_json::Value>(&bytes) {
                Ok(_) => CheckResult::pass(format!("{} is valid JSON", self.path)),
                Err(e) => CheckResult::fail(format!("{} is not valid JSON: {}", self.path, e)),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !self.required => {
                CheckResult::pass(format!("{} not present", self.path))
            }
            Err(e) => CheckResult::fail(format!("cannot read {}: {}", self.path, e)),
        }
    }
}

pub struct MaxTotalSize {
    pub bytes: u64,
}

#[async_trait]
impl Check for MaxTotalSize {
    async fn run(&self, tree: &Path) -> CheckResult {
        let limit = self.bytes;
        on_files(tree, move |files| {
            let total: u64 = files.iter().map(|f| f.size).sum();
            if total <= limit {
                CheckResult::pass(format!("{} bytes total (limit {})", total, limit))
            } else {
                CheckResult::fail(format!("{} bytes total exceeds limit of {}", total, limit))
            }
        })
        .await
    }
}

pub struct MaxFileSize {
    pub bytes: u64,
}

#[async_trait]
impl Check for MaxFileSize {
    async fn run(&self, tree: &Path) -> CheckResult {
        let limit = self.bytes;
        on_files(tree, move |files| {
            let oversized: Vec<String> = files
                .iter()
                .filter(|f| f.size > limit)
                .map(|f| format!("{} ({} bytes)", f.relpath, f.size))
                .collect();
            if oversized.is_empty() {
                CheckResult::pass(format!("all files within {} bytes", limit))
            } else {
                CheckResult::fail(format!("files over {} bytes: {}", limit, list(&oversized)))
            }
        })
        .await
    }
}

pub struct RequiredFiles {
    pub paths: Vec<String>,
}

#[async_trait]
impl Check for RequiredFiles {
    async fn run(&self, tree: &Path) -> CheckResult {
        let missing: Vec<String> = self
            .paths
            .iter()
            .filter(|p| !tree.join(p).is_file())
            .cloned()
            .collect();
        if missing.is_empty() {
            CheckResult::pass(format!("{} required file(s) present", self.paths.len()))
        } else {
            CheckResult::fail(format!("missing required files: {}", list(&missing)))
        }
    }
}

pub struct ForbiddenExtensions {
    /// Lowercase, without the leading dot.
    pub extensions: Vec<String>,
}

#[async_trait]
impl Check for ForbiddenExtensions {
    async fn run(&self, tree: &Path) -> CheckResult {
        let forbidden = self.extensions.clone();
        on_files(tree, move |files| {
            let found: Vec<String> = files
                .iter()
                .filter(|f| forbidden.contains(&f.extension()))
                .map(|f| f.relpath.clone())
                .collect();
            if found.is_empty() {
                CheckResult::pass("no forbidden extensions")
            } else {
                CheckResult::fail(format!("forbidden files: {}", list(&found)))
            }
        })
        .await
    }
}

/// External program run against the tree.
pub struct CommandCheck {
    pub program: String,
    pub args: Vec<String>,
}

#[async_trait]
impl Check for CommandCheck {
    async fn run(&self, tree: &Path) -> CheckResult {
        // Dropped on timeout or cancellation, which kills the child.
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(tree)
            .env("MODEL_DIR", tree)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await;

        match output {
            Ok(output) if output.status.success() => {
                CheckResult::pass(format!("{} exited 0", self.program))
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let stdout = String::from_utf8_lossy(&output.stdout);
                let detail = stderr
                    .lines()
                    .chain(stdout.lines())
                    .map(str::trim)
                    .rfind(|l| !l.is_empty())
                    .unwrap_or("")
                    .to_string();
                CheckResult::fail(format!(
                    "{} exited with {}{}",
                    self.program,
                    output
                        .status
                        .code()
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "signal".to_string()),
                    if detail.is_empty() {
                        String::new()
                    } else {
                        format!(": {}", detail)
                    }
                ))
            }
            Err(e) => CheckResult::fail(format!("cannot run {}: {}", self.program, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn safetensors() -> Vec<u8> {
        let header = br#"{"w":{"dtype":"F32","shape":[1],"data_offsets":[0,4]}}"#;
        let mut bytes = (header.len() as u64).to_le_bytes().to_vec();
        bytes.extend_from_slice(header);
        bytes.extend_from_slice(&[0, 0, 128, 63]);
        bytes
    }

    fn tree(files: &[(&str, &[u8])]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for (path, contents) in files {
            let full = dir.path().join(path);
            std::fs::create_dir_all(full.parent().unwrap()).unwrap();
            std::fs::write(full, contents).unwrap();
        }
        dir
    }

    #[tokio::test]
    async fn test_no_pickle() {
        let clean = tree(&[("config.json", b"{}"), ("model.safetensors", &safetensors())]);
        assert!(NoPickle.run(clean.path()).await.passed);

        let dirty = tree(&[("pytorch_model.bin", &[0x80, 0x02, b'}', b'q'])]);
        let result = NoPickle.run(dirty.path()).await;
        assert!(!result.passed);
        assert!(result.message.contains("pytorch_model.bin"));
    }

    #[tokio::test]
    async fn test_allowed_formats_only_checks_weight_files() {
        let check = AllowedFormats {
            formats: vec![WeightFormat::Safetensors],
        };
        let ok = tree(&[("model.safetensors", &safetensors()), ("README.md", b"hi")]);
        assert!(check.run(ok.path()).await.passed);

        let bad = tree(&[("model.gguf", b"GGUF\x03\x00\x00\x00")]);
        let result = check.run(bad.path()).await;
        assert!(!result.passed);
        assert!(result.message.contains("model.gguf (gguf)"));
    }

    #[tokio::test]
    async fn test_manifest_optional_vs_required() {
        let empty = tree(&[("model.safetensors", &safetensors())]);
        let optional = JsonParses {
            path: "config.json".into(),
            required: false,
        };
        let required = JsonParses {
            path: "config.json".into(),
            required: true,
        };
        assert!(optional.run(empty.path()).await.passed);
        assert!(!required.run(empty.path()).await.passed);

        let broken = tree(&[("config.json", b"{not json")]);
        assert!(!optional.run(broken.path()).await.passed);
    }

    #[tokio::test]
    async fn test_size_limits() {
        let dir = tree(&[("a.txt", &[0u8; 10]), ("nested/b.txt", &[0u8; 20])]);
        assert!(MaxTotalSize { bytes: 30 }.run(dir.path()).await.passed);
        assert!(!MaxTotalSize { bytes: 29 }.run(dir.path()).await.passed);

        let result = MaxFileSize { bytes: 15 }.run(dir.path()).await;
        assert!(!result.passed);
        assert!(result.message.contains("nested/b.txt"));
    }

    #[tokio::test]
    async fn test_required_files_and_extensions() {
        let dir = tree(&[("config.json", b"{}"), ("weights.ckpt", b"xx")]);
        assert!(RequiredFiles {
            paths: vec!["config.json".into()]
        }
        .run(dir.path())
        .await
        .passed);
        assert!(!RequiredFiles {
            paths: vec!["tokenizer.json".into()]
        }
        .run(dir.path())
        .await
        .passed);

        let result = ForbiddenExtensions {
            extensions: vec!["ckpt".into()],
        }
        .run(dir.path())
        .await;
        assert!(!result.passed);
        assert!(result.message.contains("weights.ckpt"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_check_exit_status() {
        let dir = tree(&[("config.json", b"{}")]);
        let pass = CommandCheck {
            program: "sh".into(),
            args: vec!["-c".into(), "test -f \"$MODEL_DIR/config.json\"".into()],
        };
        assert!(pass.run(dir.path()).await.passed);

        let fail = CommandCheck {
            program: "sh".into(),
            args: vec!["-c".into(), "echo broken >&2; exit 3".into()],
        };
        let result = fail.run(dir.path()).await;
        assert!(!result.passed);
        assert!(result.message.contains("exited with 3: broken"));
    }

    #[test]
    fn test_defaults_match_names() {
        let names: Vec<String> = default_validators().into_iter().map(|v| v.name).collect();
        assert_eq!(names, DEFAULT_VALIDATOR_NAMES);
    }
}
