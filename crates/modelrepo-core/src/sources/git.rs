//! Git repositories with large files in LFS or Xet storage.
//!
//! Both kinds share one adapter: resolve with `git ls-remote`, shallow-fetch
//! the exact commit into the fetch's work dir, then `git lfs pull`. For Xet
//! the LFS endpoint is pointed at the Xet service first.

use super::command::{run_tool, ToolOutput};
use super::{
    config_mismatch, filter_entries, is_commit_id, FetchContext, FileManifest, ManifestEntry,
    ResolvedRevision, SourceAdapter, SourceConfig, SourceKind,
};
use crate::credentials::CredentialScope;
use crate::error::{AuthFailure, FetchError, Result};
use async_trait::async_trait;
use std::io::Read;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};
use walkdir::WalkDir;

const GIT_PROGRAM: &str = "git";
const LFS_POINTER_PREFIX: &[u8] = b"version https://git-lfs.github.com/spec/v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flavor {
    Lfs,
    Xet,
}

/// Repository coordinates common to both flavors.
struct GitTarget<'a> {
    url: &'a str,
    rev: &'a str,
    subdir: Option<&'a str>,
    lfs_endpoint: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct GitAdapter {
    flavor: Flavor,
}

impl GitAdapter {
    pub fn lfs() -> Self {
        Self { flavor: Flavor::Lfs }
    }

    pub fn xet() -> Self {
        Self { flavor: Flavor::Xet }
    }

    fn target<'a>(&self, config: &'a SourceConfig) -> Result<GitTarget<'a>> {
        match (self.flavor, config) {
            (Flavor::Lfs, SourceConfig::GitLfs(c)) => Ok(GitTarget {
                url: &c.url,
                rev: &c.rev,
                subdir: c.subdir.as_deref(),
                lfs_endpoint: None,
            }),
            (Flavor::Xet, SourceConfig::GitXet(c)) => Ok(GitTarget {
                url: &c.url,
                rev: &c.rev,
                subdir: None,
                lfs_endpoint: Some(&c.endpoint),
            }),
            (_, other) => Err(config_mismatch(self.kind(), other)),
        }
    }

    /// `git` with prompts disabled and the bearer token as an extra header.
    fn git(&self, ctx: &FetchContext) -> Command {
        let mut command = Command::new(GIT_PROGRAM);
        command.env("GIT_TERMINAL_PROMPT", "0");
        if let Some(token) = ctx.credentials.bearer_token() {
            command
                .arg("-c")
                .arg(format!("http.extraHeader=Authorization: Bearer {}", token));
        }
        command
    }

    async fn run(&self, command: Command, target: &str, ctx: &FetchContext) -> Result<String> {
        let output = run_tool(command, GIT_PROGRAM, &ctx.cancel).await?;
        if output.success {
            Ok(output.stdout)
        } else {
            Err(classify_failure(self.kind(), &output, target, ctx))
        }
    }

    /// Shallow checkout of `commit` with LFS content materialized.
    async fn checkout(&self, target: &GitTarget<'_>, commit: &str, ctx: &FetchContext) -> Result<PathBuf> {
        let dir = ctx.work_dir.join("git").join(commit);
        if dir.exists() {
            // Leftover from a failed attempt.
            tokio::fs::remove_dir_all(&dir)
                .await
                .map_err(|e| FetchError::io_with_path(e, &dir))?;
        }
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| FetchError::io_with_path(e, &dir))?;

        let in_dir = |command: &mut Command| {
            command.current_dir(&dir);
        };

        let mut init = self.git(ctx);
        init.args(["init", "-q"]);
        in_dir(&mut init);
        self.run(init, target.url, ctx).await?;

        let mut remote = self.git(ctx);
        remote.args(["remote", "add", "origin", target.url]);
        in_dir(&mut remote);
        self.run(remote, target.url, ctx).await?;

        if let Some(endpoint) = target.lfs_endpoint {
            let mut config = self.git(ctx);
            config.args(["config", "lfs.url", endpoint]);
            in_dir(&mut config);
            self.run(config, target.url, ctx).await?;
        }

        info!("Fetching {} at {}", target.url, commit);
        let mut fetch = self.git(ctx);
        fetch.args(["fetch", "-q", "--depth", "1", "origin", commit]);
        in_dir(&mut fetch);
        self.run(fetch, target.url, ctx).await?;

        let mut checkout = self.git(ctx);
        checkout
            .args(["-c", "advice.detachedHead=false", "checkout", "-q", "FETCH_HEAD"])
            .env("GIT_LFS_SKIP_SMUDGE", "1");
        in_dir(&mut checkout);
        self.run(checkout, target.url, ctx).await?;

        let mut pull = self.git(ctx);
        pull.args(["lfs", "pull"]);
        in_dir(&mut pull);
        self.run(pull, target.url, ctx).await?;

        let mut head = self.git(ctx);
        head.args(["rev-parse", "HEAD"]);
        in_dir(&mut head);
        let head = self.run(head, target.url, ctx).await?;
        if head.trim() != commit {
            return Err(FetchError::Command {
                program: GIT_PROGRAM.to_string(),
                message: format!("checked out {} but expected {}", head.trim(), commit),
            });
        }
        Ok(dir)
    }
}

/// Pick the commit for `rev` from `git ls-remote` output.
///
/// Branches win over tags; annotated tags use their peeled commit.
fn pick_ref(listing: &str, rev: &str) -> Option<String> {
    let refs: Vec<(&str, &str)> = listing
        .lines()
        .filter_map(|line| line.split_once('\t'))
        .map(|(sha, name)| (sha.trim(), name.trim()))
        .collect();
    let find = |wanted: &str| {
        refs.iter()
            .find(|(_, name)| *name == wanted)
            .map(|(sha, _)| sha.to_string())
    };
    find(&format!("refs/heads/{}", rev))
        .or_else(|| find(&format!("refs/tags/{}^{{}}", rev)))
        .or_else(|| find(&format!("refs/tags/{}", rev)))
        .or_else(|| find(rev))
}

/// Map `git` stderr to a typed error.
fn classify_failure(kind: SourceKind, output: &ToolOutput, target: &str, ctx: &FetchContext) -> FetchError {
    let stderr = output.stderr.to_ascii_lowercase();
    let detail = output.summary();
    let has = |needles: &[&str]| needles.iter().any(|n| stderr.contains(n));

    if has(&["authentication failed", "could not read username", "terminal prompts disabled", "401"]) {
        ctx.credentials.auth_error(kind, ctx.credentials.unauthorized(), detail)
    } else if has(&["403", "access denied", "permission denied"]) {
        ctx.credentials.auth_error(kind, AuthFailure::Insufficient, detail)
    } else if has(&["repository not found", "not found", "couldn't find remote ref", "no such ref"]) {
        FetchError::RevisionNotFound {
            source_kind: kind.to_string(),
            revision: target.to_string(),
            hint: "check the repository URL and that the revision exists".to_string(),
        }
    } else if has(&[
        "could not resolve host",
        "connection timed out",
        "connection reset",
        "failed to connect",
        "early eof",
        "the remote end hung up",
        "502",
        "503",
    ]) {
        FetchError::Network {
            message: format!("git: {}", detail),
            status: None,
            cause: None,
        }
    } else {
        FetchError::Command {
            program: GIT_PROGRAM.to_string(),
            message: detail,
        }
    }
}

/// True if `path` still holds an LFS pointer instead of its content.
fn is_lfs_pointer(path: &Path) -> bool {
    let mut head = [0u8; LFS_POINTER_PREFIX.len()];
    std::fs::File::open(path)
        .and_then(|mut f| f.read_exact(&mut head))
        .map(|_| head == LFS_POINTER_PREFIX)
        .unwrap_or(false)
}

/// Regular files below `root`, skipping `.git`.
fn walk_checkout(root: &Path) -> Result<Vec<ManifestEntry>> {
    let mut entries = Vec::new();
    for entry in WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git")
    {
        let entry = entry.map_err(|e| FetchError::Io {
            message: format!("Failed to walk checkout: {}", e),
            path: e.path().map(Path::to_path_buf),
            source: None,
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let relpath = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if is_lfs_pointer(entry.path()) {
            return Err(FetchError::Command {
                program: GIT_PROGRAM.to_string(),
                message: format!(
                    "{} is still an LFS pointer after `git lfs pull`; check LFS access",
                    relpath
                ),
            });
        }
        let size = entry.metadata().map(|m| m.len()).ok();
        entries.push(ManifestEntry {
            path: relpath,
            locator: entry.path().to_string_lossy().into_owned(),
            size,
            digest: None,
        });
    }
    Ok(entries)
}

#[async_trait]
impl SourceAdapter for GitAdapter {
    fn kind(&self) -> SourceKind {
        match self.flavor {
            Flavor::Lfs => SourceKind::GitLfs,
            Flavor::Xet => SourceKind::GitXet,
        }
    }

    fn credential_scope(&self) -> CredentialScope {
        match self.flavor {
            Flavor::Lfs => CredentialScope {
                bearer_env: vec!["GIT_TOKEN"],
                remediation: "set GIT_TOKEN to a token with read access to the repository",
                ..Default::default()
            },
            Flavor::Xet => CredentialScope {
                bearer_env: vec!["XET_TOKEN", "GIT_TOKEN"],
                remediation: "set XET_TOKEN to a token with read access to the repository and \
                              its Xet storage",
                ..Default::default()
            },
        }
    }

    async fn resolve_revision(
        &self,
        config: &SourceConfig,
        ctx: &FetchContext,
    ) -> Result<ResolvedRevision> {
        let target = self.target(config)?;
        if is_commit_id(target.rev) {
            return Ok(ResolvedRevision::new(target.rev, target.rev));
        }

        let mut command = self.git(ctx);
        command.args(["ls-remote", target.url, target.rev]);
        let listing = self.run(command, target.url, ctx).await?;
        let sha = pick_ref(&listing, target.rev).ok_or_else(|| FetchError::RevisionNotFound {
            source_kind: self.kind().to_string(),
            revision: target.rev.to_string(),
            hint: format!("no branch or tag named '{}' on {}", target.rev, target.url),
        })?;
        debug!("{}@{} is {}", target.url, target.rev, sha);
        Ok(ResolvedRevision::new(sha, target.rev))
    }

    async fn list_files(
        &self,
        config: &SourceConfig,
        revision: &ResolvedRevision,
        ctx: &FetchContext,
    ) -> Result<FileManifest> {
        let target = self.target(config)?;
        let checkout = self.checkout(&target, &revision.id, ctx).await?;
        let root = match target.subdir {
            Some(subdir) => checkout.join(subdir),
            None => checkout,
        };
        if !root.is_dir() {
            return Err(FetchError::EmptyResult {
                source_kind: self.kind().to_string(),
                target: format!("{}@{}", target.url, revision.id),
                reason: crate::error::EmptyReason::SourceEmpty,
            });
        }

        let walk_root = root.clone();
        let entries = tokio::task::spawn_blocking(move || walk_checkout(&walk_root))
            .await
            .map_err(|e| FetchError::Other(format!("checkout walk panicked: {}", e)))??;

        Ok(FileManifest::new(filter_entries(
            self.kind(),
            &format!("{}@{}", target.url, revision.id),
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
        ctx.cancel.check()?;
        let written = tokio::fs::copy(&entry.locator, destination)
            .await
            .map_err(|e| FetchError::io_with_path(e, &entry.locator))?;
        ctx.progress.record(written);
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{test_context, GitLfsSource, GitXetSource};
    use tempfile::TempDir;

    const LISTING: &str = "\
1111111111111111111111111111111111111111\trefs/heads/main
2222222222222222222222222222222222222222\trefs/tags/v1
3333333333333333333333333333333333333333\trefs/tags/v1^{}
4444444444444444444444444444444444444444\trefs/tags/release
";

    #[test]
    fn test_pick_ref_prefers_branches_then_peeled_tags() {
        assert_eq!(pick_ref(LISTING, "main").unwrap(), "1".repeat(40));
        assert_eq!(pick_ref(LISTING, "v1").unwrap(), "3".repeat(40));
        assert_eq!(pick_ref(LISTING, "release").unwrap(), "4".repeat(40));
        assert!(pick_ref(LISTING, "missing").is_none());
    }

    #[test]
    fn test_walk_skips_git_dir_and_detects_pointers() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".git/objects")).unwrap();
        std::fs::write(dir.path().join(".git/HEAD"), "ref: refs/heads/main").unwrap();
        std::fs::create_dir_all(dir.path().join("onnx")).unwrap();
        std::fs::write(dir.path().join("config.json"), "{}").unwrap();
        std::fs::write(dir.path().join("onnx/model.onnx"), b"\x08\x07").unwrap();

        let entries = walk_checkout(dir.path()).unwrap();
        let paths: Vec<_> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["config.json", "onnx/model.onnx"]);

        std::fs::write(
            dir.path().join("big.bin"),
            "version https://git-lfs.github.com/spec/v1\noid sha256:abc\nsize 10\n",
        )
        .unwrap();
        assert!(walk_checkout(dir.path()).is_err());
    }

    #[test]
    fn test_flavor_checks_config_kind() {
        let lfs = SourceConfig::GitLfs(GitLfsSource {
            url: "https://example.com/repo.git".into(),
            rev: "main".into(),
            subdir: None,
        });
        let xet = SourceConfig::GitXet(GitXetSource {
            url: "https://example.com/repo.git".into(),
            rev: "main".into(),
            endpoint: "https://xet.example.com".into(),
        });
        assert!(GitAdapter::lfs().target(&lfs).is_ok());
        assert!(GitAdapter::lfs().target(&xet).is_err());
        assert_eq!(
            GitAdapter::xet().target(&xet).unwrap().lfs_endpoint,
            Some("https://xet.example.com")
        );
    }

    #[test]
    fn test_stderr_classification() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(dir.path());
        let failed = |stderr: &str| ToolOutput {
            success: false,
            code: Some(128),
            stdout: String::new(),
            stderr: stderr.into(),
        };

        let err = classify_failure(
            SourceKind::GitLfs,
            &failed("fatal: could not read Username for 'https://example.com': terminal prompts disabled"),
            "repo",
            &ctx,
        );
        assert!(matches!(err, FetchError::Auth { failure: AuthFailure::Missing, .. }));

        let err = classify_failure(
            SourceKind::GitLfs,
            &failed("fatal: repository 'https://example.com/x.git/' not found"),
            "repo",
            &ctx,
        );
        assert!(matches!(err, FetchError::RevisionNotFound { .. }));

        let err = classify_failure(
            SourceKind::GitLfs,
            &failed("fatal: unable to access: Could not resolve host: example.com"),
            "repo",
            &ctx,
        );
        assert!(err.is_retryable());
    }
}
