//! Credential resolution for source adapters.
//!
//! Each adapter declares a [`CredentialScope`]: the environment variables it
//! consumes and the tool's default credential file. Resolution walks a fixed
//! priority chain and records every channel it looked at, so an auth
//! failure can tell the operator exactly what was checked:
//!
//! 1. inline secret in the model spec (always rejected, never used)
//! 2. environment variable (`auth.tokenEnv`, else the scope's names)
//! 3. token file (`auth.tokenFile`)
//! 4. the tool's default credential file, if present
//!
//! Finding nothing is not an error; public sources work without credentials.

use crate::error::{AuthFailure, FetchError};
use crate::sources::SourceKind;
use crate::spec::AuthSpec;
use reqwest::RequestBuilder;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// How a default credential file is consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultFileFormat {
    /// The file holds a bare token.
    Token,
    /// The delegated tool reads the file itself (e.g. `~/.aws/credentials`).
    ToolManaged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultCredentialFile {
    pub path: PathBuf,
    pub format: DefaultFileFormat,
}

/// Credentials an adapter is allowed to read.
#[derive(Debug, Clone, Default)]
pub struct CredentialScope {
    /// Env vars holding a bearer token, in priority order.
    pub bearer_env: Vec<&'static str>,
    /// Env var pair holding a username and password.
    pub basic_env: Option<(&'static str, &'static str)>,
    /// Env vars the delegated tool reads on its own.
    pub passthrough_env: Vec<&'static str>,
    pub default_file: Option<DefaultCredentialFile>,
    /// Operator-facing next step when access is refused.
    pub remediation: &'static str,
}

impl CredentialScope {
    /// Every environment variable name this scope may read.
    pub fn env_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.bearer_env.iter().map(|s| s.to_string()).collect();
        if let Some((user, password)) = self.basic_env {
            names.push(user.to_string());
            names.push(password.to_string());
        }
        names.extend(self.passthrough_env.iter().map(|s| s.to_string()));
        names
    }
}

/// A resolved secret.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Bearer(String),
    Basic { username: String, password: String },
    /// A credential file the delegated tool will read.
    ToolManaged(PathBuf),
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Bearer(_) => f.write_str("Bearer(<redacted>)"),
            Credential::Basic { username, .. } => {
                write!(f, "Basic {{ username: {:?}, password: <redacted> }}", username)
            }
            Credential::ToolManaged(path) => write!(f, "ToolManaged({:?})", path),
        }
    }
}

/// A place credentials may come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Channel {
    InlineSecret,
    EnvironmentVariable(String),
    TokenFile(Option<PathBuf>),
    DefaultCredentialFile(Option<PathBuf>),
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::InlineSecret => f.write_str("inline secret"),
            Channel::EnvironmentVariable(name) => write!(f, "environment variable ${}", name),
            Channel::TokenFile(Some(path)) => write!(f, "token file {}", path.display()),
            Channel::TokenFile(None) => f.write_str("token file"),
            Channel::DefaultCredentialFile(Some(path)) => {
                write!(f, "default credential file {}", path.display())
            }
            Channel::DefaultCredentialFile(None) => f.write_str("default credential file"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOutcome {
    Used,
    NotSet,
    NotFound,
    Empty,
    /// Present but refused by policy.
    Rejected,
    /// Not consulted because an earlier channel matched.
    Skipped,
    Unreadable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsultedChannel {
    pub channel: Channel,
    pub outcome: ChannelOutcome,
}

impl fmt::Display for ConsultedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let outcome = match &self.outcome {
            ChannelOutcome::Used => "used".to_string(),
            ChannelOutcome::NotSet => "not set".to_string(),
            ChannelOutcome::NotFound => "not found".to_string(),
            ChannelOutcome::Empty => "empty".to_string(),
            ChannelOutcome::Rejected => "rejected: secrets must not be inlined".to_string(),
            ChannelOutcome::Skipped => "skipped".to_string(),
            ChannelOutcome::Unreadable(err) => format!("unreadable: {}", err),
        };
        write!(f, "{} ({})", self.channel, outcome)
    }
}

/// Every channel consulted during one resolution, in priority order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialReport {
    pub channels: Vec<ConsultedChannel>,
}

impl CredentialReport {
    fn record(&mut self, channel: Channel, outcome: ChannelOutcome) {
        self.channels.push(ConsultedChannel { channel, outcome });
    }

    /// The channel that supplied the credential.
    pub fn used(&self) -> Option<&Channel> {
        self.channels
            .iter()
            .find(|c| c.outcome == ChannelOutcome::Used)
            .map(|c| &c.channel)
    }

    pub fn describe(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.to_string()).collect()
    }
}

/// Outcome of resolving one adapter's scope.
#[derive(Debug, Clone, Default)]
pub struct ResolvedCredentials {
    pub credential: Option<Credential>,
    pub report: CredentialReport,
    env_names: Vec<String>,
    remediation: String,
}

impl ResolvedCredentials {
    /// No credential, nothing consulted. For sources that never authenticate.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn bearer_token(&self) -> Option<&str> {
        match &self.credential {
            Some(Credential::Bearer(token)) => Some(token),
            _ => None,
        }
    }

    /// Attach the credential to an HTTP request.
    pub fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.credential {
            Some(Credential::Bearer(token)) => request.bearer_auth(token),
            Some(Credential::Basic { username, password }) => {
                request.basic_auth(username, Some(password))
            }
            _ => request,
        }
    }

    /// Classify an HTTP 401: missing if nothing was sent, else rejected.
    pub fn unauthorized(&self) -> AuthFailure {
        match self.credential {
            None | Some(Credential::ToolManaged(_)) => AuthFailure::Missing,
            Some(_) => AuthFailure::Rejected,
        }
    }

    /// Build the auth error for `kind`, listing every consulted channel.
    pub fn auth_error(
        &self,
        kind: SourceKind,
        failure: AuthFailure,
        detail: impl Into<String>,
    ) -> FetchError {
        let names = if self.env_names.is_empty() {
            "a token".to_string()
        } else {
            self.env_names
                .iter()
                .map(|n| format!("${}", n))
                .collect::<Vec<_>>()
                .join(" or ")
        };
        let remediation = match failure {
            AuthFailure::Missing => format!(
                "provide credentials via {} or auth.tokenFile; {}",
                names, self.remediation
            ),
            AuthFailure::Rejected => format!(
                "the credential from {} was refused; replace it with a valid one. {}",
                self.report
                    .used()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "the environment".to_string()),
                self.remediation
            ),
            AuthFailure::Insufficient => self.remediation.clone(),
        };

        FetchError::Auth {
            source_kind: kind.to_string(),
            failure,
            detail: detail.into(),
            channels: self.report.describe(),
            remediation,
        }
    }
}

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Resolves credentials for adapter scopes.
#[derive(Clone)]
pub struct CredentialResolver {
    env: EnvLookup,
}

impl Default for CredentialResolver {
    fn default() -> Self {
        Self::from_env()
    }
}

impl fmt::Debug for CredentialResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialResolver").finish_non_exhaustive()
    }
}

impl CredentialResolver {
    /// Read the process environment.
    pub fn from_env() -> Self {
        Self::with_env_lookup(|name| std::env::var(name).ok())
    }

    /// Use a custom environment lookup (tests, embedding hosts).
    pub fn with_env_lookup(lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            env: Arc::new(lookup),
        }
    }

    fn var(&self, name: &str) -> Option<String> {
        (self.env)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    pub fn resolve(&self, scope: &CredentialScope, auth: &AuthSpec) -> ResolvedCredentials {
        let mut report = CredentialReport::default();
        let mut credential: Option<Credential> = None;

        // 1. Inline secrets are refused by spec validation; record the state.
        report.record(
            Channel::InlineSecret,
            if auth.token.is_some() {
                ChannelOutcome::Rejected
            } else {
                ChannelOutcome::NotSet
            },
        );

        // 2. Environment variables
        let bearer_names: Vec<String> = match &auth.token_env {
            Some(name) => vec![name.clone()],
            None => scope.bearer_env.iter().map(|s| s.to_string()).collect(),
        };
        for name in &bearer_names {
            let outcome = if credential.is_some() {
                ChannelOutcome::Skipped
            } else if let Some(token) = self.var(name) {
                credential = Some(Credential::Bearer(token));
                ChannelOutcome::Used
            } else {
                ChannelOutcome::NotSet
            };
            report.record(Channel::EnvironmentVariable(name.clone()), outcome);
        }
        if let Some((user_var, password_var)) = scope.basic_env {
            let channel = Channel::EnvironmentVariable(format!("{} + ${}", user_var, password_var));
            let outcome = if credential.is_some() {
                ChannelOutcome::Skipped
            } else {
                match (self.var(user_var), self.var(password_var)) {
                    (Some(username), Some(password)) => {
                        credential = Some(Credential::Basic { username, password });
                        ChannelOutcome::Used
                    }
                    _ => ChannelOutcome::NotSet,
                }
            };
            report.record(channel, outcome);
        }

        // 3. Explicit token file
        match &auth.token_file {
            None => report.record(Channel::TokenFile(None), ChannelOutcome::NotSet),
            Some(path) => {
                let outcome = if credential.is_some() {
                    ChannelOutcome::Skipped
                } else {
                    match read_token(path) {
                        Ok(token) => {
                            credential = Some(Credential::Bearer(token));
                            ChannelOutcome::Used
                        }
                        Err(outcome) => outcome,
                    }
                };
                report.record(Channel::TokenFile(Some(path.clone())), outcome);
            }
        }

        // 4. Default credential file of the tool
        match &scope.default_file {
            None => report.record(Channel::DefaultCredentialFile(None), ChannelOutcome::NotSet),
            Some(file) => {
                let outcome = if credential.is_some() {
                    ChannelOutcome::Skipped
                } else {
                    match file.format {
                        DefaultFileFormat::Token => match read_token(&file.path) {
                            Ok(token) => {
                                credential = Some(Credential::Bearer(token));
                                ChannelOutcome::Used
                            }
                            Err(outcome) => outcome,
                        },
                        DefaultFileFormat::ToolManaged if file.path.is_file() => {
                            credential = Some(Credential::ToolManaged(file.path.clone()));
                            ChannelOutcome::Used
                        }
                        DefaultFileFormat::ToolManaged => ChannelOutcome::NotFound,
                    }
                };
                report.record(Channel::DefaultCredentialFile(Some(file.path.clone())), outcome);
            }
        }

        match report.used() {
            Some(channel) => debug!("Using credential from {}", channel),
            None => debug!("No credential found; continuing unauthenticated"),
        }

        ResolvedCredentials {
            credential,
            report,
            env_names: scope.env_names(),
            remediation: scope.remediation.to_string(),
        }
    }
}

fn read_token(path: &std::path::Path) -> std::result::Result<String, ChannelOutcome> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            let token = contents.trim_end().to_string();
            if token.is_empty() {
                Err(ChannelOutcome::Empty)
            } else {
                Ok(token)
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ChannelOutcome::NotFound),
        Err(e) => Err(ChannelOutcome::Unreadable(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn resolver(vars: &[(&str, &str)]) -> CredentialResolver {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        CredentialResolver::with_env_lookup(move |name| map.get(name).cloned())
    }

    fn scope() -> CredentialScope {
        CredentialScope {
            bearer_env: vec!["HF_TOKEN", "HUGGING_FACE_HUB_TOKEN"],
            remediation: "request access",
            ..Default::default()
        }
    }

    #[test]
    fn test_env_var_wins_over_files() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("token");
        std::fs::write(&file, "from-file\n").unwrap();

        let auth = AuthSpec {
            token_file: Some(file),
            ..Default::default()
        };
        let resolved = resolver(&[("HUGGING_FACE_HUB_TOKEN", "from-env")]).resolve(&scope(), &auth);

        assert_eq!(resolved.bearer_token(), Some("from-env"));
        assert_eq!(
            resolved.report.used(),
            Some(&Channel::EnvironmentVariable("HUGGING_FACE_HUB_TOKEN".into()))
        );
        let token_file = resolved
            .report
            .channels
            .iter()
            .find(|c| matches!(c.channel, Channel::TokenFile(_)))
            .unwrap();
        assert_eq!(token_file.outcome, ChannelOutcome::Skipped);
    }

    #[test]
    fn test_token_file_is_trimmed() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("token");
        std::fs::write(&file, "secret  \n").unwrap();

        let auth = AuthSpec {
            token_file: Some(file),
            ..Default::default()
        };
        let resolved = resolver(&[]).resolve(&scope(), &auth);
        assert_eq!(resolved.bearer_token(), Some("secret"));
    }

    #[test]
    fn test_custom_token_env_replaces_scope_names() {
        let auth = AuthSpec {
            token_env: Some("MY_TOKEN".into()),
            ..Default::default()
        };
        let resolved = resolver(&[("HF_TOKEN", "ignored"), ("MY_TOKEN", "mine")])
            .resolve(&scope(), &auth);
        assert_eq!(resolved.bearer_token(), Some("mine"));
    }

    #[test]
    fn test_basic_pair_requires_both_halves() {
        let scope = CredentialScope {
            basic_env: Some(("USER_VAR", "PASS_VAR")),
            ..Default::default()
        };
        let partial = resolver(&[("USER_VAR", "u")]).resolve(&scope, &AuthSpec::default());
        assert!(partial.credential.is_none());

        let full = resolver(&[("USER_VAR", "u"), ("PASS_VAR", "p")])
            .resolve(&scope, &AuthSpec::default());
        assert_eq!(
            full.credential,
            Some(Credential::Basic {
                username: "u".into(),
                password: "p".into()
            })
        );
    }

    #[test]
    fn test_default_file_used_last() {
        let dir = TempDir::new().unwrap();
        let default = dir.path().join("token");
        std::fs::write(&default, "cached").unwrap();
        let scope = CredentialScope {
            bearer_env: vec!["HF_TOKEN"],
            default_file: Some(DefaultCredentialFile {
                path: default.clone(),
                format: DefaultFileFormat::Token,
            }),
            ..Default::default()
        };

        let resolved = resolver(&[]).resolve(&scope, &AuthSpec::default());
        assert_eq!(resolved.bearer_token(), Some("cached"));
        assert_eq!(
            resolved.report.used(),
            Some(&Channel::DefaultCredentialFile(Some(default)))
        );
    }

    #[test]
    fn test_missing_credentials_error_lists_all_channels() {
        let resolved = resolver(&[]).resolve(&scope(), &AuthSpec::default());
        assert!(resolved.credential.is_none());
        assert_eq!(resolved.unauthorized(), AuthFailure::Missing);

        let err = resolved.auth_error(SourceKind::HuggingFace, AuthFailure::Missing, "HTTP 401");
        let text = err.to_string();
        assert!(text.contains("inline secret"));
        assert!(text.contains("environment variable $HF_TOKEN (not set)"));
        assert!(text.contains("token file (not set)"));
        assert!(text.contains("default credential file (not set)"));
        assert!(text.contains("$HF_TOKEN or $HUGGING_FACE_HUB_TOKEN"));
    }

    #[test]
    fn test_credential_debug_is_redacted() {
        let bearer = Credential::Bearer("hf_supersecret".into());
        assert!(!format!("{:?}", bearer).contains("supersecret"));
        let basic = Credential::Basic {
            username: "alice".into(),
            password: "hunter2".into(),
        };
        let text = format!("{:?}", basic);
        assert!(text.contains("alice"));
        assert!(!text.contains("hunter2"));
    }
}
