//! Post-fetch validation of a verified snapshot.
//!
//! Validators run in order against the published snapshot directory. Three
//! safety checks run by default ahead of caller validators: no pickled
//! weights, weight formats from an allowlist, and a parseable `config.json`.

pub mod builtin;
pub mod engine;
pub mod format;

pub use builtin::default_validators;
pub use engine::{Check, CheckResult, ValidationPipeline, Validator};
pub use format::{detect_format, inspect_file, WeightFormat};

use crate::config::ValidationConfig;
use crate::sources::is_safe_relpath;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// What a failed validator does to the fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailurePolicy {
    /// Stop and fail the fetch.
    #[default]
    Abort,
    /// Record, log and continue.
    Warn,
    /// Record only; does not count against `allPassed`.
    Skip,
}

fn default_true() -> bool {
    true
}

fn default_timeout_seconds() -> u64 {
    ValidationConfig::DEFAULT_TIMEOUT_SECS
}

/// The `validation` block of a model spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ValidationSpec {
    #[serde(default = "default_true")]
    pub enable: bool,
    #[serde(default)]
    pub skip_defaults: bool,
    #[serde(default)]
    pub validators: Vec<ValidatorSpec>,
    #[serde(default)]
    pub on_failure: FailurePolicy,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for ValidationSpec {
    fn default() -> Self {
        Self {
            enable: true,
            skip_defaults: false,
            validators: Vec::new(),
            on_failure: FailurePolicy::Abort,
            timeout_seconds: ValidationConfig::DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl ValidationSpec {
    /// Structural checks, appended to `errors` as `validation.*` messages.
    pub fn validate(&self, errors: &mut Vec<String>) {
        if self.timeout_seconds == 0 {
            errors.push("validation.timeoutSeconds: must be greater than 0".to_string());
        }

        let mut seen: HashSet<&str> = HashSet::new();
        if !self.skip_defaults {
            seen.extend(builtin::DEFAULT_VALIDATOR_NAMES);
        }
        for (i, validator) in self.validators.iter().enumerate() {
            let prefix = format!("validation.validators[{}]", i);
            if validator.name.trim().is_empty() {
                errors.push(format!("{}.name: must not be empty", prefix));
            } else if !seen.insert(validator.name.as_str()) {
                errors.push(format!(
                    "{}.name: duplicate validator name '{}'",
                    prefix, validator.name
                ));
            }
            if validator.timeout_seconds == Some(0) {
                errors.push(format!("{}.timeoutSeconds: must be greater than 0", prefix));
            }
            validator.check.validate(&format!("{}.check", prefix), errors);
        }
    }
}

/// One declared validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ValidatorSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub check: CheckSpec,
    /// Overrides `validation.onFailure`.
    #[serde(default)]
    pub on_failure: Option<FailurePolicy>,
    /// Overrides `validation.timeoutSeconds`.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// Declarative checks available from a spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum CheckSpec {
    /// External program; exit status 0 passes. The tree path is exported
    /// as `MODEL_DIR` and appended as the last argument.
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
    MaxTotalSize { bytes: u64 },
    MaxFileSize { bytes: u64 },
    RequiredFiles { paths: Vec<String> },
    ForbiddenExtensions { extensions: Vec<String> },
    AllowedFormats { formats: Vec<String> },
    JsonParses { path: String },
    NoPickle,
}

impl CheckSpec {
    fn validate(&self, prefix: &str, errors: &mut Vec<String>) {
        match self {
            CheckSpec::Command { program, .. } if program.trim().is_empty() => {
                errors.push(format!("{}.program: must not be empty", prefix));
            }
            CheckSpec::RequiredFiles { paths } => {
                if paths.is_empty() {
                    errors.push(format!("{}.paths: must not be empty", prefix));
                }
                for path in paths.iter().filter(|p| !is_safe_relpath(p)) {
                    errors.push(format!("{}.paths: '{}' is not a safe relative path", prefix, path));
                }
            }
            CheckSpec::ForbiddenExtensions { extensions } if extensions.is_empty() => {
                errors.push(format!("{}.extensions: must not be empty", prefix));
            }
            CheckSpec::AllowedFormats { formats } => {
                if formats.is_empty() {
                    errors.push(format!("{}.formats: must not be empty", prefix));
                }
                for format in formats.iter().filter(|f| WeightFormat::from_name(f).is_none()) {
                    errors.push(format!(
                        "{}.formats: unknown format '{}' (known: {})",
                        prefix,
                        format,
                        WeightFormat::ALL
                            .iter()
                            .map(|f| f.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    ));
                }
            }
            CheckSpec::JsonParses { path } if !is_safe_relpath(path) => {
                errors.push(format!("{}.path: '{}' is not a safe relative path", prefix, path));
            }
            _ => {}
        }
    }
}

/// Overall result of the validation stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ValidationStatus {
    Skipped,
    Passed,
    PassedWithWarnings,
    Aborted,
}

/// Result of one validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationOutcome {
    pub name: String,
    pub passed: bool,
    pub timed_out: bool,
    pub policy: FailurePolicy,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub status: ValidationStatus,
    /// False if any abort- or warn-policy validator failed.
    pub all_passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted_by: Option<String>,
    pub outcomes: Vec<ValidationOutcome>,
}

impl ValidationReport {
    pub fn skipped() -> Self {
        Self {
            status: ValidationStatus::Skipped,
            all_passed: true,
            aborted_by: None,
            outcomes: Vec::new(),
        }
    }
}
