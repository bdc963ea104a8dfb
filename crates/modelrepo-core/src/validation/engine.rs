//! Sequential validator pipeline.

use super::builtin;
use super::{
    FailurePolicy, ValidationOutcome, ValidationReport, ValidationSpec, ValidationStatus,
};
use crate::cancel::CancellationToken;
use crate::error::{FetchError, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Verdict of one check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub passed: bool,
    pub message: String,
}

impl CheckResult {
    pub fn pass(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
        }
    }
}

/// A check over a snapshot directory.
///
/// Plain functions and closures taking `&Path` implement this too. They run
/// on the blocking pool so the pipeline's timeout can give up on them.
#[async_trait]
pub trait Check: Send + Sync {
    async fn run(&self, tree: &Path) -> CheckResult;
}

#[async_trait]
impl<F> Check for F
where
    F: Fn(&Path) -> CheckResult + Clone + Send + Sync + 'static,
{
    async fn run(&self, tree: &Path) -> CheckResult {
        let check = self.clone();
        let tree = tree.to_path_buf();
        tokio::task::spawn_blocking(move || check(&tree))
            .await
            .unwrap_or_else(|e| CheckResult::fail(format!("check panicked: {}", e)))
    }
}

/// A named check with its failure policy and time bound.
#[derive(Clone)]
pub struct Validator {
    pub name: String,
    pub description: String,
    pub check: Arc<dyn Check>,
    /// Falls back to the model spec's `onFailure`.
    pub on_failure: Option<FailurePolicy>,
    /// Falls back to the model spec's `timeoutSeconds`.
    pub timeout: Option<Duration>,
}

impl fmt::Debug for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Validator")
            .field("name", &self.name)
            .field("on_failure", &self.on_failure)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Validator {
    pub fn new(name: impl Into<String>, check: impl Check + 'static) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            check: Arc::new(check),
            on_failure: None,
            timeout: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.on_failure = Some(policy);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Ordered validators plus the defaults.
#[derive(Debug, Clone)]
pub struct ValidationPipeline {
    enabled: bool,
    validators: Vec<Validator>,
    default_policy: FailurePolicy,
    default_timeout: Duration,
}

impl ValidationPipeline {
    /// Defaults (unless skipped), then spec validators, then `extra`.
    pub fn from_spec(spec: &ValidationSpec, extra: &[Validator]) -> Result<Self> {
        let mut validators = Vec::new();
        if !spec.skip_defaults {
            validators.extend(builtin::default_validators());
        }
        validators.extend(spec.validators.iter().map(builtin::from_spec));
        validators.extend(extra.iter().cloned());

        let mut seen = HashSet::new();
        let duplicates: Vec<String> = validators
            .iter()
            .filter(|v| !seen.insert(v.name.as_str()))
            .map(|v| format!("validation: duplicate validator name '{}'", v.name))
            .collect();
        if !duplicates.is_empty() {
            return Err(FetchError::Config { errors: duplicates });
        }

        Ok(Self {
            enabled: spec.enable,
            validators,
            default_policy: spec.on_failure,
            default_timeout: Duration::from_secs(spec.timeout_seconds),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Validator names in run order.
    pub fn names(&self) -> Vec<&str> {
        self.validators.iter().map(|v| v.name.as_str()).collect()
    }

    /// Run every validator against `tree`, stopping at the first abort.
    ///
    /// An abort is reported in the returned report, not as an error; only
    /// cancellation is an error.
    pub async fn run(&self, tree: &Path, cancel: &CancellationToken) -> Result<ValidationReport> {
        if !self.enabled {
            info!("Validation disabled; skipping");
            return Ok(ValidationReport::skipped());
        }

        let mut outcomes = Vec::with_capacity(self.validators.len());
        let mut all_passed = true;

        for validator in &self.validators {
            cancel.check()?;
            let policy = validator.on_failure.unwrap_or(self.default_policy);
            let limit = validator.timeout.unwrap_or(self.default_timeout);
            debug!("Running validator {} (timeout {:?})", validator.name, limit);

            let result = tokio::select! {
                result = tokio::time::timeout(limit, validator.check.run(tree)) => result,
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            };
            let outcome = match result {
                Ok(check) => ValidationOutcome {
                    name: validator.name.clone(),
                    passed: check.passed,
                    timed_out: false,
                    policy,
                    message: check.message,
                },
                Err(_) => ValidationOutcome {
                    name: validator.name.clone(),
                    passed: false,
                    timed_out: true,
                    policy,
                    message: format!("timed out after {}s", limit.as_secs_f64()),
                },
            };

            if outcome.passed {
                debug!("Validator {} passed", outcome.name);
                outcomes.push(outcome);
                continue;
            }

            match policy {
                FailurePolicy::Abort => {
                    warn!("Validator {} failed: {}", outcome.name, outcome.message);
                    let name = outcome.name.clone();
                    outcomes.push(outcome);
                    return Ok(ValidationReport {
                        status: ValidationStatus::Aborted,
                        all_passed: false,
                        aborted_by: Some(name),
                        outcomes,
                    });
                }
                FailurePolicy::Warn => {
                    warn!(
                        "Validator {} failed (continuing): {}",
                        outcome.name, outcome.message
                    );
                    all_passed = false;
                }
                FailurePolicy::Skip => {
                    debug!("Validator {} failed (ignored): {}", outcome.name, outcome.message);
                }
            }
            outcomes.push(outcome);
        }

        let status = if all_passed {
            ValidationStatus::Passed
        } else {
            ValidationStatus::PassedWithWarnings
        };
        info!("Validation finished: {:?}, {} validator(s)", status, outcomes.len());
        Ok(ValidationReport {
            status,
            all_passed,
            aborted_by: None,
            outcomes,
        })
    }
}
