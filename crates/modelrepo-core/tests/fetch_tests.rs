//! End-to-end tests of the fetch pipeline against the mock source.

use modelrepo_core::sources::{MockAdapter, MockSource};
use modelrepo_core::validation::{CheckSpec, ValidatorSpec};
use modelrepo_core::{
    CancellationToken, CheckResult, CredentialResolver, FailurePolicy, FetchError, FetchMetadata,
    Fetcher, HashAlgorithm, ModelSpec, SourceSelection, ValidationStatus, Validator,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const PLACEHOLDER: &str =
    "sha256:0000000000000000000000000000000000000000000000000000000000000000";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn fetcher(root: &Path, mock: &Arc<MockAdapter>) -> Fetcher {
    init_tracing();
    Fetcher::builder(root)
        .with_adapter(mock.clone())
        .with_credential_resolver(CredentialResolver::with_env_lookup(|_| None))
        .build()
        .unwrap()
}

fn mock_spec(name: &str, source: MockSource) -> ModelSpec {
    ModelSpec {
        name: name.to_string(),
        source: SourceSelection {
            mock: Some(source),
            ..Default::default()
        },
        expected_hash: Some(PLACEHOLDER.to_string()),
        ..Default::default()
    }
}

fn files(entries: &[(&str, &str)]) -> MockSource {
    MockSource {
        files: Some(
            entries
                .iter()
                .map(|(path, contents)| (path.to_string(), contents.to_string()))
                .collect::<BTreeMap<_, _>>(),
        ),
        ..Default::default()
    }
}

/// Run with a placeholder hash and return the actual one from the mismatch.
async fn actual_hash(fetcher: &Fetcher, spec: &ModelSpec) -> String {
    let mut unpinned = spec.clone();
    unpinned.expected_hash = Some(PLACEHOLDER.to_string());
    match fetcher.run(&unpinned).await {
        Err(FetchError::HashMismatch { actual, .. }) => actual,
        other => panic!("expected hash mismatch, got {:?}", other.map(|o| o.raw.tree_hash)),
    }
}

async fn pinned(fetcher: &Fetcher, mut spec: ModelSpec) -> ModelSpec {
    spec.expected_hash = Some(actual_hash(fetcher, &spec).await);
    spec
}

fn dir_names(dir: &Path) -> Vec<String> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    }
}

#[tokio::test]
async fn test_hash_mismatch_publishes_nothing() {
    let store = TempDir::new().unwrap();
    let mock = Arc::new(MockAdapter::new());
    let fetcher = fetcher(store.path(), &mock);
    let spec = mock_spec("org/demo", MockSource::default());

    let err = fetcher.run(&spec).await.unwrap_err();
    let FetchError::HashMismatch {
        expected, actual, ..
    } = &err
    else {
        panic!("expected hash mismatch, got {}", err);
    };
    assert_eq!(expected, PLACEHOLDER);
    assert!(actual.starts_with("sha256:"));
    assert!(err.to_string().contains(actual.as_str()));

    let artifact = store.path().join("models--org--demo");
    assert!(dir_names(&artifact.join("refs")).is_empty());
    assert!(dir_names(&artifact.join("snapshots")).is_empty());
    assert!(!artifact.join("fetch-metadata.json").exists());
    assert!(dir_names(&store.path().join("tmp")).is_empty());
}

#[tokio::test]
async fn test_fetch_is_deterministic_across_stores() {
    let spec = mock_spec("org/demo", MockSource::default());

    let first = TempDir::new().unwrap();
    let second = TempDir::new().unwrap();
    let mock = Arc::new(MockAdapter::new());
    let a = actual_hash(&fetcher(first.path(), &mock), &spec).await;
    let b = actual_hash(&fetcher(second.path(), &mock), &spec).await;
    assert_eq!(a, b);

    let blake = Fetcher::builder(first.path().join("blake"))
        .algorithm(HashAlgorithm::Blake3)
        .with_adapter(mock.clone())
        .build()
        .unwrap();
    let mut blake_spec = spec.clone();
    blake_spec.expected_hash = Some(format!("blake3:{}", "0".repeat(64)));
    match blake.run(&blake_spec).await {
        Err(FetchError::HashMismatch { actual, .. }) => assert!(actual.starts_with("blake3:")),
        other => panic!("expected hash mismatch, got {:?}", other.map(|o| o.raw.tree_hash)),
    }
}

#[tokio::test]
async fn test_successful_fetch_produces_hub_layout() {
    let store = TempDir::new().unwrap();
    let mock = Arc::new(MockAdapter::new());
    let fetcher = fetcher(store.path(), &mock);
    let mut spec = pinned(&fetcher, mock_spec("org/demo", MockSource::default())).await;
    spec.integration.ref_names = vec!["stable".to_string()];
    spec.metadata
        .insert("license".to_string(), "apache-2.0".to_string());

    let outcome = fetcher.run(&spec).await.unwrap();
    let root = store.path().join("models--org--demo");
    assert_eq!(outcome.artifact.root, root);
    assert_eq!(outcome.raw.snapshot_dir, outcome.artifact.snapshot_dir);
    assert_eq!(
        outcome.artifact.snapshot_dir,
        root.join("snapshots").join(&outcome.raw.revision.id)
    );

    let main = std::fs::read_to_string(root.join("refs/main")).unwrap();
    assert_eq!(main, outcome.raw.revision.id);
    let stable = std::fs::read_to_string(root.join("refs/stable")).unwrap();
    assert_eq!(stable, outcome.raw.revision.id);

    let config = std::fs::read_to_string(outcome.artifact.snapshot_dir.join("config.json")).unwrap();
    assert!(config.contains("MockModel"));
    assert_eq!(dir_names(&store.path().join("blobs")).len(), 2);

    let metadata = FetchMetadata::load(&outcome.artifact.metadata_path)
        .unwrap()
        .unwrap();
    assert_eq!(metadata, outcome.metadata);
    assert_eq!(metadata.tree_hash, spec.expected_hash.clone().unwrap());
    assert_eq!(metadata.file_count, 2);
    assert_eq!(metadata.refs, vec!["main", "stable"]);
    assert_eq!(metadata.validation.status, ValidationStatus::Passed);
    assert_eq!(metadata.validation.outcomes.len(), 3);
    assert_eq!(metadata.metadata["license"], "apache-2.0");
}

#[tokio::test]
async fn test_refetch_reuses_cached_blobs() {
    let store = TempDir::new().unwrap();
    let mock = Arc::new(MockAdapter::new());
    let fetcher = fetcher(store.path(), &mock);
    let spec = pinned(&fetcher, mock_spec("org/demo", MockSource::default())).await;

    let first = fetcher.run(&spec).await.unwrap();
    let downloads = mock.download_count();
    let second = fetcher.run(&spec).await.unwrap();

    assert_eq!(mock.download_count(), downloads);
    assert_eq!(first.raw.tree_hash, second.raw.tree_hash);
    assert_eq!(first.artifact.snapshot_dir, second.artifact.snapshot_dir);
}

#[tokio::test]
async fn test_identical_files_are_shared_between_models() {
    let store = TempDir::new().unwrap();
    let mock = Arc::new(MockAdapter::new());
    let fetcher = fetcher(store.path(), &mock);

    let a = pinned(&fetcher, mock_spec("org/a", MockSource::default())).await;
    let b = pinned(&fetcher, mock_spec("org/b", MockSource::default())).await;
    fetcher.run(&a).await.unwrap();
    fetcher.run(&b).await.unwrap();

    assert_eq!(dir_names(&store.path().join("blobs")).len(), 2);
    assert!(store.path().join("models--org--a/refs/main").is_file());
    assert!(store.path().join("models--org--b/refs/main").is_file());
}

fn required_tokenizer(policy: FailurePolicy) -> ValidatorSpec {
    ValidatorSpec {
        name: "has-tokenizer".to_string(),
        description: String::new(),
        check: CheckSpec::RequiredFiles {
            paths: vec!["tokenizer.json".to_string()],
        },
        on_failure: Some(policy),
        timeout_seconds: None,
    }
}

#[tokio::test]
async fn test_abort_validator_fails_fetch_but_keeps_raw_tree() {
    let store = TempDir::new().unwrap();
    let mock = Arc::new(MockAdapter::new());
    let fetcher = fetcher(store.path(), &mock);
    let mut spec = pinned(&fetcher, mock_spec("org/demo", MockSource::default())).await;
    spec.validation.validators = vec![required_tokenizer(FailurePolicy::Abort)];

    let err = fetcher.run(&spec).await.unwrap_err();
    let FetchError::ValidationFailed {
        validator,
        message,
        raw_snapshot,
    } = err
    else {
        panic!("expected validation failure");
    };
    assert_eq!(validator, "has-tokenizer");
    assert!(message.contains("tokenizer.json"));
    assert!(raw_snapshot.join("config.json").is_file());
    assert!(dir_names(&store.path().join("models--org--demo/refs")).is_empty());
    assert!(!store
        .path()
        .join("models--org--demo/fetch-metadata.json")
        .exists());
}

#[tokio::test]
async fn test_aborted_refetch_keeps_refs_on_validated_tree() {
    let store = TempDir::new().unwrap();
    let mock = Arc::new(MockAdapter::new());
    let fetcher = fetcher(store.path(), &mock);
    let root = store.path().join("models--org--demo");

    let good = pinned(&fetcher, mock_spec("org/demo", files(&[("config.json", "{}")]))).await;
    let first = fetcher.run(&good).await.unwrap();
    let good_ref = std::fs::read_to_string(root.join("refs/main")).unwrap();

    let mut tainted = pinned(
        &fetcher,
        mock_spec(
            "org/demo",
            files(&[("config.json", "{}"), ("notes.txt", "not a weight")]),
        ),
    )
    .await;
    tainted.validation.validators = vec![ValidatorSpec {
        name: "no-text".to_string(),
        description: String::new(),
        check: CheckSpec::ForbiddenExtensions {
            extensions: vec!["txt".to_string()],
        },
        on_failure: Some(FailurePolicy::Abort),
        timeout_seconds: None,
    }];

    let err = fetcher.run(&tainted).await.unwrap_err();
    let FetchError::ValidationFailed { raw_snapshot, .. } = err else {
        panic!("expected validation failure");
    };
    assert!(raw_snapshot.join("notes.txt").is_file());

    assert_eq!(
        std::fs::read_to_string(root.join("refs/main")).unwrap(),
        good_ref
    );
    assert!(!root.join("snapshots").join(&good_ref).join("notes.txt").exists());
    let metadata = FetchMetadata::load(&first.artifact.metadata_path)
        .unwrap()
        .unwrap();
    assert_eq!(metadata.resolved_revision, good_ref);
}

#[tokio::test]
async fn test_same_revision_with_new_content_keeps_old_snapshot() {
    let store = TempDir::new().unwrap();
    let mock = Arc::new(MockAdapter::new());
    let fetcher = fetcher(store.path(), &mock);
    let fixed = |entries: &[(&str, &str)]| {
        let mut source = files(entries);
        source.revision = Some("a".repeat(40));
        mock_spec("org/demo", source)
    };

    let first = pinned(&fetcher, fixed(&[("a.json", "{}")])).await;
    let first = fetcher.run(&first).await.unwrap();
    let second = pinned(&fetcher, fixed(&[("b.json", "[]")])).await;
    let second = fetcher.run(&second).await.unwrap();

    assert_ne!(first.artifact.snapshot_dir, second.artifact.snapshot_dir);
    assert!(first.artifact.snapshot_dir.join("a.json").is_file());
    assert!(!first.artifact.snapshot_dir.join("b.json").exists());
    assert!(second.artifact.snapshot_dir.join("b.json").is_file());

    let main = std::fs::read_to_string(store.path().join("models--org--demo/refs/main")).unwrap();
    assert_eq!(
        second.artifact.snapshot_dir.file_name().unwrap().to_str().unwrap(),
        main
    );
}

#[tokio::test]
async fn test_warn_validator_records_and_continues() {
    let store = TempDir::new().unwrap();
    let mock = Arc::new(MockAdapter::new());
    let fetcher = fetcher(store.path(), &mock);
    let mut spec = pinned(&fetcher, mock_spec("org/demo", MockSource::default())).await;
    spec.validation.validators = vec![required_tokenizer(FailurePolicy::Warn)];

    let outcome = fetcher.run(&spec).await.unwrap();
    let report = &outcome.metadata.validation;
    assert_eq!(report.status, ValidationStatus::PassedWithWarnings);
    assert!(!report.all_passed);
    let names: Vec<&str> = report.outcomes.iter().map(|o| o.name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "no-pickle",
            "weight-format-allowlist",
            "manifest-parses",
            "has-tokenizer"
        ]
    );
}

#[tokio::test]
async fn test_programmatic_validator_runs_last() {
    let store = TempDir::new().unwrap();
    let mock = Arc::new(MockAdapter::new());
    let fetcher = Fetcher::builder(store.path())
        .with_adapter(mock.clone())
        .with_credential_resolver(CredentialResolver::with_env_lookup(|_| None))
        .with_validator(Validator::new("readme-present", |tree: &Path| {
            if tree.join("README.md").is_file() {
                CheckResult::pass("found")
            } else {
                CheckResult::fail("README.md missing")
            }
        }))
        .build()
        .unwrap();

    let spec = pinned(
        &fetcher,
        mock_spec("org/docs", files(&[("README.md", "# demo"), ("config.json", "{}")])),
    )
    .await;
    let outcome = fetcher.run(&spec).await.unwrap();
    let last = outcome.metadata.validation.outcomes.last().unwrap();
    assert_eq!(last.name, "readme-present");
    assert!(last.passed);
}

#[tokio::test]
async fn test_default_validators_reject_broken_manifest() {
    let store = TempDir::new().unwrap();
    let mock = Arc::new(MockAdapter::new());
    let fetcher = fetcher(store.path(), &mock);
    let spec = pinned(
        &fetcher,
        mock_spec("org/broken", files(&[("config.json", "{not json")])),
    )
    .await;

    let err = fetcher.run(&spec).await.unwrap_err();
    assert!(matches!(
        err,
        FetchError::ValidationFailed { ref validator, .. } if validator == "manifest-parses"
    ));

    let mut skipped = spec.clone();
    skipped.validation.skip_defaults = true;
    let outcome = fetcher.run(&skipped).await.unwrap();
    assert!(outcome.metadata.validation.outcomes.is_empty());
}

#[tokio::test]
async fn test_invalid_specs_rejected_before_any_download() {
    let store = TempDir::new().unwrap();
    let mock = Arc::new(MockAdapter::new());
    let fetcher = fetcher(store.path(), &mock);

    let mut none = mock_spec("org/demo", MockSource::default());
    none.source = SourceSelection::default();
    let err = fetcher.run(&none).await.unwrap_err();
    assert!(matches!(err, FetchError::Config { .. }));
    assert!(err.to_string().contains("no source specified"));

    let two = ModelSpec::from_json(&format!(
        r#"{{
            "name": "org/demo",
            "source": {{
                "mock": {{}},
                "huggingface": {{ "repo": "org/demo" }}
            }},
            "expectedHash": "{}"
        }}"#,
        PLACEHOLDER
    ))
    .unwrap();
    let text = fetcher.run(&two).await.unwrap_err().to_string();
    assert!(text.contains("huggingface"));
    assert!(text.contains("mock"));

    let mut unhashed = mock_spec("org/demo", MockSource::default());
    unhashed.expected_hash = None;
    let text = fetcher.run(&unhashed).await.unwrap_err().to_string();
    assert!(text.contains("expectedHash"));

    assert_eq!(mock.download_count(), 0);
}

#[tokio::test]
async fn test_missing_credentials_list_consulted_channels() {
    let store = TempDir::new().unwrap();
    let mock = Arc::new(MockAdapter::new());
    let fetcher = fetcher(store.path(), &mock);
    let source = MockSource {
        require_auth: true,
        ..Default::default()
    };

    let err = fetcher
        .run(&mock_spec("org/private", source.clone()))
        .await
        .unwrap_err();
    let FetchError::Auth { channels, .. } = &err else {
        panic!("expected auth error, got {}", err);
    };
    assert!(channels
        .iter()
        .any(|c| c.contains("$MOCK_SOURCE_TOKEN") && c.contains("not set")));
    assert!(err.to_string().contains("Next step"));

    let authorized = Fetcher::builder(store.path())
        .with_adapter(mock.clone())
        .with_credential_resolver(CredentialResolver::with_env_lookup(|name| {
            (name == "MOCK_SOURCE_TOKEN").then(|| "secret".to_string())
        }))
        .build()
        .unwrap();
    let spec = pinned(&authorized, mock_spec("org/private", source)).await;
    authorized.run(&spec).await.unwrap();
}

#[tokio::test]
async fn test_cancelled_fetch_leaves_no_staging() {
    let store = TempDir::new().unwrap();
    let mock = Arc::new(MockAdapter::new());
    let fetcher = fetcher(store.path(), &mock);
    let spec = pinned(&fetcher, mock_spec("org/demo", MockSource::default())).await;

    let token = CancellationToken::new();
    token.cancel();
    let err = fetcher.run_with_cancel(&spec, token).await.unwrap_err();
    assert!(matches!(err, FetchError::Cancelled));
    assert!(dir_names(&store.path().join("models--org--demo/snapshots")).is_empty());
    assert!(dir_names(&store.path().join("tmp")).is_empty());
}

#[test]
fn test_impure_credential_names_follow_source() {
    let store = TempDir::new().unwrap();
    let mock = Arc::new(MockAdapter::new());
    let fetcher = fetcher(store.path(), &mock);
    let names = fetcher
        .impure_credential_names(&SourceSelection {
            mock: Some(MockSource::default()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(names, vec!["MOCK_SOURCE_TOKEN"]);
}
