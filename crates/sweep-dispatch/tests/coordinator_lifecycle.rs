//! Claim, stage, and completion lifecycle through `ParamCoordinator`.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;
use sweep_dispatch::backend::DelimitedFileBackend;
use sweep_dispatch::prelude::*;

const TABLE: &str = "\
id,status,start-time,end-time,comment,performed-by,required-computer-strength,./overall/max_time,./save/folder
test1,,,,stale note,,,2880,
test2,,,,,,5,1440,
test3,,,,,,,720,custom
";

struct Fixture {
    _dir: tempfile::TempDir,
    path: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parameters.csv");
        std::fs::write(&path, TABLE).unwrap();
        Self { _dir: dir, path }
    }

    fn backend(&self) -> Arc<dyn TableBackend> {
        Arc::new(DelimitedFileBackend::new(&self.path, ',').unwrap())
    }

    fn coordinator(&self) -> ParamCoordinator {
        ParamCoordinator::new(self.backend())
    }
}

#[tokio::test]
async fn full_lifecycle() {
    let fixture = Fixture::new();
    let defaults: ParameterMap = [
        ("./overall/max_time".to_string(), json!(100)),
        ("threads".to_string(), json!(4)),
    ]
    .into();
    let coordinator = fixture
        .coordinator()
        .with_defaults(defaults)
        .with_performed_by("node-1");

    let claim = coordinator.next_parameters().await.unwrap().unwrap();
    assert_eq!(claim.id.as_str(), "test1");
    assert_eq!(claim.get("./overall/max_time"), Some(&json!("2880")));
    assert_eq!(claim.get("threads"), Some(&json!(4)));

    let rows = coordinator.rows().await.unwrap();
    assert_eq!(rows[0].status, Status::Claimed);
    assert_eq!(rows[0].comment, None);
    assert_eq!(rows[0].performed_by.as_deref(), Some("node-1"));

    for label in ["clean", "xml", "running simulation", "collect"] {
        let row = coordinator.update_status(&claim.id, label).await.unwrap();
        assert_eq!(row.status.as_str(), label);
    }

    let done = coordinator.successful(&claim.id).await.unwrap();
    assert_eq!(done.status, Status::Success);
    assert!(done.end_time.is_some());
    assert!(done.start_time.unwrap() <= done.end_time.unwrap());
}

#[tokio::test]
async fn completion_is_final() {
    let fixture = Fixture::new();
    let coordinator = fixture.coordinator();
    let claim = coordinator.next_parameters().await.unwrap().unwrap();

    coordinator.successful(&claim.id).await.unwrap();

    for err in [
        coordinator.successful(&claim.id).await.unwrap_err(),
        coordinator.failed(&claim.id, "late").await.unwrap_err(),
        coordinator.update_status(&claim.id, "clean").await.unwrap_err(),
    ] {
        assert!(matches!(err, Error::InvalidTransition { .. }), "{err}");
    }

    let rows = coordinator.rows().await.unwrap();
    assert_eq!(rows[0].status, Status::Success);
    assert_eq!(rows[0].comment, None);
}

#[tokio::test]
async fn failure_records_detail() {
    let fixture = Fixture::new();
    let coordinator = fixture.coordinator();
    let claim = coordinator.next_parameters().await.unwrap().unwrap();

    coordinator.update_status(&claim.id, "running simulation").await.unwrap();
    let row = coordinator.failed(&claim.id, "exit status 139").await.unwrap();

    assert_eq!(row.status, Status::Failed);
    assert_eq!(row.comment.as_deref(), Some("exit status 139"));
    assert!(row.end_time.is_some());

    let next = coordinator.next_parameters().await.unwrap().unwrap();
    assert_ne!(next.id, claim.id, "failed rows are not retried");
}

#[tokio::test]
async fn reserved_and_empty_labels_are_rejected() {
    let fixture = Fixture::new();
    let coordinator = fixture.coordinator();
    let claim = coordinator.next_parameters().await.unwrap().unwrap();

    for label in ["success", "Claimed", "pending", ""] {
        let err = coordinator.update_status(&claim.id, label).await.unwrap_err();
        match err {
            Error::InvalidTransition { id, .. } => assert_eq!(id, "test1"),
            other => panic!("unexpected error: {other}"),
        }
    }
}

#[tokio::test]
async fn unknown_id_is_not_found() {
    let fixture = Fixture::new();
    let coordinator = fixture.coordinator();
    let err = coordinator
        .update_status(&RowId::from("nope"), "clean")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
}

#[tokio::test]
async fn stage_before_claim_is_rejected() {
    let fixture = Fixture::new();
    let coordinator = fixture.coordinator();
    let err = coordinator
        .update_status(&RowId::from("test2"), "clean")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { .. }));
}

#[tokio::test]
async fn max_runs_caps_claims() {
    let fixture = Fixture::new();
    let coordinator = fixture.coordinator().with_max_runs(2);

    assert!(coordinator.next_parameters().await.unwrap().is_some());
    assert!(coordinator.next_parameters().await.unwrap().is_some());
    assert!(coordinator.next_parameters().await.unwrap().is_none());
    assert_eq!(coordinator.claims_made(), 2);

    let summary = coordinator.summary().await.unwrap();
    assert_eq!(summary.pending, 1);
}

#[tokio::test]
async fn computer_strength_filters_rows() {
    let fixture = Fixture::new();
    let weak = fixture.coordinator().with_computer_strength(2.0);

    let ids: Vec<String> = [
        weak.next_parameters().await.unwrap(),
        weak.next_parameters().await.unwrap(),
    ]
    .into_iter()
    .flatten()
    .map(|claim| claim.id.to_string())
    .collect();
    assert_eq!(ids, ["test1", "test3"]);
    assert!(weak.next_parameters().await.unwrap().is_none());

    let strong = fixture.coordinator().with_computer_strength(10.0);
    let claim = strong.next_parameters().await.unwrap().unwrap();
    assert_eq!(claim.id.as_str(), "test2");
}

#[tokio::test]
async fn abandoned_claims_stay_visible() {
    let fixture = Fixture::new();
    let crashed = fixture.coordinator();
    let claim = crashed.next_parameters().await.unwrap().unwrap();
    crashed.update_status(&claim.id, "running simulation").await.unwrap();
    drop(crashed);

    let survivor = fixture.coordinator();
    while let Some(next) = survivor.next_parameters().await.unwrap() {
        assert_ne!(next.id, claim.id);
        survivor.successful(&next.id).await.unwrap();
    }

    let summary = survivor.summary().await.unwrap();
    assert_eq!(summary.in_progress, 1);
    assert_eq!(summary.stages["running simulation"], 1);
    assert_eq!(summary.success, 2);
}

#[tokio::test]
async fn from_config_applies_settings() {
    let fixture = Fixture::new();
    let mut config = SweepConfig::new(BackendConfig::DelimitedFile {
        path: fixture.path.clone(),
        delimiter: ',',
        lock_timeout_ms: 1_000,
    });
    config.performed_by = Some("hpc-3".into());
    config.max_runs = Some(1);
    config.defaults.insert("./save/folder".into(), json!("output"));

    let backend = open(&config).await.unwrap();
    let coordinator = ParamCoordinator::from_config(backend, &config);

    let claim = coordinator.next_parameters().await.unwrap().unwrap();
    assert_eq!(claim.get_text("./save/folder").as_deref(), Some(""));
    assert!(coordinator.next_parameters().await.unwrap().is_none());

    let rows = coordinator.rows().await.unwrap();
    assert_eq!(rows[0].performed_by.as_deref(), Some("hpc-3"));
}
