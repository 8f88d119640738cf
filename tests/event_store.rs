//! Event Store Integration Tests
//!
//! Tests for the run journal: event serialization, replay, idempotency keys
//! and run reconstruction from a journaled pipeline.

use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use stepline::adapters::ProviderSet;
use stepline::core::{
    generate_idempotency_key, hash_input, link, EventStore, PipelineRunner, StepExecutor,
};
use stepline::domain::{Document, Payload, Run, RunEvent, RunEventType, RunState};

const DOC: &str = r#"
apis:
  pipelines:
    - name: register
      steps:
        - { name: normalize, provider: "builtin:identity" }
        - { name: store, provider: "builtin:identity" }
    - name: refuse
      steps:
        - { name: check, provider: "builtin:fail" }
"#;

fn journaled_runner(runs_dir: &TempDir) -> PipelineRunner {
    PipelineRunner::new(StepExecutor::new(Arc::new(ProviderSet::new()))).with_journal(runs_dir.path())
}

#[test]
fn test_event_with_duration_and_error() {
    let run_id = Uuid::new_v4();

    let completed = RunEvent::new(
        run_id,
        Some("store".to_string()),
        RunEventType::StepCompleted,
        format!("{}:store:abc", run_id),
        "Completed".to_string(),
    )
    .with_duration(1500);
    assert_eq!(completed.duration_ms, Some(1500));
    assert_eq!(completed.error, None);

    let failed = RunEvent::new(
        run_id,
        Some("store".to_string()),
        RunEventType::StepFailed,
        format!("{}:store:abc", run_id),
        "Failed".to_string(),
    )
    .with_error("Connection timeout".to_string());
    assert_eq!(failed.error.as_deref(), Some("Connection timeout"));
}

#[test]
fn test_event_types_serialize_snake_case() {
    assert_eq!(
        serde_json::to_string(&RunEventType::SafetyLimitReached).unwrap(),
        "\"safety_limit_reached\""
    );

    for event_type in [
        RunEventType::RunStarted,
        RunEventType::RunCompleted,
        RunEventType::RunFailed,
        RunEventType::RunCancelled,
        RunEventType::StepStarted,
        RunEventType::StepCompleted,
        RunEventType::StepFailed,
        RunEventType::StepRetrying,
        RunEventType::SafetyLimitReached,
    ] {
        let json = serde_json::to_string(&event_type).unwrap();
        let parsed: RunEventType = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event_type);
    }
}

#[test]
fn test_idempotency_key_varies_with_step_and_input() {
    let run_id = Uuid::new_v4();

    let key1 = generate_idempotency_key(run_id, "normalize", b"input A");
    let key2 = generate_idempotency_key(run_id, "normalize", b"input B");
    let key3 = generate_idempotency_key(run_id, "store", b"input A");

    assert_ne!(key1, key2);
    assert_ne!(key1, key3);
    assert_eq!(key1, generate_idempotency_key(run_id, "normalize", b"input A"));
}

#[test]
fn test_input_hash_is_sixteen_hex_chars() {
    let inputs: [&[u8]; 4] = [b"", b"hello\nworld", "unicode: \u{65e5}\u{672c}".as_bytes(), &[0xff, 0x00]];
    for input in inputs {
        let hash = hash_input(input);
        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }
    assert_ne!(hash_input(b"a"), hash_input(b"b"));
}

#[tokio::test]
async fn test_missing_journal_replays_empty() {
    let temp = TempDir::new().unwrap();
    let store = EventStore::open(temp.path(), Uuid::new_v4()).await.unwrap();

    assert!(store.replay().await.unwrap().is_empty());
    assert!(store.load_run().await.unwrap().is_none());
}

#[tokio::test]
async fn test_replay_preserves_append_order() {
    let temp = TempDir::new().unwrap();
    let run_id = Uuid::new_v4();
    let store = EventStore::open(temp.path(), run_id).await.unwrap();

    for i in 0..5 {
        let event = RunEvent::new(
            run_id,
            Some(format!("step{}", i)),
            RunEventType::StepStarted,
            format!("{}:step{}:abc", run_id, i),
            format!("Step {} started", i),
        );
        store.append(&event).await.unwrap();
    }

    let events = store.replay().await.unwrap();
    assert_eq!(events.len(), 5);
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.step_id, Some(format!("step{}", i)));
    }
}

#[tokio::test]
async fn test_journaled_run_reconstructs_state() {
    let temp = TempDir::new().unwrap();
    let model = link(Document::from_yaml(DOC).unwrap()).unwrap();
    let runner = journaled_runner(&temp);

    let execution = runner
        .run(&model, "register", json!({}), Payload::from(json!({"name": "a"})), &CancellationToken::new())
        .await
        .unwrap();
    assert!(execution.outcome.success);

    let store = EventStore::open(temp.path(), execution.run_id).await.unwrap();
    let events = store.replay().await.unwrap();
    let types: Vec<RunEventType> = events.iter().map(|e| e.event_type).collect();
    assert_eq!(
        types,
        vec![
            RunEventType::RunStarted,
            RunEventType::StepStarted,
            RunEventType::StepCompleted,
            RunEventType::StepStarted,
            RunEventType::StepCompleted,
            RunEventType::RunCompleted,
        ]
    );

    let completed = events
        .iter()
        .find(|e| e.event_type == RunEventType::StepCompleted)
        .unwrap();
    assert!(completed
        .idempotency_key
        .starts_with(&format!("{}:normalize:", execution.run_id)));
    assert!(store.is_step_completed(&completed.idempotency_key).await.unwrap());

    let run = Run::from_events(&events).unwrap();
    assert_eq!(run.state, RunState::Completed);
    assert_eq!(run.pipeline_name, "register");
    assert!(run.is_step_completed("normalize"));
    assert!(run.is_step_completed("store"));
}

#[tokio::test]
async fn test_failed_run_is_journaled_and_listed() {
    let temp = TempDir::new().unwrap();
    let model = link(Document::from_yaml(DOC).unwrap()).unwrap();
    let runner = journaled_runner(&temp);
    let cancel = CancellationToken::new();

    let ok = runner
        .run(&model, "register", json!({}), Payload::default(), &cancel)
        .await
        .unwrap();
    let failed = runner
        .run(&model, "refuse", json!({}), Payload::from(json!({"x": 1})), &cancel)
        .await
        .unwrap();

    let store = EventStore::open(temp.path(), failed.run_id).await.unwrap();
    let run = store.load_run().await.unwrap().unwrap();
    assert!(matches!(run.state, RunState::Failed { .. }));
    assert!(!run.is_running());
    assert!(!run.is_step_completed("check"));

    let mut runs = EventStore::list_runs(temp.path()).await.unwrap();
    runs.sort();
    let mut expected = vec![ok.run_id, failed.run_id];
    expected.sort();
    assert_eq!(runs, expected);
}
