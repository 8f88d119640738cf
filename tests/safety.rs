//! Safety Limits Integration Tests
//!
//! Tests for step count and payload size enforcement during runs.

use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;

use stepline::adapters::ProviderSet;
use stepline::core::{
    link, ConfigModel, EventStore, PayloadDirection, PipelineRunner, SafetyLimits, SafetyTracker,
    SafetyViolation, StepExecutor,
};
use stepline::domain::{Document, Payload, RunEventType, RunState};

const DOC: &str = r#"
apis:
  pipelines:
    - name: three
      steps:
        - { name: one, provider: "builtin:identity" }
        - { name: two, provider: "builtin:identity" }
        - { name: three, provider: "builtin:identity" }
"#;

fn model() -> ConfigModel {
    link(Document::from_yaml(DOC).unwrap()).unwrap()
}

fn runner(limits: SafetyLimits) -> PipelineRunner {
    PipelineRunner::new(StepExecutor::new(Arc::new(ProviderSet::new()))).with_limits(limits)
}

#[test]
fn test_max_payload_bytes() {
    let limits = SafetyLimits {
        max_payload_bytes: 100,
        ..Default::default()
    };

    assert_ok!(limits.validate_payload(PayloadDirection::Input, 50));
    assert_ok!(limits.validate_payload(PayloadDirection::Output, 100));

    match limits.validate_payload(PayloadDirection::Input, 200) {
        Err(SafetyViolation::MaxPayloadBytes {
            direction,
            actual,
            limit,
        }) => {
            assert_eq!(direction, PayloadDirection::Input);
            assert_eq!(actual, 200);
            assert_eq!(limit, 100);
        }
        other => panic!("Expected MaxPayloadBytes violation, got {:?}", other),
    }
}

#[test]
fn test_max_steps_counts_executed_steps() {
    let limits = SafetyLimits {
        max_steps: 3,
        ..Default::default()
    };
    let mut tracker = SafetyTracker::new();

    for _ in 0..3 {
        assert_ok!(limits.check(&tracker));
        tracker.record_step(10, 20);
    }

    assert_eq!(
        limits.check(&tracker),
        Err(SafetyViolation::MaxSteps { actual: 3, limit: 3 })
    );
    assert_eq!(tracker.input_bytes, 30);
    assert_eq!(tracker.output_bytes, 60);
}

#[test]
fn test_limits_deserialize_with_defaults() {
    let limits: SafetyLimits = serde_yaml::from_str("max_steps: 7").unwrap();

    assert_eq!(limits.max_steps, 7);
    assert_eq!(limits.max_payload_bytes, SafetyLimits::default().max_payload_bytes);
    assert_eq!(limits.run_timeout_seconds, 300);
}

#[tokio::test]
async fn test_run_halts_at_step_limit() {
    let temp = TempDir::new().unwrap();
    let runner = runner(SafetyLimits {
        max_steps: 2,
        ..Default::default()
    })
    .with_journal(temp.path());

    let execution = runner
        .run(&model(), "three", json!({}), Payload::from(json!({"n": 1})), &CancellationToken::new())
        .await
        .unwrap();

    assert!(!execution.outcome.success);
    assert_eq!(execution.outcome.failed_step.as_deref(), Some("three"));
    assert!(execution.context.step("two").is_some());

    let store = EventStore::open(temp.path(), execution.run_id).await.unwrap();
    let events = store.replay().await.unwrap();
    assert_eq!(
        events.last().map(|e| e.event_type),
        Some(RunEventType::SafetyLimitReached)
    );

    let run = store.load_run().await.unwrap().unwrap();
    assert!(matches!(run.state, RunState::SafetyLimitReached { .. }));
    assert!(run.is_step_completed("two"));
    assert!(!run.is_step_completed("three"));
}

#[tokio::test]
async fn test_oversized_input_halts_before_first_step() {
    let runner = runner(SafetyLimits {
        max_payload_bytes: 16,
        ..Default::default()
    });

    let big = Payload::from(json!({"text": "x".repeat(64)}));
    let execution = runner
        .run(&model(), "three", json!({}), big, &CancellationToken::new())
        .await
        .unwrap();

    assert!(!execution.outcome.success);
    assert_eq!(execution.outcome.failed_step.as_deref(), Some("one"));
    assert!(execution
        .outcome
        .error
        .unwrap()
        .contains("Step input of"));
    assert!(execution.context.step("one").is_none());
}

#[tokio::test]
async fn test_small_payloads_pass_untouched() {
    let runner = runner(SafetyLimits {
        max_payload_bytes: 1024,
        max_steps: 3,
        ..Default::default()
    });

    let execution = runner
        .run(&model(), "three", json!({}), Payload::from(json!({"n": 1})), &CancellationToken::new())
        .await
        .unwrap();

    assert!(execution.outcome.success);
    assert_eq!(execution.outcome.body, Payload::from(json!({"n": 1})));
}
