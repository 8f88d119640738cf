//! Pipeline Runner Integration Tests
//!
//! Tests for step ordering, halting, retries, timeouts, cancellation and hooks.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use stepline::adapters::{Provider, ProviderInvocationError, ProviderSet};
use stepline::core::{link, ConfigModel, EventStore, PipelineRunner, RunError, StepExecutor};
use stepline::domain::{Document, Payload, ProviderRef, RunEventType, RunState, Step};

/// Records the name of every step it runs and echoes its input
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<String>>,
}

impl Recorder {
    fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn invoke(
        &self,
        step: &Step,
        _provider: &ProviderRef,
        input: Payload,
    ) -> Result<Payload, ProviderInvocationError> {
        self.seen.lock().unwrap().push(step.name.clone());
        Ok(input)
    }
}

/// Unreachable for the first `failures` calls, then succeeds
struct Flaky {
    failures: u32,
    calls: AtomicU32,
}

#[async_trait]
impl Provider for Flaky {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn invoke(
        &self,
        step: &Step,
        _provider: &ProviderRef,
        _input: Payload,
    ) -> Result<Payload, ProviderInvocationError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(ProviderInvocationError::Unreachable {
                step: step.name.clone(),
                message: "connection refused".to_string(),
            });
        }
        Ok(Payload::from(json!({"call": call})))
    }
}

/// Counts calls and always fails explicitly
#[derive(Default)]
struct Rejecting {
    calls: AtomicU32,
}

#[async_trait]
impl Provider for Rejecting {
    fn name(&self) -> &str {
        "rejecting"
    }

    async fn invoke(
        &self,
        step: &Step,
        _provider: &ProviderRef,
        _input: Payload,
    ) -> Result<Payload, ProviderInvocationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ProviderInvocationError::Failed {
            step: step.name.clone(),
            exit_code: Some(1),
            message: "rejected".to_string(),
            output: Some(json!({"reason": "rejected"})),
        })
    }
}

/// Sleeps far longer than any test timeout
struct Sleeper;

#[async_trait]
impl Provider for Sleeper {
    fn name(&self) -> &str {
        "sleeper"
    }

    async fn invoke(
        &self,
        _step: &Step,
        _provider: &ProviderRef,
        input: Payload,
    ) -> Result<Payload, ProviderInvocationError> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(input)
    }
}

fn model(yaml: &str) -> ConfigModel {
    link(Document::from_yaml(yaml).unwrap()).unwrap()
}

fn runner(providers: ProviderSet) -> PipelineRunner {
    PipelineRunner::new(StepExecutor::new(Arc::new(providers)))
}

#[tokio::test]
async fn test_failure_halts_remaining_steps() {
    let model = model(
        r#"
apis:
  pipelines:
    - name: abc
      steps:
        - { name: a, provider: "builtin:record" }
        - { name: b, provider: "builtin:fail" }
        - { name: c, provider: "builtin:record" }
"#,
    );
    let recorder = Arc::new(Recorder::default());
    let runner = runner(ProviderSet::new().register("builtin:record", recorder.clone()));

    let execution = runner
        .run(&model, "abc", json!({}), Payload::from(json!({"x": 1})), &CancellationToken::new())
        .await
        .unwrap();

    assert!(!execution.outcome.success);
    assert_eq!(execution.outcome.failed_step.as_deref(), Some("b"));
    assert_eq!(recorder.seen(), vec!["a"]);
    assert!(execution.context.step("c").is_none());
}

#[tokio::test]
async fn test_hooks_wrap_explicit_steps() {
    let model = model(
        r#"
apis:
  global_options:
    hooks:
      before:
        - { name: audit_in, provider: "builtin:record" }
      after:
        - { name: audit_out, provider: "builtin:record" }
  pipelines:
    - name: two
      steps:
        - { name: first, provider: "builtin:record" }
        - { name: second, provider: "builtin:record" }
"#,
    );
    let recorder = Arc::new(Recorder::default());
    let runner = runner(ProviderSet::new().register("builtin:record", recorder.clone()));

    let execution = runner
        .run(&model, "two", json!({}), Payload::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(execution.outcome.success);
    assert_eq!(recorder.seen(), vec!["audit_in", "first", "second", "audit_out"]);
}

#[tokio::test]
async fn test_hook_positions_interleave_with_steps() {
    let model = model(
        r#"
apis:
  global_options:
    hooks:
      before:
        - { name: open, provider: "builtin:record" }
        - { name: check, provider: "builtin:record", position: each }
      after:
        - { name: tidy, provider: "builtin:record", position: first }
        - { name: close, provider: "builtin:record" }
  pipelines:
    - name: three
      steps:
        - { name: one, provider: "builtin:record" }
        - { name: two, provider: "builtin:record" }
        - name: three
          provider: "builtin:record"
          mappings:
            - { from: "${pipeline[1].n}", to: n }
    - name: none
"#,
    );
    let recorder = Arc::new(Recorder::default());
    let wrapped = runner(ProviderSet::new().register("builtin:record", recorder.clone()));
    let cancel = CancellationToken::new();

    let execution = wrapped
        .run(&model, "three", json!({}), Payload::from(json!({"n": 7})), &cancel)
        .await
        .unwrap();

    assert!(execution.outcome.success);
    assert_eq!(
        recorder.seen(),
        vec!["open", "check", "one", "tidy", "check", "two", "check", "three", "close"]
    );
    // Hooks take no position: pipeline[1] is still the step named "two"
    assert_eq!(execution.context.step("three"), Some(&Payload::from(json!({"n": 7}))));
    assert_eq!(execution.context.step_at(1), execution.context.step("two"));

    let recorder = Arc::new(Recorder::default());
    let empty = runner(ProviderSet::new().register("builtin:record", recorder.clone()));
    empty
        .run(&model, "none", json!({}), Payload::default(), &cancel)
        .await
        .unwrap();
    assert_eq!(recorder.seen(), vec!["open", "tidy", "close"]);
}

#[tokio::test]
async fn test_transient_failures_are_retried_and_journaled() {
    let temp = TempDir::new().unwrap();
    let model = model(
        r#"
apis:
  pipelines:
    - name: fetch
      steps:
        - name: call
          provider: "builtin:flaky"
          retry_policy: { max_attempts: 3, initial_delay_ms: 1, max_delay_ms: 5 }
"#,
    );
    let flaky = Arc::new(Flaky {
        failures: 2,
        calls: AtomicU32::new(0),
    });
    let runner = runner(ProviderSet::new().register("builtin:flaky", flaky.clone()))
        .with_journal(temp.path());

    let execution = runner
        .run(&model, "fetch", json!({}), Payload::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(execution.outcome.success);
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    assert_eq!(execution.outcome.body, Payload::from(json!({"call": 3})));

    let store = EventStore::open(temp.path(), execution.run_id).await.unwrap();
    let events = store.replay().await.unwrap();
    let retries = events
        .iter()
        .filter(|e| e.event_type == RunEventType::StepRetrying)
        .count();
    assert_eq!(retries, 2);

    let run = store.load_run().await.unwrap().unwrap();
    assert_eq!(run.state, RunState::Completed);
    assert_eq!(run.pipeline_name, "fetch");
}

#[tokio::test]
async fn test_transient_failures_give_up_after_max_attempts() {
    let model = model(
        r#"
apis:
  pipelines:
    - name: fetch
      steps:
        - name: call
          provider: "builtin:flaky"
          retry_policy: { max_attempts: 2, initial_delay_ms: 1 }
"#,
    );
    let flaky = Arc::new(Flaky {
        failures: 10,
        calls: AtomicU32::new(0),
    });
    let runner = runner(ProviderSet::new().register("builtin:flaky", flaky.clone()));

    let execution = runner
        .run(&model, "fetch", json!({}), Payload::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(!execution.outcome.success);
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_explicit_failure_is_not_retried() {
    let model = model(
        r#"
apis:
  pipelines:
    - name: strict
      steps:
        - name: check
          provider: "builtin:reject"
          retry_policy: { max_attempts: 5, initial_delay_ms: 1 }
"#,
    );
    let rejecting = Arc::new(Rejecting::default());
    let runner = runner(ProviderSet::new().register("builtin:reject", rejecting.clone()));

    let execution = runner
        .run(&model, "strict", json!({}), Payload::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(!execution.outcome.success);
    assert_eq!(rejecting.calls.load(Ordering::SeqCst), 1);
    assert_eq!(execution.outcome.value()["reason"], json!("rejected"));
    assert_eq!(execution.outcome.value()["success"], json!(false));
}

#[tokio::test]
async fn test_step_timeout_fails_the_step() {
    let model = model(
        r#"
apis:
  pipelines:
    - name: slow
      steps:
        - name: wait
          provider: "builtin:sleep"
          timeout_seconds: 1
          retry_policy: { max_attempts: 1 }
"#,
    );
    let runner = runner(ProviderSet::new().register("builtin:sleep", Arc::new(Sleeper)));

    let execution = runner
        .run(&model, "slow", json!({}), Payload::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(!execution.outcome.success);
    assert_eq!(execution.outcome.failed_step.as_deref(), Some("wait"));
    assert!(execution.outcome.error.unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_cancellation_aborts_active_step() {
    let model = model(
        r#"
apis:
  pipelines:
    - name: slow
      steps:
        - { name: wait, provider: "builtin:sleep" }
        - { name: after, provider: "builtin:record" }
"#,
    );
    let recorder = Arc::new(Recorder::default());
    let runner = runner(
        ProviderSet::new()
            .register("builtin:sleep", Arc::new(Sleeper))
            .register("builtin:record", recorder.clone()),
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        runner.run(&model, "slow", json!({}), Payload::default(), &cancel),
    )
    .await
    .unwrap();

    assert!(matches!(result, Err(RunError::Cancelled { .. })));
    assert!(recorder.seen().is_empty());
}

#[tokio::test]
async fn test_mappings_reference_earlier_steps() {
    let model = model(
        r#"
env:
  - { name: REGION, value: eu }
apis:
  pipelines:
    - name: shape
      steps:
        - name: load
          provider: "builtin:identity"
        - name: build
          provider: "builtin:identity"
          mappings:
            - { from: "${load.team.name}", to: team }
            - { from: "${pipeline[0].team.size}", to: meta.size }
            - { from: "${env.REGION}", to: meta.region }
            - { from: "${args.user}", to: owner }
"#,
    );
    let runner = runner(ProviderSet::new());

    let execution = runner
        .run(
            &model,
            "shape",
            json!({"user": "u1"}),
            Payload::from(json!({"team": {"name": "core", "size": 4}})),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(execution.outcome.success);
    assert_eq!(
        execution.outcome.body,
        Payload::from(json!({
            "team": "core",
            "meta": {"size": 4, "region": "eu"},
            "owner": "u1",
        }))
    );
}
