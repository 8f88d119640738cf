//! Job Scheduler Integration Tests
//!
//! Tests for firing, overlap skipping, calendar intervals and reloads.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::json;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use stepline::adapters::{Provider, ProviderInvocationError, ProviderSet};
use stepline::core::{Dispatch, JobScheduler, PipelineRunner, SnapshotStore, StepExecutor};
use stepline::domain::{Document, Payload, ProviderRef, Step};

/// Blocks each call until released
#[derive(Default)]
struct Gate {
    release: Notify,
    calls: AtomicU32,
}

#[async_trait]
impl Provider for Gate {
    fn name(&self) -> &str {
        "gate"
    }

    async fn invoke(
        &self,
        _step: &Step,
        _provider: &ProviderRef,
        input: Payload,
    ) -> Result<Payload, ProviderInvocationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.release.notified().await;
        Ok(input)
    }
}

const DOC: &str = r#"
apis:
  pipelines:
    - name: slow
      steps:
        - { name: wait, provider: "builtin:gate" }
    - name: stamp
      steps:
        - name: record
          provider: "builtin:identity"
          mappings:
            - { from: "${args.job}", to: job }
            - { from: "${args.fire_at}", to: fire_at }
  jobs:
    - name: sync
      pipeline: slow
      start: "2024-01-01T00:00:00Z"
      interval: hour
    - name: closing
      pipeline: stamp
      start: "2024-01-15T09:00:00Z"
      interval: month_end
"#;

fn scheduler(gate: Arc<Gate>) -> (Arc<SnapshotStore>, JobScheduler) {
    let snapshots = Arc::new(SnapshotStore::from_document(Document::from_yaml(DOC).unwrap()).unwrap());
    let providers = ProviderSet::new().register("builtin:gate", gate);
    let runner = PipelineRunner::new(StepExecutor::new(Arc::new(providers)));
    (snapshots.clone(), JobScheduler::new(snapshots, runner))
}

#[tokio::test]
async fn test_overlapping_fire_is_skipped() {
    let gate = Arc::new(Gate::default());
    let (_, scheduler) = scheduler(gate.clone());
    let cancel = CancellationToken::new();
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

    let due = scheduler.tick(start);
    assert_eq!(due.len(), 1);
    let Dispatch::Started(first) = scheduler.dispatch(due[0].clone(), &cancel) else {
        panic!("First fire should start");
    };

    let due = scheduler.tick(start + chrono::Duration::hours(1));
    assert_eq!(due.len(), 1);
    assert!(matches!(
        scheduler.dispatch(due[0].clone(), &cancel),
        Dispatch::Skipped
    ));

    gate.release.notify_one();
    let execution = tokio::time::timeout(Duration::from_secs(5), first)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(execution.outcome.success);

    // The job is free again once the run finished
    let due = scheduler.tick(start + chrono::Duration::hours(2));
    let Dispatch::Started(second) = scheduler.dispatch(due[0].clone(), &cancel) else {
        panic!("Fire after completion should start");
    };
    gate.release.notify_one();
    tokio::time::timeout(Duration::from_secs(5), second)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(gate.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_month_end_job_fires_on_last_day() {
    let (_, scheduler) = scheduler(Arc::new(Gate::default()));
    let feb_29 = Utc.with_ymd_and_hms(2024, 2, 29, 9, 0, 0).unwrap();

    let due = scheduler.tick(Utc.with_ymd_and_hms(2024, 2, 10, 0, 30, 0).unwrap());
    assert!(due.iter().all(|t| t.job != "closing"));

    let due = scheduler.tick(feb_29);
    let closing = due.iter().find(|t| t.job == "closing").unwrap();
    assert_eq!(closing.fire_at, feb_29);
    assert_eq!(closing.pipeline, "stamp");

    let Dispatch::Started(handle) = scheduler.dispatch(closing.clone(), &CancellationToken::new()) else {
        panic!("Job should start");
    };
    let execution = handle.await.unwrap().unwrap();
    assert_eq!(
        execution.outcome.body,
        Payload::from(json!({"job": "closing", "fire_at": feb_29.to_rfc3339()}))
    );

    let due = scheduler.tick(Utc.with_ymd_and_hms(2024, 3, 31, 9, 0, 0).unwrap());
    assert!(due.iter().any(|t| t.job == "closing"));
}

#[tokio::test]
async fn test_reload_recomputes_fire_times() {
    let (snapshots, scheduler) = scheduler(Arc::new(Gate::default()));
    let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 30, 0).unwrap();

    scheduler.tick(at);
    assert_eq!(
        scheduler.next_due(),
        Some(Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap())
    );

    snapshots
        .reload(
            Document::from_yaml(
                r#"
apis:
  pipelines:
    - name: slow
  jobs:
    - name: sync
      pipeline: slow
      start: "2024-01-01T00:00:00Z"
      interval: minute
      frequency: "15"
"#,
            )
            .unwrap(),
        )
        .unwrap();

    assert!(scheduler.tick(at + chrono::Duration::seconds(10)).is_empty());
    assert_eq!(
        scheduler.next_due(),
        Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 45, 0).unwrap())
    );

    // Dropping every job clears their state
    snapshots
        .reload(Document::from_yaml("apis:\n  pipelines:\n    - name: slow\n").unwrap())
        .unwrap();
    assert!(scheduler.tick(at + chrono::Duration::hours(3)).is_empty());
    assert_eq!(scheduler.next_due(), None);
}

#[tokio::test]
async fn test_run_stops_on_cancel() {
    let (_, scheduler) = scheduler(Arc::new(Gate::default()));
    let scheduler = Arc::new(scheduler.with_max_poll(Duration::from_millis(10)));
    let cancel = CancellationToken::new();

    let running = tokio::spawn({
        let scheduler = scheduler.clone();
        let cancel = cancel.clone();
        async move { scheduler.run(cancel).await }
    });

    tokio::time::sleep(Duration::from_millis(30)).await;
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .unwrap()
        .unwrap();
}
