//! JobScheduler: fires enabled jobs at their scheduled times.
//!
//! Each job keeps its next fire time. Fires that were missed while the
//! scheduler was not ticking collapse into one. A job never runs
//! concurrently with itself: a fire that finds the previous run still in
//! flight is skipped and logged, never queued.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::runner::{Execution, PipelineRunner, RunError};
use super::snapshot::SnapshotStore;
use crate::domain::Payload;

/// A job that is due
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobTick {
    pub job: String,
    pub pipeline: String,
    pub fire_at: DateTime<Utc>,
}

/// What happened to a due tick
#[derive(Debug)]
pub enum Dispatch {
    Started(JoinHandle<Result<Execution, RunError>>),
    /// The previous run of the job is still in flight
    Skipped,
}

struct JobState {
    next_fire: Option<DateTime<Utc>>,
    in_flight: Arc<AtomicBool>,
    epoch: u64,
}

/// Clears the in-flight flag when the run finishes, however it finishes
struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct JobScheduler {
    snapshots: Arc<SnapshotStore>,
    runner: PipelineRunner,
    state: Mutex<HashMap<String, JobState>>,

    /// Longest sleep between ticks, so reloads are noticed
    max_poll: Duration,
}

impl JobScheduler {
    pub fn new(snapshots: Arc<SnapshotStore>, runner: PipelineRunner) -> Self {
        Self {
            snapshots,
            runner,
            state: Mutex::new(HashMap::new()),
            max_poll: Duration::from_secs(30),
        }
    }

    pub fn with_max_poll(mut self, max_poll: Duration) -> Self {
        self.max_poll = max_poll;
        self
    }

    /// Collect the jobs due at `now` and advance their schedules
    pub fn tick(&self, now: DateTime<Utc>) -> Vec<JobTick> {
        let model = self.snapshots.current();
        let mut state = self.state.lock();
        state.retain(|name, _| model.jobs().iter().any(|j| j.enabled && &j.name == name));

        let mut due = Vec::new();
        for job in model.jobs().iter().filter(|j| j.enabled) {
            let Some(schedule) = model.schedule(&job.name) else {
                continue;
            };

            let entry = state.entry(job.name.clone()).or_insert_with(|| JobState {
                next_fire: None,
                in_flight: Arc::new(AtomicBool::new(false)),
                epoch: u64::MAX,
            });

            // New job or reloaded configuration
            if entry.epoch != model.epoch() {
                entry.epoch = model.epoch();
                entry.next_fire = schedule.fire_at_or_after(now);
                debug!(job = %job.name, next_fire = ?entry.next_fire, "Job scheduled");
            }

            let Some(fire_at) = entry.next_fire else {
                continue;
            };
            if fire_at > now {
                continue;
            }

            due.push(JobTick {
                job: job.name.clone(),
                pipeline: job.pipeline.clone(),
                fire_at,
            });

            entry.next_fire = schedule.next_fire(now);
            if entry.next_fire.is_none() {
                info!(job = %job.name, "Job retired, no further fires");
            }
        }
        due
    }

    /// Earliest pending fire across all jobs
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.state.lock().values().filter_map(|s| s.next_fire).min()
    }

    /// Start the run for a due tick unless the job is still running
    pub fn dispatch(&self, tick: JobTick, cancel: &CancellationToken) -> Dispatch {
        let in_flight = {
            let state = self.state.lock();
            match state.get(&tick.job) {
                Some(s) => s.in_flight.clone(),
                None => return Dispatch::Skipped,
            }
        };

        if in_flight.swap(true, Ordering::AcqRel) {
            info!(job = %tick.job, fire_at = %tick.fire_at, "Job still running, fire skipped");
            return Dispatch::Skipped;
        }

        let guard = InFlightGuard(in_flight);
        let model = self.snapshots.current();
        let runner = self.runner.clone();
        let cancel = cancel.child_token();

        info!(job = %tick.job, pipeline = %tick.pipeline, fire_at = %tick.fire_at, "Job fired");
        Dispatch::Started(tokio::spawn(async move {
            let _guard = guard;
            let args = json!({
                "job": tick.job,
                "fire_at": tick.fire_at.to_rfc3339(),
            });
            let result = runner
                .run(&model, &tick.pipeline, args, Payload::default(), &cancel)
                .await;

            match &result {
                Ok(execution) if execution.outcome.success => {
                    debug!(job = %tick.job, run_id = %execution.run_id, "Job run completed")
                }
                Ok(execution) => warn!(
                    job = %tick.job,
                    run_id = %execution.run_id,
                    error = execution.outcome.error.as_deref().unwrap_or_default(),
                    "Job run failed"
                ),
                Err(e) => error!(job = %tick.job, error = %e, "Job run aborted"),
            }
            result
        }))
    }

    /// Tick until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        info!("Job scheduler started");

        loop {
            let now = Utc::now();
            for tick in self.tick(now) {
                self.dispatch(tick, &cancel);
            }

            let sleep = self
                .next_due()
                .and_then(|next| (next - Utc::now()).to_std().ok())
                .map_or(self.max_poll, |until| until.min(self.max_poll));

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(sleep) => {}
            }
        }

        info!("Job scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::ProviderSet;
    use crate::core::executor::StepExecutor;
    use crate::domain::Document;
    use chrono::TimeZone;

    fn scheduler() -> JobScheduler {
        let document = Document::from_yaml(
            r#"
apis:
  pipelines:
    - name: p
  jobs:
    - name: hourly
      pipeline: p
      start: "2024-01-01T00:00:00Z"
      interval: hour
    - name: off
      pipeline: p
      enabled: false
      start: "2024-01-01T00:00:00Z"
      interval: minute
"#,
        )
        .unwrap();
        let snapshots = Arc::new(SnapshotStore::from_document(document).unwrap());
        let runner = PipelineRunner::new(StepExecutor::new(Arc::new(ProviderSet::new())));
        JobScheduler::new(snapshots, runner)
    }

    #[test]
    fn test_tick_fires_once_per_slot() {
        let scheduler = scheduler();
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 5, 0, 0).unwrap();

        let due = scheduler.tick(at);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].job, "hourly");
        assert_eq!(due[0].fire_at, at);

        assert!(scheduler.tick(at).is_empty());
        assert_eq!(
            scheduler.next_due(),
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 6, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_missed_fires_collapse() {
        let scheduler = scheduler();
        scheduler.tick(Utc.with_ymd_and_hms(2024, 1, 1, 0, 30, 0).unwrap());

        let due = scheduler.tick(Utc.with_ymd_and_hms(2024, 1, 1, 4, 30, 0).unwrap());
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].fire_at, Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap());
        assert_eq!(
            scheduler.next_due(),
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 5, 0, 0).unwrap())
        );
    }
}
