//! PipelineRunner: sequences a pipeline's steps.
//!
//! Steps run strictly in order, each seeing the outputs of the steps before
//! it. The first failing step halts the run; its failure is reported as a
//! `{success: false, ...}` outcome instead of an error so callers can route
//! it. Only cancellation and journal IO surface as `RunError`.

use std::path::PathBuf;
use std::time::Instant;

use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::context::ExecutionContext;
use super::event_store::{generate_idempotency_key, EventStore};
use super::executor::StepExecutor;
use super::model::ConfigModel;
use super::safety::{PayloadDirection, SafetyLimits, SafetyTracker, SafetyViolation};
use crate::adapters::ProviderInvocationError;
use crate::domain::{Payload, PipelineOutcome, PlannedStep, RunEvent, RunEventType, Step};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("Pipeline '{pipeline}' was cancelled")]
    Cancelled { pipeline: String },

    #[error("Unknown pipeline '{0}'")]
    UnknownPipeline(String),

    #[error("Run journal failed: {0:#}")]
    Journal(anyhow::Error),
}

/// A finished run: its outcome and the context it built
#[derive(Debug, Clone)]
pub struct Execution {
    pub run_id: Uuid,
    pub outcome: PipelineOutcome,
    pub context: ExecutionContext,
}

/// Why a step stopped the run
struct Halt {
    outcome: PipelineOutcome,
    event_type: RunEventType,
}

impl Halt {
    fn failed(step: &Step, error: impl ToString, output: Option<Value>) -> Self {
        Self {
            outcome: PipelineOutcome::failed(&step.name, error.to_string(), output),
            event_type: RunEventType::RunFailed,
        }
    }

    fn safety(step: &Step, violation: SafetyViolation) -> Self {
        Self {
            outcome: PipelineOutcome::failed(&step.name, violation.to_string(), None),
            event_type: RunEventType::SafetyLimitReached,
        }
    }
}

#[derive(Clone)]
pub struct PipelineRunner {
    executor: StepExecutor,
    limits: SafetyLimits,

    /// Runs directory for the journal; `None` disables journaling
    journal_dir: Option<PathBuf>,
}

impl PipelineRunner {
    pub fn new(executor: StepExecutor) -> Self {
        Self {
            executor,
            limits: SafetyLimits::default(),
            journal_dir: None,
        }
    }

    pub fn with_limits(mut self, limits: SafetyLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Journal every run under `runs_dir/<run-id>/events.jsonl`
    pub fn with_journal(mut self, runs_dir: impl Into<PathBuf>) -> Self {
        self.journal_dir = Some(runs_dir.into());
        self
    }

    /// Same runner without journaling
    pub fn without_journal(&self) -> Self {
        Self {
            journal_dir: None,
            ..self.clone()
        }
    }

    pub fn executor(&self) -> &StepExecutor {
        &self.executor
    }

    pub fn limits(&self) -> &SafetyLimits {
        &self.limits
    }

    /// Run a configured pipeline with the global hooks around its steps
    pub async fn run(
        &self,
        model: &ConfigModel,
        pipeline_name: &str,
        args: Value,
        initial: Payload,
        cancel: &CancellationToken,
    ) -> Result<Execution, RunError> {
        let pipeline = model
            .pipeline(pipeline_name)
            .ok_or_else(|| RunError::UnknownPipeline(pipeline_name.to_string()))?;

        let plan = model.hooks().plan(&pipeline.steps);

        let ctx = ExecutionContext::new(args, model.env());
        self.execute(pipeline_name, pipeline.parser.as_ref(), &plan, ctx, initial, cancel)
            .await
    }

    /// Run an ad-hoc list of steps (column transforms) against `ctx`
    pub async fn run_steps(
        &self,
        label: &str,
        steps: &[&Step],
        ctx: ExecutionContext,
        initial: Payload,
        cancel: &CancellationToken,
    ) -> Result<Execution, RunError> {
        let plan: Vec<PlannedStep<'_>> = steps.iter().map(|s| PlannedStep::explicit(s)).collect();
        self.execute(label, None, &plan, ctx, initial, cancel).await
    }

    #[instrument(skip_all, fields(pipeline = %label))]
    async fn execute(
        &self,
        label: &str,
        parser: Option<&Step>,
        steps: &[PlannedStep<'_>],
        mut ctx: ExecutionContext,
        mut initial: Payload,
        cancel: &CancellationToken,
    ) -> Result<Execution, RunError> {
        let run_id = Uuid::new_v4();
        let journal = match &self.journal_dir {
            Some(dir) => Some(EventStore::open(dir, run_id).await.map_err(RunError::Journal)?),
            None => None,
        };
        let journal = journal.as_ref();
        let mut tracker = SafetyTracker::new();

        debug!(%run_id, steps = steps.len(), "Starting pipeline run");
        self.record(
            journal,
            RunEvent::new(
                run_id,
                Some(label.to_string()),
                RunEventType::RunStarted,
                format!("{}:start", run_id),
                format!("Pipeline '{}' started", label),
            ),
        )
        .await?;

        // Raw payloads are interpreted once, before the first step
        if let Some(parser) = parser.filter(|_| initial.is_raw()) {
            let input = match StepExecutor::build_input(parser, &ctx, &initial) {
                Ok(input) => input,
                Err(e) => {
                    let halt = Halt::failed(parser, &e, None);
                    return self.halt(run_id, journal, label, halt, ctx).await;
                }
            };
            match self
                .invoke_step(run_id, journal, label, parser, input, &mut tracker, cancel)
                .await?
            {
                Ok(payload) => initial = payload,
                Err(halt) => return self.halt(run_id, journal, label, halt, ctx).await,
            }
        }

        for planned in steps {
            let step = planned.step;
            if cancel.is_cancelled() {
                return self.cancelled(run_id, journal, label, step).await;
            }

            let input = match StepExecutor::build_input(step, &ctx, &initial) {
                Ok(input) => input,
                Err(e) => {
                    self.record(journal, step_failed(run_id, step, &e.to_string(), 0))
                        .await?;
                    let halt = Halt::failed(step, &e, None);
                    return self.halt(run_id, journal, label, halt, ctx).await;
                }
            };

            match self
                .invoke_step(run_id, journal, label, step, input, &mut tracker, cancel)
                .await?
            {
                Ok(payload) if planned.hook => ctx.record_hook(&step.name, payload),
                Ok(payload) => ctx.record(&step.name, payload),
                Err(halt) => return self.halt(run_id, journal, label, halt, ctx).await,
            }
        }

        let body = ctx.last_output().cloned().unwrap_or(initial);
        info!(%run_id, steps = tracker.steps_executed, "Pipeline run completed");
        self.record(
            journal,
            RunEvent::new(
                run_id,
                None,
                RunEventType::RunCompleted,
                format!("{}:complete", run_id),
                format!("Pipeline '{}' completed", label),
            ),
        )
        .await?;

        Ok(Execution {
            run_id,
            outcome: PipelineOutcome::succeeded(body),
            context: ctx,
        })
    }

    /// Invoke one step under the safety limits.
    ///
    /// The outer error is fatal to the run (cancellation, journal IO); the
    /// inner one halts it with an outcome.
    #[allow(clippy::too_many_arguments)]
    async fn invoke_step(
        &self,
        run_id: Uuid,
        journal: Option<&EventStore>,
        label: &str,
        step: &Step,
        input: Payload,
        tracker: &mut SafetyTracker,
        cancel: &CancellationToken,
    ) -> Result<Result<Payload, Halt>, RunError> {
        if let Err(violation) = self.limits.check(tracker) {
            return Ok(Err(Halt::safety(step, violation)));
        }

        let input_bytes = input.size_bytes();
        if let Err(violation) = self
            .limits
            .validate_payload(PayloadDirection::Input, input_bytes)
        {
            return Ok(Err(Halt::safety(step, violation)));
        }

        let key = generate_idempotency_key(run_id, &step.name, &input.to_bytes());
        self.record(
            journal,
            RunEvent::new(
                run_id,
                Some(step.name.clone()),
                RunEventType::StepStarted,
                key.clone(),
                format!("Step '{}' started", step.name),
            ),
        )
        .await?;

        let started = Instant::now();
        let mut retries: Vec<(u32, String)> = Vec::new();
        let remaining = tracker.remaining(&self.limits);
        let result = tokio::time::timeout(
            remaining,
            self.executor.execute(step, input, cancel, |attempt, e| {
                retries.push((attempt, e.to_string()))
            }),
        )
        .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        for (attempt, error) in retries {
            self.record(
                journal,
                RunEvent::new(
                    run_id,
                    Some(step.name.clone()),
                    RunEventType::StepRetrying,
                    format!("{}:retry:{}", key, attempt),
                    format!("Step '{}' attempt {} failed, retrying", step.name, attempt),
                )
                .with_attempt(attempt)
                .with_error(error),
            )
            .await?;
        }

        let output = match result {
            Err(_) => {
                let violation = SafetyViolation::RunTimeout {
                    elapsed_seconds: tracker.elapsed_seconds(),
                    limit_seconds: self.limits.run_timeout_seconds,
                };
                self.record(journal, step_failed(run_id, step, &violation.to_string(), duration_ms))
                    .await?;
                return Ok(Err(Halt::safety(step, violation)));
            }
            Ok(Err(ProviderInvocationError::Cancelled { .. })) => {
                return self.cancelled(run_id, journal, label, step).await;
            }
            Ok(Err(e)) => {
                self.record(journal, step_failed(run_id, step, &e.to_string(), duration_ms))
                    .await?;
                let output = e.output().cloned();
                return Ok(Err(Halt::failed(step, &e, output)));
            }
            Ok(Ok(output)) => output,
        };

        let output_bytes = output.payload.size_bytes();
        if let Err(violation) = self
            .limits
            .validate_payload(PayloadDirection::Output, output_bytes)
        {
            self.record(journal, step_failed(run_id, step, &violation.to_string(), duration_ms))
                .await?;
            return Ok(Err(Halt::safety(step, violation)));
        }
        tracker.record_step(input_bytes, output_bytes);

        self.record(
            journal,
            RunEvent::new(
                run_id,
                Some(step.name.clone()),
                RunEventType::StepCompleted,
                key,
                format!(
                    "Step '{}' completed in {}ms after {} attempt(s)",
                    step.name, duration_ms, output.attempts
                ),
            )
            .with_duration(duration_ms),
        )
        .await?;

        Ok(Ok(output.payload))
    }

    async fn halt(
        &self,
        run_id: Uuid,
        journal: Option<&EventStore>,
        label: &str,
        halt: Halt,
        context: ExecutionContext,
    ) -> Result<Execution, RunError> {
        let error = halt.outcome.error.clone().unwrap_or_default();
        warn!(
            %run_id,
            pipeline = %label,
            step = halt.outcome.failed_step.as_deref().unwrap_or_default(),
            error = %error,
            "Pipeline halted"
        );

        self.record(
            journal,
            RunEvent::new(
                run_id,
                None,
                halt.event_type,
                format!("{}:complete", run_id),
                format!("Pipeline '{}' halted", label),
            )
            .with_error(error),
        )
        .await?;

        Ok(Execution {
            run_id,
            outcome: halt.outcome,
            context,
        })
    }

    /// Record the cancellation; the context is discarded
    async fn cancelled<T>(
        &self,
        run_id: Uuid,
        journal: Option<&EventStore>,
        label: &str,
        step: &Step,
    ) -> Result<T, RunError> {
        info!(%run_id, step = %step.name, "Pipeline run cancelled");
        self.record(
            journal,
            RunEvent::new(
                run_id,
                Some(step.name.clone()),
                RunEventType::RunCancelled,
                format!("{}:cancel", run_id),
                format!("Pipeline '{}' cancelled", label),
            ),
        )
        .await?;

        Err(RunError::Cancelled {
            pipeline: label.to_string(),
        })
    }

    async fn record(&self, journal: Option<&EventStore>, event: RunEvent) -> Result<(), RunError> {
        match journal {
            Some(store) => store.append(&event).await.map_err(RunError::Journal),
            None => Ok(()),
        }
    }
}

fn step_failed(run_id: Uuid, step: &Step, error: &str, duration_ms: u64) -> RunEvent {
    RunEvent::new(
        run_id,
        Some(step.name.clone()),
        RunEventType::StepFailed,
        format!("{}:{}:failed", run_id, step.name),
        format!("Step '{}' failed", step.name),
    )
    .with_duration(duration_ms)
    .with_error(error.to_string())
}
