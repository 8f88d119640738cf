//! ColumnTransformPipeline: per-column `args`, `write` and `read` steps.
//!
//! Transforms run inline inside the surrounding row operation, one value at a
//! time, and take no engine-level locks. Global hooks do not apply here and
//! transform runs are not journaled.

use std::fmt;

use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::context::ExecutionContext;
use super::model::ConfigModel;
use super::runner::{PipelineRunner, RunError};
use crate::domain::document::{Column, ColumnPipeline, Table};
use crate::domain::{Payload, Step};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransformPhase {
    /// Predicate values on both read and write paths
    Args,
    /// Values about to be persisted
    Write,
    /// Values about to be returned
    Read,
}

impl TransformPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Args => "args",
            Self::Write => "write",
            Self::Read => "read",
        }
    }

    fn steps(self, pipeline: &ColumnPipeline) -> &[Step] {
        match self {
            Self::Args => &pipeline.args,
            Self::Write => &pipeline.write,
            Self::Read => &pipeline.read,
        }
    }
}

impl fmt::Display for TransformPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("Column '{table}.{column}' {phase} transform failed at step '{step}': {message}")]
    Failed {
        table: String,
        column: String,
        phase: TransformPhase,
        step: String,
        message: String,
    },

    #[error(transparent)]
    Run(#[from] RunError),
}

/// Applies column transforms through the shared runner
#[derive(Clone)]
pub struct ColumnTransformPipeline {
    runner: PipelineRunner,
}

impl ColumnTransformPipeline {
    pub fn new(runner: &PipelineRunner) -> Self {
        Self {
            runner: runner.without_journal(),
        }
    }

    /// Whether `column` has any step for `phase`
    pub fn has_phase(column: &Column, phase: TransformPhase) -> bool {
        column
            .pipeline
            .as_ref()
            .map_or(false, |p| !phase.steps(p).is_empty())
    }

    /// Transform one value. Columns without steps for `phase` pass it through.
    ///
    /// Steps see `args.table`, `args.column`, `args.phase` and `args.value`;
    /// the first step without mappings receives the value itself.
    pub async fn apply(
        &self,
        model: &ConfigModel,
        table: &str,
        column: &Column,
        phase: TransformPhase,
        value: Value,
        cancel: &CancellationToken,
    ) -> Result<Value, TransformError> {
        let Some(pipeline) = &column.pipeline else {
            return Ok(value);
        };
        let steps: Vec<&Step> = phase.steps(pipeline).iter().collect();
        if steps.is_empty() {
            return Ok(value);
        }

        debug!(table, column = %column.name, %phase, steps = steps.len(), "Applying column transform");

        let args = json!({
            "table": table,
            "column": column.name,
            "phase": phase.as_str(),
            "value": value,
        });
        let label = format!("{}.{}:{}", table, column.name, phase);
        let execution = self
            .runner
            .run_steps(
                &label,
                &steps,
                ExecutionContext::new(args, model.env()),
                Payload::Parsed(value),
                cancel,
            )
            .await?;

        let outcome = execution.outcome;
        if !outcome.success {
            return Err(TransformError::Failed {
                table: table.to_string(),
                column: column.name.clone(),
                phase,
                step: outcome.failed_step.unwrap_or_default(),
                message: outcome.error.unwrap_or_default(),
            });
        }
        Ok(outcome.body.as_value())
    }

    /// Transform every field of `row` whose column has steps for `phase`
    pub async fn apply_row(
        &self,
        model: &ConfigModel,
        table: &Table,
        phase: TransformPhase,
        row: Map<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<Map<String, Value>, TransformError> {
        let mut transformed = Map::with_capacity(row.len());
        for (name, value) in row {
            let value = match table.column(&name) {
                Some(column) if Self::has_phase(column, phase) => {
                    self.apply(model, &table.name, column, phase, value, cancel)
                        .await?
                }
                _ => value,
            };
            transformed.insert(name, value);
        }
        Ok(transformed)
    }
}
