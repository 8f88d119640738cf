//! Run records and pipeline outcomes.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::events::{RunEvent, RunEventType, StepStatus};
use super::payload::Payload;

/// Aggregate result of one pipeline run.
///
/// Failures are reported here rather than raised, so endpoint response rules
/// can route them deliberately.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutcome {
    pub success: bool,

    /// Final step output on success; `{success: false, ...}` on failure
    pub body: Payload,

    /// Name of the step that halted the run
    pub failed_step: Option<String>,

    pub error: Option<String>,
}

impl PipelineOutcome {
    pub fn succeeded(body: Payload) -> Self {
        Self {
            success: true,
            body,
            failed_step: None,
            error: None,
        }
    }

    /// Build a failure outcome. Structured failure output from the step is
    /// merged into the body; otherwise the error message is exposed as `error`.
    pub fn failed(step: impl Into<String>, error: impl Into<String>, output: Option<Value>) -> Self {
        let error = error.into();
        let mut body = match output {
            Some(Value::Object(map)) => map,
            Some(Value::Null) | None => {
                let mut map = Map::new();
                map.insert("error".to_string(), Value::String(error.clone()));
                map
            }
            Some(other) => {
                let mut map = Map::new();
                map.insert("error".to_string(), Value::String(error.clone()));
                map.insert("output".to_string(), other);
                map
            }
        };
        body.insert("success".to_string(), Value::Bool(false));

        Self {
            success: false,
            body: Payload::Parsed(Value::Object(body)),
            failed_step: Some(step.into()),
            error: Some(error),
        }
    }

    pub fn value(&self) -> Value {
        self.body.as_value()
    }
}

/// Journal view of one run, folded from its events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub pipeline_name: String,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Steps (hooks included) that completed
    pub steps_completed: usize,

    /// Latest status per step, keyed by step name
    pub step_statuses: BTreeMap<String, StepStatus>,

    /// Step whose failure ended the run
    pub failed_step: Option<String>,
}

impl Run {
    fn empty(first: &RunEvent) -> Self {
        Self {
            id: first.run_id,
            pipeline_name: String::new(),
            state: RunState::Running,
            started_at: first.timestamp,
            completed_at: None,
            steps_completed: 0,
            step_statuses: BTreeMap::new(),
            failed_step: None,
        }
    }

    /// Fold a journal into a run; `None` when nothing was journaled
    pub fn from_events(events: &[RunEvent]) -> Option<Self> {
        let mut run = Self::empty(events.first()?);
        events.iter().for_each(|e| run.apply_event(e));
        Some(run)
    }

    pub fn apply_event(&mut self, event: &RunEvent) {
        if event.event_type.is_terminal() {
            self.completed_at = Some(event.timestamp);
        }
        let error = || event.error.clone().unwrap_or_default();

        match event.event_type {
            RunEventType::RunStarted => {
                self.state = RunState::Running;
                self.started_at = event.timestamp;
                self.pipeline_name = event.step_id.clone().unwrap_or_default();
            }
            RunEventType::RunCompleted => self.state = RunState::Completed,
            RunEventType::RunFailed => self.state = RunState::Failed { error: error() },
            RunEventType::RunCancelled => self.state = RunState::Cancelled,
            RunEventType::SafetyLimitReached => {
                self.state = RunState::SafetyLimitReached { limit: error() }
            }
            RunEventType::StepStarted
            | RunEventType::StepRetrying
            | RunEventType::StepCompleted
            | RunEventType::StepFailed => {
                let Some(step) = &event.step_id else { return };
                self.step_statuses.insert(step.clone(), event.status);
                match event.event_type {
                    RunEventType::StepCompleted => self.steps_completed += 1,
                    RunEventType::StepFailed => self.failed_step = Some(step.clone()),
                    _ => {}
                }
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == RunState::Running
    }

    pub fn is_step_completed(&self, step_name: &str) -> bool {
        self.step_statuses.get(step_name) == Some(&StepStatus::Completed)
    }

    /// Wall-clock time from start to the terminal event
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.completed_at.map(|end| end - self.started_at)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RunState {
    #[default]
    Running,
    Completed,
    Failed { error: String },
    Cancelled,
    SafetyLimitReached { limit: String },
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => f.write_str("running"),
            Self::Completed => f.write_str("completed"),
            Self::Failed { error } => write!(f, "failed: {}", error),
            Self::Cancelled => f.write_str("cancelled"),
            Self::SafetyLimitReached { limit } => write!(f, "halted: {}", limit),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_failed_outcome_merges_step_output() {
        let outcome = PipelineOutcome::failed(
            "validate",
            "validation failed",
            Some(json!({"field1": "x", "field2": "y"})),
        );

        assert!(!outcome.success);
        assert_eq!(
            outcome.value(),
            json!({"success": false, "field1": "x", "field2": "y"})
        );
        assert_eq!(outcome.failed_step.as_deref(), Some("validate"));
    }

    #[test]
    fn test_failed_outcome_without_output() {
        let outcome = PipelineOutcome::failed("call", "timed out", None);
        assert_eq!(
            outcome.value(),
            json!({"success": false, "error": "timed out"})
        );
    }

    fn event(run_id: Uuid, step: Option<&str>, event_type: RunEventType) -> RunEvent {
        RunEvent::new(
            run_id,
            step.map(str::to_string),
            event_type,
            format!("{}:{}", run_id, step.unwrap_or("run")),
            String::new(),
        )
    }

    #[test]
    fn test_run_from_events() {
        let run_id = Uuid::new_v4();
        let events = vec![
            event(run_id, Some("create_team"), RunEventType::RunStarted),
            event(run_id, Some("step1"), RunEventType::StepStarted),
            event(run_id, Some("step1"), RunEventType::StepCompleted),
            event(run_id, None, RunEventType::RunCompleted),
        ];

        let run = Run::from_events(&events).unwrap();

        assert_eq!(run.id, run_id);
        assert_eq!(run.pipeline_name, "create_team");
        assert_eq!(run.state, RunState::Completed);
        assert!(run.is_step_completed("step1"));
        assert_eq!(run.steps_completed, 1);
        assert!(run.duration().is_some());
    }

    #[test]
    fn test_failed_step_is_remembered() {
        let run_id = Uuid::new_v4();
        let events = vec![
            event(run_id, Some("p"), RunEventType::RunStarted),
            event(run_id, Some("call"), RunEventType::StepStarted),
            event(run_id, Some("call"), RunEventType::StepRetrying),
            event(run_id, Some("call"), RunEventType::StepFailed),
            event(run_id, None, RunEventType::RunFailed).with_error("boom".to_string()),
        ];

        let run = Run::from_events(&events).unwrap();

        assert_eq!(run.failed_step.as_deref(), Some("call"));
        assert_eq!(run.step_statuses.get("call"), Some(&StepStatus::Failed));
        assert_eq!(run.state.to_string(), "failed: boom");
        assert!(Run::from_events(&[]).is_none());
    }
}
