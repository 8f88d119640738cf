//! Run journal events.
//!
//! A journaled run is an append-only sequence of these records; `Run` is
//! derived by replaying them. Payloads are never journaled, only summaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub run_id: Uuid,

    /// Step the event concerns; the pipeline label on `RunStarted`
    pub step_id: Option<String>,

    pub event_type: RunEventType,

    /// `{run_id}:{step}:{input_hash}` for step events
    pub idempotency_key: String,

    pub payload_summary: String,

    /// Derived from `event_type`
    pub status: StepStatus,

    /// Attempt number that failed, on `StepRetrying`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,

    pub duration_ms: Option<u64>,
    pub error: Option<String>,
}

impl RunEvent {
    pub fn new(
        run_id: Uuid,
        step_id: Option<String>,
        event_type: RunEventType,
        idempotency_key: String,
        payload_summary: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id,
            step_id,
            event_type,
            idempotency_key,
            payload_summary,
            status: event_type.status(),
            attempt: None,
            duration_ms: None,
            error: None,
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEventType {
    RunStarted,
    RunCompleted,

    /// The pipeline halted on a failing step
    RunFailed,

    /// The caller cancelled the run
    RunCancelled,

    StepStarted,
    StepCompleted,
    StepFailed,

    /// A transient failure is being retried
    StepRetrying,

    SafetyLimitReached,
}

impl RunEventType {
    /// Status a step or run has after this event
    pub fn status(self) -> StepStatus {
        match self {
            Self::RunStarted | Self::StepStarted | Self::StepRetrying => StepStatus::Running,
            Self::RunCompleted | Self::StepCompleted => StepStatus::Completed,
            Self::RunFailed | Self::RunCancelled | Self::StepFailed | Self::SafetyLimitReached => {
                StepStatus::Failed
            }
        }
    }

    /// Whether the event closes the run
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::RunCompleted | Self::RunFailed | Self::RunCancelled | Self::SafetyLimitReached
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = RunEvent::new(
            Uuid::new_v4(),
            Some("hash".to_string()),
            RunEventType::StepRetrying,
            "test-key".to_string(),
            "Retrying hash step".to_string(),
        )
        .with_attempt(2);

        let json = serde_json::to_string(&event).unwrap();
        let parsed: RunEvent = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.event_type, RunEventType::StepRetrying);
        assert_eq!(parsed.status, StepStatus::Running);
        assert_eq!(parsed.attempt, Some(2));
        assert!(json.contains("\"step_retrying\""));
    }

    #[test]
    fn test_status_follows_event_type() {
        assert_eq!(RunEventType::StepCompleted.status(), StepStatus::Completed);
        assert_eq!(RunEventType::SafetyLimitReached.status(), StepStatus::Failed);
        assert!(RunEventType::RunCancelled.is_terminal());
        assert!(!RunEventType::StepFailed.is_terminal());
    }

    #[test]
    fn test_attempt_omitted_when_unset() {
        let event = RunEvent::new(
            Uuid::new_v4(),
            None,
            RunEventType::RunStarted,
            "k".to_string(),
            "started".to_string(),
        );
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("attempt"));
    }
}
