//! Domain types for the pipeline engine.
//!
//! This module contains the core data structures:
//! - Document: the assembled, read-only configuration tree
//! - Payload: data flowing between steps, and provider references
//! - Trigger: table and custom events that start subscription pipelines
//! - RunEvent / Run: journal entries and the run state derived from them

pub mod document;
pub mod events;
pub mod payload;
pub mod run;
pub mod trigger;

// Re-export commonly used types
pub use document::{
    Column, ColumnPipeline, ColumnType, Constraint, ConstraintKind, DefaultPolicy, Document,
    Endpoint, Hook, HookPosition, Hooks, HttpMethod, Job, Mapping, Pipeline, PlannedStep,
    ReferentialAction, ResponseRule, RetryPolicy, Step, Table,
};
pub use events::{RunEvent, RunEventType, StepStatus};
pub use payload::{ImageRef, Payload, PayloadError, ProviderRef, ProviderRefError};
pub use run::{PipelineOutcome, Run, RunState};
pub use trigger::{ChangeKind, CustomEvent, SubscriptionSource, TableEvent, Trigger};
