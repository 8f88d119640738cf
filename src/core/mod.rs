//! Core engine logic.
//!
//! This module contains:
//! - Link / Snapshot: document validation and copy-on-write config snapshots
//! - Expression / Context: reference resolution against a run's context
//! - Executor / Runner: step invocation and pipeline execution
//! - Column / Response: column transforms and response shaping
//! - Router / Scheduler: subscription delivery and scheduled jobs
//! - EventStore / Safety: run journals and runaway protection

pub mod column;
pub mod context;
pub mod engine;
pub mod event_store;
pub mod executor;
pub mod expression;
pub mod ids;
pub mod link;
pub mod model;
pub mod response;
pub mod router;
pub mod runner;
pub mod safety;
pub mod schedule;
pub mod scheduler;
pub mod snapshot;

// Re-export commonly used types
pub use column::{ColumnTransformPipeline, TransformError, TransformPhase};
pub use context::ExecutionContext;
pub use engine::{Engine, RequestError};
pub use event_store::{generate_idempotency_key, hash_input, EventStore};
pub use executor::{StepExecutor, StepOutput};
pub use expression::{ExpressionError, UnresolvedReferenceError};
pub use ids::{IdError, IdGenerator};
pub use link::{link, ConfigErrors, ConfigValidationError};
pub use model::{ConfigModel, ForeignKeyRef, SubscriptionBinding};
pub use response::{EndpointResponse, NoResponseMatchedError, ResponseSelector, YieldSpec};
pub use router::{Delivery, EventRouter, PublishReport, RouteError};
pub use runner::{Execution, PipelineRunner, RunError};
pub use safety::{PayloadDirection, SafetyLimits, SafetyTracker, SafetyViolation};
pub use schedule::{Schedule, ScheduleError};
pub use scheduler::{Dispatch, JobScheduler, JobTick};
pub use snapshot::SnapshotStore;
