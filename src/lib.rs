//! stepline - declarative pipeline engine
//!
//! Executes the pipelines declared in an assembled configuration document:
//! request endpoints, table and custom event subscriptions, column
//! transforms and scheduled jobs all run through one step runner.
//!
//! # Architecture
//!
//! - A document is linked once into an immutable `ConfigModel` snapshot;
//!   reloads swap in a new snapshot while in-flight runs keep theirs
//! - Steps run strictly in order and may only read earlier outputs
//! - A failing step halts the run with a structured `{success: false}`
//!   outcome that response rules can route
//! - Runs can be journaled as append-only events and replayed
//!
//! # Modules
//!
//! - `adapters`: Step providers (built-in functions, containers)
//! - `core`: Linking, expressions, runner, router, scheduler
//! - `domain`: Document, payload, trigger and journal types
//! - `storage`: Row store contract and in-memory reference store
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Validate a document
//! stepline -d app.yaml validate
//!
//! # Run a pipeline
//! echo '{"name": "x"}' | stepline -d app.yaml run create_team -t application/json
//!
//! # Check run status
//! stepline status <run-id>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod storage;

// Re-export main types at crate root for convenience
pub use core::{ConfigModel, Engine, PipelineRunner, SnapshotStore};
pub use domain::{Document, Payload, PipelineOutcome, Run, RunState, TableEvent, Trigger};
