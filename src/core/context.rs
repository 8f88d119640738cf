//! Per-invocation execution state.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::domain::{Payload, PipelineOutcome};

/// Transient state for one request, event delivery, job tick or column
/// transform.
///
/// Step outputs are append-only: each is recorded under its step name and
/// later steps can read but never replace them. Only explicit steps take a
/// position, so `pipeline[i]` is unaffected by the hooks in effect.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    args: Value,
    env: Arc<BTreeMap<String, String>>,
    steps: Vec<(String, Payload)>,

    /// Indices into `steps` of the explicit steps, in order
    explicit: Vec<usize>,

    outcome: Option<OutcomeView>,
}

/// The outcome a response rule or subscription mapping is evaluated against
#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeView {
    pub body: Value,
    pub success: bool,
}

impl ExecutionContext {
    pub fn new(args: Value, env: Arc<BTreeMap<String, String>>) -> Self {
        Self {
            args,
            env,
            steps: Vec::new(),
            explicit: Vec::new(),
            outcome: None,
        }
    }

    /// Context with no arguments and no environment
    pub fn empty() -> Self {
        Self::new(Value::Object(Map::new()), Arc::new(BTreeMap::new()))
    }

    /// Attach a finished pipeline outcome so expressions can address it
    pub fn with_outcome(mut self, outcome: &PipelineOutcome) -> Self {
        self.outcome = Some(OutcomeView {
            body: outcome.value(),
            success: outcome.success,
        });
        self
    }

    /// Replace the outcome view with an already shaped value (e.g. after yield)
    pub fn with_outcome_value(mut self, body: Value, success: bool) -> Self {
        self.outcome = Some(OutcomeView { body, success });
        self
    }

    /// Record an explicit step's output, addressable by name and index
    pub fn record(&mut self, step: impl Into<String>, output: Payload) {
        self.explicit.push(self.steps.len());
        self.steps.push((step.into(), output));
    }

    /// Record a hook's output, addressable by name only
    pub fn record_hook(&mut self, step: impl Into<String>, output: Payload) {
        self.steps.push((step.into(), output));
    }

    /// Output of the most recent step with this name
    pub fn step(&self, name: &str) -> Option<&Payload> {
        self.steps
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, p)| p)
    }

    /// Output of the explicit step at a position
    pub fn step_at(&self, index: usize) -> Option<&Payload> {
        let slot = *self.explicit.get(index)?;
        self.steps.get(slot).map(|(_, p)| p)
    }

    pub fn last_output(&self) -> Option<&Payload> {
        self.steps.last().map(|(_, p)| p)
    }

    /// Index the next explicit step will take
    pub fn position(&self) -> usize {
        self.explicit.len()
    }

    pub fn steps(&self) -> impl Iterator<Item = (&str, &Payload)> {
        self.steps.iter().map(|(n, p)| (n.as_str(), p))
    }

    pub fn args(&self) -> &Value {
        &self.args
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn env_var(&self, name: &str) -> Option<&str> {
        self.env.get(name).map(String::as_str)
    }

    pub fn outcome(&self) -> Option<&OutcomeView> {
        self.outcome.as_ref()
    }
}
