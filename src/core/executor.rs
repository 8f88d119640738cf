//! StepExecutor: builds a step's input and invokes its provider.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::context::ExecutionContext;
use super::expression::{insert_path, parse_mapping, ExpressionError};
use crate::adapters::{ProviderInvocationError, ProviderSet};
use crate::domain::{Payload, RetryPolicy, Step};

/// Invokes single steps with a timeout and transient-failure retries
#[derive(Clone)]
pub struct StepExecutor {
    providers: Arc<ProviderSet>,

    /// Timeout for steps that do not set their own
    default_timeout_seconds: u64,

    /// Retry policy for steps that do not set their own
    default_retry: RetryPolicy,
}

/// A successful invocation
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub payload: Payload,
    pub attempts: u32,
    pub duration_ms: u64,
}

impl StepExecutor {
    pub fn new(providers: Arc<ProviderSet>) -> Self {
        Self {
            providers,
            default_timeout_seconds: 30,
            default_retry: RetryPolicy::default(),
        }
    }

    pub fn with_default_timeout(mut self, seconds: u64) -> Self {
        self.default_timeout_seconds = seconds;
        self
    }

    pub fn with_default_retry(mut self, policy: RetryPolicy) -> Self {
        self.default_retry = policy;
        self
    }

    pub fn providers(&self) -> &ProviderSet {
        &self.providers
    }

    /// Build the input for the next step.
    ///
    /// Without mappings a step receives the previous step's output, or the
    /// initial payload when nothing has run yet. With mappings it receives an
    /// object holding only the mapped fields, each at its target path.
    pub fn build_input(
        step: &Step,
        ctx: &ExecutionContext,
        initial: &Payload,
    ) -> Result<Payload, ExpressionError> {
        if step.mappings.is_empty() {
            return Ok(ctx.last_output().unwrap_or(initial).clone());
        }

        let mut fields = Map::new();
        for mapping in &step.mappings {
            let value = parse_mapping(&mapping.from)?.evaluate(ctx)?;
            insert_path(&mut fields, &mapping.target(), value);
        }
        Ok(Payload::Parsed(Value::Object(fields)))
    }

    /// Invoke a step, retrying transient failures with backoff.
    ///
    /// `on_retry` is called with the failed attempt number before each retry.
    pub async fn execute<F>(
        &self,
        step: &Step,
        input: Payload,
        cancel: &CancellationToken,
        mut on_retry: F,
    ) -> Result<StepOutput, ProviderInvocationError>
    where
        F: FnMut(u32, &ProviderInvocationError) + Send,
    {
        let (provider, reference) = self.providers.resolve(step)?;
        let policy = step.retry_policy.as_ref().unwrap_or(&self.default_retry);
        let step_timeout = step.timeout(self.default_timeout_seconds);
        let started = Instant::now();
        let mut attempt = 1u32;

        loop {
            debug!(step = %step.name, provider = %provider.name(), attempt, "Invoking step");

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(ProviderInvocationError::Cancelled { step: step.name.clone() });
                }
                result = tokio::time::timeout(
                    step_timeout,
                    provider.invoke(step, &reference, input.clone()),
                ) => match result {
                    Ok(result) => result,
                    Err(_) => Err(ProviderInvocationError::Timeout {
                        step: step.name.clone(),
                        timeout: step_timeout,
                    }),
                },
            };

            match result {
                Ok(payload) => {
                    return Ok(StepOutput {
                        payload,
                        attempts: attempt,
                        duration_ms: started.elapsed().as_millis() as u64,
                    })
                }
                Err(e) if e.is_transient() && policy.should_retry(attempt) => {
                    let delay = policy.delay_for_attempt(attempt);
                    warn!(
                        step = %step.name,
                        attempt,
                        max_attempts = policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Step failed, retrying"
                    );
                    on_retry(attempt, &e);

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            return Err(ProviderInvocationError::Cancelled { step: step.name.clone() });
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => {
                    error!(step = %step.name, attempt, error = %e, "Step failed permanently");
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Mapping;
    use serde_json::json;

    fn step(mappings: Vec<Mapping>) -> Step {
        Step {
            name: "next".to_string(),
            provider: "builtin:identity".to_string(),
            mappings,
            timeout_seconds: None,
            retry_policy: None,
        }
    }

    #[test]
    fn test_input_without_mappings() {
        let initial = Payload::from(json!({"req": 1}));
        let mut ctx = ExecutionContext::empty();

        let first = StepExecutor::build_input(&step(vec![]), &ctx, &initial).unwrap();
        assert_eq!(first, initial);

        ctx.record("a", Payload::from(json!({"out": 2})));
        let second = StepExecutor::build_input(&step(vec![]), &ctx, &initial).unwrap();
        assert_eq!(second, Payload::from(json!({"out": 2})));
    }

    #[test]
    fn test_input_with_mappings_renames_fields() {
        let mut ctx = ExecutionContext::new(json!({"name": "ada"}), Default::default());
        ctx.record("a", Payload::from(json!({"id": 7, "noise": true})));

        let input = StepExecutor::build_input(
            &step(vec![
                Mapping::new("${a.id}", "team.id"),
                Mapping::new("${args.name}", "owner"),
            ]),
            &ctx,
            &Payload::default(),
        )
        .unwrap();

        assert_eq!(input, Payload::from(json!({"team": {"id": 7}, "owner": "ada"})));
    }

    #[test]
    fn test_unresolved_mapping() {
        let ctx = ExecutionContext::empty();
        let result = StepExecutor::build_input(
            &step(vec![Mapping::new("${missing.id}", "id")]),
            &ctx,
            &Payload::default(),
        );
        assert!(matches!(result, Err(ExpressionError::Unresolved(_))));
    }
}
