//! Step providers.
//!
//! A provider runs one step's business logic. Built-in functions execute
//! in-process; everything else is handed to an execution backend that runs
//! a container image. The runner only ever sees the [`Provider`] trait.

pub mod builtin;
pub mod container;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::domain::{Payload, ProviderRef, Step};

pub use builtin::BuiltinProvider;
pub use container::ContainerProvider;

/// Failure reported by a provider invocation
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderInvocationError {
    #[error("Step '{step}' timed out after {timeout:?}")]
    Timeout { step: String, timeout: Duration },

    #[error("Provider for step '{step}' is unreachable: {message}")]
    Unreachable { step: String, message: String },

    /// Explicit failure signal from the provider
    #[error("Step '{step}' failed: {message}")]
    Failed {
        step: String,
        exit_code: Option<i32>,
        message: String,
        /// Structured failure fields returned alongside the signal
        output: Option<Value>,
    },

    #[error("No provider can run '{provider}' for step '{step}'")]
    Unsupported { step: String, provider: String },

    #[error("Step '{step}' was cancelled")]
    Cancelled { step: String },
}

impl ProviderInvocationError {
    /// Timeouts and unreachable backends are worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Unreachable { .. })
    }

    /// Structured output carried by an explicit failure
    pub fn output(&self) -> Option<&Value> {
        match self {
            Self::Failed { output, .. } => output.as_ref(),
            _ => None,
        }
    }
}

/// Trait for step providers
#[async_trait]
pub trait Provider: Send + Sync {
    /// Human-readable provider name
    fn name(&self) -> &str;

    /// Run a step with a resolved input. Timeouts are enforced by the caller;
    /// dropping the future must abort the invocation.
    async fn invoke(
        &self,
        step: &Step,
        provider: &ProviderRef,
        input: Payload,
    ) -> Result<Payload, ProviderInvocationError>;

    /// Check that the backend is usable
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// Routes each step to the provider able to run it
#[derive(Clone)]
pub struct ProviderSet {
    builtin: Arc<BuiltinProvider>,
    external: Option<Arc<dyn Provider>>,
    /// Exact provider strings bound to a specific implementation
    overrides: HashMap<String, Arc<dyn Provider>>,
}

impl Default for ProviderSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderSet {
    /// Built-in functions only
    pub fn new() -> Self {
        Self {
            builtin: Arc::new(BuiltinProvider),
            external: None,
            overrides: HashMap::new(),
        }
    }

    /// Use `provider` for every non built-in step
    pub fn with_external(mut self, provider: Arc<dyn Provider>) -> Self {
        self.external = Some(provider);
        self
    }

    /// Bind an exact provider reference (e.g. `builtin:flaky`) to an implementation
    pub fn register(mut self, reference: impl Into<String>, provider: Arc<dyn Provider>) -> Self {
        self.overrides.insert(reference.into(), provider);
        self
    }

    /// Pick the provider for a step and parse its reference
    pub fn resolve(
        &self,
        step: &Step,
    ) -> Result<(Arc<dyn Provider>, ProviderRef), ProviderInvocationError> {
        let unsupported = || ProviderInvocationError::Unsupported {
            step: step.name.clone(),
            provider: step.provider.clone(),
        };

        let reference: ProviderRef = step.provider.parse().map_err(|_| unsupported())?;

        if let Some(provider) = self.overrides.get(step.provider.trim()) {
            return Ok((provider.clone(), reference));
        }

        if reference.is_builtin() {
            return Ok((self.builtin.clone(), reference));
        }

        match &self.external {
            Some(provider) => Ok((provider.clone(), reference)),
            None => Err(unsupported()),
        }
    }

    pub async fn health_check(&self) -> Result<()> {
        if let Some(external) = &self.external {
            external.health_check().await?;
        }
        Ok(())
    }
}
