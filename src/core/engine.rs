//! Engine: wires snapshots, runner, router, scheduler and the row store.
//!
//! Request endpoints, subscription events, jobs and column transforms all
//! execute through the same `PipelineRunner`, against the snapshot that is
//! current when the unit of work starts.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::column::ColumnTransformPipeline;
use super::context::ExecutionContext;
use super::executor::StepExecutor;
use super::ids::IdGenerator;
use super::link::ConfigErrors;
use super::model::ConfigModel;
use super::response::{EndpointResponse, ResponseSelector, SelectError};
use super::router::{EventRouter, PublishReport};
use super::runner::{Execution, PipelineRunner, RunError};
use super::scheduler::JobScheduler;
use super::snapshot::SnapshotStore;
use crate::adapters::container::ContainerProvider;
use crate::adapters::ProviderSet;
use crate::config::EngineSettings;
use crate::domain::{Document, ImageRef, Payload, PayloadError, PipelineOutcome, Trigger};
use crate::storage::MemoryStore;

/// Why a request produced no shaped response
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("Unknown endpoint '{0}'")]
    UnknownEndpoint(String),

    #[error("Endpoint '{0}' delivers subscription events and takes no requests")]
    SubscriptionOnly(String),

    #[error("Unacceptable request body: {0}")]
    Payload(#[from] PayloadError),

    #[error(transparent)]
    Run(#[from] RunError),

    #[error(transparent)]
    Select(#[from] SelectError),
}

impl RequestError {
    /// Status the HTTP layer should answer with
    pub fn status(&self) -> u16 {
        match self {
            RequestError::UnknownEndpoint(_) => 404,
            RequestError::SubscriptionOnly(_) => 405,
            RequestError::Payload(_) => 400,
            RequestError::Run(RunError::Cancelled { .. }) => 503,
            RequestError::Run(_) => 500,
            RequestError::Select(e) => e.status(),
        }
    }
}

pub struct Engine {
    snapshots: Arc<SnapshotStore>,
    runner: PipelineRunner,
    router: EventRouter,
    scheduler: Arc<JobScheduler>,
    store: Arc<MemoryStore>,
}

impl Engine {
    pub fn new(
        snapshots: Arc<SnapshotStore>,
        runner: PipelineRunner,
        ids: Arc<IdGenerator>,
        channel_capacity: usize,
    ) -> Self {
        let router = EventRouter::new(snapshots.clone(), runner.clone(), channel_capacity);
        let scheduler = Arc::new(JobScheduler::new(snapshots.clone(), runner.clone()));
        let store = Arc::new(
            MemoryStore::new(snapshots.clone(), ColumnTransformPipeline::new(&runner), ids)
                .with_sink(Arc::new(router.clone())),
        );

        Self {
            snapshots,
            runner,
            router,
            scheduler,
            store,
        }
    }

    /// Build an engine for `document` from resolved settings
    pub fn from_settings(document: Document, settings: &EngineSettings) -> Result<Self> {
        let mut container = ContainerProvider::new(settings.launcher.clone());
        for builder in &document.step_builders {
            let image = builder.image.trim();
            let image: ImageRef = image
                .strip_prefix("docker:")
                .unwrap_or(image)
                .parse()
                .with_context(|| format!("Invalid image for step builder '{}'", builder.name))?;
            container = container.with_builder(builder.name.clone(), image);
        }

        let providers = ProviderSet::new().with_external(Arc::new(container));
        let executor = StepExecutor::new(Arc::new(providers))
            .with_default_timeout(settings.step_timeout_seconds)
            .with_default_retry(settings.retry.clone());

        let mut runner = PipelineRunner::new(executor).with_limits(settings.safety_limits());
        if settings.journal {
            runner = runner.with_journal(settings.runs_dir());
        }

        let snapshots = Arc::new(SnapshotStore::from_document(document)?);
        let ids = Arc::new(IdGenerator::new(settings.node_id)?);

        Ok(Self::new(snapshots, runner, ids, settings.channel_capacity)
            .with_max_poll(Duration::from_secs(settings.max_poll_seconds)))
    }

    /// Longest scheduler sleep between ticks
    pub fn with_max_poll(mut self, max_poll: Duration) -> Self {
        self.scheduler = Arc::new(
            JobScheduler::new(self.snapshots.clone(), self.runner.clone()).with_max_poll(max_poll),
        );
        self
    }

    pub fn model(&self) -> Arc<ConfigModel> {
        self.snapshots.current()
    }

    pub fn snapshots(&self) -> &Arc<SnapshotStore> {
        &self.snapshots
    }

    pub fn runner(&self) -> &PipelineRunner {
        &self.runner
    }

    pub fn router(&self) -> &EventRouter {
        &self.router
    }

    pub fn scheduler(&self) -> &Arc<JobScheduler> {
        &self.scheduler
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// Swap in a new document; the current snapshot stays on failure
    pub fn reload(&self, document: Document) -> Result<Arc<ConfigModel>, ConfigErrors> {
        self.snapshots.reload(document)
    }

    /// Run a named pipeline directly
    pub async fn run_pipeline(
        &self,
        pipeline: &str,
        args: Value,
        initial: Payload,
        cancel: &CancellationToken,
    ) -> Result<Execution, RunError> {
        let model = self.snapshots.current();
        self.runner.run(&model, pipeline, args, initial, cancel).await
    }

    /// Execute a request endpoint and shape its response.
    ///
    /// The body is interpreted once, by the endpoint's declared `accepts`
    /// type or else the request's content type. Pipeline failures are not
    /// errors: they reach the response rules as a failed outcome.
    #[instrument(skip(self, body, args, cancel))]
    pub async fn handle_request(
        &self,
        endpoint: &str,
        body: Vec<u8>,
        content_type: Option<&str>,
        args: Value,
        cancel: &CancellationToken,
    ) -> Result<EndpointResponse, RequestError> {
        let model = self.snapshots.current();
        let found = model
            .endpoint(endpoint)
            .ok_or_else(|| RequestError::UnknownEndpoint(endpoint.to_string()))?;
        if found.is_subscription() {
            return Err(RequestError::SubscriptionOnly(endpoint.to_string()));
        }

        let content_type = found.accepts.as_deref().or(content_type);
        let initial = Payload::interpret(body, content_type)?;

        let (outcome, context) = match &found.pipeline {
            Some(pipeline) => {
                let execution = self.runner.run(&model, pipeline, args, initial, cancel).await?;
                (execution.outcome, execution.context)
            }
            None => (
                PipelineOutcome::succeeded(initial),
                ExecutionContext::new(args, model.env()),
            ),
        };

        if found.responses.is_empty() {
            debug!("Endpoint declares no response rules");
            let status = if outcome.success { 200 } else { 500 };
            return Ok(EndpointResponse {
                status,
                body: outcome.body,
            });
        }

        let response = ResponseSelector::select(endpoint, &found.responses, &outcome, &context)?;
        info!(status = response.status, success = outcome.success, "Request handled");
        Ok(response)
    }

    /// Route a table or custom event to subscription endpoints
    pub async fn publish(&self, trigger: Trigger) -> Vec<PublishReport> {
        self.router.publish(trigger).await
    }

    /// Run the job scheduler until cancelled
    pub async fn serve(&self, cancel: CancellationToken) {
        self.scheduler.run(cancel.clone()).await;
        self.router.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const DOC: &str = r#"
apis:
  pipelines:
    - name: echo
      steps:
        - name: copy
          provider: builtin:identity
  rest:
    endpoints:
      - name: echo
        pipeline: echo
        accepts: application/json
        responses:
          - status: 200
            when: success
      - name: feed
        pipeline: echo
        subscription:
          sources: ["custom:tick"]
      - name: bare
"#;

    fn engine() -> Engine {
        let snapshots = Arc::new(SnapshotStore::from_document(Document::from_yaml(DOC).unwrap()).unwrap());
        let runner = PipelineRunner::new(StepExecutor::new(Arc::new(ProviderSet::new())));
        Engine::new(snapshots, runner, Arc::new(IdGenerator::new(0).unwrap()), 8)
    }

    #[tokio::test]
    async fn test_request_runs_pipeline_and_selects_response() {
        let engine = engine();
        let response = engine
            .handle_request(
                "echo",
                br#"{"a": 1}"#.to_vec(),
                None,
                Value::Null,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.body, Payload::from(json!({"a": 1})));
    }

    #[tokio::test]
    async fn test_request_errors_map_to_status() {
        let engine = engine();
        let cancel = CancellationToken::new();

        let unknown = engine
            .handle_request("nope", Vec::new(), None, Value::Null, &cancel)
            .await
            .unwrap_err();
        assert_eq!(unknown.status(), 404);

        let subscription = engine
            .handle_request("feed", Vec::new(), None, Value::Null, &cancel)
            .await
            .unwrap_err();
        assert_eq!(subscription.status(), 405);

        let malformed = engine
            .handle_request("echo", b"{".to_vec(), None, Value::Null, &cancel)
            .await
            .unwrap_err();
        assert_eq!(malformed.status(), 400);
    }

    #[tokio::test]
    async fn test_endpoint_without_pipeline_echoes_body() {
        let engine = engine();
        let response = engine
            .handle_request(
                "bare",
                b"hello".to_vec(),
                Some("text/plain"),
                Value::Null,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.body, Payload::from(json!("hello")));
    }
}
