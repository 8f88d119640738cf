//! EventRouter: runs subscription pipelines for table and custom events.
//!
//! Each subscription endpoint owns a broadcast channel. An event triggers
//! every matching endpoint's pipeline once, and the computed delivery is
//! broadcast, so each subscriber of that endpoint receives it exactly once.
//! No ordering is guaranteed across endpoints or subscribers.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::model::ConfigModel;
use super::response::{EndpointResponse, ResponseSelector};
use super::runner::{PipelineRunner, RunError};
use super::snapshot::SnapshotStore;
use crate::domain::{Payload, PipelineOutcome, TableEvent, Trigger};
use crate::storage::EventSink;

/// What subscribers of an endpoint receive for one event
#[derive(Debug, Clone)]
pub struct Delivery {
    pub endpoint: String,
    pub trigger: Trigger,
    pub run_id: Uuid,
    pub outcome: PipelineOutcome,

    /// Shaped by the endpoint's response rules, when it declares any
    pub response: Option<EndpointResponse>,
}

impl Delivery {
    /// Body to send: the shaped response if any, else the outcome body
    pub fn body(&self) -> &Payload {
        self.response
            .as_ref()
            .map_or(&self.outcome.body, |r| &r.body)
    }
}

/// Result of routing one event to one endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct PublishReport {
    pub endpoint: String,
    pub run_id: Uuid,
    pub success: bool,

    /// Subscribers the delivery was handed to
    pub receivers: usize,
}

#[derive(Debug, Error, PartialEq)]
pub enum RouteError {
    #[error("Unknown endpoint '{0}'")]
    UnknownEndpoint(String),

    #[error("Endpoint '{0}' is not a subscription endpoint")]
    NotSubscription(String),
}

struct RouterInner {
    snapshots: Arc<SnapshotStore>,
    runner: PipelineRunner,
    capacity: usize,
    channels: Mutex<HashMap<String, broadcast::Sender<Arc<Delivery>>>>,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct EventRouter {
    inner: Arc<RouterInner>,
}

impl EventRouter {
    pub fn new(snapshots: Arc<SnapshotStore>, runner: PipelineRunner, capacity: usize) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                snapshots,
                runner,
                capacity: capacity.max(1),
                channels: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Subscribe to an endpoint's deliveries
    pub fn subscribe(&self, endpoint: &str) -> Result<broadcast::Receiver<Arc<Delivery>>, RouteError> {
        let model = self.inner.snapshots.current();
        let found = model
            .endpoint(endpoint)
            .ok_or_else(|| RouteError::UnknownEndpoint(endpoint.to_string()))?;
        if !found.is_subscription() {
            return Err(RouteError::NotSubscription(endpoint.to_string()));
        }

        debug!(endpoint, "New subscriber");
        Ok(self.sender(endpoint).subscribe())
    }

    /// Current number of subscribers of an endpoint
    pub fn subscriber_count(&self, endpoint: &str) -> usize {
        self.inner
            .channels
            .lock()
            .get(endpoint)
            .map_or(0, |tx| tx.receiver_count())
    }

    /// Abort in-flight subscription runs
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    fn sender(&self, endpoint: &str) -> broadcast::Sender<Arc<Delivery>> {
        let mut channels = self.inner.channels.lock();
        channels
            .entry(endpoint.to_string())
            .or_insert_with(|| broadcast::channel(self.inner.capacity).0)
            .clone()
    }

    /// Route an event to every matching subscription endpoint.
    ///
    /// Matching pipelines run concurrently against the snapshot current at
    /// publish time. Endpoints whose run is cancelled are left out of the
    /// returned reports.
    pub async fn publish(&self, trigger: Trigger) -> Vec<PublishReport> {
        let model = self.inner.snapshots.current();
        let mut tasks = JoinSet::new();

        for binding in model.subscriptions() {
            if !binding.sources.iter().any(|s| s.matches(&trigger)) {
                continue;
            }

            let router = self.clone();
            let model = model.clone();
            let trigger = trigger.clone();
            let endpoint = binding.endpoint.clone();
            let pipeline = binding.pipeline.clone();
            tasks.spawn(async move { router.deliver(&model, endpoint, pipeline, trigger).await });
        }

        if tasks.is_empty() {
            debug!("No subscription matched event");
        }

        let mut reports = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(report)) => reports.push(report),
                Ok(None) => {}
                Err(e) => error!(error = %e, "Subscription task failed"),
            }
        }
        reports
    }

    async fn deliver(
        &self,
        model: &ConfigModel,
        endpoint: String,
        pipeline: String,
        trigger: Trigger,
    ) -> Option<PublishReport> {
        let event = trigger.to_value();
        let cancel = self.inner.shutdown.child_token();

        let execution = match self
            .inner
            .runner
            .run(model, &pipeline, event.clone(), Payload::Parsed(event), &cancel)
            .await
        {
            Ok(execution) => execution,
            Err(RunError::Cancelled { .. }) => {
                info!(%endpoint, "Subscription run cancelled");
                return None;
            }
            Err(e) => {
                error!(%endpoint, error = %e, "Subscription run failed");
                return None;
            }
        };

        let response = model
            .endpoint(&endpoint)
            .filter(|e| !e.responses.is_empty())
            .and_then(|e| {
                ResponseSelector::select(&endpoint, &e.responses, &execution.outcome, &execution.context)
                    .map_err(|err| warn!(%endpoint, error = %err, "Subscription response not shaped"))
                    .ok()
            });

        let delivery = Arc::new(Delivery {
            endpoint: endpoint.clone(),
            trigger,
            run_id: execution.run_id,
            outcome: execution.outcome,
            response,
        });
        let success = delivery.outcome.success;

        // No receivers is not an error; the delivery is dropped
        let receivers = self.sender(&endpoint).send(delivery).unwrap_or(0);
        debug!(%endpoint, receivers, success, "Delivered subscription outcome");

        Some(PublishReport {
            endpoint,
            run_id: execution.run_id,
            success,
            receivers,
        })
    }
}

#[async_trait]
impl EventSink for EventRouter {
    async fn emit(&self, event: TableEvent) {
        self.publish(Trigger::Table(event)).await;
    }
}
