//! Validated, immutable configuration snapshot.
//!
//! A `ConfigModel` is only produced by the link pass, so every cross
//! reference in it is known to resolve.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::domain::document::{Document, Endpoint, Hooks, Job, Pipeline, ReferentialAction, Table};
use crate::domain::SubscriptionSource;

use super::schedule::Schedule;

/// A resolved FOREIGN_KEY constraint
#[derive(Debug, Clone, PartialEq)]
pub struct ForeignKeyRef {
    /// Table holding the constraint
    pub table: String,

    pub name: String,

    /// Table the constraint points at
    pub target_table: String,

    /// (local column, target column) pairs in declaration order
    pub columns: Vec<(String, String)>,

    pub on_delete: ReferentialAction,
    pub on_update: ReferentialAction,
}

/// An endpoint bound to events instead of requests
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionBinding {
    pub endpoint: String,
    pub pipeline: String,
    pub sources: Vec<SubscriptionSource>,
}

#[derive(Debug, Clone)]
pub struct ConfigModel {
    pub(crate) document: Document,
    pub(crate) env: Arc<BTreeMap<String, String>>,
    pub(crate) foreign_keys: Vec<ForeignKeyRef>,
    pub(crate) subscriptions: Vec<SubscriptionBinding>,
    pub(crate) schedules: HashMap<String, Schedule>,
    pub(crate) warnings: Vec<String>,
    pub(crate) epoch: u64,
}

impl ConfigModel {
    pub fn document(&self) -> &Document {
        &self.document
    }

    /// Shared environment bindings
    pub fn env(&self) -> Arc<BTreeMap<String, String>> {
        self.env.clone()
    }

    pub fn pipeline(&self, name: &str) -> Option<&Pipeline> {
        self.document.pipeline(name)
    }

    pub fn pipelines(&self) -> &[Pipeline] {
        &self.document.apis.pipelines
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.document.table(name)
    }

    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.document.tables()
    }

    pub fn hooks(&self) -> &Hooks {
        &self.document.apis.global_options.hooks
    }

    /// Look up an endpoint by its key (name, or `METHOD path`)
    pub fn endpoint(&self, key: &str) -> Option<&Endpoint> {
        self.document.endpoints().iter().find(|e| e.key() == key)
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        self.document.endpoints()
    }

    pub fn subscriptions(&self) -> &[SubscriptionBinding] {
        &self.subscriptions
    }

    pub fn foreign_keys(&self) -> &[ForeignKeyRef] {
        &self.foreign_keys
    }

    /// Constraints in other tables (or this one) that point at `table`
    pub fn references_to<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a ForeignKeyRef> {
        self.foreign_keys.iter().filter(move |fk| fk.target_table == table)
    }

    /// Constraints declared on `table`
    pub fn references_from<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a ForeignKeyRef> {
        self.foreign_keys.iter().filter(move |fk| fk.table == table)
    }

    pub fn jobs(&self) -> &[Job] {
        &self.document.apis.jobs
    }

    pub fn schedule(&self, job: &str) -> Option<&Schedule> {
        self.schedules.get(job)
    }

    /// Non-fatal findings from linking
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Snapshot generation; increases with every successful reload
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}
