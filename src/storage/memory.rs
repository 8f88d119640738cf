//! In-memory row store.
//!
//! Applies the configured column semantics: UNIQUE defaults, nullability,
//! column transforms, foreign keys with cascade/restrict, and reports every
//! change as a `TableEvent` once the table lock is released.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{EventSink, Row, RowStore, StorageError, StorageResult};
use crate::core::column::{ColumnTransformPipeline, TransformPhase};
use crate::core::expression::values_equal;
use crate::core::ids::IdGenerator;
use crate::core::model::{ConfigModel, ForeignKeyRef};
use crate::core::snapshot::SnapshotStore;
use crate::domain::document::{ConstraintKind, DefaultPolicy, ReferentialAction, Table};
use crate::domain::TableEvent;

type Tables = HashMap<String, Vec<Row>>;

#[derive(Clone)]
pub struct MemoryStore {
    snapshots: Arc<SnapshotStore>,
    transforms: ColumnTransformPipeline,
    ids: Arc<IdGenerator>,
    data: Arc<RwLock<Tables>>,
    sink: Option<Arc<dyn EventSink>>,
    cancel: CancellationToken,
}

impl MemoryStore {
    pub fn new(
        snapshots: Arc<SnapshotStore>,
        transforms: ColumnTransformPipeline,
        ids: Arc<IdGenerator>,
    ) -> Self {
        Self {
            snapshots,
            transforms,
            ids,
            data: Arc::new(RwLock::new(HashMap::new())),
            sink: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Report changes to `sink`
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Number of stored rows in a table
    pub async fn len(&self, table: &str) -> usize {
        self.data.read().await.get(table).map_or(0, Vec::len)
    }

    /// Stored rows as persisted, without read transforms
    pub async fn raw_rows(&self, table: &str) -> Vec<Row> {
        self.data.read().await.get(table).cloned().unwrap_or_default()
    }

    async fn emit(&self, events: Vec<TableEvent>) {
        let Some(sink) = &self.sink else {
            return;
        };
        for event in events {
            sink.emit(event).await;
        }
    }

    async fn transform(
        &self,
        model: &ConfigModel,
        table: &Table,
        phase: TransformPhase,
        row: Row,
    ) -> StorageResult<Row> {
        Ok(self
            .transforms
            .apply_row(model, table, phase, row, &self.cancel)
            .await?)
    }

    /// Fill UNIQUE defaults and enforce nullability
    fn complete_row(&self, table: &Table, row: &mut Row) -> StorageResult<()> {
        for column in &table.columns {
            if !row.get(&column.name).map_or(true, Value::is_null) {
                continue;
            }

            // Policies are validated when the configuration is linked
            let policy = column.default_policy().unwrap_or(DefaultPolicy::None);
            if let Some(value) = self.ids.generate(policy)? {
                row.insert(column.name.clone(), value);
            } else if !column.nullable || column.primary_key {
                return Err(StorageError::NotNull {
                    table: table.name.clone(),
                    column: column.name.clone(),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RowStore for MemoryStore {
    async fn insert(&self, table: &str, row: Row, user: Option<&str>) -> StorageResult<Row> {
        let model = self.snapshots.current();
        let def = table_def(&model, table)?;
        check_columns(def, &row)?;

        let mut row = self.transform(&model, def, TransformPhase::Write, row).await?;
        self.complete_row(def, &mut row)?;

        {
            let mut data = self.data.write().await;
            check_references(&model, def, &row, &data)?;
            check_unique(def, &row, rows(&data, table), None)?;
            data.entry(table.to_string()).or_default().push(row.clone());
        }

        debug!(table, "Row inserted");
        self.emit(vec![event(TableEvent::insert(table, primary_key(def, &row)), user)])
            .await;
        self.transform(&model, def, TransformPhase::Read, row).await
    }

    async fn update(
        &self,
        table: &str,
        filter: Row,
        changes: Row,
        user: Option<&str>,
    ) -> StorageResult<usize> {
        let model = self.snapshots.current();
        let def = table_def(&model, table)?;
        check_columns(def, &filter)?;
        check_columns(def, &changes)?;

        let filter = self.transform(&model, def, TransformPhase::Args, filter).await?;
        let changes = self.transform(&model, def, TransformPhase::Write, changes).await?;
        for (name, value) in &changes {
            let nullable = def.column(name).map_or(true, |c| c.nullable && !c.primary_key);
            if value.is_null() && !nullable {
                return Err(StorageError::NotNull {
                    table: table.to_string(),
                    column: name.clone(),
                });
            }
        }

        let mut events = Vec::new();
        let count = {
            let mut data = self.data.write().await;
            let matched: Vec<usize> = rows(&data, table)
                .iter()
                .enumerate()
                .filter(|(_, row)| matches(row, &filter))
                .map(|(i, _)| i)
                .collect();

            // Validate against the table as it would look after the update,
            // so matched rows also clash with each other
            let mut after: Vec<Row> = rows(&data, table).to_vec();
            for &index in &matched {
                after[index].extend(changes.clone());
            }
            for &index in &matched {
                check_references(&model, def, &after[index], &data)?;
                check_unique(def, &after[index], &after, Some(index))?;
            }

            // Rows elsewhere that point at the columns being changed
            let mut cascades: Vec<(String, usize, Row)> = Vec::new();
            for fk in model.references_to(table) {
                for &index in &matched {
                    let old = &rows(&data, table)[index];
                    let changed = fk.columns.iter().any(|(_, target)| {
                        changes
                            .get(target)
                            .map_or(false, |new| !old.get(target).map_or(false, |o| values_equal(o, new)))
                    });
                    if !changed {
                        continue;
                    }

                    let dependents = dependents_of(&data, fk, old);
                    if dependents.is_empty() {
                        continue;
                    }
                    match fk.on_update {
                        ReferentialAction::Restrict => {
                            return Err(StorageError::Restricted {
                                table: fk.table.clone(),
                                constraint: fk.name.clone(),
                                dependents: dependents.len(),
                            })
                        }
                        ReferentialAction::Cascade => {
                            let mut propagated = Row::new();
                            for (local, target) in &fk.columns {
                                if let Some(new) = changes.get(target) {
                                    propagated.insert(local.clone(), new.clone());
                                }
                            }
                            for dependent in dependents {
                                cascades.push((fk.table.clone(), dependent, propagated.clone()));
                            }
                        }
                    }
                }
            }

            if let Some(stored) = data.get_mut(table) {
                for &index in &matched {
                    stored[index].extend(changes.clone());
                    events.push(event(
                        TableEvent::update(table, primary_key(def, &stored[index])),
                        user,
                    ));
                }
            }
            for (dependent_table, index, propagated) in cascades {
                let Some(stored) = data.get_mut(&dependent_table) else {
                    continue;
                };
                stored[index].extend(propagated);
                let key = match model.table(&dependent_table) {
                    Some(def) => primary_key(def, &stored[index]),
                    None => stored[index].clone(),
                };
                events.push(event(TableEvent::update(&dependent_table, key), user));
            }

            matched.len()
        };

        debug!(table, count, cascaded = events.len() - count, "Rows updated");
        self.emit(events).await;
        Ok(count)
    }

    async fn delete(&self, table: &str, filter: Row, user: Option<&str>) -> StorageResult<usize> {
        let model = self.snapshots.current();
        let def = table_def(&model, table)?;
        check_columns(def, &filter)?;
        let filter = self.transform(&model, def, TransformPhase::Args, filter).await?;

        let mut events = Vec::new();
        {
            let mut data = self.data.write().await;

            let mut doomed: HashMap<String, BTreeSet<usize>> = HashMap::new();
            let mut queue: Vec<(String, usize)> = rows(&data, table)
                .iter()
                .enumerate()
                .filter(|(_, row)| matches(row, &filter))
                .map(|(i, _)| (table.to_string(), i))
                .collect();

            while let Some((current, index)) = queue.pop() {
                if !doomed.entry(current.clone()).or_default().insert(index) {
                    continue;
                }

                let row = &rows(&data, &current)[index];
                for fk in model.references_to(&current) {
                    let pending: Vec<usize> = dependents_of(&data, fk, row)
                        .into_iter()
                        .filter(|d| !doomed.get(&fk.table).map_or(false, |set| set.contains(d)))
                        .collect();
                    if pending.is_empty() {
                        continue;
                    }
                    match fk.on_delete {
                        ReferentialAction::Restrict => {
                            return Err(StorageError::Restricted {
                                table: fk.table.clone(),
                                constraint: fk.name.clone(),
                                dependents: pending.len(),
                            })
                        }
                        ReferentialAction::Cascade => {
                            queue.extend(pending.into_iter().map(|d| (fk.table.clone(), d)))
                        }
                    }
                }
            }

            for (doomed_table, indices) in doomed {
                let Some(stored) = data.get_mut(&doomed_table) else {
                    continue;
                };
                for index in indices.into_iter().rev() {
                    let removed = stored.remove(index);
                    let key = match model.table(&doomed_table) {
                        Some(def) => primary_key(def, &removed),
                        None => removed,
                    };
                    events.push(event(TableEvent::delete(&doomed_table, key), user));
                }
            }
        }

        let count = events.len();
        debug!(table, count, "Rows deleted");
        self.emit(events).await;
        Ok(count)
    }

    async fn select(&self, table: &str, filter: Row) -> StorageResult<Vec<Row>> {
        let model = self.snapshots.current();
        let def = table_def(&model, table)?;
        check_columns(def, &filter)?;
        let filter = self.transform(&model, def, TransformPhase::Args, filter).await?;

        let found: Vec<Row> = {
            let data = self.data.read().await;
            rows(&data, table)
                .iter()
                .filter(|row| matches(row, &filter))
                .cloned()
                .collect()
        };

        let mut out = Vec::with_capacity(found.len());
        for row in found {
            out.push(self.transform(&model, def, TransformPhase::Read, row).await?);
        }
        Ok(out)
    }
}

fn table_def<'m>(model: &'m ConfigModel, table: &str) -> StorageResult<&'m Table> {
    model
        .table(table)
        .ok_or_else(|| StorageError::UnknownTable(table.to_string()))
}

fn rows<'d>(data: &'d Tables, table: &str) -> &'d [Row] {
    data.get(table).map(Vec::as_slice).unwrap_or(&[])
}

fn check_columns(table: &Table, row: &Row) -> StorageResult<()> {
    match row.keys().find(|name| table.column(name).is_none()) {
        Some(name) => Err(StorageError::UnknownColumn {
            table: table.name.clone(),
            column: name.clone(),
        }),
        None => Ok(()),
    }
}

/// Equality on every filter column; a missing column only matches null
fn matches(row: &Row, filter: &Row) -> bool {
    filter.iter().all(|(name, expected)| {
        row.get(name)
            .map_or(expected.is_null(), |actual| values_equal(actual, expected))
    })
}

/// Primary key fields of a row; the whole row when the table declares none
fn primary_key(table: &Table, row: &Row) -> Row {
    let key: Row = table
        .primary_key()
        .filter_map(|c| row.get(&c.name).map(|v| (c.name.clone(), v.clone())))
        .collect();
    if key.is_empty() {
        row.clone()
    } else {
        key
    }
}

fn event(event: TableEvent, user: Option<&str>) -> TableEvent {
    match user {
        Some(user) => event.with_user(user),
        None => event,
    }
}

/// Rows of `fk.table` whose local columns equal `target`'s referenced columns
fn dependents_of(data: &Tables, fk: &ForeignKeyRef, target: &Row) -> Vec<usize> {
    rows(data, &fk.table)
        .iter()
        .enumerate()
        .filter(|(_, row)| {
            fk.columns.iter().all(|(local, referenced)| {
                match (row.get(local), target.get(referenced)) {
                    (Some(l), Some(r)) if !l.is_null() => values_equal(l, r),
                    _ => false,
                }
            })
        })
        .map(|(i, _)| i)
        .collect()
}

/// Every non-null outgoing foreign key must point at an existing row
fn check_references(model: &ConfigModel, table: &Table, row: &Row, data: &Tables) -> StorageResult<()> {
    for fk in model.references_from(&table.name) {
        let complete = fk
            .columns
            .iter()
            .all(|(local, _)| row.get(local).map_or(false, |v| !v.is_null()));
        if !complete {
            continue;
        }

        let found = rows(data, &fk.target_table).iter().any(|target| {
            fk.columns.iter().all(|(local, referenced)| {
                match (row.get(local), target.get(referenced)) {
                    (Some(l), Some(r)) => values_equal(l, r),
                    _ => false,
                }
            })
        });
        if !found {
            return Err(StorageError::MissingReference {
                table: table.name.clone(),
                constraint: fk.name.clone(),
                target: fk.target_table.clone(),
            });
        }
    }
    Ok(())
}

/// Primary key and UNIQUE constraints, ignoring the row at `skip`
fn check_unique(table: &Table, row: &Row, existing: &[Row], skip: Option<usize>) -> StorageResult<()> {
    let mut keys: Vec<Vec<&str>> = Vec::new();
    let pk: Vec<&str> = table.primary_key().map(|c| c.name.as_str()).collect();
    if !pk.is_empty() {
        keys.push(pk);
    }
    for constraint in &table.constraints {
        if constraint.kind == ConstraintKind::Unique && !constraint.columns.is_empty() {
            keys.push(constraint.columns.iter().map(String::as_str).collect());
        }
    }

    for key in keys {
        let values: Option<Vec<&Value>> = key
            .iter()
            .map(|name| row.get(*name).filter(|v| !v.is_null()))
            .collect();
        let Some(values) = values else {
            continue;
        };

        let clash = existing.iter().enumerate().any(|(i, other)| {
            Some(i) != skip
                && key
                    .iter()
                    .zip(&values)
                    .all(|(name, value)| other.get(*name).map_or(false, |o| values_equal(o, value)))
        });
        if clash {
            return Err(StorageError::DuplicateKey {
                table: table.name.clone(),
                key: format!("({})", key.join(", ")),
            });
        }
    }
    Ok(())
}
