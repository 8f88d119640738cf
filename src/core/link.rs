//! Parse-then-link validation over the fully assembled document.
//!
//! Fragments may reference tables, pipelines and builders declared later or
//! elsewhere, so nothing is resolved while parsing. This pass runs once over
//! the whole tree, collects every error it finds and only then decides
//! whether a `ConfigModel` can be produced.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;
use tracing::warn;

use super::expression::{parse_condition, parse_mapping, ExpressionError, Reference, Root};
use super::model::{ConfigModel, ForeignKeyRef, SubscriptionBinding};
use super::response::{YieldError, YieldSpec};
use super::schedule::{Schedule, ScheduleError};
use crate::domain::document::{Constraint, ConstraintKind, Document, PlannedStep, Step, Table};
use crate::domain::payload::{ImageRef, ProviderRef, ProviderRefError};
use crate::domain::trigger::{SourceError, SubscriptionSource};

/// Step names that would shadow an expression root
pub const RESERVED_STEP_NAMES: &[&str] = &["args", "env", "pipeline", "outcome"];

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigValidationError {
    #[error("Duplicate {kind} name '{name}' in {scope}")]
    DuplicateName {
        kind: &'static str,
        name: String,
        scope: String,
    },

    #[error("Step name '{name}' in {scope} is reserved")]
    ReservedStepName { name: String, scope: String },

    #[error("Foreign key '{constraint}' on table '{table}' does not resolve: {reason}")]
    UnresolvedForeignKey {
        table: String,
        constraint: String,
        reason: String,
    },

    #[error("{owner} references unknown pipeline '{pipeline}'")]
    UnknownPipeline { owner: String, pipeline: String },

    #[error("{owner} must name a pipeline")]
    MissingPipeline { owner: String },

    #[error("{owner} references unknown table '{table}'")]
    UnknownTable { owner: String, table: String },

    #[error("{owner} references unknown column '{column}'")]
    UnknownColumn { owner: String, column: String },

    #[error("{location}: {source}")]
    Expression {
        location: String,
        source: ExpressionError,
    },

    #[error("{location}: '{reference}' does not refer to a step before '{step}'")]
    ForwardReference {
        location: String,
        step: String,
        reference: String,
    },

    #[error("{location}: invalid reference '{reference}': {reason}")]
    InvalidReference {
        location: String,
        reference: String,
        reason: String,
    },

    #[error("{location}: {source}")]
    InvalidYield {
        location: String,
        source: YieldError,
    },

    #[error("{location}: {source}")]
    Provider {
        location: String,
        source: ProviderRefError,
    },

    #[error("{location}: unknown step builder '{builder}'")]
    UnknownBuilder { location: String, builder: String },

    #[error("{location}: {source}")]
    Subscription {
        location: String,
        source: SourceError,
    },

    #[error("Job '{job}': {source}")]
    Schedule { job: String, source: ScheduleError },

    #[error("Column '{table}.{column}': {message}")]
    ColumnDefault {
        table: String,
        column: String,
        message: String,
    },
}

/// Every error found by one link pass
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{} configuration error(s):\n{}", .0.len(), join_errors(.0))]
pub struct ConfigErrors(pub Vec<ConfigValidationError>);

impl ConfigErrors {
    pub fn errors(&self) -> &[ConfigValidationError] {
        &self.0
    }
}

fn join_errors(errors: &[ConfigValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Validate and link a document into a `ConfigModel`
pub fn link(document: Document) -> Result<ConfigModel, ConfigErrors> {
    link_with_epoch(document, 0)
}

pub(crate) fn link_with_epoch(document: Document, epoch: u64) -> Result<ConfigModel, ConfigErrors> {
    let mut linker = Linker::new(&document);
    linker.check_step_builders();
    linker.check_tables();
    linker.check_global_options();
    linker.check_pipelines();
    linker.check_endpoints();
    linker.check_jobs();

    let Linker {
        errors,
        warnings,
        foreign_keys,
        subscriptions,
        schedules,
        ..
    } = linker;

    if !errors.is_empty() {
        return Err(ConfigErrors(errors));
    }

    for warning in &warnings {
        warn!(warning = %warning, "Configuration warning");
    }

    let env = Arc::new(document.env_map());
    Ok(ConfigModel {
        document,
        env,
        foreign_keys,
        subscriptions,
        schedules,
        warnings,
        epoch,
    })
}

struct Linker<'a> {
    document: &'a Document,
    errors: Vec<ConfigValidationError>,
    warnings: Vec<String>,
    foreign_keys: Vec<ForeignKeyRef>,
    subscriptions: Vec<SubscriptionBinding>,
    schedules: HashMap<String, Schedule>,
}

impl<'a> Linker<'a> {
    fn new(document: &'a Document) -> Self {
        Self {
            document,
            errors: Vec::new(),
            warnings: Vec::new(),
            foreign_keys: Vec::new(),
            subscriptions: Vec::new(),
            schedules: HashMap::new(),
        }
    }

    fn push(&mut self, error: ConfigValidationError) {
        self.errors.push(error);
    }

    /// Report each name seen more than once (once per name)
    fn check_unique<'n>(
        &mut self,
        kind: &'static str,
        scope: &str,
        names: impl IntoIterator<Item = &'n str>,
    ) {
        let mut seen = HashSet::new();
        let mut reported = BTreeSet::new();
        for name in names {
            if !seen.insert(name) && reported.insert(name) {
                self.push(ConfigValidationError::DuplicateName {
                    kind,
                    name: name.to_string(),
                    scope: scope.to_string(),
                });
            }
        }
    }

    fn check_step_builders(&mut self) {
        let document = self.document;
        let builders = &document.step_builders;
        self.check_unique("step builder", "document", builders.iter().map(|b| b.name.as_str()));

        for builder in builders {
            let image = builder.image.trim();
            let image = image.strip_prefix("docker:").unwrap_or(image);
            if let Err(source) = image.parse::<ImageRef>() {
                self.push(ConfigValidationError::Provider {
                    location: format!("step builder '{}'", builder.name),
                    source,
                });
            }
        }
    }

    fn check_tables(&mut self) {
        let document = self.document;
        let tables: Vec<&Table> = document.tables().collect();
        self.check_unique("table", "document", tables.iter().map(|t| t.name.as_str()));

        for table in tables {
            let scope = format!("table '{}'", table.name);
            self.check_unique("column", &scope, table.columns.iter().map(|c| c.name.as_str()));

            for column in &table.columns {
                if let Err(message) = column.default_policy() {
                    self.push(ConfigValidationError::ColumnDefault {
                        table: table.name.clone(),
                        column: column.name.clone(),
                        message,
                    });
                }

                if let Some(pipeline) = &column.pipeline {
                    for (phase, steps) in [
                        ("args", &pipeline.args),
                        ("write", &pipeline.write),
                        ("read", &pipeline.read),
                    ] {
                        let scope = format!("column '{}.{}' {} phase", table.name, column.name, phase);
                        let plan: Vec<PlannedStep<'_>> =
                            steps.iter().map(PlannedStep::explicit).collect();
                        self.check_plan(&scope, &plan, true);
                    }
                }
            }

            self.check_constraints(table);

            if let Some(well_known) = &table.well_known {
                for mapping in &well_known.mappings {
                    if table.column(&mapping.from).is_none() {
                        self.push(ConfigValidationError::UnknownColumn {
                            owner: format!("well-known binding of table '{}'", table.name),
                            column: mapping.from.clone(),
                        });
                    }
                }
            }
        }
    }

    fn check_constraints(&mut self, table: &Table) {
        for (index, constraint) in table.constraints.iter().enumerate() {
            let label = constraint.label(&table.name, index);

            match constraint.kind {
                ConstraintKind::Unique => {
                    for column in &constraint.columns {
                        if table.column(column).is_none() {
                            self.push(ConfigValidationError::UnknownColumn {
                                owner: format!("constraint '{}'", label),
                                column: column.clone(),
                            });
                        }
                    }
                }
                ConstraintKind::ForeignKey => {
                    if let Some(fk) = self.resolve_foreign_key(table, &label, constraint) {
                        self.foreign_keys.push(fk);
                    }
                }
            }
        }
    }

    fn resolve_foreign_key(
        &mut self,
        table: &Table,
        label: &str,
        constraint: &Constraint,
    ) -> Option<ForeignKeyRef> {
        let document = self.document;
        let unresolved = |reason: String| ConfigValidationError::UnresolvedForeignKey {
            table: table.name.clone(),
            constraint: label.to_string(),
            reason,
        };

        if constraint.mappings.is_empty() {
            self.push(unresolved("no column mappings".to_string()));
            return None;
        }

        let mut target_table: Option<&str> = None;
        let mut columns = Vec::new();
        let mut resolved = true;

        for mapping in &constraint.mappings {
            if table.column(&mapping.from).is_none() {
                self.push(ConfigValidationError::UnknownColumn {
                    owner: format!("constraint '{}'", label),
                    column: mapping.from.clone(),
                });
                resolved = false;
            }

            let Some(to) = mapping.to.as_deref() else {
                self.push(unresolved(format!("mapping from '{}' has no target", mapping.from)));
                resolved = false;
                continue;
            };
            let Some((target, column)) = to.rsplit_once('.') else {
                self.push(unresolved(format!("target '{}' must be table.column", to)));
                resolved = false;
                continue;
            };

            match document.table(target) {
                None => {
                    self.push(unresolved(format!("table '{}' does not exist", target)));
                    resolved = false;
                    continue;
                }
                Some(t) if t.column(column).is_none() => {
                    self.push(unresolved(format!("column '{}' does not exist", to)));
                    resolved = false;
                    continue;
                }
                Some(_) => {}
            }

            match target_table {
                Some(existing) if existing != target => {
                    self.push(unresolved(format!(
                        "mappings target both '{}' and '{}'",
                        existing, target
                    )));
                    resolved = false;
                }
                _ => target_table = Some(target),
            }
            columns.push((mapping.from.clone(), column.to_string()));
        }

        let target_table = target_table?;
        resolved.then(|| ForeignKeyRef {
            table: table.name.clone(),
            name: label.to_string(),
            target_table: target_table.to_string(),
            columns,
            on_delete: constraint.on_delete.unwrap_or_default(),
            on_update: constraint.on_update.unwrap_or_default(),
        })
    }

    fn check_global_options(&mut self) {
        let document = self.document;
        let options = &document.apis.global_options;
        for table in &options.crud_tables {
            if document.table(table).is_none() {
                self.push(ConfigValidationError::UnknownTable {
                    owner: "global_options.crud_tables".to_string(),
                    table: table.clone(),
                });
            }
        }

        // Hooks are checked once on their own; they may only address each
        // other, args and env
        let plan: Vec<PlannedStep<'_>> = options.hooks.steps().map(PlannedStep::hook).collect();
        self.check_plan("global hooks", &plan, true);
    }

    fn check_pipelines(&mut self) {
        let document = self.document;
        let pipelines = &document.apis.pipelines;
        self.check_unique("pipeline", "document", pipelines.iter().map(|p| p.name.as_str()));

        let hooks = &document.apis.global_options.hooks;
        let hook_names: HashSet<&str> = hooks.steps().map(|s| s.name.as_str()).collect();

        for pipeline in pipelines {
            let scope = format!("pipeline '{}'", pipeline.name);

            for step in &pipeline.steps {
                if hook_names.contains(step.name.as_str()) {
                    self.push(ConfigValidationError::DuplicateName {
                        kind: "step",
                        name: step.name.clone(),
                        scope: format!("{} (shadows a global hook)", scope),
                    });
                }
            }

            let plan = hooks.plan(&pipeline.steps);
            self.check_plan(&scope, &plan, false);

            if let Some(parser) = &pipeline.parser {
                self.check_plan(&format!("{} parser", scope), &[PlannedStep::explicit(parser)], true);
            }
        }
    }

    /// Check the steps of `plan` (hooks only with `with_hooks`): unique
    /// names, providers, mappings, and that every mapping only looks backwards
    fn check_plan(&mut self, scope: &str, plan: &[PlannedStep<'_>], with_hooks: bool) {
        let checked: Vec<usize> = (0..plan.len())
            .filter(|&i| with_hooks || !plan[i].hook)
            .collect();
        self.check_unique("step", scope, checked.iter().map(|&i| plan[i].step.name.as_str()));

        for index in checked {
            let step = plan[index].step;
            let location = format!("{} step '{}'", scope, step.name);

            if RESERVED_STEP_NAMES.contains(&step.name.as_str()) {
                self.push(ConfigValidationError::ReservedStepName {
                    name: step.name.clone(),
                    scope: scope.to_string(),
                });
            }

            self.check_provider(&location, step);

            for mapping in &step.mappings {
                let expr = match parse_mapping(&mapping.from) {
                    Ok(expr) => expr,
                    Err(source) => {
                        self.push(ConfigValidationError::Expression {
                            location: location.clone(),
                            source,
                        });
                        continue;
                    }
                };
                for reference in expr.references() {
                    self.check_reference(&location, plan, index, reference);
                }
            }
        }
    }

    fn check_reference(
        &mut self,
        location: &str,
        plan: &[PlannedStep<'_>],
        index: usize,
        reference: &Reference,
    ) {
        let forward = || ConfigValidationError::ForwardReference {
            location: location.to_string(),
            step: plan[index].step.name.clone(),
            reference: reference.raw.clone(),
        };
        let invalid = |reason: String| ConfigValidationError::InvalidReference {
            location: location.to_string(),
            reference: reference.raw.clone(),
            reason,
        };

        match &reference.root {
            Root::Args | Root::Env => {}
            Root::Outcome => {
                self.push(invalid("the outcome is only visible to response rules".to_string()))
            }
            Root::Pipeline(_) if plan[index].hook => self.push(invalid(
                "hooks cannot address explicit steps by position".to_string(),
            )),
            Root::Pipeline(position) => {
                // Positions count explicit steps only
                let explicit_before = plan[..index].iter().filter(|p| !p.hook).count();
                if *position >= explicit_before {
                    self.push(forward());
                }
            }
            Root::Named(name) => match plan.iter().position(|p| &p.step.name == name) {
                Some(position) if position < index => {}
                Some(_) => self.push(forward()),
                None => self.push(invalid(format!("no step named '{}'", name))),
            },
        }
    }

    fn check_provider(&mut self, location: &str, step: &Step) {
        let document = self.document;
        match step.provider.parse::<ProviderRef>() {
            Ok(ProviderRef::Custom { builder, .. }) => {
                if document.step_builder(&builder).is_none() {
                    self.push(ConfigValidationError::UnknownBuilder {
                        location: location.to_string(),
                        builder,
                    });
                }
            }
            Ok(_) => {}
            Err(source) => self.push(ConfigValidationError::Provider {
                location: location.to_string(),
                source,
            }),
        }
    }

    fn check_endpoints(&mut self) {
        let document = self.document;
        let endpoints = document.endpoints();
        let keys: Vec<String> = endpoints.iter().map(|e| e.key()).collect();
        self.check_unique("endpoint", "rest", keys.iter().map(String::as_str));

        for (endpoint, key) in endpoints.iter().zip(&keys) {
            let owner = format!("endpoint '{}'", key);

            if let Some(pipeline) = &endpoint.pipeline {
                if document.pipeline(pipeline).is_none() {
                    self.push(ConfigValidationError::UnknownPipeline {
                        owner: owner.clone(),
                        pipeline: pipeline.clone(),
                    });
                }
            }

            for (index, rule) in endpoint.responses.iter().enumerate() {
                let location = format!("{} response #{} ({})", owner, index, rule.status);

                if let Some(condition) = &rule.when {
                    if let Err(source) = parse_condition(condition) {
                        self.push(ConfigValidationError::Expression {
                            location: location.clone(),
                            source,
                        });
                    }
                }
                if let Some(spec) = &rule.yield_spec {
                    if let Err(source) = spec.parse::<YieldSpec>() {
                        self.push(ConfigValidationError::InvalidYield {
                            location: location.clone(),
                            source,
                        });
                    }
                }
                for mapping in &rule.mappings {
                    if let Err(source) = parse_mapping(&mapping.from) {
                        self.push(ConfigValidationError::Expression {
                            location: location.clone(),
                            source,
                        });
                    }
                }
            }

            match &endpoint.subscription {
                Some(subscription) => self.bind_subscription(key, endpoint.pipeline.as_deref(), &subscription.sources),
                None if endpoint.responses.is_empty() => self
                    .warnings
                    .push(format!("{} has no response rules", owner)),
                None if !endpoint.responses.iter().any(|r| r.is_fallback()) => self
                    .warnings
                    .push(format!("{} has no fallback response rule", owner)),
                None => {}
            }
        }
    }

    fn bind_subscription(&mut self, key: &str, pipeline: Option<&str>, sources: &[String]) {
        let document = self.document;
        let owner = format!("subscription endpoint '{}'", key);
        let Some(pipeline) = pipeline else {
            self.push(ConfigValidationError::MissingPipeline { owner });
            return;
        };

        let mut parsed = Vec::with_capacity(sources.len());
        for source in sources {
            match source.parse::<SubscriptionSource>() {
                Ok(SubscriptionSource::Table { table, .. }) if document.table(&table).is_none() => {
                    self.push(ConfigValidationError::UnknownTable {
                        owner: owner.clone(),
                        table,
                    });
                }
                Ok(source) => parsed.push(source),
                Err(source) => self.push(ConfigValidationError::Subscription {
                    location: owner.clone(),
                    source,
                }),
            }
        }

        if parsed.len() == sources.len() && document.pipeline(pipeline).is_some() {
            self.subscriptions.push(SubscriptionBinding {
                endpoint: key.to_string(),
                pipeline: pipeline.to_string(),
                sources: parsed,
            });
        }
    }

    fn check_jobs(&mut self) {
        let document = self.document;
        let jobs = &document.apis.jobs;
        self.check_unique("job", "document", jobs.iter().map(|j| j.name.as_str()));

        for job in jobs {
            if document.pipeline(&job.pipeline).is_none() {
                self.push(ConfigValidationError::UnknownPipeline {
                    owner: format!("job '{}'", job.name),
                    pipeline: job.pipeline.clone(),
                });
            }

            match Schedule::from_job(job) {
                Ok(schedule) => {
                    self.schedules.insert(job.name.clone(), schedule);
                }
                Err(source) => self.push(ConfigValidationError::Schedule {
                    job: job.name.clone(),
                    source,
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link_yaml(yaml: &str) -> Result<ConfigModel, ConfigErrors> {
        link(Document::from_yaml(yaml).unwrap())
    }

    #[test]
    fn test_foreign_key_forward_reference_resolves() {
        let model = link_yaml(
            r#"
databases:
  - label: db
    schemas:
      - tables:
          - name: message_block
            columns:
              - { name: id, type: bigint, primary_key: true }
              - { name: block_id, type: bigint }
            constraints:
              - name: fk_block
                type: foreign_key
                on_delete: cascade
                mappings:
                  - { from: block_id, to: block.id }
          - name: block
            columns:
              - { name: id, type: bigint, primary_key: true }
"#,
        )
        .unwrap();

        let fk = &model.foreign_keys()[0];
        assert_eq!(fk.target_table, "block");
        assert_eq!(fk.columns, vec![("block_id".to_string(), "id".to_string())]);
        assert_eq!(fk.on_delete, crate::domain::ReferentialAction::Cascade);
        assert_eq!(model.references_to("block").count(), 1);
    }

    #[test]
    fn test_forward_step_reference_rejected() {
        let err = link_yaml(
            r#"
apis:
  pipelines:
    - name: p
      steps:
        - name: a
          provider: builtin:identity
          mappings:
            - { from: "${b.id}", to: id }
        - name: b
          provider: builtin:identity
"#,
        )
        .unwrap_err();

        assert!(matches!(
            err.errors(),
            [ConfigValidationError::ForwardReference { step, .. }] if step == "a"
        ));
    }

    #[test]
    fn test_errors_are_collected() {
        let err = link_yaml(
            r#"
apis:
  pipelines:
    - name: p
      steps:
        - { name: a, provider: "nonsense" }
        - { name: a, provider: builtin:identity }
  jobs:
    - { name: j, pipeline: missing, start: "2024-01-01T00:00:00Z", interval: fortnight }
"#,
        )
        .unwrap_err();

        // Bad provider, duplicate step, unknown pipeline, bad interval
        assert_eq!(err.errors().len(), 4);
        assert!(err.to_string().starts_with("4 configuration error(s)"));
    }

    #[test]
    fn test_missing_fallback_is_warning() {
        let model = link_yaml(
            r#"
apis:
  pipelines:
    - name: p
  rest:
    endpoints:
      - name: e
        pipeline: p
        responses:
          - { status: 200, when: "${success}" }
"#,
        )
        .unwrap();
        assert_eq!(model.warnings().len(), 1);
    }

    #[test]
    fn test_custom_provider_needs_builder() {
        let yaml = r#"
step_builders:
  - { name: rust, image: "docker:acme/rust-builder:1.0" }
apis:
  pipelines:
    - name: p
      steps:
        - { name: a, provider: "rust:steps/hash" }
        - { name: b, provider: "go:steps/hash" }
"#;
        let err = link_yaml(yaml).unwrap_err();
        assert!(matches!(
            err.errors(),
            [ConfigValidationError::UnknownBuilder { builder, .. }] if builder == "go"
        ));
    }

    #[test]
    fn test_positions_ignore_hooks() {
        let yaml = r#"
apis:
  global_options:
    hooks:
      before:
        - { name: stamp, provider: builtin:now, position: each }
  pipelines:
    - name: p
      steps:
        - { name: a, provider: builtin:identity }
        - name: b
          provider: builtin:identity
          mappings:
            - { from: "${pipeline[0].id}", to: id }
            - { from: "${stamp}", to: at }
"#;
        assert!(link_yaml(yaml).is_ok());

        let forward = yaml.replace("pipeline[0]", "pipeline[1]");
        assert!(matches!(
            link_yaml(&forward).unwrap_err().errors(),
            [ConfigValidationError::ForwardReference { step, .. }] if step == "b"
        ));
    }

    #[test]
    fn test_hooks_cannot_address_positions() {
        let err = link_yaml(
            r#"
apis:
  global_options:
    hooks:
      after:
        - name: audit
          provider: builtin:identity
          mappings:
            - { from: "${pipeline[0]}", to: first }
  pipelines:
    - name: p
      steps:
        - { name: a, provider: builtin:identity }
"#,
        )
        .unwrap_err();

        assert!(matches!(
            err.errors(),
            [ConfigValidationError::InvalidReference { reason, .. }] if reason.contains("position")
        ));
    }
}
