//! Assembled configuration document.
//!
//! The document is produced by an external loader that stitches imported
//! fragments together. It is deserialized here from a single YAML (or JSON)
//! tree and is never mutated afterwards; cross references are checked by the
//! link pass in `core::link`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Root of the configuration tree
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Document {
    /// Free-form metadata pairs
    #[serde(default)]
    pub meta: BTreeMap<String, String>,

    /// Environment bindings visible to expressions as `env.*`
    #[serde(default)]
    pub env: Vec<EnvVar>,

    /// Databases and their schemas
    #[serde(default)]
    pub databases: Vec<Database>,

    /// Endpoints, pipelines and jobs
    #[serde(default)]
    pub apis: Apis,

    /// Images able to build `<builder>:<path>` step providers
    #[serde(default)]
    pub step_builders: Vec<StepBuilder>,
}

impl Document {
    /// Load a document from a YAML or JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read document: {}", path.display()))?;

        Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse document: {}", path.display()))
    }

    /// Parse a document from YAML content (JSON is accepted as well)
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse document YAML")
    }

    /// Environment bindings as a map (later bindings win)
    pub fn env_map(&self) -> BTreeMap<String, String> {
        self.env
            .iter()
            .map(|v| (v.name.clone(), v.value.clone()))
            .collect()
    }

    /// All tables across every database and schema, in declaration order
    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.databases
            .iter()
            .flat_map(|db| db.schemas.iter())
            .flat_map(|schema| schema.tables.iter())
    }

    /// Look up a table by name
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables().find(|t| t.name == name)
    }

    /// Look up a pipeline by name
    pub fn pipeline(&self, name: &str) -> Option<&Pipeline> {
        self.apis.pipelines.iter().find(|p| p.name == name)
    }

    /// Look up a step builder by name
    pub fn step_builder(&self, name: &str) -> Option<&StepBuilder> {
        self.step_builders.iter().find(|b| b.name == name)
    }

    /// All declared endpoints
    pub fn endpoints(&self) -> &[Endpoint] {
        self.apis
            .rest
            .as_ref()
            .map(|r| r.endpoints.as_slice())
            .unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

/// A named builder image, written like a provider: `docker:[user:pass@]image[:tag]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepBuilder {
    pub name: String,
    pub image: String,
}

/// A database connection and the schemas stored in it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Database {
    pub label: String,

    #[serde(rename = "type", default)]
    pub engine: DatabaseEngine,

    #[serde(default)]
    pub host: Option<String>,

    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub db_name: Option<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Driver-specific connection options
    #[serde(default)]
    pub options: Option<String>,

    #[serde(default)]
    pub schemas: Vec<Schema>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseEngine {
    #[default]
    MekaDb,
    Postgres,
    MySql,
    MariaDb,
    Oracle,
    MsSql,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub tables: Vec<Table>,
}

/// A table definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    pub name: String,

    /// Ordered, uniquely named columns
    #[serde(default)]
    pub columns: Vec<Column>,

    #[serde(default)]
    pub constraints: Vec<Constraint>,

    /// Platform role this table fulfils, if any
    #[serde(default)]
    pub well_known: Option<WellKnown>,
}

impl Table {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn primary_key(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| c.primary_key)
    }
}

/// Binding of a platform role onto arbitrary column names.
///
/// Each mapping's `from` is a column of the table and `to` the name the
/// platform expects (e.g. `username` -> `xyz`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WellKnown {
    #[serde(rename = "type")]
    pub kind: WellKnownType,

    #[serde(default)]
    pub mappings: Vec<Mapping>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WellKnownType {
    Account,
    File,
    Permission,
    Role,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    pub name: String,

    #[serde(rename = "type")]
    pub column_type: ColumnType,

    #[serde(default = "default_true")]
    pub nullable: bool,

    #[serde(default)]
    pub primary_key: bool,

    /// Raw default declaration: `unique` or `unique(sqid)`
    #[serde(default)]
    pub default: Option<String>,

    #[serde(default)]
    pub pipeline: Option<ColumnPipeline>,
}

impl Column {
    /// Resolve the default-generation policy from the declaration and column type
    pub fn default_policy(&self) -> Result<DefaultPolicy, String> {
        let Some(raw) = self.default.as_deref() else {
            return Ok(DefaultPolicy::None);
        };

        let normalized: String = raw
            .to_lowercase()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();

        match (normalized.as_str(), self.column_type) {
            ("none", _) => Ok(DefaultPolicy::None),
            ("unique", ColumnType::Text) => Ok(DefaultPolicy::UniqueTextUlid),
            ("unique(ulid)", ColumnType::Text) => Ok(DefaultPolicy::UniqueTextUlid),
            ("unique(sqid)", ColumnType::Text) => Ok(DefaultPolicy::UniqueTextSqid),
            ("unique", ColumnType::BigInt) | ("unique(snowflake)", ColumnType::BigInt) => {
                Ok(DefaultPolicy::UniqueBigintSnowflake)
            }
            ("unique", other) | ("unique(sqid)", other) | ("unique(ulid)", other) => Err(format!(
                "unique defaults are only supported on text and bigint columns, not {}",
                other
            )),
            _ => Err(format!("unsupported default '{}'", raw)),
        }
    }
}

/// How a column value is generated when the caller omits it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultPolicy {
    None,
    UniqueTextUlid,
    UniqueTextSqid,
    UniqueBigintSnowflake,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Text,
    Int,
    BigInt,
    Float,
    Double,
    Timestamp,
    Bool,
    Bytea,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::Text => "text",
            ColumnType::Int => "int",
            ColumnType::BigInt => "bigint",
            ColumnType::Float => "float",
            ColumnType::Double => "double",
            ColumnType::Timestamp => "timestamp",
            ColumnType::Bool => "bool",
            ColumnType::Bytea => "bytea",
        };
        f.write_str(name)
    }
}

/// Per-column transforms. All three phases are independent and optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ColumnPipeline {
    /// Applied to predicate values on both read and write paths
    #[serde(default)]
    pub args: Vec<Step>,

    /// Applied before a value is persisted
    #[serde(default)]
    pub write: Vec<Step>,

    /// Applied after retrieval, before the value is surfaced
    #[serde(default)]
    pub read: Vec<Step>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Constraint {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(rename = "type")]
    pub kind: ConstraintKind,

    /// Columns covered by a UNIQUE constraint
    #[serde(default)]
    pub columns: Vec<String>,

    /// FOREIGN_KEY links: `from` a local column `to` `table.column`
    #[serde(default)]
    pub mappings: Vec<Mapping>,

    #[serde(default)]
    pub on_delete: Option<ReferentialAction>,

    #[serde(default)]
    pub on_update: Option<ReferentialAction>,
}

impl Constraint {
    /// Name used in diagnostics
    pub fn label(&self, table: &str, index: usize) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{}_constraint_{}", table, index))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    ForeignKey,
    Unique,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferentialAction {
    Cascade,
    #[default]
    Restrict,
}

/// A named, ordered sequence of steps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub name: String,

    #[serde(default)]
    pub steps: Vec<Step>,

    /// Step that interprets a raw initial payload into structured fields
    #[serde(default)]
    pub parser: Option<Step>,
}

impl Pipeline {
    /// Get a step by name
    pub fn get_step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Get the index of a step by name
    pub fn step_index(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name == name)
    }
}

/// A single step in a pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Step name (unique within its pipeline, addressable by later steps)
    pub name: String,

    /// Provider reference, e.g. `builtin:sha256` or `docker:org/image:tag`
    pub provider: String,

    /// Field mappings building this step's input
    #[serde(default)]
    pub mappings: Vec<Mapping>,

    /// Override timeout for this step (uses the engine default if not set)
    #[serde(default)]
    pub timeout_seconds: Option<u64>,

    /// Override retry policy for transient provider failures
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
}

impl Step {
    /// Get the effective timeout for this step
    pub fn timeout(&self, default_seconds: u64) -> Duration {
        Duration::from_secs(self.timeout_seconds.unwrap_or(default_seconds))
    }
}

/// Binding from a source expression to a destination field path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mapping {
    pub from: String,

    #[serde(default)]
    pub to: Option<String>,
}

impl Mapping {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: Some(to.into()),
        }
    }

    /// Destination path. Defaults to the last field of the source reference.
    pub fn target(&self) -> String {
        if let Some(to) = &self.to {
            return to.clone();
        }
        let source = self
            .from
            .trim()
            .trim_start_matches("${")
            .trim_end_matches('}');
        let last = source.rsplit('.').next().unwrap_or(source);
        match last.find('[') {
            Some(idx) => last[..idx].to_string(),
            None => last.to_string(),
        }
    }
}

/// Retry policy for transient provider failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    200
}
fn default_max_delay() -> u64 {
    5000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_true() -> bool {
    true
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Calculate delay for a specific attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms.min(self.max_delay_ms));
        }

        let delay =
            self.initial_delay_ms as f64 * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// The `apis` block
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Apis {
    #[serde(default)]
    pub global_options: GlobalOptions,

    #[serde(default)]
    pub rest: Option<Rest>,

    #[serde(default)]
    pub graphql: Option<GraphQl>,

    #[serde(default)]
    pub pipelines: Vec<Pipeline>,

    #[serde(default)]
    pub jobs: Vec<Job>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalOptions {
    /// Tables with default CRUD endpoints enabled
    #[serde(default)]
    pub crud_tables: Vec<String>,

    /// Core API allow-list
    #[serde(default)]
    pub core_apis: Vec<CoreApi>,

    /// Implicit steps applied around every pipeline
    #[serde(default)]
    pub hooks: Hooks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreApi {
    Register,
    LoginByEmail,
    LoginByUsername,
    #[serde(rename = "oauth")]
    OAuth,
    PasswordResetTrigger,
    PasswordReset,
    MagicLink,
    TwoFactorAuthEmail,
    TwoFactorAuthSms,
    TwoFactorStep2,
    TwoFactorTotp,
    VerifyAccount,
}

/// Implicit steps run around every pipeline's own steps.
///
/// A `before` hook defaults to `first` and an `after` hook to `last`; `each`
/// wraps every explicit step. A pipeline with no steps still runs its
/// `first`/`last` hooks once.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Hooks {
    #[serde(default)]
    pub before: Vec<Hook>,

    #[serde(default)]
    pub after: Vec<Hook>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hook {
    #[serde(flatten)]
    pub step: Step,

    #[serde(default)]
    pub position: Option<HookPosition>,
}

/// Which explicit steps a hook attaches to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPosition {
    First,
    Each,
    Last,
}

impl HookPosition {
    fn covers(self, index: usize, count: usize) -> bool {
        match self {
            Self::First => index == 0,
            Self::Each => true,
            Self::Last => index + 1 == count,
        }
    }
}

/// One entry of an execution plan
#[derive(Debug, Clone, Copy)]
pub struct PlannedStep<'a> {
    pub step: &'a Step,

    /// Implicit steps are not addressable as `pipeline[i]`
    pub hook: bool,
}

impl<'a> PlannedStep<'a> {
    pub fn explicit(step: &'a Step) -> Self {
        Self { step, hook: false }
    }

    pub fn hook(step: &'a Step) -> Self {
        Self { step, hook: true }
    }
}

impl Hooks {
    pub fn is_empty(&self) -> bool {
        self.before.is_empty() && self.after.is_empty()
    }

    /// Every hook, before then after, in declaration order
    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.before.iter().chain(self.after.iter()).map(|h| &h.step)
    }

    /// Interleave the hooks with `steps` by position
    pub fn plan<'a>(&'a self, steps: &'a [Step]) -> Vec<PlannedStep<'a>> {
        let before = |index: usize, count: usize| {
            self.before
                .iter()
                .filter(move |h| h.position.unwrap_or(HookPosition::First).covers(index, count))
                .map(|h| PlannedStep::hook(&h.step))
        };
        let after = |index: usize, count: usize| {
            self.after
                .iter()
                .filter(move |h| h.position.unwrap_or(HookPosition::Last).covers(index, count))
                .map(|h| PlannedStep::hook(&h.step))
        };

        if steps.is_empty() {
            // Nothing to wrap: first/last hooks still run once
            let once = |h: &&Hook| h.position != Some(HookPosition::Each);
            return self
                .before
                .iter()
                .filter(once)
                .chain(self.after.iter().filter(once))
                .map(|h| PlannedStep::hook(&h.step))
                .collect();
        }

        let count = steps.len();
        let mut plan = Vec::with_capacity(count + self.before.len() + self.after.len());
        for (index, step) in steps.iter().enumerate() {
            plan.extend(before(index, count));
            plan.push(PlannedStep::explicit(step));
            plan.extend(after(index, count));
        }
        plan
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Rest {
    #[serde(default)]
    pub base: Option<String>,

    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

/// Toggle for deriving a GraphQL schema from the REST endpoints
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphQl {
    #[serde(default)]
    pub base: Option<String>,

    #[serde(default)]
    pub from: Option<String>,

    #[serde(default)]
    pub enable_subscriptions: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub path: Option<String>,

    #[serde(default)]
    pub method: HttpMethod,

    /// Accepted request content type
    #[serde(default)]
    pub accepts: Option<String>,

    /// Produced response content type
    #[serde(default)]
    pub produces: Option<String>,

    /// Pipeline executed for each request or event
    #[serde(default)]
    pub pipeline: Option<String>,

    /// Ordered response rules, first match wins
    #[serde(default)]
    pub responses: Vec<ResponseRule>,

    /// Present when this endpoint is bound to events instead of requests
    #[serde(default)]
    pub subscription: Option<Subscription>,
}

impl Endpoint {
    /// Stable key: the endpoint name, or `METHOD path`
    pub fn key(&self) -> String {
        match (&self.name, &self.path) {
            (Some(name), _) => name.clone(),
            (None, Some(path)) => format!("{} {}", self.method, path),
            (None, None) => format!("{} /", self.method),
        }
    }

    pub fn is_subscription(&self) -> bool {
        self.subscription.is_some()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

/// Event sources an endpoint subscribes to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseRule {
    pub status: u16,

    /// Boolean condition; absent means always
    #[serde(default)]
    pub when: Option<String>,

    /// `N`, `N..`, `..N` or `N..M`
    #[serde(rename = "yield", default)]
    pub yield_spec: Option<String>,

    #[serde(default)]
    pub mappings: Vec<Mapping>,
}

impl ResponseRule {
    pub fn is_fallback(&self) -> bool {
        self.when.is_none()
    }
}

/// A scheduled pipeline invocation. Times and intervals are kept as written
/// and checked during linking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub name: String,

    pub pipeline: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_true")]
    pub repeats: bool,

    /// RFC 3339 start timestamp
    pub start: String,

    #[serde(default)]
    pub end: Option<String>,

    pub interval: String,

    /// A single multiple (`2`) or a list of sub-units (`1,3,7`)
    #[serde(default)]
    pub frequency: Option<String>,
}
