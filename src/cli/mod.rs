//! Command-line interface for stepline.
//!
//! Provides commands for validating documents, running pipelines and
//! endpoints, publishing events, driving jobs, and inspecting run journals.

use std::io::{self, IsTerminal, Read, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::sync::broadcast::error::TryRecvError;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{self, EngineSettings};
use crate::core::{link, Engine, EventStore};
use crate::domain::{
    ChangeKind, CustomEvent, Document, Payload, RunState, SubscriptionSource, TableEvent, Trigger,
};

/// stepline - declarative pipeline engine
#[derive(Parser, Debug)]
#[command(name = "stepline")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Assembled configuration document (YAML or JSON)
    #[arg(short, long, global = true)]
    pub document: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate a document and print warnings
    Validate,

    /// Run a pipeline
    Run {
        /// Pipeline name
        pipeline: String,

        /// Input file (reads from stdin if piped)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Content type of the input
        #[arg(short = 't', long)]
        content_type: Option<String>,

        /// Pipeline args as JSON
        #[arg(short, long)]
        args: Option<String>,
    },

    /// Execute a request endpoint and print its response
    Respond {
        /// Endpoint name or `METHOD path`
        endpoint: String,

        /// Request body file (reads from stdin if piped)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Request content type
        #[arg(short = 't', long)]
        content_type: Option<String>,

        /// Request args as JSON
        #[arg(short, long)]
        args: Option<String>,
    },

    /// Publish an event and print what subscribers receive
    Publish {
        /// `custom:<name>` or `<table>:insert|update|delete`
        source: String,

        /// Custom payload, or the primary key of a table event, as JSON
        #[arg(short, long, default_value = "{}")]
        payload: String,

        /// Acting user for table events
        #[arg(short, long)]
        user: Option<String>,
    },

    /// Inspect or run scheduled jobs
    Jobs {
        #[command(subcommand)]
        command: JobCommands,
    },

    /// Check the status of a run
    Status {
        /// Run ID (UUID)
        run_id: String,
    },

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Show resolved configuration (debug)
    Config,
}

#[derive(Subcommand, Debug)]
pub enum JobCommands {
    /// Show the next fire time of every enabled job
    Next,

    /// Run the scheduler until interrupted
    Serve,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let document = self.document;
        match self.command {
            Commands::Validate => validate(document),
            Commands::Run {
                pipeline,
                input,
                content_type,
                args,
            } => run_pipeline(document, &pipeline, input, content_type, args).await,
            Commands::Respond {
                endpoint,
                input,
                content_type,
                args,
            } => respond(document, &endpoint, input, content_type, args).await,
            Commands::Publish {
                source,
                payload,
                user,
            } => publish(document, &source, &payload, user).await,
            Commands::Jobs { command } => match command {
                JobCommands::Next => jobs_next(document),
                JobCommands::Serve => jobs_serve(document).await,
            },
            Commands::Status { run_id } => show_status(&run_id).await,
            Commands::Runs { limit } => list_runs(limit).await,
            Commands::Config => show_config(),
        }
    }
}

/// Load the document named on the command line or in the settings
fn load_document(path: Option<PathBuf>) -> Result<(Document, &'static EngineSettings)> {
    let settings = config::settings()?;
    let path = path.or_else(|| settings.document.clone()).context(
        "No document given. Use --document <file> or set STEPLINE_DOCUMENT",
    )?;
    Ok((Document::from_file(&path)?, settings))
}

fn load_engine(path: Option<PathBuf>) -> Result<Engine> {
    let (document, settings) = load_document(path)?;
    Engine::from_settings(document, settings)
}

/// Read an input file, or stdin when it is piped
fn read_input(input: Option<PathBuf>) -> Result<Vec<u8>> {
    if let Some(path) = input {
        return std::fs::read(&path)
            .with_context(|| format!("Failed to read input file: {}", path.display()));
    }

    let mut buffer = Vec::new();
    if !io::stdin().is_terminal() {
        io::stdin()
            .read_to_end(&mut buffer)
            .context("Failed to read from stdin")?;
    }
    Ok(buffer)
}

fn parse_json(label: &str, raw: Option<&str>) -> Result<Value> {
    match raw {
        Some(raw) => serde_json::from_str(raw).with_context(|| format!("Invalid {} JSON", label)),
        None => Ok(Value::Null),
    }
}

fn print_payload(payload: &Payload) -> Result<()> {
    match payload {
        Payload::Parsed(value) => println!("{}", serde_json::to_string_pretty(value)?),
        Payload::Raw(bytes) => {
            let mut stdout = io::stdout();
            stdout.write_all(bytes)?;
            stdout.flush()?;
        }
    }
    Ok(())
}

fn validate(document: Option<PathBuf>) -> Result<()> {
    let (document, _) = load_document(document)?;

    match link(document) {
        Ok(model) => {
            for warning in model.warnings() {
                println!("warning: {}", warning);
            }
            println!(
                "Document is valid: {} table(s), {} pipeline(s), {} endpoint(s), {} job(s)",
                model.tables().count(),
                model.pipelines().len(),
                model.endpoints().len(),
                model.jobs().len()
            );
            Ok(())
        }
        Err(errors) => {
            eprintln!("{}", errors);
            std::process::exit(1);
        }
    }
}

/// Run a pipeline with the given input
async fn run_pipeline(
    document: Option<PathBuf>,
    pipeline: &str,
    input: Option<PathBuf>,
    content_type: Option<String>,
    args: Option<String>,
) -> Result<()> {
    let engine = load_engine(document)?;
    let args = parse_json("args", args.as_deref())?;
    let initial = Payload::interpret(read_input(input)?, content_type.as_deref())?;

    let execution = engine
        .run_pipeline(pipeline, args, initial, &CancellationToken::new())
        .await?;

    print_payload(&execution.outcome.body)?;
    if execution.outcome.success {
        eprintln!("\n[Run {} completed successfully]", execution.run_id);
    } else {
        eprintln!(
            "\n[Run {} failed at step '{}': {}]",
            execution.run_id,
            execution.outcome.failed_step.as_deref().unwrap_or("?"),
            execution.outcome.error.as_deref().unwrap_or("unknown error")
        );
        std::process::exit(1);
    }

    Ok(())
}

async fn respond(
    document: Option<PathBuf>,
    endpoint: &str,
    input: Option<PathBuf>,
    content_type: Option<String>,
    args: Option<String>,
) -> Result<()> {
    let engine = load_engine(document)?;
    let args = parse_json("args", args.as_deref())?;
    let body = read_input(input)?;

    match engine
        .handle_request(endpoint, body, content_type.as_deref(), args, &CancellationToken::new())
        .await
    {
        Ok(response) => {
            eprintln!("Status: {}", response.status);
            print_payload(&response.body)
        }
        Err(e) => {
            eprintln!("Status: {}", e.status());
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

fn parse_trigger(source: &str, payload: Value, user: Option<String>) -> Result<Trigger> {
    let parsed: SubscriptionSource = source.parse()?;
    match parsed {
        SubscriptionSource::Custom { name } => Ok(CustomEvent::new(name, payload).into()),
        SubscriptionSource::Table { table, kind } => {
            let key = match payload {
                Value::Object(map) => map,
                _ => anyhow::bail!("A table event payload must be a primary key object"),
            };
            let event = match kind {
                Some(ChangeKind::Insert) | None => TableEvent::insert(table, key),
                Some(ChangeKind::Update) => TableEvent::update(table, key),
                Some(ChangeKind::Delete) => TableEvent::delete(table, key),
            };
            let event = match user {
                Some(user) => event.with_user(user),
                None => event,
            };
            Ok(Trigger::Table(event))
        }
    }
}

async fn publish(
    document: Option<PathBuf>,
    source: &str,
    payload: &str,
    user: Option<String>,
) -> Result<()> {
    let engine = load_engine(document)?;
    let trigger = parse_trigger(source, parse_json("payload", Some(payload))?, user)?;

    let model = engine.model();
    let mut receivers = Vec::new();
    for binding in model.subscriptions() {
        if binding.sources.iter().any(|s| s.matches(&trigger)) {
            receivers.push((binding.endpoint.clone(), engine.router().subscribe(&binding.endpoint)?));
        }
    }

    let reports = engine.publish(trigger).await;
    if reports.is_empty() {
        println!("No subscription endpoint matched '{}'", source);
        return Ok(());
    }

    for (endpoint, mut rx) in receivers {
        loop {
            match rx.try_recv() {
                Ok(delivery) => {
                    println!(
                        "[{}] run {} success={}",
                        endpoint, delivery.run_id, delivery.outcome.success
                    );
                    print_payload(delivery.body())?;
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    eprintln!("[{}] {} deliveries dropped", endpoint, skipped);
                }
                Err(_) => break,
            }
        }
    }

    Ok(())
}

fn jobs_next(document: Option<PathBuf>) -> Result<()> {
    let (document, _) = load_document(document)?;
    let model = link(document)?;
    let now = Utc::now();

    let enabled: Vec<_> = model.jobs().iter().filter(|j| j.enabled).collect();
    if enabled.is_empty() {
        println!("No enabled jobs");
        return Ok(());
    }

    println!("{:<24} {:<24} {:<30}", "JOB", "PIPELINE", "NEXT FIRE");
    println!("{}", "-".repeat(78));
    for job in enabled {
        let next = model
            .schedule(&job.name)
            .and_then(|s| s.fire_at_or_after(now))
            .map_or_else(|| "retired".to_string(), |t| t.to_rfc3339());
        println!("{:<24} {:<24} {:<30}", job.name, job.pipeline, next);
    }

    Ok(())
}

async fn jobs_serve(document: Option<PathBuf>) -> Result<()> {
    let engine = load_engine(document)?;
    let cancel = CancellationToken::new();

    let stop = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop.cancel();
        }
    });

    engine.serve(cancel).await;
    Ok(())
}

/// Show the status of a run
async fn show_status(run_id_str: &str) -> Result<()> {
    let run_id = Uuid::parse_str(run_id_str)
        .with_context(|| format!("Invalid run ID: {}", run_id_str))?;

    let store = EventStore::open(&config::runs_dir()?, run_id).await?;
    let run = store
        .load_run()
        .await?
        .with_context(|| format!("Run {} not found", run_id))?;

    println!("Run ID: {}", run.id);
    println!("Pipeline: {}", run.pipeline_name);
    println!("State: {}", run.state);
    println!("Started: {}", run.started_at);
    if let Some(completed) = run.completed_at {
        println!("Completed: {}", completed);
    }
    if let Some(step) = &run.failed_step {
        println!("Failed step: {}", step);
    }
    println!("Steps completed: {}", run.steps_completed);
    println!("\nStep statuses:");
    for (step, status) in &run.step_statuses {
        println!("  {}: {:?}", step, status);
    }

    Ok(())
}

/// List recent runs
async fn list_runs(limit: usize) -> Result<()> {
    let runs_dir = config::runs_dir()?;
    let mut runs = Vec::new();
    for run_id in EventStore::list_runs(&runs_dir).await? {
        let store = EventStore::open(&runs_dir, run_id).await?;
        if let Some(run) = store.load_run().await? {
            runs.push(run);
        }
    }

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));

    println!("{:<38} {:<24} {:<15}", "RUN ID", "PIPELINE", "STATE");
    println!("{}", "-".repeat(79));

    for run in runs.into_iter().take(limit) {
        let state = match &run.state {
            RunState::Running => "running",
            RunState::Completed => "completed",
            RunState::Failed { .. } => "failed",
            RunState::Cancelled => "cancelled",
            RunState::SafetyLimitReached { .. } => "safety-limit",
        };
        println!("{:<38} {:<24} {:<15}", run.id, run.pipeline_name, state);
    }

    Ok(())
}

fn show_config() -> Result<()> {
    let cfg = config::settings()?;

    println!("Stepline configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!(
        "Document:    {}",
        cfg.document
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home: {}", cfg.home.display());
    println!("  Runs: {}", cfg.runs_dir().display());
    println!();
    println!("Safety limits:");
    println!("  Max steps:         {}", cfg.max_steps);
    println!("  Max payload bytes: {}", cfg.max_payload_bytes);
    println!("  Step timeout:      {}s", cfg.step_timeout_seconds);
    println!("  Run timeout:       {}s", cfg.run_timeout_seconds);
    println!();
    println!("Retry policy:");
    println!("  Max attempts:  {}", cfg.retry.max_attempts);
    println!("  Initial delay: {}ms", cfg.retry.initial_delay_ms);
    println!("  Max delay:     {}ms", cfg.retry.max_delay_ms);
    println!("  Multiplier:    {}", cfg.retry.backoff_multiplier);
    println!();
    println!("Runtime:");
    println!("  Channel capacity: {}", cfg.channel_capacity);
    println!("  Max poll:         {}s", cfg.max_poll_seconds);
    println!("  Node id:          {}", cfg.node_id);
    println!("  Journal:          {}", cfg.journal);
    println!("  Launcher:         {}", cfg.launcher);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_custom_trigger() {
        let trigger = parse_trigger("custom:note", json!({"a": 1}), None).unwrap();
        assert!(matches!(trigger, Trigger::Custom(ref e) if e.name == "note"));
    }

    #[test]
    fn test_parse_table_trigger() {
        let trigger = parse_trigger("block:delete", json!({"id": 3}), Some("u1".into())).unwrap();
        match trigger {
            Trigger::Table(event) => {
                assert_eq!(event.table, "block");
                assert!(event.is_delete);
                assert_eq!(event.user_id.as_deref(), Some("u1"));
            }
            other => panic!("unexpected trigger {:?}", other),
        }

        assert!(parse_trigger("block", json!(1), None).is_err());
    }

    #[test]
    fn test_cli_parses_jobs_next() {
        let cli = Cli::parse_from(["stepline", "-d", "app.yaml", "jobs", "next"]);
        assert_eq!(cli.document, Some(PathBuf::from("app.yaml")));
        assert!(matches!(
            cli.command,
            Commands::Jobs {
                command: JobCommands::Next
            }
        ));
    }
}
