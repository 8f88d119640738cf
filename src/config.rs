//! Engine settings.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (STEPLINE_HOME, STEPLINE_DOCUMENT)
//! 2. Config file (.stepline/config.yaml)
//! 3. Defaults (~/.stepline)
//!
//! Config file discovery:
//! - Searches current directory and parents for .stepline/config.yaml
//! - Paths in the config file are relative to the .stepline/ directory

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::core::safety::SafetyLimits;
use crate::domain::RetryPolicy;

/// Global cached settings (stores Result to handle init errors)
static SETTINGS: OnceLock<Result<EngineSettings, String>> = OnceLock::new();

const CONFIG_DIR: &str = ".stepline";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub safety: Option<SafetyConfig>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub runtime: Option<RuntimeConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory
    pub home: Option<String>,
    /// Assembled configuration document
    pub document: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SafetyConfig {
    pub max_steps: Option<u32>,
    pub max_payload_bytes: Option<u64>,
    pub step_timeout_seconds: Option<u64>,
    pub run_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    pub channel_capacity: Option<usize>,
    pub max_poll_seconds: Option<u64>,
    pub node_id: Option<u16>,
    pub journal: Option<bool>,
    pub launcher: Option<String>,
}

/// Resolved settings with absolute paths
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Engine state directory (run journals)
    pub home: PathBuf,
    /// Default document for commands that take one
    pub document: Option<PathBuf>,
    /// Config file the settings came from, if any
    pub config_file: Option<PathBuf>,

    pub max_steps: u32,
    pub max_payload_bytes: u64,
    pub step_timeout_seconds: u64,
    pub run_timeout_seconds: u64,
    pub retry: RetryPolicy,

    /// Buffered deliveries per subscription endpoint
    pub channel_capacity: usize,
    pub max_poll_seconds: u64,
    /// Snowflake node id (0-1023)
    pub node_id: u16,
    /// Append run journals under `home/runs`
    pub journal: bool,
    /// Docker-compatible CLI for externally-imaged steps
    pub launcher: String,
}

impl EngineSettings {
    /// Built-in defaults rooted at `home`
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        let limits = SafetyLimits::default();
        Self {
            home: home.into(),
            document: None,
            config_file: None,
            max_steps: limits.max_steps,
            max_payload_bytes: limits.max_payload_bytes,
            step_timeout_seconds: limits.step_timeout_seconds,
            run_timeout_seconds: limits.run_timeout_seconds,
            retry: RetryPolicy::default(),
            channel_capacity: 64,
            max_poll_seconds: 30,
            node_id: 0,
            journal: true,
            launcher: "docker".to_string(),
        }
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.home.join("runs")
    }

    pub fn safety_limits(&self) -> SafetyLimits {
        SafetyLimits {
            max_steps: self.max_steps,
            max_payload_bytes: self.max_payload_bytes,
            step_timeout_seconds: self.step_timeout_seconds,
            run_timeout_seconds: self.run_timeout_seconds,
        }
    }

    fn apply(&mut self, file: ConfigFile, config_dir: &Path) {
        if let Some(home) = file.paths.home {
            self.home = resolve_path(config_dir, &home);
        }
        if let Some(document) = file.paths.document {
            self.document = Some(resolve_path(config_dir, &document));
        }

        if let Some(safety) = file.safety {
            self.max_steps = safety.max_steps.unwrap_or(self.max_steps);
            self.max_payload_bytes = safety.max_payload_bytes.unwrap_or(self.max_payload_bytes);
            self.step_timeout_seconds = safety
                .step_timeout_seconds
                .unwrap_or(self.step_timeout_seconds);
            self.run_timeout_seconds = safety
                .run_timeout_seconds
                .unwrap_or(self.run_timeout_seconds);
        }

        if let Some(retry) = file.retry {
            self.retry = retry;
        }

        if let Some(runtime) = file.runtime {
            self.channel_capacity = runtime.channel_capacity.unwrap_or(self.channel_capacity);
            self.max_poll_seconds = runtime.max_poll_seconds.unwrap_or(self.max_poll_seconds);
            self.node_id = runtime.node_id.unwrap_or(self.node_id);
            self.journal = runtime.journal.unwrap_or(self.journal);
            if let Some(launcher) = runtime.launcher {
                self.launcher = launcher;
            }
        }
    }
}

/// Find config file by searching a directory and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_DIR).join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Resolve settings for a working directory
fn load_settings_from(cwd: &Path) -> Result<EngineSettings> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(CONFIG_DIR);

    let mut settings = EngineSettings::with_home(default_home);

    if let Some(config_path) = find_config_file(cwd) {
        let file = load_config_file(&config_path)?;
        let config_dir = config_path.parent().unwrap_or(Path::new("."));
        settings.apply(file, config_dir);
        settings.config_file = Some(config_path);
    }

    if let Ok(home) = std::env::var("STEPLINE_HOME") {
        settings.home = PathBuf::from(home);
    }
    if let Ok(document) = std::env::var("STEPLINE_DOCUMENT") {
        settings.document = Some(PathBuf::from(document));
    }

    Ok(settings)
}

fn load_settings() -> Result<EngineSettings> {
    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    load_settings_from(&cwd)
}

/// Get the global settings (loads once, then cached)
pub fn settings() -> Result<&'static EngineSettings> {
    let result = SETTINGS.get_or_init(|| load_settings().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(settings) => Ok(settings),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload settings (useful for testing)
pub fn reload_settings() -> Result<EngineSettings> {
    load_settings()
}

/// Get the runs directory ($STEPLINE_HOME/runs)
pub fn runs_dir() -> Result<PathBuf> {
    Ok(settings()?.runs_dir())
}
