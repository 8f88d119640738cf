//! Container backend for externally-imaged steps.
//!
//! Uses subprocess mode, calling a docker-compatible CLI (`docker`, `podman`)
//! directly. Structured input is piped to stdin as JSON; raw bytes are written
//! to a temporary file that is mounted read-only into the container and
//! removed once the step finishes.

use std::collections::HashMap;
use std::io::{ErrorKind, Write};
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{Provider, ProviderInvocationError};
use crate::domain::{ImageRef, Payload, ProviderRef, Step};

/// Where raw payloads appear inside the container
const PAYLOAD_MOUNT: &str = "/stepline/payload";

/// Exit code a docker-compatible CLI uses for its own (daemon) failures
const LAUNCHER_ERROR_EXIT: i32 = 125;

/// Container provider using subprocess mode
pub struct ContainerProvider {
    /// Path to the launcher binary (default: "docker")
    launcher: String,

    /// Builder images for `<builder>:<path>` providers
    builders: HashMap<String, ImageRef>,
}

impl Default for ContainerProvider {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl ContainerProvider {
    pub fn new(launcher: impl Into<String>) -> Self {
        Self {
            launcher: launcher.into(),
            builders: HashMap::new(),
        }
    }

    /// Register a builder image under a name
    pub fn with_builder(mut self, name: impl Into<String>, image: ImageRef) -> Self {
        self.builders.insert(name.into(), image);
        self
    }

    pub fn launcher(&self) -> &str {
        &self.launcher
    }

    fn unreachable(step: &Step, message: impl Into<String>) -> ProviderInvocationError {
        ProviderInvocationError::Unreachable {
            step: step.name.clone(),
            message: message.into(),
        }
    }

    /// Run the launcher to completion, feeding `stdin`
    async fn launch(
        &self,
        step: &Step,
        args: &[String],
        stdin: Option<Vec<u8>>,
    ) -> Result<std::process::Output, ProviderInvocationError> {
        debug!(step = %step.name, launcher = %self.launcher, ?args, "Launching container");

        let mut child = Command::new(&self.launcher)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Self::unreachable(step, format!("failed to spawn '{}': {}", self.launcher, e))
            })?;

        // Feed stdin while the output is drained so neither pipe can fill up
        let writer = match (stdin, child.stdin.take()) {
            (Some(bytes), Some(mut pipe)) => Some(tokio::spawn(async move {
                pipe.write_all(&bytes).await
                // Dropping the pipe signals EOF
            })),
            _ => None,
        };

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Self::unreachable(step, format!("failed to wait for container: {}", e)))?;

        if let Some(writer) = writer {
            match writer.await {
                Ok(Ok(())) => {}
                // The process may exit without reading all of its input
                Ok(Err(e)) if e.kind() == ErrorKind::BrokenPipe => {}
                Ok(Err(e)) => {
                    return Err(Self::unreachable(step, format!("failed to write stdin: {}", e)))
                }
                Err(e) => {
                    return Err(Self::unreachable(step, format!("stdin writer failed: {}", e)))
                }
            }
        }
        Ok(output)
    }

    /// Log in to a private registry when the image carries credentials
    async fn login(&self, step: &Step, image: &ImageRef) -> Result<(), ProviderInvocationError> {
        let (Some(username), Some(password)) = (&image.username, &image.password) else {
            return Ok(());
        };

        let mut args = vec![
            "login".to_string(),
            "--username".to_string(),
            username.clone(),
            "--password-stdin".to_string(),
        ];
        if let Some(registry) = registry_host(&image.image) {
            args.push(registry.to_string());
        }

        let output = self
            .launch(step, &args, Some(password.clone().into_bytes()))
            .await?;
        if !output.status.success() {
            return Err(Self::unreachable(
                step,
                format!(
                    "registry login failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        Ok(())
    }

    /// Build a Dockerfile directory and return the image id
    async fn build(&self, step: &Step, dir: &str) -> Result<String, ProviderInvocationError> {
        let dir = if dir.is_empty() { "." } else { dir };
        let args = vec!["build".to_string(), "-q".to_string(), dir.to_string()];
        let output = self.launch(step, &args, None).await?;

        if !output.status.success() {
            return Err(ProviderInvocationError::Failed {
                step: step.name.clone(),
                exit_code: output.status.code(),
                message: format!(
                    "image build failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
                output: None,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn run(
        &self,
        step: &Step,
        mut args: Vec<String>,
        image: String,
        input: Payload,
    ) -> Result<Payload, ProviderInvocationError> {
        let mut run_args = vec!["run".to_string(), "--rm".to_string(), "-i".to_string()];

        // Keeps the temp file alive until the container exits
        let mut _scoped: Option<NamedTempFile> = None;
        let stdin = match input {
            Payload::Parsed(value) => Some(serde_json::to_vec(&value).unwrap_or_default()),
            Payload::Raw(bytes) => {
                let file = write_temp(&bytes).map_err(|e| {
                    Self::unreachable(step, format!("failed to stage raw payload: {:#}", e))
                })?;
                run_args.push("-v".to_string());
                run_args.push(format!("{}:{}:ro", file.path().display(), PAYLOAD_MOUNT));
                run_args.push("-e".to_string());
                run_args.push(format!("STEPLINE_PAYLOAD={}", PAYLOAD_MOUNT));
                _scoped = Some(file);
                None
            }
        };

        run_args.append(&mut args);
        run_args.push(image);

        let output = self.launch(step, &run_args, stdin).await?;
        let stdout = parse_output(output.stdout);

        if !output.status.success() {
            let exit_code = output.status.code();
            let message = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if exit_code == Some(LAUNCHER_ERROR_EXIT) {
                return Err(Self::unreachable(step, message));
            }
            return Err(ProviderInvocationError::Failed {
                step: step.name.clone(),
                exit_code,
                message: if message.is_empty() {
                    format!("exit code {}", exit_code.unwrap_or(-1))
                } else {
                    message
                },
                output: match stdout {
                    Payload::Parsed(Value::Null) | Payload::Raw(_) => None,
                    Payload::Parsed(value) => Some(value),
                },
            });
        }

        Ok(stdout)
    }
}

#[async_trait]
impl Provider for ContainerProvider {
    fn name(&self) -> &str {
        "container"
    }

    async fn invoke(
        &self,
        step: &Step,
        provider: &ProviderRef,
        input: Payload,
    ) -> Result<Payload, ProviderInvocationError> {
        match provider {
            ProviderRef::Image(image) => {
                self.login(step, image).await?;
                self.run(step, Vec::new(), image.reference(), input).await
            }
            ProviderRef::Dockerfile { path } => {
                let image = self.build(step, path).await?;
                self.run(step, Vec::new(), image, input).await
            }
            ProviderRef::Custom { builder, path } => {
                let image = self.builders.get(builder).ok_or_else(|| {
                    ProviderInvocationError::Unsupported {
                        step: step.name.clone(),
                        provider: provider.to_string(),
                    }
                })?;
                self.login(step, image).await?;
                let workspace = std::env::current_dir()
                    .map(|cwd| cwd.join(path))
                    .unwrap_or_else(|_| path.into());
                let args = vec![
                    "-v".to_string(),
                    format!("{}:/workspace:ro", workspace.display()),
                    "-w".to_string(),
                    "/workspace".to_string(),
                ];
                self.run(step, args, image.reference(), input).await
            }
            ProviderRef::Builtin { .. } => Err(ProviderInvocationError::Unsupported {
                step: step.name.clone(),
                provider: provider.to_string(),
            }),
        }
    }

    async fn health_check(&self) -> Result<()> {
        let output = Command::new(&self.launcher)
            .arg("version")
            .output()
            .await
            .with_context(|| format!("Failed to run '{} version'", self.launcher))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Container backend health check failed: {}", stderr.trim());
        }

        Ok(())
    }
}

fn write_temp(bytes: &[u8]) -> Result<NamedTempFile> {
    let mut file = NamedTempFile::new().context("Failed to create payload file")?;
    file.write_all(bytes).context("Failed to write payload file")?;
    file.flush().context("Failed to flush payload file")?;
    Ok(file)
}

/// JSON output is parsed; anything else is kept as raw bytes
fn parse_output(stdout: Vec<u8>) -> Payload {
    if stdout.iter().all(u8::is_ascii_whitespace) {
        return Payload::Parsed(Value::Null);
    }
    match serde_json::from_slice(&stdout) {
        Ok(value) => Payload::Parsed(value),
        Err(_) => Payload::Raw(stdout),
    }
}

/// Registry host of an image name, if it names one (`host.tld/...`, `host:port/...`)
fn registry_host(image: &str) -> Option<&str> {
    let (first, _) = image.split_once('/')?;
    (first.contains('.') || first.contains(':') || first == "localhost").then_some(first)
}
