//! Per-run JSONL journal.
//!
//! Each run gets `<runs_dir>/<run_id>/events.jsonl`, one `RunEvent` per line,
//! appended as the runner makes progress and replayed to rebuild a `Run`.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::domain::{Run, RunEvent, RunEventType};

const EVENTS_FILE: &str = "events.jsonl";

#[derive(Debug, Clone)]
pub struct EventStore {
    run_id: Uuid,
    run_dir: PathBuf,
}

impl EventStore {
    /// Open the journal of `run_id`, creating its directory if needed
    pub async fn open(runs_dir: &Path, run_id: Uuid) -> Result<Self> {
        let run_dir = runs_dir.join(run_id.to_string());
        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("Cannot create run directory {}", run_dir.display()))?;

        Ok(Self { run_id, run_dir })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn events_path(&self) -> PathBuf {
        self.run_dir.join(EVENTS_FILE)
    }

    pub async fn append(&self, event: &RunEvent) -> Result<()> {
        let mut line = serde_json::to_vec(event).context("Cannot encode run event")?;
        line.push(b'\n');

        let path = self.events_path();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Cannot open journal {}", path.display()))?;
        file.write_all(&line)
            .await
            .with_context(|| format!("Cannot append to journal {}", path.display()))?;
        file.flush().await?;
        Ok(())
    }

    /// Every journaled event, oldest first. A run that never wrote an event
    /// replays as empty.
    pub async fn replay(&self) -> Result<Vec<RunEvent>> {
        let path = self.events_path();
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("Cannot read journal {}", path.display()))
            }
        };

        text.lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(n, line)| {
                serde_json::from_str(line)
                    .with_context(|| format!("{}:{}: malformed run event", path.display(), n + 1))
            })
            .collect()
    }

    pub async fn load_run(&self) -> Result<Option<Run>> {
        let events = self.replay().await?;
        Ok(Run::from_events(&events))
    }

    pub async fn last_event(&self) -> Result<Option<RunEvent>> {
        Ok(self.replay().await?.pop())
    }

    /// Whether a `StepCompleted` event carries this idempotency key
    pub async fn is_step_completed(&self, idempotency_key: &str) -> Result<bool> {
        let events = self.replay().await?;
        Ok(events.iter().any(|e| {
            e.event_type == RunEventType::StepCompleted && e.idempotency_key == idempotency_key
        }))
    }

    /// Ids of every run journaled under `runs_dir`, sorted
    pub async fn list_runs(runs_dir: &Path) -> Result<Vec<Uuid>> {
        let mut entries = match fs::read_dir(runs_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Cannot list runs in {}", runs_dir.display()))
            }
        };

        let mut runs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(id) = entry.file_name().to_str().and_then(|n| Uuid::parse_str(n).ok()) {
                runs.push(id);
            }
        }
        runs.sort();
        Ok(runs)
    }
}

/// `{run_id}:{step}:{input_hash}`
pub fn generate_idempotency_key(run_id: Uuid, step_name: &str, input: &[u8]) -> String {
    format!("{}:{}:{}", run_id, step_name, hash_input(input))
}

/// First 8 bytes of the SHA-256 digest, hex encoded
pub fn hash_input(input: &[u8]) -> String {
    let digest = Sha256::digest(input);
    hex::encode(&digest[..8])
}
