//! Append-only process journal with file-based persistence.
//!
//! Events are stored as newline-delimited JSON (JSONL), one file per
//! process, for easy debugging/inspection. The journal is an audit trail
//! only; nothing reads it back to resume execution.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::warn;

use crate::domain::{EventType, ProcessEvent};

/// File-based journal using JSONL format
#[derive(Debug)]
pub struct Journal {
    /// Directory holding one subdirectory per process
    base_dir: PathBuf,
}

impl Journal {
    /// Open (and create) a journal rooted at `base_dir`
    pub async fn open(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)
            .await
            .with_context(|| format!("Failed to create journal directory: {}", base_dir.display()))?;
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Directory of one process; keys are hashed so any key is a safe name
    pub fn process_dir(&self, process_id: &str) -> PathBuf {
        self.base_dir.join(hash_input(process_id))
    }

    /// Path to the events file of one process
    pub fn events_path(&self, process_id: &str) -> PathBuf {
        self.process_dir(process_id).join("events.jsonl")
    }

    /// Append an event to the log of its process
    pub async fn append(&self, event: &ProcessEvent) -> Result<()> {
        let dir = self.process_dir(&event.process_id);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create process directory: {}", dir.display()))?;

        let path = dir.join("events.jsonl");
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open events file: {}", path.display()))?;

        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write event")?;
        file.flush().await.context("Failed to flush event")?;

        Ok(())
    }

    /// Replay all events of a process in order
    pub async fn replay(&self, process_id: &str) -> Result<Vec<ProcessEvent>> {
        let path = self.events_path(process_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&path)
            .await
            .with_context(|| format!("Failed to open events file: {}", path.display()))?;

        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: ProcessEvent = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse event: {}", line))?;
            events.push(event);
        }

        Ok(events)
    }

    /// Get the last event of a specific type
    pub async fn last_event_of_type(
        &self,
        process_id: &str,
        event_type: EventType,
    ) -> Result<Option<ProcessEvent>> {
        let events = self.replay(process_id).await?;
        Ok(events.into_iter().rev().find(|e| e.event_type == event_type))
    }

    /// List the ids of all journaled processes
    pub async fn list_processes(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        if !self.base_dir.exists() {
            return Ok(ids);
        }

        let mut entries = fs::read_dir(&self.base_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let path = entry.path().join("events.jsonl");
            let Ok(file) = File::open(&path).await else {
                continue;
            };
            let mut lines = BufReader::new(file).lines();
            if let Some(first) = lines.next_line().await? {
                if let Ok(event) = serde_json::from_str::<ProcessEvent>(&first) {
                    ids.push(event.process_id);
                }
            }
        }

        ids.sort();
        Ok(ids)
    }
}

/// Where a running process sends its journal events.
///
/// Recording never fails the process: write errors are logged and dropped.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    process_id: String,
    journal: Option<Arc<Journal>>,
}

impl EventSink {
    pub fn new(process_id: impl Into<String>, journal: Option<Arc<Journal>>) -> Self {
        Self {
            process_id: process_id.into(),
            journal,
        }
    }

    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    pub async fn record(&self, event: ProcessEvent) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.append(&event).await {
                warn!(process_id = %self.process_id, error = %e, "Failed to journal event");
            }
        }
    }
}

/// Hash input content (first 16 chars of SHA256)
pub fn hash_input(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..8])
}
