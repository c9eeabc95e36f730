//! Append-only forensic log: one `CycleRecord` per cycle, one JSON
//! object per line. Each append is flushed to disk before returning.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::types::CycleRecord;

#[async_trait]
pub trait ForensicSink: Send + Sync {
    async fn append(&self, record: &CycleRecord) -> Result<()>;
}

/// JSONL file sink.
pub struct JsonlForensicLog {
    path: PathBuf,
    // Serializes appends so lines never interleave.
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonlForensicLog {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Read every record back, skipping lines that fail to parse (a torn
    /// final line after a crash).
    pub async fn read_all(&self) -> Result<Vec<CycleRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read forensic log {}", self.path.display()))?;
        Ok(text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }
}

#[async_trait]
impl ForensicSink for JsonlForensicLog {
    async fn append(&self, record: &CycleRecord) -> Result<()> {
        let mut line = serde_json::to_string(record).context("Failed to serialise cycle record")?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open forensic log {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .await
            .context("Failed to append cycle record")?;
        file.flush().await.context("Failed to flush forensic log")?;
        file.sync_data().await.context("Failed to sync forensic log")?;

        debug!(cycle = record.cycle_id, outcome = %record.outcome, "Forensic record appended");
        Ok(())
    }
}

/// In-memory sink for tests and dry runs.
#[derive(Default)]
pub struct MemoryForensicLog {
    records: Mutex<Vec<CycleRecord>>,
}

impl MemoryForensicLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<CycleRecord> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl ForensicSink for MemoryForensicLog {
    async fn append(&self, record: &CycleRecord) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record.clone());
        Ok(())
    }
}
