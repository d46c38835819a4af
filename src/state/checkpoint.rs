//! Rule state checkpoints for fast restart

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time;

use super::machine::RuleState;
use crate::engine::AlertEngine;
use crate::rules::AlertRule;

const CHECKPOINT_VERSION: u32 = 1;

/// Shortest interval between periodic checkpoints
const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// Registered rules and their states, keyed by rule name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub rules: Vec<AlertRule>,
    pub states: BTreeMap<String, RuleState>,
}

impl Checkpoint {
    pub fn new(rules: Vec<AlertRule>, states: BTreeMap<String, RuleState>) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            saved_at: Utc::now(),
            rules,
            states,
        }
    }

    /// Write atomically: a temp file next to `path` is renamed over it
    pub fn save(&self, path: &Path) -> Result<(), CheckpointError> {
        let data = serde_json::to_vec_pretty(self)
            .map_err(|e| CheckpointError::Serialization(e.to_string()))?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let tmp = temp_path(path);
        std::fs::write(&tmp, &data)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Load a checkpoint; a missing file is not an error
    pub fn load(path: &Path) -> Result<Option<Self>, CheckpointError> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let checkpoint: Checkpoint = serde_json::from_slice(&data)
            .map_err(|e| CheckpointError::Deserialization(e.to_string()))?;

        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(CheckpointError::UnsupportedVersion(checkpoint.version));
        }

        Ok(Some(checkpoint))
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Periodically checkpoints the engine's rule states
pub struct CheckpointWorker {
    engine: Arc<AlertEngine>,
    path: PathBuf,
    interval: Duration,
    running: Arc<AtomicBool>,
}

impl CheckpointWorker {
    pub fn new(engine: Arc<AlertEngine>, path: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            engine,
            path: path.into(),
            interval: interval.max(MIN_INTERVAL),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start the background worker
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);

        tokio::spawn(async move {
            tracing::info!(
                path = %self.path.display(),
                "Checkpoint worker started with interval {:?}",
                self.interval
            );

            let mut interval = time::interval(self.interval);
            // The first tick completes immediately
            interval.tick().await;

            while self.running.load(Ordering::SeqCst) {
                interval.tick().await;
                self.write_once();
            }

            tracing::info!("Checkpoint worker stopped");
        })
    }

    /// Write one checkpoint now
    pub fn write_once(&self) {
        match self.engine.checkpoint().save(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "Checkpoint written"),
            Err(e) => tracing::error!(
                path = %self.path.display(),
                error = %e,
                "Failed to write checkpoint"
            ),
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Unsupported checkpoint version {0}")]
    UnsupportedVersion(u32),
}
