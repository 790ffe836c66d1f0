// ABOUTME: WatermarkStore persisted to a local JSON state file
// ABOUTME: Tracks last success and last attempt per dataset without writing to the metadata database

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

use super::{RunRecord, WatermarkStore};

const STATE_VERSION: u32 = 1;

/// Sync state for a single dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSyncState {
    pub dataset_id: i64,
    /// Window end of the last successful run (the watermark)
    pub last_success_at: Option<DateTime<Utc>>,
    /// Records applied by the last successful run
    pub last_record_count: u64,
    pub last_attempt_at: DateTime<Utc>,
    pub last_status: String,
    pub last_error: Option<String>,
}

impl DatasetSyncState {
    pub fn new(dataset_id: i64) -> Self {
        Self {
            dataset_id,
            last_success_at: None,
            last_record_count: 0,
            last_attempt_at: Utc::now(),
            last_status: "Never".to_string(),
            last_error: None,
        }
    }

    /// Fold a run into this state. The watermark never moves backwards.
    pub fn apply(&mut self, record: &RunRecord) {
        self.last_attempt_at = Utc::now();
        self.last_status = record.status.clone();
        self.last_error = record.error.clone();
        if record.success {
            self.last_record_count = record.record_count;
            self.last_success_at = Some(match self.last_success_at {
                Some(previous) => previous.max(record.start_time),
                None => record.start_time,
            });
        }
    }
}

/// Contents of the state file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatermarkState {
    /// Per-dataset states, keyed by dataset id
    pub datasets: BTreeMap<i64, DatasetSyncState>,
    /// Version of the state format for future migrations
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for WatermarkState {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            datasets: BTreeMap::new(),
            version: STATE_VERSION,
            created_at: now,
            updated_at: now,
        }
    }
}

impl WatermarkState {
    pub fn get(&self, dataset_id: i64) -> Option<&DatasetSyncState> {
        self.datasets.get(&dataset_id)
    }

    pub fn apply(&mut self, record: &RunRecord) {
        self.datasets
            .entry(record.dataset_id)
            .or_insert_with(|| DatasetSyncState::new(record.dataset_id))
            .apply(record);
        self.updated_at = Utc::now();
    }

    /// Load state from a JSON file.
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read watermark state from {:?}", path))?;
        let state: WatermarkState = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse watermark state from {:?}", path))?;
        if state.version != STATE_VERSION {
            anyhow::bail!(
                "Unsupported watermark state version {} in {:?} (expected {})",
                state.version,
                path,
                STATE_VERSION
            );
        }
        Ok(state)
    }

    /// Load state, or start empty when the file does not exist yet.
    pub async fn load_or_default(path: &Path) -> Result<Self> {
        if fs::try_exists(path)
            .await
            .with_context(|| format!("Failed to stat {:?}", path))?
        {
            Self::load(path).await
        } else {
            Ok(Self::default())
        }
    }

    /// Save state, replacing the file atomically.
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }

        let contents =
            serde_json::to_string_pretty(self).context("Failed to serialize watermark state")?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, contents)
            .await
            .with_context(|| format!("Failed to write watermark state to {:?}", tmp))?;
        fs::rename(&tmp, path)
            .await
            .with_context(|| format!("Failed to move watermark state into {:?}", path))?;
        Ok(())
    }
}

/// [`WatermarkStore`] over a [`WatermarkState`] file.
///
/// Read-modify-write cycles are serialized in-process; the file is re-read
/// on every call so external edits are picked up.
pub struct FileWatermarkStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileWatermarkStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn snapshot(&self) -> Result<WatermarkState> {
        let _guard = self.lock.lock().await;
        WatermarkState::load_or_default(&self.path).await
    }
}

#[async_trait]
impl WatermarkStore for FileWatermarkStore {
    async fn latest_success(&self, dataset_id: i64) -> Result<Option<DateTime<Utc>>> {
        let state = self.snapshot().await?;
        Ok(state.get(dataset_id).and_then(|s| s.last_success_at))
    }

    async fn record_run(&self, record: &RunRecord) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut state = WatermarkState::load_or_default(&self.path).await?;
        state.apply(record);
        state.save(&self.path).await
    }
}
