// ABOUTME: Watermark tracking - resolves each run's sync window from prior successful runs
// ABOUTME: Backed by a WatermarkStore (metadata database or local JSON state file)

pub mod file;
pub mod postgres;

pub use file::FileWatermarkStore;
pub use postgres::PostgresWatermarkStore;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt;
use std::sync::Arc;

use crate::error::SyncError;

/// Time range a run fetches changes for. `from <= to` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl SyncWindow {
    /// Build a window, clamping `from` so it never lies after `to`.
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            from: from.min(to),
            to,
        }
    }
}

impl fmt::Display for SyncWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} .. {}",
            self.from.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.to.to_rfc3339_opts(SecondsFormat::Secs, true)
        )
    }
}

/// One finished run, as written to the watermark store.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub dataset_id: i64,
    /// Window end for successful runs, run start instant otherwise
    pub start_time: DateTime<Utc>,
    pub success: bool,
    pub record_count: u64,
    /// "Success", "NoData" or the failure kind
    pub status: String,
    pub error: Option<String>,
}

/// Persistent record of sync runs per dataset.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    /// Latest start time among successful runs, if any.
    async fn latest_success(&self, dataset_id: i64) -> Result<Option<DateTime<Utc>>>;

    /// Append a run record.
    async fn record_run(&self, record: &RunRecord) -> Result<()>;
}

/// Resolves windows and records run outcomes on top of a [`WatermarkStore`].
#[derive(Clone)]
pub struct WatermarkTracker {
    store: Arc<dyn WatermarkStore>,
    epoch: DateTime<Utc>,
}

impl WatermarkTracker {
    /// # Arguments
    ///
    /// * `store` - Backing store for run records
    /// * `epoch` - `from` used for datasets that never synced successfully
    pub fn new(store: Arc<dyn WatermarkStore>, epoch: DateTime<Utc>) -> Self {
        Self { store, epoch }
    }

    pub fn epoch(&self) -> DateTime<Utc> {
        self.epoch
    }

    /// Resolve the window for the next run of `dataset_id`, ending now.
    ///
    /// # Errors
    ///
    /// [`SyncError::StoreUnavailable`] when the store cannot be read. No
    /// fallback window is used in that case.
    pub async fn resolve_window(&self, dataset_id: i64) -> Result<SyncWindow, SyncError> {
        self.resolve_window_at(dataset_id, Utc::now()).await
    }

    /// Like [`resolve_window`](Self::resolve_window) with an explicit `now`.
    pub async fn resolve_window_at(
        &self,
        dataset_id: i64,
        now: DateTime<Utc>,
    ) -> Result<SyncWindow, SyncError> {
        let latest = self
            .store
            .latest_success(dataset_id)
            .await
            .map_err(|e| SyncError::store(&e))?;

        let from = latest.unwrap_or(self.epoch);
        if from > now {
            tracing::warn!(
                "Dataset {} watermark {} is in the future, clamping window start to now",
                dataset_id,
                from
            );
        }
        Ok(SyncWindow::new(from, now))
    }

    /// Advance the watermark to the end of `window`.
    pub async fn record_success(
        &self,
        dataset_id: i64,
        window: &SyncWindow,
        record_count: u64,
    ) -> Result<()> {
        self.store
            .record_run(&RunRecord {
                dataset_id,
                start_time: window.to,
                success: true,
                record_count,
                status: "Success".to_string(),
                error: None,
            })
            .await
    }

    /// Record a run that must not move the watermark (no data or failure).
    pub async fn record_unsuccessful(
        &self,
        dataset_id: i64,
        started_at: DateTime<Utc>,
        status: &str,
        error: Option<String>,
    ) -> Result<()> {
        self.store
            .record_run(&RunRecord {
                dataset_id,
                start_time: started_at,
                success: false,
                record_count: 0,
                status: status.to_string(),
                error,
            })
            .await
    }
}
