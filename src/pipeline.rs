// ABOUTME: Per-dataset sync pipeline - window, fetch, parse, normalize and materialize
// ABOUTME: Also runs batches of datasets concurrently with isolated failures and optional retry

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::changeset::{enrich, parse, GeometryNormalizer};
use crate::error::SyncError;
use crate::materialize::ChangesetSink;
use crate::registry::{CredentialStore, DatasetDescriptor};
use crate::remote::ChangesetSource;
use crate::utils::retry_with_backoff;
use crate::watermark::{SyncWindow, WatermarkTracker};

/// Outcome of one dataset run.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncStatus {
    Success,
    /// The service reported nothing for the window; the watermark stays put.
    NoData,
    Failed(SyncError),
}

impl SyncStatus {
    /// Label stored with the run record.
    pub fn label(&self) -> &'static str {
        match self {
            SyncStatus::Success => "Success",
            SyncStatus::NoData => "NoData",
            SyncStatus::Failed(e) => e.kind(),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, SyncStatus::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncResult {
    pub dataset_id: i64,
    /// `None` when the window itself could not be resolved
    pub window: Option<SyncWindow>,
    pub record_count: u64,
    pub status: SyncStatus,
    /// Set only when the run advanced the watermark
    pub new_watermark: Option<DateTime<Utc>>,
}

impl fmt::Display for SyncResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.status {
            SyncStatus::Failed(e) => write!(f, "dataset {} failed: {}", self.dataset_id, e),
            status => write!(
                f,
                "dataset {} {} ({} records)",
                self.dataset_id,
                status.label(),
                self.record_count
            ),
        }
    }
}

/// Collaborators a pipeline run needs, injected once.
pub struct PipelineContext {
    pub watermarks: WatermarkTracker,
    pub credentials: Arc<dyn CredentialStore>,
    pub source: Arc<dyn ChangesetSource>,
    pub sink: Arc<dyn ChangesetSink>,
    pub normalizer: GeometryNormalizer,
}

/// Batch settings for [`Pipeline::run_batch`].
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Maximum dataset runs in flight
    pub max_workers: usize,
    /// Extra attempts for runs failing with a source error
    pub retry_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_workers: 4,
            retry_attempts: 0,
            retry_delay: Duration::from_secs(30),
        }
    }
}

/// Summary of a batch of dataset runs.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub datasets_attempted: usize,
    pub succeeded: usize,
    pub no_data: usize,
    pub failed: usize,
    pub records_applied: u64,
    /// (dataset id, reason) per failed run
    pub failures: Vec<(i64, String)>,
    /// Per-dataset results ordered by dataset id
    pub results: Vec<SyncResult>,
    pub duration_ms: u64,
}

impl BatchReport {
    /// Check if every dataset run completed without failure.
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    fn add(&mut self, result: SyncResult) {
        self.datasets_attempted += 1;
        match &result.status {
            SyncStatus::Success => {
                self.succeeded += 1;
                self.records_applied += result.record_count;
            }
            SyncStatus::NoData => self.no_data += 1,
            SyncStatus::Failed(e) => {
                self.failed += 1;
                self.failures.push((result.dataset_id, e.to_string()));
            }
        }
        self.results.push(result);
    }
}

pub struct Pipeline {
    ctx: PipelineContext,
    locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl Pipeline {
    pub fn new(ctx: PipelineContext) -> Self {
        Self {
            ctx,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    async fn dataset_lock(&self, dataset_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(dataset_id).or_default())
    }

    /// Run one dataset: resolve its window, fetch and decode the changeset and
    /// apply it. Never panics or returns early with an error; every failure
    /// ends up in the returned status.
    ///
    /// Runs for the same dataset are serialized.
    pub async fn sync_dataset(&self, descriptor: &DatasetDescriptor) -> SyncResult {
        let lock = self.dataset_lock(descriptor.dataset_id).await;
        let _guard = lock.lock().await;

        let started_at = Utc::now();
        let dataset_id = descriptor.dataset_id;

        // Store failures end the run before any run record could be written
        let window = match self.ctx.watermarks.resolve_window(dataset_id).await {
            Ok(window) => window,
            Err(e) => return self.unrecorded_failure(descriptor, None, e),
        };
        tracing::info!("Syncing {} over {}", descriptor, window);

        let api_key = match self.ctx.credentials.get_api_key(descriptor.source_id).await {
            Ok(key) => key,
            Err(e) => return self.unrecorded_failure(descriptor, Some(window), SyncError::store(&e)),
        };

        let response = match self.ctx.source.fetch(descriptor, &window, &api_key).await {
            Ok(response) => response,
            Err(e) => {
                return self
                    .finish_unsuccessful(descriptor, window, started_at, SyncStatus::Failed(SyncError::source(&e)))
                    .await
            }
        };

        if response.is_no_data() {
            tracing::info!("No changes for dataset {} (HTTP {})", dataset_id, response.status);
            return self
                .finish_unsuccessful(descriptor, window, started_at, SyncStatus::NoData)
                .await;
        }
        if !response.is_success() {
            let err = SyncError::Source(format!(
                "HTTP {}: {}",
                response.status,
                response.body_excerpt()
            ));
            return self
                .finish_unsuccessful(descriptor, window, started_at, SyncStatus::Failed(err))
                .await;
        }

        let features = match parse(&response.body, Some(self.ctx.source.format())) {
            Ok(features) => features,
            Err(e) => {
                return self
                    .finish_unsuccessful(descriptor, window, started_at, SyncStatus::Failed(e))
                    .await
            }
        };
        let records = enrich(features, &self.ctx.normalizer);
        let record_count = records.len() as u64;

        if records.is_empty() {
            tracing::info!("Changeset for dataset {} is empty", dataset_id);
        } else if let Err(e) = self.ctx.sink.apply(descriptor, &records).await {
            return self
                .finish_unsuccessful(descriptor, window, started_at, SyncStatus::Failed(e))
                .await;
        }

        self.finish_success(descriptor, window, record_count).await
    }

    async fn finish_success(
        &self,
        descriptor: &DatasetDescriptor,
        window: SyncWindow,
        record_count: u64,
    ) -> SyncResult {
        let dataset_id = descriptor.dataset_id;
        if let Err(e) = self
            .ctx
            .watermarks
            .record_success(dataset_id, &window, record_count)
            .await
        {
            // Changes are committed but the watermark did not move; the next
            // run replays the same window, which the delete/insert makes safe.
            return self.unrecorded_failure(descriptor, Some(window), SyncError::store(&e));
        }

        tracing::info!(
            "Dataset {} synced: {} records, watermark now {}",
            dataset_id,
            record_count,
            window.to
        );
        SyncResult {
            dataset_id,
            window: Some(window),
            record_count,
            status: SyncStatus::Success,
            new_watermark: Some(window.to),
        }
    }

    async fn finish_unsuccessful(
        &self,
        descriptor: &DatasetDescriptor,
        window: SyncWindow,
        started_at: DateTime<Utc>,
        status: SyncStatus,
    ) -> SyncResult {
        let reason = match &status {
            SyncStatus::Failed(e) => {
                tracing::error!("Failed to sync {}: {}", descriptor, e);
                Some(e.to_string())
            }
            _ => None,
        };

        if let Err(e) = self
            .ctx
            .watermarks
            .record_unsuccessful(descriptor.dataset_id, started_at, status.label(), reason)
            .await
        {
            tracing::warn!(
                "Could not record {} run for dataset {}: {:#}",
                status.label(),
                descriptor.dataset_id,
                e
            );
        }

        SyncResult {
            dataset_id: descriptor.dataset_id,
            window: Some(window),
            record_count: 0,
            status,
            new_watermark: None,
        }
    }

    fn unrecorded_failure(
        &self,
        descriptor: &DatasetDescriptor,
        window: Option<SyncWindow>,
        err: SyncError,
    ) -> SyncResult {
        tracing::error!("Failed to sync {}: {}", descriptor, err);
        SyncResult {
            dataset_id: descriptor.dataset_id,
            window,
            record_count: 0,
            status: SyncStatus::Failed(err),
            new_watermark: None,
        }
    }

    /// Run one dataset, retrying source failures with exponential backoff.
    pub async fn sync_with_retry(
        &self,
        descriptor: &DatasetDescriptor,
        options: &BatchOptions,
    ) -> SyncResult {
        let outcome = retry_with_backoff(
            move || async move {
                let result = self.sync_dataset(descriptor).await;
                let retryable =
                    matches!(&result.status, SyncStatus::Failed(e) if e.is_retryable());
                if retryable {
                    Err(result)
                } else {
                    Ok(result)
                }
            },
            options.retry_attempts,
            options.retry_delay,
            |_: &SyncResult| true,
        )
        .await;

        match outcome {
            Ok(result) | Err(result) => result,
        }
    }

    /// Run many datasets with at most `max_workers` in flight.
    ///
    /// A failing dataset never affects its siblings.
    pub async fn run_batch(
        &self,
        descriptors: Vec<DatasetDescriptor>,
        options: &BatchOptions,
    ) -> BatchReport {
        let start = Instant::now();
        let workers = options.max_workers.max(1);
        tracing::info!(
            "Starting sync of {} datasets with {} workers",
            descriptors.len(),
            workers
        );

        let mut results: Vec<SyncResult> = stream::iter(descriptors)
            .map(|descriptor| async move { self.sync_with_retry(&descriptor, options).await })
            .buffer_unordered(workers)
            .collect()
            .await;
        results.sort_by_key(|r| r.dataset_id);

        let mut report = BatchReport::default();
        for result in results {
            report.add(result);
        }
        report.duration_ms = start.elapsed().as_millis() as u64;

        tracing::info!(
            "Batch finished in {}ms: {} succeeded, {} no data, {} failed",
            report.duration_ms,
            report.succeeded,
            report.no_data,
            report.failed
        );
        report
    }
}
