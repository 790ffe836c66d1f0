// ABOUTME: Pipeline behaviour tests with in-memory collaborators
// ABOUTME: Covers watermark handling per outcome, error classification and batch isolation

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use geo_changeset_sync::changeset::{ChangeKind, ChangeRecord, GeometryNormalizer, PayloadFormat};
use geo_changeset_sync::materialize::{ChangesetSink, MaterializeReport};
use geo_changeset_sync::pipeline::{BatchOptions, PipelineContext};
use geo_changeset_sync::registry::CredentialStore;
use geo_changeset_sync::remote::{ChangesetSource, FetchResponse};
use geo_changeset_sync::watermark::{RunRecord, WatermarkStore, WatermarkTracker};
use geo_changeset_sync::{DatasetDescriptor, Pipeline, SyncError, SyncStatus, SyncWindow};

#[derive(Default)]
struct MemoryWatermarks {
    runs: Mutex<Vec<RunRecord>>,
    unavailable: bool,
}

impl MemoryWatermarks {
    fn runs_for(&self, dataset_id: i64) -> Vec<RunRecord> {
        self.runs
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.dataset_id == dataset_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl WatermarkStore for MemoryWatermarks {
    async fn latest_success(&self, dataset_id: i64) -> Result<Option<DateTime<Utc>>> {
        if self.unavailable {
            anyhow::bail!("metadata database unreachable");
        }
        Ok(self
            .runs_for(dataset_id)
            .iter()
            .filter(|r| r.success)
            .map(|r| r.start_time)
            .max())
    }

    async fn record_run(&self, record: &RunRecord) -> Result<()> {
        self.runs.lock().unwrap().push(record.clone());
        Ok(())
    }
}

struct StaticCredentials;

#[async_trait]
impl CredentialStore for StaticCredentials {
    async fn get_api_key(&self, source_id: i64) -> Result<String> {
        match source_id {
            404 => anyhow::bail!("No API key registered for source {}", source_id),
            _ => Ok(format!("key-{}", source_id)),
        }
    }
}

/// Responses queued for one dataset.
#[derive(Default)]
struct Script {
    queue: Vec<Result<FetchResponse, String>>,
    /// The sole remaining entry has been served and is now repeating
    repeating: bool,
}

/// Serves queued responses per dataset; the last one repeats until a new
/// response is queued behind it.
#[derive(Default)]
struct ScriptedSource {
    responses: Mutex<HashMap<i64, Script>>,
    windows: Mutex<Vec<(i64, SyncWindow)>>,
}

impl ScriptedSource {
    fn respond(&self, dataset_id: i64, status: u16, body: &str) {
        self.push(dataset_id, Ok(FetchResponse { status, body: body.to_string() }));
    }

    fn fail_transport(&self, dataset_id: i64) {
        self.push(dataset_id, Err("connection reset by peer".to_string()));
    }

    fn push(&self, dataset_id: i64, response: Result<FetchResponse, String>) {
        let mut responses = self.responses.lock().unwrap();
        let script = responses.entry(dataset_id).or_default();
        if script.repeating {
            script.queue.clear();
            script.repeating = false;
        }
        script.queue.push(response);
    }

    fn fetch_count(&self, dataset_id: i64) -> usize {
        self.windows
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == dataset_id)
            .count()
    }
}

#[async_trait]
impl ChangesetSource for ScriptedSource {
    async fn fetch(
        &self,
        descriptor: &DatasetDescriptor,
        window: &SyncWindow,
        _api_key: &str,
    ) -> Result<FetchResponse> {
        self.windows
            .lock()
            .unwrap()
            .push((descriptor.dataset_id, *window));

        let mut responses = self.responses.lock().unwrap();
        let script = responses.entry(descriptor.dataset_id).or_default();
        let next = match script.queue.len() {
            0 => Ok(FetchResponse { status: 204, body: String::new() }),
            1 => {
                script.repeating = true;
                script.queue[0].clone()
            }
            _ => script.queue.remove(0),
        };
        next.map_err(anyhow::Error::msg)
    }

    fn format(&self) -> PayloadFormat {
        PayloadFormat::Json
    }
}

#[derive(Default)]
struct RecordingSink {
    applied: Mutex<HashMap<i64, Vec<ChangeRecord>>>,
    failing: Vec<i64>,
    calls: AtomicUsize,
}

#[async_trait]
impl ChangesetSink for RecordingSink {
    async fn apply(
        &self,
        descriptor: &DatasetDescriptor,
        records: &[ChangeRecord],
    ) -> Result<MaterializeReport, SyncError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.contains(&descriptor.dataset_id) {
            return Err(SyncError::Database(
                "duplicate key value violates unique constraint".to_string(),
            ));
        }
        self.applied
            .lock()
            .unwrap()
            .entry(descriptor.dataset_id)
            .or_default()
            .extend(records.iter().cloned());
        Ok(MaterializeReport {
            staged: records.len() as u64,
            deleted: 0,
            inserted: records.len() as u64,
        })
    }
}

struct Harness {
    pipeline: Pipeline,
    watermarks: Arc<MemoryWatermarks>,
    source: Arc<ScriptedSource>,
    sink: Arc<RecordingSink>,
}

fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap()
}

fn harness_with(watermarks: MemoryWatermarks, sink: RecordingSink) -> Harness {
    let watermarks = Arc::new(watermarks);
    let source = Arc::new(ScriptedSource::default());
    let sink = Arc::new(sink);
    let pipeline = Pipeline::new(PipelineContext {
        watermarks: WatermarkTracker::new(watermarks.clone(), epoch()),
        credentials: Arc::new(StaticCredentials),
        source: source.clone(),
        sink: sink.clone(),
        normalizer: GeometryNormalizer::nztm(),
    });
    Harness {
        pipeline,
        watermarks,
        source,
        sink,
    }
}

fn harness() -> Harness {
    harness_with(MemoryWatermarks::default(), RecordingSink::default())
}

fn dataset(id: i64) -> DatasetDescriptor {
    DatasetDescriptor::new(id, 1, 50000 + id, "layer", &format!("layer_{}", id), "id", "public")
        .unwrap()
}

const TWO_FEATURES: &str = r#"{"type": "FeatureCollection", "features": [
    {"type": "Feature",
     "geometry": {"type": "Point", "coordinates": [174.78, -36.85]},
     "properties": {"__change__": "INSERT", "id": 1, "name": "Auckland"}},
    {"type": "Feature",
     "geometry": null,
     "properties": {"__change__": "DELETE", "id": 2}}
]}"#;

#[tokio::test]
async fn test_success_applies_records_and_advances_watermark() {
    let h = harness();
    h.source.respond(1, 200, TWO_FEATURES);

    let result = h.pipeline.sync_dataset(&dataset(1)).await;
    assert_eq!(result.status, SyncStatus::Success);
    assert_eq!(result.record_count, 2);

    let window = result.window.unwrap();
    assert_eq!(window.from, epoch());
    assert_eq!(result.new_watermark, Some(window.to));

    let applied = h.sink.applied.lock().unwrap().get(&1).cloned().unwrap();
    assert_eq!(applied.len(), 2);
    assert_eq!(applied[0].change_kind, ChangeKind::Insert);
    assert!(applied[0].geometry.as_ref().unwrap().wkt.starts_with("POINT(1758695"));
    assert_eq!(applied[1].change_kind, ChangeKind::Delete);

    let runs = h.watermarks.runs_for(1);
    assert_eq!(runs.len(), 1);
    assert!(runs[0].success);
    assert_eq!(runs[0].start_time, window.to);
}

#[tokio::test]
async fn test_consecutive_windows_are_contiguous_and_monotonic() {
    let h = harness();
    h.source.respond(1, 200, TWO_FEATURES);

    let first = h.pipeline.sync_dataset(&dataset(1)).await;
    let second = h.pipeline.sync_dataset(&dataset(1)).await;

    let first_window = first.window.unwrap();
    let second_window = second.window.unwrap();
    assert_eq!(second_window.from, first_window.to);
    assert!(second.new_watermark.unwrap() >= first.new_watermark.unwrap());
}

#[tokio::test]
async fn test_server_error_leaves_watermark_untouched() {
    let h = harness();
    h.source.respond(1, 200, TWO_FEATURES);
    let first = h.pipeline.sync_dataset(&dataset(1)).await;
    let watermark = first.new_watermark.unwrap();

    h.source.respond(1, 500, "Internal Server Error");
    let failed = h.pipeline.sync_dataset(&dataset(1)).await;
    match &failed.status {
        SyncStatus::Failed(SyncError::Source(reason)) => assert!(reason.contains("HTTP 500")),
        other => panic!("expected source failure, got {:?}", other),
    }
    assert_eq!(failed.new_watermark, None);

    // The next run retries from the same watermark
    let retry = h.pipeline.sync_dataset(&dataset(1)).await;
    assert_eq!(retry.window.unwrap().from, watermark);
    assert_eq!(h.source.fetch_count(1), 3);

    let failures: Vec<RunRecord> = h
        .watermarks
        .runs_for(1)
        .into_iter()
        .filter(|r| !r.success)
        .collect();
    assert!(!failures.is_empty());
    assert_eq!(failures[0].status, "SourceError");
}

#[tokio::test]
async fn test_transport_failure_is_source_error() {
    let h = harness();
    h.source.fail_transport(1);

    let result = h.pipeline.sync_dataset(&dataset(1)).await;
    match result.status {
        SyncStatus::Failed(SyncError::Source(reason)) => assert!(reason.contains("connection reset")),
        other => panic!("expected source failure, got {:?}", other),
    }
    assert_eq!(h.sink.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_no_data_statuses() {
    for status in [204u16, 404] {
        let h = harness();
        h.source.respond(1, status, "");

        let result = h.pipeline.sync_dataset(&dataset(1)).await;
        assert_eq!(result.status, SyncStatus::NoData);
        assert_eq!(result.new_watermark, None);
        assert!(h.watermarks.runs_for(1).iter().all(|r| !r.success));
    }
}

#[tokio::test]
async fn test_empty_changeset_is_success_without_touching_target() {
    let h = harness();
    h.source.respond(1, 200, r#"{"type": "FeatureCollection", "features": []}"#);

    let result = h.pipeline.sync_dataset(&dataset(1)).await;
    assert_eq!(result.status, SyncStatus::Success);
    assert_eq!(result.record_count, 0);
    assert!(result.new_watermark.is_some());
    assert_eq!(h.sink.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_malformed_payload_aborts_before_materialization() {
    let h = harness();
    h.source.respond(1, 200, r#"{"type": "FeatureCollection", "features": [{"prop"#);

    let result = h.pipeline.sync_dataset(&dataset(1)).await;
    assert!(matches!(result.status, SyncStatus::Failed(SyncError::Parse(_))));
    assert_eq!(result.new_watermark, None);
    assert_eq!(h.sink.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_geometry_failure_is_local_to_record() {
    let h = harness();
    h.source.respond(
        1,
        200,
        r#"{"features": [
            {"geometry": {"type": "MultiPoint", "coordinates": [[174.7, -36.8]]},
             "properties": {"__change__": "INSERT", "id": 1}},
            {"geometry": {"type": "Point", "coordinates": [1750000, 5920000]},
             "properties": {"__change__": "INSERT", "id": 2}}
        ]}"#,
    );

    let result = h.pipeline.sync_dataset(&dataset(1)).await;
    assert_eq!(result.status, SyncStatus::Success);
    assert_eq!(result.record_count, 2);

    let applied = h.sink.applied.lock().unwrap().get(&1).cloned().unwrap();
    assert!(applied[0].geometry.is_none());
    assert_eq!(applied[1].geometry.as_ref().unwrap().wkt, "POINT(1750000 5920000)");
}

#[tokio::test]
async fn test_database_failure_keeps_watermark() {
    let sink = RecordingSink {
        failing: vec![1],
        ..Default::default()
    };
    let h = harness_with(MemoryWatermarks::default(), sink);
    h.source.respond(1, 200, TWO_FEATURES);

    let result = h.pipeline.sync_dataset(&dataset(1)).await;
    assert_eq!(result.status.label(), "DatabaseError");
    assert_eq!(result.new_watermark, None);
    assert!(h.watermarks.runs_for(1).iter().all(|r| !r.success));
}

#[tokio::test]
async fn test_unavailable_store_fails_without_fetching() {
    let watermarks = MemoryWatermarks {
        unavailable: true,
        ..Default::default()
    };
    let h = harness_with(watermarks, RecordingSink::default());
    h.source.respond(1, 200, TWO_FEATURES);

    let result = h.pipeline.sync_dataset(&dataset(1)).await;
    assert!(matches!(result.status, SyncStatus::Failed(SyncError::StoreUnavailable(_))));
    assert!(result.window.is_none());
    assert_eq!(h.source.fetch_count(1), 0);
    assert!(h.watermarks.runs_for(1).is_empty());
}

#[tokio::test]
async fn test_missing_api_key_is_store_unavailable() {
    let h = harness();
    let descriptor =
        DatasetDescriptor::new(5, 404, 1, "layer", "layer_5", "id", "public").unwrap();

    let result = h.pipeline.sync_dataset(&descriptor).await;
    assert_eq!(result.status.label(), "StoreUnavailable");
    assert_eq!(h.source.fetch_count(5), 0);
}

#[tokio::test]
async fn test_batch_isolates_failures() {
    let sink = RecordingSink {
        failing: vec![3],
        ..Default::default()
    };
    let h = harness_with(MemoryWatermarks::default(), sink);
    h.source.respond(1, 200, TWO_FEATURES);
    h.source.respond(2, 503, "Service Unavailable");
    h.source.respond(3, 200, TWO_FEATURES);
    h.source.respond(4, 204, "");

    let options = BatchOptions {
        max_workers: 2,
        retry_attempts: 0,
        retry_delay: Duration::from_millis(1),
    };
    let report = h
        .pipeline
        .run_batch(vec![dataset(4), dataset(3), dataset(2), dataset(1)], &options)
        .await;

    assert_eq!(report.datasets_attempted, 4);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.no_data, 1);
    assert_eq!(report.failed, 2);
    assert_eq!(report.records_applied, 2);
    let failed_ids: Vec<i64> = report.failures.iter().map(|(id, _)| *id).collect();
    assert_eq!(failed_ids, vec![2, 3]);
    let ids: Vec<i64> = report.results.iter().map(|r| r.dataset_id).collect();
    assert_eq!(ids, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn test_batch_retries_source_errors_only() {
    let sink = RecordingSink {
        failing: vec![2],
        ..Default::default()
    };
    let h = harness_with(MemoryWatermarks::default(), sink);
    h.source.respond(1, 502, "Bad Gateway");
    h.source.respond(1, 200, TWO_FEATURES);
    h.source.respond(2, 200, TWO_FEATURES);

    let options = BatchOptions {
        max_workers: 4,
        retry_attempts: 2,
        retry_delay: Duration::from_millis(1),
    };
    let report = h
        .pipeline
        .run_batch(vec![dataset(1), dataset(2)], &options)
        .await;

    assert_eq!(report.succeeded, 1);
    assert_eq!(h.source.fetch_count(1), 2);
    // Database failures are not retried
    assert_eq!(h.source.fetch_count(2), 1);
    assert_eq!(report.results[1].status.label(), "DatabaseError");
}

#[tokio::test]
async fn test_concurrent_runs_of_one_dataset_are_serialized() {
    let h = Arc::new(harness());
    h.source.respond(1, 200, TWO_FEATURES);

    let first = dataset(1);
    let second = dataset(1);
    let (a, b) = tokio::join!(
        h.pipeline.sync_dataset(&first),
        h.pipeline.sync_dataset(&second)
    );
    let mut windows = vec![a.window.unwrap(), b.window.unwrap()];
    windows.sort_by_key(|w| w.from);

    // The second run starts where the first ended instead of both starting at the epoch
    assert_eq!(windows[0].from, epoch());
    assert_eq!(windows[1].from, windows[0].to);
}
