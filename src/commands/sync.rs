// ABOUTME: sync command - runs the changeset pipeline for registered datasets
// ABOUTME: Prints a per-dataset summary and fails when any dataset failed

use anyhow::{Context, Result};
use std::sync::Arc;

use super::{connect_metadata, resolve_url, watermark_store};
use crate::changeset::{GeometryNormalizer, TransverseMercator};
use crate::config::Config;
use crate::materialize::PostgresMaterializer;
use crate::pipeline::{BatchOptions, BatchReport, Pipeline, PipelineContext, SyncStatus};
use crate::registry::{DatasetRegistry, MetadataStore};
use crate::remote::ChangesetClient;
use crate::watermark::WatermarkTracker;

pub struct SyncOptions {
    /// Restrict the run to these dataset ids (empty = all registered)
    pub datasets: Vec<i64>,
    pub workers: Option<usize>,
    pub metadata_url: Option<String>,
    pub target_url: Option<String>,
}

pub async fn sync(config: &Config, opts: SyncOptions) -> Result<()> {
    let metadata_url = resolve_url(opts.metadata_url, &config.metadata.url, "metadata")?;
    let target_url = resolve_url(opts.target_url, &config.target.url, "target")?;
    crate::utils::validate_connection_string(&target_url).context("Invalid target database URL")?;

    let metadata_client = connect_metadata(&metadata_url, config.metadata_statement_timeout()).await?;
    let metadata = Arc::new(MetadataStore::new(
        Arc::clone(&metadata_client),
        &config.target.default_schema,
    ));

    let descriptors = if opts.datasets.is_empty() {
        metadata.list_datasets().await?
    } else {
        metadata.get_datasets(&opts.datasets).await?
    };
    if descriptors.is_empty() {
        println!("No datasets registered, nothing to do.");
        return Ok(());
    }

    let tracker = WatermarkTracker::new(
        watermark_store(config, Some(metadata_client))?,
        config.sync.epoch,
    );
    let source = ChangesetClient::new(
        &config.source.base_url,
        config.source.output_format,
        config.request_timeout(),
    )?;

    let pipeline = Pipeline::new(PipelineContext {
        watermarks: tracker,
        credentials: metadata,
        source: Arc::new(source),
        sink: Arc::new(PostgresMaterializer::new(&target_url, &config.target)),
        normalizer: GeometryNormalizer::new(TransverseMercator::nztm2000()),
    });

    let options = BatchOptions {
        max_workers: opts.workers.unwrap_or(config.sync.max_workers),
        retry_attempts: config.sync.retry_attempts,
        retry_delay: config.retry_delay(),
    };
    let report = pipeline.run_batch(descriptors, &options).await;
    print_report(&report);

    if !report.is_success() {
        anyhow::bail!(
            "{} of {} datasets failed to sync",
            report.failed,
            report.datasets_attempted
        );
    }
    Ok(())
}

fn print_report(report: &BatchReport) {
    println!();
    println!("Sync summary ({} ms)", report.duration_ms);
    println!("{}", "=".repeat(60));
    for result in &report.results {
        let window = result
            .window
            .map(|w| w.to_string())
            .unwrap_or_else(|| "-".to_string());
        match &result.status {
            SyncStatus::Success => println!(
                "  ✓ dataset {:<8} {:>8} records  {}",
                result.dataset_id, result.record_count, window
            ),
            SyncStatus::NoData => println!(
                "  - dataset {:<8} {:>8}          {}",
                result.dataset_id, "no data", window
            ),
            SyncStatus::Failed(e) => println!(
                "  ✗ dataset {:<8} {}: {}",
                result.dataset_id,
                e.kind(),
                e
            ),
        }
    }
    println!("{}", "=".repeat(60));
    println!(
        "  {} succeeded, {} no data, {} failed, {} records applied",
        report.succeeded, report.no_data, report.failed, report.records_applied
    );
}
