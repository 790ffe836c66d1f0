// ABOUTME: WatermarkStore backed by the metadata database's dataset_updates table
// ABOUTME: One row per run; the watermark is the latest start_time of a successful run

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_postgres::Client;

use super::{RunRecord, WatermarkStore};

/// Run history in `public.dataset_updates (dataset_id, start_time, success)`.
pub struct PostgresWatermarkStore {
    client: Arc<Client>,
}

impl PostgresWatermarkStore {
    pub fn new(client: Arc<Client>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WatermarkStore for PostgresWatermarkStore {
    async fn latest_success(&self, dataset_id: i64) -> Result<Option<DateTime<Utc>>> {
        let row = self
            .client
            .query_one(
                "SELECT max(start_time)::timestamptz \
                 FROM public.dataset_updates \
                 WHERE success AND dataset_id = $1::bigint",
                &[&dataset_id],
            )
            .await
            .with_context(|| format!("Failed to read watermark for dataset {}", dataset_id))?;

        Ok(row.get::<_, Option<DateTime<Utc>>>(0))
    }

    async fn record_run(&self, record: &RunRecord) -> Result<()> {
        self.client
            .execute(
                "INSERT INTO public.dataset_updates (dataset_id, start_time, success) \
                 VALUES ($1::bigint, $2::timestamptz, $3)",
                &[&record.dataset_id, &record.start_time, &record.success],
            )
            .await
            .with_context(|| {
                format!(
                    "Failed to record {} run for dataset {}",
                    record.status, record.dataset_id
                )
            })?;

        tracing::debug!(
            "Recorded run for dataset {}: status={}, start_time={}",
            record.dataset_id,
            record.status,
            record.start_time
        );
        Ok(())
    }
}
