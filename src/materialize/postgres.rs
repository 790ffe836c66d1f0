// ABOUTME: PostgreSQL/PostGIS materializer - stages a changeset and applies it in one transaction
// ABOUTME: Each run uses its own session so the temporary staging table is never shared

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, Transaction};

use super::staging::{
    delete_sql, dedupe_latest, ensure_target_geometry_sql, insert_target_sql, target_column_type,
    StagingPlan, TargetColumns,
};
use super::{ChangesetSink, MaterializeReport, MaterializeState, StateTracker};
use crate::changeset::ChangeRecord;
use crate::config::TargetConfig;
use crate::error::SyncError;
use crate::postgres::connection::{connect, set_statement_timeout};
use crate::registry::DatasetDescriptor;

/// Applies changesets to tables in the target database.
pub struct PostgresMaterializer {
    target_url: String,
    geometry_column: String,
    srid: i32,
    statement_timeout: Duration,
}

impl PostgresMaterializer {
    pub fn new(target_url: &str, target: &TargetConfig) -> Self {
        Self {
            target_url: target_url.to_string(),
            geometry_column: target.geometry_column.clone(),
            srid: target.srid,
            statement_timeout: Duration::from_secs(target.statement_timeout_secs),
        }
    }

    async fn run(
        &self,
        client: &mut Client,
        descriptor: &DatasetDescriptor,
        plan: &StagingPlan,
        records: &[&ChangeRecord],
        tracker: &mut StateTracker,
    ) -> Result<MaterializeReport> {
        let staged = stage_records(client, plan, records).await?;
        tracker.advance(MaterializeState::Staged);

        ensure_staging_geometry(client, plan).await?;
        tracker.advance(MaterializeState::GeomColumnEnsured);

        let target =
            get_table_columns(client, &descriptor.target_schema, &descriptor.target_table).await?;
        if target.is_empty() {
            anyhow::bail!("Target table {} does not exist", descriptor.qualified_table());
        }

        let tx = client
            .transaction()
            .await
            .context("Failed to open transaction")?;

        match apply_changes(&tx, descriptor, plan, &target, tracker).await {
            Ok((deleted, inserted)) => {
                tx.commit()
                    .await
                    .with_context(|| format!("Failed to commit changes to {}", descriptor.qualified_table()))?;
                tracker.advance(MaterializeState::Committed);
                Ok(MaterializeReport {
                    staged,
                    deleted,
                    inserted,
                })
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(
                        "Rollback for dataset {} failed: {}",
                        descriptor.dataset_id,
                        rollback_err
                    );
                }
                tracker.advance(MaterializeState::RolledBack);
                Err(e)
            }
        }
    }
}

#[async_trait]
impl ChangesetSink for PostgresMaterializer {
    async fn apply(
        &self,
        descriptor: &DatasetDescriptor,
        records: &[ChangeRecord],
    ) -> Result<MaterializeReport, SyncError> {
        let mut client = connect(&self.target_url)
            .await
            .map_err(|e| SyncError::database(&e))?;
        set_statement_timeout(&client, self.statement_timeout)
            .await
            .map_err(|e| SyncError::database(&e))?;

        let unique = dedupe_latest(records, &descriptor.id_column);
        if unique.len() < records.len() {
            tracing::info!(
                "Dataset {}: {} records collapse to {} after keeping the latest change per key",
                descriptor.dataset_id,
                records.len(),
                unique.len()
            );
        }

        let plan = StagingPlan::build(
            &staging_table_name(&descriptor.target_table),
            &unique,
            &self.geometry_column,
            self.srid,
        );

        let mut tracker = StateTracker::new(descriptor.dataset_id);
        let result = self
            .run(&mut client, descriptor, &plan, &unique, &mut tracker)
            .await;
        if result.is_err() && !tracker.state().is_terminal() {
            tracker.advance(MaterializeState::RolledBack);
        }

        // Best effort: the session ends right after, which drops the table anyway
        if let Err(e) = client.batch_execute(&plan.drop_sql()).await {
            tracing::warn!("Failed to drop staging table {}: {}", plan.table, e);
        }

        let report = result.map_err(|e| SyncError::database(&e))?;
        tracing::info!(
            "Applied {} staged rows to {}: {} deleted, {} inserted",
            report.staged,
            descriptor.qualified_table(),
            report.deleted,
            report.inserted
        );
        Ok(report)
    }
}

/// Unique per-run staging table name, within the 63 character limit.
fn staging_table_name(table: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let base: String = table.chars().take(40).collect();
    format!("_changeset_{}_{}", base, &suffix[..8])
}

async fn stage_records(
    client: &Client,
    plan: &StagingPlan,
    records: &[&ChangeRecord],
) -> Result<u64> {
    client
        .batch_execute(&plan.create_sql())
        .await
        .with_context(|| format!("Failed to create staging table {}", plan.table))?;

    let mut staged = 0u64;
    for chunk in records.chunks(plan.batch_size()) {
        let rows: Vec<Vec<Box<dyn ToSql + Sync + Send>>> =
            chunk.iter().map(|record| plan.row_params(record)).collect();
        let params: Vec<&(dyn ToSql + Sync)> = rows
            .iter()
            .flat_map(|row| row.iter().map(|v| v.as_ref() as &(dyn ToSql + Sync)))
            .collect();

        staged += client
            .execute(&plan.insert_sql(chunk.len()), &params)
            .await
            .with_context(|| format!("Failed to stage batch into {}", plan.table))?;
        tracing::debug!("Staged batch of {} rows into {}", chunk.len(), plan.table);
    }

    Ok(staged)
}

async fn ensure_staging_geometry(client: &Client, plan: &StagingPlan) -> Result<()> {
    let (Some(add), Some(populate)) = (plan.add_geometry_sql(), plan.populate_geometry_sql())
    else {
        tracing::debug!("No geometry in {}, staging without a geometry column", plan.table);
        return Ok(());
    };

    client
        .batch_execute(&add)
        .await
        .with_context(|| format!("Failed to add geometry column to {}", plan.table))?;
    client
        .execute(&populate, &[])
        .await
        .with_context(|| format!("Failed to convert staged WKT in {}", plan.table))?;
    Ok(())
}

async fn apply_changes(
    tx: &Transaction<'_>,
    descriptor: &DatasetDescriptor,
    plan: &StagingPlan,
    target: &TargetColumns,
    tracker: &mut StateTracker,
) -> Result<(u64, u64)> {
    let schema = &descriptor.target_schema;
    let table = &descriptor.target_table;

    if target_column_type(target, &plan.geometry_column).is_none() {
        if let Some(sql) = ensure_target_geometry_sql(schema, table, plan) {
            tx.batch_execute(&sql).await.with_context(|| {
                format!("Failed to add geometry column to {}", descriptor.qualified_table())
            })?;
            tracing::info!(
                "Added geometry column {} to {}",
                plan.geometry_column,
                descriptor.qualified_table()
            );
        }
    }

    let deleted = if plan.has_column(&descriptor.id_column) {
        let id_type = target_column_type(target, &descriptor.id_column).with_context(|| {
            format!(
                "Target table {} has no key column '{}'",
                descriptor.qualified_table(),
                descriptor.id_column
            )
        })?;
        let sql = delete_sql(schema, table, &descriptor.id_column, id_type, plan);
        tx.execute(&sql, &[])
            .await
            .with_context(|| format!("Failed to delete replaced rows from {}", descriptor.qualified_table()))?
    } else {
        tracing::warn!(
            "Dataset {}: no record carries key column '{}', nothing to delete",
            descriptor.dataset_id,
            descriptor.id_column
        );
        0
    };
    tracker.advance(MaterializeState::OldRowsDeleted);

    let inserted = match insert_target_sql(schema, table, plan, target) {
        Some(sql) => tx
            .execute(&sql, &[])
            .await
            .with_context(|| format!("Failed to insert rows into {}", descriptor.qualified_table()))?,
        None => 0,
    };
    tracker.advance(MaterializeState::NewRowsInserted);

    Ok((deleted, inserted))
}

/// Column names and formatted types of a table, in column order.
///
/// Empty when the table does not exist.
pub async fn get_table_columns(
    client: &Client,
    schema: &str,
    table: &str,
) -> Result<TargetColumns> {
    let rows = client
        .query(
            "SELECT a.attname::text, format_type(a.atttypid, a.atttypmod)
             FROM pg_attribute a
             JOIN pg_class c ON c.oid = a.attrelid
             JOIN pg_namespace n ON n.oid = c.relnamespace
             WHERE n.nspname = $1 AND c.relname = $2
               AND a.attnum > 0 AND NOT a.attisdropped
             ORDER BY a.attnum",
            &[&schema, &table],
        )
        .await
        .with_context(|| format!("Failed to get columns for {}.{}", schema, table))?;

    Ok(rows
        .iter()
        .map(|row| {
            let name: String = row.get(0);
            let dtype: String = row.get(1);
            (name, dtype)
        })
        .collect())
}
