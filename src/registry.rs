// ABOUTME: Dataset registry and credential lookups against the metadata database
// ABOUTME: Produces validated DatasetDescriptors and resolves API keys by source id

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio_postgres::{Client, Row};

use crate::utils::{split_qualified_table, validate_postgres_identifier};

/// Everything a run needs to know about one dataset. Immutable per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetDescriptor {
    pub dataset_id: i64,
    /// Credential reference; the API key is looked up by this id
    pub source_id: i64,
    pub item_no: i64,
    /// Dataset type code, e.g. "layer" or "table"
    pub dataset_type_code: String,
    pub target_schema: String,
    pub target_table: String,
    /// Key column used to match changes against target rows
    pub id_column: String,
}

impl DatasetDescriptor {
    /// Build a descriptor, validating every identifier that ends up in SQL.
    ///
    /// `table_name` may be schema-qualified; otherwise `default_schema` is used.
    pub fn new(
        dataset_id: i64,
        source_id: i64,
        item_no: i64,
        dataset_type_code: &str,
        table_name: &str,
        id_column: &str,
        default_schema: &str,
    ) -> Result<Self> {
        let (target_schema, target_table) = split_qualified_table(table_name, default_schema)
            .with_context(|| format!("Invalid target table for dataset {}", dataset_id))?;
        validate_postgres_identifier(id_column)
            .with_context(|| format!("Invalid id column for dataset {}", dataset_id))?;

        let dataset_type_code = dataset_type_code.trim();
        if dataset_type_code.is_empty()
            || !dataset_type_code
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            anyhow::bail!(
                "Invalid dataset type code '{}' for dataset {}",
                dataset_type_code,
                dataset_id
            );
        }

        Ok(Self {
            dataset_id,
            source_id,
            item_no,
            dataset_type_code: dataset_type_code.to_string(),
            target_schema,
            target_table,
            id_column: id_column.trim().to_string(),
        })
    }

    /// Changeset resource name on the service, e.g. `layer-50772-changeset`.
    pub fn changeset_type_name(&self) -> String {
        format!("{}-{}-changeset", self.dataset_type_code, self.item_no)
    }

    pub fn qualified_table(&self) -> String {
        format!("{}.{}", self.target_schema, self.target_table)
    }
}

impl fmt::Display for DatasetDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dataset {} ({}-{} -> {})",
            self.dataset_id,
            self.dataset_type_code,
            self.item_no,
            self.qualified_table()
        )
    }
}

/// Source of dataset descriptors.
#[async_trait]
pub trait DatasetRegistry: Send + Sync {
    /// All registered datasets, ordered by id.
    async fn list_datasets(&self) -> Result<Vec<DatasetDescriptor>>;

    /// Only the given datasets. Unknown ids are an error.
    async fn get_datasets(&self, dataset_ids: &[i64]) -> Result<Vec<DatasetDescriptor>> {
        let all = self.list_datasets().await?;
        let mut selected = Vec::with_capacity(dataset_ids.len());
        for id in dataset_ids {
            let descriptor = all
                .iter()
                .find(|d| d.dataset_id == *id)
                .with_context(|| format!("Dataset {} is not registered", id))?;
            selected.push(descriptor.clone());
        }
        Ok(selected)
    }
}

/// API key lookup by source id.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get_api_key(&self, source_id: i64) -> Result<String>;
}

/// Registry and credential store over the metadata database
/// (`public.datasets`, `public.api_keys`).
pub struct MetadataStore {
    client: Arc<Client>,
    default_schema: String,
}

impl MetadataStore {
    pub fn new(client: Arc<Client>, default_schema: &str) -> Self {
        Self {
            client,
            default_schema: default_schema.to_string(),
        }
    }

    pub fn client(&self) -> Arc<Client> {
        Arc::clone(&self.client)
    }

    fn descriptor_from_row(&self, row: &Row) -> Result<DatasetDescriptor> {
        let dataset_id: i64 = row.get("dataset_id");
        let table_name: String = row.get("table_name");
        let id_column: String = row.get("id_column");
        let relation_type: String = row.get("relation_type");
        DatasetDescriptor::new(
            dataset_id,
            row.get("source_id"),
            row.get("item_no"),
            &relation_type,
            &table_name,
            &id_column,
            &self.default_schema,
        )
    }
}

const DATASET_QUERY: &str = "SELECT dataset_id::bigint AS dataset_id, \
            item_no::bigint AS item_no, \
            source_id::bigint AS source_id, \
            relation_type::text AS relation_type, \
            table_name::text AS table_name, \
            id_column::text AS id_column \
     FROM public.datasets \
     ORDER BY dataset_id";

#[async_trait]
impl DatasetRegistry for MetadataStore {
    async fn list_datasets(&self) -> Result<Vec<DatasetDescriptor>> {
        let rows = self
            .client
            .query(DATASET_QUERY, &[])
            .await
            .context("Failed to query dataset registry")?;

        let mut datasets = Vec::with_capacity(rows.len());
        for row in &rows {
            match self.descriptor_from_row(row) {
                Ok(descriptor) => datasets.push(descriptor),
                Err(e) => tracing::warn!("Skipping invalid registry row: {:#}", e),
            }
        }

        tracing::info!("Loaded {} datasets from registry", datasets.len());
        Ok(datasets)
    }
}

#[async_trait]
impl CredentialStore for MetadataStore {
    async fn get_api_key(&self, source_id: i64) -> Result<String> {
        let row = self
            .client
            .query_opt(
                "SELECT api_key::text FROM public.api_keys WHERE source_id = $1::bigint",
                &[&source_id],
            )
            .await
            .with_context(|| format!("Failed to look up API key for source {}", source_id))?
            .with_context(|| format!("No API key registered for source {}", source_id))?;

        Ok(row.get(0))
    }
}
