// ABOUTME: Command implementations behind the CLI
// ABOUTME: Exports sync, window and inspect plus the wiring of concrete collaborators

pub mod inspect;
pub mod sync;
pub mod window;

pub use inspect::inspect;
pub use sync::sync;
pub use window::window;

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::Client;

use crate::config::Config;
use crate::postgres::connection::set_statement_timeout;
use crate::postgres::connect_with_retry;
use crate::utils::sanitize_database_url;
use crate::watermark::{FileWatermarkStore, PostgresWatermarkStore, WatermarkStore};

/// Resolve a connection URL from the CLI/env value or the config file.
pub(crate) fn resolve_url(cli: Option<String>, configured: &Option<String>, what: &str) -> Result<String> {
    cli.or_else(|| configured.clone()).with_context(|| {
        format!(
            "No {} database URL. Pass it on the command line, set the environment variable or add it to the config file",
            what
        )
    })
}

/// Connect to the metadata database with every statement bounded by
/// `statement_timeout`.
pub(crate) async fn connect_metadata(url: &str, statement_timeout: Duration) -> Result<Arc<Client>> {
    tracing::info!("Connecting to metadata database {}", sanitize_database_url(url));
    let client = connect_with_retry(url)
        .await
        .context("Failed to connect to metadata database")?;
    set_statement_timeout(&client, statement_timeout)
        .await
        .context("Failed to configure metadata session")?;
    Ok(Arc::new(client))
}

/// The configured watermark store: the JSON state file when set, otherwise
/// the metadata database.
pub(crate) fn watermark_store(config: &Config, metadata: Option<Arc<Client>>) -> Result<Arc<dyn WatermarkStore>> {
    match (&config.sync.state_file, metadata) {
        (Some(path), _) => {
            tracing::info!("Tracking watermarks in {:?}", path);
            Ok(Arc::new(FileWatermarkStore::new(path.clone())))
        }
        (None, Some(client)) => Ok(Arc::new(PostgresWatermarkStore::new(client))),
        (None, None) => anyhow::bail!("No watermark store: configure [sync] state_file or a metadata database"),
    }
}
