// ABOUTME: TLS-aware PostgreSQL connections with retry and statement timeouts
// ABOUTME: The TLS policy is fixed once per process from the CLI flag

use anyhow::{Context, Result};
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use std::sync::OnceLock;
use std::time::Duration;
use tokio_postgres::Client;

use crate::utils::{retry_with_backoff, sanitize_database_url, validate_connection_string};

static ALLOW_SELF_SIGNED: OnceLock<bool> = OnceLock::new();

/// Fix the TLS certificate policy for every connection made by this process.
///
/// Only the first call has an effect.
pub fn init_tls_policy(allow_self_signed_certs: bool) {
    if ALLOW_SELF_SIGNED.set(allow_self_signed_certs).is_err() {
        tracing::debug!("TLS policy already initialized, ignoring new value");
    }
    if allow_self_signed_certs {
        tracing::warn!("Accepting self-signed TLS certificates (insecure)");
    }
}

fn allow_self_signed() -> bool {
    ALLOW_SELF_SIGNED.get().copied().unwrap_or(false)
}

/// Open a connection and spawn its driver task.
///
/// # Arguments
///
/// * `url` - PostgreSQL connection URL (validated before use)
///
/// # Errors
///
/// Fails if the URL is malformed, the TLS connector cannot be built or the
/// server cannot be reached.
pub async fn connect(url: &str) -> Result<Client> {
    validate_connection_string(url)?;

    let connector = TlsConnector::builder()
        .danger_accept_invalid_certs(allow_self_signed())
        .build()
        .context("Failed to build TLS connector")?;
    let tls = MakeTlsConnector::new(connector);

    let (client, connection) = tokio_postgres::connect(url, tls)
        .await
        .with_context(|| format!("Failed to connect to {}", sanitize_database_url(url)))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("PostgreSQL connection error: {}", e);
        }
    });

    Ok(client)
}

/// Connect with exponential backoff (3 retries starting at 1s).
pub async fn connect_with_retry(url: &str) -> Result<Client> {
    retry_with_backoff(
        || connect(url),
        3,
        Duration::from_secs(1),
        |_: &anyhow::Error| true,
    )
    .await
}

/// Bound every statement on this session by a server-side timeout.
///
/// A zero duration disables the limit.
pub async fn set_statement_timeout(client: &Client, timeout: Duration) -> Result<()> {
    let sql = format!("SET statement_timeout = {}", timeout.as_millis());
    client
        .batch_execute(&sql)
        .await
        .context("Failed to set statement_timeout")?;
    Ok(())
}
