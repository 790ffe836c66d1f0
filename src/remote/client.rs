// ABOUTME: HTTP client for the WFS changeset service
// ABOUTME: Performs one GET per run and hands back status and body without retrying

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

use super::models::{build_changeset_url, FetchResponse};
use crate::changeset::PayloadFormat;
use crate::registry::DatasetDescriptor;
use crate::utils::redact_api_key;
use crate::watermark::SyncWindow;

/// Anything that can deliver a changeset payload for a dataset and window.
#[async_trait]
pub trait ChangesetSource: Send + Sync {
    /// Fetch the changeset. Non-200 statuses are returned, not raised;
    /// only transport failures (including timeouts) are errors.
    async fn fetch(
        &self,
        descriptor: &DatasetDescriptor,
        window: &SyncWindow,
        api_key: &str,
    ) -> Result<FetchResponse>;

    /// Format requested from the service, used as the parser's hint.
    fn format(&self) -> PayloadFormat;
}

pub struct ChangesetClient {
    client: Client,
    base_url: String,
    format: PayloadFormat,
}

impl ChangesetClient {
    pub fn new(base_url: &str, format: PayloadFormat, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            format,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl ChangesetSource for ChangesetClient {
    async fn fetch(
        &self,
        descriptor: &DatasetDescriptor,
        window: &SyncWindow,
        api_key: &str,
    ) -> Result<FetchResponse> {
        let url = build_changeset_url(&self.base_url, api_key, descriptor, window, self.format)?;
        let redacted = redact_api_key(url.as_str());
        tracing::debug!("GET {}", redacted);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(reqwest::Error::without_url)
            .with_context(|| format!("Changeset request failed: {}", redacted))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(reqwest::Error::without_url)
            .with_context(|| format!("Failed to read changeset response body (HTTP {})", status))?;

        tracing::debug!(
            "Changeset for {} answered HTTP {} ({} bytes)",
            descriptor,
            status,
            body.len()
        );
        Ok(FetchResponse { status, body })
    }

    fn format(&self) -> PayloadFormat {
        self.format
    }
}
