// ABOUTME: Request and response shapes for the WFS changeset endpoint
// ABOUTME: Builds the GetFeature URL with the changeset window encoded in viewparams

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use url::Url;

use crate::changeset::PayloadFormat;
use crate::registry::DatasetDescriptor;
use crate::watermark::SyncWindow;

/// Timestamp layout the service expects inside `viewparams`.
pub const WINDOW_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

pub fn format_window_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(WINDOW_TIMESTAMP_FORMAT).to_string()
}

/// Build the GetFeature URL for a dataset's changeset over `window`.
///
/// Layout: `{base}/services;key={key}/wfs/{type}-{item}-changeset?SERVICE=WFS&...`
pub fn build_changeset_url(
    base_url: &str,
    api_key: &str,
    descriptor: &DatasetDescriptor,
    window: &SyncWindow,
    format: PayloadFormat,
) -> Result<Url> {
    let mut url =
        Url::parse(base_url).with_context(|| format!("Invalid service base URL '{}'", base_url))?;
    let type_name = descriptor.changeset_type_name();

    url.path_segments_mut()
        .map_err(|_| anyhow!("Service base URL '{}' cannot carry a path", base_url))?
        .pop_if_empty()
        .push(&format!("services;key={}", api_key))
        .push("wfs")
        .push(&type_name);

    url.query_pairs_mut()
        .clear()
        .append_pair("SERVICE", "WFS")
        .append_pair("VERSION", "2.0.0")
        .append_pair("REQUEST", "GetFeature")
        .append_pair("typeNames", &type_name)
        .append_pair(
            "viewparams",
            &format!(
                "from:{};to:{}",
                format_window_timestamp(&window.from),
                format_window_timestamp(&window.to)
            ),
        )
        .append_pair("outputFormat", format.output_format_param());

    Ok(url)
}

/// Status and body of a changeset request, returned verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub status: u16,
    pub body: String,
}

impl FetchResponse {
    pub fn is_success(&self) -> bool {
        self.status == 200
    }

    /// The service answers "nothing for this window" with 204 or 404.
    pub fn is_no_data(&self) -> bool {
        matches!(self.status, 204 | 404)
    }

    /// Leading part of the body for error messages.
    pub fn body_excerpt(&self) -> String {
        const LIMIT: usize = 200;
        let trimmed = self.body.trim();
        match trimmed.char_indices().nth(LIMIT) {
            Some((idx, _)) => format!("{}...", &trimmed[..idx]),
            None => trimmed.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn descriptor() -> DatasetDescriptor {
        DatasetDescriptor::new(1, 9, 50772, "layer", "nz_parcels", "id", "public").unwrap()
    }

    fn window() -> SyncWindow {
        SyncWindow::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 2, 1, 6, 30, 15).unwrap(),
        )
    }

    #[test]
    fn test_timestamp_format() {
        let ts = Utc.with_ymd_and_hms(2024, 2, 1, 6, 30, 15).unwrap();
        assert_eq!(format_window_timestamp(&ts), "2024-02-01T06:30:15.000000Z");
    }

    #[test]
    fn test_changeset_url_layout() {
        let url = build_changeset_url(
            "https://data.linz.govt.nz",
            "abc123",
            &descriptor(),
            &window(),
            PayloadFormat::Json,
        )
        .unwrap();

        assert_eq!(
            url.path(),
            "/services;key=abc123/wfs/layer-50772-changeset"
        );

        let query: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(
            query,
            vec![
                ("SERVICE".into(), "WFS".into()),
                ("VERSION".into(), "2.0.0".into()),
                ("REQUEST".into(), "GetFeature".into()),
                ("typeNames".into(), "layer-50772-changeset".into()),
                (
                    "viewparams".into(),
                    "from:2024-01-01T00:00:00.000000Z;to:2024-02-01T06:30:15.000000Z".into()
                ),
                ("outputFormat".into(), "json".into()),
            ]
        );
    }

    #[test]
    fn test_changeset_url_keeps_base_path() {
        let url = build_changeset_url(
            "http://localhost:8080/proxy/",
            "k",
            &descriptor(),
            &window(),
            PayloadFormat::Gml,
        )
        .unwrap();
        assert_eq!(url.path(), "/proxy/services;key=k/wfs/layer-50772-changeset");
        assert!(url
            .query_pairs()
            .any(|(k, v)| k == "outputFormat" && v == "application/gml+xml; version=3.2"));
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(build_changeset_url("not a url", "k", &descriptor(), &window(), PayloadFormat::Json).is_err());
    }

    #[test]
    fn test_response_classification() {
        let ok = FetchResponse { status: 200, body: String::new() };
        assert!(ok.is_success());
        assert!(FetchResponse { status: 204, body: String::new() }.is_no_data());
        assert!(FetchResponse { status: 404, body: String::new() }.is_no_data());
        let err = FetchResponse { status: 500, body: "x".repeat(500) };
        assert!(!err.is_success() && !err.is_no_data());
        assert_eq!(err.body_excerpt().len(), 203);
    }
}
