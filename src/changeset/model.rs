// ABOUTME: Data model for decoded changesets: raw features, typed values and change records
// ABOUTME: Records keep their source ordinal so replay order is deterministic

use anyhow::bail;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use super::geometry::{GeometryElement, GeometryValue};

/// Attribute value after type coercion.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Null,
    Integer(i64),
    Float(f64),
    Timestamp(DateTime<Utc>),
    Text(String),
}

impl RawValue {
    pub fn is_null(&self) -> bool {
        matches!(self, RawValue::Null)
    }

    /// Canonical text form, used for key comparison and display. `None` for nulls.
    pub fn as_key(&self) -> Option<String> {
        match self {
            RawValue::Null => None,
            RawValue::Integer(i) => Some(i.to_string()),
            RawValue::Float(f) => Some(f.to_string()),
            RawValue::Timestamp(ts) => Some(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            RawValue::Text(s) => Some(s.clone()),
        }
    }
}

impl fmt::Display for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawValue::Null => write!(f, "NULL"),
            RawValue::Text(s) => write!(f, "{:?}", s),
            other => write!(f, "{}", other.as_key().unwrap_or_default()),
        }
    }
}

/// Change indicator carried by every changeset feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    /// Value stored in the staging table's change column.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
        }
    }
}

impl FromStr for ChangeKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INSERT" => Ok(ChangeKind::Insert),
            "UPDATE" => Ok(ChangeKind::Update),
            "DELETE" => Ok(ChangeKind::Delete),
            other => bail!("unknown change indicator '{}'", other),
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A feature as decoded from the payload, before geometry reconstruction
/// and type coercion.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFeature {
    /// Position in the payload, starting at 0
    pub ordinal: usize,
    pub change_kind: ChangeKind,
    /// Attribute fields in source order; `None` for null or empty values
    pub fields: Vec<(String, Option<String>)>,
    pub geometry: Option<GeometryElement>,
}

/// A fully decoded change: typed attributes plus canonical geometry.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    pub ordinal: usize,
    pub change_kind: ChangeKind,
    pub attributes: BTreeMap<String, RawValue>,
    pub geometry: Option<GeometryValue>,
}

impl ChangeRecord {
    /// Key value of this record, if the key column is present and not null.
    pub fn key(&self, id_column: &str) -> Option<String> {
        self.attributes.get(id_column).and_then(RawValue::as_key)
    }
}

/// Encoding requested from, and expected back from, the changeset service.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    #[default]
    Json,
    Gml,
}

impl PayloadFormat {
    /// `outputFormat` query value understood by the WFS endpoint.
    pub fn output_format_param(&self) -> &'static str {
        match self {
            PayloadFormat::Json => "json",
            PayloadFormat::Gml => "application/gml+xml; version=3.2",
        }
    }

    /// Guess the format from the first non-whitespace character.
    pub fn sniff(payload: &str) -> Option<Self> {
        match payload.trim_start_matches('\u{feff}').trim_start().chars().next() {
            Some('{') | Some('[') => Some(PayloadFormat::Json),
            Some('<') => Some(PayloadFormat::Gml),
            _ => None,
        }
    }
}
