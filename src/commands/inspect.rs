// ABOUTME: inspect command - decodes a saved changeset payload offline
// ABOUTME: Runs parsing, geometry normalization and coercion and prints the records

use anyhow::{Context, Result};
use std::path::Path;

use crate::changeset::{enrich, parse, ChangeKind, ChangeRecord, GeometryNormalizer, PayloadFormat};

const WKT_PREVIEW: usize = 72;

pub async fn inspect(path: &Path, format: Option<PayloadFormat>) -> Result<()> {
    let payload = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read payload {:?}", path))?;

    let features = parse(&payload, format)?;
    let records = enrich(features, &GeometryNormalizer::nztm());

    for record in &records {
        print_record(record);
    }

    let count = |kind: ChangeKind| records.iter().filter(|r| r.change_kind == kind).count();
    println!(
        "{} records: {} inserts, {} updates, {} deletes, {} with geometry",
        records.len(),
        count(ChangeKind::Insert),
        count(ChangeKind::Update),
        count(ChangeKind::Delete),
        records.iter().filter(|r| r.geometry.is_some()).count()
    );
    Ok(())
}

fn print_record(record: &ChangeRecord) {
    println!("#{} {}", record.ordinal, record.change_kind);
    for (name, value) in &record.attributes {
        println!("    {} = {}", name, value);
    }
    if let Some(geometry) = &record.geometry {
        let preview: String = geometry.wkt.chars().take(WKT_PREVIEW).collect();
        let ellipsis = if geometry.wkt.chars().count() > WKT_PREVIEW { "..." } else { "" };
        println!(
            "    geometry = {} (SRID {}) {}{}",
            geometry.kind, geometry.srid, preview, ellipsis
        );
    }
}
