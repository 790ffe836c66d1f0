// ABOUTME: Changeset decoding: payload parsing, geometry reconstruction and value coercion
// ABOUTME: Turns a raw service payload into ordered, typed change records

pub mod coerce;
pub mod geometry;
pub mod model;
pub mod parser;
pub mod reproject;

pub use coerce::coerce;
pub use geometry::{GeometryElement, GeometryKind, GeometryNormalizer, GeometryValue};
pub use model::{ChangeKind, ChangeRecord, PayloadFormat, RawFeature, RawValue};
pub use parser::parse;
pub use reproject::TransverseMercator;

/// Turn parsed features into change records.
///
/// Geometry failures are local to their record: the record is kept with no
/// geometry and the failure is logged. Attribute values go through
/// [`coerce`].
pub fn enrich(features: Vec<RawFeature>, normalizer: &GeometryNormalizer) -> Vec<ChangeRecord> {
    features
        .into_iter()
        .map(|feature| {
            let geometry = match &feature.geometry {
                Some(element) => match normalizer.normalize(element) {
                    Ok(value) => Some(value),
                    Err(e) => {
                        tracing::warn!(
                            "Record {} keeps no geometry: {}",
                            feature.ordinal,
                            e
                        );
                        None
                    }
                },
                None => None,
            };

            let attributes = feature
                .fields
                .into_iter()
                .map(|(name, raw)| {
                    let value = coerce(raw.as_deref());
                    (name, value)
                })
                .collect();

            ChangeRecord {
                ordinal: feature.ordinal,
                change_kind: feature.change_kind,
                attributes,
                geometry,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enrich_keeps_record_when_geometry_fails() {
        let features = vec![RawFeature {
            ordinal: 0,
            change_kind: ChangeKind::Update,
            fields: vec![
                ("id".to_string(), Some("42".to_string())),
                ("name".to_string(), Some("Queen St".to_string())),
                ("width".to_string(), None),
            ],
            geometry: Some(GeometryElement::new("Curve")),
        }];

        let records = enrich(features, &GeometryNormalizer::nztm());
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert!(record.geometry.is_none());
        assert_eq!(record.attributes.get("id"), Some(&RawValue::Integer(42)));
        assert_eq!(
            record.attributes.get("name"),
            Some(&RawValue::Text("Queen St".to_string()))
        );
        assert_eq!(record.attributes.get("width"), Some(&RawValue::Null));
    }
}
