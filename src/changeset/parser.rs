// ABOUTME: Decodes WFS changeset payloads (GeoJSON or GML) into ordered raw features
// ABOUTME: Geometry fields are kept as element trees for the normalizer; attributes stay untyped

use serde_json::{Map, Value};

use super::geometry::GeometryElement;
use super::model::{ChangeKind, PayloadFormat, RawFeature};
use crate::error::SyncError;

/// Field carrying the change indicator on every changeset feature.
pub const CHANGE_FIELD: &str = "__change__";

/// Field names whose content is geometry rather than an attribute.
pub const GEOMETRY_FIELDS: [&str; 2] = ["shape", "geometry"];

fn is_geometry_field(name: &str) -> bool {
    GEOMETRY_FIELDS
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(name))
}

/// Parse a changeset payload into features in source order.
///
/// The payload format is sniffed from its first character; `hint` is used
/// when sniffing is inconclusive.
///
/// # Errors
///
/// Returns [`SyncError::Parse`] when the payload cannot be decoded, the root
/// is not a feature collection, or a feature has no valid change indicator.
/// No partial feature list is ever returned.
pub fn parse(payload: &str, hint: Option<PayloadFormat>) -> Result<Vec<RawFeature>, SyncError> {
    let format = PayloadFormat::sniff(payload)
        .or(hint)
        .ok_or_else(|| SyncError::Parse("payload is neither JSON nor XML".to_string()))?;

    let features = match format {
        PayloadFormat::Json => parse_json(payload)?,
        PayloadFormat::Gml => parse_gml(payload)?,
    };

    tracing::debug!("Parsed {} features from {:?} payload", features.len(), format);
    Ok(features)
}

fn parse_json(payload: &str) -> Result<Vec<RawFeature>, SyncError> {
    let root: Value = serde_json::from_str(payload)
        .map_err(|e| SyncError::Parse(format!("invalid JSON payload: {}", e)))?;

    let features = match &root {
        Value::Object(map) => map
            .get("features")
            .and_then(Value::as_array)
            .ok_or_else(|| SyncError::Parse("JSON payload has no 'features' array".to_string()))?,
        Value::Array(items) => items,
        _ => {
            return Err(SyncError::Parse(
                "JSON payload is not a feature collection".to_string(),
            ))
        }
    };

    features
        .iter()
        .enumerate()
        .map(|(ordinal, feature)| json_feature(ordinal, feature))
        .collect()
}

fn json_feature(ordinal: usize, feature: &Value) -> Result<RawFeature, SyncError> {
    let object = feature
        .as_object()
        .ok_or_else(|| SyncError::Parse(format!("feature {} is not an object", ordinal)))?;

    let empty = Map::new();
    let properties = match object.get("properties") {
        Some(Value::Object(props)) => props,
        Some(Value::Null) | None => &empty,
        Some(_) => {
            return Err(SyncError::Parse(format!(
                "feature {} has non-object properties",
                ordinal
            )))
        }
    };

    let change_kind = properties
        .get(CHANGE_FIELD)
        .and_then(Value::as_str)
        .ok_or_else(|| missing_change(ordinal))?
        .parse::<ChangeKind>()
        .map_err(|e| SyncError::Parse(format!("feature {}: {}", ordinal, e)))?;

    let mut geometry = match object.get("geometry") {
        Some(Value::Null) | None => None,
        Some(value) => Some(geojson_element(value)),
    };

    let mut fields = Vec::with_capacity(properties.len());
    for (name, value) in properties {
        if name == CHANGE_FIELD {
            continue;
        }
        if is_geometry_field(name) {
            match value {
                Value::Null => {}
                Value::Object(_) if geometry.is_none() => {
                    geometry = Some(geojson_element(value));
                }
                Value::Object(_) => tracing::warn!(
                    "Feature {}: ignoring '{}' property, the feature already has a geometry",
                    ordinal,
                    name
                ),
                other => tracing::warn!(
                    "Feature {}: ignoring non-object '{}' property ({})",
                    ordinal,
                    name,
                    json_kind(other)
                ),
            }
            continue;
        }
        fields.push((name.clone(), json_scalar(value)));
    }

    Ok(RawFeature {
        ordinal,
        change_kind,
        fields,
        geometry,
    })
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Untyped string form of a JSON property; coercion assigns the real type.
fn json_scalar(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

/// Build the GML-shaped element tree for a GeoJSON geometry.
///
/// Unknown types and malformed coordinates produce an element the normalizer
/// rejects, so the failure stays local to the record.
fn geojson_element(geometry: &Value) -> GeometryElement {
    let kind = geometry
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("Unknown");
    let coordinates = geometry.get("coordinates").unwrap_or(&Value::Null);

    let built = match kind {
        "Point" => position(coordinates).map(|pos| {
            GeometryElement::with_children("Point", vec![GeometryElement::with_text("pos", pos)])
        }),
        "LineString" => geojson_line(coordinates),
        "Polygon" => geojson_polygon(coordinates),
        "MultiLineString" => coordinates.as_array().and_then(|lines| {
            lines
                .iter()
                .map(|line| {
                    geojson_line(line)
                        .map(|l| GeometryElement::with_children("curveMember", vec![l]))
                })
                .collect::<Option<Vec<_>>>()
                .map(|members| GeometryElement::with_children("MultiCurve", members))
        }),
        "MultiPolygon" => coordinates.as_array().and_then(|polygons| {
            polygons
                .iter()
                .map(|polygon| {
                    geojson_polygon(polygon)
                        .map(|p| GeometryElement::with_children("surfaceMember", vec![p]))
                })
                .collect::<Option<Vec<_>>>()
                .map(|members| GeometryElement::with_children("MultiSurface", members))
        }),
        _ => None,
    };

    built.unwrap_or_else(|| GeometryElement::new(kind))
}

fn geojson_line(coordinates: &Value) -> Option<GeometryElement> {
    pos_list(coordinates).map(|list| {
        GeometryElement::with_children("LineString", vec![GeometryElement::with_text("posList", list)])
    })
}

fn geojson_polygon(coordinates: &Value) -> Option<GeometryElement> {
    let rings = coordinates.as_array()?;
    let mut children = Vec::with_capacity(rings.len());
    for (i, ring) in rings.iter().enumerate() {
        let boundary = if i == 0 { "exterior" } else { "interior" };
        let linear_ring = GeometryElement::with_children(
            "LinearRing",
            vec![GeometryElement::with_text("posList", pos_list(ring)?)],
        );
        children.push(GeometryElement::with_children(boundary, vec![linear_ring]));
    }
    Some(GeometryElement::with_children("Polygon", children))
}

/// `[x, y, ...]` as `"x y"`; extra ordinates are dropped.
fn position(value: &Value) -> Option<String> {
    let coords = value.as_array()?;
    let x = coords.first().filter(|v| v.is_number())?;
    let y = coords.get(1).filter(|v| v.is_number())?;
    Some(format!("{} {}", x, y))
}

fn pos_list(value: &Value) -> Option<String> {
    let positions = value
        .as_array()?
        .iter()
        .map(position)
        .collect::<Option<Vec<_>>>()?;
    Some(positions.join(" "))
}

fn parse_gml(payload: &str) -> Result<Vec<RawFeature>, SyncError> {
    let document = roxmltree::Document::parse(payload)
        .map_err(|e| SyncError::Parse(format!("invalid XML payload: {}", e)))?;

    let root = document.root_element();
    if !root.tag_name().name().ends_with("FeatureCollection") {
        return Err(SyncError::Parse(format!(
            "unexpected root element '{}', expected a FeatureCollection",
            root.tag_name().name()
        )));
    }

    let mut features = Vec::new();
    for member in root.children().filter(|n| n.is_element()) {
        match member.tag_name().name() {
            "member" | "members" | "featureMember" | "featureMembers" => {
                features.extend(member.children().filter(|n| n.is_element()));
            }
            _ => {}
        }
    }

    features
        .into_iter()
        .enumerate()
        .map(|(ordinal, node)| gml_feature(ordinal, node))
        .collect()
}

fn gml_feature(ordinal: usize, node: roxmltree::Node<'_, '_>) -> Result<RawFeature, SyncError> {
    let mut change_kind = None;
    let mut fields = Vec::new();
    let mut geometry = None;

    for field in node.children().filter(|n| n.is_element()) {
        let name = field.tag_name().name();
        if name == CHANGE_FIELD {
            let text = field.text().unwrap_or_default();
            change_kind = Some(
                text.parse::<ChangeKind>()
                    .map_err(|e| SyncError::Parse(format!("feature {}: {}", ordinal, e)))?,
            );
        } else if name == "boundedBy" {
            continue;
        } else if is_geometry_field(name) {
            geometry = field
                .children()
                .find(|n| n.is_element())
                .map(element_tree);
        } else {
            fields.push((name.to_string(), gml_text(field)));
        }
    }

    Ok(RawFeature {
        ordinal,
        change_kind: change_kind.ok_or_else(|| missing_change(ordinal))?,
        fields,
        geometry,
    })
}

fn gml_text(field: roxmltree::Node<'_, '_>) -> Option<String> {
    let nil = field
        .attributes()
        .any(|a| a.name() == "nil" && a.value() == "true");
    if nil {
        return None;
    }
    field
        .text()
        .filter(|t| !t.trim().is_empty())
        .map(str::to_string)
}

fn element_tree(node: roxmltree::Node<'_, '_>) -> GeometryElement {
    let children: Vec<GeometryElement> = node
        .children()
        .filter(|n| n.is_element())
        .map(element_tree)
        .collect();
    let text = if children.is_empty() {
        node.text().map(|t| t.trim().to_string())
    } else {
        None
    };
    GeometryElement {
        name: node.tag_name().name().to_string(),
        text,
        children,
    }
}

fn missing_change(ordinal: usize) -> SyncError {
    SyncError::Parse(format!(
        "feature {} has no {} indicator",
        ordinal, CHANGE_FIELD
    ))
}
