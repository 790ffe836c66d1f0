// ABOUTME: Geometry reconstruction from GML-shaped element trees into geo-types values
// ABOUTME: Applies the degree/metre threshold to decide which coordinate pairs get reprojected

use std::fmt;

use geo_types::{Coord, Geometry, LineString, MultiLineString, Point, Polygon};
use wkt::ToWkt;

use super::reproject::TransverseMercator;
use crate::error::SyncError;

/// First-coordinate magnitude below which a pair is treated as geographic
/// (degrees) and reprojected. Projected NZTM eastings are 6-7 digits.
pub const REPROJECTION_THRESHOLD: f64 = 1000.0;

/// Owned element tree for a geometry property.
///
/// The GML parser copies the subtree under the feature's geometry field into
/// this shape; the JSON parser builds the equivalent GML structure from
/// GeoJSON so both formats share one normalizer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GeometryElement {
    /// Element name; a namespace prefix or `{uri}` qualifier is ignored
    pub name: String,
    pub text: Option<String>,
    pub children: Vec<GeometryElement>,
}

impl GeometryElement {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            text: None,
            children: Vec::new(),
        }
    }

    pub fn with_text(name: &str, text: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            text: Some(text.into()),
            children: Vec::new(),
        }
    }

    pub fn with_children(name: &str, children: Vec<GeometryElement>) -> Self {
        Self {
            name: name.to_string(),
            text: None,
            children,
        }
    }

    /// Name without namespace prefix (`gml:Point` and `{http://..}Point` give `Point`).
    pub fn local_name(&self) -> &str {
        let name = self.name.rsplit('}').next().unwrap_or(&self.name);
        name.rsplit(':').next().unwrap_or(name)
    }

    fn child(&self, name: &str) -> Option<&GeometryElement> {
        self.children.iter().find(|c| c.local_name() == name)
    }

    fn children_named<'a>(
        &'a self,
        names: &'a [&'a str],
    ) -> impl Iterator<Item = &'a GeometryElement> + 'a {
        self.children
            .iter()
            .filter(move |c| names.contains(&c.local_name()))
    }
}

/// Kind of a reconstructed geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GeometryKind {
    Point,
    Polygon,
    MultiLineString,
}

impl GeometryKind {
    /// PostGIS type modifier for a column holding this kind as parsed.
    pub fn postgis_type(&self) -> &'static str {
        match self {
            GeometryKind::Point => "Point",
            GeometryKind::Polygon => "Polygon",
            GeometryKind::MultiLineString => "MultiLineString",
        }
    }

    /// PostGIS type modifier of the target column. Polygons are stored as
    /// multi-polygons.
    pub fn target_postgis_type(&self) -> &'static str {
        match self {
            GeometryKind::Point => "Point",
            GeometryKind::Polygon => "MultiPolygon",
            GeometryKind::MultiLineString => "MultiLineString",
        }
    }

    /// Whether insertion into the target must wrap the value with `ST_Multi`.
    pub fn needs_multi_wrap(&self) -> bool {
        matches!(self, GeometryKind::Polygon)
    }
}

impl fmt::Display for GeometryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.postgis_type())
    }
}

/// Canonical geometry in the target reference system.
#[derive(Debug, Clone, PartialEq)]
pub struct GeometryValue {
    pub kind: GeometryKind,
    pub geometry: Geometry<f64>,
    /// `geometry` serialized as WKT, handed to `ST_GeomFromText`
    pub wkt: String,
    pub srid: i32,
}

impl GeometryValue {
    pub fn new(kind: GeometryKind, geometry: Geometry<f64>, srid: i32) -> Self {
        let wkt = geometry.wkt_string();
        Self {
            kind,
            geometry,
            wkt,
            srid,
        }
    }
}

/// Rebuilds geometries from element trees and reprojects degree-scale pairs.
#[derive(Debug, Clone)]
pub struct GeometryNormalizer {
    projection: TransverseMercator,
}

impl GeometryNormalizer {
    pub fn new(projection: TransverseMercator) -> Self {
        Self { projection }
    }

    /// Normalizer targeting NZTM2000.
    pub fn nztm() -> Self {
        Self::new(TransverseMercator::nztm2000())
    }

    pub fn srid(&self) -> i32 {
        self.projection.srid
    }

    /// Reconstruct a geometry element in the target reference system.
    ///
    /// Supported kinds are `Point`, `Polygon` (first ring only) and
    /// `LineString`, which is always promoted to a multi-linestring.
    /// `MultiSurface`/`MultiPolygon` wrappers yield their first polygon and
    /// `MultiCurve`/`MultiLineString` wrappers yield all member lines.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Geometry`] for an unsupported kind, missing child
    /// structure, or malformed coordinates.
    pub fn normalize(&self, element: &GeometryElement) -> Result<GeometryValue, SyncError> {
        let (kind, geometry) = match element.local_name() {
            "Point" => (GeometryKind::Point, Geometry::Point(self.point(element)?)),
            "Polygon" => (GeometryKind::Polygon, Geometry::Polygon(self.polygon(element)?)),
            "MultiSurface" | "MultiPolygon" => {
                let polygon = element
                    .children_named(&["surfaceMember", "surfaceMembers", "polygonMember"])
                    .flat_map(|member| member.children.iter())
                    .find(|c| c.local_name() == "Polygon")
                    .ok_or_else(|| missing(element, "Polygon member"))?;
                (GeometryKind::Polygon, Geometry::Polygon(self.polygon(polygon)?))
            }
            "LineString" => {
                let line = self.line(element)?;
                (
                    GeometryKind::MultiLineString,
                    Geometry::MultiLineString(MultiLineString::new(vec![line])),
                )
            }
            "MultiCurve" | "MultiLineString" => {
                let lines = element
                    .children_named(&["curveMember", "curveMembers", "lineStringMember"])
                    .flat_map(|member| member.children.iter())
                    .filter(|c| c.local_name() == "LineString")
                    .map(|line| self.line(line))
                    .collect::<Result<Vec<_>, _>>()?;
                if lines.is_empty() {
                    return Err(missing(element, "LineString member"));
                }
                (
                    GeometryKind::MultiLineString,
                    Geometry::MultiLineString(MultiLineString::new(lines)),
                )
            }
            other => {
                return Err(SyncError::Geometry(format!(
                    "unsupported geometry kind '{}'",
                    other
                )))
            }
        };

        Ok(GeometryValue::new(kind, geometry, self.srid()))
    }

    fn point(&self, point: &GeometryElement) -> Result<Point<f64>, SyncError> {
        let text = point
            .children
            .first()
            .and_then(|c| c.text.as_deref())
            .ok_or_else(|| missing(point, "pos"))?;
        let coords = self.reproject_pos_list(text)?;
        match coords.as_slice() {
            [coord] => Ok(Point::from(*coord)),
            _ => Err(SyncError::Geometry(format!(
                "Point expects one coordinate pair, got {}",
                coords.len()
            ))),
        }
    }

    /// Exterior ring only; `Polygon::new` closes an open ring.
    fn polygon(&self, polygon: &GeometryElement) -> Result<Polygon<f64>, SyncError> {
        let ring = polygon
            .child("exterior")
            .or_else(|| polygon.child("outerBoundaryIs"))
            .and_then(|boundary| boundary.child("LinearRing"))
            .ok_or_else(|| missing(polygon, "exterior/LinearRing"))?;
        Ok(Polygon::new(self.line(ring)?, Vec::new()))
    }

    /// Coordinates of a ring or line: a `posList`, or a run of `pos` elements.
    fn line(&self, element: &GeometryElement) -> Result<LineString<f64>, SyncError> {
        let text = if let Some(pos_list) = element.child("posList") {
            pos_list.text.clone().unwrap_or_default()
        } else {
            let positions: Vec<&str> = element
                .children_named(&["pos"])
                .filter_map(|p| p.text.as_deref())
                .collect();
            positions.join(" ")
        };

        let coords = self.reproject_pos_list(&text)?;
        if coords.is_empty() {
            return Err(missing(element, "posList"));
        }
        Ok(LineString::new(coords))
    }

    /// Reproject a whitespace-separated coordinate list.
    pub fn reproject_pos_list(&self, pos_list: &str) -> Result<Vec<Coord<f64>>, SyncError> {
        let scalars = pos_list
            .split_whitespace()
            .map(|s| {
                s.parse::<f64>()
                    .map_err(|_| SyncError::Geometry(format!("invalid coordinate '{}'", s)))
            })
            .collect::<Result<Vec<f64>, _>>()?;

        if scalars.len() % 2 != 0 {
            return Err(SyncError::Geometry(format!(
                "odd number of coordinate values ({})",
                scalars.len()
            )));
        }

        Ok(scalars
            .chunks_exact(2)
            .map(|pair| {
                let (x, y) = self.reproject_pair(pair[0], pair[1]);
                Coord { x, y }
            })
            .collect())
    }

    /// Apply the degree/metre heuristic to one pair.
    ///
    /// Pairs whose first value is below [`REPROJECTION_THRESHOLD`] are read as
    /// longitude/latitude and projected; all others pass through unchanged.
    pub fn reproject_pair(&self, x: f64, y: f64) -> (f64, f64) {
        if x < REPROJECTION_THRESHOLD {
            self.projection.forward(x, y)
        } else {
            (x, y)
        }
    }
}

impl Default for GeometryNormalizer {
    fn default() -> Self {
        Self::nztm()
    }
}

fn missing(element: &GeometryElement, what: &str) -> SyncError {
    SyncError::Geometry(format!(
        "{} element has no {}",
        element.local_name(),
        what
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    /// Parse emitted WKT back into a geo-types geometry.
    fn read_wkt(text: &str) -> Geometry<f64> {
        let parsed = wkt::Wkt::<f64>::from_str(text).unwrap();
        Geometry::try_from(parsed).unwrap()
    }

    fn pos_list(text: &str) -> GeometryElement {
        GeometryElement::with_text("gml:posList", text)
    }

    fn polygon(text: &str) -> GeometryElement {
        GeometryElement::with_children(
            "gml:Polygon",
            vec![GeometryElement::with_children(
                "gml:exterior",
                vec![GeometryElement::with_children(
                    "gml:LinearRing",
                    vec![pos_list(text)],
                )],
            )],
        )
    }

    fn line(text: &str) -> GeometryElement {
        GeometryElement::with_children("gml:LineString", vec![pos_list(text)])
    }

    #[test]
    fn test_local_name() {
        assert_eq!(GeometryElement::new("gml:Point").local_name(), "Point");
        assert_eq!(
            GeometryElement::new("{http://www.opengis.net/gml/3.2}Polygon").local_name(),
            "Polygon"
        );
        assert_eq!(GeometryElement::new("LineString").local_name(), "LineString");
    }

    #[test]
    fn test_threshold_reprojects_degrees() {
        let normalizer = GeometryNormalizer::nztm();
        let (x, y) = normalizer.reproject_pair(174.78, -36.85);
        assert!((x - 1_758_695.197).abs() < 0.01);
        assert!((y - 5_920_288.770).abs() < 0.01);
    }

    #[test]
    fn test_threshold_passes_metres_through() {
        let normalizer = GeometryNormalizer::nztm();
        assert_eq!(
            normalizer.reproject_pair(1_756_000.0, 5_920_000.0),
            (1_756_000.0, 5_920_000.0)
        );
        // The boundary itself is not reprojected
        assert_eq!(normalizer.reproject_pair(1000.0, 5.0), (1000.0, 5.0));
        assert_ne!(normalizer.reproject_pair(999.999, -40.0), (999.999, -40.0));
    }

    #[test]
    fn test_point() {
        let normalizer = GeometryNormalizer::nztm();
        let point = GeometryElement::with_children(
            "gml:Point",
            vec![GeometryElement::with_text("gml:pos", "1756000 5920000")],
        );
        let value = normalizer.normalize(&point).unwrap();
        assert_eq!(value.kind, GeometryKind::Point);
        assert_eq!(value.geometry, Geometry::Point(Point::new(1_756_000.0, 5_920_000.0)));
        assert_eq!(value.wkt, "POINT(1756000 5920000)");
        assert_eq!(value.srid, 2193);
    }

    #[test]
    fn test_point_with_two_pairs_is_rejected() {
        let normalizer = GeometryNormalizer::nztm();
        let point = GeometryElement::with_children(
            "Point",
            vec![GeometryElement::with_text("pos", "1 2 3 4")],
        );
        assert!(matches!(
            normalizer.normalize(&point),
            Err(SyncError::Geometry(_))
        ));
    }

    #[test]
    fn test_polygon_round_trip() {
        let normalizer = GeometryNormalizer::nztm();
        let ring = "1750000 5920000 1751000 5920000 1751000 5921000 1750000 5920000";
        let value = normalizer.normalize(&polygon(ring)).unwrap();
        assert_eq!(value.kind, GeometryKind::Polygon);
        assert_eq!(
            value.wkt,
            "POLYGON((1750000 5920000,1751000 5920000,1751000 5921000,1750000 5920000))"
        );

        let expected = Polygon::new(
            LineString::from(vec![
                (1_750_000.0, 5_920_000.0),
                (1_751_000.0, 5_920_000.0),
                (1_751_000.0, 5_921_000.0),
                (1_750_000.0, 5_920_000.0),
            ]),
            vec![],
        );
        assert_eq!(read_wkt(&value.wkt), Geometry::Polygon(expected));
        assert_eq!(read_wkt(&value.wkt), value.geometry);
    }

    #[test]
    fn test_open_ring_is_closed() {
        let normalizer = GeometryNormalizer::nztm();
        let value = normalizer
            .normalize(&polygon("1750000 5920000 1751000 5920000 1751000 5921000"))
            .unwrap();
        match value.geometry {
            Geometry::Polygon(p) => {
                assert_eq!(p.exterior().0.len(), 4);
                assert_eq!(p.exterior().0.first(), p.exterior().0.last());
            }
            other => panic!("expected polygon, got {:?}", other),
        }
    }

    #[test]
    fn test_polygon_ignores_interior_rings() {
        let normalizer = GeometryNormalizer::nztm();
        let mut element = polygon("0.5 0.5 1.5 0.5 1.5 1.5 0.5 0.5");
        element.children.push(GeometryElement::with_children(
            "gml:interior",
            vec![GeometryElement::with_children(
                "gml:LinearRing",
                vec![pos_list("9 9 9 9 9 9 9 9")],
            )],
        ));
        let value = normalizer.normalize(&element).unwrap();
        match read_wkt(&value.wkt) {
            Geometry::Polygon(p) => {
                assert_eq!(p.exterior().0.len(), 4);
                assert!(p.interiors().is_empty());
            }
            other => panic!("expected polygon, got {:?}", other),
        }
    }

    #[test]
    fn test_polygon_reprojected_round_trip_matches_direct_projection() {
        let normalizer = GeometryNormalizer::nztm();
        let ring = [(174.7, -36.8), (174.8, -36.8), (174.8, -36.9), (174.7, -36.8)];
        let text = ring
            .iter()
            .map(|(x, y)| format!("{} {}", x, y))
            .collect::<Vec<_>>()
            .join(" ");
        let value = normalizer.normalize(&polygon(&text)).unwrap();
        let exterior = match read_wkt(&value.wkt) {
            Geometry::Polygon(p) => p.exterior().clone(),
            other => panic!("expected polygon, got {:?}", other),
        };
        let projection = TransverseMercator::nztm2000();
        for ((x, y), coord) in ring.iter().zip(exterior.coords()) {
            let (ex, ey) = projection.forward(*x, *y);
            assert_eq!((coord.x, coord.y), (ex, ey));
        }
    }

    #[test]
    fn test_multisurface_uses_first_polygon() {
        let normalizer = GeometryNormalizer::nztm();
        let element = GeometryElement::with_children(
            "gml:MultiSurface",
            vec![
                GeometryElement::with_children(
                    "gml:surfaceMember",
                    vec![polygon("1700000 5900000 1700010 5900000 1700010 5900010 1700000 5900000")],
                ),
                GeometryElement::with_children(
                    "gml:surfaceMember",
                    vec![polygon("1800000 5900000 1800010 5900000 1800010 5900010 1800000 5900000")],
                ),
            ],
        );
        let value = normalizer.normalize(&element).unwrap();
        assert_eq!(value.kind, GeometryKind::Polygon);
        assert!(value.wkt.starts_with("POLYGON((1700000 5900000"));
        assert!(!value.wkt.contains("1800000"));
    }

    #[test]
    fn test_linestring_promoted_to_multilinestring() {
        let normalizer = GeometryNormalizer::nztm();
        let value = normalizer
            .normalize(&line("1700000 5900000 1700100 5900100"))
            .unwrap();
        assert_eq!(value.kind, GeometryKind::MultiLineString);
        assert_eq!(value.wkt, "MULTILINESTRING((1700000 5900000,1700100 5900100))");
    }

    #[test]
    fn test_multicurve_keeps_every_line() {
        let normalizer = GeometryNormalizer::nztm();
        let element = GeometryElement::with_children(
            "gml:MultiCurve",
            vec![
                GeometryElement::with_children("gml:curveMember", vec![line("1 2 3 4")]),
                GeometryElement::with_children(
                    "gml:curveMember",
                    vec![line("1700000 5900000 1700100 5900100")],
                ),
            ],
        );
        let value = normalizer.normalize(&element).unwrap();
        assert_eq!(value.kind, GeometryKind::MultiLineString);
        match read_wkt(&value.wkt) {
            Geometry::MultiLineString(lines) => {
                assert_eq!(lines.0.len(), 2);
                assert_eq!(
                    lines.0[1],
                    LineString::from(vec![(1_700_000.0, 5_900_000.0), (1_700_100.0, 5_900_100.0)])
                );
            }
            other => panic!("expected multilinestring, got {:?}", other),
        }
    }

    #[test]
    fn test_unsupported_kind() {
        let normalizer = GeometryNormalizer::nztm();
        let err = normalizer
            .normalize(&GeometryElement::new("gml:Curve"))
            .unwrap_err();
        assert_eq!(
            err,
            SyncError::Geometry("unsupported geometry kind 'Curve'".to_string())
        );
    }

    #[test]
    fn test_polygon_without_ring() {
        let normalizer = GeometryNormalizer::nztm();
        let element = GeometryElement::with_children("gml:Polygon", vec![]);
        assert!(matches!(
            normalizer.normalize(&element),
            Err(SyncError::Geometry(_))
        ));
    }

    #[test]
    fn test_malformed_coordinates() {
        let normalizer = GeometryNormalizer::nztm();
        assert!(normalizer.reproject_pos_list("1 2 3").is_err());
        assert!(normalizer.reproject_pos_list("1 north").is_err());
        assert!(normalizer.reproject_pos_list("").unwrap().is_empty());
    }

    #[test]
    fn test_kind_target_types() {
        assert_eq!(GeometryKind::Polygon.target_postgis_type(), "MultiPolygon");
        assert!(GeometryKind::Polygon.needs_multi_wrap());
        assert!(!GeometryKind::Point.needs_multi_wrap());
        assert_eq!(
            GeometryKind::MultiLineString.target_postgis_type(),
            "MultiLineString"
        );
    }
}
