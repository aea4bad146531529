//! Raw spatial documents -> `FeatureCollection`.
//!
//! This is the only module that knows about document formats. It is also the
//! single geometry filter: whatever it emits is a Point, Polygon or
//! MultiPolygon with coordinates, and nothing downstream checks again.

mod geo_json;
mod kml;

use std::collections::HashSet;

use geo::{LineString, MultiPolygon, Point, Polygon};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::LayerError;
use crate::types::{DeclaredAttributes, Description, FeatureCollection, Geometry, SectorRef};

pub use kml::extract_text;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Kml,
    GeoJson,
}

impl DocumentFormat {
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let essence = content_type.split(';').next().unwrap_or("").trim().to_lowercase();
        match essence.as_str() {
            "application/vnd.google-earth.kml+xml" | "application/xml" | "text/xml" => {
                Some(DocumentFormat::Kml)
            }
            "application/json" | "application/geo+json" => Some(DocumentFormat::GeoJson),
            _ => None,
        }
    }

    pub fn from_path(path: &str) -> Option<Self> {
        let lower = path.split(['?', '#']).next().unwrap_or("").to_lowercase();
        if lower.ends_with(".kml") {
            Some(DocumentFormat::Kml)
        } else if lower.ends_with(".geojson") || lower.ends_with(".json") {
            Some(DocumentFormat::GeoJson)
        } else {
            None
        }
    }

    /// Last resort when neither headers nor the path say anything.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        let first = bytes
            .iter()
            .copied()
            .find(|b| !b.is_ascii_whitespace() && *b != 0xEF && *b != 0xBB && *b != 0xBF)?;
        match first {
            b'<' => Some(DocumentFormat::Kml),
            b'{' => Some(DocumentFormat::GeoJson),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DocumentFormat::Kml => "KML",
            DocumentFormat::GeoJson => "GeoJSON",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            DocumentFormat::Kml => "application/vnd.google-earth.kml+xml",
            DocumentFormat::GeoJson => "application/geo+json",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct NormalizeReport {
    pub collection: FeatureCollection,
    /// Features skipped because their geometry was unsupported or empty.
    pub dropped: usize,
}

impl NormalizeReport {
    /// True when the document had features but none survived the filter.
    pub fn all_dropped(&self) -> bool {
        self.collection.is_empty() && self.dropped > 0
    }
}

/// `source` seeds synthesized ids (`"<source>-<index>"`) for features that
/// carry none of their own.
pub fn normalize(
    bytes: &[u8],
    format: DocumentFormat,
    source: &str,
) -> Result<NormalizeReport, LayerError> {
    let text = std::str::from_utf8(bytes).map_err(|e| LayerError::parse(format.name(), e))?;
    let text = text.trim_start_matches('\u{feff}');
    let report = match format {
        DocumentFormat::Kml => kml::parse(text, source)?,
        DocumentFormat::GeoJson => geo_json::parse(text, source)?,
    };
    debug!(
        source,
        format = format.name(),
        features = report.collection.len(),
        dropped = report.dropped,
        "normalized document"
    );
    Ok(report)
}

/// Keeps feature ids unique within one document. A declared id that was
/// already handed out falls back to `"<source>-<index>"`, and a taken
/// fallback gets a numeric suffix.
#[derive(Debug, Default)]
struct FeatureIds {
    seen: HashSet<String>,
}

impl FeatureIds {
    fn claim(&mut self, declared: Option<String>, source: &str, index: usize) -> String {
        if let Some(id) = declared.filter(|id| !self.seen.contains(id)) {
            self.seen.insert(id.clone());
            return id;
        }
        let base = format!("{source}-{index}");
        let mut id = base.clone();
        let mut n = 2;
        while self.seen.contains(&id) {
            id = format!("{base}-{n}");
            n += 1;
        }
        self.seen.insert(id.clone());
        id
    }
}

/// Combines the supported members of a multi-geometry. Polygons take
/// precedence over points; a single polygon stays a `Polygon`.
fn compose(points: Vec<Point<f64>>, mut polygons: Vec<Polygon<f64>>) -> Option<Geometry> {
    match polygons.len() {
        0 => points.into_iter().next().map(Geometry::Point),
        1 => polygons.pop().map(Geometry::Polygon),
        _ => Some(Geometry::MultiPolygon(MultiPolygon::new(polygons))),
    }
}

fn position(values: &[f64]) -> Option<(f64, f64)> {
    match values {
        [lng, lat, ..] if lng.is_finite() && lat.is_finite() => Some((*lng, *lat)),
        _ => None,
    }
}

/// A ring needs at least three positions to enclose anything.
fn ring(positions: Vec<(f64, f64)>) -> Option<LineString<f64>> {
    (positions.len() >= 3).then(|| LineString::from(positions))
}

fn string_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_sector(value: &Value) -> Option<SectorRef> {
    let obj = value.as_object()?;
    let field = |key: &str| obj.get(key).and_then(string_value);
    let slug = field("slug")?;
    Some(SectorRef {
        id: field("id").unwrap_or_else(|| slug.clone()),
        name: field("nome").or_else(|| field("name")).unwrap_or_else(|| slug.clone()),
        slug,
        color_hex: field("cor").or_else(|| field("color")),
    })
}

/// Splits a loose property bag into the attributes the enricher understands
/// and everything else.
fn declared_attributes(mut props: Map<String, Value>) -> (DeclaredAttributes, Option<SectorRef>, Option<String>) {
    let mut take = |keys: &[&str]| {
        let found: Vec<Value> = keys.iter().filter_map(|k| props.remove(*k)).collect();
        found.iter().find_map(string_value)
    };
    let parcel_id = take(&["loteId", "parcelId"]);
    let name = take(&["numero", "name", "label"]);
    let color = take(&["cor", "color"]);
    let status = take(&["status"]);
    let description = take(&["description"]).map(|raw| Description {
        text: extract_text(&raw),
        raw,
    });
    let sector = props
        .remove("setor")
        .or_else(|| props.remove("sector"))
        .as_ref()
        .and_then(parse_sector);

    let declared = DeclaredAttributes { name, color, status, description, extra: props };
    (declared, sector, parcel_id)
}
