use geo::{MultiPolygon, Point, Polygon};
use geojson::{feature::Id, GeoJson, Value};

use super::{compose, declared_attributes, position, ring, FeatureIds, NormalizeReport};
use crate::error::LayerError;
use crate::types::{Feature, FeatureCollection, FeatureProperties, Geometry};

pub(super) fn parse(text: &str, source: &str) -> Result<NormalizeReport, LayerError> {
    let geojson: GeoJson = text.parse().map_err(|e| LayerError::parse("GeoJSON", e))?;

    let features = match geojson {
        GeoJson::FeatureCollection(fc) => fc.features,
        GeoJson::Feature(f) => vec![f],
        GeoJson::Geometry(_) => {
            return Err(LayerError::parse("GeoJSON", "expected a FeatureCollection or Feature"))
        }
    };

    let mut out = Vec::with_capacity(features.len());
    let mut dropped = 0;
    let mut ids = FeatureIds::default();

    for (index, feature) in features.into_iter().enumerate() {
        let Some(geometry) = feature.geometry.and_then(|g| convert(g.value)) else {
            dropped += 1;
            continue;
        };

        let (declared, sector, parcel_id) =
            declared_attributes(feature.properties.unwrap_or_default());
        let declared_id = match feature.id {
            Some(Id::String(s)) if !s.is_empty() => Some(s),
            Some(Id::Number(n)) => Some(n.to_string()),
            _ => parcel_id.clone(),
        };
        let id = ids.claim(declared_id, source, index);

        let mut properties = FeatureProperties::new(parcel_id.unwrap_or_else(|| id.clone()));
        properties.sector = sector;
        properties.declared = declared;

        out.push(Feature { id, geometry, properties });
    }

    Ok(NormalizeReport { collection: FeatureCollection::new(out), dropped })
}

/// `None` for anything other than a Point, Polygon or MultiPolygon with
/// coordinates, or a GeometryCollection holding at least one of those.
fn convert(value: Value) -> Option<Geometry> {
    match value {
        Value::Point(p) => point(&p).map(Geometry::Point),
        Value::Polygon(rings) => polygon(rings).map(Geometry::Polygon),
        Value::MultiPolygon(polys) => {
            let polygons: Vec<Polygon<f64>> = polys.into_iter().filter_map(polygon).collect();
            (!polygons.is_empty()).then(|| Geometry::MultiPolygon(MultiPolygon::new(polygons)))
        }
        Value::GeometryCollection(members) => {
            let mut points = Vec::new();
            let mut polygons = Vec::new();
            for member in members.into_iter().filter_map(|m| convert(m.value)) {
                match member {
                    Geometry::Point(p) => points.push(p),
                    Geometry::Polygon(p) => polygons.push(p),
                    Geometry::MultiPolygon(mp) => polygons.extend(mp.0),
                }
            }
            compose(points, polygons)
        }
        _ => None,
    }
}

fn point(p: &[f64]) -> Option<Point<f64>> {
    position(p).map(|(lng, lat)| Point::new(lng, lat))
}

fn polygon(rings: Vec<Vec<Vec<f64>>>) -> Option<Polygon<f64>> {
    let mut rings = rings
        .into_iter()
        .map(|r| ring(r.iter().filter_map(|p| position(p)).collect()));
    let exterior = rings.next()??;
    let interiors = rings.flatten().collect();
    Some(Polygon::new(exterior, interiors))
}
