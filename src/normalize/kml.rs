use geo::{LineString, Point, Polygon};
use roxmltree::{Document, Node};
use scraper::Html;
use serde_json::{Map, Value};

use super::{compose, declared_attributes, position, ring, FeatureIds, NormalizeReport};
use crate::error::LayerError;
use crate::types::{Feature, FeatureCollection, FeatureProperties};

pub(super) fn parse(text: &str, source: &str) -> Result<NormalizeReport, LayerError> {
    let doc = Document::parse(text).map_err(|e| LayerError::parse("KML", e))?;

    let mut features = Vec::new();
    let mut dropped = 0;
    let mut ids = FeatureIds::default();

    for (index, placemark) in doc
        .descendants()
        .filter(|n| is(n, "Placemark"))
        .enumerate()
    {
        let Some(geometry) = placemark_geometry(placemark) else {
            dropped += 1;
            continue;
        };

        let id = ids.claim(
            placemark.attribute("id").filter(|id| !id.is_empty()).map(str::to_string),
            source,
            index,
        );

        let mut props = extended_data(placemark);
        if let Some(name) = child_text(placemark, "name") {
            props.insert("name".to_string(), Value::String(name));
        }
        if let Some(description) = child_text(placemark, "description") {
            props.insert("description".to_string(), Value::String(description));
        }
        let (declared, sector, parcel_id) = declared_attributes(props);

        let mut properties = FeatureProperties::new(parcel_id.unwrap_or_else(|| id.clone()));
        properties.sector = sector;
        properties.declared = declared;

        features.push(Feature { id, geometry, properties });
    }

    Ok(NormalizeReport { collection: FeatureCollection::new(features), dropped })
}

fn is(node: &Node, tag: &str) -> bool {
    node.is_element() && node.tag_name().name() == tag
}

fn child<'a, 'i>(node: Node<'a, 'i>, tag: &str) -> Option<Node<'a, 'i>> {
    node.children().find(|n| is(n, tag))
}

fn child_text(node: Node, tag: &str) -> Option<String> {
    let text: String = child(node, tag)?
        .descendants()
        .filter(|n| n.is_text())
        .filter_map(|n| n.text())
        .collect();
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// `<ExtendedData>` in both its `<Data><value>` and `<SchemaData><SimpleData>` forms.
fn extended_data(placemark: Node) -> Map<String, Value> {
    let mut props = Map::new();
    let Some(extended) = child(placemark, "ExtendedData") else {
        return props;
    };
    for node in extended.descendants() {
        let value = if is(&node, "Data") {
            child_text(node, "value")
        } else if is(&node, "SimpleData") {
            node.text().map(|t| t.trim().to_string())
        } else {
            continue;
        };
        if let (Some(name), Some(value)) = (node.attribute("name"), value) {
            props.insert(name.to_string(), Value::String(value));
        }
    }
    props
}

fn placemark_geometry(placemark: Node) -> Option<crate::types::Geometry> {
    let mut points = Vec::new();
    let mut polygons = Vec::new();

    for node in placemark.descendants() {
        if is(&node, "Point") {
            if let Some(&(lng, lat)) = coordinates(node).first() {
                points.push(Point::new(lng, lat));
            }
        } else if is(&node, "Polygon") {
            if let Some(polygon) = polygon(node) {
                polygons.push(polygon);
            }
        }
    }

    compose(points, polygons)
}

fn polygon(node: Node) -> Option<Polygon<f64>> {
    let exterior = boundary_rings(node, "outerBoundaryIs").into_iter().next()?;
    let interiors = boundary_rings(node, "innerBoundaryIs");
    Some(Polygon::new(exterior, interiors))
}

fn boundary_rings(polygon: Node, tag: &str) -> Vec<LineString<f64>> {
    polygon
        .children()
        .filter(|n| is(n, tag))
        .filter_map(|b| b.descendants().find(|n| is(n, "LinearRing")))
        .filter_map(|r| ring(coordinates(r)))
        .collect()
}

/// `lng,lat[,alt]` tuples separated by whitespace; unparseable tuples are skipped.
fn coordinates(node: Node) -> Vec<(f64, f64)> {
    let Some(text) = child_text(node, "coordinates") else {
        return Vec::new();
    };
    text.split_whitespace()
        .filter_map(|tuple| {
            let values: Option<Vec<f64>> =
                tuple.split(',').map(|v| v.trim().parse::<f64>().ok()).collect();
            position(&values?)
        })
        .collect()
}

/// Plain-text rendering of a description's HTML fragment, whitespace collapsed.
pub fn extract_text(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    let text: Vec<&str> = fragment
        .root_element()
        .text()
        .flat_map(str::split_whitespace)
        .collect();
    text.join(" ")
}
