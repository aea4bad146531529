//! The renderer SDK boundary.
//!
//! The engine issues three commands outward (add layer, remove layer, fit
//! camera) and consumes three kinds of events inward (layer status, layer
//! bounds, pointer on a feature). Any renderer that speaks these six verbs
//! can sit behind `MapRenderer`; `HeadlessRenderer` is the in-process one used
//! by the CLI and the tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use geo::{Contains, Point};
use rstar::{RTree, RTreeObject, AABB};
use serde::Serialize;

use crate::interaction::PointerEvent;
use crate::types::{FeatureCollection, Geometry, LngLat, Region};

/// Subscription to one layer's renderer events. Owned by the layer it was
/// created for and consumed by `remove_layer`, so it is released exactly once.
#[derive(Debug, PartialEq, Eq)]
pub struct LayerHandle {
    id: u64,
    source_key: String,
}

impl LayerHandle {
    pub fn new(id: u64, source_key: impl Into<String>) -> Self {
        Self { id, source_key: source_key.into() }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn source_key(&self) -> &str {
        &self.source_key
    }
}

#[derive(Debug, Clone)]
pub struct RenderLayer {
    pub source_key: String,
    pub document_uri: Option<String>,
    pub collection: Arc<FeatureCollection>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FitCommand {
    pub region: Region,
    pub padding: u32,
    pub max_zoom: f64,
}

pub trait MapRenderer {
    fn add_layer(&mut self, layer: &RenderLayer) -> LayerHandle;
    fn remove_layer(&mut self, handle: LayerHandle);
    fn fit_bounds(&mut self, fit: &FitCommand);
}

#[derive(Debug, Clone, PartialEq)]
pub enum RendererEvent {
    /// The renderer failed to materialize a layer it had accepted.
    LayerStatus { source_key: String, ok: bool },
    /// Bounds became known (or changed) after the layer was added.
    BoundsChanged { source_key: String, region: Region },
    Pointer(PointerEvent),
}

struct IndexedFeature {
    index: usize,
    aabb: AABB<[f64; 2]>,
}

impl RTreeObject for IndexedFeature {
    type Envelope = AABB<[f64; 2]>;
    fn envelope(&self) -> Self::Envelope {
        self.aabb
    }
}

/// Spatial index for turning a pointer position into a feature id.
pub struct FeatureIndex {
    collection: Arc<FeatureCollection>,
    tree: RTree<IndexedFeature>,
}

impl FeatureIndex {
    pub fn new(collection: Arc<FeatureCollection>) -> Self {
        let items = collection
            .features
            .iter()
            .enumerate()
            .filter_map(|(index, feature)| {
                let b = feature.geometry.bounds().non_empty()?;
                Some(IndexedFeature {
                    index,
                    aabb: AABB::from_corners(
                        [b.south_west.lng, b.south_west.lat],
                        [b.north_east.lng, b.north_east.lat],
                    ),
                })
            })
            .collect();
        Self { collection, tree: RTree::bulk_load(items) }
    }

    /// Polygons hit by exact containment; points within `tolerance` degrees.
    /// Polygons win over points, and later features over earlier ones.
    pub fn locate(&self, at: LngLat, tolerance: f64) -> Option<&str> {
        let probe = Point::new(at.lng, at.lat);
        let envelope = AABB::from_corners(
            [at.lng - tolerance, at.lat - tolerance],
            [at.lng + tolerance, at.lat + tolerance],
        );

        let mut candidates: Vec<usize> = self
            .tree
            .locate_in_envelope_intersecting(&envelope)
            .map(|item| item.index)
            .collect();
        candidates.sort_unstable_by(|a, b| b.cmp(a));

        let hit = |want_area: bool| {
            candidates.iter().copied().find(|&i| {
                match &self.collection.features[i].geometry {
                    Geometry::Polygon(p) => want_area && p.contains(&probe),
                    Geometry::MultiPolygon(mp) => want_area && mp.contains(&probe),
                    Geometry::Point(p) => {
                        !want_area
                            && (p.x() - at.lng).abs() <= tolerance
                            && (p.y() - at.lat).abs() <= tolerance
                    }
                }
            })
        };

        hit(true)
            .or_else(|| hit(false))
            .map(|i| self.collection.features[i].id.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RenderCommand {
    AddLayer { source_key: String, features: usize },
    RemoveLayer { source_key: String },
    FitBounds(FitCommand),
}

/// Renderer without a screen: keeps the layers it was given, records every
/// command, and answers hit-tests.
#[derive(Default)]
pub struct HeadlessRenderer {
    commands: Vec<RenderCommand>,
    layers: BTreeMap<u64, (String, FeatureIndex)>,
    next_handle: u64,
}

impl HeadlessRenderer {
    pub const DEFAULT_TOLERANCE: f64 = 0.0005;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> &[RenderCommand] {
        &self.commands
    }

    pub fn fits(&self) -> Vec<&FitCommand> {
        self.commands
            .iter()
            .filter_map(|c| match c {
                RenderCommand::FitBounds(f) => Some(f),
                _ => None,
            })
            .collect()
    }

    pub fn layer_keys(&self) -> Vec<&str> {
        self.layers.values().map(|(key, _)| key.as_str()).collect()
    }

    pub fn live_subscriptions(&self) -> usize {
        self.layers.len()
    }

    /// Topmost (most recently added) layer wins.
    pub fn hit_test(&self, at: LngLat) -> Option<String> {
        self.layers
            .values()
            .rev()
            .find_map(|(_, index)| index.locate(at, Self::DEFAULT_TOLERANCE))
            .map(str::to_string)
    }

    pub fn click_at(&self, at: LngLat) -> RendererEvent {
        RendererEvent::Pointer(match self.hit_test(at) {
            Some(id) => PointerEvent::Click(id),
            None => PointerEvent::ClickEmpty,
        })
    }

    pub fn move_to(&self, at: LngLat) -> RendererEvent {
        RendererEvent::Pointer(match self.hit_test(at) {
            Some(id) => PointerEvent::Enter(id),
            None => PointerEvent::Leave,
        })
    }
}

impl MapRenderer for HeadlessRenderer {
    fn add_layer(&mut self, layer: &RenderLayer) -> LayerHandle {
        self.next_handle += 1;
        let id = self.next_handle;
        self.layers.insert(
            id,
            (layer.source_key.clone(), FeatureIndex::new(layer.collection.clone())),
        );
        self.commands.push(RenderCommand::AddLayer {
            source_key: layer.source_key.clone(),
            features: layer.collection.len(),
        });
        LayerHandle::new(id, layer.source_key.clone())
    }

    fn remove_layer(&mut self, handle: LayerHandle) {
        self.layers.remove(&handle.id);
        self.commands.push(RenderCommand::RemoveLayer { source_key: handle.source_key });
    }

    fn fit_bounds(&mut self, fit: &FitCommand) {
        self.commands.push(RenderCommand::FitBounds(fit.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Feature, FeatureProperties};
    use geo::polygon;

    fn collection() -> Arc<FeatureCollection> {
        let lot = Feature {
            id: "lot-1".into(),
            geometry: Geometry::Polygon(polygon![
                (x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 1.0), (x: 0.0, y: 1.0)
            ]),
            properties: FeatureProperties::new("lot-1"),
        };
        let gate = Feature {
            id: "gate".into(),
            geometry: Geometry::Point(Point::new(2.0, 2.0)),
            properties: FeatureProperties::new("gate"),
        };
        Arc::new(FeatureCollection::new(vec![lot, gate]))
    }

    #[test]
    fn hit_test_finds_polygons_and_nearby_points() {
        let index = FeatureIndex::new(collection());
        assert_eq!(index.locate(LngLat::new(0.5, 0.5), 0.0005), Some("lot-1"));
        assert_eq!(index.locate(LngLat::new(2.0001, 1.9999), 0.0005), Some("gate"));
        assert_eq!(index.locate(LngLat::new(5.0, 5.0), 0.0005), None);
    }

    #[test]
    fn handles_release_layers() {
        let mut renderer = HeadlessRenderer::new();
        let handle = renderer.add_layer(&RenderLayer {
            source_key: "general".into(),
            document_uri: None,
            collection: collection(),
        });
        assert_eq!(renderer.live_subscriptions(), 1);
        assert_eq!(
            renderer.click_at(LngLat::new(0.5, 0.5)),
            RendererEvent::Pointer(PointerEvent::Click("lot-1".into()))
        );

        renderer.remove_layer(handle);
        assert_eq!(renderer.live_subscriptions(), 0);
        assert_eq!(
            renderer.click_at(LngLat::new(0.5, 0.5)),
            RendererEvent::Pointer(PointerEvent::ClickEmpty)
        );
    }
}
