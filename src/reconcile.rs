//! The desired-vs-actual layer set.
//!
//! `Reconciler` is the only writer of the `source_key -> LayerSource` map.
//! Loads it asks for may finish in any order; each carries the ticket issued
//! when it was requested, and a result whose ticket no longer matches a
//! pending entry is dropped on arrival.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::LayerError;
use crate::render::{LayerHandle, MapRenderer, RenderLayer};
use crate::resolver::{LayerStub, OriginKind};
use crate::types::{FeatureCollection, Region};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct LoadTicket(u64);

#[derive(Debug, Clone, PartialEq)]
pub enum LoadState {
    Pending,
    Loaded,
    Error(LayerError),
}

impl LoadState {
    pub fn is_settled(&self) -> bool {
        !matches!(self, LoadState::Pending)
    }
}

#[derive(Debug)]
pub struct LayerSource {
    pub source_key: String,
    pub origin: OriginKind,
    pub document_uri: Option<String>,
    pub load_state: LoadState,
    pub bounding_region: Option<Region>,
    pub collection: Option<Arc<FeatureCollection>>,
    /// Features the normalizer filtered out of this layer's document.
    pub dropped: usize,
    ticket: LoadTicket,
    handle: Option<LayerHandle>,
}

#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub ticket: LoadTicket,
    pub stub: LayerStub,
}

#[derive(Debug)]
pub struct LoadOutcome {
    pub source_key: String,
    pub ticket: LoadTicket,
    pub document_uri: Option<String>,
    pub result: Result<(FeatureCollection, usize), LayerError>,
}

#[derive(Debug, Default)]
pub struct ReconcileDiff {
    pub to_load: Vec<LoadRequest>,
    pub removed: Vec<String>,
    pub unchanged: Vec<String>,
}

impl ReconcileDiff {
    pub fn is_noop(&self) -> bool {
        self.to_load.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Settled { source_key: String, loaded: bool, region: Option<Region> },
    Stale { source_key: String },
}

#[derive(Debug, Default)]
pub struct Reconciler {
    layers: BTreeMap<String, LayerSource>,
    next_ticket: u64,
    stale_discarded: usize,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the layer set match `desired`. Layers present on both sides are
    /// not touched; calling this twice with the same set is a no-op.
    pub fn reconcile(&mut self, desired: Vec<LayerStub>, renderer: &mut dyn MapRenderer) -> ReconcileDiff {
        let desired_keys: HashSet<&str> = desired.iter().map(|s| s.source_key.as_str()).collect();
        let mut diff = ReconcileDiff::default();

        let to_remove: Vec<String> = self
            .layers
            .keys()
            .filter(|k| !desired_keys.contains(k.as_str()))
            .cloned()
            .collect();
        for key in to_remove {
            if let Some(layer) = self.layers.remove(&key) {
                if let Some(handle) = layer.handle {
                    renderer.remove_layer(handle);
                }
                info!(key = %key, "layer removed");
            }
            diff.removed.push(key);
        }

        for stub in desired {
            if self.layers.contains_key(&stub.source_key) {
                diff.unchanged.push(stub.source_key);
                continue;
            }
            self.next_ticket += 1;
            let ticket = LoadTicket(self.next_ticket);
            self.layers.insert(
                stub.source_key.clone(),
                LayerSource {
                    source_key: stub.source_key.clone(),
                    origin: stub.origin,
                    document_uri: stub.cached_uri.clone(),
                    load_state: LoadState::Pending,
                    bounding_region: None,
                    collection: None,
                    dropped: 0,
                    ticket,
                    handle: None,
                },
            );
            debug!(key = %stub.source_key, ?ticket, "layer pending");
            diff.to_load.push(LoadRequest { ticket, stub });
        }

        diff
    }

    /// Registers a finished load, or discards it if the layer was removed or
    /// re-requested since.
    pub fn complete(&mut self, outcome: LoadOutcome, renderer: &mut dyn MapRenderer) -> Completion {
        let key = outcome.source_key;
        let layer = match self.layers.get_mut(&key) {
            Some(layer) if layer.ticket == outcome.ticket && layer.load_state == LoadState::Pending => layer,
            _ => {
                self.stale_discarded += 1;
                debug!(key = %key, ticket = ?outcome.ticket, "stale load result discarded");
                return Completion::Stale { source_key: key };
            }
        };

        layer.document_uri = outcome.document_uri.or(layer.document_uri.take());
        match outcome.result {
            Ok((collection, dropped)) => {
                let collection = Arc::new(collection);
                layer.bounding_region = collection.bounding_region();
                layer.dropped = dropped;
                layer.handle = Some(renderer.add_layer(&RenderLayer {
                    source_key: key.clone(),
                    document_uri: layer.document_uri.clone(),
                    collection: collection.clone(),
                }));
                if collection.is_empty() && dropped > 0 {
                    info!(key = %key, dropped, "every feature had unsupported geometry; layer is empty");
                }
                info!(key = %key, features = collection.len(), "layer loaded");
                layer.collection = Some(collection);
                layer.load_state = LoadState::Loaded;
                Completion::Settled { source_key: key, loaded: true, region: layer.bounding_region }
            }
            Err(e) => {
                warn!(key = %key, error = %e, "layer failed to load");
                layer.load_state = LoadState::Error(e);
                Completion::Settled { source_key: key, loaded: false, region: None }
            }
        }
    }

    /// Bounds reported by the renderer after the layer was added. Returns
    /// true when the stored region changed.
    pub fn update_bounds(&mut self, key: &str, region: Region) -> bool {
        match self.layers.get_mut(key) {
            Some(layer) if layer.load_state == LoadState::Loaded => {
                let region = region.non_empty();
                let changed = layer.bounding_region != region;
                layer.bounding_region = region;
                changed
            }
            _ => false,
        }
    }

    /// The renderer could not materialize a loaded layer: release it and
    /// record the failure.
    pub fn mark_render_failed(&mut self, key: &str, renderer: &mut dyn MapRenderer) -> bool {
        let Some(layer) = self.layers.get_mut(key) else {
            return false;
        };
        if layer.load_state != LoadState::Loaded {
            return false;
        }
        if let Some(handle) = layer.handle.take() {
            renderer.remove_layer(handle);
        }
        layer.bounding_region = None;
        layer.load_state = LoadState::Error(LayerError::Fetch {
            uri: layer.document_uri.clone().unwrap_or_default(),
            reason: "renderer rejected the layer".to_string(),
        });
        warn!(key, "renderer rejected layer");
        true
    }

    /// Releases every layer. Results still in flight are discarded when they arrive.
    pub fn dispose(&mut self, renderer: &mut dyn MapRenderer) {
        for (_, layer) in std::mem::take(&mut self.layers) {
            if let Some(handle) = layer.handle {
                renderer.remove_layer(handle);
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&LayerSource> {
        self.layers.get(key)
    }

    pub fn layers(&self) -> impl Iterator<Item = &LayerSource> {
        self.layers.values()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.layers.keys().map(String::as_str)
    }

    pub fn has_pending(&self) -> bool {
        self.layers.values().any(|l| l.load_state == LoadState::Pending)
    }

    pub fn stale_discarded(&self) -> usize {
        self.stale_discarded
    }
}
