use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lotmap::config::{EngineConfig, LoaderConfig, SectorConfig, UploadConfig, ViewportConfig};
use lotmap::engine::MapEngine;
use lotmap::error::LayerError;
use lotmap::geometry::GeometryKind;
use lotmap::interaction::PointerEvent;
use lotmap::loader::{DocumentFetcher, FetchedDocument};
use lotmap::reconcile::LoadState;
use lotmap::render::{HeadlessRenderer, RenderCommand, RendererEvent};
use lotmap::resolver::{DocumentHost, LayerRequest, MapSelection};
use lotmap::types::{LngLat, Region};
use tokio::sync::Notify;
use url::Url;

const GENERAL: &str = "/kml/mapas-gerais/mapa-geral.kml";

const MIXED_KML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<kml xmlns="http://www.opengis.net/kml/2.2"><Document>
  <Placemark id="lote-1"><name>1</name><Polygon><outerBoundaryIs><LinearRing>
    <coordinates>0,0 1,0 1,1 0,1 0,0</coordinates></LinearRing></outerBoundaryIs></Polygon></Placemark>
  <Placemark id="lote-2"><name>2</name><Polygon><outerBoundaryIs><LinearRing>
    <coordinates>2,0 3,0 3,1 2,1 2,0</coordinates></LinearRing></outerBoundaryIs></Polygon></Placemark>
  <Placemark id="lote-3"><name>3</name><Polygon><outerBoundaryIs><LinearRing>
    <coordinates>4,0 5,0 5,1 4,1 4,0</coordinates></LinearRing></outerBoundaryIs></Polygon></Placemark>
  <Placemark id="portaria"><name>Portaria</name><Point><coordinates>6,2</coordinates></Point></Placemark>
  <Placemark id="lago"><name>Lago</name><Point><coordinates>-1,-1,0</coordinates></Point></Placemark>
</Document></kml>"#;

const EMPTY_KML: &str = r#"<?xml version="1.0"?><kml><Document><name>vazio</name></Document></kml>"#;

fn sector_geojson(lot: &str, x: f64) -> String {
    format!(
        r#"{{"type":"FeatureCollection","features":[{{"type":"Feature","id":"{lot}",
            "geometry":{{"type":"Polygon","coordinates":[[[{x},10],[{x1},10],[{x1},11],[{x},11],[{x},10]]]}},
            "properties":{{"numero":"{lot}","setor":{{"slug":"s","nome":"Setor","cor":"4caf50"}}}}}}]}}"#,
        x1 = x + 1.0
    )
}

/// Same-origin documents keyed by static path. A path with a gate blocks its
/// fetch until the gate is opened.
#[derive(Default)]
struct MemoryOrigin {
    documents: HashMap<String, String>,
    gates: Mutex<HashMap<String, Arc<Notify>>>,
}

impl MemoryOrigin {
    fn with(mut self, path: &str, body: impl Into<String>) -> Self {
        self.documents.insert(path.to_string(), body.into());
        self
    }

    fn gate(&self, path: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.gates.lock().unwrap().insert(path.to_string(), gate.clone());
        gate
    }

    fn path_of(uri: &str) -> Option<String> {
        let url = Url::parse(uri).ok()?;
        url.query_pairs().find(|(k, _)| k == "path").map(|(_, v)| v.into_owned())
    }
}

#[async_trait]
impl DocumentHost for MemoryOrigin {
    async fn probe(&self, uri: &str) -> bool {
        Self::path_of(uri).is_some_and(|p| self.documents.contains_key(&p))
    }

    async fn fetch_raw(&self, path: &str) -> Result<Vec<u8>, LayerError> {
        self.documents
            .get(path)
            .map(|d| d.as_bytes().to_vec())
            .ok_or_else(|| LayerError::Fetch { uri: path.to_string(), reason: "missing".into() })
    }

    async fn upload(&self, _file_name: &str, _bytes: Vec<u8>) -> Result<String, LayerError> {
        Err(LayerError::Upload("offline".into()))
    }
}

#[async_trait]
impl DocumentFetcher for MemoryOrigin {
    async fn get(&self, uri: &str) -> Result<FetchedDocument, LayerError> {
        let missing = || LayerError::Fetch { uri: uri.to_string(), reason: "HTTP 404".into() };
        let path = Self::path_of(uri).ok_or_else(missing)?;
        let gate = self.gates.lock().unwrap().get(&path).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let body = self.documents.get(&path).ok_or_else(missing)?;
        Ok(FetchedDocument { bytes: body.as_bytes().to_vec(), content_type: None })
    }
}

fn config() -> EngineConfig {
    EngineConfig {
        viewport: ViewportConfig::immediate(),
        upload: UploadConfig { enabled: false, ..UploadConfig::default() },
        ..EngineConfig::default()
    }
}

fn engine(origin: Arc<MemoryOrigin>) -> MapEngine<HeadlessRenderer> {
    MapEngine::new(config(), HeadlessRenderer::new(), origin.clone(), origin)
}

fn sectors(slugs: &[&str]) -> LayerRequest {
    LayerRequest::Sectors(slugs.iter().map(|s| s.to_string()).collect())
}

fn region(a: (f64, f64), b: (f64, f64)) -> Region {
    Region::new(LngLat::new(a.0, a.1), LngLat::new(b.0, b.1))
}

#[tokio::test]
async fn reconciling_the_same_set_twice_changes_nothing() {
    let origin = MemoryOrigin::default()
        .with("/kml/setores/a.kml", sector_geojson("a1", 0.0))
        .with("/kml/setores/b.kml", sector_geojson("b1", 5.0));
    let mut engine = engine(Arc::new(origin));

    engine.request(&sectors(&["a", "b"]));
    engine.run_until_idle().await;
    let commands = engine.renderer().commands().len();

    let diff = engine.request(&sectors(&["a", "b"]));
    assert!(diff.is_noop());
    engine.run_until_idle().await;
    assert_eq!(engine.renderer().commands().len(), commands);
}

#[tokio::test]
async fn late_result_for_removed_layer_is_discarded() {
    let origin = Arc::new(
        MemoryOrigin::default()
            .with("/kml/setores/a.kml", sector_geojson("a1", 0.0))
            .with("/kml/setores/b.kml", sector_geojson("b1", 5.0)),
    );
    let gate = origin.gate("/kml/setores/a.kml");
    let mut engine = engine(origin);

    engine.request(&sectors(&["a", "b"]));
    engine.request(&sectors(&["b"]));
    gate.notify_one();
    engine.run_until_idle().await;

    let keys: Vec<&str> = engine.layers().map(|l| l.source_key.as_str()).collect();
    assert_eq!(keys, vec!["sector:b"]);
    assert_eq!(engine.renderer().layer_keys(), vec!["sector:b"]);
    assert_eq!(engine.stale_discarded(), 1);

    let fit = engine.renderer().fits().last().copied().cloned().unwrap();
    assert_eq!(fit.region, region((5.0, 10.0), (6.0, 11.0)));
}

#[tokio::test]
async fn empty_kml_loads_without_moving_the_camera() {
    let origin = MemoryOrigin::default().with(GENERAL, EMPTY_KML);
    let mut engine = engine(Arc::new(origin));

    engine.request(&LayerRequest::General);
    engine.run_until_idle().await;

    let layer = engine.layer("general").unwrap();
    assert_eq!(layer.load_state, LoadState::Loaded);
    assert!(layer.collection.as_ref().unwrap().is_empty());
    assert_eq!(layer.bounding_region, None);
    assert!(engine.renderer().fits().is_empty());
}

#[tokio::test]
async fn mixed_document_keeps_geometry_kinds_and_styles() {
    let origin = MemoryOrigin::default().with(GENERAL, MIXED_KML);
    let mut engine = engine(Arc::new(origin));

    engine.select(&MapSelection::default());
    engine.run_until_idle().await;

    let collection = engine.layer("general").unwrap().collection.clone().unwrap();
    assert_eq!(collection.len(), 5);
    let kinds: Vec<GeometryKind> = collection.features.iter().map(|f| f.geometry.kind()).collect();
    assert_eq!(kinds.iter().filter(|k| **k == GeometryKind::Polygon).count(), 3);
    assert_eq!(kinds.iter().filter(|k| **k == GeometryKind::Point).count(), 2);

    let area = engine.style_for("lote-2", 15.0).unwrap();
    assert_eq!((area.radius, area.stroke_width), (None, 2.0));
    let marker = engine.style_for("portaria", 15.0).unwrap();
    assert_eq!((marker.radius, marker.stroke_width), (Some(8.0), 1.5));
    assert_eq!(marker.fill_color, "#cccccc");

    // settle fit plus the corrective one
    let fits = engine.renderer().fits();
    assert_eq!(fits.len(), 2);
    assert_eq!(fits[0].region, region((-1.0, -1.0), (6.0, 2.0)));
    assert_eq!(fits[0].padding, 50);
}

#[tokio::test]
async fn sector_colour_without_hash_is_normalized() {
    let origin = MemoryOrigin::default().with("/kml/setores/s.kml", sector_geojson("s1", 0.0));
    let mut engine = engine(Arc::new(origin));

    engine.request(&sectors(&["s"]));
    engine.run_until_idle().await;

    let feature = engine.feature("s1").unwrap();
    assert_eq!(feature.properties.color_hex, "#4caf50");
    assert_eq!(feature.properties.label, "s1");
}

#[tokio::test]
async fn batch_of_failures_settles_without_a_fit() {
    let mut engine = engine(Arc::new(MemoryOrigin::default()));

    engine.request(&sectors(&["a", "b"]));
    engine.run_until_idle().await;

    assert!(engine.is_idle());
    assert_eq!(engine.layers().count(), 2);
    assert!(engine
        .layers()
        .all(|l| matches!(l.load_state, LoadState::Error(LayerError::Resolution { .. }))));
    assert!(engine.renderer().fits().is_empty());
    assert_eq!(engine.renderer().live_subscriptions(), 0);
}

#[tokio::test]
async fn one_failing_layer_does_not_block_the_others() {
    let origin = MemoryOrigin::default()
        .with("/kml/setores/a.kml", sector_geojson("a1", 0.0))
        .with("/kml/setores/b.kml", "{ not json");
    let mut engine = engine(Arc::new(origin));

    engine.request(&sectors(&["a", "b"]));
    engine.run_until_idle().await;

    assert_eq!(engine.layer("sector:a").unwrap().load_state, LoadState::Loaded);
    assert!(matches!(
        engine.layer("sector:b").unwrap().load_state,
        LoadState::Error(LayerError::Parse { .. })
    ));
    assert_eq!(engine.renderer().fits()[0].region, region((0.0, 10.0), (1.0, 11.0)));
}

#[tokio::test]
async fn late_bounds_refit_the_camera() {
    let origin = MemoryOrigin::default().with(GENERAL, MIXED_KML);
    let mut engine = engine(Arc::new(origin));
    engine.request(&LayerRequest::General);
    engine.run_until_idle().await;
    assert_eq!(engine.renderer().fits().len(), 2);

    engine.renderer_event(RendererEvent::BoundsChanged {
        source_key: "general".into(),
        region: region((-10.0, -10.0), (10.0, 10.0)),
    });
    let fits = engine.renderer().fits();
    assert_eq!(fits.len(), 3);
    assert_eq!(fits[2].region, region((-10.0, -10.0), (10.0, 10.0)));

    // bounds for a layer that is not loaded are ignored
    engine.renderer_event(RendererEvent::BoundsChanged {
        source_key: "sector:x".into(),
        region: region((50.0, 50.0), (60.0, 60.0)),
    });
    assert_eq!(engine.renderer().fits().len(), 3);
}

#[tokio::test]
async fn clicking_x_then_y_selects_only_y() {
    let origin = MemoryOrigin::default().with(GENERAL, MIXED_KML);
    let mut engine = engine(Arc::new(origin));
    engine.request(&LayerRequest::General);
    engine.run_until_idle().await;

    let click = engine.renderer().click_at(LngLat::new(0.5, 0.5));
    assert_eq!(click, RendererEvent::Pointer(PointerEvent::Click("lote-1".into())));
    engine.renderer_event(click);
    let click = engine.renderer().click_at(LngLat::new(2.5, 0.5));
    engine.renderer_event(click);

    assert_eq!(engine.interaction().selected_id.as_deref(), Some("lote-2"));
    assert_eq!(engine.selected_feature().unwrap().properties.label, "2");
    assert_eq!(engine.style_for("lote-2", 15.0).unwrap().opacity, 0.85);
    assert_eq!(engine.style_for("lote-1", 15.0).unwrap().opacity, 0.65);

    let hover = engine.renderer().move_to(LngLat::new(0.5, 0.5));
    engine.renderer_event(hover);
    assert_eq!(engine.style_for("lote-1", 15.0).unwrap().opacity, 0.75);

    let miss = engine.renderer().click_at(LngLat::new(40.0, 40.0));
    engine.renderer_event(miss);
    assert_eq!(engine.interaction().selected_id, None);
}

#[tokio::test]
async fn selection_survives_another_layer_loading() {
    let origin = Arc::new(
        MemoryOrigin::default()
            .with("/kml/setores/a.kml", sector_geojson("a1", 0.0))
            .with("/kml/setores/b.kml", sector_geojson("b1", 5.0)),
    );
    let gate = origin.gate("/kml/setores/b.kml");
    let mut engine = engine(origin);

    engine.request(&sectors(&["a", "b"]));
    while engine.layer("sector:a").is_some_and(|l| l.load_state == LoadState::Pending) {
        let event = engine.next_event().await.unwrap();
        engine.handle(event);
    }
    engine.renderer_event(RendererEvent::Pointer(PointerEvent::Click("a1".into())));
    engine.renderer_event(RendererEvent::Pointer(PointerEvent::Enter("a1".into())));

    gate.notify_one();
    engine.run_until_idle().await;
    assert_eq!(engine.layer("sector:b").unwrap().load_state, LoadState::Loaded);
    assert_eq!(engine.interaction().selected_id.as_deref(), Some("a1"));
    assert_eq!(engine.interaction().hovered_id.as_deref(), Some("a1"));
    assert_eq!(engine.selected_feature().unwrap().id, "a1");
}

#[tokio::test]
async fn render_failure_after_the_fit_shrinks_the_frame() {
    let origin = MemoryOrigin::default()
        .with("/kml/setores/a.kml", sector_geojson("a1", 0.0))
        .with("/kml/setores/b.kml", sector_geojson("b1", 5.0));
    let mut engine = engine(Arc::new(origin));
    engine.request(&sectors(&["a", "b"]));
    engine.run_until_idle().await;
    assert_eq!(engine.renderer().fits().last().unwrap().region, region((0.0, 10.0), (6.0, 11.0)));
    let before = engine.renderer().fits().len();

    engine.renderer_event(RendererEvent::Pointer(PointerEvent::Click("b1".into())));
    engine.renderer_event(RendererEvent::LayerStatus { source_key: "sector:b".into(), ok: false });

    let fits = engine.renderer().fits();
    assert_eq!(fits.len(), before + 1);
    assert_eq!(fits[before].region, region((0.0, 10.0), (1.0, 11.0)));
    assert_eq!(engine.interaction().selected_id, None);
    assert!(engine.feature("b1").is_none());
    engine.run_until_idle().await;
    assert_eq!(engine.renderer().fits().len(), before + 1);
}

/// The public route check and the upload both hang past any timeout.
struct StalledHost;

#[async_trait]
impl DocumentHost for StalledHost {
    async fn probe(&self, _uri: &str) -> bool {
        tokio::time::sleep(Duration::from_secs(60)).await;
        true
    }

    async fn fetch_raw(&self, _path: &str) -> Result<Vec<u8>, LayerError> {
        Ok(EMPTY_KML.as_bytes().to_vec())
    }

    async fn upload(&self, _file_name: &str, _bytes: Vec<u8>) -> Result<String, LayerError> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok("https://files.example/late.kml".into())
    }
}

#[tokio::test]
async fn stalled_host_settles_the_batch_with_resolution_errors() {
    let config = EngineConfig {
        loader: LoaderConfig { probe_timeout_ms: 20, ..LoaderConfig::default() },
        upload: UploadConfig::default(),
        ..config()
    };
    let fetcher = Arc::new(MemoryOrigin::default().with("/kml/setores/a.kml", sector_geojson("a1", 0.0)));
    let mut engine = MapEngine::new(config, HeadlessRenderer::new(), Arc::new(StalledHost), fetcher);

    engine.request(&sectors(&["a"]));
    assert!(engine.run_until_idle_for(Duration::from_secs(5)).await);

    assert!(engine.is_idle());
    assert!(matches!(
        engine.layer("sector:a").unwrap().load_state,
        LoadState::Error(LayerError::Resolution { .. })
    ));
    assert!(engine.renderer().fits().is_empty());
    assert_eq!(engine.renderer().live_subscriptions(), 0);
}

#[tokio::test]
async fn layer_changes_reset_interaction() {
    let origin = MemoryOrigin::default()
        .with(GENERAL, MIXED_KML)
        .with("/kml/setores/a.kml", sector_geojson("a1", 0.0));
    let mut engine = engine(Arc::new(origin));
    engine.request(&LayerRequest::General);
    engine.run_until_idle().await;
    engine.renderer_event(RendererEvent::Pointer(PointerEvent::Click("lote-3".into())));

    engine.request(&sectors(&["a"]));
    engine.run_until_idle().await;
    assert_eq!(engine.interaction().selected_id, None);
    assert!(engine.renderer().commands().contains(&RenderCommand::RemoveLayer { source_key: "general".into() }));
}

#[tokio::test]
async fn dispose_releases_everything() {
    let origin = Arc::new(
        MemoryOrigin::default()
            .with("/kml/setores/a.kml", sector_geojson("a1", 0.0))
            .with("/kml/setores/b.kml", sector_geojson("b1", 5.0)),
    );
    let gate = origin.gate("/kml/setores/b.kml");
    let mut engine = engine(origin);

    engine.request(&sectors(&["a", "b"]));
    while engine.layer("sector:a").is_some_and(|l| l.load_state == LoadState::Pending) {
        let event = engine.next_event().await.unwrap();
        engine.handle(event);
    }
    assert_eq!(engine.renderer().live_subscriptions(), 1);

    engine.dispose();
    assert_eq!(engine.renderer().live_subscriptions(), 0);
    assert_eq!(engine.layers().count(), 0);

    gate.notify_one();
    engine.run_until_idle().await;
    assert_eq!(engine.renderer().live_subscriptions(), 0);
    assert!(engine.request(&sectors(&["a"])).is_noop());
}

#[test]
fn sector_config_feeds_enrichment() {
    let mut config = config();
    config.documents.sectors.push(SectorConfig {
        slug: "s".into(),
        name: "Setor".into(),
        color: Some("2196F3".into()),
    });
    let lookup = lotmap::enrich::SectorLookup::from_config(&config.documents.sectors);
    assert_eq!(lookup.sector("s").unwrap().color_hex.as_deref(), Some("2196F3"));
}
