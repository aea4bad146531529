//! Event loop wiring the pipeline together.
//!
//! `MapEngine` owns the reconciler, the viewport aggregator and the
//! interaction tracker and is the only thing that mutates them. Loads and
//! fit timers run as tokio tasks that report back over one channel; the
//! caller drives the engine by feeding those events to `handle` (or with
//! `run_until_idle`).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::enrich::{enrich_collection, SectorLookup};
use crate::interaction::{style_of, FeatureStyle, InteractionState, InteractionTracker};
use crate::loader::{load_document, DocumentFetcher, HttpDocumentHost};
use crate::reconcile::{Completion, LayerSource, LoadOutcome, LoadRequest, LoadState, ReconcileDiff, Reconciler};
use crate::render::{MapRenderer, RendererEvent};
use crate::resolver::{resolve, DocumentHost, LayerRequest, MapSelection, Resolver};
use crate::types::Feature;
use crate::viewport::{BatchId, FitPhase, ScheduledFit, ViewportAggregator};

#[derive(Debug)]
pub enum EngineEvent {
    LoadFinished(LoadOutcome),
    FitDue { batch: BatchId, phase: FitPhase },
    Renderer(RendererEvent),
}

pub struct MapEngine<R: MapRenderer> {
    config: EngineConfig,
    resolver: Resolver,
    reconciler: Reconciler,
    aggregator: ViewportAggregator,
    tracker: InteractionTracker,
    renderer: R,
    host: Arc<dyn DocumentHost>,
    fetcher: Arc<dyn DocumentFetcher>,
    sectors: Arc<SectorLookup>,
    tx: UnboundedSender<EngineEvent>,
    rx: UnboundedReceiver<EngineEvent>,
    timers: Vec<JoinHandle<()>>,
    in_flight: usize,
    pending_fits: usize,
    disposed: bool,
}

impl<R: MapRenderer> MapEngine<R> {
    pub fn new(
        config: EngineConfig,
        renderer: R,
        host: Arc<dyn DocumentHost>,
        fetcher: Arc<dyn DocumentFetcher>,
    ) -> Self {
        let (tx, rx) = unbounded_channel();
        Self {
            resolver: Resolver::new(&config),
            reconciler: Reconciler::new(),
            aggregator: ViewportAggregator::new(config.viewport.clone()),
            tracker: InteractionTracker::new(),
            sectors: Arc::new(SectorLookup::from_config(&config.documents.sectors)),
            renderer,
            host,
            fetcher,
            tx,
            rx,
            timers: Vec::new(),
            in_flight: 0,
            pending_fits: 0,
            disposed: false,
            config,
        }
    }

    /// Engine talking HTTP to the configured origin.
    pub fn http(config: EngineConfig, renderer: R) -> Result<Self, reqwest::Error> {
        let host = Arc::new(HttpDocumentHost::new(&config)?);
        Ok(Self::new(config, renderer, host.clone(), host))
    }

    /// Replaces the sector/parcel-status lookup used by loads started from now on.
    pub fn with_sectors(mut self, sectors: SectorLookup) -> Self {
        self.sectors = Arc::new(sectors);
        self
    }

    pub fn select(&mut self, selection: &MapSelection) -> ReconcileDiff {
        self.request(&selection.request())
    }

    /// Reconciles the layer set against `request` and starts loads for new
    /// layers. Must be called from within a tokio runtime.
    pub fn request(&mut self, request: &LayerRequest) -> ReconcileDiff {
        if self.disposed {
            warn!("request on a disposed engine ignored");
            return ReconcileDiff::default();
        }

        let stubs = self.resolver.plan(request);
        let desired: Vec<String> = stubs.iter().map(|s| s.source_key.clone()).collect();
        let diff = self.reconciler.reconcile(stubs, &mut self.renderer);
        if diff.is_noop() {
            debug!("layer set unchanged");
            return diff;
        }

        for key in &diff.removed {
            self.aggregator.remove_region(key);
        }
        if !diff.removed.is_empty() {
            self.prune_interaction();
        }

        let settled: Vec<String> = diff
            .unchanged
            .iter()
            .filter(|k| self.reconciler.get(k).is_some_and(|l| l.load_state.is_settled()))
            .cloned()
            .collect();
        let (batch, scheduled) = self.aggregator.begin_batch(desired, settled);
        info!(
            ?batch,
            added = diff.to_load.len(),
            removed = diff.removed.len(),
            unchanged = diff.unchanged.len(),
            "layer set reconciled"
        );
        if let Some(fit) = scheduled {
            self.schedule(fit);
        }

        for load in &diff.to_load {
            self.spawn_load(load.clone());
        }
        diff
    }

    fn spawn_load(&mut self, load: LoadRequest) {
        let tx = self.tx.clone();
        let host = self.host.clone();
        let fetcher = self.fetcher.clone();
        let sectors = self.sectors.clone();
        let probe_timeout = self.config.loader.probe_timeout();
        let fetch_timeout = self.config.loader.fetch_timeout();
        self.in_flight += 1;

        tokio::spawn(async move {
            let LoadRequest { ticket, stub } = load;
            debug!(key = %stub.source_key, "load started");
            let outcome = match resolve(&stub, host.as_ref(), probe_timeout).await {
                Ok(uri) => {
                    let result = load_document(fetcher.as_ref(), &uri, fetch_timeout, &stub.source_key)
                        .await
                        .map(|report| (enrich_collection(&report.collection, &sectors), report.dropped));
                    LoadOutcome { source_key: stub.source_key, ticket, document_uri: Some(uri), result }
                }
                Err(e) => LoadOutcome { source_key: stub.source_key, ticket, document_uri: None, result: Err(e) },
            };
            // the receiver only goes away with the engine
            let _ = tx.send(EngineEvent::LoadFinished(outcome));
        });
    }

    /// Hover and selection survive layer changes as long as their feature is
    /// still on a loaded layer.
    fn prune_interaction(&mut self) {
        let reconciler = &self.reconciler;
        if self.tracker.prune(|id| loaded_feature(reconciler, id).is_some()) {
            debug!(state = ?self.tracker.state(), "interaction pruned after layer change");
        }
    }

    fn schedule(&mut self, fit: ScheduledFit) {
        self.pending_fits += 1;
        let event = EngineEvent::FitDue { batch: fit.batch, phase: fit.phase };
        if fit.delay.is_zero() {
            let _ = self.tx.send(event);
            return;
        }
        let tx = self.tx.clone();
        self.timers.retain(|t| !t.is_finished());
        self.timers.push(tokio::spawn(async move {
            tokio::time::sleep(fit.delay).await;
            let _ = tx.send(event);
        }));
    }

    pub fn handle(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::LoadFinished(outcome) => {
                self.in_flight = self.in_flight.saturating_sub(1);
                if self.disposed {
                    debug!(key = %outcome.source_key, "load finished after dispose; ignored");
                    return;
                }
                if let Some(uri) = &outcome.document_uri {
                    self.resolver.remember(&outcome.source_key, uri);
                }
                match self.reconciler.complete(outcome, &mut self.renderer) {
                    Completion::Settled { source_key, loaded, region } => {
                        if loaded {
                            self.prune_interaction();
                        }
                        if let Some(fit) = self.aggregator.layer_settled(&source_key, region) {
                            self.schedule(fit);
                        }
                    }
                    Completion::Stale { .. } => {}
                }
            }
            EngineEvent::FitDue { batch, phase } => {
                self.pending_fits = self.pending_fits.saturating_sub(1);
                if self.disposed {
                    return;
                }
                let (fit, next) = self.aggregator.fit_due(batch, phase);
                if let Some(fit) = fit {
                    info!(?phase, region = ?fit.region, "fitting camera");
                    self.renderer.fit_bounds(&fit);
                }
                if let Some(next) = next {
                    self.schedule(next);
                }
            }
            EngineEvent::Renderer(event) => self.renderer_event(event),
        }
    }

    /// Inward events from the renderer.
    pub fn renderer_event(&mut self, event: RendererEvent) {
        if self.disposed {
            return;
        }
        match event {
            RendererEvent::LayerStatus { source_key, ok: true } => {
                debug!(key = %source_key, "renderer reports layer ready");
            }
            RendererEvent::LayerStatus { source_key, ok: false } => {
                if self.reconciler.mark_render_failed(&source_key, &mut self.renderer) {
                    self.prune_interaction();
                    let (refit, scheduled) = self.aggregator.forget(&source_key);
                    if let Some(fit) = refit {
                        info!(key = %source_key, region = ?fit.region, "layer failed after fit; refitting");
                        self.renderer.fit_bounds(&fit);
                    }
                    if let Some(fit) = scheduled {
                        self.schedule(fit);
                    }
                }
            }
            RendererEvent::BoundsChanged { source_key, region } => {
                if self.reconciler.update_bounds(&source_key, region) {
                    if let Some(fit) = self.aggregator.bounds_changed(&source_key, region) {
                        self.renderer.fit_bounds(&fit);
                    }
                }
            }
            RendererEvent::Pointer(pointer) => {
                self.tracker.apply(pointer);
            }
        }
    }

    pub fn sender(&self) -> UnboundedSender<EngineEvent> {
        self.tx.clone()
    }

    pub async fn next_event(&mut self) -> Option<EngineEvent> {
        self.rx.recv().await
    }

    /// Processes events until no load is in flight and no fit is pending.
    pub async fn run_until_idle(&mut self) {
        while !self.is_idle() {
            match self.rx.recv().await {
                Some(event) => self.handle(event),
                None => break,
            }
        }
    }

    /// Like `run_until_idle`, bounded by `limit`. Returns false on timeout.
    pub async fn run_until_idle_for(&mut self, limit: Duration) -> bool {
        tokio::time::timeout(limit, self.run_until_idle()).await.is_ok()
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight == 0 && self.pending_fits == 0
    }

    pub fn layers(&self) -> impl Iterator<Item = &LayerSource> {
        self.reconciler.layers()
    }

    pub fn layer(&self, key: &str) -> Option<&LayerSource> {
        self.reconciler.get(key)
    }

    pub fn stale_discarded(&self) -> usize {
        self.reconciler.stale_discarded()
    }

    pub fn interaction(&self) -> &InteractionState {
        self.tracker.state()
    }

    /// Looks `id` up across loaded layers only.
    pub fn feature(&self, id: &str) -> Option<&Feature> {
        loaded_feature(&self.reconciler, id)
    }

    pub fn selected_feature(&self) -> Option<&Feature> {
        self.feature(self.tracker.state().selected_id.as_deref()?)
    }

    pub fn style_for(&self, id: &str, zoom: f64) -> Option<FeatureStyle> {
        self.feature(id).map(|f| style_of(f, self.tracker.state(), zoom))
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    pub fn renderer_mut(&mut self) -> &mut R {
        &mut self.renderer
    }

    /// Tears down every layer and timer; results still in flight are
    /// dropped when they arrive.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        for timer in self.timers.drain(..) {
            timer.abort();
        }
        self.pending_fits = 0;
        self.reconciler.dispose(&mut self.renderer);
        self.aggregator.reset();
        self.tracker.reset();
        info!("engine disposed");
    }
}

fn loaded_feature<'a>(reconciler: &'a Reconciler, id: &str) -> Option<&'a Feature> {
    reconciler
        .layers()
        .filter(|l| l.load_state == LoadState::Loaded)
        .filter_map(|l| l.collection.as_deref())
        .find_map(|c| c.get(id))
}

impl<R: MapRenderer> Drop for MapEngine<R> {
    fn drop(&mut self) {
        for timer in &self.timers {
            timer.abort();
        }
    }
}
