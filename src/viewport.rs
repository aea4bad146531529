//! Camera framing over the union of every loaded layer's region.
//!
//! A batch is the desired set of one reconciliation pass. Once every member
//! has settled (loaded or failed) a fit is scheduled after the settle delay,
//! and a second corrective fit after a further delay. Regions that arrive or
//! disappear after the batch was fitted trigger an immediate refit.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use tracing::{debug, info};

use crate::config::ViewportConfig;
use crate::render::FitCommand;
use crate::types::Region;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitPhase {
    Settle,
    Corrective,
}

/// A fit the caller must fire back through `fit_due` once `delay` elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledFit {
    pub batch: BatchId,
    pub phase: FitPhase,
    pub delay: Duration,
}

#[derive(Debug)]
struct Batch {
    id: BatchId,
    members: BTreeSet<String>,
    settled: BTreeSet<String>,
    scheduled: bool,
    fitted: bool,
}

impl Batch {
    fn complete(&self) -> bool {
        self.members.iter().all(|m| self.settled.contains(m))
    }
}

#[derive(Debug)]
pub struct ViewportAggregator {
    config: ViewportConfig,
    regions: BTreeMap<String, Region>,
    batch: Option<Batch>,
    next_batch: u64,
    last_fit: Option<Region>,
}

impl ViewportAggregator {
    pub fn new(config: ViewportConfig) -> Self {
        Self { config, regions: BTreeMap::new(), batch: None, next_batch: 0, last_fit: None }
    }

    /// Starts a batch over `members`, superseding any earlier one and its
    /// timers. `already_settled` are members that finished in an earlier pass.
    pub fn begin_batch<I, J>(&mut self, members: I, already_settled: J) -> (BatchId, Option<ScheduledFit>)
    where
        I: IntoIterator<Item = String>,
        J: IntoIterator<Item = String>,
    {
        self.next_batch += 1;
        let id = BatchId(self.next_batch);
        let members: BTreeSet<String> = members.into_iter().collect();
        let settled = already_settled.into_iter().filter(|k| members.contains(k)).collect();
        debug!(batch = id.0, size = members.len(), "viewport batch started");
        self.batch = Some(Batch { id, members, settled, scheduled: false, fitted: false });
        (id, self.schedule_if_complete())
    }

    /// Drops a layer's region without touching batch bookkeeping, for a
    /// reconcile pass that is about to start a new batch anyway.
    pub fn remove_region(&mut self, key: &str) {
        self.regions.remove(key);
    }

    /// A layer stopped contributing (left the batch or failed after loading).
    /// Once the batch has been fitted this refits to the smaller union;
    /// before that it may complete the batch instead.
    pub fn forget(&mut self, key: &str) -> (Option<FitCommand>, Option<ScheduledFit>) {
        let had_region = self.regions.remove(key).is_some();
        if let Some(batch) = self.batch.as_mut() {
            batch.members.remove(key);
            batch.settled.remove(key);
        }
        let refit = if had_region { self.refit_if_moved() } else { None };
        (refit, self.schedule_if_complete())
    }

    /// A member reached `Loaded` or `Error`. `region` is `None` for failed or
    /// empty layers.
    pub fn layer_settled(&mut self, key: &str, region: Option<Region>) -> Option<ScheduledFit> {
        if let Some(region) = region.and_then(Region::non_empty) {
            self.regions.insert(key.to_string(), region);
        }
        let batch = self.batch.as_mut()?;
        if batch.members.contains(key) {
            batch.settled.insert(key.to_string());
        }
        self.schedule_if_complete()
    }

    fn schedule_if_complete(&mut self) -> Option<ScheduledFit> {
        let batch = self.batch.as_mut()?;
        if batch.scheduled || !batch.complete() {
            return None;
        }
        batch.scheduled = true;
        info!(batch = batch.id.0, layers = batch.members.len(), "batch settled");
        Some(ScheduledFit { batch: batch.id, phase: FitPhase::Settle, delay: self.config.settle_delay() })
    }

    /// Timer callback. Timers of superseded batches yield nothing.
    pub fn fit_due(&mut self, batch: BatchId, phase: FitPhase) -> (Option<FitCommand>, Option<ScheduledFit>) {
        match self.batch.as_mut() {
            Some(current) if current.id == batch => current.fitted = true,
            _ => {
                debug!(batch = batch.0, ?phase, "fit timer for superseded batch ignored");
                return (None, None);
            }
        }

        let Some(fit) = self.fit_command() else {
            debug!(batch = batch.0, "no layer has a region; viewport left as is");
            return (None, None);
        };
        self.last_fit = Some(fit.region);
        let next = match phase {
            FitPhase::Settle => Some(ScheduledFit {
                batch,
                phase: FitPhase::Corrective,
                delay: self.config.corrective_delay(),
            }),
            FitPhase::Corrective => None,
        };
        (Some(fit), next)
    }

    /// A loaded layer reported its region late. Before the batch has been
    /// fitted the region is only recorded; afterwards it refits if the union
    /// moved.
    pub fn bounds_changed(&mut self, key: &str, region: Region) -> Option<FitCommand> {
        let region = region.non_empty()?;
        if self.regions.get(key) == Some(&region) {
            return None;
        }
        self.regions.insert(key.to_string(), region);

        let refit = self.refit_if_moved();
        if refit.is_some() {
            info!(key, "late layer bounds; refitting");
        }
        refit
    }

    /// A fit over the current union, only once the batch has been fitted and
    /// only when the union differs from the last fit.
    fn refit_if_moved(&mut self) -> Option<FitCommand> {
        if !self.batch.as_ref().is_some_and(|b| b.fitted) {
            return None;
        }
        let fit = self.fit_command()?;
        if self.last_fit == Some(fit.region) {
            return None;
        }
        self.last_fit = Some(fit.region);
        Some(fit)
    }

    pub fn union(&self) -> Option<Region> {
        self.regions
            .values()
            .fold(Region::EMPTY, |acc, r| acc.union(r))
            .non_empty()
    }

    fn fit_command(&self) -> Option<FitCommand> {
        Some(FitCommand {
            region: self.union()?,
            padding: self.config.padding,
            max_zoom: self.config.max_zoom,
        })
    }

    pub fn is_settled(&self) -> bool {
        self.batch.as_ref().map_or(true, Batch::complete)
    }

    pub fn current_batch(&self) -> Option<BatchId> {
        self.batch.as_ref().map(|b| b.id)
    }

    pub fn reset(&mut self) {
        self.regions.clear();
        self.batch = None;
        self.last_fit = None;
    }
}
