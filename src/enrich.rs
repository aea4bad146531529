//! Display attributes derived from what a document declared.
//!
//! Every derived field is recomputed from `FeatureProperties::declared` (plus
//! the sector/status lookups), never from a previously derived value, so
//! enriching twice gives the same feature.

use std::collections::HashMap;

use rayon::prelude::*;

use crate::config::SectorConfig;
use crate::types::{Feature, FeatureCollection, ParcelStatus, SectorRef, DEFAULT_COLOR};

/// What the enricher knows beyond the document itself: sector metadata
/// and, for backend-linked parcels, their current status.
#[derive(Debug, Clone, Default)]
pub struct SectorLookup {
    sectors: HashMap<String, SectorRef>,
    parcel_status: HashMap<String, ParcelStatus>,
}

impl SectorLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(sectors: &[SectorConfig]) -> Self {
        let mut lookup = Self::new();
        for s in sectors {
            lookup.insert_sector(SectorRef {
                id: s.slug.clone(),
                name: s.name.clone(),
                slug: s.slug.clone(),
                color_hex: s.color.clone(),
            });
        }
        lookup
    }

    /// Indexed by both id and slug, since documents reference either.
    pub fn insert_sector(&mut self, sector: SectorRef) {
        self.sectors.insert(sector.id.clone(), sector.clone());
        self.sectors.insert(sector.slug.clone(), sector);
    }

    pub fn set_parcel_status(&mut self, parcel_id: impl Into<String>, status: ParcelStatus) {
        self.parcel_status.insert(parcel_id.into(), status);
    }

    pub fn sector(&self, key: &str) -> Option<&SectorRef> {
        self.sectors.get(key)
    }

    fn resolve_sector(&self, declared: &SectorRef) -> Option<&SectorRef> {
        self.sectors.get(&declared.slug).or_else(|| self.sectors.get(&declared.id))
    }
}

/// `#RRGGBB` (lowercase) for any six- or three-digit hex input, with or
/// without the leading `#`. Anything else is not a colour.
pub fn normalize_color(raw: &str) -> Option<String> {
    let hex = raw.trim().trim_start_matches('#');
    if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    match hex.len() {
        6 => Some(format!("#{}", hex.to_ascii_lowercase())),
        3 => {
            let doubled: String = hex.chars().flat_map(|c| [c, c]).collect();
            Some(format!("#{}", doubled.to_ascii_lowercase()))
        }
        _ => None,
    }
}

/// Feature colour, then sector colour (the feature's own sector reference,
/// then the lookup's copy of that sector), then the default gray.
fn resolve_color(feature: &Feature, sectors: &SectorLookup) -> String {
    let declared = feature.properties.declared.color.as_deref();
    let sector = feature.properties.sector.as_ref();
    let sector_color = sector.and_then(|s| s.color_hex.as_deref());
    let looked_up = sector
        .and_then(|s| sectors.resolve_sector(s))
        .and_then(|s| s.color_hex.as_deref());

    [declared, sector_color, looked_up]
        .into_iter()
        .flatten()
        .find_map(normalize_color)
        .unwrap_or_else(|| DEFAULT_COLOR.to_string())
}

pub fn enrich(feature: &Feature, index: usize, sectors: &SectorLookup) -> Feature {
    let mut out = feature.clone();
    let props = &mut out.properties;

    props.color_hex = resolve_color(feature, sectors);

    props.label = props
        .declared
        .name
        .clone()
        .unwrap_or_else(|| format!("Lote {}", index + 1));

    props.status = sectors
        .parcel_status
        .get(&props.parcel_id)
        .copied()
        .or_else(|| props.declared.status.as_deref().and_then(ParcelStatus::parse))
        .unwrap_or(ParcelStatus::Available);

    if let Some(full) = props.sector.as_ref().and_then(|s| sectors.resolve_sector(s)) {
        let declared = props.sector.take();
        props.sector = Some(SectorRef {
            color_hex: declared
                .as_ref()
                .and_then(|s| s.color_hex.clone())
                .or_else(|| full.color_hex.clone()),
            ..full.clone()
        });
    }

    out
}

/// Enriches a whole collection; the index used for synthesized labels is
/// the feature's position in the collection.
pub fn enrich_collection(collection: &FeatureCollection, sectors: &SectorLookup) -> FeatureCollection {
    let features = collection
        .features
        .par_iter()
        .enumerate()
        .map(|(index, feature)| enrich(feature, index, sectors))
        .collect();
    FeatureCollection::new(features)
}

/// Legend entries for status colouring in side panels.
pub fn status_legend() -> [(ParcelStatus, &'static str, &'static str); 4] {
    [
        (ParcelStatus::Available, "#4caf50", ParcelStatus::Available.label()),
        (ParcelStatus::Reserved, "#ff9800", ParcelStatus::Reserved.label()),
        (ParcelStatus::Sold, "#f44336", ParcelStatus::Sold.label()),
        (ParcelStatus::Unavailable, "#9e9e9e", ParcelStatus::Unavailable.label()),
    ]
}
