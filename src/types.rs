use geo::{MultiPolygon, Point, Polygon};
use serde::{Deserialize, Serialize};

pub const DEFAULT_COLOR: &str = "#cccccc";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LngLat {
    pub lng: f64,
    pub lat: f64,
}

impl LngLat {
    pub fn new(lng: f64, lat: f64) -> Self {
        Self { lng, lat }
    }
}

/// Axis-aligned geographic bounding box.
///
/// The empty region has its corners inverted to +/- infinity, which makes it
/// the identity of `union` without a special case.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub south_west: LngLat,
    pub north_east: LngLat,
}

impl Region {
    pub const EMPTY: Region = Region {
        south_west: LngLat { lng: f64::INFINITY, lat: f64::INFINITY },
        north_east: LngLat { lng: f64::NEG_INFINITY, lat: f64::NEG_INFINITY },
    };

    pub fn new(south_west: LngLat, north_east: LngLat) -> Self {
        Self { south_west, north_east }
    }

    pub fn from_point(p: LngLat) -> Self {
        Self { south_west: p, north_east: p }
    }

    pub fn is_empty(&self) -> bool {
        self.south_west.lng > self.north_east.lng || self.south_west.lat > self.north_east.lat
    }

    pub fn union(&self, other: &Region) -> Region {
        Region {
            south_west: LngLat {
                lng: self.south_west.lng.min(other.south_west.lng),
                lat: self.south_west.lat.min(other.south_west.lat),
            },
            north_east: LngLat {
                lng: self.north_east.lng.max(other.north_east.lng),
                lat: self.north_east.lat.max(other.north_east.lat),
            },
        }
    }

    pub fn extend(&mut self, p: LngLat) {
        *self = self.union(&Region::from_point(p));
    }

    pub fn contains(&self, p: LngLat) -> bool {
        !self.is_empty()
            && p.lng >= self.south_west.lng
            && p.lng <= self.north_east.lng
            && p.lat >= self.south_west.lat
            && p.lat <= self.north_east.lat
    }

    /// `None` for the empty region, so callers never hand infinities to a renderer.
    pub fn non_empty(self) -> Option<Region> {
        (!self.is_empty()).then_some(self)
    }
}

impl Default for Region {
    fn default() -> Self {
        Region::EMPTY
    }
}

impl From<geo::Rect<f64>> for Region {
    fn from(rect: geo::Rect<f64>) -> Self {
        Region {
            south_west: LngLat::new(rect.min().x, rect.min().y),
            north_east: LngLat::new(rect.max().x, rect.max().y),
        }
    }
}

/// Geometry kinds the engine renders. Anything else never makes it past
/// the normalizer, so there is no `Unsupported` variant to re-check downstream.
#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    Point(Point<f64>),
    Polygon(Polygon<f64>),
    MultiPolygon(MultiPolygon<f64>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParcelStatus {
    Available,
    Reserved,
    Sold,
    Unavailable,
}

impl ParcelStatus {
    /// Accepts both the backend's Portuguese codes and the English names.
    pub fn parse(code: &str) -> Option<Self> {
        match code.trim().to_lowercase().as_str() {
            "disponivel" | "available" => Some(ParcelStatus::Available),
            "reservado" | "reserved" => Some(ParcelStatus::Reserved),
            "vendido" | "sold" => Some(ParcelStatus::Sold),
            "indisponivel" | "unavailable" => Some(ParcelStatus::Unavailable),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ParcelStatus::Available => "Disponível",
            ParcelStatus::Reserved => "Reservado",
            ParcelStatus::Sold => "Vendido",
            ParcelStatus::Unavailable => "Indisponível",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectorRef {
    pub id: String,
    pub name: String,
    pub slug: String,
    pub color_hex: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Description {
    pub raw: String,
    pub text: String,
}

/// Attributes exactly as the source document declared them. The enricher
/// derives the display fields from these, which is what keeps it idempotent.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeclaredAttributes {
    pub name: Option<String>,
    pub color: Option<String>,
    pub status: Option<String>,
    pub description: Option<Description>,
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureProperties {
    pub parcel_id: String,
    pub label: String,
    pub status: ParcelStatus,
    pub sector: Option<SectorRef>,
    pub color_hex: String,
    pub declared: DeclaredAttributes,
}

impl FeatureProperties {
    pub fn new(parcel_id: impl Into<String>) -> Self {
        Self {
            parcel_id: parcel_id.into(),
            label: String::new(),
            status: ParcelStatus::Available,
            sector: None,
            color_hex: DEFAULT_COLOR.to_string(),
            declared: DeclaredAttributes::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub id: String,
    pub geometry: Geometry,
    pub properties: FeatureProperties,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct FeatureCollection {
    pub features: Vec<Feature>,
}

impl FeatureCollection {
    pub fn new(features: Vec<Feature>) -> Self {
        Self { features }
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn get(&self, id: &str) -> Option<&Feature> {
        self.features.iter().find(|f| f.id == id)
    }

    /// Union of every feature's bounds; `None` for an empty collection.
    pub fn bounding_region(&self) -> Option<Region> {
        self.features
            .iter()
            .map(|f| f.geometry.bounds())
            .fold(Region::EMPTY, |acc, r| acc.union(&r))
            .non_empty()
    }
}
