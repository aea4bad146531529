//! Per-kind behaviour for the geometries the engine renders.
//!
//! Everything that differs between points and polygons (bounds extraction,
//! which style family applies, which renderer primitive is built) is answered
//! here, through one exhaustive match per question.

use geo::BoundingRect;
use serde::Serialize;

use crate::types::{Geometry, LngLat, Region};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum GeometryKind {
    Point,
    Polygon,
    MultiPolygon,
}

/// Style families. Polygons and multi-polygons share fill + outline styling;
/// points get radius-based circles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StyleFamily {
    Area,
    Marker,
}

/// Zoom -> radius stops for point markers, interpolated linearly.
pub const POINT_RADIUS_STOPS: [(f64, f64); 3] = [(10.0, 5.0), (15.0, 8.0), (20.0, 12.0)];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Primitive {
    FillWithOutline { rings: Vec<Vec<[f64; 2]>> },
    Circle { center: [f64; 2] },
}

impl Geometry {
    pub fn kind(&self) -> GeometryKind {
        match self {
            Geometry::Point(_) => GeometryKind::Point,
            Geometry::Polygon(_) => GeometryKind::Polygon,
            Geometry::MultiPolygon(_) => GeometryKind::MultiPolygon,
        }
    }

    pub fn bounds(&self) -> Region {
        let rect = match self {
            Geometry::Point(p) => Some(p.bounding_rect()),
            Geometry::Polygon(p) => p.bounding_rect(),
            Geometry::MultiPolygon(mp) => mp.bounding_rect(),
        };
        rect.map(Region::from).unwrap_or(Region::EMPTY)
    }

    pub fn primitive(&self) -> Primitive {
        match self {
            Geometry::Point(p) => Primitive::Circle { center: [p.x(), p.y()] },
            Geometry::Polygon(p) => Primitive::FillWithOutline {
                rings: vec![exterior_ring(p)],
            },
            Geometry::MultiPolygon(mp) => Primitive::FillWithOutline {
                rings: mp.iter().map(exterior_ring).collect(),
            },
        }
    }

    /// Representative position, used for labels and point hit-testing.
    pub fn anchor(&self) -> LngLat {
        match self {
            Geometry::Point(p) => LngLat::new(p.x(), p.y()),
            _ => {
                let b = self.bounds();
                LngLat::new(
                    (b.south_west.lng + b.north_east.lng) / 2.0,
                    (b.south_west.lat + b.north_east.lat) / 2.0,
                )
            }
        }
    }
}

impl GeometryKind {
    pub fn style_family(self) -> StyleFamily {
        match self {
            GeometryKind::Point => StyleFamily::Marker,
            GeometryKind::Polygon | GeometryKind::MultiPolygon => StyleFamily::Area,
        }
    }
}

fn exterior_ring(p: &geo::Polygon<f64>) -> Vec<[f64; 2]> {
    p.exterior().coords().map(|c| [c.x, c.y]).collect()
}

pub fn point_radius(zoom: f64) -> f64 {
    let (first_zoom, first_radius) = POINT_RADIUS_STOPS[0];
    if zoom <= first_zoom {
        return first_radius;
    }
    for pair in POINT_RADIUS_STOPS.windows(2) {
        let (z0, r0) = pair[0];
        let (z1, r1) = pair[1];
        if zoom <= z1 {
            return r0 + (zoom - z0) / (z1 - z0) * (r1 - r0);
        }
    }
    POINT_RADIUS_STOPS[POINT_RADIUS_STOPS.len() - 1].1
}
