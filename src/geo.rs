//! Great-circle geometry helpers.
//!
//! Distances are straight-line over a spherical Earth. Route proximity is
//! measured against polyline vertices only, never against segment
//! projections, so sparse polylines read as further away than they are.

use serde::{Deserialize, Serialize};

/// Mean Earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// A WGS84 coordinate pair in decimal degrees.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// Haversine distance between two points, in meters.
pub fn distance(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_M * c
}

/// Smallest vertex distance from `point` to `coords`.
///
/// Returns `f64::INFINITY` for an empty polyline.
pub fn min_distance_to_polyline(point: GeoPoint, coords: &[GeoPoint]) -> f64 {
    coords
        .iter()
        .map(|c| distance(point, *c))
        .fold(f64::INFINITY, f64::min)
}

#[cfg(test)]
mod tests {
    use super::*;

    const UTRECHT: GeoPoint = GeoPoint {
        lat: 52.0894,
        lon: 5.1100,
    };
    const AMSTERDAM: GeoPoint = GeoPoint {
        lat: 52.3791,
        lon: 4.9003,
    };

    #[test]
    fn distance_is_symmetric() {
        let ab = distance(UTRECHT, AMSTERDAM);
        let ba = distance(AMSTERDAM, UTRECHT);
        assert!((ab - ba).abs() < 1e-6);
    }

    #[test]
    fn distance_to_self_is_zero() {
        assert_eq!(distance(UTRECHT, UTRECHT), 0.0);
    }

    #[test]
    fn utrecht_to_amsterdam_is_roughly_35km() {
        let d = distance(UTRECHT, AMSTERDAM);
        assert!(d > 34_000.0 && d < 36_000.0, "got {d}");
    }

    #[test]
    fn one_degree_of_latitude_is_about_111km() {
        let d = distance(GeoPoint::new(0.0, 0.0), GeoPoint::new(1.0, 0.0));
        assert!((d - 111_195.0).abs() < 10.0, "got {d}");
    }

    #[test]
    fn empty_polyline_is_infinitely_far() {
        assert!(min_distance_to_polyline(UTRECHT, &[]).is_infinite());
    }

    #[test]
    fn polyline_distance_is_the_nearest_vertex() {
        let coords = [AMSTERDAM, GeoPoint::new(52.2, 5.0), UTRECHT];
        let point = GeoPoint::new(52.09, 5.11);
        let min = min_distance_to_polyline(point, &coords);
        for c in &coords {
            assert!(min <= distance(point, *c));
        }
        assert_eq!(min, distance(point, UTRECHT));
    }
}
