//! Flat-earth approximations, good to a few decimeters over the few hundred
//! meters a cluster flies. Not meant for anything geodetic.

use crate::GeoPoint;

/// Radius of the "spherical" earth used for metre offsets.
pub const EARTH_RADIUS_M: f64 = 6378137.0;

/// Ground distance between two points in meters: equirectangular projection
/// around the mean latitude of the pair.
pub fn planar_distance_m(a: GeoPoint, b: GeoPoint) -> f64 {
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lon = (b.lon - a.lon).to_radians();
    let mean_lat = ((a.lat + b.lat) / 2.0).to_radians();
    let x = d_lon * mean_lat.cos();
    EARTH_RADIUS_M * (d_lat * d_lat + x * x).sqrt()
}

/// The point `north`/`east` meters away from `origin`.
pub fn offset_by_meters(origin: GeoPoint, north: f64, east: f64) -> GeoPoint {
    let d_lat = north / EARTH_RADIUS_M;
    let d_lon = east / (EARTH_RADIUS_M * (std::f64::consts::PI * origin.lat / 180.0).cos());
    GeoPoint::new(origin.lat + d_lat.to_degrees(), origin.lon + d_lon.to_degrees())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_then_measure_round_trips() {
        let origin = GeoPoint::new(31.8872318, 118.8193952);
        let target = offset_by_meters(origin, 30.0, 40.0);
        let d = planar_distance_m(origin, target);
        assert!((d - 50.0).abs() < 0.5, "distance was {d}");
    }

    #[test]
    fn east_west_legs_shrink_with_latitude() {
        let origin = GeoPoint::new(60.0, 10.0);
        let east = offset_by_meters(origin, 0.0, 100.0);
        let d = planar_distance_m(origin, east);
        assert!((d - 100.0).abs() < 1.0, "distance was {d}");

        // one degree of longitude at 60N is half of one at the equator
        let at_equator = planar_distance_m(GeoPoint::new(0.0, 10.0), GeoPoint::new(0.0, 11.0));
        let at_sixty = planar_distance_m(GeoPoint::new(60.0, 10.0), GeoPoint::new(60.0, 11.0));
        assert!((at_sixty / at_equator - 0.5).abs() < 1e-9);
        assert!((at_equator - 111_319.49).abs() < 0.1);
    }

    #[test]
    fn zero_offset_is_identity() {
        let origin = GeoPoint::new(10.0, 20.0);
        assert_eq!(offset_by_meters(origin, 0.0, 0.0), origin);
        assert_eq!(planar_distance_m(origin, origin), 0.0);
    }
}
