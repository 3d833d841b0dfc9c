//! Distance helpers for stop proximity checks.

use geo::{HaversineDistance, Point};

/// Length of one degree of latitude, in meters
const METERS_PER_DEGREE: f64 = 111_320.0;

/// Great-circle distance in meters
pub fn haversine_distance(p1: Point, p2: Point) -> f64 {
    p1.haversine_distance(&p2)
}

/// Meters expressed as degrees of latitude
pub fn meters_to_degrees_approx(meters: f64) -> f64 {
    meters / METERS_PER_DEGREE
}

/// Planar search radius in degrees that covers `radius_m` in every direction
/// around `latitude`.
///
/// Longitude degrees shrink towards the poles, so the radius is widened by
/// the inverse cosine. Clamped near the poles.
pub fn search_radius_degrees(radius_m: f64, latitude: f64) -> f64 {
    let scale = latitude.to_radians().cos().abs().max(0.01);
    meters_to_degrees_approx(radius_m) / scale
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_hop() {
        // 0.001 degrees of latitude
        let a = Point::new(106.70, 10.770);
        let b = Point::new(106.70, 10.771);
        approx::assert_abs_diff_eq!(haversine_distance(a, b), 111.2, epsilon = 0.5);
    }

    #[test]
    fn test_same_point() {
        let gate = Point::new(106.70, 10.77);
        approx::assert_abs_diff_eq!(haversine_distance(gate, gate), 0.0);
    }

    #[test]
    fn test_search_radius_widens_with_latitude() {
        let equator = search_radius_degrees(50.0, 0.0);
        approx::assert_relative_eq!(equator, 50.0 / 111_320.0);
        approx::assert_relative_eq!(search_radius_degrees(50.0, 60.0), equator * 2.0, epsilon = 1e-9);
        assert!(search_radius_degrees(50.0, 90.0).is_finite());
    }
}
