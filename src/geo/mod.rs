use serde::{Deserialize, Serialize};

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

/// Offset in metres on a local east/north tangent plane.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vector2 {
    pub east: f64,
    pub north: f64,
}

impl Vector2 {
    pub fn length(&self) -> f64 {
        (self.east * self.east + self.north * self.north).sqrt()
    }

    pub fn scale(&self, factor: f64) -> Self {
        Self {
            east: self.east * factor,
            north: self.north * factor,
        }
    }

    pub fn dot(&self, other: &Vector2) -> f64 {
        self.east * other.east + self.north * other.north
    }

    pub fn normalized(&self) -> Option<Self> {
        let len = self.length();
        if len <= f64::EPSILON {
            None
        } else {
            Some(self.scale(1.0 / len))
        }
    }

    pub fn perpendicular(&self) -> Self {
        Self {
            east: -self.north,
            north: self.east,
        }
    }
}

pub fn haversine_m(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let delta_lat = (b.lat - a.lat).to_radians();
    let delta_lng = (b.lng - a.lng).to_radians();

    let sin_lat = (delta_lat / 2.0).sin();
    let sin_lng = (delta_lng / 2.0).sin();

    let haversine = sin_lat * sin_lat + lat1.cos() * lat2.cos() * sin_lng * sin_lng;
    let central_angle = 2.0 * haversine.sqrt().atan2((1.0 - haversine).max(0.0).sqrt());

    EARTH_RADIUS_M * central_angle
}

/// Equirectangular projection of `to` relative to `from`. Accurate at the
/// few-kilometre scale of a delivery route.
pub fn offset_m(from: &GeoPoint, to: &GeoPoint) -> Vector2 {
    let mean_lat = ((from.lat + to.lat) / 2.0).to_radians();
    Vector2 {
        east: (to.lng - from.lng).to_radians() * mean_lat.cos() * EARTH_RADIUS_M,
        north: (to.lat - from.lat).to_radians() * EARTH_RADIUS_M,
    }
}

pub fn translate(point: &GeoPoint, offset: Vector2) -> GeoPoint {
    let lat = point.lat + (offset.north / EARTH_RADIUS_M).to_degrees();
    let cos_lat = lat.to_radians().cos().max(1e-9);
    let lng = point.lng + (offset.east / (EARTH_RADIUS_M * cos_lat)).to_degrees();
    GeoPoint { lat, lng }
}

pub fn interpolate(a: &GeoPoint, b: &GeoPoint, t: f64) -> GeoPoint {
    GeoPoint {
        lat: a.lat + (b.lat - a.lat) * t,
        lng: a.lng + (b.lng - a.lng) * t,
    }
}

/// Distance from `point` to the segment `start`-`end`. The projection
/// parameter is clamped to [0, 1] before measuring.
pub fn point_to_segment_m(start: &GeoPoint, end: &GeoPoint, point: &GeoPoint) -> f64 {
    let segment = offset_m(start, end);
    let len_sq = segment.dot(&segment);
    if len_sq <= f64::EPSILON {
        return haversine_m(start, point);
    }

    let to_point = offset_m(start, point);
    let t = (to_point.dot(&segment) / len_sq).clamp(0.0, 1.0);
    let closest = interpolate(start, end, t);

    haversine_m(&closest, point)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_distance_for_same_point() {
        let p = GeoPoint::new(53.5511, 9.9937);
        assert!(haversine_m(&p, &p) < 1e-6);
    }

    #[test]
    fn london_to_paris_is_around_343_km() {
        let london = GeoPoint::new(51.5074, -0.1278);
        let paris = GeoPoint::new(48.8566, 2.3522);
        let distance = haversine_m(&london, &paris);
        assert!((distance - 343_000.0).abs() < 5_000.0);
    }

    #[test]
    fn hundredth_degree_of_longitude_at_equator() {
        let a = GeoPoint::new(0.0, 0.0);
        let b = GeoPoint::new(0.0, 0.01);
        assert!((haversine_m(&a, &b) - 1_111.95).abs() < 1.0);
    }

    #[test]
    fn segment_distance_uses_perpendicular_foot() {
        let start = GeoPoint::new(0.0, 0.0);
        let end = GeoPoint::new(0.0, 0.01);
        let above = translate(&GeoPoint::new(0.0, 0.005), Vector2 { east: 0.0, north: 80.0 });

        let distance = point_to_segment_m(&start, &end, &above);
        assert!((distance - 80.0).abs() < 0.5);
    }

    #[test]
    fn segment_distance_clamps_beyond_endpoints() {
        let start = GeoPoint::new(0.0, 0.0);
        let end = GeoPoint::new(0.0, 0.01);
        let beyond = GeoPoint::new(0.0, 0.02);

        let distance = point_to_segment_m(&start, &end, &beyond);
        assert!((distance - haversine_m(&end, &beyond)).abs() < 0.5);
    }

    #[test]
    fn degenerate_segment_measures_to_the_point() {
        let start = GeoPoint::new(10.0, 10.0);
        let point = GeoPoint::new(10.001, 10.0);
        let distance = point_to_segment_m(&start, &start, &point);
        assert!((distance - haversine_m(&start, &point)).abs() < 1e-6);
    }

    #[test]
    fn translate_round_trips_through_offset() {
        let origin = GeoPoint::new(52.52, 13.405);
        let moved = translate(&origin, Vector2 { east: 120.0, north: -45.0 });
        let back = offset_m(&origin, &moved);
        assert!((back.east - 120.0).abs() < 0.1);
        assert!((back.north + 45.0).abs() < 0.1);
    }
}
