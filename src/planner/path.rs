use chrono::Utc;
use tracing::{debug, warn};

use crate::error::PlanningError;
use crate::geo::{
    haversine_m, interpolate, offset_m, point_to_segment_m, translate, GeoPoint, Vector2,
};
use crate::models::path::{Avoidance, FlightPath, Obstacle, Waypoint};
use crate::models::weather::WeatherConditions;

pub const MAX_ALTITUDE_M: f64 = 120.0;
pub const MIN_ALTITUDE_M: f64 = 30.0;
pub const SAFE_DISTANCE_M: f64 = 50.0;
pub const WAYPOINT_DISTANCE_M: f64 = 100.0;
pub const SMOOTHING_FACTOR: f64 = 0.3;
pub const NOMINAL_AIRSPEED_MS: f64 = 15.0;

/// Extra clearance added when a waypoint is pushed out of an obstacle's
/// safety ring, so the neighbour-averaging pass does not pull it back in.
const AVOIDANCE_BUFFER_M: f64 = 25.0;
const ALTITUDE_GAIN_PER_M: f64 = 0.1;

pub fn plan(
    start: GeoPoint,
    end: GeoPoint,
    obstacles: &[Obstacle],
    weather: &WeatherConditions,
) -> Result<FlightPath, PlanningError> {
    if let Some(reason) = weather.unsafe_reason() {
        return Err(PlanningError::UnsafeWeather(reason));
    }

    let distance = haversine_m(&start, &end);

    if distance < WAYPOINT_DISTANCE_M {
        let waypoints = direct_path(&start, &end);
        let avoidance = if path_clears(&waypoints, obstacles) {
            Avoidance::Clear
        } else {
            warn!(distance_m = distance, "short hop crosses an obstacle ring; flying direct");
            Avoidance::Fallback
        };
        return Ok(build_path(waypoints, obstacles, weather, avoidance));
    }

    let (raw, displaced) = generate_waypoints(&start, &end, obstacles);
    let smoothed = smooth(&raw);
    let waypoints = with_altitude(&smoothed, distance);

    if path_clears(&waypoints, obstacles) {
        let avoidance = if displaced {
            Avoidance::Avoided
        } else {
            Avoidance::Clear
        };
        debug!(waypoints = waypoints.len(), ?avoidance, "flight path planned");
        return Ok(build_path(waypoints, obstacles, weather, avoidance));
    }

    warn!(
        distance_m = distance,
        obstacles = obstacles.len(),
        "obstacle avoidance failed validation; falling back to direct path"
    );
    Ok(build_path(
        direct_path(&start, &end),
        obstacles,
        weather,
        Avoidance::Fallback,
    ))
}

/// Re-routes the remainder of `current` when one of `new_obstacles` cuts a
/// segment the drone has not flown yet. The flown prefix is kept.
pub fn replan(
    current: &FlightPath,
    position: GeoPoint,
    new_obstacles: &[Obstacle],
    weather: &WeatherConditions,
) -> Result<FlightPath, PlanningError> {
    if let Some(reason) = weather.unsafe_reason() {
        return Err(PlanningError::UnsafeWeather(reason));
    }

    let Some(destination) = current.destination() else {
        return Ok(current.clone());
    };

    let index = closest_waypoint_index(&current.waypoints, &position);
    let remaining = &current.waypoints[index..];
    let affected = remaining.windows(2).any(|segment| {
        new_obstacles
            .iter()
            .any(|obstacle| segment_intersects(&segment[0], &segment[1], obstacle))
    });

    if !affected {
        return Ok(current.clone());
    }

    let mut obstacles = current.obstacles.clone();
    obstacles.extend_from_slice(new_obstacles);

    let fresh = plan(position, destination, &obstacles, weather)?;

    let mut waypoints = current.waypoints[..index].to_vec();
    waypoints.extend(fresh.waypoints);

    Ok(build_path(waypoints, &obstacles, weather, fresh.avoidance))
}

pub fn validate_flight_plan(waypoints: &[Waypoint]) -> Result<(), PlanningError> {
    if waypoints.len() < 2 {
        return Err(PlanningError::InvalidPlan(
            "flight plan must have at least 2 waypoints".to_string(),
        ));
    }

    for (index, waypoint) in waypoints.iter().enumerate() {
        if !(-90.0..=90.0).contains(&waypoint.lat) || !(-180.0..=180.0).contains(&waypoint.lng) {
            return Err(PlanningError::InvalidPlan(format!(
                "waypoint {index} has invalid coordinates"
            )));
        }
        if !(MIN_ALTITUDE_M..=MAX_ALTITUDE_M).contains(&waypoint.altitude) {
            return Err(PlanningError::InvalidPlan(format!(
                "waypoint {index} altitude {} outside {MIN_ALTITUDE_M}-{MAX_ALTITUDE_M} m",
                waypoint.altitude
            )));
        }
    }

    Ok(())
}

pub fn direct_path(start: &GeoPoint, end: &GeoPoint) -> Vec<Waypoint> {
    let distance = haversine_m(start, end);
    let segments = ((distance / WAYPOINT_DISTANCE_M).ceil() as usize).max(2);

    (0..=segments)
        .map(|i| {
            let progress = i as f64 / segments as f64;
            let point = interpolate(start, end, progress);
            Waypoint {
                lat: point.lat,
                lng: point.lng,
                altitude: optimal_altitude(progress, distance),
            }
        })
        .collect()
}

pub fn optimal_altitude(progress: f64, total_distance_m: f64) -> f64 {
    let ceiling = MAX_ALTITUDE_M.min(MIN_ALTITUDE_M + total_distance_m * ALTITUDE_GAIN_PER_M);
    let bell = 4.0 * progress * (1.0 - progress);
    MIN_ALTITUDE_M + (ceiling - MIN_ALTITUDE_M) * bell
}

pub fn segment_intersects(a: &Waypoint, b: &Waypoint, obstacle: &Obstacle) -> bool {
    point_to_segment_m(&a.point(), &b.point(), &obstacle.center())
        < obstacle.radius + SAFE_DISTANCE_M
}

pub fn path_clears(waypoints: &[Waypoint], obstacles: &[Obstacle]) -> bool {
    if waypoints.len() < 2 {
        return false;
    }
    waypoints.windows(2).all(|segment| {
        obstacles
            .iter()
            .all(|obstacle| !segment_intersects(&segment[0], &segment[1], obstacle))
    })
}

pub fn path_length_m(waypoints: &[Waypoint]) -> f64 {
    waypoints
        .windows(2)
        .map(|segment| haversine_m(&segment[0].point(), &segment[1].point()))
        .sum()
}

pub fn eta_seconds(waypoints: &[Waypoint], airspeed_ms: f64) -> f64 {
    if waypoints.len() < 2 || airspeed_ms <= 0.0 {
        return 0.0;
    }
    path_length_m(waypoints) / airspeed_ms
}

/// Evenly samples at most `max_points` waypoints for display.
pub fn simplify(waypoints: &[Waypoint], max_points: usize) -> Vec<Waypoint> {
    if waypoints.len() <= max_points || max_points < 2 {
        return waypoints.to_vec();
    }

    let step = (waypoints.len() - 1) as f64 / (max_points - 1) as f64;
    (0..max_points)
        .map(|i| waypoints[((i as f64 * step).round() as usize).min(waypoints.len() - 1)])
        .collect()
}

pub fn closest_waypoint_index(waypoints: &[Waypoint], position: &GeoPoint) -> usize {
    waypoints
        .iter()
        .enumerate()
        .map(|(index, waypoint)| (index, haversine_m(&waypoint.point(), position)))
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(index, _)| index)
        .unwrap_or(0)
}

fn generate_waypoints(
    start: &GeoPoint,
    end: &GeoPoint,
    obstacles: &[Obstacle],
) -> (Vec<GeoPoint>, bool) {
    let distance = haversine_m(start, end);
    let count = (distance / WAYPOINT_DISTANCE_M).ceil() as usize;
    let Some(lateral) = offset_m(start, end).perpendicular().normalized() else {
        return (vec![*start, *end], false);
    };

    let mut displaced = false;
    let mut points = Vec::with_capacity(count + 1);
    points.push(*start);

    for i in 1..count {
        let progress = i as f64 / count as f64;
        let candidate = interpolate(start, end, progress);
        let adjusted = avoid_obstacles(candidate, obstacles, start, lateral);
        if adjusted != candidate {
            displaced = true;
        }
        points.push(adjusted);
    }

    points.push(*end);
    (points, displaced)
}

/// Shifts a waypoint sideways, across the route, until it sits outside the
/// safety ring of every obstacle whose ring its neighbouring segments could
/// cut. All waypoints pass an obstacle on the same side: the side away from
/// the obstacle's centre, or the left side when the centre is on the line.
fn avoid_obstacles(
    waypoint: GeoPoint,
    obstacles: &[Obstacle],
    start: &GeoPoint,
    lateral: Vector2,
) -> GeoPoint {
    let mut adjusted = waypoint;

    for obstacle in obstacles {
        let center = obstacle.center();
        let clearance = obstacle.radius + SAFE_DISTANCE_M;
        if haversine_m(&adjusted, &center) >= clearance + WAYPOINT_DISTANCE_M {
            continue;
        }

        let side = if offset_m(start, &center).dot(&lateral) > 0.0 {
            -1.0
        } else {
            1.0
        };
        let current = offset_m(&center, &adjusted).dot(&lateral);
        let target = side * (clearance + AVOIDANCE_BUFFER_M);
        if side * current >= clearance + AVOIDANCE_BUFFER_M {
            continue;
        }

        adjusted = translate(&adjusted, lateral.scale(target - current));
    }

    adjusted
}

fn smooth(points: &[GeoPoint]) -> Vec<GeoPoint> {
    if points.len() < 3 {
        return points.to_vec();
    }

    let mut smoothed = Vec::with_capacity(points.len());
    smoothed.push(points[0]);

    for window in points.windows(3) {
        let (prev, current, next) = (&window[0], &window[1], &window[2]);
        smoothed.push(GeoPoint {
            lat: current.lat * (1.0 - SMOOTHING_FACTOR)
                + (prev.lat + next.lat) * SMOOTHING_FACTOR * 0.5,
            lng: current.lng * (1.0 - SMOOTHING_FACTOR)
                + (prev.lng + next.lng) * SMOOTHING_FACTOR * 0.5,
        });
    }

    smoothed.push(points[points.len() - 1]);
    smoothed
}

fn with_altitude(points: &[GeoPoint], total_distance_m: f64) -> Vec<Waypoint> {
    let last = points.len().saturating_sub(1).max(1) as f64;
    points
        .iter()
        .enumerate()
        .map(|(index, point)| Waypoint {
            lat: point.lat,
            lng: point.lng,
            altitude: optimal_altitude(index as f64 / last, total_distance_m),
        })
        .collect()
}

fn build_path(
    waypoints: Vec<Waypoint>,
    obstacles: &[Obstacle],
    weather: &WeatherConditions,
    avoidance: Avoidance,
) -> FlightPath {
    FlightPath {
        distance_m: path_length_m(&waypoints),
        waypoints,
        obstacles: obstacles.to_vec(),
        weather: *weather,
        avoidance,
        computed_at: Utc::now(),
    }
}
