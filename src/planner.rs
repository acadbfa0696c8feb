//! Mission planning.
//!
//! `plan` is a pure function of the target, a drone state snapshot and
//! static settings. It takes no locks and has no side effects, so the
//! coordinator can call it inside its dispatch critical section.

use serde::{Deserialize, Serialize};

use crate::drone::DroneState;
use crate::error::PlanningError;
use crate::{MissionKind, MissionPlan};

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance in meters.
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();
    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().asin()
}

/// Exclusion polygon, vertices as `[lat, lon]`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NoFlyZone {
    pub name: String,
    pub polygon: Vec<[f64; 2]>,
}

impl NoFlyZone {
    /// Ray casting over the lat/lon plane; zones are small enough that the
    /// planar approximation holds.
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        let n = self.polygon.len();
        if n < 3 {
            return false;
        }
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let [yi, xi] = self.polygon[i];
            let [yj, xj] = self.polygon[j];
            if ((yi > lat) != (yj > lat)) && (lon < (xj - xi) * (lat - yi) / (yj - yi) + xi) {
                inside = !inside;
            }
            j = i;
        }
        inside
    }

    /// True when the straight path between two points touches the zone.
    pub fn intersects_path(&self, from: [f64; 2], to: [f64; 2]) -> bool {
        if self.contains(from[0], from[1]) || self.contains(to[0], to[1]) {
            return true;
        }
        let n = self.polygon.len();
        if n < 3 {
            return false;
        }
        (0..n).any(|i| segments_intersect(from, to, self.polygon[i], self.polygon[(i + 1) % n]))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.polygon.len() < 3 {
            return Err(format!(
                "no-fly zone '{}' needs at least 3 vertices",
                self.name
            ));
        }
        for [lat, lon] in &self.polygon {
            if !valid_coordinate(*lat, *lon) {
                return Err(format!(
                    "no-fly zone '{}' has invalid vertex ({}, {})",
                    self.name, lat, lon
                ));
            }
        }
        Ok(())
    }
}

fn orientation(a: [f64; 2], b: [f64; 2], c: [f64; 2]) -> f64 {
    (b[0] - a[0]) * (c[1] - a[1]) - (b[1] - a[1]) * (c[0] - a[0])
}

fn on_segment(a: [f64; 2], b: [f64; 2], p: [f64; 2]) -> bool {
    p[0] >= a[0].min(b[0]) && p[0] <= a[0].max(b[0]) && p[1] >= a[1].min(b[1]) && p[1] <= a[1].max(b[1])
}

fn segments_intersect(p1: [f64; 2], p2: [f64; 2], q1: [f64; 2], q2: [f64; 2]) -> bool {
    let d1 = orientation(q1, q2, p1);
    let d2 = orientation(q1, q2, p2);
    let d3 = orientation(p1, p2, q1);
    let d4 = orientation(p1, p2, q2);
    if ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
    {
        return true;
    }
    (d1 == 0.0 && on_segment(q1, q2, p1))
        || (d2 == 0.0 && on_segment(q1, q2, p2))
        || (d3 == 0.0 && on_segment(p1, p2, q1))
        || (d4 == 0.0 && on_segment(p1, p2, q2))
}

pub fn valid_coordinate(lat: f64, lon: f64) -> bool {
    lat.is_finite() && lon.is_finite() && (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon)
}

#[derive(Clone, Debug, PartialEq)]
pub struct PlannerSettings {
    pub home_lat: f64,
    pub home_lon: f64,
    pub altitude_m: f64,
    pub max_duration_ms: u64,
    pub return_max_duration_ms: u64,
    /// Hard cap on one-way distance regardless of battery.
    pub max_range_m: f64,
    pub cruise_speed_mps: f64,
    /// Flight time on a full battery.
    pub endurance_secs: f64,
    /// Battery floor below which no mission is planned.
    pub min_battery_pct: f64,
    pub no_fly_zones: Vec<NoFlyZone>,
}

#[derive(Clone, Debug)]
pub struct Planner {
    settings: PlannerSettings,
}

impl Planner {
    pub fn new(settings: PlannerSettings) -> Self {
        Self { settings }
    }

    /// One-way range the drone can cover and still return above the floor.
    pub fn usable_range_m(&self, battery_pct: f64) -> f64 {
        let usable = ((battery_pct - self.settings.min_battery_pct) / 100.0).max(0.0);
        let battery_range =
            self.settings.cruise_speed_mps * self.settings.endurance_secs * usable / 2.0;
        battery_range.min(self.settings.max_range_m)
    }

    pub fn plan(
        &self,
        target_lat: f64,
        target_lon: f64,
        drone: &DroneState,
    ) -> Result<MissionPlan, PlanningError> {
        if !drone.gps_locked {
            return Err(PlanningError::UnsafeState("gps not locked".to_string()));
        }
        if !drone.link_up {
            return Err(PlanningError::UnsafeState("drone link down".to_string()));
        }
        if drone.battery_pct < self.settings.min_battery_pct {
            return Err(PlanningError::UnsafeState(format!(
                "battery {:.1}% below floor {:.1}%",
                drone.battery_pct, self.settings.min_battery_pct
            )));
        }
        if !valid_coordinate(target_lat, target_lon) {
            return Err(PlanningError::OutOfRange {
                distance_m: f64::INFINITY,
                range_m: self.usable_range_m(drone.battery_pct),
            });
        }

        let home = [self.settings.home_lat, self.settings.home_lon];
        let target = [target_lat, target_lon];
        let distance_m = haversine_distance(home[0], home[1], target_lat, target_lon);
        let range_m = self.usable_range_m(drone.battery_pct);
        if distance_m > range_m {
            return Err(PlanningError::OutOfRange {
                distance_m,
                range_m,
            });
        }

        if let Some(zone) = self
            .settings
            .no_fly_zones
            .iter()
            .find(|zone| zone.intersects_path(home, target))
        {
            return Err(PlanningError::NoFlyZone {
                zone: zone.name.clone(),
            });
        }

        Ok(MissionPlan {
            kind: MissionKind::Observe,
            target_lat,
            target_lon,
            altitude_m: self.settings.altitude_m,
            max_duration_ms: self.settings.max_duration_ms,
            distance_m,
        })
    }

    /// Return-to-base plan. Never refused: it is the safe path.
    pub fn plan_return(&self, from_lat: f64, from_lon: f64) -> MissionPlan {
        MissionPlan {
            kind: MissionKind::ReturnToBase,
            target_lat: self.settings.home_lat,
            target_lon: self.settings.home_lon,
            altitude_m: self.settings.altitude_m,
            max_duration_ms: self.settings.return_max_duration_ms,
            distance_m: haversine_distance(
                from_lat,
                from_lon,
                self.settings.home_lat,
                self.settings.home_lon,
            ),
        }
    }
}
