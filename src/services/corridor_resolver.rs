//! Corridor resolution: maps a transit gap onto an H3 cell pair and a
//! direction sector, and measures the traversal.
//!
//! Quality filters:
//! - micro and extended gaps never produce a traversal
//! - start and end in the same cell is a self-loop
//! - straight-line distance under `min_distance_m` is GPS jitter
//! - average speed over `max_speed_kmh` is a sensor or clock error

use crate::domain::error::ValidationError;
use crate::domain::types::{
    CorridorKey, GapClass, GapEvent, Point, Traversal, TraversalId, TripId, VehicleId,
};
use crate::infra::config::Config;
use h3o::{LatLng, Resolution};
use tracing::debug;

/// Mean Earth radius in meters
const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Number of direction sectors (22.5 degrees each)
const DIRECTION_SECTORS: u8 = 16;

/// Why a gap did not become a traversal
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Rejection {
    Micro,
    Extended,
    SelfLoop,
    Jitter { distance_m: f64 },
    ImplausibleSpeed { speed_kmh: f64 },
}

impl Rejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rejection::Micro => "micro",
            Rejection::Extended => "extended",
            Rejection::SelfLoop => "self_loop",
            Rejection::Jitter { .. } => "jitter",
            Rejection::ImplausibleSpeed { .. } => "implausible_speed",
        }
    }
}

/// Outcome of resolving one gap
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    Traversal(Traversal),
    Rejected(Rejection),
}

/// Great-circle distance in meters (haversine)
pub fn haversine_m(a: Point, b: Point) -> f64 {
    let (phi1, phi2) = (a.lat.to_radians(), b.lat.to_radians());
    let d_phi = (b.lat - a.lat).to_radians();
    let d_lambda = (b.lon - a.lon).to_radians();
    let h = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

/// Initial bearing from `a` to `b`, normalized to [0, 360)
pub fn bearing_deg(a: Point, b: Point) -> f64 {
    let (phi1, phi2) = (a.lat.to_radians(), b.lat.to_radians());
    let d_lambda = (b.lon - a.lon).to_radians();
    let y = d_lambda.sin() * phi2.cos();
    let x = phi1.cos() * phi2.sin() - phi1.sin() * phi2.cos() * d_lambda.cos();
    let deg = y.atan2(x).to_degrees().rem_euclid(360.0);
    // rem_euclid can return 360.0 for tiny negative inputs
    if deg >= 360.0 {
        0.0
    } else {
        deg
    }
}

/// Direction sector 0-15 for a bearing in [0, 360)
#[inline]
pub fn direction_bucket(bearing: f64) -> u8 {
    ((bearing / 22.5).floor() as u8) % DIRECTION_SECTORS
}

/// Check a point lies on the globe; `index` is reported on failure
pub fn validate_point(index: usize, point: Point) -> Result<(), ValidationError> {
    if !point.lat.is_finite() || !point.lon.is_finite() {
        return Err(ValidationError::NonFiniteCoordinate { index });
    }
    if !(-90.0..=90.0).contains(&point.lat) {
        return Err(ValidationError::LatitudeOutOfRange { index, value: point.lat });
    }
    if !(-180.0..=180.0).contains(&point.lon) {
        return Err(ValidationError::LongitudeOutOfRange { index, value: point.lon });
    }
    Ok(())
}

/// Resolves gap events into corridor traversals
#[derive(Debug, Clone, Copy)]
pub struct CorridorResolver {
    resolution: Resolution,
    min_distance_m: f64,
    max_speed_kmh: f64,
}

impl Default for CorridorResolver {
    fn default() -> Self {
        Self { resolution: Resolution::Seven, min_distance_m: 10.0, max_speed_kmh: 200.0 }
    }
}

impl CorridorResolver {
    pub fn new(resolution: Resolution, min_distance_m: f64, max_speed_kmh: f64) -> Self {
        Self { resolution, min_distance_m, max_speed_kmh }
    }

    /// Build from config; the resolution was range-checked by `Config::validate`
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let resolution = Resolution::try_from(config.resolution())
            .map_err(|e| anyhow::anyhow!("invalid H3 resolution {}: {e}", config.resolution()))?;
        Ok(Self::new(resolution, config.min_distance_m(), config.max_speed_kmh()))
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// H3 cell for a validated point, as its raw 64-bit index
    pub fn cell(&self, point: Point) -> Result<u64, ValidationError> {
        validate_point(0, point)?;
        let ll = LatLng::new(point.lat, point.lon)
            .map_err(|_| ValidationError::NonFiniteCoordinate { index: 0 })?;
        Ok(u64::from(ll.to_cell(self.resolution)))
    }

    /// Corridor key for a start/end pair
    pub fn corridor_key(&self, start: Point, end: Point) -> Result<CorridorKey, ValidationError> {
        validate_point(0, start)?;
        validate_point(1, end)?;
        let a_cell = self.cell(start)?;
        let b_cell = self.cell(end)?;
        Ok(CorridorKey { a_cell, b_cell, direction: direction_bucket(bearing_deg(start, end)) })
    }

    /// Resolve one gap produced by `trip_id`.
    ///
    /// Malformed coordinates fail the whole gap rather than resolving to a
    /// degenerate cell.
    pub fn resolve(
        &self,
        gap: &GapEvent,
        trip_id: &TripId,
        vehicle_id: &VehicleId,
    ) -> Result<Resolved, ValidationError> {
        match gap.class {
            GapClass::Extended => return Ok(Resolved::Rejected(Rejection::Extended)),
            GapClass::Micro => return Ok(Resolved::Rejected(Rejection::Micro)),
            GapClass::Transit => {}
        }

        let corridor = self.corridor_key(gap.start, gap.end)?;
        if corridor.is_self_loop() {
            debug!(trip_id = %trip_id, cell = %format!("{:x}", corridor.a_cell), "corridor_self_loop");
            return Ok(Resolved::Rejected(Rejection::SelfLoop));
        }

        let distance_m = haversine_m(gap.start, gap.end);
        if distance_m < self.min_distance_m {
            debug!(trip_id = %trip_id, distance_m = %distance_m, "corridor_jitter");
            return Ok(Resolved::Rejected(Rejection::Jitter { distance_m }));
        }

        let speed_kmh = (distance_m / 1000.0) / (gap.duration_secs / 3600.0);
        if !speed_kmh.is_finite() || speed_kmh > self.max_speed_kmh {
            debug!(trip_id = %trip_id, speed_kmh = %speed_kmh, "corridor_implausible_speed");
            return Ok(Resolved::Rejected(Rejection::ImplausibleSpeed { speed_kmh }));
        }

        Ok(Resolved::Traversal(Traversal {
            id: TraversalId { trip_id: trip_id.clone(), start_ms: gap.start_ms },
            corridor,
            vehicle_id: vehicle_id.clone(),
            start_ms: gap.start_ms,
            end_ms: gap.end_ms,
            travel_secs: gap.duration_secs,
            avg_speed_kmh: speed_kmh,
            distance_m,
            start: gap.start,
            end: gap.end,
        }))
    }
}
