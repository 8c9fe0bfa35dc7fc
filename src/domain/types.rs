//! Shared types for the corridor pipeline

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Milliseconds in one hour, used for UTC hour-of-day bucketing
const MS_PER_HOUR: i64 = 3_600_000;

/// Generate a new UUIDv7 (time-sortable)
pub fn new_uuid_v7() -> String {
    Uuid::now_v7().to_string()
}

/// Get current epoch milliseconds
#[inline]
pub fn epoch_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

/// Newtype wrapper for vehicle identifiers
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VehicleId(pub String);

impl fmt::Display for VehicleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Newtype wrapper for trip identifiers (UUIDv7)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TripId(pub String);

impl fmt::Display for TripId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// UTC hour of day (0-23) for an epoch millisecond timestamp
#[inline]
pub fn utc_hour(ts_ms: i64) -> u8 {
    ts_ms.div_euclid(MS_PER_HOUR).rem_euclid(24) as u8
}

/// One validated positional sample
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Fix {
    pub vehicle_id: VehicleId,
    /// Epoch milliseconds (UTC)
    pub ts_ms: i64,
    pub lat: f64,
    pub lon: f64,
    pub speed: Option<f64>,
    pub accuracy: Option<f64>,
    pub heading: Option<f64>,
}

/// A run of one vehicle's fixes without an inactivity gap
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trip {
    pub id: TripId,
    pub vehicle_id: VehicleId,
    pub start_ms: i64,
    pub end_ms: i64,
    pub source: String,
}

/// Classification of a gap between two consecutive fixes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GapClass {
    /// Just above the detection threshold; only counts toward instability
    Micro,
    /// Normal transit-time gap; feeds corridor learning
    Transit,
    /// Long enough to be treated as vehicle inactivity
    Extended,
}

impl GapClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            GapClass::Micro => "micro",
            GapClass::Transit => "transit",
            GapClass::Extended => "extended",
        }
    }
}

/// A geographic point
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Point {
    pub lat: f64,
    pub lon: f64,
}

/// An interval between two consecutive fixes exceeding the detection threshold
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GapEvent {
    pub start_ms: i64,
    pub end_ms: i64,
    pub start: Point,
    pub end: Point,
    pub duration_secs: f64,
    pub class: GapClass,
}

/// Identity of a corridor: start cell, end cell, direction sector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CorridorKey {
    pub a_cell: u64,
    pub b_cell: u64,
    /// Bearing sector 0-15, 22.5 degrees each
    pub direction: u8,
}

impl CorridorKey {
    #[inline]
    pub fn is_self_loop(&self) -> bool {
        self.a_cell == self.b_cell
    }

    /// Stable string form used as the corridor id in alerts and logs
    pub fn id(&self) -> CorridorId {
        CorridorId(self.to_string())
    }
}

impl fmt::Display for CorridorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}-{:x}-{}", self.a_cell, self.b_cell, self.direction)
    }
}

/// String form of a corridor key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorridorId(pub String);

impl fmt::Display for CorridorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Trip-scoped identity of a traversal, used for idempotent re-ingestion
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TraversalId {
    pub trip_id: TripId,
    pub start_ms: i64,
}

/// One observed transit of a corridor
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Traversal {
    pub id: TraversalId,
    pub corridor: CorridorKey,
    pub vehicle_id: VehicleId,
    pub start_ms: i64,
    pub end_ms: i64,
    pub travel_secs: f64,
    pub avg_speed_kmh: f64,
    pub distance_m: f64,
    pub start: Point,
    pub end: Point,
}

impl Traversal {
    /// UTC hour bucket the traversal belongs to
    #[inline]
    pub fn hour(&self) -> u8 {
        utc_hour(self.start_ms)
    }
}

/// Baseline bucket: a UTC hour or the all-hours fallback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BaselineBucket {
    Hour(u8),
    Global,
}

impl fmt::Display for BaselineBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BaselineBucket::Hour(h) => write!(f, "hour_{h:02}"),
            BaselineBucket::Global => f.write_str("global"),
        }
    }
}

/// Learned travel-time and speed statistic for one corridor bucket
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CorridorBaseline {
    pub corridor: CorridorKey,
    pub bucket: BaselineBucket,
    pub sample_count: usize,
    pub median_travel_secs: f64,
    pub p95_speed_kmh: f64,
}

/// Alert type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertType {
    Delay,
    Overspeed,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::Delay => "delay",
            AlertType::Overspeed => "overspeed",
        }
    }
}

/// Alert severity, ordered low < medium < high
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    /// Map a deviation ratio to a severity
    pub fn from_ratio(ratio: f64) -> Self {
        if ratio >= 2.0 {
            Severity::High
        } else if ratio >= 1.5 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }
}

/// Deduplication key: at most one unresolved alert per triple
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AlertKey {
    pub trip_id: TripId,
    pub corridor: CorridorKey,
    pub alert_type: AlertType,
}

/// Context recorded with an alert
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertDetails {
    pub bucket: BaselineBucket,
    pub baseline_value: f64,
    pub actual_value: f64,
    pub threshold: f64,
    pub sample_count: usize,
}

/// A raised delay or overspeed alert
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: String,
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub severity: Severity,
    /// Creation time (epoch ms)
    pub time: i64,
    pub corridor_id: CorridorId,
    #[serde(skip)]
    pub corridor: CorridorKey,
    pub trip_id: TripId,
    pub vehicle_id: VehicleId,
    pub delta_value: f64,
    pub details: AlertDetails,
    #[serde(skip)]
    pub resolved: bool,
}

impl Alert {
    pub fn key(&self) -> AlertKey {
        AlertKey {
            trip_id: self.trip_id.clone(),
            corridor: self.corridor,
            alert_type: self.alert_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utc_hour() {
        // 2024-03-01T10:15:00Z
        assert_eq!(utc_hour(1_709_288_100_000), 10);
        assert_eq!(utc_hour(0), 0);
        assert_eq!(utc_hour(-1), 23);
    }

    #[test]
    fn test_severity_from_ratio() {
        assert_eq!(Severity::from_ratio(0.5), Severity::Low);
        assert_eq!(Severity::from_ratio(1.49), Severity::Low);
        assert_eq!(Severity::from_ratio(1.5), Severity::Medium);
        assert_eq!(Severity::from_ratio(2.0), Severity::High);
        assert!(Severity::High > Severity::Medium);
    }

    #[test]
    fn test_corridor_key_display_and_self_loop() {
        let key = CorridorKey { a_cell: 0x87283472bffffff, b_cell: 0x872834700ffffff, direction: 3 };
        assert_eq!(key.to_string(), "87283472bffffff-872834700ffffff-3");
        assert!(!key.is_self_loop());
        assert!(CorridorKey { a_cell: 1, b_cell: 1, direction: 0 }.is_self_loop());
    }

    #[test]
    fn test_alert_serializes_public_shape() {
        let corridor = CorridorKey { a_cell: 1, b_cell: 2, direction: 4 };
        let alert = Alert {
            id: "a1".to_string(),
            alert_type: AlertType::Delay,
            severity: Severity::High,
            time: 1000,
            corridor_id: corridor.id(),
            corridor,
            trip_id: TripId("t1".to_string()),
            vehicle_id: VehicleId("v1".to_string()),
            delta_value: 1100.0,
            details: AlertDetails {
                bucket: BaselineBucket::Global,
                baseline_value: 300.0,
                actual_value: 1400.0,
                threshold: 900.0,
                sample_count: 5,
            },
            resolved: false,
        };
        let json: serde_json::Value = serde_json::to_value(&alert).unwrap();
        assert_eq!(json["type"], "delay");
        assert_eq!(json["severity"], "high");
        assert_eq!(json["corridorId"], "1-2-4");
        assert_eq!(json["tripId"], "t1");
        assert_eq!(json["deltaValue"], 1100.0);
        assert_eq!(json["details"]["baselineValue"], 300.0);
        assert_eq!(json["details"]["bucket"], "global");
        assert!(json.get("resolved").is_none());
    }
}
