//! Per-vehicle trip segmentation
//!
//! A trip is a maximal run of one vehicle's fixes with no silence longer than
//! the inactivity threshold. The segmenter keeps each vehicle's open trip and
//! its last fix between batches, so a gap spanning two batches is still seen
//! by the drop detector.
//!
//! Fixes at or before the open trip's last fix are late or redelivered and
//! are skipped. Re-ingesting a processed batch therefore changes nothing.
//!
//! Trips split on data-time silence only. `close_idle` evicts a trip when
//! the newest fix seen from any vehicle is past its inactivity window and
//! nothing arrived for it within the same span of wall clock, so delayed
//! uploads keep continuing their trip.

use crate::domain::types::{epoch_ms, new_uuid_v7, Fix, Trip, TripId, VehicleId};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::debug;

const DEFAULT_SOURCE: &str = "live";

/// A vehicle's open trip and the fix that currently ends it
#[derive(Debug, Clone)]
struct OpenTrip {
    trip: Trip,
    last_fix: Fix,
    /// Wall clock of the last batch carrying fixes for this vehicle
    seen_at_ms: i64,
}

/// Fixes of one trip to run through detection
#[derive(Debug, Clone)]
pub struct TripSegment {
    pub trip: Trip,
    /// Time-ordered fixes. When the trip continues from an earlier batch the
    /// first entry is that batch's last fix.
    pub fixes: Vec<Fix>,
    /// Fixes from this batch (excludes the carried fix)
    pub new_fixes: usize,
    /// The trip was opened by this batch
    pub opened: bool,
}

/// Outcome of segmenting one vehicle's fixes
#[derive(Debug, Clone, Default)]
pub struct Segmentation {
    pub segments: Vec<TripSegment>,
    /// Fixes skipped as late or duplicate
    pub late: usize,
}

pub struct TripSegmenter {
    open: Mutex<FxHashMap<VehicleId, OpenTrip>>,
    /// Newest accepted fix timestamp across all vehicles
    watermark_ms: AtomicI64,
    inactivity_ms: i64,
    source: String,
}

impl TripSegmenter {
    pub fn new(inactivity_ms: i64) -> Self {
        Self {
            open: Mutex::new(FxHashMap::default()),
            watermark_ms: AtomicI64::new(i64::MIN),
            inactivity_ms,
            source: DEFAULT_SOURCE.to_string(),
        }
    }

    /// Tag recorded on trips opened by this segmenter
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn inactivity_ms(&self) -> i64 {
        self.inactivity_ms
    }

    /// Newest fix timestamp accepted so far, if any
    pub fn watermark_ms(&self) -> Option<i64> {
        let watermark = self.watermark_ms.load(Ordering::Relaxed);
        (watermark != i64::MIN).then_some(watermark)
    }

    fn open_trip(&self, vehicle_id: &VehicleId, first: &Fix) -> TripSegment {
        let trip = Trip {
            id: TripId(new_uuid_v7()),
            vehicle_id: vehicle_id.clone(),
            start_ms: first.ts_ms,
            end_ms: first.ts_ms,
            source: self.source.clone(),
        };
        debug!(trip_id = %trip.id, vehicle_id = %vehicle_id, start_ms = %trip.start_ms, "trip_opened");
        TripSegment { trip, fixes: vec![first.clone()], new_fixes: 1, opened: true }
    }

    /// Split one vehicle's fixes (sorted by timestamp) into trip segments.
    ///
    /// The vehicle's open trip is updated once, after the whole run has been
    /// segmented, so trip end times only move forward with accepted fixes.
    pub fn segment(&self, vehicle_id: &VehicleId, fixes: &[Fix]) -> Segmentation {
        let mut open = self.open.lock();
        let mut result = Segmentation::default();

        let mut current: Option<TripSegment> = open.get(vehicle_id).map(|o| TripSegment {
            trip: o.trip.clone(),
            fixes: vec![o.last_fix.clone()],
            new_fixes: 0,
            opened: false,
        });

        for fix in fixes {
            let Some(segment) = current.as_mut() else {
                current = Some(self.open_trip(vehicle_id, fix));
                continue;
            };

            let last_ts = segment.trip.end_ms;
            if fix.ts_ms <= last_ts {
                result.late += 1;
                continue;
            }

            if fix.ts_ms - last_ts > self.inactivity_ms {
                debug!(
                    trip_id = %segment.trip.id,
                    vehicle_id = %vehicle_id,
                    silence_ms = %(fix.ts_ms - last_ts),
                    "trip_closed_inactive"
                );
                let next = self.open_trip(vehicle_id, fix);
                if let Some(done) = current.replace(next) {
                    if done.new_fixes > 0 {
                        result.segments.push(done);
                    }
                }
                continue;
            }

            segment.fixes.push(fix.clone());
            segment.new_fixes += 1;
            segment.trip.end_ms = fix.ts_ms;
        }

        if let Some(segment) = current {
            if let Some(last_fix) = segment.fixes.last() {
                self.watermark_ms.fetch_max(segment.trip.end_ms, Ordering::Relaxed);
                open.insert(
                    vehicle_id.clone(),
                    OpenTrip {
                        trip: segment.trip.clone(),
                        last_fix: last_fix.clone(),
                        seen_at_ms: epoch_ms(),
                    },
                );
            }
            if segment.new_fixes > 0 {
                result.segments.push(segment);
            }
        }

        result
    }

    /// Open trip for a vehicle, if any
    pub fn current_trip(&self, vehicle_id: &VehicleId) -> Option<Trip> {
        self.open.lock().get(vehicle_id).map(|o| o.trip.clone())
    }

    pub fn open_trips(&self) -> usize {
        self.open.lock().len()
    }

    /// Close trips idle past the inactivity threshold both in data time
    /// (against the watermark) and in wall clock (against `now_ms`).
    pub fn close_idle(&self, now_ms: i64) -> Vec<Trip> {
        let mut open = self.open.lock();
        let watermark = self.watermark_ms.load(Ordering::Relaxed);
        let mut closed = Vec::new();
        open.retain(|_, o| {
            let data_idle = watermark.saturating_sub(o.trip.end_ms) > self.inactivity_ms;
            let wall_idle = now_ms.saturating_sub(o.seen_at_ms) > self.inactivity_ms;
            if data_idle && wall_idle {
                closed.push(o.trip.clone());
                false
            } else {
                true
            }
        });
        closed
    }
}
