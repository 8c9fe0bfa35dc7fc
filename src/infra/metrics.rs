//! Lock-free metrics collection and periodic reporting
//!
//! Counters are monotonic; the batch latency histogram and rate window are
//! reset on each `report()` via atomic swap.
//!
//! NOTE: Relaxed ordering throughout. These are statistics only and must not
//! drive pipeline decisions.

use crate::domain::types::AlertType;
use crate::services::corridor_resolver::Rejection;
use crate::services::drop_detector::GapCounts;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Prometheus-style exponential bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
pub const METRICS_BUCKET_BOUNDS: [u64; 10] =
    [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
pub const METRICS_NUM_BUCKETS: usize = 11;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_us: u64) -> usize {
    METRICS_BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; METRICS_NUM_BUCKETS]) -> [u64; METRICS_NUM_BUCKETS] {
    let mut result = [0u64; METRICS_NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; METRICS_NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = ((total as f64 * percentile).ceil() as u64).max(1);
    let mut cumulative = 0u64;

    // Upper bounds for each bucket (last bucket uses 2x the previous bound)
    const BUCKET_UPPER_BOUNDS: [u64; METRICS_NUM_BUCKETS] =
        [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200, 102400];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[METRICS_NUM_BUCKETS - 1]
}

#[inline]
fn load(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

#[inline]
fn bump(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

/// Lock-free metrics collector
pub struct Metrics {
    batches_total: AtomicU64,
    batches_rejected: AtomicU64,
    fixes_accepted: AtomicU64,
    fixes_rejected: AtomicU64,
    /// Fixes at or before their open trip's last fix (late or redelivered)
    fixes_late: AtomicU64,
    trips_opened: AtomicU64,
    /// Gauge: trips currently open
    open_trips: AtomicU64,
    gaps_micro: AtomicU64,
    gaps_transit: AtomicU64,
    gaps_extended: AtomicU64,
    traversals_recorded: AtomicU64,
    traversals_duplicate: AtomicU64,
    rejected_self_loop: AtomicU64,
    rejected_jitter: AtomicU64,
    rejected_speed: AtomicU64,
    rejected_invalid: AtomicU64,
    alerts_delay: AtomicU64,
    alerts_overspeed: AtomicU64,
    alerts_suppressed: AtomicU64,
    publish_dropped: AtomicU64,
    store_retries: AtomicU64,
    transient_failures: AtomicU64,
    /// Batch processing latency histogram (reset on report)
    batch_latency_buckets: [AtomicU64; METRICS_NUM_BUCKETS],
    batch_latency_sum_us: AtomicU64,
    batch_latency_max_us: AtomicU64,
    /// Batches since last report (reset on report)
    batches_since_report: AtomicU64,
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            batches_total: AtomicU64::new(0),
            batches_rejected: AtomicU64::new(0),
            fixes_accepted: AtomicU64::new(0),
            fixes_rejected: AtomicU64::new(0),
            fixes_late: AtomicU64::new(0),
            trips_opened: AtomicU64::new(0),
            open_trips: AtomicU64::new(0),
            gaps_micro: AtomicU64::new(0),
            gaps_transit: AtomicU64::new(0),
            gaps_extended: AtomicU64::new(0),
            traversals_recorded: AtomicU64::new(0),
            traversals_duplicate: AtomicU64::new(0),
            rejected_self_loop: AtomicU64::new(0),
            rejected_jitter: AtomicU64::new(0),
            rejected_speed: AtomicU64::new(0),
            rejected_invalid: AtomicU64::new(0),
            alerts_delay: AtomicU64::new(0),
            alerts_overspeed: AtomicU64::new(0),
            alerts_suppressed: AtomicU64::new(0),
            publish_dropped: AtomicU64::new(0),
            store_retries: AtomicU64::new(0),
            transient_failures: AtomicU64::new(0),
            batch_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            batch_latency_sum_us: AtomicU64::new(0),
            batch_latency_max_us: AtomicU64::new(0),
            batches_since_report: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record a processed batch with given latency (lock-free)
    #[inline]
    pub fn record_batch_processed(&self, latency_us: u64) {
        bump(&self.batches_total, 1);
        bump(&self.batches_since_report, 1);
        bump(&self.batch_latency_sum_us, latency_us);
        self.batch_latency_buckets[bucket_index(latency_us)].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.batch_latency_max_us, latency_us);
    }

    /// Record a batch rejected by validation, with its fix count
    #[inline]
    pub fn record_batch_rejected(&self, fixes: usize) {
        bump(&self.batches_rejected, 1);
        bump(&self.fixes_rejected, fixes as u64);
    }

    #[inline]
    pub fn record_fixes_accepted(&self, n: usize) {
        bump(&self.fixes_accepted, n as u64);
    }

    #[inline]
    pub fn record_fixes_late(&self, n: usize) {
        bump(&self.fixes_late, n as u64);
    }

    #[inline]
    pub fn record_trip_opened(&self) {
        bump(&self.trips_opened, 1);
    }

    #[inline]
    pub fn set_open_trips(&self, n: usize) {
        self.open_trips.store(n as u64, Ordering::Relaxed);
    }

    /// Record gap classifications from one detection run
    #[inline]
    pub fn record_gaps(&self, counts: &GapCounts) {
        bump(&self.gaps_micro, counts.micro as u64);
        bump(&self.gaps_transit, counts.transit as u64);
        bump(&self.gaps_extended, counts.extended as u64);
    }

    #[inline]
    pub fn record_traversal(&self, duplicate: bool) {
        if duplicate {
            bump(&self.traversals_duplicate, 1);
        } else {
            bump(&self.traversals_recorded, 1);
        }
    }

    /// Record a transit gap dropped by the corridor quality filters.
    /// Micro and extended gaps are already counted by `record_gaps`.
    #[inline]
    pub fn record_rejection(&self, rejection: &Rejection) {
        match rejection {
            Rejection::SelfLoop => bump(&self.rejected_self_loop, 1),
            Rejection::Jitter { .. } => bump(&self.rejected_jitter, 1),
            Rejection::ImplausibleSpeed { .. } => bump(&self.rejected_speed, 1),
            Rejection::Micro | Rejection::Extended => {}
        }
    }

    /// Record a gap that failed coordinate validation
    #[inline]
    pub fn record_invalid_gap(&self) {
        bump(&self.rejected_invalid, 1);
    }

    #[inline]
    pub fn record_alert_raised(&self, alert_type: AlertType) {
        match alert_type {
            AlertType::Delay => bump(&self.alerts_delay, 1),
            AlertType::Overspeed => bump(&self.alerts_overspeed, 1),
        }
    }

    #[inline]
    pub fn record_alert_suppressed(&self) {
        bump(&self.alerts_suppressed, 1);
    }

    /// Record an alert publish that no subscriber received
    #[inline]
    pub fn record_publish_dropped(&self) {
        bump(&self.publish_dropped, 1);
    }

    #[inline]
    pub fn record_store_retry(&self) {
        bump(&self.store_retries, 1);
    }

    #[inline]
    pub fn record_transient_failure(&self) {
        bump(&self.transient_failures, 1);
    }

    /// Total alerts raised so far
    pub fn alerts_total(&self) -> u64 {
        load(&self.alerts_delay) + load(&self.alerts_overspeed)
    }

    /// Produce a summary, resetting the latency histogram and rate window
    pub fn report(&self) -> MetricsSummary {
        let now = Instant::now();
        let elapsed_secs = {
            let mut last = self.last_report_time.lock();
            let elapsed = now.duration_since(*last).as_secs_f64();
            *last = now;
            elapsed
        };

        let batches_window = self.batches_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.batch_latency_sum_us.swap(0, Ordering::Relaxed);
        let latency_max = self.batch_latency_max_us.swap(0, Ordering::Relaxed);
        let buckets = swap_buckets(&self.batch_latency_buckets);

        let gaps_micro = load(&self.gaps_micro);
        let gaps_total = gaps_micro + load(&self.gaps_transit) + load(&self.gaps_extended);

        MetricsSummary {
            batches_total: load(&self.batches_total),
            batches_rejected: load(&self.batches_rejected),
            batches_per_sec: if elapsed_secs > 0.0 {
                batches_window as f64 / elapsed_secs
            } else {
                0.0
            },
            fixes_accepted: load(&self.fixes_accepted),
            fixes_rejected: load(&self.fixes_rejected),
            fixes_late: load(&self.fixes_late),
            trips_opened: load(&self.trips_opened),
            open_trips: load(&self.open_trips),
            gaps_micro,
            gaps_transit: load(&self.gaps_transit),
            gaps_extended: load(&self.gaps_extended),
            instability_ratio: if gaps_total > 0 {
                gaps_micro as f64 / gaps_total as f64
            } else {
                0.0
            },
            traversals_recorded: load(&self.traversals_recorded),
            traversals_duplicate: load(&self.traversals_duplicate),
            rejected_self_loop: load(&self.rejected_self_loop),
            rejected_jitter: load(&self.rejected_jitter),
            rejected_speed: load(&self.rejected_speed),
            rejected_invalid: load(&self.rejected_invalid),
            alerts_delay: load(&self.alerts_delay),
            alerts_overspeed: load(&self.alerts_overspeed),
            alerts_suppressed: load(&self.alerts_suppressed),
            publish_dropped: load(&self.publish_dropped),
            store_retries: load(&self.store_retries),
            transient_failures: load(&self.transient_failures),
            batch_lat_buckets: buckets,
            batch_lat_avg_us: if batches_window > 0 { latency_sum / batches_window } else { 0 },
            batch_lat_max_us: latency_max,
            batch_lat_p50_us: percentile_from_buckets(&buckets, 0.50),
            batch_lat_p99_us: percentile_from_buckets(&buckets, 0.99),
        }
    }
}

/// Point-in-time metrics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub batches_total: u64,
    pub batches_rejected: u64,
    pub batches_per_sec: f64,
    pub fixes_accepted: u64,
    pub fixes_rejected: u64,
    pub fixes_late: u64,
    pub trips_opened: u64,
    pub open_trips: u64,
    pub gaps_micro: u64,
    pub gaps_transit: u64,
    pub gaps_extended: u64,
    /// Share of detected gaps that were micro drops
    pub instability_ratio: f64,
    pub traversals_recorded: u64,
    pub traversals_duplicate: u64,
    pub rejected_self_loop: u64,
    pub rejected_jitter: u64,
    pub rejected_speed: u64,
    pub rejected_invalid: u64,
    pub alerts_delay: u64,
    pub alerts_overspeed: u64,
    pub alerts_suppressed: u64,
    pub publish_dropped: u64,
    pub store_retries: u64,
    pub transient_failures: u64,
    pub batch_lat_buckets: [u64; METRICS_NUM_BUCKETS],
    pub batch_lat_avg_us: u64,
    pub batch_lat_max_us: u64,
    pub batch_lat_p50_us: u64,
    pub batch_lat_p99_us: u64,
}

impl MetricsSummary {
    /// Log the summary as one structured event
    pub fn log(&self) {
        info!(
            batches = %self.batches_total,
            batches_rejected = %self.batches_rejected,
            batches_per_sec = %format!("{:.2}", self.batches_per_sec),
            fixes = %self.fixes_accepted,
            fixes_late = %self.fixes_late,
            trips = %self.trips_opened,
            gaps_micro = %self.gaps_micro,
            gaps_transit = %self.gaps_transit,
            gaps_extended = %self.gaps_extended,
            instability = %format!("{:.3}", self.instability_ratio),
            traversals = %self.traversals_recorded,
            alerts_delay = %self.alerts_delay,
            alerts_overspeed = %self.alerts_overspeed,
            alerts_suppressed = %self.alerts_suppressed,
            store_retries = %self.store_retries,
            transient_failures = %self.transient_failures,
            lat_avg_us = %self.batch_lat_avg_us,
            lat_p99_us = %self.batch_lat_p99_us,
            "metrics_summary"
        );
    }
}
