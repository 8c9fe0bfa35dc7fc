//! Baseline store: per-corridor, hour-of-day aware travel-time baselines
//!
//! Every recorded traversal triggers a full recompute of its corridor's
//! buckets from the stored traversal history. Writers to the same corridor
//! are serialized through a striped lock table; writes from outside this
//! process are caught by the repository's version check and retried with a
//! fresh read, up to `max_attempts`.

use crate::domain::error::{PipelineError, StoreError};
use crate::domain::types::{utc_hour, BaselineBucket, CorridorBaseline, CorridorKey, Traversal};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::services::corridor_repository::{CorridorRecord, CorridorRepository};
use crate::services::stats;
use parking_lot::Mutex;
use rustc_hash::FxHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::{debug, warn};

/// Number of lock stripes guarding corridor writes
const LOCK_STRIPES: usize = 64;

/// Percentile used for the speed baseline
const SPEED_PERCENTILE: f64 = 95.0;

/// Result of recording one traversal
#[derive(Debug, Clone, PartialEq)]
pub struct Recorded {
    /// Baselines of the corridor after the write
    pub baselines: Vec<CorridorBaseline>,
    /// The traversal was already stored; nothing changed
    pub duplicate: bool,
    /// Write attempts used (1 when uncontended)
    pub attempts: u32,
}

fn bucket_baseline(
    corridor: CorridorKey,
    bucket: BaselineBucket,
    traversals: &[&Traversal],
) -> Option<CorridorBaseline> {
    let travel: Vec<f64> = traversals.iter().map(|t| t.travel_secs).collect();
    let speed: Vec<f64> = traversals.iter().map(|t| t.avg_speed_kmh).collect();
    Some(CorridorBaseline {
        corridor,
        bucket,
        sample_count: traversals.len(),
        median_travel_secs: stats::median(&travel)?,
        p95_speed_kmh: stats::percentile(&speed, SPEED_PERCENTILE)?,
    })
}

/// Recompute all baselines for a corridor from its traversal history.
///
/// Hourly buckets (UTC hour of traversal start) need `min_samples`
/// traversals; the global bucket exists whenever any traversal does.
/// Output is ordered hourly buckets ascending, then global.
pub fn compute_baselines(
    corridor: CorridorKey,
    traversals: &[Traversal],
    min_samples: usize,
) -> Vec<CorridorBaseline> {
    let mut by_hour: BTreeMap<u8, Vec<&Traversal>> = BTreeMap::new();
    for traversal in traversals {
        by_hour.entry(traversal.hour()).or_default().push(traversal);
    }

    let mut baselines: Vec<CorridorBaseline> = by_hour
        .into_iter()
        .filter(|(_, bucket)| bucket.len() >= min_samples)
        .filter_map(|(hour, bucket)| bucket_baseline(corridor, BaselineBucket::Hour(hour), &bucket))
        .collect();

    let all: Vec<&Traversal> = traversals.iter().collect();
    if let Some(global) = bucket_baseline(corridor, BaselineBucket::Global, &all) {
        baselines.push(global);
    }
    baselines
}

/// Baseline to compare against at `ts_ms`: the hourly bucket for its UTC
/// hour, else the global bucket, else none.
pub fn applicable_baseline(baselines: &[CorridorBaseline], ts_ms: i64) -> Option<&CorridorBaseline> {
    let hour = BaselineBucket::Hour(utc_hour(ts_ms));
    baselines
        .iter()
        .find(|b| b.bucket == hour)
        .or_else(|| baselines.iter().find(|b| b.bucket == BaselineBucket::Global))
}

/// Keyed store of corridor baselines with serialized per-corridor writes
pub struct BaselineStore {
    repo: Arc<dyn CorridorRepository>,
    locks: Vec<Mutex<()>>,
    min_samples: usize,
    max_attempts: u32,
    metrics: Option<Arc<Metrics>>,
}

impl BaselineStore {
    pub fn new(repo: Arc<dyn CorridorRepository>, min_samples: usize, max_attempts: u32) -> Self {
        Self {
            repo,
            locks: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            min_samples,
            max_attempts: max_attempts.max(1),
            metrics: None,
        }
    }

    pub fn from_config(repo: Arc<dyn CorridorRepository>, config: &Config) -> Self {
        Self::new(repo, config.min_samples_hourly(), config.max_write_attempts())
    }

    /// Attach metrics recording
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn min_samples(&self) -> usize {
        self.min_samples
    }

    fn stripe(&self, key: &CorridorKey) -> &Mutex<()> {
        let mut hasher = FxHasher::default();
        key.hash(&mut hasher);
        &self.locks[(hasher.finish() as usize) % self.locks.len()]
    }

    /// Append a traversal to its corridor and recompute the corridor's
    /// baselines. Re-recording a traversal with a known id is a no-op.
    pub fn record(&self, traversal: &Traversal) -> Result<Recorded, PipelineError> {
        let key = traversal.corridor;
        let _guard = self.stripe(&key).lock();

        for attempt in 1..=self.max_attempts {
            let (mut record, expected) = match self.repo.load(&key) {
                Some(stored) => ((*stored.value).clone(), Some(stored.version)),
                None => (CorridorRecord::new(key), None),
            };

            if record.traversals.iter().any(|t| t.id == traversal.id) {
                debug!(corridor = %key, trip_id = %traversal.id.trip_id, "traversal_duplicate");
                return Ok(Recorded { baselines: record.baselines, duplicate: true, attempts: attempt });
            }

            record.traversals.push(traversal.clone());
            record.baselines = compute_baselines(key, &record.traversals, self.min_samples);
            let baselines = record.baselines.clone();
            let samples = record.traversals.len();

            match self.repo.upsert(record, expected) {
                Ok(version) => {
                    debug!(
                        corridor = %key,
                        samples = %samples,
                        buckets = %baselines.len(),
                        version = %version,
                        attempt = %attempt,
                        "baseline_recomputed"
                    );
                    return Ok(Recorded { baselines, duplicate: false, attempts: attempt });
                }
                Err(StoreError::Conflict { expected, actual }) => {
                    if let Some(ref m) = self.metrics {
                        m.record_store_retry();
                    }
                    debug!(
                        corridor = %key,
                        attempt = %attempt,
                        expected = ?expected,
                        actual = ?actual,
                        "baseline_write_conflict"
                    );
                }
            }
        }

        warn!(corridor = %key, attempts = %self.max_attempts, "baseline_write_exhausted");
        if let Some(ref m) = self.metrics {
            m.record_transient_failure();
        }
        Err(PipelineError::Transient { corridor: key.id(), attempts: self.max_attempts })
    }

    /// All baselines currently stored for a corridor
    pub fn baselines(&self, key: &CorridorKey) -> Vec<CorridorBaseline> {
        self.repo.load(key).map(|stored| stored.value.baselines.clone()).unwrap_or_default()
    }

    /// Number of traversals stored for a corridor
    pub fn sample_count(&self, key: &CorridorKey) -> usize {
        self.repo.load(key).map_or(0, |stored| stored.value.traversals.len())
    }

    /// Lookup contract: hourly for the timestamp's UTC hour, else global
    pub fn applicable(&self, key: &CorridorKey, ts_ms: i64) -> Option<CorridorBaseline> {
        applicable_baseline(&self.baselines(key), ts_ms).cloned()
    }

    /// Drop a corridor's traversal history and every bucket derived from it
    pub fn reset(&self, key: &CorridorKey) -> Result<(), PipelineError> {
        let _guard = self.stripe(key).lock();
        for _ in 0..self.max_attempts {
            let Some(stored) = self.repo.load(key) else { return Ok(()) };
            match self.repo.upsert(CorridorRecord::new(*key), Some(stored.version)) {
                Ok(_) => {
                    debug!(corridor = %key, "baseline_reset");
                    return Ok(());
                }
                Err(StoreError::Conflict { .. }) => {
                    if let Some(ref m) = self.metrics {
                        m.record_store_retry();
                    }
                }
            }
        }
        Err(PipelineError::Transient { corridor: key.id(), attempts: self.max_attempts })
    }

    /// Keys of every corridor observed so far
    pub fn corridors(&self) -> Vec<CorridorKey> {
        self.repo.keys()
    }
}
