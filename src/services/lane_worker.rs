//! Ingest lanes - parallel batch processing keyed by vehicle
//!
//! Each vehicle hashes to exactly one lane, so its fixes are processed in
//! arrival order by a single worker. Different lanes run concurrently and
//! only meet in the baseline store and alert repository, which serialize
//! per corridor and per alert key.
//!
//! Traversals a batch could not store are redelivered by the same lane a
//! bounded number of times before the next batch is taken.

use crate::domain::error::{PipelineError, ValidationError};
use crate::domain::types::{Fix, Traversal, VehicleId};
use crate::services::ingest::{validate_batch, IngestCoordinator};
use rustc_hash::FxHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Redelivery rounds for traversals left pending by a batch
const REDELIVERY_ROUNDS: u32 = 3;

/// Backoff before redelivery round n is n times this
const REDELIVERY_BACKOFF: Duration = Duration::from_millis(20);

/// A per-lane slice of an inbound batch
#[derive(Debug)]
pub struct LaneBatch {
    pub fixes: Vec<Fix>,
    /// When the batch was enqueued (for queue delay measurement)
    pub enqueued_at: Instant,
}

/// Worker that owns one lane
pub struct LaneWorker {
    lane: usize,
    coordinator: Arc<IngestCoordinator>,
    rx: mpsc::Receiver<LaneBatch>,
}

impl LaneWorker {
    /// Run the worker, processing batches until every sender is dropped
    pub async fn run(mut self) {
        info!(lane = %self.lane, "lane_worker_started");

        while let Some(batch) = self.rx.recv().await {
            let queue_delay_us = batch.enqueued_at.elapsed().as_micros() as u64;
            let fixes = batch.fixes.len();

            match self.coordinator.ingest(batch.fixes) {
                Ok(mut report) => {
                    debug!(
                        lane = %self.lane,
                        fixes = %fixes,
                        accepted = %report.accepted,
                        late = %report.late,
                        trips = %report.trips.len(),
                        traversals = %report.traversals(),
                        alerts = %report.alerts().count(),
                        queue_delay_us = %queue_delay_us,
                        "lane_batch_processed"
                    );
                    if report.transient_failures() > 0 {
                        warn!(
                            lane = %self.lane,
                            failures = %report.transient_failures(),
                            "lane_batch_partial"
                        );
                        self.redeliver(report.take_pending()).await;
                    }
                }
                Err(e) => {
                    warn!(lane = %self.lane, error = %e, "lane_batch_rejected");
                }
            }
        }

        info!(lane = %self.lane, "lane_worker_stopped");
    }

    async fn redeliver(&self, mut pending: Vec<Traversal>) {
        for round in 1..=REDELIVERY_ROUNDS {
            if pending.is_empty() {
                return;
            }
            tokio::time::sleep(REDELIVERY_BACKOFF * round).await;
            pending.retain(|traversal| match self.coordinator.redeliver(traversal) {
                Ok(_) => false,
                Err(PipelineError::Transient { .. }) => true,
                Err(e) => {
                    warn!(lane = %self.lane, trip_id = %traversal.id.trip_id, error = %e, "traversal_invalid");
                    false
                }
            });
        }

        for traversal in &pending {
            warn!(
                lane = %self.lane,
                trip_id = %traversal.id.trip_id,
                corridor = %traversal.corridor,
                rounds = %REDELIVERY_ROUNDS,
                "traversal_dropped"
            );
        }
    }
}

/// Splits batches by vehicle and hands each slice to its lane
#[derive(Clone)]
pub struct LaneRouter {
    lanes: Vec<mpsc::Sender<LaneBatch>>,
}

impl LaneRouter {
    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    /// Lane a vehicle is pinned to
    pub fn lane_for(&self, vehicle_id: &VehicleId) -> usize {
        let mut hasher = FxHasher::default();
        vehicle_id.hash(&mut hasher);
        (hasher.finish() as usize) % self.lanes.len()
    }

    /// Validate a batch as a whole, then enqueue its per-lane slices.
    ///
    /// Waits when a lane queue is full. Returns the number of fixes enqueued.
    pub async fn submit(&self, fixes: Vec<Fix>) -> Result<usize, ValidationError> {
        validate_batch(&fixes)?;

        let mut slices: Vec<Vec<Fix>> = vec![Vec::new(); self.lanes.len()];
        for fix in fixes {
            let lane = self.lane_for(&fix.vehicle_id);
            slices[lane].push(fix);
        }

        let enqueued_at = Instant::now();
        let mut enqueued = 0;
        for (lane, slice) in slices.into_iter().enumerate() {
            if slice.is_empty() {
                continue;
            }
            let count = slice.len();
            if self.lanes[lane].send(LaneBatch { fixes: slice, enqueued_at }).await.is_err() {
                warn!(lane = %lane, fixes = %count, "lane_closed");
                continue;
            }
            enqueued += count;
        }
        Ok(enqueued)
    }
}

/// Create the router and its lane workers
///
/// Returns the router (for inbound adapters) and the workers (to be spawned)
pub fn create_lanes(
    coordinator: Arc<IngestCoordinator>,
    lanes: usize,
    queue_depth: usize,
) -> (LaneRouter, Vec<LaneWorker>) {
    let lanes = lanes.max(1);
    let mut senders = Vec::with_capacity(lanes);
    let mut workers = Vec::with_capacity(lanes);
    for lane in 0..lanes {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        senders.push(tx);
        workers.push(LaneWorker { lane, coordinator: coordinator.clone(), rx });
    }
    (LaneRouter { lanes: senders }, workers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::Alert;
    use crate::infra::config::Config;
    use crate::infra::metrics::Metrics;
    use crate::services::alert_engine::AlertPublisher;
    use crate::services::alert_repository::MemoryAlertRepository;
    use crate::services::corridor_repository::MemoryCorridorRepository;

    struct Discard;

    impl AlertPublisher for Discard {
        fn publish(&self, _alert: &Alert) {}
    }

    fn coordinator() -> Arc<IngestCoordinator> {
        Arc::new(
            IngestCoordinator::new(
                &Config::default(),
                Arc::new(MemoryCorridorRepository::new()),
                Arc::new(MemoryAlertRepository::new()),
                Arc::new(Discard),
                Arc::new(Metrics::new()),
            )
            .unwrap(),
        )
    }

    fn fix(vehicle: &str, ts_ms: i64) -> Fix {
        Fix {
            vehicle_id: VehicleId(vehicle.to_string()),
            ts_ms,
            lat: 52.5,
            lon: 13.4,
            speed: None,
            accuracy: None,
            heading: None,
        }
    }

    #[test]
    fn test_vehicle_pinned_to_one_lane() {
        let (router, _workers) = create_lanes(coordinator(), 4, 8);
        let v = VehicleId("bus-17".to_string());
        let lane = router.lane_for(&v);
        assert!(lane < 4);
        for _ in 0..10 {
            assert_eq!(router.lane_for(&v), lane);
        }
    }

    #[test]
    fn test_zero_lanes_clamped() {
        let (router, workers) = create_lanes(coordinator(), 0, 0);
        assert_eq!(router.lane_count(), 1);
        assert_eq!(workers.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_batch_not_enqueued() {
        let (router, _workers) = create_lanes(coordinator(), 2, 8);
        let mut bad = fix("v1", 0);
        bad.lon = 200.0;
        let result = router.submit(vec![fix("v2", 0), bad]).await;
        assert!(matches!(result, Err(ValidationError::LongitudeOutOfRange { index: 1, .. })));
    }

    #[tokio::test]
    async fn test_workers_drain_and_stop() {
        let coordinator = coordinator();
        let (router, workers) = create_lanes(coordinator.clone(), 3, 8);
        let handles: Vec<_> = workers.into_iter().map(|w| tokio::spawn(w.run())).collect();

        let fixes: Vec<Fix> = (0..6).map(|i| fix(&format!("v{i}"), 1_000)).collect();
        assert_eq!(router.submit(fixes).await.unwrap(), 6);

        drop(router);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(coordinator.segmenter().open_trips(), 6);
        assert_eq!(coordinator.metrics().report().fixes_accepted, 6);
    }
}
