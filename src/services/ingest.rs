//! Ingestion coordinator
//!
//! Drives one fix batch through the pipeline:
//! validate -> group by vehicle -> segment into trips -> detect drops ->
//! resolve transit gaps to corridors -> record traversal and read back
//! baselines -> evaluate alerts.
//!
//! Validation covers the whole batch before any state is touched. After
//! that, a failure on one traversal is reported with its trip and
//! processing continues with the rest. A traversal whose write ran out of
//! retries is handed back in `TripReport::pending`; the fixes that produced
//! it are already consumed, so it is retried with `redeliver`, never by
//! re-ingesting the batch.

use crate::domain::error::{PipelineError, ValidationError};
use crate::domain::types::{Alert, Fix, GapClass, Point, Traversal, TripId, VehicleId};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::services::alert_engine::{AlertEngine, AlertPublisher};
use crate::services::alert_repository::AlertRepository;
use crate::services::baseline_store::BaselineStore;
use crate::services::corridor_repository::CorridorRepository;
use crate::services::corridor_resolver::{validate_point, CorridorResolver, Resolved};
use crate::services::drop_detector::{DetectionParams, DropDetector, GapCounts};
use crate::services::trip_segmenter::{TripSegment, TripSegmenter};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// What happened to one trip segment
#[derive(Debug, Clone)]
pub struct TripReport {
    pub trip_id: TripId,
    pub vehicle_id: VehicleId,
    /// Fixes from the batch assigned to this trip
    pub fixes: usize,
    pub gaps: GapCounts,
    pub modal_interval_secs: Option<f64>,
    /// Traversals newly recorded
    pub traversals: usize,
    /// Traversals already stored (redelivery)
    pub duplicates: usize,
    /// Transit gaps dropped by corridor quality filters
    pub rejected: usize,
    /// Traversals whose write exhausted its retries, for `redeliver`
    pub pending: Vec<Traversal>,
    pub alerts: Vec<Alert>,
}

impl TripReport {
    fn new(segment: &TripSegment) -> Self {
        Self {
            trip_id: segment.trip.id.clone(),
            vehicle_id: segment.trip.vehicle_id.clone(),
            fixes: segment.new_fixes,
            gaps: GapCounts::default(),
            modal_interval_secs: None,
            traversals: 0,
            duplicates: 0,
            rejected: 0,
            pending: Vec::new(),
            alerts: Vec::new(),
        }
    }

    /// Share of this trip's gaps that were micro drops
    pub fn instability_ratio(&self) -> f64 {
        self.gaps.instability_ratio()
    }

    pub fn transient_failures(&self) -> usize {
        self.pending.len()
    }
}

/// Outcome of one ingested batch
#[derive(Debug, Clone, Default)]
pub struct IngestReport {
    /// Fixes assigned to trips
    pub accepted: usize,
    /// Fixes skipped as late or duplicate
    pub late: usize,
    pub trips: Vec<TripReport>,
}

impl IngestReport {
    pub fn traversals(&self) -> usize {
        self.trips.iter().map(|t| t.traversals).sum()
    }

    pub fn transient_failures(&self) -> usize {
        self.trips.iter().map(|t| t.pending.len()).sum()
    }

    /// Take every traversal left unrecorded by a transient store failure
    pub fn take_pending(&mut self) -> Vec<Traversal> {
        self.trips.iter_mut().flat_map(|t| std::mem::take(&mut t.pending)).collect()
    }

    pub fn gaps(&self) -> GapCounts {
        let mut total = GapCounts::default();
        for trip in &self.trips {
            total.add(&trip.gaps);
        }
        total
    }

    pub fn alerts(&self) -> impl Iterator<Item = &Alert> {
        self.trips.iter().flat_map(|t| t.alerts.iter())
    }
}

/// Outcome of applying one traversal to its corridor
#[derive(Debug, Clone, Default)]
pub struct Applied {
    /// Already stored; nothing changed and nothing was evaluated
    pub duplicate: bool,
    pub alerts: Vec<Alert>,
}

/// Reject the batch if any fix is malformed; `index` is the position in the batch
pub fn validate_batch(fixes: &[Fix]) -> Result<(), ValidationError> {
    for (index, fix) in fixes.iter().enumerate() {
        if fix.vehicle_id.0.trim().is_empty() {
            return Err(ValidationError::EmptyVehicleId { index });
        }
        validate_point(index, Point { lat: fix.lat, lon: fix.lon })?;
        if chrono::DateTime::from_timestamp_millis(fix.ts_ms).is_none() {
            return Err(ValidationError::InvalidTimestamp { index, value: fix.ts_ms.to_string() });
        }
    }
    Ok(())
}

/// Stateful pipeline shared by all ingest lanes
pub struct IngestCoordinator {
    segmenter: TripSegmenter,
    detector: DropDetector,
    resolver: CorridorResolver,
    baselines: BaselineStore,
    alerts: AlertEngine,
    metrics: Arc<Metrics>,
}

impl IngestCoordinator {
    /// Wire the pipeline from config and its storage/fan-out collaborators
    pub fn new(
        config: &Config,
        corridors: Arc<dyn CorridorRepository>,
        alerts: Arc<dyn AlertRepository>,
        publisher: Arc<dyn AlertPublisher>,
        metrics: Arc<Metrics>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            segmenter: TripSegmenter::new(config.inactivity_ms()),
            detector: DropDetector::new(DetectionParams::from_config(config)),
            resolver: CorridorResolver::from_config(config)?,
            baselines: BaselineStore::from_config(corridors, config).with_metrics(metrics.clone()),
            alerts: AlertEngine::from_config(config, alerts, publisher)
                .with_metrics(metrics.clone()),
            metrics,
        })
    }

    pub fn baselines(&self) -> &BaselineStore {
        &self.baselines
    }

    pub fn segmenter(&self) -> &TripSegmenter {
        &self.segmenter
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Process one batch of fixes from any number of vehicles
    pub fn ingest(&self, fixes: Vec<Fix>) -> Result<IngestReport, ValidationError> {
        let start = Instant::now();

        if let Err(e) = validate_batch(&fixes) {
            warn!(error = %e, fixes = %fixes.len(), "batch_rejected");
            self.metrics.record_batch_rejected(fixes.len());
            return Err(e);
        }

        let mut by_vehicle: BTreeMap<VehicleId, Vec<Fix>> = BTreeMap::new();
        for fix in fixes {
            by_vehicle.entry(fix.vehicle_id.clone()).or_default().push(fix);
        }

        let mut report = IngestReport::default();
        for (vehicle_id, mut vehicle_fixes) in by_vehicle {
            vehicle_fixes.sort_by_key(|f| f.ts_ms);
            let segmentation = self.segmenter.segment(&vehicle_id, &vehicle_fixes);

            if segmentation.late > 0 {
                debug!(vehicle_id = %vehicle_id, late = %segmentation.late, "fixes_late");
                self.metrics.record_fixes_late(segmentation.late);
                report.late += segmentation.late;
            }

            for segment in &segmentation.segments {
                if segment.opened {
                    self.metrics.record_trip_opened();
                }
                report.accepted += segment.new_fixes;
                report.trips.push(self.process_trip(segment));
            }
        }

        self.metrics.record_fixes_accepted(report.accepted);
        self.metrics.set_open_trips(self.segmenter.open_trips());
        self.metrics.record_batch_processed(start.elapsed().as_micros() as u64);
        Ok(report)
    }

    fn process_trip(&self, segment: &TripSegment) -> TripReport {
        let mut trip_report = TripReport::new(segment);
        let drops = self.detector.detect(&segment.fixes);
        self.metrics.record_gaps(&drops.counts);
        trip_report.gaps = drops.counts;
        trip_report.modal_interval_secs = drops.modal_interval_secs;

        // Micro and extended gaps never reach the resolver
        for gap in drops.events.iter().filter(|g| g.class == GapClass::Transit) {
            match self.resolver.resolve(gap, &segment.trip.id, &segment.trip.vehicle_id) {
                Ok(Resolved::Traversal(traversal)) => {
                    self.record_traversal(&traversal, &mut trip_report);
                }
                Ok(Resolved::Rejected(rejection)) => {
                    self.metrics.record_rejection(&rejection);
                    trip_report.rejected += 1;
                }
                Err(e) => {
                    warn!(trip_id = %segment.trip.id, error = %e, "gap_invalid");
                    self.metrics.record_invalid_gap();
                    trip_report.rejected += 1;
                }
            }
        }

        if trip_report.gaps.total() > 0 {
            info!(
                trip_id = %trip_report.trip_id,
                vehicle_id = %trip_report.vehicle_id,
                fixes = %trip_report.fixes,
                micro = %trip_report.gaps.micro,
                transit = %trip_report.gaps.transit,
                extended = %trip_report.gaps.extended,
                instability = %format!("{:.3}", trip_report.instability_ratio()),
                modal_interval_secs = ?trip_report.modal_interval_secs,
                traversals = %trip_report.traversals,
                alerts = %trip_report.alerts.len(),
                "trip_processed"
            );
        }

        trip_report
    }

    /// Record a traversal, then evaluate it against the baselines read back
    /// from the write
    fn apply(&self, traversal: &Traversal) -> Result<Applied, PipelineError> {
        let recorded = self.baselines.record(traversal)?;
        self.metrics.record_traversal(recorded.duplicate);
        if recorded.duplicate {
            return Ok(Applied { duplicate: true, alerts: Vec::new() });
        }
        let alerts = self.alerts.evaluate(traversal, &recorded.baselines).into_vec();
        Ok(Applied { duplicate: false, alerts })
    }

    /// Retry a traversal returned in `TripReport::pending`.
    ///
    /// Idempotent on the traversal id: a traversal that did get stored is
    /// reported as a duplicate and raises nothing.
    pub fn redeliver(&self, traversal: &Traversal) -> Result<Applied, PipelineError> {
        let applied = self.apply(traversal)?;
        debug!(
            trip_id = %traversal.id.trip_id,
            corridor = %traversal.corridor,
            duplicate = %applied.duplicate,
            alerts = %applied.alerts.len(),
            "traversal_redelivered"
        );
        Ok(applied)
    }

    fn record_traversal(&self, traversal: &Traversal, trip_report: &mut TripReport) {
        match self.apply(traversal) {
            Ok(applied) if applied.duplicate => {
                trip_report.duplicates += 1;
            }
            Ok(applied) => {
                trip_report.traversals += 1;
                trip_report.alerts.extend(applied.alerts);
            }
            Err(e @ PipelineError::Transient { .. }) => {
                warn!(trip_id = %traversal.id.trip_id, error = %e, "traversal_pending");
                trip_report.pending.push(traversal.clone());
            }
            Err(PipelineError::Validation(e)) => {
                warn!(trip_id = %traversal.id.trip_id, error = %e, "traversal_invalid");
                trip_report.rejected += 1;
            }
        }
    }
}
