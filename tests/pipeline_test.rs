//! End-to-end tests: fixes in through the lanes, baselines and alerts out

use corridor_watch::domain::error::{StoreError, ValidationError};
use corridor_watch::domain::types::{
    AlertType, BaselineBucket, CorridorKey, Fix, Point, VehicleId,
};
use corridor_watch::infra::{Config, Metrics};
use corridor_watch::io::fix_source::{submit_jsonl, FileSubmission};
use corridor_watch::io::AlertBus;
use corridor_watch::services::corridor_repository::{CorridorRecord, Versioned};
use corridor_watch::services::corridor_resolver::CorridorResolver;
use corridor_watch::services::{
    create_lanes, AlertRepository, CorridorRepository, IngestCoordinator, MemoryAlertRepository,
    MemoryCorridorRepository,
};
use std::io::Write;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tempfile::NamedTempFile;

/// 2024-03-01T10:00:00Z
const TEN_AM: i64 = 1_709_287_200_000;

const A: Point = Point { lat: 52.52, lon: 13.405 };
const B: Point = Point { lat: 52.54, lon: 13.435 };

struct Pipeline {
    coordinator: Arc<IngestCoordinator>,
    alerts: Arc<MemoryAlertRepository>,
    bus: Arc<AlertBus>,
    metrics: Arc<Metrics>,
}

fn pipeline(config: &Config) -> Pipeline {
    let metrics = Arc::new(Metrics::new());
    let alerts = Arc::new(MemoryAlertRepository::new());
    let bus = Arc::new(AlertBus::new(64, metrics.clone()));
    let coordinator = Arc::new(
        IngestCoordinator::new(
            config,
            Arc::new(MemoryCorridorRepository::new()),
            alerts.clone(),
            bus.clone(),
            metrics.clone(),
        )
        .unwrap(),
    );
    Pipeline { coordinator, alerts, bus, metrics }
}

fn fix(vehicle: &str, ts_ms: i64, p: Point) -> Fix {
    Fix {
        vehicle_id: VehicleId(vehicle.to_string()),
        ts_ms,
        lat: p.lat,
        lon: p.lon,
        speed: None,
        accuracy: None,
        heading: None,
    }
}

/// A, B, A, B... every `step_secs`
fn shuttle(vehicle: &str, start_ms: i64, n: usize, step_secs: i64) -> Vec<Fix> {
    (0..n)
        .map(|i| fix(vehicle, start_ms + i as i64 * step_secs * 1000, if i % 2 == 0 { A } else { B }))
        .collect()
}

fn key(start: Point, end: Point) -> CorridorKey {
    CorridorResolver::default().corridor_key(start, end).unwrap()
}

#[tokio::test]
async fn test_lanes_learn_hourly_baselines() {
    let p = pipeline(&Config::default());
    let (router, workers) = create_lanes(p.coordinator.clone(), 2, 8);
    let handles: Vec<_> = workers.into_iter().map(|w| tokio::spawn(w.run())).collect();

    assert_eq!(router.submit(shuttle("bus-1", TEN_AM, 20, 180)).await.unwrap(), 20);
    drop(router);
    for handle in handles {
        handle.await.unwrap();
    }

    let summary = p.metrics.report();
    assert_eq!(summary.fixes_accepted, 20);
    assert_eq!(summary.gaps_transit, 19);
    assert_eq!(summary.traversals_recorded, 19);

    let baselines = p.coordinator.baselines();
    assert_eq!(baselines.sample_count(&key(A, B)), 10);
    assert_eq!(baselines.sample_count(&key(B, A)), 9);

    let hourly = baselines.applicable(&key(A, B), TEN_AM).unwrap();
    assert_eq!(hourly.bucket, BaselineBucket::Hour(10));
    assert_eq!(hourly.sample_count, 10);
    assert_eq!(hourly.median_travel_secs, 180.0);

    // No hourly bucket at 15:00, global fallback
    let later = baselines.applicable(&key(A, B), TEN_AM + 5 * 3_600_000).unwrap();
    assert_eq!(later.bucket, BaselineBucket::Global);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_vehicles_share_corridors_without_lost_updates() {
    let p = pipeline(&Config::default().with_lanes(4));
    let (router, workers) = create_lanes(p.coordinator.clone(), 4, 4);
    let handles: Vec<_> = workers.into_iter().map(|w| tokio::spawn(w.run())).collect();

    let mut submitters = Vec::new();
    for v in 0..8 {
        let router = router.clone();
        submitters.push(tokio::spawn(async move {
            let vehicle = format!("bus-{v}");
            let fixes = shuttle(&vehicle, TEN_AM, 20, 180);
            // Two batches per vehicle; the second continues the open trip
            router.submit(fixes[..10].to_vec()).await.unwrap();
            router.submit(fixes[10..].to_vec()).await.unwrap();
        }));
    }
    for submitter in submitters {
        submitter.await.unwrap();
    }
    drop(router);
    for handle in handles {
        handle.await.unwrap();
    }

    let baselines = p.coordinator.baselines();
    assert_eq!(baselines.sample_count(&key(A, B)), 80);
    assert_eq!(baselines.sample_count(&key(B, A)), 72);
    assert_eq!(baselines.applicable(&key(A, B), TEN_AM).unwrap().sample_count, 80);

    let summary = p.metrics.report();
    assert_eq!(summary.traversals_recorded, 152);
    assert_eq!(summary.transient_failures, 0);
}

#[test]
fn test_reingesting_a_batch_changes_nothing() {
    let p = pipeline(&Config::default());
    let fixes = shuttle("bus-1", TEN_AM, 12, 180);
    p.coordinator.ingest(fixes.clone()).unwrap();
    let before = p.coordinator.baselines().baselines(&key(A, B));

    let again = p.coordinator.ingest(fixes).unwrap();
    assert_eq!(again.accepted, 0);
    assert_eq!(again.late, 12);
    assert_eq!(p.coordinator.baselines().baselines(&key(A, B)), before);
    assert_eq!(p.coordinator.baselines().sample_count(&key(A, B)), 6);
}

#[test]
fn test_invalid_fix_rejects_every_vehicle_in_batch() {
    let p = pipeline(&Config::default());
    let mut fixes = shuttle("bus-1", TEN_AM, 6, 180);
    let mut other = shuttle("bus-2", TEN_AM, 3, 180);
    other[1].lon = 200.0;
    fixes.extend(other);

    let err = p.coordinator.ingest(fixes).unwrap_err();
    assert!(matches!(err, ValidationError::LongitudeOutOfRange { index: 7, .. }));
    assert!(p.coordinator.baselines().corridors().is_empty());
    assert!(p.coordinator.segmenter().current_trip(&VehicleId("bus-1".into())).is_none());
    assert_eq!(p.coordinator.segmenter().open_trips(), 0);
}

#[test]
fn test_delay_alert_deduplicated_until_resolved() {
    let config = Config::from_toml_str("[detection]\nextended_gap_secs = 3600.0\n", "inline")
        .unwrap();
    let p = pipeline(&config);
    let mut published = p.bus.subscribe("test");

    // Baseline: six 3-minute A->B legs in hour 10, ending at A
    p.coordinator.ingest(shuttle("bus-1", TEN_AM, 13, 180)).unwrap();
    let last = TEN_AM + 12 * 180_000;

    // Two 19-minute A->B legs on the same trip
    let report = p
        .coordinator
        .ingest(vec![
            fix("bus-1", last + 19 * 60_000, B),
            fix("bus-1", last + 22 * 60_000, A),
            fix("bus-1", last + 41 * 60_000, B),
        ])
        .unwrap();
    assert_eq!(report.alerts().count(), 1);
    assert_eq!(p.metrics.report().alerts_suppressed, 1);

    let first = published.try_recv().unwrap();
    assert_eq!(first.alert_type, AlertType::Delay);
    assert_eq!(first.corridor_id, key(A, B).id());
    assert_eq!(first.delta_value, 960.0);
    assert!(published.try_recv().is_none());
    assert_eq!(p.alerts.unresolved().len(), 1);

    assert!(p.alerts.resolve(&first.id));
    assert!(p.alerts.unresolved().is_empty());

    // Same trip, same corridor: a fresh alert once the first is resolved
    let report = p
        .coordinator
        .ingest(vec![fix("bus-1", last + 44 * 60_000, A), fix("bus-1", last + 63 * 60_000, B)])
        .unwrap();
    let raised: Vec<_> = report.alerts().collect();
    assert_eq!(raised.len(), 1);
    assert_ne!(raised[0].id, first.id);
    assert_eq!(raised[0].trip_id, first.trip_id);

    let second = published.try_recv().unwrap();
    assert_eq!(second.id, raised[0].id);
    assert_eq!(p.alerts.unresolved().len(), 1);
    assert_eq!(p.alerts.resolved().len(), 1);
}

/// Corridor store whose first `conflicts` writes lose the version race
struct ConflictingRepository {
    inner: MemoryCorridorRepository,
    conflicts: AtomicU32,
}

impl CorridorRepository for ConflictingRepository {
    fn load(&self, key: &CorridorKey) -> Option<Versioned<Arc<CorridorRecord>>> {
        self.inner.load(key)
    }

    fn upsert(&self, record: CorridorRecord, expected: Option<u64>) -> Result<u64, StoreError> {
        let remaining = self.conflicts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.conflicts.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Conflict { expected, actual: Some(u64::MAX) });
        }
        self.inner.upsert(record, expected)
    }

    fn keys(&self) -> Vec<CorridorKey> {
        self.inner.keys()
    }
}

#[tokio::test]
async fn test_lane_redelivers_traversal_after_store_contention() {
    let metrics = Arc::new(Metrics::new());
    // exhausts the first write's 5 attempts, then fails twice more
    let corridors = Arc::new(ConflictingRepository {
        inner: MemoryCorridorRepository::new(),
        conflicts: AtomicU32::new(7),
    });
    let coordinator = Arc::new(
        IngestCoordinator::new(
            &Config::default(),
            corridors,
            Arc::new(MemoryAlertRepository::new()),
            Arc::new(AlertBus::new(8, metrics.clone())),
            metrics.clone(),
        )
        .unwrap(),
    );
    let (router, workers) = create_lanes(coordinator.clone(), 1, 4);
    let handles: Vec<_> = workers.into_iter().map(|w| tokio::spawn(w.run())).collect();

    router.submit(shuttle("bus-1", TEN_AM, 2, 180)).await.unwrap();
    drop(router);
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(coordinator.baselines().sample_count(&key(A, B)), 1);
    let summary = metrics.report();
    assert_eq!(summary.transient_failures, 1);
    assert_eq!(summary.traversals_recorded, 1);
    assert_eq!(summary.store_retries, 7);
}

#[tokio::test]
async fn test_fix_file_with_bad_line_keeps_good_lines() {
    let p = pipeline(&Config::default());
    let (router, workers) = create_lanes(p.coordinator.clone(), 2, 8);
    let handles: Vec<_> = workers.into_iter().map(|w| tokio::spawn(w.run())).collect();

    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, r#"{{"vehicleId":"bus-1","ts":"2024-03-01T10:00:00Z","lat":52.52,"lon":13.405}}"#)
        .unwrap();
    writeln!(file, r#"{{"vehicleId":"bus-1","ts":"bogus","lat":52.54,"lon":13.435}}"#).unwrap();
    writeln!(file, r#"{{"vehicleId":"bus-1","ts":"2024-03-01T10:03:00Z","lat":52.54,"lon":13.435}}"#)
        .unwrap();
    file.flush().unwrap();

    let summary = submit_jsonl(file.path(), &router, &p.metrics).await.unwrap();
    assert_eq!(summary, FileSubmission { batches: 2, fixes: 2, rejected_batches: 1 });

    drop(router);
    for handle in handles {
        handle.await.unwrap();
    }

    let metrics = p.metrics.report();
    assert_eq!(metrics.fixes_accepted, 2);
    assert_eq!(metrics.batches_rejected, 1);
    assert_eq!(metrics.fixes_rejected, 1);
    assert_eq!(p.coordinator.baselines().sample_count(&key(A, B)), 1);
}
