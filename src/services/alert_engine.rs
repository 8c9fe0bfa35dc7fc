//! Alert engine: compares a traversal against its corridor baseline
//!
//! Two independent checks per traversal:
//! - delay: travel time exceeds the median by at least the delay threshold
//! - overspeed: average speed exceeds the p95 speed
//!
//! Severity comes from the deviation relative to the baseline value it was
//! measured against: >= 2x high, >= 1.5x medium, otherwise low. An existing
//! unresolved alert for the same (trip, corridor, type) suppresses a new one;
//! it is never escalated.

use crate::domain::types::{
    epoch_ms, new_uuid_v7, Alert, AlertDetails, AlertKey, AlertType, CorridorBaseline, Severity,
    Traversal,
};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::services::alert_repository::AlertRepository;
use crate::services::baseline_store::applicable_baseline;
use smallvec::SmallVec;
use std::sync::Arc;
use tracing::{debug, info};

/// Outbound fan-out for newly created alerts. Must not block.
pub trait AlertPublisher: Send + Sync {
    fn publish(&self, alert: &Alert);
}

/// A check that fired, before deduplication
#[derive(Debug, Clone, PartialEq)]
pub struct Finding {
    pub alert_type: AlertType,
    pub delta: f64,
    pub severity: Severity,
    pub details: AlertDetails,
}

fn severity_for(delta: f64, reference: f64) -> Severity {
    if reference > 0.0 {
        Severity::from_ratio(delta.abs() / reference)
    } else {
        Severity::High
    }
}

/// Run both checks against a resolved baseline
pub fn check(
    traversal: &Traversal,
    baseline: &CorridorBaseline,
    delay_threshold_secs: f64,
) -> SmallVec<[Finding; 2]> {
    let mut findings = SmallVec::new();

    let delay = traversal.travel_secs - baseline.median_travel_secs;
    if delay >= delay_threshold_secs {
        findings.push(Finding {
            alert_type: AlertType::Delay,
            delta: delay,
            severity: severity_for(delay, baseline.median_travel_secs),
            details: AlertDetails {
                bucket: baseline.bucket,
                baseline_value: baseline.median_travel_secs,
                actual_value: traversal.travel_secs,
                threshold: delay_threshold_secs,
                sample_count: baseline.sample_count,
            },
        });
    }

    let overspeed = traversal.avg_speed_kmh - baseline.p95_speed_kmh;
    if overspeed > 0.0 && baseline.p95_speed_kmh > 0.0 {
        findings.push(Finding {
            alert_type: AlertType::Overspeed,
            delta: overspeed,
            severity: severity_for(overspeed, baseline.p95_speed_kmh),
            details: AlertDetails {
                bucket: baseline.bucket,
                baseline_value: baseline.p95_speed_kmh,
                actual_value: traversal.avg_speed_kmh,
                threshold: baseline.p95_speed_kmh,
                sample_count: baseline.sample_count,
            },
        });
    }

    findings
}

/// Evaluates traversals, deduplicates and publishes alerts
pub struct AlertEngine {
    delay_threshold_secs: f64,
    alerts: Arc<dyn AlertRepository>,
    publisher: Arc<dyn AlertPublisher>,
    metrics: Option<Arc<Metrics>>,
}

impl AlertEngine {
    pub fn new(
        delay_threshold_minutes: f64,
        alerts: Arc<dyn AlertRepository>,
        publisher: Arc<dyn AlertPublisher>,
    ) -> Self {
        Self { delay_threshold_secs: delay_threshold_minutes * 60.0, alerts, publisher, metrics: None }
    }

    pub fn from_config(
        config: &Config,
        alerts: Arc<dyn AlertRepository>,
        publisher: Arc<dyn AlertPublisher>,
    ) -> Self {
        Self::new(config.delay_threshold_minutes(), alerts, publisher)
    }

    /// Attach metrics recording
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn delay_threshold_secs(&self) -> f64 {
        self.delay_threshold_secs
    }

    /// Evaluate a traversal against its corridor's baselines.
    ///
    /// Returns the alerts created (zero, one, or one of each type). No
    /// baselines, or no applicable one, means the traversal is undecidable.
    pub fn evaluate(
        &self,
        traversal: &Traversal,
        baselines: &[CorridorBaseline],
    ) -> SmallVec<[Alert; 2]> {
        let mut created = SmallVec::new();
        if baselines.is_empty() {
            return created;
        }
        let Some(baseline) = applicable_baseline(baselines, traversal.start_ms) else {
            return created;
        };

        for finding in check(traversal, baseline, self.delay_threshold_secs) {
            let key = AlertKey {
                trip_id: traversal.id.trip_id.clone(),
                corridor: traversal.corridor,
                alert_type: finding.alert_type,
            };
            if let Some(existing) = self.alerts.find_unresolved(&key) {
                self.suppressed(&existing, &finding);
                continue;
            }

            let alert = Alert {
                id: new_uuid_v7(),
                alert_type: finding.alert_type,
                severity: finding.severity,
                time: epoch_ms(),
                corridor_id: traversal.corridor.id(),
                corridor: traversal.corridor,
                trip_id: traversal.id.trip_id.clone(),
                vehicle_id: traversal.vehicle_id.clone(),
                delta_value: finding.delta,
                details: finding.details.clone(),
                resolved: false,
            };

            // Lost the race to a concurrent writer for the same key
            if !self.alerts.insert_unique(alert.clone()) {
                if let Some(existing) = self.alerts.find_unresolved(&key) {
                    self.suppressed(&existing, &finding);
                }
                continue;
            }

            info!(
                alert_id = %alert.id,
                alert_type = %alert.alert_type.as_str(),
                severity = %alert.severity.as_str(),
                corridor = %alert.corridor_id,
                trip_id = %alert.trip_id,
                vehicle_id = %alert.vehicle_id,
                delta = %alert.delta_value,
                bucket = %alert.details.bucket,
                "alert_raised"
            );
            if let Some(ref m) = self.metrics {
                m.record_alert_raised(alert.alert_type);
            }
            self.publisher.publish(&alert);
            created.push(alert);
        }

        created
    }

    fn suppressed(&self, existing: &Alert, finding: &Finding) {
        debug!(
            alert_id = %existing.id,
            alert_type = %finding.alert_type.as_str(),
            trip_id = %existing.trip_id,
            corridor = %existing.corridor_id,
            delta = %finding.delta,
            "alert_suppressed"
        );
        if let Some(ref m) = self.metrics {
            m.record_alert_suppressed();
        }
    }
}
