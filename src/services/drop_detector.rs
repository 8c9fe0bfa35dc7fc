//! Drop detection: turns one trip's ordered fixes into classified gap events
//!
//! Classification keys off fixed thresholds only. The trip's modal sampling
//! interval is computed and reported for diagnostics but does not move the
//! micro/transit/extended boundaries.

use crate::domain::types::{Fix, GapClass, GapEvent, Point};
use crate::infra::config::Config;
use crate::services::stats;
use serde::Serialize;

/// Thresholds used for gap classification
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionParams {
    /// Detection threshold tau_short (seconds)
    pub tau_short_secs: f64,
    /// Gaps up to tau_short * micro_factor are micro drops
    pub micro_factor: f64,
    /// Gaps above this ceiling are vehicle inactivity
    pub extended_gap_secs: f64,
    /// Only gaps below this contribute to the modal interval estimate
    pub modal_window_secs: f64,
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            tau_short_secs: 60.0,
            micro_factor: 1.2,
            extended_gap_secs: 600.0,
            modal_window_secs: 300.0,
        }
    }
}

impl DetectionParams {
    pub fn from_config(config: &Config) -> Self {
        Self {
            tau_short_secs: config.tau_short_secs(),
            micro_factor: config.micro_factor(),
            extended_gap_secs: config.extended_gap_secs(),
            modal_window_secs: config.modal_window_secs(),
        }
    }

    /// Classify a gap already known to exceed tau_short
    #[inline]
    pub fn classify(&self, gap_secs: f64) -> GapClass {
        if gap_secs > self.extended_gap_secs {
            GapClass::Extended
        } else if gap_secs <= self.tau_short_secs * self.micro_factor {
            GapClass::Micro
        } else {
            GapClass::Transit
        }
    }
}

/// Per-class gap counts for one detection run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GapCounts {
    pub micro: usize,
    pub transit: usize,
    pub extended: usize,
}

impl GapCounts {
    pub fn record(&mut self, class: GapClass) {
        match class {
            GapClass::Micro => self.micro += 1,
            GapClass::Transit => self.transit += 1,
            GapClass::Extended => self.extended += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.micro + self.transit + self.extended
    }

    pub fn add(&mut self, other: &GapCounts) {
        self.micro += other.micro;
        self.transit += other.transit;
        self.extended += other.extended;
    }

    /// Share of detected gaps that were micro drops (0 when no gaps)
    pub fn instability_ratio(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            n => self.micro as f64 / n as f64,
        }
    }
}

/// Output of a detection run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DropReport {
    pub events: Vec<GapEvent>,
    pub counts: GapCounts,
    /// Median inter-fix gap under the modal window, if any
    pub modal_interval_secs: Option<f64>,
}

/// Stateless gap detector
#[derive(Debug, Clone, Copy, Default)]
pub struct DropDetector {
    params: DetectionParams,
}

impl DropDetector {
    pub fn new(params: DetectionParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &DetectionParams {
        &self.params
    }

    /// Detect gaps over fixes sorted by timestamp.
    ///
    /// Fewer than two fixes yields an empty report.
    pub fn detect(&self, fixes: &[Fix]) -> DropReport {
        if fixes.len() < 2 {
            return DropReport::default();
        }

        let gaps: Vec<f64> =
            fixes.windows(2).map(|w| (w[1].ts_ms - w[0].ts_ms) as f64 / 1000.0).collect();

        let cadence: Vec<f64> =
            gaps.iter().copied().filter(|g| *g < self.params.modal_window_secs).collect();
        let modal_interval_secs = stats::median(&cadence);

        let mut report = DropReport { modal_interval_secs, ..DropReport::default() };

        for (pair, &gap_secs) in fixes.windows(2).zip(&gaps) {
            if gap_secs <= self.params.tau_short_secs {
                continue;
            }
            let class = self.params.classify(gap_secs);
            report.counts.record(class);
            report.events.push(GapEvent {
                start_ms: pair[0].ts_ms,
                end_ms: pair[1].ts_ms,
                start: Point { lat: pair[0].lat, lon: pair[0].lon },
                end: Point { lat: pair[1].lat, lon: pair[1].lon },
                duration_secs: gap_secs,
                class,
            });
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::VehicleId;

    fn fix_at(secs: i64) -> Fix {
        Fix {
            vehicle_id: VehicleId("v1".to_string()),
            ts_ms: secs * 1000,
            lat: 52.0 + secs as f64 * 1e-4,
            lon: 13.0,
            speed: None,
            accuracy: None,
            heading: None,
        }
    }

    fn fixes_at(secs: &[i64]) -> Vec<Fix> {
        secs.iter().map(|&s| fix_at(s)).collect()
    }

    #[test]
    fn test_fewer_than_two_fixes() {
        let detector = DropDetector::default();
        assert!(detector.detect(&[]).events.is_empty());
        assert!(detector.detect(&fixes_at(&[0])).events.is_empty());
    }

    #[test]
    fn test_gap_at_threshold_not_detected() {
        let detector = DropDetector::default();
        let report = detector.detect(&fixes_at(&[0, 60, 120]));
        assert!(report.events.is_empty());
        assert_eq!(report.counts.total(), 0);
    }

    #[test]
    fn test_classification_boundaries() {
        let detector = DropDetector::default();
        // gaps: 61 micro, 72 micro, 73 transit, 600 transit, 601 extended
        let report = detector.detect(&fixes_at(&[0, 61, 133, 206, 806, 1407]));
        let classes: Vec<GapClass> = report.events.iter().map(|e| e.class).collect();
        assert_eq!(
            classes,
            vec![
                GapClass::Micro,
                GapClass::Micro,
                GapClass::Transit,
                GapClass::Transit,
                GapClass::Extended
            ]
        );
        assert_eq!(report.counts, GapCounts { micro: 2, transit: 2, extended: 1 });
    }

    #[test]
    fn test_event_carries_endpoints() {
        let detector = DropDetector::default();
        let fixes = fixes_at(&[0, 180]);
        let report = detector.detect(&fixes);
        assert_eq!(report.events.len(), 1);
        let event = &report.events[0];
        assert_eq!(event.start_ms, 0);
        assert_eq!(event.end_ms, 180_000);
        assert_eq!(event.duration_secs, 180.0);
        assert_eq!(event.start.lat, fixes[0].lat);
        assert_eq!(event.end.lat, fixes[1].lat);
    }

    #[test]
    fn test_modal_interval_does_not_change_classification() {
        // Cadence of 5s makes a 70s gap look anomalous, but classification
        // still uses the fixed tau_short boundaries.
        let detector = DropDetector::default();
        let report = detector.detect(&fixes_at(&[0, 5, 10, 15, 85, 90]));
        assert_eq!(report.modal_interval_secs, Some(5.0));
        assert_eq!(report.events.len(), 1);
        assert_eq!(report.events[0].class, GapClass::Micro);
    }

    #[test]
    fn test_modal_interval_none_when_all_gaps_long() {
        let detector = DropDetector::default();
        let report = detector.detect(&fixes_at(&[0, 400, 800]));
        assert_eq!(report.modal_interval_secs, None);
        assert_eq!(report.counts.transit, 2);
    }

    #[test]
    fn test_custom_tau_short() {
        let detector = DropDetector::new(DetectionParams {
            tau_short_secs: 30.0,
            ..DetectionParams::default()
        });
        // 35 <= 36 micro, 40 > 36 transit
        let report = detector.detect(&fixes_at(&[0, 35, 75]));
        assert_eq!(report.counts, GapCounts { micro: 1, transit: 1, extended: 0 });
    }

    #[test]
    fn test_instability_ratio() {
        assert_eq!(GapCounts::default().instability_ratio(), 0.0);
        let counts = GapCounts { micro: 1, transit: 3, extended: 0 };
        assert_eq!(counts.instability_ratio(), 0.25);
    }
}
