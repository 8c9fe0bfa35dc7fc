//! Inbound fix parsing
//!
//! Accepts normalized fixes as JSON: a single object or an array of them.
//! `ts` is ISO-8601 (offset optional, UTC assumed when absent) or epoch
//! milliseconds. Files are JSONL with one object or array per line; a bad
//! line rejects that line's batch only.

use crate::domain::error::ValidationError;
use crate::domain::types::{Fix, VehicleId};
use crate::infra::metrics::Metrics;
use crate::services::lane_worker::LaneRouter;
use anyhow::Context;
use chrono::{DateTime, NaiveDateTime};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// Timestamp as sent on the wire
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TimestampValue {
    Millis(i64),
    Text(String),
}

/// A fix before timestamp parsing
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawFix {
    #[serde(alias = "vehicle_id")]
    pub vehicle_id: String,
    pub ts: TimestampValue,
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(default)]
    pub accuracy: Option<f64>,
    #[serde(default)]
    pub heading: Option<f64>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Payload {
    Many(Vec<RawFix>),
    One(RawFix),
}

const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Parse an ISO-8601 timestamp to epoch milliseconds
pub fn parse_timestamp(text: &str) -> Option<i64> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.timestamp_millis());
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|naive| naive.and_utc().timestamp_millis())
}

impl RawFix {
    /// Convert to a fix; `index` is reported on an unparsable timestamp
    pub fn into_fix(self, index: usize) -> Result<Fix, ValidationError> {
        let ts_ms = match &self.ts {
            TimestampValue::Millis(ms) => *ms,
            TimestampValue::Text(text) => parse_timestamp(text)
                .ok_or_else(|| ValidationError::InvalidTimestamp { index, value: text.clone() })?,
        };
        Ok(Fix {
            vehicle_id: VehicleId(self.vehicle_id),
            ts_ms,
            lat: self.lat,
            lon: self.lon,
            speed: self.speed,
            accuracy: self.accuracy,
            heading: self.heading,
        })
    }
}

/// Parse one JSON payload (object or array) into fixes
pub fn parse_batch(payload: &str) -> Result<Vec<Fix>, ValidationError> {
    let raw = match serde_json::from_str::<Payload>(payload) {
        Ok(Payload::Many(raw)) => raw,
        Ok(Payload::One(raw)) => vec![raw],
        Err(e) => return Err(ValidationError::MalformedBatch(e.to_string())),
    };
    raw.into_iter().enumerate().map(|(index, r)| r.into_fix(index)).collect()
}

/// Number of fix objects in a payload that may not parse as fixes
/// (array length, 1 for an object, 0 otherwise)
pub fn raw_fix_count(payload: &[u8]) -> usize {
    match serde_json::from_slice::<serde_json::Value>(payload) {
        Ok(serde_json::Value::Array(items)) => items.len(),
        Ok(serde_json::Value::Object(_)) => 1,
        _ => 0,
    }
}

/// One non-empty line of a fix file (1-based line numbers)
#[derive(Debug, Clone, PartialEq)]
pub enum JsonlLine {
    Batch { line: usize, fixes: Vec<Fix> },
    Rejected { line: usize, fixes: usize, error: ValidationError },
}

/// Load a JSONL file; each non-empty line is one batch.
///
/// Only an unreadable file is an error. Lines that fail to parse come back
/// as `JsonlLine::Rejected`.
pub fn read_jsonl<P: AsRef<Path>>(path: P) -> anyhow::Result<Vec<JsonlLine>> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read fix file {}", path.display()))?;

    let mut lines = Vec::new();
    for (line_no, text) in content.lines().enumerate() {
        if text.trim().is_empty() {
            continue;
        }
        let line = line_no + 1;
        lines.push(match parse_batch(text) {
            Ok(fixes) => JsonlLine::Batch { line, fixes },
            Err(error) => JsonlLine::Rejected { line, fixes: raw_fix_count(text.as_bytes()), error },
        });
    }
    debug!(file = %path.display(), lines = %lines.len(), "fix_file_loaded");
    Ok(lines)
}

/// Counts from feeding a fix file into the lanes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileSubmission {
    pub batches: usize,
    pub fixes: usize,
    pub rejected_batches: usize,
}

/// Submit every line of a fix file to the lanes, skipping rejected lines
pub async fn submit_jsonl<P: AsRef<Path>>(
    path: P,
    router: &LaneRouter,
    metrics: &Metrics,
) -> anyhow::Result<FileSubmission> {
    let path = path.as_ref();
    let lines = read_jsonl(path)?;
    info!(file = %path.display(), lines = %lines.len(), "fix_file_submitting");

    let mut summary = FileSubmission::default();
    for entry in lines {
        let (line, fixes, error) = match entry {
            JsonlLine::Batch { line, fixes } => {
                let count = fixes.len();
                match router.submit(fixes).await {
                    Ok(enqueued) => {
                        summary.batches += 1;
                        summary.fixes += enqueued;
                        continue;
                    }
                    Err(e) => (line, count, e),
                }
            }
            JsonlLine::Rejected { line, fixes, error } => (line, fixes, error),
        };
        warn!(file = %path.display(), line = %line, fixes = %fixes, error = %error, "fix_line_rejected");
        metrics.record_batch_rejected(fixes);
        summary.rejected_batches += 1;
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_timestamp_formats() {
        // 2024-03-01T10:00:00Z
        let expected = 1_709_287_200_000;
        assert_eq!(parse_timestamp("2024-03-01T10:00:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2024-03-01T11:00:00+01:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-03-01T10:00:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-03-01 10:00:00.250"), Some(expected + 250));
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn test_parse_single_object() {
        let fixes = parse_batch(
            r#"{"vehicleId":"bus-1","ts":"2024-03-01T10:00:00Z","lat":52.5,"lon":13.4,"speed":8.3}"#,
        )
        .unwrap();
        assert_eq!(fixes.len(), 1);
        assert_eq!(fixes[0].vehicle_id.0, "bus-1");
        assert_eq!(fixes[0].speed, Some(8.3));
        assert_eq!(fixes[0].heading, None);
    }

    #[test]
    fn test_parse_array_with_epoch_and_snake_case() {
        let fixes = parse_batch(
            r#"[{"vehicle_id":"a","ts":1709287200000,"lat":1.0,"lon":2.0},
                {"vehicleId":"b","ts":"2024-03-01T10:00:05Z","lat":1.0,"lon":2.0,"heading":90}]"#,
        )
        .unwrap();
        assert_eq!(fixes.len(), 2);
        assert_eq!(fixes[0].ts_ms, 1_709_287_200_000);
        assert_eq!(fixes[1].ts_ms, 1_709_287_205_000);
        assert_eq!(fixes[1].heading, Some(90.0));
    }

    #[test]
    fn test_bad_timestamp_reports_index() {
        let err = parse_batch(
            r#"[{"vehicleId":"a","ts":"2024-03-01T10:00:00Z","lat":1,"lon":2},
                {"vehicleId":"a","ts":"not a time","lat":1,"lon":2}]"#,
        )
        .unwrap_err();
        assert_eq!(err, ValidationError::InvalidTimestamp { index: 1, value: "not a time".into() });
    }

    #[test]
    fn test_malformed_payload() {
        assert!(matches!(parse_batch("{\"lat\":1}"), Err(ValidationError::MalformedBatch(_))));
        assert!(matches!(parse_batch("not json"), Err(ValidationError::MalformedBatch(_))));
    }

    #[test]
    fn test_read_jsonl() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"vehicleId":"a","ts":1000,"lat":1,"lon":2}}"#).unwrap();
        writeln!(file).unwrap();
        writeln!(file, r#"[{{"vehicleId":"a","ts":2000,"lat":1,"lon":2}},{{"vehicleId":"b","ts":2000,"lat":1,"lon":2}}]"#).unwrap();
        file.flush().unwrap();

        let lines = read_jsonl(file.path()).unwrap();
        assert_eq!(lines.len(), 2);
        assert!(matches!(&lines[1], JsonlLine::Batch { line: 3, fixes } if fixes.len() == 2));
    }

    #[test]
    fn test_bad_line_rejects_only_itself() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"vehicleId":"a","ts":1000,"lat":1,"lon":2}}"#).unwrap();
        writeln!(file, r#"[{{"vehicleId":"a","ts":"bogus","lat":1,"lon":2}},{{"vehicleId":"a","ts":3000,"lat":1,"lon":2}}]"#).unwrap();
        writeln!(file, r#"{{"vehicleId":"a","ts":4000,"lat":1,"lon":2}}"#).unwrap();
        file.flush().unwrap();

        let lines = read_jsonl(file.path()).unwrap();
        assert_eq!(lines.len(), 3);
        assert!(matches!(&lines[0], JsonlLine::Batch { line: 1, .. }));
        assert_eq!(
            lines[1],
            JsonlLine::Rejected {
                line: 2,
                fixes: 2,
                error: ValidationError::InvalidTimestamp { index: 0, value: "bogus".into() },
            }
        );
        assert!(matches!(&lines[2], JsonlLine::Batch { line: 3, fixes } if fixes[0].ts_ms == 4000));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(read_jsonl("/nonexistent/fixes.jsonl").is_err());
    }

    #[test]
    fn test_raw_fix_count() {
        assert_eq!(raw_fix_count(br#"[{"a":1},{"b":2},3]"#), 3);
        assert_eq!(raw_fix_count(br#"{"lat":1}"#), 1);
        assert_eq!(raw_fix_count(b"not json"), 0);
    }
}
