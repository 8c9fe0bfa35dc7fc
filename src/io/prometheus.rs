//! Prometheus metrics HTTP endpoint
//!
//! Exposes pipeline metrics in Prometheus text format at /metrics, plus:
//! - GET /health
//! - GET /alerts - unresolved alerts as JSON
//! - POST /alerts/{id}/resolve
//!
//! Uses hyper for the HTTP server.

use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use crate::services::alert_repository::AlertRepository;
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    site: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a counter family with one label dimension
fn write_labeled_counter(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    label: &str,
    values: &[(&str, u64)],
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} counter");
    for (value, count) in values {
        let _ = writeln!(output, "{name}{{site=\"{site}\",{label}=\"{value}\"}} {count}");
    }
}

fn write_gauge_f64(output: &mut String, name: &str, help: &str, site: &str, val: f64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} gauge");
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val:.6}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    avg: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in METRICS_BUCKET_BOUNDS.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {}", avg * count);
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(metrics: &Metrics, site_id: &str) -> String {
    let summary = metrics.report();
    let mut output = String::with_capacity(4096);

    write_ingest_metrics(&mut output, site_id, &summary);
    write_gap_metrics(&mut output, site_id, &summary);
    write_corridor_metrics(&mut output, site_id, &summary);
    write_alert_metrics(&mut output, site_id, &summary);

    output
}

fn write_ingest_metrics(output: &mut String, site: &str, s: &MetricsSummary) {
    write_metric(
        output,
        "corridor_batches_total",
        "Fix batches processed",
        MetricType::Counter,
        site,
        s.batches_total,
    );
    write_metric(
        output,
        "corridor_batches_rejected_total",
        "Fix batches rejected by validation",
        MetricType::Counter,
        site,
        s.batches_rejected,
    );
    write_labeled_counter(
        output,
        "corridor_fixes_total",
        "Fixes by ingest outcome",
        site,
        "outcome",
        &[("accepted", s.fixes_accepted), ("rejected", s.fixes_rejected), ("late", s.fixes_late)],
    );
    write_metric(
        output,
        "corridor_trips_opened_total",
        "Trips opened",
        MetricType::Counter,
        site,
        s.trips_opened,
    );
    write_metric(
        output,
        "corridor_open_trips",
        "Trips currently open",
        MetricType::Gauge,
        site,
        s.open_trips,
    );
    write_gauge_f64(output, "corridor_batches_per_sec", "Batches per second", site, s.batches_per_sec);
    write_histogram(
        output,
        "corridor_batch_latency_us",
        "Batch processing latency in microseconds",
        site,
        &s.batch_lat_buckets,
        s.batch_lat_avg_us,
    );
}

fn write_gap_metrics(output: &mut String, site: &str, s: &MetricsSummary) {
    write_labeled_counter(
        output,
        "corridor_gaps_total",
        "Detected gaps by class",
        site,
        "class",
        &[("micro", s.gaps_micro), ("transit", s.gaps_transit), ("extended", s.gaps_extended)],
    );
    write_gauge_f64(
        output,
        "corridor_instability_ratio",
        "Micro gaps as a share of all detected gaps",
        site,
        s.instability_ratio,
    );
}

fn write_corridor_metrics(output: &mut String, site: &str, s: &MetricsSummary) {
    write_labeled_counter(
        output,
        "corridor_traversals_total",
        "Traversals by outcome",
        site,
        "outcome",
        &[
            ("recorded", s.traversals_recorded),
            ("duplicate", s.traversals_duplicate),
            ("self_loop", s.rejected_self_loop),
            ("jitter", s.rejected_jitter),
            ("implausible_speed", s.rejected_speed),
            ("invalid", s.rejected_invalid),
        ],
    );
    write_metric(
        output,
        "corridor_store_retries_total",
        "Baseline writes retried after a version conflict",
        MetricType::Counter,
        site,
        s.store_retries,
    );
    write_metric(
        output,
        "corridor_transient_failures_total",
        "Baseline writes abandoned after exhausting retries",
        MetricType::Counter,
        site,
        s.transient_failures,
    );
}

fn write_alert_metrics(output: &mut String, site: &str, s: &MetricsSummary) {
    write_labeled_counter(
        output,
        "corridor_alerts_total",
        "Alerts raised by type",
        site,
        "type",
        &[("delay", s.alerts_delay), ("overspeed", s.alerts_overspeed)],
    );
    write_metric(
        output,
        "corridor_alerts_suppressed_total",
        "Alerts suppressed by an unresolved duplicate",
        MetricType::Counter,
        site,
        s.alerts_suppressed,
    );
    write_metric(
        output,
        "corridor_alert_publish_dropped_total",
        "Alert publishes no subscriber received",
        MetricType::Counter,
        site,
        s.publish_dropped,
    );
}

fn respond(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    if let Ok(value) = content_type.parse::<hyper::header::HeaderValue>() {
        response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    alerts: Arc<dyn AlertRepository>,
    site_id: Arc<String>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path();
    let response = match (req.method(), path) {
        (&Method::GET, "/metrics") => respond(
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            format_prometheus_metrics(&metrics, &site_id),
        ),
        (&Method::GET, "/health") => respond(StatusCode::OK, "text/plain", "ok"),
        (&Method::GET, "/alerts") => match serde_json::to_vec(&alerts.unresolved()) {
            Ok(body) => respond(StatusCode::OK, "application/json", body),
            Err(e) => {
                error!(error = %e, "alerts_serialize_failed");
                respond(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", "serialize failed")
            }
        },
        (&Method::POST, _) => match resolve_target(path) {
            Some(alert_id) if alerts.resolve(alert_id) => {
                info!(alert_id = %alert_id, "alert_resolved");
                respond(StatusCode::OK, "application/json", r#"{"ok":true}"#)
            }
            Some(_) => respond(StatusCode::NOT_FOUND, "application/json", r#"{"ok":false}"#),
            None => respond(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
        },
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
    };
    Ok(response)
}

/// Alert id from `/alerts/{id}/resolve`
fn resolve_target(path: &str) -> Option<&str> {
    let id = path.strip_prefix("/alerts/")?.strip_suffix("/resolve")?;
    (!id.is_empty() && !id.contains('/')).then_some(id)
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    alerts: Arc<dyn AlertRepository>,
    site_id: String,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let site_id = Arc::new(site_id);

    info!(port = %port, site = %site_id, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let alerts = alerts.clone();
                        let site_id = site_id.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                handle_request(req, metrics.clone(), alerts.clone(), site_id.clone())
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::AlertType;
    use crate::services::drop_detector::GapCounts;

    #[test]
    fn test_format_prometheus_metrics() {
        let metrics = Metrics::new();
        metrics.record_batch_processed(150);
        metrics.record_batch_processed(250);
        metrics.record_gaps(&GapCounts { micro: 1, transit: 1, extended: 0 });
        metrics.record_alert_raised(AlertType::Overspeed);

        let output = format_prometheus_metrics(&metrics, "depot-3");

        assert!(output.contains("corridor_batches_total{site=\"depot-3\"} 2"));
        assert!(output.contains("corridor_batch_latency_us_bucket{site=\"depot-3\",le=\"200\"} 1"));
        assert!(output.contains("corridor_batch_latency_us_count{site=\"depot-3\"} 2"));
        assert!(output.contains("corridor_gaps_total{site=\"depot-3\",class=\"micro\"} 1"));
        assert!(output.contains("corridor_instability_ratio{site=\"depot-3\"} 0.500000"));
        assert!(output.contains("corridor_alerts_total{site=\"depot-3\",type=\"overspeed\"} 1"));
    }

    #[test]
    fn test_resolve_target() {
        assert_eq!(resolve_target("/alerts/abc-123/resolve"), Some("abc-123"));
        assert_eq!(resolve_target("/alerts//resolve"), None);
        assert_eq!(resolve_target("/alerts/a/b/resolve"), None);
        assert_eq!(resolve_target("/alerts/abc"), None);
    }
}
