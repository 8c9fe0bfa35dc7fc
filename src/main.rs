//! Corridor watch - signal-drop corridor learning and alerting for vehicle fleets
//!
//! Ingests position fixes, turns signal drops into corridor traversals,
//! learns hour-of-day travel-time baselines per corridor, and raises delay
//! and overspeed alerts.
//!
//! Module structure:
//! - `domain/` - Core types (Fix, Trip, Corridor, Alert) and errors
//! - `services/` - Pipeline stages (drop detection, corridors, baselines, alerts)
//! - `io/` - External interfaces (MQTT, JSONL files, Prometheus, alert fan-out)
//! - `infra/` - Infrastructure (Config, Metrics)

use clap::Parser;
use corridor_watch::domain::types::epoch_ms;
use corridor_watch::infra::{Config, Metrics};
use corridor_watch::io::fix_source::submit_jsonl;
use corridor_watch::io::mqtt::{drive_eventloop, start_fix_subscriber};
use corridor_watch::io::{AlertBus, AlertLog, MqttAlertPublisher};
use corridor_watch::services::{
    create_lanes, IngestCoordinator, MemoryAlertRepository, MemoryCorridorRepository,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Alert bus capacity per subscriber
const ALERT_BUS_CAPACITY: usize = 1024;

/// Corridor watch - fleet corridor baselines and alerts
#[derive(Parser, Debug)]
#[command(name = "corridor-watch", version, about)]
struct Args {
    /// Path to TOML configuration file (default: CONFIG_FILE or config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Process a JSONL fix file and exit instead of running live
    #[arg(short, long)]
    input: Option<PathBuf>,
}

async fn join_all(name: &str, handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if let Err(e) = handle.await {
            error!(task = %name, error = %e, "task_join_failed");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured logging with configurable level via RUST_LOG env var
    // Default: INFO, use RUST_LOG=debug for per-gap and per-write visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    let args = Args::parse();
    info!(git_hash = %env!("GIT_HASH"), "corridor-watch starting");

    let config_path = args.config.unwrap_or_else(|| Config::resolve_config_path(&[]));
    let config = Config::load_from_path(&config_path);

    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        tau_short_secs = %config.tau_short_secs(),
        extended_gap_secs = %config.extended_gap_secs(),
        resolution = %config.resolution(),
        min_samples_hourly = %config.min_samples_hourly(),
        delay_threshold_minutes = %config.delay_threshold_minutes(),
        lanes = %config.lanes(),
        mqtt_enabled = %config.mqtt_enabled(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    // Inputs stop on `shutdown`; sinks stop on `sink_shutdown` once the lanes drained
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (sink_shutdown_tx, sink_shutdown_rx) = watch::channel(false);

    let metrics = Arc::new(Metrics::new());
    let alert_repo = Arc::new(MemoryAlertRepository::new());
    let bus = Arc::new(AlertBus::new(ALERT_BUS_CAPACITY, metrics.clone()));

    // Alert subscribers
    let mut sinks = Vec::new();
    let alert_log = AlertLog::new(config.alerts_file());
    sinks.push(tokio::spawn(alert_log.run(bus.subscribe("alert_log"), sink_shutdown_rx.clone())));

    if config.mqtt_enabled() {
        let (publisher, eventloop) = MqttAlertPublisher::new(&config);
        sinks.push(tokio::spawn(publisher.run(bus.subscribe("mqtt"), sink_shutdown_rx.clone())));
        tokio::spawn(drive_eventloop(eventloop, sink_shutdown_rx.clone()));
    }

    // Pipeline and lanes
    let coordinator = Arc::new(IngestCoordinator::new(
        &config,
        Arc::new(MemoryCorridorRepository::new()),
        alert_repo.clone(),
        bus,
        metrics.clone(),
    )?);
    let (router, workers) = create_lanes(coordinator.clone(), config.lanes(), config.queue_depth());
    let lanes: Vec<JoinHandle<()>> = workers.into_iter().map(|w| tokio::spawn(w.run())).collect();

    // Start Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_alerts = alert_repo.clone();
        let site_id = config.site_id().to_string();
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = corridor_watch::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
                prom_alerts,
                site_id,
                prom_shutdown,
            )
            .await
            {
                error!(error = %e, "Prometheus metrics server error");
            }
        });
    }

    let live = args.input.is_none();

    // Periodic metrics summary; live mode also evicts trips idle in data time and wall clock
    let reporter_metrics = metrics.clone();
    let reporter_coordinator = coordinator.clone();
    let metrics_interval = config.metrics_interval_secs().max(1);
    let mut reporter_shutdown = shutdown_rx.clone();
    let reporter = tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(metrics_interval));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if live {
                        let closed = reporter_coordinator.segmenter().close_idle(epoch_ms());
                        if !closed.is_empty() {
                            info!(closed = %closed.len(), "trips_closed_idle");
                            reporter_metrics.set_open_trips(reporter_coordinator.segmenter().open_trips());
                        }
                    }
                    reporter_metrics.report().log();
                }
                _ = reporter_shutdown.changed() => {
                    if *reporter_shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    });

    match args.input {
        Some(path) => {
            match submit_jsonl(&path, &router, &metrics).await {
                Ok(summary) => info!(
                    file = %path.display(),
                    batches = %summary.batches,
                    fixes = %summary.fixes,
                    rejected_batches = %summary.rejected_batches,
                    "fix_file_submitted"
                ),
                Err(e) => error!(error = %format!("{e:#}"), "fix_file_failed"),
            }
            drop(router);
        }
        None => {
            let mut inputs = Vec::new();
            if config.mqtt_enabled() {
                let mqtt_config = config.clone();
                let mqtt_router = router.clone();
                let mqtt_metrics = metrics.clone();
                let mqtt_shutdown = shutdown_rx.clone();
                inputs.push(tokio::spawn(async move {
                    if let Err(e) =
                        start_fix_subscriber(&mqtt_config, mqtt_router, mqtt_metrics, mqtt_shutdown)
                            .await
                    {
                        error!(error = %e, "MQTT fix subscriber error");
                    }
                }));
            } else {
                warn!("mqtt disabled and no --input given; only HTTP endpoints are active");
            }
            drop(router);

            tokio::signal::ctrl_c().await.ok();
            info!("shutdown_signal_received");
            let _ = shutdown_tx.send(true);
            join_all("input", inputs).await;
        }
    }

    // Lanes stop once every router clone is gone and their queues are empty
    join_all("lane", lanes).await;
    let _ = shutdown_tx.send(true);
    let _ = sink_shutdown_tx.send(true);
    join_all("sink", sinks).await;
    join_all("reporter", vec![reporter]).await;

    metrics.report().log();
    info!(alerts = %metrics.alerts_total(), "corridor-watch shutdown complete");
    Ok(())
}
