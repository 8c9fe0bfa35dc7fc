//! Alert log - appends raised alerts to a file
//!
//! Alerts are written in JSONL format (one JSON object per line)
//! to the file specified in config.

use crate::domain::types::Alert;
use crate::io::alert_bus::AlertSubscriber;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// JSONL writer for alerts
pub struct AlertLog {
    file_path: String,
}

impl AlertLog {
    pub fn new(file_path: &str) -> Self {
        info!(file_path = %file_path, "alert_log_initialized");
        Self { file_path: file_path.to_string() }
    }

    /// Append one alert. Returns true if successful, false otherwise
    pub fn write_alert(&self, alert: &Alert) -> bool {
        let json = match serde_json::to_string(alert) {
            Ok(json) => json,
            Err(e) => {
                error!(alert_id = %alert.id, error = %e, "alert_serialize_failed");
                return false;
            }
        };

        match self.append_line(&json) {
            Ok(()) => {
                debug!(alert_id = %alert.id, file = %self.file_path, "alert_logged");
                true
            }
            Err(e) => {
                error!(alert_id = %alert.id, error = %e, "alert_log_failed");
                false
            }
        }
    }

    fn append_line(&self, line: &str) -> std::io::Result<()> {
        let path = Path::new(&self.file_path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", line)
    }

    /// Consume the subscription until the bus closes or shutdown is signalled
    pub async fn run(self, mut alerts: AlertSubscriber, mut shutdown: watch::Receiver<bool>) {
        info!(file = %self.file_path, "alert_log_started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        while let Some(alert) = alerts.try_recv() {
                            self.write_alert(&alert);
                        }
                        info!("alert_log_shutdown");
                        return;
                    }
                }
                next = alerts.recv() => {
                    match next {
                        Some(alert) => {
                            self.write_alert(&alert);
                        }
                        None => {
                            info!("alert_log_closed");
                            return;
                        }
                    }
                }
            }
        }
    }
}
