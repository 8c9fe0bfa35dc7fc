//! MQTT adapters
//!
//! - fix subscriber: JSON fix batches from `mqtt.fixes_topic` into the ingest lanes
//! - alert publisher: alerts from the bus to `mqtt.alerts_topic` (QoS 0)

use crate::domain::error::ValidationError;
use crate::domain::types::Fix;
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::alert_bus::AlertSubscriber;
use crate::io::fix_source::{parse_batch, raw_fix_count};
use crate::services::lane_worker::LaneRouter;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

fn mqtt_options(config: &Config, role: &str) -> MqttOptions {
    let client_id = format!("{}-{}-{}", config.site_id(), role, std::process::id());
    let mut options = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
    options.set_keep_alive(Duration::from_secs(30));
    options.set_clean_session(true);

    if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
        options.set_credentials(username, password);
    }
    options
}

/// Decode one MQTT payload into fixes
pub fn decode_payload(payload: &[u8]) -> Result<Vec<Fix>, ValidationError> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| ValidationError::MalformedBatch(format!("invalid UTF-8: {e}")))?;
    parse_batch(text)
}

/// Subscribe to the fixes topic and route every batch into the lanes
///
/// Submitting waits when a lane queue is full, which stops polling the
/// broker until the lane catches up.
pub async fn start_fix_subscriber(
    config: &Config,
    router: LaneRouter,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let (client, mut eventloop) = AsyncClient::new(mqtt_options(config, "fixes"), 100);
    client.subscribe(config.mqtt_fixes_topic(), QoS::AtLeastOnce).await?;

    info!(
        topic = %config.mqtt_fixes_topic(),
        host = %config.mqtt_host(),
        port = %config.mqtt_port(),
        "mqtt_fixes_subscribed"
    );

    // Rate-limit rejection warnings to 1 per second
    let mut last_reject_warn = Instant::now() - Duration::from_secs(2);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("mqtt_fixes_shutdown");
                    return Ok(());
                }
            }
            result = eventloop.poll() => {
                match result {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let (fixes, submitted) = match decode_payload(&publish.payload) {
                            Ok(fixes) => (fixes.len(), router.submit(fixes).await),
                            Err(e) => (raw_fix_count(&publish.payload), Err(e)),
                        };
                        match submitted {
                            Ok(count) => {
                                debug!(topic = %publish.topic, fixes = %count, "mqtt_batch_enqueued");
                            }
                            Err(e) => {
                                metrics.record_batch_rejected(fixes);
                                if last_reject_warn.elapsed() > Duration::from_secs(1) {
                                    warn!(topic = %publish.topic, fixes = %fixes, error = %e, "mqtt_batch_rejected");
                                    last_reject_warn = Instant::now();
                                }
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_fixes_connected");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "mqtt_fixes_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }
}

/// Publishes alerts from the bus to MQTT
pub struct MqttAlertPublisher {
    client: AsyncClient,
    alerts_topic: String,
}

impl MqttAlertPublisher {
    /// Create the publisher and its eventloop; the eventloop must be driven
    /// with [`drive_eventloop`] for anything to be sent.
    pub fn new(config: &Config) -> (Self, EventLoop) {
        let (client, eventloop) = AsyncClient::new(mqtt_options(config, "alerts"), 100);
        (Self { client, alerts_topic: config.mqtt_alerts_topic().to_string() }, eventloop)
    }

    async fn publish(&self, json: String) {
        if let Err(e) =
            self.client.publish(&self.alerts_topic, QoS::AtMostOnce, false, json.into_bytes()).await
        {
            debug!(error = %e, "mqtt_alert_publish_failed");
        }
    }

    /// Forward alerts until the bus closes or shutdown is signalled
    pub async fn run(self, mut alerts: AlertSubscriber, mut shutdown: watch::Receiver<bool>) {
        info!(topic = %self.alerts_topic, "mqtt_alerts_started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        while let Some(alert) = alerts.try_recv() {
                            if let Ok(json) = serde_json::to_string(&alert) {
                                self.publish(json).await;
                            }
                        }
                        info!("mqtt_alerts_shutdown");
                        return;
                    }
                }
                next = alerts.recv() => {
                    let Some(alert) = next else {
                        info!("mqtt_alerts_closed");
                        return;
                    };
                    match serde_json::to_string(&alert) {
                        Ok(json) => self.publish(json).await,
                        Err(e) => error!(alert_id = %alert.id, error = %e, "mqtt_alert_serialize_failed"),
                    }
                }
            }
        }
    }
}

/// Poll a publisher eventloop until shutdown
pub async fn drive_eventloop(mut eventloop: EventLoop, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            result = eventloop.poll() => {
                match result {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_alerts_connected");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "mqtt_alerts_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_payload() {
        let fixes = decode_payload(
            br#"[{"vehicleId":"tram-4","ts":"2024-03-01T10:00:00Z","lat":48.2,"lon":16.37}]"#,
        )
        .unwrap();
        assert_eq!(fixes.len(), 1);
        assert_eq!(fixes[0].vehicle_id.0, "tram-4");
    }

    #[test]
    fn test_decode_payload_rejects_bad_utf8() {
        let err = decode_payload(&[0xff, 0xfe, 0x00]).unwrap_err();
        assert!(matches!(err, ValidationError::MalformedBatch(msg) if msg.contains("UTF-8")));
    }

    #[test]
    fn test_rejected_payload_still_counts_fixes() {
        let payload = br#"[{"vehicleId":"a","ts":"later","lat":1,"lon":2},
                           {"vehicleId":"a","ts":1000,"lat":1,"lon":2}]"#;
        assert!(decode_payload(payload).is_err());
        assert_eq!(raw_fix_count(payload), 2);

        let metrics = Metrics::new();
        metrics.record_batch_rejected(raw_fix_count(payload));
        let summary = metrics.report();
        assert_eq!(summary.batches_rejected, 1);
        assert_eq!(summary.fixes_rejected, 2);
    }

    #[test]
    fn test_client_ids_are_distinct_per_role() {
        let config = Config::default();
        let fixes = mqtt_options(&config, "fixes");
        let alerts = mqtt_options(&config, "alerts");
        assert_ne!(fixes.client_id(), alerts.client_id());
        assert!(fixes.client_id().starts_with("corridor-watch-fixes-"));
    }
}
