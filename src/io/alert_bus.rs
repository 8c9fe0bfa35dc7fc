//! Alert fan-out over a tokio broadcast channel
//!
//! Publishing never blocks and is never retried. A subscriber that falls
//! more than the channel capacity behind loses the oldest alerts; the loss is
//! counted in metrics.

use crate::domain::types::Alert;
use crate::infra::metrics::Metrics;
use crate::services::alert_engine::AlertPublisher;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

/// Broadcast publisher for newly raised alerts
#[derive(Clone)]
pub struct AlertBus {
    tx: broadcast::Sender<Alert>,
    metrics: Arc<Metrics>,
}

impl AlertBus {
    pub fn new(capacity: usize, metrics: Arc<Metrics>) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, metrics }
    }

    pub fn subscribe(&self, name: &'static str) -> AlertSubscriber {
        AlertSubscriber { name, rx: self.tx.subscribe(), metrics: self.metrics.clone() }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl AlertPublisher for AlertBus {
    fn publish(&self, alert: &Alert) {
        if self.tx.send(alert.clone()).is_err() {
            debug!(alert_id = %alert.id, "alert_no_subscribers");
            self.metrics.record_publish_dropped();
        }
    }
}

/// Receiving side of the bus for one consumer
pub struct AlertSubscriber {
    name: &'static str,
    rx: broadcast::Receiver<Alert>,
    metrics: Arc<Metrics>,
}

impl AlertSubscriber {
    /// Next alert, skipping past any this subscriber lagged behind on.
    /// Returns None once the bus is dropped.
    pub async fn recv(&mut self) -> Option<Alert> {
        loop {
            match self.rx.recv().await {
                Ok(alert) => return Some(alert),
                Err(RecvError::Lagged(missed)) => {
                    warn!(subscriber = %self.name, missed = %missed, "alert_subscriber_lagged");
                    for _ in 0..missed {
                        self.metrics.record_publish_dropped();
                    }
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant used when draining on shutdown
    pub fn try_recv(&mut self) -> Option<Alert> {
        loop {
            match self.rx.try_recv() {
                Ok(alert) => return Some(alert),
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    for _ in 0..missed {
                        self.metrics.record_publish_dropped();
                    }
                }
                Err(_) => return None,
            }
        }
    }
}
