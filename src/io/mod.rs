//! IO modules - external system interfaces
//!
//! - `fix_source` - JSON/JSONL parsing of inbound fixes
//! - `alert_bus` - broadcast fan-out for raised alerts
//! - `alert_log` - alert output to file (JSONL format)
//! - `mqtt` - MQTT fix subscriber and alert publisher
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod alert_bus;
pub mod alert_log;
pub mod fix_source;
pub mod mqtt;
pub mod prometheus;

// Re-export commonly used types
pub use alert_bus::{AlertBus, AlertSubscriber};
pub use alert_log::AlertLog;
pub use mqtt::MqttAlertPublisher;
