//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml
//!
//! Every section and key is optional; missing values take the defaults below.

use anyhow::{bail, Context};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// Deployment identifier, used as MQTT client id prefix and in logs
    #[serde(default = "default_site_id")]
    pub id: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { id: default_site_id() }
    }
}

fn default_site_id() -> String {
    "corridor-watch".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectionConfig {
    /// Nominal reporting interval
    #[serde(default = "default_tau_short_secs")]
    pub tau_short_secs: f64,
    /// Gaps up to tau_short * micro_factor are micro drops
    #[serde(default = "default_micro_factor")]
    pub micro_factor: f64,
    /// Gaps above this are extended outages
    #[serde(default = "default_extended_gap_secs")]
    pub extended_gap_secs: f64,
    /// Upper bound of the interval histogram used for the modal diagnostic
    #[serde(default = "default_modal_window_secs")]
    pub modal_window_secs: f64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            tau_short_secs: default_tau_short_secs(),
            micro_factor: default_micro_factor(),
            extended_gap_secs: default_extended_gap_secs(),
            modal_window_secs: default_modal_window_secs(),
        }
    }
}

fn default_tau_short_secs() -> f64 {
    60.0
}

fn default_micro_factor() -> f64 {
    1.2
}

fn default_extended_gap_secs() -> f64 {
    600.0
}

fn default_modal_window_secs() -> f64 {
    300.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct TripsConfig {
    /// Silence after which a vehicle's open trip is closed
    #[serde(default = "default_inactivity_mins")]
    pub inactivity_mins: u64,
}

impl Default for TripsConfig {
    fn default() -> Self {
        Self { inactivity_mins: default_inactivity_mins() }
    }
}

fn default_inactivity_mins() -> u64 {
    20
}

#[derive(Debug, Clone, Deserialize)]
pub struct CorridorConfig {
    /// H3 resolution (0..=15)
    #[serde(default = "default_resolution")]
    pub resolution: u8,
    /// Straight-line distances below this are GPS jitter
    #[serde(default = "default_min_distance_m")]
    pub min_distance_m: f64,
    /// Implied speeds above this are rejected
    #[serde(default = "default_max_speed_kmh")]
    pub max_speed_kmh: f64,
}

impl Default for CorridorConfig {
    fn default() -> Self {
        Self {
            resolution: default_resolution(),
            min_distance_m: default_min_distance_m(),
            max_speed_kmh: default_max_speed_kmh(),
        }
    }
}

fn default_resolution() -> u8 {
    7
}

fn default_min_distance_m() -> f64 {
    10.0
}

fn default_max_speed_kmh() -> f64 {
    200.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct BaselineConfig {
    /// Samples an hour bucket needs before it is used
    #[serde(default = "default_min_samples_hourly")]
    pub min_samples_hourly: usize,
    /// Compare-and-swap attempts per traversal write
    #[serde(default = "default_max_write_attempts")]
    pub max_write_attempts: u32,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            min_samples_hourly: default_min_samples_hourly(),
            max_write_attempts: default_max_write_attempts(),
        }
    }
}

fn default_min_samples_hourly() -> usize {
    5
}

fn default_max_write_attempts() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertsConfig {
    #[serde(default = "default_delay_threshold_minutes")]
    pub delay_threshold_minutes: f64,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self { delay_threshold_minutes: default_delay_threshold_minutes() }
    }
}

fn default_delay_threshold_minutes() -> f64 {
    15.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkersConfig {
    /// Parallel ingest lanes; a vehicle always maps to the same lane
    #[serde(default = "default_lanes")]
    pub lanes: usize,
    /// Bounded queue depth per lane
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self { lanes: default_lanes(), queue_depth: default_queue_depth() }
    }
}

fn default_lanes() -> usize {
    4
}

fn default_queue_depth() -> usize {
    256
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    /// Inbound fix batches (JSON array or single object)
    #[serde(default = "default_fixes_topic")]
    pub fixes_topic: String,
    /// Outbound alerts (QoS 0)
    #[serde(default = "default_alerts_topic")]
    pub alerts_topic: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            fixes_topic: default_fixes_topic(),
            alerts_topic: default_alerts_topic(),
            username: None,
            password: None,
        }
    }
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_fixes_topic() -> String {
    "fleet/fixes".to_string()
}

fn default_alerts_topic() -> String {
    "fleet/alerts".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct EgressConfig {
    /// File path for raised alerts (JSONL format)
    #[serde(default = "default_alerts_file")]
    pub alerts_file: String,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self { alerts_file: default_alerts_file() }
    }
}

fn default_alerts_file() -> String {
    "alerts.jsonl".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval_secs")]
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default = "default_prometheus_port")]
    pub prometheus_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_metrics_interval_secs(),
            prometheus_port: default_prometheus_port(),
        }
    }
}

fn default_metrics_interval_secs() -> u64 {
    10
}

fn default_prometheus_port() -> u16 {
    9100
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub trips: TripsConfig,
    #[serde(default)]
    pub corridor: CorridorConfig,
    #[serde(default)]
    pub baseline: BaselineConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub egress: EgressConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    tau_short_secs: f64,
    micro_factor: f64,
    extended_gap_secs: f64,
    modal_window_secs: f64,
    inactivity_mins: u64,
    resolution: u8,
    min_distance_m: f64,
    max_speed_kmh: f64,
    min_samples_hourly: usize,
    max_write_attempts: u32,
    delay_threshold_minutes: f64,
    lanes: usize,
    queue_depth: usize,
    mqtt_enabled: bool,
    mqtt_host: String,
    mqtt_port: u16,
    mqtt_fixes_topic: String,
    mqtt_alerts_topic: String,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    alerts_file: String,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_sections(TomlConfig::default(), "default".to_string())
    }
}

impl Config {
    fn from_sections(toml_config: TomlConfig, config_file: String) -> Self {
        Self {
            site_id: toml_config.site.id,
            tau_short_secs: toml_config.detection.tau_short_secs,
            micro_factor: toml_config.detection.micro_factor,
            extended_gap_secs: toml_config.detection.extended_gap_secs,
            modal_window_secs: toml_config.detection.modal_window_secs,
            inactivity_mins: toml_config.trips.inactivity_mins,
            resolution: toml_config.corridor.resolution,
            min_distance_m: toml_config.corridor.min_distance_m,
            max_speed_kmh: toml_config.corridor.max_speed_kmh,
            min_samples_hourly: toml_config.baseline.min_samples_hourly,
            max_write_attempts: toml_config.baseline.max_write_attempts,
            delay_threshold_minutes: toml_config.alerts.delay_threshold_minutes,
            lanes: toml_config.workers.lanes,
            queue_depth: toml_config.workers.queue_depth,
            mqtt_enabled: toml_config.mqtt.enabled,
            mqtt_host: toml_config.mqtt.host,
            mqtt_port: toml_config.mqtt.port,
            mqtt_fixes_topic: toml_config.mqtt.fixes_topic,
            mqtt_alerts_topic: toml_config.mqtt.alerts_topic,
            mqtt_username: toml_config.mqtt.username,
            mqtt_password: toml_config.mqtt.password,
            alerts_file: toml_config.egress.alerts_file,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            prometheus_port: toml_config.metrics.prometheus_port,
            config_file,
        }
    }

    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str, origin: &str) -> anyhow::Result<Self> {
        let toml_config: TomlConfig =
            toml::from_str(content).with_context(|| format!("Failed to parse config {origin}"))?;
        let config = Self::from_sections(toml_config, origin.to_string());
        config.validate().with_context(|| format!("Invalid config {origin}"))?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content, &path.display().to_string())
    }

    /// Load a specific file, falling back to defaults when it is missing or invalid
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {:#}. Using defaults.", e);
                Self::default()
            }
        }
    }

    /// Reject parameter combinations the pipeline cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.tau_short_secs > 0.0) {
            bail!("detection.tau_short_secs must be positive, got {}", self.tau_short_secs);
        }
        if !(self.micro_factor >= 1.0) {
            bail!("detection.micro_factor must be at least 1.0, got {}", self.micro_factor);
        }
        if !(self.extended_gap_secs > self.micro_cutoff_secs()) {
            bail!(
                "detection.extended_gap_secs ({}) must exceed tau_short_secs * micro_factor ({})",
                self.extended_gap_secs,
                self.micro_cutoff_secs()
            );
        }
        if !(self.modal_window_secs > 0.0) {
            bail!("detection.modal_window_secs must be positive, got {}", self.modal_window_secs);
        }
        if self.inactivity_mins == 0 {
            bail!("trips.inactivity_mins must be positive");
        }
        if self.resolution > 15 {
            bail!("corridor.resolution must be within 0..=15, got {}", self.resolution);
        }
        if !(self.min_distance_m >= 0.0) {
            bail!("corridor.min_distance_m must be non-negative, got {}", self.min_distance_m);
        }
        if !(self.max_speed_kmh > 0.0) {
            bail!("corridor.max_speed_kmh must be positive, got {}", self.max_speed_kmh);
        }
        if self.min_samples_hourly == 0 {
            bail!("baseline.min_samples_hourly must be at least 1");
        }
        if self.max_write_attempts == 0 {
            bail!("baseline.max_write_attempts must be at least 1");
        }
        if !(self.delay_threshold_minutes >= 0.0) {
            bail!(
                "alerts.delay_threshold_minutes must be non-negative, got {}",
                self.delay_threshold_minutes
            );
        }
        if self.lanes == 0 || self.queue_depth == 0 {
            bail!("workers.lanes and workers.queue_depth must be at least 1");
        }
        Ok(())
    }

    fn micro_cutoff_secs(&self) -> f64 {
        self.tau_short_secs * self.micro_factor
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn tau_short_secs(&self) -> f64 {
        self.tau_short_secs
    }

    pub fn micro_factor(&self) -> f64 {
        self.micro_factor
    }

    pub fn extended_gap_secs(&self) -> f64 {
        self.extended_gap_secs
    }

    pub fn modal_window_secs(&self) -> f64 {
        self.modal_window_secs
    }

    pub fn inactivity_mins(&self) -> u64 {
        self.inactivity_mins
    }

    pub fn inactivity_ms(&self) -> i64 {
        (self.inactivity_mins as i64).saturating_mul(60_000)
    }

    pub fn resolution(&self) -> u8 {
        self.resolution
    }

    pub fn min_distance_m(&self) -> f64 {
        self.min_distance_m
    }

    pub fn max_speed_kmh(&self) -> f64 {
        self.max_speed_kmh
    }

    pub fn min_samples_hourly(&self) -> usize {
        self.min_samples_hourly
    }

    pub fn max_write_attempts(&self) -> u32 {
        self.max_write_attempts
    }

    pub fn delay_threshold_minutes(&self) -> f64 {
        self.delay_threshold_minutes
    }

    pub fn lanes(&self) -> usize {
        self.lanes
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth
    }

    pub fn mqtt_enabled(&self) -> bool {
        self.mqtt_enabled
    }

    pub fn mqtt_host(&self) -> &str {
        &self.mqtt_host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt_port
    }

    pub fn mqtt_fixes_topic(&self) -> &str {
        &self.mqtt_fixes_topic
    }

    pub fn mqtt_alerts_topic(&self) -> &str {
        &self.mqtt_alerts_topic
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.mqtt_username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.mqtt_password.as_deref()
    }

    pub fn alerts_file(&self) -> &str {
        &self.alerts_file
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to set the lane count
    pub fn with_lanes(mut self, lanes: usize) -> Self {
        self.lanes = lanes;
        self
    }

    /// Builder method for tests to set the alerts file
    pub fn with_alerts_file(mut self, path: impl Into<String>) -> Self {
        self.alerts_file = path.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.tau_short_secs(), 60.0);
        assert_eq!(config.micro_factor(), 1.2);
        assert_eq!(config.extended_gap_secs(), 600.0);
        assert_eq!(config.inactivity_ms(), 20 * 60_000);
        assert_eq!(config.resolution(), 7);
        assert_eq!(config.min_samples_hourly(), 5);
        assert_eq!(config.delay_threshold_minutes(), 15.0);
        assert!(!config.mqtt_enabled());
        assert_eq!(config.mqtt_fixes_topic(), "fleet/fixes");
        assert_eq!(config.alerts_file(), "alerts.jsonl");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = Config::from_toml_str("", "inline").unwrap();
        assert_eq!(config.lanes(), 4);
        assert_eq!(config.queue_depth(), 256);
        assert_eq!(config.prometheus_port(), 9100);
        assert_eq!(config.config_file(), "inline");
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config = Config::from_toml_str("[detection]\ntau_short_secs = 30.0\n", "inline").unwrap();
        assert_eq!(config.tau_short_secs(), 30.0);
        assert_eq!(config.micro_factor(), 1.2);
        assert_eq!(config.extended_gap_secs(), 600.0);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let overlapping = "[detection]\ntau_short_secs = 60.0\nextended_gap_secs = 50.0\n";
        assert!(Config::from_toml_str(overlapping, "inline").is_err());

        assert!(Config::from_toml_str("[corridor]\nresolution = 16\n", "inline").is_err());
        assert!(Config::from_toml_str("[baseline]\nmin_samples_hourly = 0\n", "inline").is_err());
        assert!(Config::from_toml_str("[workers]\nlanes = 0\n", "inline").is_err());
        assert!(Config::from_toml_str("[detection]\nmicro_factor = 0.5\n", "inline").is_err());
    }

    #[test]
    fn test_resolve_config_path_default() {
        let args: Vec<String> = vec!["corridor-watch".to_string()];
        if env::var("CONFIG_FILE").is_err() {
            assert_eq!(Config::resolve_config_path(&args), "config/dev.toml");
        }
    }

    #[test]
    fn test_resolve_config_path_from_arg() {
        let args: Vec<String> = vec![
            "corridor-watch".to_string(),
            "--config".to_string(),
            "config/prod.toml".to_string(),
        ];
        assert_eq!(Config::resolve_config_path(&args), "config/prod.toml");
    }

    #[test]
    fn test_resolve_config_path_from_arg_equals() {
        let args: Vec<String> =
            vec!["corridor-watch".to_string(), "--config=config/edge.toml".to_string()];
        assert_eq!(Config::resolve_config_path(&args), "config/edge.toml");
    }
}
