//! Integration tests for configuration loading

use corridor_watch::infra::Config;
use std::io::Write;
use tempfile::NamedTempFile;

#[test]
fn test_load_config_from_file() {
    let mut temp_file = NamedTempFile::new().unwrap();

    let config_content = r#"
[site]
id = "test-depot"

[detection]
tau_short_secs = 30.0
micro_factor = 1.5
extended_gap_secs = 900.0

[trips]
inactivity_mins = 45

[corridor]
resolution = 8
min_distance_m = 25.0

[baseline]
min_samples_hourly = 3

[alerts]
delay_threshold_minutes = 10.0

[workers]
lanes = 2

[mqtt]
enabled = true
host = "test-host"
port = 1884
fixes_topic = "depot/fixes"

[metrics]
interval_secs = 15
prometheus_port = 9091
"#;

    temp_file.write_all(config_content.as_bytes()).unwrap();
    temp_file.flush().unwrap();

    let config = Config::from_file(temp_file.path()).unwrap();

    assert_eq!(config.site_id(), "test-depot");
    assert_eq!(config.tau_short_secs(), 30.0);
    assert_eq!(config.micro_factor(), 1.5);
    assert_eq!(config.extended_gap_secs(), 900.0);
    assert_eq!(config.inactivity_ms(), 45 * 60_000);
    assert_eq!(config.resolution(), 8);
    assert_eq!(config.min_distance_m(), 25.0);
    assert_eq!(config.max_speed_kmh(), 200.0);
    assert_eq!(config.min_samples_hourly(), 3);
    assert_eq!(config.delay_threshold_minutes(), 10.0);
    assert_eq!(config.lanes(), 2);
    assert!(config.mqtt_enabled());
    assert_eq!(config.mqtt_host(), "test-host");
    assert_eq!(config.mqtt_port(), 1884);
    assert_eq!(config.mqtt_fixes_topic(), "depot/fixes");
    assert_eq!(config.mqtt_alerts_topic(), "fleet/alerts");
    assert_eq!(config.metrics_interval_secs(), 15);
    assert_eq!(config.prometheus_port(), 9091);
}

#[test]
fn test_invalid_file_is_an_error() {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(b"[corridor]\nresolution = 16\n").unwrap();
    temp_file.flush().unwrap();

    let err = Config::from_file(temp_file.path()).unwrap_err();
    assert!(format!("{err:#}").contains("corridor.resolution"));
}

#[test]
fn test_load_from_path_fallback() {
    let config = Config::load_from_path("/nonexistent/config.toml");
    assert_eq!(config.mqtt_host(), "localhost");
    assert_eq!(config.mqtt_port(), 1883);
    assert!(!config.mqtt_enabled());
    assert_eq!(config.tau_short_secs(), 60.0);
    assert_eq!(config.extended_gap_secs(), 600.0);
    assert_eq!(config.resolution(), 7);
    assert_eq!(config.min_samples_hourly(), 5);
}

#[test]
fn test_load_from_path_invalid_falls_back() {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(b"[detection]\ntau_short_secs = -1.0\n").unwrap();
    temp_file.flush().unwrap();

    let config = Config::load_from_path(&temp_file.path().display().to_string());
    assert_eq!(config.tau_short_secs(), 60.0);
    assert_eq!(config.config_file(), "default");
}
