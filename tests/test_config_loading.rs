//! Configuration loading and validation tests
//!
//! Tests focus on observable outcomes: which values win, and which
//! configurations are rejected.

use iotlink::config::{AppConfig, ConfigError, ENV_BROKER, ENV_DEVICE_ID, ENV_REGISTER_TOPIC};
use iotlink::transport::mqtt::ReconnectConfig;
use std::collections::HashMap;
use std::io::Write;
use tempfile::NamedTempFile;

const FULL_CONFIG: &str = r#"
[mqtt]
broker_url = "mqtts://broker.example:8883"
username_env = "IOT_USER"
password_env = "IOT_PASS"
keep_alive_secs = 15

[topics]
data = "plant/data"
command_request = "plant/cmd/req"
command_response = "plant/cmd/resp"
register = "plant/register"

[device]
id = "sensor-7"
telemetry_interval_secs = 2

[coordinator]
id = "plant-server"
dispatch_interval_secs = 30
command = "STATUS"
presence_timeout_secs = 120

[reconnect]
max_attempts = 10
backoff_ms = [100, 200]
sustained_delay_ms = 1000
"#;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "{content}").unwrap();
    file
}

#[test]
fn test_config_loads_every_section() {
    let file = write_config(FULL_CONFIG);
    let config = AppConfig::load_from_file(file.path()).unwrap();

    assert_eq!(config.mqtt.keep_alive_secs, 15);
    assert_eq!(config.topics.command_request, "plant/cmd/req");

    let device = config.device().unwrap();
    assert_eq!(device.id, "sensor-7");
    assert_eq!(device.telemetry_interval().as_secs(), 2);

    assert_eq!(config.coordinator.id, "plant-server");
    assert_eq!(config.coordinator.command, "STATUS");
    assert_eq!(config.coordinator.presence_timeout().map(|d| d.as_secs()), Some(120));

    let reconnect = ReconnectConfig::from(&config.reconnect);
    assert_eq!(reconnect.max_attempts, Some(10));
    assert_eq!(reconnect.backoff_pattern, vec![100, 200]);
    assert_eq!(reconnect.sustained_delay, 1000);
}

#[test]
fn test_invalid_toml_is_rejected() {
    let file = write_config("[mqtt\nbroker_url = ");
    assert!(matches!(
        AppConfig::load_from_file(file.path()),
        Err(ConfigError::TomlParse(_))
    ));
}

#[test]
fn test_invalid_device_id_is_rejected() {
    let file = write_config(&FULL_CONFIG.replace("sensor-7", "sensor/7"));
    assert!(matches!(
        AppConfig::load_from_file(file.path()),
        Err(ConfigError::InvalidId(_))
    ));
}

#[test]
fn test_wildcard_topic_root_is_rejected() {
    let file = write_config(&FULL_CONFIG.replace("plant/data", "plant/+"));
    assert!(matches!(
        AppConfig::load_from_file(file.path()),
        Err(ConfigError::InvalidTopic(_))
    ));
}

#[test]
fn test_environment_only_configuration() {
    let vars: HashMap<&str, &str> = [
        (ENV_BROKER, "mqtt://localhost:1883"),
        ("DATA_TOPIC", "iot/data"),
        ("CMD_REQ_TOPIC", "iot/cmd/req"),
        ("CMD_RESP_TOPIC", "iot/cmd/resp"),
        (ENV_REGISTER_TOPIC, "iot/register"),
        (ENV_DEVICE_ID, "dev-9"),
    ]
    .into_iter()
    .collect();

    let config = AppConfig::from_lookup(|name| vars.get(name).map(|v| v.to_string())).unwrap();
    assert!(config.validate().is_ok());
    assert_eq!(config.device().unwrap().id, "dev-9");
    assert_eq!(config.coordinator.id, "iot-server");
    assert_eq!(config.coordinator.dispatch_interval().as_secs(), 10);
}

#[test]
fn test_coordinator_config_needs_no_device_section() {
    let without_device = FULL_CONFIG.replace("[device]\nid = \"sensor-7\"\ntelemetry_interval_secs = 2\n", "");
    let file = write_config(&without_device);
    let config = AppConfig::load_from_file(file.path()).unwrap();

    assert!(config.device.is_none());
    assert!(matches!(
        config.device(),
        Err(ConfigError::MissingSection("device"))
    ));
}
