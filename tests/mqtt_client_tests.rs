//! MQTT client tests that need no running broker

use iotlink::config::MqttSection;
use iotlink::device::device_session;
use iotlink::protocol::TopicLayout;
use iotlink::transport::mqtt::{MqttClient, MqttError, ReconnectConfig, SessionOptions};
use iotlink::transport::Transport;
use std::time::Duration;
use tokio::time::timeout;

fn mqtt_config(broker_url: &str) -> MqttSection {
    MqttSection {
        broker_url: broker_url.to_string(),
        username_env: None,
        password_env: None,
        keep_alive_secs: 60,
        session_expiry_secs: 3600,
    }
}

fn fast_reconnect(max_attempts: u32) -> ReconnectConfig {
    ReconnectConfig {
        max_attempts: Some(max_attempts),
        backoff_pattern: vec![10, 20],
        sustained_delay: 20,
    }
}

#[test]
fn test_client_creation_uses_persistent_client_id() {
    let topics = TopicLayout::new("iot/data", "iot/cmd/req", "iot/cmd/resp", "iot/register");
    let client = MqttClient::new(
        device_session("dev-1", &topics),
        mqtt_config("mqtt://localhost:1883"),
        ReconnectConfig::default(),
    )
    .unwrap();

    assert_eq!(client.client_id(), "dev-1-mqtt-client");
    assert!(client.connection_state().is_none());
    assert!(!client.is_connected());
}

#[test]
fn test_invalid_broker_url_is_rejected() {
    let result = MqttClient::new(
        SessionOptions::persistent("server"),
        mqtt_config("http://localhost:1883"),
        ReconnectConfig::default(),
    );
    assert!(matches!(result, Err(MqttError::InvalidBrokerUrl(_))));
}

#[tokio::test]
async fn test_publish_before_connect_fails() {
    let client = MqttClient::new(
        SessionOptions::persistent("server"),
        mqtt_config("mqtt://localhost:1883"),
        ReconnectConfig::default(),
    )
    .unwrap();

    let result = client.publish("iot/register/dev-1", b"SIGN_IN".to_vec(), true).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_disconnect_before_connect_is_noop() {
    let client = MqttClient::new(
        SessionOptions::persistent("server"),
        mqtt_config("mqtt://localhost:1883"),
        ReconnectConfig::default(),
    )
    .unwrap();

    assert!(client.disconnect().await.is_ok());
    assert!(client.disconnect().await.is_ok());
}

#[tokio::test]
async fn test_unreachable_broker_becomes_permanently_disconnected() {
    // Nothing listens on port 1 on a test host
    let mut client = MqttClient::new(
        SessionOptions::persistent("unreachable"),
        mqtt_config("mqtt://127.0.0.1:1"),
        fast_reconnect(2),
    )
    .unwrap();

    let result = timeout(Duration::from_secs(20), client.connect()).await;
    assert!(matches!(result, Ok(Err(_))), "connect should fail, not hang");
    assert!(client.is_permanently_disconnected());
}
