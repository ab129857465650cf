//! Pure connection state management for MQTT client
//!
//! This module contains pure functions for connection state management,
//! session configuration and reconnection backoff.

use crate::config::MqttSection;
use rumqttc::v5::mqttbytes::v5::{ConnectProperties, LastWill};
use rumqttc::v5::{mqttbytes::QoS, MqttOptions};
use rumqttc::Transport as RumqttcTransport;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Every publish and subscription in this system is exactly-once
pub const DELIVERY_QOS: QoS = QoS::ExactlyOnce;

/// Connection state for MQTT client
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Initial state - attempting to connect
    Connecting,
    /// Successfully connected and ready for operations
    Connected,
    /// Disconnected with reason
    Disconnected(String),
    /// Attempting to reconnect (attempt count)
    Reconnecting(u32),
    /// Permanently disconnected - max reconnection attempts exceeded
    PermanentlyDisconnected(String),
}

/// Reconnection configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Backoff pattern in milliseconds
    pub backoff_pattern: Vec<u64>,
    /// Delay to use after pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_pattern: vec![250, 500, 1000, 2000],
            sustained_delay: 5000,
        }
    }
}

impl ReconnectConfig {
    /// Sum of all delays when attempts are bounded, None when unlimited
    pub fn calculate_max_total_time(&self) -> Option<u64> {
        self.max_attempts.map(|max_attempts| {
            (1..=max_attempts)
                .map(|attempt| self.calculate_backoff_delay(attempt))
                .sum()
        })
    }

    /// Delay before the given (1-based) attempt
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }
}

/// Message the broker publishes on our behalf after an abrupt disconnect
#[derive(Debug, Clone, PartialEq)]
pub struct WillMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

/// Session parameters that stay fixed across reconnections
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    /// Stable client id so the broker can resume the persistent session
    pub client_id: String,
    /// `false` requests a persistent session
    pub clean_start: bool,
    pub last_will: Option<WillMessage>,
}

impl SessionOptions {
    /// Persistent session identified by `{identity}-mqtt-client`
    pub fn persistent(identity: &str) -> Self {
        Self {
            client_id: format!("{identity}-mqtt-client"),
            clean_start: false,
            last_will: None,
        }
    }

    pub fn with_last_will(mut self, will: WillMessage) -> Self {
        self.last_will = Some(will);
        self
    }
}

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription to {topic} not acknowledged within {timeout:?}")]
    SubAckTimeout { topic: String, timeout: Duration },
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
    #[error("Connection failed: {0}")]
    ConnectionFailedStr(String),
}

/// Build rumqttc options from broker config and session parameters
pub fn configure_mqtt_options(
    session: &SessionOptions,
    config: &MqttSection,
) -> Result<MqttOptions, MqttError> {
    let url = Url::parse(&config.broker_url)
        .map_err(|_| MqttError::InvalidBrokerUrl(config.broker_url.clone()))?;

    match url.scheme() {
        "mqtt" | "mqtts" | "tcp" | "ssl" => {}
        _ => return Err(MqttError::InvalidBrokerUrl(config.broker_url.clone())),
    }

    let tls = matches!(url.scheme(), "mqtts" | "ssl");
    let host = url
        .host_str()
        .ok_or_else(|| MqttError::InvalidBrokerUrl(config.broker_url.clone()))?;
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

    let mut mqtt_options = MqttOptions::new(session.client_id.clone(), host, port);

    if tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some(username_env) = &config.username_env {
        if let Ok(username) = std::env::var(username_env) {
            let password = config
                .password_env
                .as_ref()
                .and_then(|env_name| std::env::var(env_name).ok())
                .unwrap_or_default();
            mqtt_options.set_credentials(&username, &password);
        }
    }

    mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    mqtt_options.set_clean_start(session.clean_start);
    if let Some(properties) = session_properties(session, config) {
        mqtt_options.set_connect_properties(properties);
    }

    if let Some(will) = &session.last_will {
        let lwt = LastWill::new(
            will.topic.clone(),
            will.payload.clone(),
            DELIVERY_QOS,
            will.retain,
            None,
        );
        mqtt_options.set_last_will(lwt);
    }

    Ok(mqtt_options)
}

/// CONNECT properties for a session. MQTT v5 ends a session on disconnect
/// unless an expiry interval is sent, so persistent sessions always carry one.
pub fn session_properties(
    session: &SessionOptions,
    config: &MqttSection,
) -> Option<ConnectProperties> {
    if session.clean_start {
        return None;
    }

    Some(ConnectProperties {
        session_expiry_interval: Some(config.session_expiry_secs),
        receive_maximum: None,
        max_packet_size: None,
        topic_alias_max: None,
        request_response_info: None,
        request_problem_info: None,
        user_properties: Vec::new(),
        authentication_method: None,
        authentication_data: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_mqtt_config() -> MqttSection {
        MqttSection {
            broker_url: "mqtt://localhost:1883".to_string(),
            username_env: None,
            password_env: None,
            keep_alive_secs: 60,
            session_expiry_secs: 3600,
        }
    }

    #[test]
    fn test_reconnect_config_default() {
        let config = ReconnectConfig::default();
        assert_eq!(config.max_attempts, None);
        assert_eq!(config.backoff_pattern, vec![250, 500, 1000, 2000]);
        assert_eq!(config.sustained_delay, 5000);
        assert_eq!(config.calculate_max_total_time(), None);
    }

    #[test]
    fn test_calculate_backoff_delay() {
        let config = ReconnectConfig::default();

        assert_eq!(config.calculate_backoff_delay(1), 250);
        assert_eq!(config.calculate_backoff_delay(2), 500);
        assert_eq!(config.calculate_backoff_delay(4), 2000);
        assert_eq!(config.calculate_backoff_delay(5), 5000);
        assert_eq!(config.calculate_backoff_delay(100), 5000);

        let flat = ReconnectConfig {
            max_attempts: Some(3),
            backoff_pattern: vec![],
            sustained_delay: 100,
        };
        assert_eq!(flat.calculate_backoff_delay(1), 100);
        assert_eq!(flat.calculate_max_total_time(), Some(300));
    }

    #[test]
    fn test_persistent_session_options() {
        let session = SessionOptions::persistent("dev-1");
        assert_eq!(session.client_id, "dev-1-mqtt-client");
        assert!(!session.clean_start);
        assert!(session.last_will.is_none());

        let will = WillMessage {
            topic: "iot/register/dev-1".to_string(),
            payload: b"SIGN_OUT".to_vec(),
            retain: true,
        };
        let session = session.with_last_will(will.clone());
        assert_eq!(session.last_will, Some(will));
    }

    #[test]
    fn test_configure_mqtt_options() {
        let session = SessionOptions::persistent("dev-1").with_last_will(WillMessage {
            topic: "iot/register/dev-1".to_string(),
            payload: b"SIGN_OUT".to_vec(),
            retain: true,
        });
        let options = configure_mqtt_options(&session, &test_mqtt_config()).unwrap();

        assert_eq!(options.client_id(), "dev-1-mqtt-client");
        assert_eq!(
            options.broker_address(),
            ("localhost".to_string(), 1883)
        );
        assert_eq!(options.keep_alive(), Duration::from_secs(60));

        let properties = session_properties(&session, &test_mqtt_config())
            .expect("persistent sessions carry CONNECT properties");
        assert_eq!(properties.session_expiry_interval, Some(3600));
    }

    #[test]
    fn test_session_expiry_follows_config() {
        let mut config = test_mqtt_config();
        config.session_expiry_secs = 120;

        let properties = session_properties(&SessionOptions::persistent("dev-1"), &config)
            .expect("persistent sessions carry CONNECT properties");
        assert_eq!(properties.session_expiry_interval, Some(120));

        let clean = SessionOptions {
            clean_start: true,
            ..SessionOptions::persistent("dev-1")
        };
        assert!(session_properties(&clean, &config).is_none());
    }

    #[test]
    fn test_default_ports() {
        let session = SessionOptions::persistent("server");
        let mut config = test_mqtt_config();

        config.broker_url = "mqtt://broker.example".to_string();
        let options = configure_mqtt_options(&session, &config).unwrap();
        assert_eq!(options.broker_address().1, 1883);
    }

    #[test]
    fn test_invalid_broker_url() {
        let session = SessionOptions::persistent("dev-1");
        let mut config = test_mqtt_config();

        config.broker_url = "invalid-url".to_string();
        assert!(matches!(
            configure_mqtt_options(&session, &config),
            Err(MqttError::InvalidBrokerUrl(_))
        ));

        config.broker_url = "http://localhost:1883".to_string();
        assert!(matches!(
            configure_mqtt_options(&session, &config),
            Err(MqttError::InvalidBrokerUrl(_))
        ));
    }

    #[test]
    fn test_mqtt_error_display() {
        let errors = vec![
            MqttError::ConnectionFailed("test".to_string().into()),
            MqttError::PublishFailed("test".to_string().into()),
            MqttError::SubscriptionFailed("test".to_string().into()),
            MqttError::SubAckTimeout {
                topic: "a/b".to_string(),
                timeout: Duration::from_secs(1),
            },
            MqttError::InvalidBrokerUrl("test".to_string()),
            MqttError::NotConnected {
                state: ConnectionState::Disconnected("test".to_string()),
            },
            MqttError::ConnectionFailedStr("test".to_string()),
        ];

        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }
}
