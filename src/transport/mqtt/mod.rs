//! MQTT v5 client implementation
//!
//! The client separates pure functions from I/O operations:
//!
//! - [`connection`] - Pure connection state, session options and backoff
//! - [`message_handler`] - Pure event classification and message forwarding
//! - [`health_monitor`] - Pure reconnection decisions and state transitions
//! - [`client`] - Impure I/O operations and the event loop supervisor
//!
//! # Usage
//!
//! ```rust,no_run
//! use iotlink::config::MqttSection;
//! use iotlink::transport::mqtt::{MqttClient, ReconnectConfig, SessionOptions};
//! use iotlink::transport::Transport;
//!
//! # tokio_test::block_on(async {
//! let config = MqttSection {
//!     broker_url: "mqtt://localhost:1883".to_string(),
//!     username_env: None,
//!     password_env: None,
//!     keep_alive_secs: 60,
//!     session_expiry_secs: 3600,
//! };
//!
//! let session = SessionOptions::persistent("iot-server");
//! let mut client = MqttClient::new(session, config, ReconnectConfig::default())?;
//! client.connect().await?;
//! client.subscribe(&["iot/data/+".to_string()]).await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;

// Re-export public types for convenience
pub use client::MqttClient;
pub use connection::{
    configure_mqtt_options, session_properties, ConnectionState, MqttError, ReconnectConfig,
    SessionOptions, WillMessage, DELIVERY_QOS,
};
pub use health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
pub use message_handler::{EventRoute, MessageForwarder, MessageHandler};
