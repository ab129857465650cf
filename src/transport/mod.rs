//! Transport layer for device and coordinator messaging
//!
//! This module provides a transport abstraction and its MQTT implementation,
//! so the role logic can run against an in-memory mock in tests.

use tokio::sync::{mpsc, watch};

pub mod mqtt;

use mqtt::ConnectionState;

/// A publish received on one of our subscriptions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

impl IncomingMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: false,
        }
    }

    /// Payload as text, replacing invalid UTF-8 sequences
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Transport trait for broker communication
///
/// `connect` and `subscribe` run before the transport is shared; everything
/// else takes `&self` so the transport can live behind an `Arc`.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Connect to the broker and wait for the connection to be acknowledged
    async fn connect(&mut self) -> Result<(), Self::Error>;

    /// Subscribe to every filter and wait until the broker acknowledges them.
    /// Filters are re-subscribed automatically after a reconnection.
    async fn subscribe(&mut self, filters: &[String]) -> Result<(), Self::Error>;

    /// Publish a payload to a topic
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool)
        -> Result<(), Self::Error>;

    /// Disconnect from the broker, flushing in-flight publishes first
    async fn disconnect(&self) -> Result<(), Self::Error>;

    /// Register the channel receiving every inbound publish
    async fn set_message_sender(&self, sender: mpsc::Sender<IncomingMessage>);

    /// Check if transport is currently connected
    fn is_connected(&self) -> bool;

    /// Get current connection state, None before `connect`
    fn connection_state(&self) -> Option<ConnectionState>;

    /// Check if the connection is permanently disconnected
    fn is_permanently_disconnected(&self) -> bool;

    /// Counter bumped every time a lost connection is re-established
    fn reconnections(&self) -> Option<watch::Receiver<u64>>;
}

/// Type alias for MQTT transport
pub type MqttTransport = mqtt::MqttClient;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incoming_message_payload_str() {
        let message = IncomingMessage::new("iot/register/dev-1", "SIGN_IN");
        assert_eq!(message.payload_str(), "SIGN_IN");
        assert!(!message.retain);

        let binary = IncomingMessage::new("t/x", vec![0xff, b'a']);
        assert!(binary.payload_str().ends_with('a'));
    }
}
