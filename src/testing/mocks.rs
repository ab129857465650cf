//! Mock implementations for testing
//!
//! Provides an in-memory [`Transport`] and a recording [`Sink`] so both roles
//! can be exercised without a broker.

use crate::sink::{execute_builtin, Sink};
use crate::transport::mqtt::{ConnectionState, MqttError};
use crate::transport::{IncomingMessage, Transport};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};

/// A publish captured by [`MockTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

impl PublishedMessage {
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Transport calls in the order they were made
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOperation {
    Connect,
    Subscribe(Vec<String>),
    Publish { topic: String, retain: bool },
    Disconnect,
}

/// Mock transport for testing
///
/// Cloning yields another handle onto the same recorded state, so a test can
/// keep one handle while the role under test owns the other.
#[derive(Debug, Clone)]
pub struct MockTransport {
    published: Arc<Mutex<Vec<PublishedMessage>>>,
    operations: Arc<Mutex<Vec<MockOperation>>>,
    sender: Arc<Mutex<Option<mpsc::Sender<IncomingMessage>>>>,
    state_tx: Arc<watch::Sender<Option<ConnectionState>>>,
    reconnect_tx: Arc<watch::Sender<u64>>,
    fail_connect: bool,
    fail_publish: Arc<AtomicBool>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            published: Arc::new(Mutex::new(Vec::new())),
            operations: Arc::new(Mutex::new(Vec::new())),
            sender: Arc::new(Mutex::new(None)),
            state_tx: Arc::new(watch::channel(None).0),
            reconnect_tx: Arc::new(watch::channel(0).0),
            fail_connect: false,
            fail_publish: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Transport whose `connect` always fails
    pub fn with_failure() -> Self {
        Self {
            fail_connect: true,
            ..Self::new()
        }
    }

    /// Make subsequent publishes fail (or succeed again)
    pub fn set_publish_failure(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().await.clone()
    }

    pub async fn published_to(&self, topic: &str) -> Vec<PublishedMessage> {
        self.published
            .lock()
            .await
            .iter()
            .filter(|message| message.topic == topic)
            .cloned()
            .collect()
    }

    pub async fn operations(&self) -> Vec<MockOperation> {
        self.operations.lock().await.clone()
    }

    pub async fn subscriptions(&self) -> Vec<String> {
        self.operations
            .lock()
            .await
            .iter()
            .filter_map(|operation| match operation {
                MockOperation::Subscribe(filters) => Some(filters.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub async fn clear_history(&self) {
        self.published.lock().await.clear();
        self.operations.lock().await.clear();
    }

    /// Deliver a message as if the broker had sent it.
    /// Returns false when no sender is registered or the receiver is gone.
    pub async fn inject(&self, message: IncomingMessage) -> bool {
        let sender = self.sender.lock().await.clone();
        match sender {
            Some(sender) => sender.send(message).await.is_ok(),
            None => false,
        }
    }

    /// Drop the connection without the client asking for it
    pub fn simulate_connection_loss(&self) {
        self.state_tx.send_replace(Some(ConnectionState::Disconnected(
            "Mock connection loss".to_string(),
        )));
    }

    /// Re-establish a lost connection and notify reconnection watchers
    pub fn simulate_reconnect(&self) {
        self.state_tx.send_replace(Some(ConnectionState::Connected));
        self.reconnect_tx.send_modify(|count| *count += 1);
    }

    /// Give up on the connection for good
    pub fn simulate_permanent_failure(&self) {
        self.state_tx
            .send_replace(Some(ConnectionState::PermanentlyDisconnected(
                "Mock permanent failure".to_string(),
            )));
    }

    async fn record(&self, operation: MockOperation) {
        self.operations.lock().await.push(operation);
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Error = MqttError;

    async fn connect(&mut self) -> Result<(), Self::Error> {
        self.record(MockOperation::Connect).await;
        if self.fail_connect {
            self.state_tx.send_replace(Some(ConnectionState::Disconnected(
                "Mock connection failure".to_string(),
            )));
            return Err(MqttError::ConnectionFailedStr(
                "Mock connection failure".to_string(),
            ));
        }
        self.state_tx.send_replace(Some(ConnectionState::Connected));
        Ok(())
    }

    async fn subscribe(&mut self, filters: &[String]) -> Result<(), Self::Error> {
        if !self.is_connected() {
            return Err(MqttError::NotConnected {
                state: self
                    .connection_state()
                    .unwrap_or(ConnectionState::Connecting),
            });
        }
        self.record(MockOperation::Subscribe(filters.to_vec()))
            .await;
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), Self::Error> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(MqttError::PublishFailed("Mock publish failure".into()));
        }
        if !self.is_connected() {
            return Err(MqttError::NotConnected {
                state: self
                    .connection_state()
                    .unwrap_or(ConnectionState::Connecting),
            });
        }

        self.record(MockOperation::Publish {
            topic: topic.to_string(),
            retain,
        })
        .await;
        self.published.lock().await.push(PublishedMessage {
            topic: topic.to_string(),
            payload,
            retain,
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), Self::Error> {
        self.record(MockOperation::Disconnect).await;
        self.state_tx.send_replace(Some(ConnectionState::Disconnected(
            "Client disconnected".to_string(),
        )));
        Ok(())
    }

    async fn set_message_sender(&self, sender: mpsc::Sender<IncomingMessage>) {
        *self.sender.lock().await = Some(sender);
    }

    fn is_connected(&self) -> bool {
        matches!(self.connection_state(), Some(ConnectionState::Connected))
    }

    fn connection_state(&self) -> Option<ConnectionState> {
        self.state_tx.borrow().clone()
    }

    fn is_permanently_disconnected(&self) -> bool {
        matches!(
            self.connection_state(),
            Some(ConnectionState::PermanentlyDisconnected(_))
        )
    }

    fn reconnections(&self) -> Option<watch::Receiver<u64>> {
        Some(self.reconnect_tx.subscribe())
    }
}

/// Sink that remembers every stored payload and executed command
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    stored: Arc<std::sync::Mutex<Vec<String>>>,
    executed: Arc<std::sync::Mutex<Vec<String>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stored(&self) -> Vec<String> {
        self.stored
            .lock()
            .map(|stored| stored.clone())
            .unwrap_or_default()
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed
            .lock()
            .map(|executed| executed.clone())
            .unwrap_or_default()
    }
}

impl Sink for RecordingSink {
    fn store_data(&self, payload: &str) {
        if let Ok(mut stored) = self.stored.lock() {
            stored.push(payload.to_string());
        }
    }

    fn execute(&self, command: &str) -> String {
        if let Ok(mut executed) = self.executed.lock() {
            executed.push(command.to_string());
        }
        execute_builtin(command).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_transport_records_in_order() {
        let mut transport = MockTransport::new();
        let handle = transport.clone();

        transport.connect().await.unwrap();
        transport.subscribe(&["a/+".to_string()]).await.unwrap();
        transport.publish("a/1", b"x".to_vec(), true).await.unwrap();
        transport.disconnect().await.unwrap();

        assert_eq!(
            handle.operations().await,
            vec![
                MockOperation::Connect,
                MockOperation::Subscribe(vec!["a/+".to_string()]),
                MockOperation::Publish {
                    topic: "a/1".to_string(),
                    retain: true
                },
                MockOperation::Disconnect,
            ]
        );
        assert_eq!(handle.subscriptions().await, vec!["a/+".to_string()]);
        assert_eq!(handle.published_to("a/1").await[0].payload_str(), "x");
        assert!(!handle.is_connected());
    }

    #[tokio::test]
    async fn test_mock_transport_failures() {
        let mut failing = MockTransport::with_failure();
        assert!(failing.connect().await.is_err());
        assert!(failing.publish("a/1", vec![], false).await.is_err());

        let mut transport = MockTransport::new();
        transport.connect().await.unwrap();
        transport.set_publish_failure(true);
        assert!(transport.publish("a/1", vec![], false).await.is_err());
        transport.set_publish_failure(false);
        assert!(transport.publish("a/1", vec![], false).await.is_ok());
    }

    #[tokio::test]
    async fn test_mock_transport_inject_and_reconnect() {
        let transport = MockTransport::new();
        let message = IncomingMessage::new("a/1", "hello");
        assert!(!transport.inject(message.clone()).await);

        let (tx, mut rx) = mpsc::channel(1);
        transport.set_message_sender(tx).await;
        assert!(transport.inject(message.clone()).await);
        assert_eq!(rx.recv().await, Some(message));

        let mut reconnections = transport.reconnections().unwrap();
        transport.simulate_connection_loss();
        assert!(!transport.is_connected());
        transport.simulate_reconnect();
        assert!(transport.is_connected());
        reconnections.changed().await.unwrap();
        assert_eq!(*reconnections.borrow(), 1);
    }

    #[test]
    fn test_recording_sink() {
        let sink = RecordingSink::new();
        sink.store_data("{\"a\":1}");
        assert_eq!(sink.execute("PING"), "PONG");
        assert_eq!(sink.execute("REBOOT"), crate::protocol::UNKNOWN_COMMAND_RESULT);

        assert_eq!(sink.stored(), vec!["{\"a\":1}".to_string()]);
        assert_eq!(sink.executed(), vec!["PING".to_string(), "REBOOT".to_string()]);
    }
}
