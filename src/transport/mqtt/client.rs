//! Impure I/O operations for MQTT client
//!
//! This module handles network communication, async coordination and the
//! integration with the rumqttc client. A supervisor task owns the rumqttc
//! event loop; the [`MqttClient`] handle talks to it through channels.

use super::connection::{
    configure_mqtt_options, ConnectionState, MqttError, ReconnectConfig, SessionOptions,
    DELIVERY_QOS,
};
use super::health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
use super::message_handler::{EventRoute, MessageForwarder, MessageHandler};
use crate::config::MqttSection;
use crate::observability::metrics;
use crate::transport::{IncomingMessage, Transport};
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::v5::PublishProperties;
use rumqttc::v5::{AsyncClient, ConnectionError, EventLoop};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Capacity of the request channel between the handle and the event loop
const REQUEST_CHANNEL_CAPACITY: usize = 64;
/// How long `subscribe` waits for the broker's SubAck
const SUBACK_TIMEOUT: Duration = Duration::from_secs(10);
/// How long `disconnect` waits for in-flight exactly-once publishes
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
/// How long `disconnect` waits for the supervisor to stop on its own
const SUPERVISOR_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// MQTT v5 transport with a persistent session and automatic reconnection
pub struct MqttClient {
    session: SessionOptions,
    client: AsyncClient,
    // EventLoop is !Sync; the mutex keeps the client shareable behind an Arc
    event_loop: Mutex<Option<EventLoop>>,
    event_loop_handle: Mutex<Option<JoinHandle<()>>>,
    state_tx: Option<Arc<watch::Sender<ConnectionState>>>,
    state_rx: Option<watch::Receiver<ConnectionState>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    reconnect_config: ReconnectConfig,
    subscribed_topics: Arc<Mutex<Vec<String>>>,
    message_forwarder: Arc<Mutex<MessageForwarder>>,
    suback_tx: Arc<watch::Sender<u64>>,
    pending_tx: Arc<watch::Sender<usize>>,
    reconnect_tx: Arc<watch::Sender<u64>>,
    closing: Arc<AtomicBool>,
}

impl MqttClient {
    /// Build the client; the last-will, if any, is fixed here for the
    /// lifetime of the session
    pub fn new(
        session: SessionOptions,
        config: MqttSection,
        reconnect_config: ReconnectConfig,
    ) -> Result<Self, MqttError> {
        let mqtt_options = configure_mqtt_options(&session, &config)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);

        Ok(MqttClient {
            session,
            client,
            event_loop: Mutex::new(Some(event_loop)),
            event_loop_handle: Mutex::new(None),
            state_tx: None,
            state_rx: None,
            shutdown_tx: None,
            reconnect_config,
            subscribed_topics: Arc::new(Mutex::new(Vec::new())),
            message_forwarder: Arc::new(Mutex::new(MessageForwarder::new())),
            suback_tx: Arc::new(watch::channel(0).0),
            pending_tx: Arc::new(watch::channel(0).0),
            reconnect_tx: Arc::new(watch::channel(0).0),
            closing: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.session.client_id
    }

    /// Create connection state and shutdown channels
    #[allow(clippy::type_complexity)]
    fn setup_connection_channels() -> (
        (
            watch::Sender<ConnectionState>,
            watch::Receiver<ConnectionState>,
        ),
        (watch::Sender<bool>, watch::Receiver<bool>),
    ) {
        let state_channels = watch::channel(ConnectionState::Connecting);
        let shutdown_channels = watch::channel(false);
        (state_channels, shutdown_channels)
    }

    /// Wait for connection confirmation (ConnAck) with timeout
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), MqttError> {
        let timeout_result = tokio::time::timeout(timeout, async {
            loop {
                if state_rx.changed().await.is_err() {
                    return Err(MqttError::ConnectionFailedStr(
                        "State channel closed".to_string(),
                    ));
                }
                match *state_rx.borrow() {
                    ConnectionState::Connected => return Ok(()),
                    // Startup failures are retried under the reconnect policy
                    ConnectionState::Disconnected(ref reason) => {
                        debug!(reason = %reason, "Initial connection attempt failed");
                        continue;
                    }
                    ConnectionState::PermanentlyDisconnected(ref reason) => {
                        return Err(MqttError::ConnectionFailedStr(format!(
                            "Permanently disconnected: {reason}"
                        )));
                    }
                    ConnectionState::Connecting | ConnectionState::Reconnecting(_) => continue,
                }
            }
        })
        .await;

        match timeout_result {
            Ok(result) => result,
            Err(_) => Err(MqttError::ConnectionFailedStr(
                "ConnAck timeout - no connection confirmation received".to_string(),
            )),
        }
    }

    /// Start the event loop supervisor and wait for the first ConnAck
    pub async fn connect(&mut self) -> Result<(), MqttError> {
        let event_loop = self.event_loop.get_mut().take().ok_or_else(|| {
            MqttError::ConnectionFailedStr("Event loop already started".to_string())
        })?;

        let ((state_tx, state_rx), (shutdown_tx, shutdown_rx)) =
            Self::setup_connection_channels();
        let state_tx = Arc::new(state_tx);
        self.state_tx = Some(state_tx.clone());
        self.state_rx = Some(state_rx.clone());
        self.shutdown_tx = Some(shutdown_tx);

        let supervisor = Supervisor {
            client: self.client.clone(),
            state_tx,
            shutdown_rx,
            reconnect_config: self.reconnect_config.clone(),
            reconnect_attempts: 0,
            has_connected: false,
            subscribed_topics: self.subscribed_topics.clone(),
            message_forwarder: self.message_forwarder.clone(),
            suback_tx: self.suback_tx.clone(),
            pending_tx: self.pending_tx.clone(),
            reconnect_tx: self.reconnect_tx.clone(),
            closing: self.closing.clone(),
        };

        info!(client_id = %self.session.client_id, "Connecting to MQTT broker");
        metrics().mqtt_connection_attempt();

        let span = crate::mqtt_span!(client_id = %self.session.client_id);
        let handle = tokio::spawn(supervisor.run(event_loop).instrument(span));
        *self.event_loop_handle.get_mut() = Some(handle);

        let connection_timeout =
            HealthMonitor::calculate_connection_timeout(&self.reconnect_config);
        Self::wait_for_connection_confirmation(state_rx, connection_timeout).await
    }

    /// Check connection state before operations
    fn check_connection_state(&self) -> Result<(), MqttError> {
        let state_rx = self.state_rx.as_ref().ok_or_else(|| {
            MqttError::ConnectionFailedStr("Client not connected: state_rx is None".to_string())
        })?;

        let current_state = state_rx.borrow().clone();
        if !HealthMonitor::can_publish(&current_state) {
            return Err(MqttError::NotConnected {
                state: current_state,
            });
        }

        Ok(())
    }

    /// Subscribe to each filter at exactly-once and wait for all SubAcks
    pub async fn subscribe_filters(&mut self, filters: &[String]) -> Result<(), MqttError> {
        if let Some(state_rx) = &self.state_rx {
            let current_state = state_rx.borrow().clone();
            if !HealthMonitor::can_subscribe(&current_state) {
                return Err(MqttError::NotConnected {
                    state: current_state,
                });
            }
        } else {
            return Err(MqttError::NotConnected {
                state: ConnectionState::Disconnected("never connected".to_string()),
            });
        }

        let mut suback_rx = self.suback_tx.subscribe();
        let target = *suback_rx.borrow() + filters.len() as u64;

        for filter in filters {
            info!(filter = %filter, "Subscribing");
            self.client
                .subscribe(filter.clone(), DELIVERY_QOS)
                .await
                .map_err(|e| {
                    MqttError::SubscriptionFailed(
                        format!("Failed to subscribe to {filter}: {e}").into(),
                    )
                })?;

            // Track subscription for re-subscription after reconnection
            let mut topics = self.subscribed_topics.lock().await;
            if !topics.contains(filter) {
                topics.push(filter.clone());
            }
        }

        let acknowledged = tokio::time::timeout(SUBACK_TIMEOUT, async {
            suback_rx
                .wait_for(|acked| *acked >= target)
                .await
                .map(|_| ())
        })
        .await;

        match acknowledged {
            Ok(Ok(_)) => {
                info!(filters = ?filters, "Subscriptions acknowledged");
                Ok(())
            }
            Ok(Err(_)) => Err(MqttError::ConnectionFailedStr(
                "SubAck channel closed".to_string(),
            )),
            Err(_) => Err(MqttError::SubAckTimeout {
                topic: filters.join(","),
                timeout: SUBACK_TIMEOUT,
            }),
        }
    }

    /// Publish at exactly-once delivery
    pub async fn publish_message(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), MqttError> {
        self.check_connection_state()?;

        self.pending_tx.send_modify(|pending| *pending += 1);
        let result = self
            .client
            .publish_with_properties(
                topic,
                DELIVERY_QOS,
                retain,
                payload,
                PublishProperties::default(),
            )
            .await;

        match result {
            Ok(()) => {
                metrics().mqtt_message_published();
                debug!(topic = %topic, retain = retain, "Published message");
                Ok(())
            }
            Err(e) => {
                self.pending_tx
                    .send_modify(|pending| *pending = pending.saturating_sub(1));
                metrics().mqtt_publish_failed();
                Err(MqttError::PublishFailed(Box::new(e)))
            }
        }
    }

    /// Graceful shutdown: drain in-flight publishes, send DISCONNECT, then
    /// stop the supervisor. Calling it again is a no-op.
    pub async fn close(&self) -> Result<(), MqttError> {
        let Some(shutdown_tx) = &self.shutdown_tx else {
            debug!("Disconnect requested before connect - nothing to do");
            return Ok(());
        };
        if self.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if self.is_connected() {
            let mut pending_rx = self.pending_tx.subscribe();
            if tokio::time::timeout(DRAIN_TIMEOUT, pending_rx.wait_for(|pending| *pending == 0))
                .await
                .is_err()
            {
                warn!(
                    pending = *self.pending_tx.borrow(),
                    "In-flight publishes not completed before disconnect"
                );
            }

            if let Err(e) = self.client.disconnect().await {
                warn!(error = %e, "Failed to send DISCONNECT");
            }
        }

        let handle = self.event_loop_handle.lock().await.take();
        if let Some(mut handle) = handle {
            match tokio::time::timeout(SUPERVISOR_STOP_TIMEOUT, &mut handle).await {
                Ok(Ok(())) => info!("Event loop task shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => warn!("Event loop task ended with error: {}", e),
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!("Event loop task didn't shut down gracefully, forcing abort");
                    let _ = shutdown_tx.send(true);
                    handle.abort();
                }
            }
        }
        let _ = shutdown_tx.send(true);

        if let Some(state_tx) = &self.state_tx {
            state_tx.send_replace(ConnectionState::Disconnected(
                "Client disconnected".to_string(),
            ));
        }
        metrics().mqtt_connection_lost();

        info!(client_id = %self.session.client_id, "MQTT client disconnected");
        Ok(())
    }

    /// Get current connection state
    /// Returns None if connection hasn't been established yet
    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.state_rx.as_ref().map(|rx| rx.borrow().clone())
    }

    /// Check if the connection is permanently disconnected
    pub fn is_permanently_disconnected(&self) -> bool {
        matches!(
            self.connection_state(),
            Some(ConnectionState::PermanentlyDisconnected(_))
        )
    }
}

#[async_trait]
impl Transport for MqttClient {
    type Error = MqttError;

    async fn connect(&mut self) -> Result<(), Self::Error> {
        MqttClient::connect(self).await
    }

    async fn subscribe(&mut self, filters: &[String]) -> Result<(), Self::Error> {
        self.subscribe_filters(filters).await
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), Self::Error> {
        self.publish_message(topic, payload, retain).await
    }

    async fn disconnect(&self) -> Result<(), Self::Error> {
        self.close().await
    }

    async fn set_message_sender(&self, sender: mpsc::Sender<IncomingMessage>) {
        self.message_forwarder.lock().await.set_sender(sender);
    }

    fn is_connected(&self) -> bool {
        matches!(self.connection_state(), Some(ConnectionState::Connected))
    }

    fn connection_state(&self) -> Option<ConnectionState> {
        MqttClient::connection_state(self)
    }

    fn is_permanently_disconnected(&self) -> bool {
        MqttClient::is_permanently_disconnected(self)
    }

    fn reconnections(&self) -> Option<watch::Receiver<u64>> {
        Some(self.reconnect_tx.subscribe())
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        // Signal shutdown to background tasks if they're still running
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
        }

        if let Some(handle) = self.event_loop_handle.get_mut().take() {
            handle.abort();
        }
    }
}

/// Owns the rumqttc event loop: classifies events, tracks connection state
/// and drives reconnection with backoff
struct Supervisor {
    client: AsyncClient,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    shutdown_rx: watch::Receiver<bool>,
    reconnect_config: ReconnectConfig,
    reconnect_attempts: u32,
    has_connected: bool,
    subscribed_topics: Arc<Mutex<Vec<String>>>,
    message_forwarder: Arc<Mutex<MessageForwarder>>,
    suback_tx: Arc<watch::Sender<u64>>,
    pending_tx: Arc<watch::Sender<usize>>,
    reconnect_tx: Arc<watch::Sender<u64>>,
    closing: Arc<AtomicBool>,
}

impl Supervisor {
    async fn run(mut self, mut event_loop: EventLoop) {
        info!("Starting MQTT event loop supervisor");

        loop {
            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping supervisor");
                        break;
                    }
                }

                event_result = event_loop.poll() => {
                    let keep_running = match event_result {
                        Ok(event) => {
                            let route = MessageHandler::route_mqtt_event(&event);
                            self.process_event_route(route).await
                        }
                        Err(e) => self.handle_event_loop_error(e).await,
                    };
                    if !keep_running {
                        break;
                    }
                }
            }
        }

        info!("MQTT event loop supervisor stopped");
    }

    fn current_state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    fn transition(&self, event: ConnectionEvent) {
        let next = HealthMonitor::determine_next_state(&self.current_state(), event);
        self.state_tx.send_replace(next);
    }

    /// Returns true to continue loop, false to break
    async fn process_event_route(&mut self, route: EventRoute) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged { session_present } => {
                debug!(session_present = session_present, "ConnAck received");
                // Subscriptions are restored before anyone sees Connected
                self.resubscribe_to_topics().await;
                self.transition(ConnectionEvent::ConnAckReceived);
                metrics().mqtt_connection_established();
                self.reconnect_attempts = 0;

                if self.has_connected {
                    self.reconnect_tx.send_modify(|count| *count += 1);
                }
                self.has_connected = true;
                true
            }
            EventRoute::MessageReceived(message) => {
                metrics().mqtt_message_received();
                debug!(topic = %message.topic, retain = message.retain, "Received MQTT message");
                let forwarder = self.message_forwarder.lock().await;
                if let Err(e) = forwarder.forward(message).await {
                    error!("Failed to forward inbound message: {}", e);
                }
                true
            }
            EventRoute::Disconnected => {
                if self.closing.load(Ordering::SeqCst) {
                    return false;
                }
                self.transition(ConnectionEvent::DisconnectedByBroker);
                metrics().mqtt_connection_lost();
                self.attempt_reconnection().await
            }
            EventRoute::SubscriptionConfirmed { packet_id } => {
                debug!(packet_id = packet_id, "Subscription confirmed");
                self.suback_tx.send_modify(|acked| *acked += 1);
                true
            }
            EventRoute::DeliveryCompleted { packet_id } => {
                debug!(packet_id = packet_id, "Delivery completed");
                self.pending_tx
                    .send_modify(|pending| *pending = pending.saturating_sub(1));
                true
            }
            EventRoute::InfrastructureEvent(event_str) => {
                tracing::trace!(target: "mqtt_transport", "MQTT event: {}", event_str);
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    /// Returns true to continue loop (after backoff), false to break
    async fn handle_event_loop_error(&mut self, error: ConnectionError) -> bool {
        if self.closing.load(Ordering::SeqCst) {
            debug!(error = %error, "Connection closed during shutdown");
            return false;
        }

        error!("MQTT event loop error: {}", error);
        if !matches!(self.current_state(), ConnectionState::Reconnecting(_)) {
            metrics().mqtt_connection_lost();
        }
        self.transition(ConnectionEvent::NetworkError(error.to_string()));
        self.attempt_reconnection().await
    }

    /// Decide on and wait out the next reconnection attempt. rumqttc
    /// reconnects on the next poll, keeping the session's in-flight state.
    async fn attempt_reconnection(&mut self) -> bool {
        let decision = HealthMonitor::should_attempt_reconnection(
            self.reconnect_attempts,
            &self.reconnect_config,
            *self.shutdown_rx.borrow(),
        );

        match decision {
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                self.reconnect_attempts = attempt;
                self.transition(ConnectionEvent::ReconnectionStarted(attempt));
                metrics().mqtt_connection_attempt();

                let max_display = self
                    .reconnect_config
                    .max_attempts
                    .map_or("∞".to_string(), |max| max.to_string());
                info!(
                    "Attempting reconnection {}/{} after {}ms delay",
                    attempt, max_display, delay_ms
                );

                interruptible_sleep(self.shutdown_rx.clone(), delay_ms).await
            }
            ReconnectionDecision::AbortShutdownRequested => {
                info!("Shutdown signal received, stopping reconnection");
                false
            }
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                let reason = format!(
                    "Max reconnection attempts ({}) exceeded",
                    self.reconnect_attempts
                );
                self.transition(ConnectionEvent::PermanentFailure(reason));
                false
            }
        }
    }

    async fn resubscribe_to_topics(&self) {
        let topics = self.subscribed_topics.lock().await.clone();
        for topic in topics {
            if let Err(e) = self.client.subscribe(topic.clone(), DELIVERY_QOS).await {
                error!("Failed to re-subscribe to {}: {}", topic, e);
            } else {
                debug!(target: "mqtt_transport", "Re-subscribed to: {}", topic);
            }
        }
    }
}

/// Perform interruptible sleep with shutdown monitoring
/// Returns true if sleep completed, false if shutdown requested
async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay_ms: u64) -> bool {
    tokio::select! {
        changed = shutdown_rx.changed() => {
            if changed.is_err() || *shutdown_rx.borrow() {
                info!("Shutdown signal received during reconnection delay, stopping");
                return false;
            }
            true
        }
        _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
    }
}
