//! Device agent lifecycle
//!
//! A device announces itself with a retained `SIGN_IN`, publishes telemetry on
//! a timer and answers command requests. On shutdown it overwrites its presence
//! with a retained `SIGN_OUT`; if it dies instead, the broker publishes the same
//! payload as the session's last-will.

use crate::config::DeviceSection;
use crate::error::{IotError, IotResult};
use crate::observability::metrics;
use crate::protocol::{
    Command, CommandResponse, PresenceSignal, ProtocolError, TelemetrySample, TopicCategory,
    TopicLayout,
};
use crate::sink::Sink;
use crate::transport::mqtt::{SessionOptions, WillMessage};
use crate::transport::{IncomingMessage, Transport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn, Instrument};

/// Capacity of the channel between the transport and the command loop
const INBOUND_CHANNEL_CAPACITY: usize = 32;

/// Session a device's transport must be built with: persistent, identified
/// by `{id}-mqtt-client`, with a retained `SIGN_OUT` as last-will
pub fn device_session(device_id: &str, topics: &TopicLayout) -> SessionOptions {
    SessionOptions::persistent(device_id).with_last_will(WillMessage {
        topic: topics.device_topic(TopicCategory::Register, device_id),
        payload: PresenceSignal::SignOut.to_payload(),
        retain: true,
    })
}

/// Decode a command request and build the response (pure apart from the sink)
pub fn build_command_response(
    device_id: &str,
    sink: &dyn Sink,
    payload: &[u8],
) -> Result<CommandResponse, ProtocolError> {
    let command = Command::from_json(payload)?;
    let result = sink.execute(&command.command);
    Ok(CommandResponse::new(device_id, command, result))
}

/// One device's lifecycle against the broker
pub struct DeviceAgent<T>
where
    T: Transport + 'static,
{
    settings: DeviceSection,
    topics: TopicLayout,
    sink: Arc<dyn Sink>,
    transport: Option<T>,
    shared_transport: Option<Arc<T>>,
    tasks: Vec<JoinHandle<()>>,
    stopped: bool,
}

impl<T> DeviceAgent<T>
where
    T: Transport + 'static,
{
    /// Build the agent; no I/O happens until [`DeviceAgent::start`]
    pub fn new(
        settings: DeviceSection,
        topics: TopicLayout,
        transport: T,
        sink: Arc<dyn Sink>,
    ) -> Self {
        Self {
            settings,
            topics,
            sink,
            transport: Some(transport),
            shared_transport: None,
            tasks: Vec::new(),
            stopped: false,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.settings.id
    }

    /// The transport, whether or not the agent has started
    pub fn transport(&self) -> Option<&T> {
        self.transport
            .as_ref()
            .or(self.shared_transport.as_deref())
    }

    /// True between a successful `start` and `shutdown`
    pub fn is_running(&self) -> bool {
        self.shared_transport.is_some() && !self.stopped
    }

    pub fn is_permanently_disconnected(&self) -> bool {
        self.transport()
            .is_some_and(|transport| transport.is_permanently_disconnected())
    }

    fn topic(&self, category: TopicCategory) -> String {
        self.topics.device_topic(category, &self.settings.id)
    }

    /// Decode one command request and compute its response
    pub fn handle_command(&self, payload: &[u8]) -> Result<CommandResponse, ProtocolError> {
        build_command_response(&self.settings.id, self.sink.as_ref(), payload)
    }

    /// Connect, subscribe for commands, announce presence and spawn the
    /// telemetry, command and reconnect tasks.
    ///
    /// On failure the transport is disconnected and handed back to the agent,
    /// so `transport()` still reports it and `start` may be called again.
    pub async fn start(&mut self) -> IotResult<()> {
        let mut transport = self
            .transport
            .take()
            .ok_or_else(|| IotError::invalid_state("Device agent already started"))?;
        let device_id = self.settings.id.clone();
        info!(device_id = %device_id, "Starting device agent");

        let (message_tx, message_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        transport.set_message_sender(message_tx).await;

        if let Err(e) = self.announce(&mut transport).await {
            error!(device_id = %device_id, error = %e, "Device agent failed to start");
            if let Err(disconnect_error) = transport.disconnect().await {
                warn!(
                    device_id = %device_id,
                    error = %disconnect_error,
                    "Failed to disconnect after start failure"
                );
            }
            self.transport = Some(transport);
            return Err(e);
        }

        let command_topic = self.topic(TopicCategory::CommandRequest);
        let register_topic = self.topic(TopicCategory::Register);
        let transport = Arc::new(transport);
        let span = crate::device_span!(device_id = %device_id);

        self.tasks.push(tokio::spawn(
            run_telemetry_loop(
                transport.clone(),
                device_id.clone(),
                self.topic(TopicCategory::Data),
                self.settings.telemetry_interval(),
            )
            .instrument(span.clone()),
        ));
        self.tasks.push(tokio::spawn(
            run_command_loop(
                transport.clone(),
                self.sink.clone(),
                device_id.clone(),
                command_topic,
                self.topic(TopicCategory::CommandResponse),
                message_rx,
            )
            .instrument(span.clone()),
        ));
        if let Some(reconnections) = transport.reconnections() {
            self.tasks.push(tokio::spawn(
                run_reconnect_watcher(transport.clone(), register_topic, reconnections)
                    .instrument(span),
            ));
        }

        self.shared_transport = Some(transport);
        info!(device_id = %device_id, "Device agent started");
        Ok(())
    }

    /// Connect, subscribe to command requests, then publish a retained `SIGN_IN`
    async fn announce(&self, transport: &mut T) -> IotResult<()> {
        transport.connect().await.map_err(IotError::transport)?;
        info!(device_id = %self.settings.id, "Connected to broker");

        // SIGN_IN only after the command subscription is acknowledged
        let command_topic = self.topic(TopicCategory::CommandRequest);
        transport
            .subscribe(std::slice::from_ref(&command_topic))
            .await
            .map_err(IotError::transport)?;

        let register_topic = self.topic(TopicCategory::Register);
        transport
            .publish(&register_topic, PresenceSignal::SignIn.to_payload(), true)
            .await
            .map_err(IotError::transport)?;
        info!(device_id = %self.settings.id, topic = %register_topic, "Signed in");
        Ok(())
    }

    /// Stop background tasks, publish a retained `SIGN_OUT` and disconnect.
    /// Calling it more than once has no further effect.
    pub async fn shutdown(&mut self) -> IotResult<()> {
        if self.stopped {
            debug!(device_id = %self.settings.id, "Device agent already shut down");
            return Ok(());
        }
        self.stopped = true;
        info!(device_id = %self.settings.id, "Shutting down device agent");

        for handle in self.tasks.drain(..) {
            handle.abort();
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!("Device task shutdown error: {}", e);
                }
            }
        }

        let Some(transport) = self.shared_transport.as_ref() else {
            info!(device_id = %self.settings.id, "Device agent was never started");
            return Ok(());
        };

        let register_topic = self.topic(TopicCategory::Register);
        match transport
            .publish(&register_topic, PresenceSignal::SignOut.to_payload(), true)
            .await
        {
            Ok(()) => info!(device_id = %self.settings.id, "Signed out"),
            Err(e) => warn!(
                device_id = %self.settings.id,
                error = %e,
                "Failed to publish SIGN_OUT; relying on last-will"
            ),
        }

        transport.disconnect().await.map_err(IotError::transport)?;
        info!(device_id = %self.settings.id, "Device agent shutdown complete");
        Ok(())
    }
}

/// Publish a simulated sample every `period`; the first one goes out one
/// period after start. Ticks are skipped while the transport is down.
async fn run_telemetry_loop<T: Transport>(
    transport: Arc<T>,
    device_id: String,
    data_topic: String,
    period: Duration,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        if !transport.is_connected() {
            debug!(device_id = %device_id, "Transport not connected, skipping telemetry tick");
            continue;
        }

        let payload = match TelemetrySample::simulated(device_id.as_str()).to_json() {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "Failed to encode telemetry sample");
                continue;
            }
        };

        match transport
            .publish(&data_topic, payload.into_bytes(), false)
            .await
        {
            Ok(()) => {
                metrics().telemetry_published();
                debug!(topic = %data_topic, "Published telemetry");
            }
            Err(e) => warn!(topic = %data_topic, error = %e, "Failed to publish telemetry"),
        }
    }
}

/// Answer every command request until the inbound channel closes
async fn run_command_loop<T: Transport>(
    transport: Arc<T>,
    sink: Arc<dyn Sink>,
    device_id: String,
    command_topic: String,
    response_topic: String,
    mut message_rx: mpsc::Receiver<IncomingMessage>,
) {
    while let Some(message) = message_rx.recv().await {
        if message.topic != command_topic {
            debug!(topic = %message.topic, "Ignoring message on unexpected topic");
            continue;
        }

        info!(payload = %message.payload_str(), "Received command");
        let response = match build_command_response(&device_id, sink.as_ref(), &message.payload) {
            Ok(response) => response,
            Err(e) => {
                metrics().decode_failure();
                warn!(error = %e, "Dropping undecodable command");
                continue;
            }
        };

        let payload = match response.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "Failed to encode command response");
                continue;
            }
        };

        match transport
            .publish(&response_topic, payload.into_bytes(), false)
            .await
        {
            Ok(()) => {
                metrics().command_handled();
                info!(
                    uuid = %response.command.uuid,
                    result = %response.command_result,
                    "Sent command response"
                );
            }
            Err(e) => warn!(error = %e, "Failed to publish command response"),
        }
    }
    debug!("Inbound message channel closed, command loop exiting");
}

/// Re-announce presence after every reconnection, overwriting a last-will
/// `SIGN_OUT` the broker may have published during the outage
async fn run_reconnect_watcher<T: Transport>(
    transport: Arc<T>,
    register_topic: String,
    mut reconnections: watch::Receiver<u64>,
) {
    while reconnections.changed().await.is_ok() {
        let count = *reconnections.borrow();
        info!(reconnections = count, "Reconnected, re-announcing presence");

        if let Err(e) = transport
            .publish(&register_topic, PresenceSignal::SignIn.to_payload(), true)
            .await
        {
            warn!(error = %e, "Failed to re-announce SIGN_IN after reconnect");
        }
    }
}
