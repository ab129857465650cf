//! Pure message routing logic for MQTT events
//!
//! Events coming off the rumqttc event loop are classified here; the
//! supervisor in `client.rs` acts on the classification.

use crate::transport::IncomingMessage;
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::Event;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to appropriate handler (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(connack) => EventRoute::ConnectionAcknowledged {
                    session_present: connack.session_present,
                },
                Packet::Publish(publish) => EventRoute::MessageReceived(IncomingMessage {
                    topic: String::from_utf8_lossy(&publish.topic).to_string(),
                    payload: publish.payload.to_vec(),
                    retain: publish.retain,
                }),
                Packet::Disconnect(_) => EventRoute::Disconnected,
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                },
                Packet::PubComp(pubcomp) => EventRoute::DeliveryCompleted {
                    packet_id: pubcomp.pkid,
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Connection acknowledged - ready to publish/subscribe
    ConnectionAcknowledged { session_present: bool },
    /// Message received on subscribed topic
    MessageReceived(IncomingMessage),
    /// MQTT broker disconnected
    Disconnected,
    /// Subscription confirmed
    SubscriptionConfirmed { packet_id: u16 },
    /// Exactly-once handshake finished for one of our publishes
    DeliveryCompleted { packet_id: u16 },
    /// Infrastructure event (PingResp, PubRec, etc.)
    InfrastructureEvent(String),
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}

/// Hands inbound publishes to whoever registered a sender
pub struct MessageForwarder {
    sender: Option<mpsc::Sender<IncomingMessage>>,
}

impl MessageForwarder {
    pub fn new() -> Self {
        Self { sender: None }
    }

    pub fn set_sender(&mut self, sender: mpsc::Sender<IncomingMessage>) {
        self.sender = Some(sender);
    }

    pub fn has_sender(&self) -> bool {
        self.sender.is_some()
    }

    /// Forward an inbound message (impure I/O)
    pub async fn forward(&self, message: IncomingMessage) -> Result<(), String> {
        match &self.sender {
            Some(sender) => {
                debug!(topic = %message.topic, bytes = message.payload.len(), "Forwarding inbound message");
                sender
                    .send(message)
                    .await
                    .map_err(|e| format!("Failed to forward inbound message: {e}"))
            }
            None => {
                warn!(topic = %message.topic, "Received MQTT message but no sender configured - message dropped");
                Err("No message sender configured".to_string())
            }
        }
    }
}

impl Default for MessageForwarder {
    fn default() -> Self {
        Self::new()
    }
}
