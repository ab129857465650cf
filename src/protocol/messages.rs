//! Wire payloads exchanged between devices and the coordinator
//!
//! Register payloads are bare strings; everything else is UTF-8 JSON.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Result returned by the stock executor for commands it does not know
pub const UNKNOWN_COMMAND_RESULT: &str = "ERROR_UNKNOWN_COMMAND";

/// Command name the coordinator dispatches by default
pub const DEFAULT_COMMAND: &str = "PING";

/// Presence announcement published on the register topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceSignal {
    SignIn,
    SignOut,
}

impl PresenceSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceSignal::SignIn => "SIGN_IN",
            PresenceSignal::SignOut => "SIGN_OUT",
        }
    }

    /// Decode a raw register payload; the match is exact
    pub fn from_payload(payload: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(payload)
            .map_err(|_| ProtocolError::InvalidPresence(String::from_utf8_lossy(payload).into()))?;
        text.parse()
    }

    pub fn to_payload(&self) -> Vec<u8> {
        self.as_str().as_bytes().to_vec()
    }
}

impl FromStr for PresenceSignal {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SIGN_IN" => Ok(PresenceSignal::SignIn),
            "SIGN_OUT" => Ok(PresenceSignal::SignOut),
            other => Err(ProtocolError::InvalidPresence(other.to_string())),
        }
    }
}

impl fmt::Display for PresenceSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value of the `messageType` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "DATA")]
    Data,
    #[serde(rename = "commandResp")]
    CommandResp,
}

/// Command request sent to a single device
///
/// Fields beyond `uuid` and `command` are kept in `extra` so that the
/// response can echo the request verbatim.
///
/// # Examples
/// ```
/// use iotlink::protocol::Command;
///
/// let command = Command::from_json(br#"{"uuid":"abc","command":"PING"}"#).unwrap();
/// assert_eq!(command.uuid, "abc");
/// assert_eq!(command.command, "PING");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Correlation id, unique per command instance
    pub uuid: String,
    /// Command name handed to the executor
    pub command: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Command {
    /// Build a command with a fresh v4 correlation id
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            command: command.into(),
            extra: Map::new(),
        }
    }

    pub fn from_json(payload: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(payload).map_err(ProtocolError::InvalidJson)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Serialization)
    }
}

/// Device reply to a [`Command`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    #[serde(rename = "messageType")]
    pub message_type: MessageType,
    #[serde(rename = "commandResult")]
    pub command_result: String,
    #[serde(flatten)]
    pub command: Command,
}

impl CommandResponse {
    const RESERVED_KEYS: [&'static str; 3] = ["deviceId", "messageType", "commandResult"];

    /// Echo `command` back with the execution result attached
    pub fn new(device_id: impl Into<String>, command: Command, result: impl Into<String>) -> Self {
        let mut command = command;
        for key in Self::RESERVED_KEYS {
            command.extra.remove(key);
        }

        Self {
            device_id: device_id.into(),
            message_type: MessageType::CommandResp,
            command_result: result.into(),
            command,
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Serialization)
    }
}

/// Periodic sensor reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    #[serde(rename = "messageType")]
    pub message_type: MessageType,
    #[serde(rename = "temp")]
    pub temperature: f64,
    #[serde(rename = "lat")]
    pub latitude: f64,
    #[serde(rename = "lng")]
    pub longitude: f64,
}

impl TelemetrySample {
    /// Fixed reading standing in for real sensor acquisition
    pub fn simulated(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            message_type: MessageType::Data,
            temperature: 23.6,
            latitude: 48.015722,
            longitude: -88.625528,
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Serialization)
    }
}

/// Payload decoding and encoding errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid JSON payload: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("Invalid presence payload: '{0}'")]
    InvalidPresence(String),
    #[error("Topic error: {0}")]
    Topic(#[from] super::topics::TopicError),
    #[error("Serialization error: {0}")]
    Serialization(#[source] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_presence_signal_parsing() {
        assert_eq!(
            PresenceSignal::from_payload(b"SIGN_IN").unwrap(),
            PresenceSignal::SignIn
        );
        assert_eq!(
            PresenceSignal::from_payload(b"SIGN_OUT").unwrap(),
            PresenceSignal::SignOut
        );
        assert!(PresenceSignal::from_payload(b"sign_in").is_err());
        assert!(PresenceSignal::from_payload(b"\"SIGN_IN\"").is_err());
        assert!(PresenceSignal::from_payload(&[0xff, 0xfe]).is_err());
        assert_eq!(PresenceSignal::SignOut.to_payload(), b"SIGN_OUT".to_vec());
    }

    #[test]
    fn test_command_round_trip() {
        let command = Command::new("PING");
        let json = command.to_json().unwrap();
        let decoded = Command::from_json(json.as_bytes()).unwrap();

        assert_eq!(decoded.uuid, command.uuid);
        assert_eq!(decoded.command, command.command);
        assert!(Uuid::parse_str(&decoded.uuid).is_ok());
    }

    #[test]
    fn test_command_uuids_are_unique() {
        assert_ne!(Command::new("PING").uuid, Command::new("PING").uuid);
    }

    #[test]
    fn test_command_rejects_malformed_payloads() {
        assert!(Command::from_json(b"not json").is_err());
        assert!(Command::from_json(br#"{"uuid":"abc"}"#).is_err());
        assert!(Command::from_json(br#"{"uuid":1,"command":"PING"}"#).is_err());
    }

    #[test]
    fn test_command_response_wire_format() {
        let command = Command::from_json(br#"{"uuid":"abc","command":"PING"}"#).unwrap();
        let response = CommandResponse::new("dev-1", command, "PONG");

        let json = response.to_json().unwrap();
        assert_eq!(
            json,
            r#"{"deviceId":"dev-1","messageType":"commandResp","commandResult":"PONG","uuid":"abc","command":"PING"}"#
        );
    }

    #[test]
    fn test_command_response_echoes_extra_fields() {
        let command =
            Command::from_json(br#"{"uuid":"abc","command":"PING","priority":3}"#).unwrap();
        let response = CommandResponse::new("dev-1", command, "PONG");

        let value: Value = serde_json::from_str(&response.to_json().unwrap()).unwrap();
        assert_eq!(value["priority"], json!(3));
    }

    #[test]
    fn test_command_response_drops_reserved_echo_keys() {
        let command = Command::from_json(
            br#"{"uuid":"abc","command":"PING","deviceId":"spoofed","commandResult":"X"}"#,
        )
        .unwrap();
        let response = CommandResponse::new("dev-1", command, "PONG");

        let value: Value = serde_json::from_str(&response.to_json().unwrap()).unwrap();
        assert_eq!(value["deviceId"], json!("dev-1"));
        assert_eq!(value["commandResult"], json!("PONG"));
    }

    #[test]
    fn test_telemetry_wire_format() {
        let sample = TelemetrySample::simulated("dev-1");
        let value: Value = serde_json::from_str(&sample.to_json().unwrap()).unwrap();

        assert_eq!(
            value,
            json!({
                "deviceId": "dev-1",
                "messageType": "DATA",
                "temp": 23.6,
                "lat": 48.015722,
                "lng": -88.625528
            })
        );
    }
}
