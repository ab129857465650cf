//! Topic naming and device identity validation
//!
//! Every message kind has exactly one category root. Device-scoped topics are
//! built by appending the device identity as the final path segment, and the
//! coordinator recovers `(category, device_id)` by splitting on the last `/`.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Message category, one per configured topic root
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicCategory {
    /// Telemetry samples published by devices
    Data,
    /// Commands sent by the coordinator to one device
    CommandRequest,
    /// Command results published by devices
    CommandResponse,
    /// Presence announcements (`SIGN_IN` / `SIGN_OUT`)
    Register,
}

impl TopicCategory {
    pub const ALL: [TopicCategory; 4] = [
        TopicCategory::Data,
        TopicCategory::CommandRequest,
        TopicCategory::CommandResponse,
        TopicCategory::Register,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TopicCategory::Data => "data",
            TopicCategory::CommandRequest => "command-request",
            TopicCategory::CommandResponse => "command-response",
            TopicCategory::Register => "register",
        }
    }
}

impl fmt::Display for TopicCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The four configured category roots
///
/// # Examples
/// ```
/// use iotlink::protocol::{TopicCategory, TopicLayout};
///
/// let layout = TopicLayout::new("iot/data", "iot/cmd/req", "iot/cmd/resp", "iot/register");
/// let topic = layout.device_topic(TopicCategory::Register, "dev-1");
/// assert_eq!(topic, "iot/register/dev-1");
/// assert_eq!(
///     layout.parse(&topic).unwrap(),
///     (TopicCategory::Register, "dev-1".to_string())
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicLayout {
    pub data: String,
    pub command_request: String,
    pub command_response: String,
    pub register: String,
}

impl TopicLayout {
    pub fn new(
        data: impl Into<String>,
        command_request: impl Into<String>,
        command_response: impl Into<String>,
        register: impl Into<String>,
    ) -> Self {
        Self {
            data: data.into(),
            command_request: command_request.into(),
            command_response: command_response.into(),
            register: register.into(),
        }
    }

    /// Category root as configured
    pub fn root(&self, category: TopicCategory) -> &str {
        match category {
            TopicCategory::Data => &self.data,
            TopicCategory::CommandRequest => &self.command_request,
            TopicCategory::CommandResponse => &self.command_response,
            TopicCategory::Register => &self.register,
        }
    }

    /// Build `{root}/{device_id}`
    pub fn device_topic(&self, category: TopicCategory, device_id: &str) -> String {
        format!("{}/{}", self.root(category), device_id)
    }

    /// Build the single-level wildcard filter `{root}/+`
    pub fn subscription_filter(&self, category: TopicCategory) -> String {
        format!("{}/+", self.root(category))
    }

    /// Split a concrete topic into its category and device identity.
    ///
    /// The prefix must equal one configured root exactly; the device id is
    /// the final path segment and must not be empty.
    pub fn parse(&self, topic: &str) -> Result<(TopicCategory, String), TopicError> {
        let (prefix, device_id) = topic
            .rsplit_once('/')
            .ok_or_else(|| TopicError::Malformed(topic.to_string()))?;

        if prefix.is_empty() || device_id.is_empty() {
            return Err(TopicError::Malformed(topic.to_string()));
        }

        TopicCategory::ALL
            .iter()
            .find(|category| self.root(**category) == prefix)
            .map(|category| (*category, device_id.to_string()))
            .ok_or_else(|| TopicError::UnknownCategory(prefix.to_string()))
    }

    /// Check every root is usable as a publish prefix
    pub fn validate(&self) -> Result<(), TopicError> {
        for category in TopicCategory::ALL {
            validate_topic_root(self.root(category))?;
        }

        for (i, a) in TopicCategory::ALL.iter().enumerate() {
            for b in TopicCategory::ALL.iter().skip(i + 1) {
                if self.root(*a) == self.root(*b) {
                    return Err(TopicError::DuplicateRoot(self.root(*a).to_string()));
                }
            }
        }

        Ok(())
    }
}

fn validate_topic_root(root: &str) -> Result<(), TopicError> {
    if root.is_empty() {
        return Err(TopicError::InvalidRoot {
            root: root.to_string(),
            reason: "root cannot be empty",
        });
    }
    if root.contains('+') || root.contains('#') {
        return Err(TopicError::InvalidRoot {
            root: root.to_string(),
            reason: "root cannot contain wildcards",
        });
    }
    if root.ends_with('/') {
        return Err(TopicError::InvalidRoot {
            root: root.to_string(),
            reason: "root cannot end with '/'",
        });
    }
    Ok(())
}

/// Validate a device or coordinator identity: `[a-zA-Z0-9._-]+`
pub fn validate_device_id(device_id: &str) -> Result<(), ValidationError> {
    if device_id.is_empty() {
        return Err(ValidationError::EmptyDeviceId);
    }

    for ch in device_id.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '.' && ch != '_' && ch != '-' {
            return Err(ValidationError::InvalidDeviceIdChar(ch));
        }
    }

    Ok(())
}

/// Topic parsing and layout errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TopicError {
    #[error("Malformed topic: '{0}'")]
    Malformed(String),
    #[error("Unknown topic category: '{0}'")]
    UnknownCategory(String),
    #[error("Invalid topic root '{root}': {reason}")]
    InvalidRoot { root: String, reason: &'static str },
    #[error("Topic root '{0}' is used by more than one category")]
    DuplicateRoot(String),
}

/// Identity validation errors
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Device ID cannot be empty")]
    EmptyDeviceId,
    #[error("Device ID contains invalid character: '{0}'")]
    InvalidDeviceIdChar(char),
}
