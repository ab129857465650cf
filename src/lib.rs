//! iotlink - MQTT presence tracking and command dispatch for IoT devices
//!
//! Two roles share one broker:
//! - a **device agent** announces itself with a retained `SIGN_IN`, publishes
//!   telemetry periodically and answers command requests;
//! - a **coordinator** tracks which devices are online from their register
//!   announcements (including broker-published last-will `SIGN_OUT`s) and
//!   sends each online device a command on a fixed period.
//!
//! # Quick Start
//!
//! ```rust
//! use iotlink::protocol::{TopicCategory, TopicLayout};
//!
//! let topics = TopicLayout::new("iot/data", "iot/cmd/req", "iot/cmd/resp", "iot/register");
//!
//! let topic = topics.device_topic(TopicCategory::Register, "sensor-7");
//! assert_eq!(topic, "iot/register/sensor-7");
//!
//! let (category, device_id) = topics.parse(&topic).unwrap();
//! assert_eq!(category, TopicCategory::Register);
//! assert_eq!(device_id, "sensor-7");
//! ```

pub mod config;
pub mod coordinator;
pub mod device;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod sink;
pub mod testing;
pub mod transport;

pub use config::{AppConfig, ConfigError};
pub use coordinator::{Coordinator, PresenceTable, RouteOutcome};
pub use device::DeviceAgent;
pub use error::{IotError, IotResult};
pub use protocol::*;
pub use sink::{LoggingSink, Sink};
pub use transport::mqtt::MqttClient;
pub use transport::{IncomingMessage, Transport};
