//! Topic naming and message payloads shared by devices and the coordinator
//!
//! This module defines how device-scoped topics are derived from the
//! configured category roots and the JSON/plain-text payloads carried on them.

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;
