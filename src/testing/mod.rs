//! Testing utilities and mock implementations
//!
//! Lets the device agent and the coordinator run without an MQTT broker.

pub mod mocks;

pub use mocks::*;
