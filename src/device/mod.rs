//! Device role: presence announcement, periodic telemetry and command handling

pub mod agent;

pub use agent::{build_command_response, device_session, DeviceAgent};
