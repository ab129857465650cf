//! Telemetry and command sink
//!
//! The sink is where real persistence and command execution would plug in.
//! [`LoggingSink`] only logs stored payloads and answers `PING`.

use crate::protocol::UNKNOWN_COMMAND_RESULT;
use tracing::{debug, info};

/// Persistence and execution capabilities consumed by both roles
pub trait Sink: Send + Sync {
    /// Hand over a raw payload for storage. Never fails to the caller.
    fn store_data(&self, payload: &str);

    /// Execute a command by name. Unknown commands yield
    /// [`UNKNOWN_COMMAND_RESULT`] instead of an error.
    fn execute(&self, command: &str) -> String;
}

/// Stub sink that logs instead of persisting
#[derive(Debug, Default, Clone)]
pub struct LoggingSink;

impl LoggingSink {
    pub fn new() -> Self {
        Self
    }
}

impl Sink for LoggingSink {
    fn store_data(&self, payload: &str) {
        info!(bytes = payload.len(), "Storing data");
        debug!(payload = %payload, "Stored payload");
    }

    fn execute(&self, command: &str) -> String {
        execute_builtin(command).to_string()
    }
}

/// Built-in command table
pub fn execute_builtin(command: &str) -> &'static str {
    match command {
        "PING" => "PONG",
        _ => UNKNOWN_COMMAND_RESULT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_returns_pong() {
        assert_eq!(LoggingSink::new().execute("PING"), "PONG");
    }

    #[test]
    fn test_unknown_command_returns_sentinel() {
        let sink = LoggingSink::new();
        assert_eq!(sink.execute("FOO"), UNKNOWN_COMMAND_RESULT);
        assert_eq!(sink.execute(""), UNKNOWN_COMMAND_RESULT);
        assert_eq!(sink.execute("ping"), UNKNOWN_COMMAND_RESULT);
    }

    #[test]
    fn test_store_data_accepts_any_payload() {
        let sink = LoggingSink::new();
        sink.store_data("");
        sink.store_data("{\"deviceId\":\"dev-1\"}");
        sink.store_data("not json at all");
    }
}
