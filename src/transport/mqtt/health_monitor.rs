//! Pure health monitoring and reconnection logic for MQTT client
//!
//! This module contains pure functions for reconnection decision making
//! and connection state transitions.

use super::connection::{ConnectionState, ReconnectConfig};
use std::time::Duration;
use tracing::{error, info, warn};

/// Pure health monitoring and reconnection decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Determine if reconnection should be attempted (pure function)
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        config: &ReconnectConfig,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if let Some(max_attempts) = config.max_attempts {
            if current_attempts >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded;
            }
        }

        ReconnectionDecision::Proceed {
            attempt: current_attempts + 1,
            delay_ms: config.calculate_backoff_delay(current_attempts + 1),
        }
    }

    /// How long `connect()` waits for the first ConnAck (pure function)
    pub fn calculate_connection_timeout(config: &ReconnectConfig) -> Duration {
        match config.calculate_max_total_time() {
            Some(max_total_time) => Duration::from_millis(max_total_time + 30000),
            None => Duration::from_secs(60),
        }
    }

    /// Determine next state after connection event (pure function)
    pub fn determine_next_state(
        current_state: &ConnectionState,
        event: ConnectionEvent,
    ) -> ConnectionState {
        let next = match event {
            ConnectionEvent::ConnAckReceived => ConnectionState::Connected,
            ConnectionEvent::DisconnectedByBroker => {
                ConnectionState::Disconnected("Broker disconnected".to_string())
            }
            ConnectionEvent::NetworkError(error) => ConnectionState::Disconnected(error),
            ConnectionEvent::ReconnectionStarted(attempt) => ConnectionState::Reconnecting(attempt),
            ConnectionEvent::PermanentFailure(reason) => {
                ConnectionState::PermanentlyDisconnected(reason)
            }
        };
        Self::log_state_transition(current_state, &next);
        next
    }

    /// Check if connection state allows publishing (pure function)
    pub fn can_publish(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    /// Check if connection state allows subscribing (pure function)
    pub fn can_subscribe(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    /// True when a transition restores a previously lost connection
    pub fn is_reconnection(from: &ConnectionState, to: &ConnectionState) -> bool {
        matches!(
            (from, to),
            (
                ConnectionState::Disconnected(_) | ConnectionState::Reconnecting(_),
                ConnectionState::Connected
            )
        )
    }

    fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!("MQTT connection established");
            }
            (_, ConnectionState::Connected) if Self::is_reconnection(from, to) => {
                info!("MQTT reconnection successful");
            }
            (_, ConnectionState::Disconnected(reason)) => {
                warn!(reason = %reason, "MQTT connection lost");
            }
            (_, ConnectionState::Reconnecting(attempt)) => {
                info!(attempt = attempt, "Starting MQTT reconnection attempt");
            }
            (_, ConnectionState::PermanentlyDisconnected(reason)) => {
                error!(reason = %reason, "MQTT connection permanently failed");
            }
            _ => {
                info!("MQTT connection state: {:?} -> {:?}", from, to);
            }
        }
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    /// Proceed with reconnection attempt
    Proceed { attempt: u32, delay_ms: u64 },
    /// Abort reconnection - shutdown requested
    AbortShutdownRequested,
    /// Abort reconnection - max attempts exceeded
    AbortMaxAttemptsExceeded,
}

/// Connection events that trigger state transitions
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// ConnAck received from broker
    ConnAckReceived,
    /// Broker initiated disconnect
    DisconnectedByBroker,
    /// Network or protocol error
    NetworkError(String),
    /// Reconnection attempt started
    ReconnectionStarted(u32),
    /// Permanent failure - no more retries
    PermanentFailure(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_attempt_reconnection() {
        let config = ReconnectConfig::default();

        let decision = HealthMonitor::should_attempt_reconnection(0, &config, false);
        assert_eq!(
            decision,
            ReconnectionDecision::Proceed {
                attempt: 1,
                delay_ms: 250
            }
        );

        let decision = HealthMonitor::should_attempt_reconnection(0, &config, true);
        assert_eq!(decision, ReconnectionDecision::AbortShutdownRequested);

        // Sustained delay once the pattern is exhausted
        let decision = HealthMonitor::should_attempt_reconnection(7, &config, false);
        assert_eq!(
            decision,
            ReconnectionDecision::Proceed {
                attempt: 8,
                delay_ms: 5000
            }
        );

        let limited_config = ReconnectConfig {
            max_attempts: Some(3),
            ..Default::default()
        };
        assert!(matches!(
            HealthMonitor::should_attempt_reconnection(2, &limited_config, false),
            ReconnectionDecision::Proceed { attempt: 3, .. }
        ));
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(3, &limited_config, false),
            ReconnectionDecision::AbortMaxAttemptsExceeded
        );
    }

    #[test]
    fn test_calculate_connection_timeout() {
        let unlimited_config = ReconnectConfig::default();
        assert_eq!(
            HealthMonitor::calculate_connection_timeout(&unlimited_config),
            Duration::from_secs(60)
        );

        let limited_config = ReconnectConfig {
            max_attempts: Some(4),
            backoff_pattern: vec![25, 50, 100, 250],
            sustained_delay: 250,
        };
        assert_eq!(
            HealthMonitor::calculate_connection_timeout(&limited_config),
            Duration::from_millis(425 + 30000)
        );
    }

    #[test]
    fn test_determine_next_state() {
        let connecting = ConnectionState::Connecting;
        let connected = ConnectionState::Connected;
        let disconnected = ConnectionState::Disconnected("test".to_string());

        assert_eq!(
            HealthMonitor::determine_next_state(&connecting, ConnectionEvent::ConnAckReceived),
            ConnectionState::Connected
        );
        assert_eq!(
            HealthMonitor::determine_next_state(&connected, ConnectionEvent::DisconnectedByBroker),
            ConnectionState::Disconnected("Broker disconnected".to_string())
        );
        assert_eq!(
            HealthMonitor::determine_next_state(
                &connected,
                ConnectionEvent::NetworkError("timeout".to_string())
            ),
            ConnectionState::Disconnected("timeout".to_string())
        );
        assert_eq!(
            HealthMonitor::determine_next_state(
                &disconnected,
                ConnectionEvent::ReconnectionStarted(1)
            ),
            ConnectionState::Reconnecting(1)
        );
        assert_eq!(
            HealthMonitor::determine_next_state(
                &disconnected,
                ConnectionEvent::PermanentFailure("max attempts".to_string())
            ),
            ConnectionState::PermanentlyDisconnected("max attempts".to_string())
        );
    }

    #[test]
    fn test_can_publish_and_subscribe() {
        let states = [
            (ConnectionState::Connected, true),
            (ConnectionState::Connecting, false),
            (ConnectionState::Disconnected("x".to_string()), false),
            (ConnectionState::Reconnecting(1), false),
            (ConnectionState::PermanentlyDisconnected("x".to_string()), false),
        ];

        for (state, expected) in states {
            assert_eq!(HealthMonitor::can_publish(&state), expected, "{state:?}");
            assert_eq!(HealthMonitor::can_subscribe(&state), expected, "{state:?}");
        }
    }

    #[test]
    fn test_is_reconnection() {
        assert!(HealthMonitor::is_reconnection(
            &ConnectionState::Reconnecting(2),
            &ConnectionState::Connected
        ));
        assert!(HealthMonitor::is_reconnection(
            &ConnectionState::Disconnected("lost".to_string()),
            &ConnectionState::Connected
        ));
        assert!(!HealthMonitor::is_reconnection(
            &ConnectionState::Connecting,
            &ConnectionState::Connected
        ));
        assert!(!HealthMonitor::is_reconnection(
            &ConnectionState::Connected,
            &ConnectionState::Reconnecting(1)
        ));
    }
}
