//! Thread-safe metrics collection system
//!
//! Provides atomic counters for tracking operational statistics across the
//! MQTT transport, the presence table and both roles.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Thread-safe metrics collector using atomics
pub struct MetricsCollector {
    // MQTT metrics
    mqtt_connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connections_lost: AtomicU64,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    messages_received: AtomicU64,
    connection_start_time: AtomicU64,

    // Presence metrics
    devices_online: AtomicU64,
    dispatch_started: AtomicU64,
    dispatch_stopped: AtomicU64,
    commands_dispatched: AtomicU64,

    // Device metrics
    telemetry_published: AtomicU64,
    commands_handled: AtomicU64,
    decode_failures: AtomicU64,

    // Coordinator metrics
    messages_stored: AtomicU64,
    messages_dropped: AtomicU64,

    uptime_start: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            mqtt_connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connections_lost: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            connection_start_time: AtomicU64::new(0),
            devices_online: AtomicU64::new(0),
            dispatch_started: AtomicU64::new(0),
            dispatch_stopped: AtomicU64::new(0),
            commands_dispatched: AtomicU64::new(0),
            telemetry_published: AtomicU64::new(0),
            commands_handled: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            messages_stored: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            uptime_start: AtomicU64::new(current_timestamp()),
        }
    }

    // MQTT metrics
    pub fn mqtt_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(true, Ordering::Relaxed);
        self.connection_start_time
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn mqtt_connection_lost(&self) {
        if self.mqtt_connected.swap(false, Ordering::Relaxed) {
            self.connections_lost.fetch_add(1, Ordering::Relaxed);
        }
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn mqtt_message_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    // Presence metrics
    pub fn dispatch_started(&self) {
        self.dispatch_started.fetch_add(1, Ordering::Relaxed);
        self.devices_online.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dispatch_stopped(&self) {
        self.dispatch_stopped.fetch_add(1, Ordering::Relaxed);
        // Saturate at zero; collectors may be reset while tasks are running
        let _ = self
            .devices_online
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn command_dispatched(&self) {
        self.commands_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    // Device metrics
    pub fn telemetry_published(&self) {
        self.telemetry_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_handled(&self) {
        self.commands_handled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    // Coordinator metrics
    pub fn message_stored(&self) {
        self.messages_stored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    // Reset all metrics (useful for testing)
    pub fn reset(&self) {
        let counters = [
            &self.connection_attempts,
            &self.connections_established,
            &self.connections_lost,
            &self.messages_published,
            &self.publish_failures,
            &self.messages_received,
            &self.connection_start_time,
            &self.devices_online,
            &self.dispatch_started,
            &self.dispatch_stopped,
            &self.commands_dispatched,
            &self.telemetry_published,
            &self.commands_handled,
            &self.decode_failures,
            &self.messages_stored,
            &self.messages_dropped,
        ];
        for counter in counters {
            counter.store(0, Ordering::Relaxed);
        }
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.uptime_start
            .store(current_timestamp(), Ordering::Relaxed);
    }

    /// Calculate connection duration (pure function)
    fn calculate_connection_duration(&self, now: u64) -> u64 {
        if !self.mqtt_connected.load(Ordering::Relaxed) {
            return 0;
        }
        match self.connection_start_time.load(Ordering::Relaxed) {
            0 => 0,
            start_time => now.saturating_sub(start_time),
        }
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();

        MetricsSnapshot {
            mqtt: MqttMetrics {
                connected: self.mqtt_connected.load(Ordering::Relaxed),
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connections_lost: self.connections_lost.load(Ordering::Relaxed),
                messages_published: self.messages_published.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                messages_received: self.messages_received.load(Ordering::Relaxed),
                connection_duration_seconds: self.calculate_connection_duration(now),
            },
            presence: PresenceMetrics {
                devices_online: self.devices_online.load(Ordering::Relaxed),
                dispatch_started: self.dispatch_started.load(Ordering::Relaxed),
                dispatch_stopped: self.dispatch_stopped.load(Ordering::Relaxed),
                commands_dispatched: self.commands_dispatched.load(Ordering::Relaxed),
            },
            device: DeviceMetrics {
                telemetry_published: self.telemetry_published.load(Ordering::Relaxed),
                commands_handled: self.commands_handled.load(Ordering::Relaxed),
                decode_failures: self.decode_failures.load(Ordering::Relaxed),
            },
            coordinator: CoordinatorMetrics {
                messages_stored: self.messages_stored.load(Ordering::Relaxed),
                messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            },
            uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

// Public metrics structures
#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub mqtt: MqttMetrics,
    pub presence: PresenceMetrics,
    pub device: DeviceMetrics,
    pub coordinator: CoordinatorMetrics,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct MqttMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connections_lost: u64,
    pub messages_published: u64,
    pub publish_failures: u64,
    pub messages_received: u64,
    pub connection_duration_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct PresenceMetrics {
    pub devices_online: u64,
    pub dispatch_started: u64,
    pub dispatch_stopped: u64,
    pub commands_dispatched: u64,
}

#[derive(Debug, Serialize)]
pub struct DeviceMetrics {
    pub telemetry_published: u64,
    pub commands_handled: u64,
    pub decode_failures: u64,
}

#[derive(Debug, Serialize)]
pub struct CoordinatorMetrics {
    pub messages_stored: u64,
    pub messages_dropped: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
