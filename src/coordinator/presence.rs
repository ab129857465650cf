//! Presence table and per-device command dispatch
//!
//! Each online device owns exactly one dispatch task. The table is not
//! shared: the coordinator's router task holds it and every presence change
//! goes through that task.

use crate::observability::metrics;
use crate::protocol::{Command, TopicCategory, TopicLayout};
use crate::transport::Transport;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn, Instrument};

struct PresenceEntry {
    dispatch: JoinHandle<()>,
    last_seen: Instant,
    online_since: DateTime<Utc>,
}

/// Online devices and their dispatch tasks
pub struct PresenceTable<T>
where
    T: Transport + 'static,
{
    transport: Arc<T>,
    topics: TopicLayout,
    dispatch_interval: Duration,
    command: String,
    entries: HashMap<String, PresenceEntry>,
    /// Taken offline by silence rather than by `SIGN_OUT`
    expired: HashSet<String>,
}

impl<T> PresenceTable<T>
where
    T: Transport + 'static,
{
    pub fn new(
        transport: Arc<T>,
        topics: TopicLayout,
        dispatch_interval: Duration,
        command: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            topics,
            dispatch_interval,
            command: command.into(),
            entries: HashMap::new(),
            expired: HashSet::new(),
        }
    }

    /// Begin periodic dispatch to `device_id`.
    /// Returns false if the device already has a dispatch task.
    pub fn start_dispatch(&mut self, device_id: &str) -> bool {
        if self.entries.contains_key(device_id) {
            debug!(device_id = %device_id, "Dispatch already running");
            return false;
        }
        self.expired.remove(device_id);

        let topic = self
            .topics
            .device_topic(TopicCategory::CommandRequest, device_id);
        let dispatch = tokio::spawn(
            run_dispatch(
                self.transport.clone(),
                topic,
                self.command.clone(),
                self.dispatch_interval,
            )
            .instrument(crate::dispatch_span!(device_id = %device_id)),
        );

        self.entries.insert(
            device_id.to_string(),
            PresenceEntry {
                dispatch,
                last_seen: Instant::now(),
                online_since: Utc::now(),
            },
        );
        metrics().dispatch_started();
        info!(
            device_id = %device_id,
            interval_secs = self.dispatch_interval.as_secs_f64(),
            "Device online, dispatch started"
        );
        true
    }

    /// Stop dispatch to `device_id` and forget it.
    /// Returns false if the device was not online.
    pub fn stop_dispatch(&mut self, device_id: &str) -> bool {
        self.expired.remove(device_id);
        match self.entries.remove(device_id) {
            Some(entry) => {
                entry.dispatch.abort();
                metrics().dispatch_stopped();
                info!(device_id = %device_id, "Device offline, dispatch stopped");
                true
            }
            None => {
                debug!(device_id = %device_id, "No dispatch to stop");
                false
            }
        }
    }

    /// Record traffic from an online device; unknown ids are ignored
    pub fn touch(&mut self, device_id: &str) {
        if let Some(entry) = self.entries.get_mut(device_id) {
            entry.last_seen = Instant::now();
        }
    }

    /// Record traffic from a device. A device the silence sweep took offline
    /// comes back online; returns true when that happens. Devices that
    /// signed out, or never signed in, stay offline.
    pub fn record_activity(&mut self, device_id: &str) -> bool {
        if self.entries.contains_key(device_id) {
            self.touch(device_id);
            return false;
        }
        if !self.expired.contains(device_id) {
            return false;
        }

        info!(device_id = %device_id, "Expired device is active again");
        self.start_dispatch(device_id)
    }

    /// True if the silence sweep took the device offline and it has not
    /// been heard from since
    pub fn is_expired(&self, device_id: &str) -> bool {
        self.expired.contains(device_id)
    }

    /// Stop dispatch for every device silent for longer than `timeout`
    pub fn expire_silent(&mut self, timeout: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_seen) > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        expired.sort();

        for device_id in &expired {
            warn!(
                device_id = %device_id,
                timeout_secs = timeout.as_secs_f64(),
                "Device silent past timeout, treating as offline"
            );
            self.stop_dispatch(device_id);
            self.expired.insert(device_id.clone());
        }
        expired
    }

    pub fn is_online(&self, device_id: &str) -> bool {
        self.entries.contains_key(device_id)
    }

    /// When the device's current online period began
    pub fn online_since(&self, device_id: &str) -> Option<DateTime<Utc>> {
        self.entries.get(device_id).map(|entry| entry.online_since)
    }

    /// Online device ids, sorted
    pub fn online_devices(&self) -> Vec<String> {
        let mut devices: Vec<String> = self.entries.keys().cloned().collect();
        devices.sort();
        devices
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stop every dispatch task
    pub fn stop_all(&mut self) {
        for device_id in self.online_devices() {
            self.stop_dispatch(&device_id);
        }
    }
}

impl<T> Drop for PresenceTable<T>
where
    T: Transport + 'static,
{
    fn drop(&mut self) {
        for entry in self.entries.values() {
            entry.dispatch.abort();
        }
    }
}

async fn run_dispatch<T: Transport>(
    transport: Arc<T>,
    topic: String,
    command: String,
    period: Duration,
) {
    // First command one full period after the device came online
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let request = Command::new(command.as_str());
        let payload = match request.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to encode command");
                continue;
            }
        };

        match transport.publish(&topic, payload.into_bytes(), false).await {
            Ok(()) => {
                metrics().command_dispatched();
                info!(topic = %topic, uuid = %request.uuid, command = %request.command, "Dispatched command");
            }
            Err(e) => warn!(topic = %topic, error = %e, "Failed to dispatch command"),
        }
    }
}
