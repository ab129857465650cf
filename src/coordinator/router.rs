//! Coordinator: routes inbound traffic and drives the presence table
//!
//! A single router task owns the [`PresenceTable`]. Inbound messages, online
//! queries, the silence sweep and shutdown all arrive at that task, so
//! presence changes are applied strictly in arrival order.

use super::presence::PresenceTable;
use crate::config::CoordinatorSection;
use crate::error::{IotError, IotResult};
use crate::observability::metrics;
use crate::protocol::{PresenceSignal, TopicCategory, TopicError, TopicLayout};
use crate::sink::Sink;
use crate::transport::mqtt::SessionOptions;
use crate::transport::{IncomingMessage, Transport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn, Instrument};

const INBOUND_CHANNEL_CAPACITY: usize = 256;
const QUERY_CHANNEL_CAPACITY: usize = 8;

/// What the router did with one inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Data or command response handed to the sink
    Stored,
    /// Stored, and dispatch resumed for a device the silence sweep had expired
    Revived,
    DispatchStarted,
    /// `SIGN_IN` for a device that already had a dispatch task
    AlreadyOnline,
    DispatchStopped,
    /// `SIGN_OUT` for a device that was not online
    AlreadyOffline,
    /// Malformed topic, unknown category or bad register payload
    Dropped,
}

/// Session the coordinator's transport must be built with (no last-will)
pub fn coordinator_session(coordinator_id: &str) -> SessionOptions {
    SessionOptions::persistent(coordinator_id)
}

/// Apply one inbound message to the table
pub fn route_message<T>(
    table: &mut PresenceTable<T>,
    sink: &dyn Sink,
    topics: &TopicLayout,
    message: &IncomingMessage,
) -> RouteOutcome
where
    T: Transport + 'static,
{
    let (category, device_id) = match topics.parse(&message.topic) {
        Ok(parsed) => parsed,
        Err(e) => {
            match &e {
                TopicError::UnknownCategory(_) => {
                    error!(topic = %message.topic, error = %e, "Message on unknown topic")
                }
                _ => warn!(topic = %message.topic, error = %e, "Dropping message on malformed topic"),
            }
            metrics().message_dropped();
            return RouteOutcome::Dropped;
        }
    };

    match category {
        TopicCategory::Data | TopicCategory::CommandResponse => {
            debug!(device_id = %device_id, category = %category.as_str(), "Storing payload");
            sink.store_data(&message.payload_str());
            metrics().message_stored();
            if table.record_activity(&device_id) {
                RouteOutcome::Revived
            } else {
                RouteOutcome::Stored
            }
        }
        TopicCategory::Register => match PresenceSignal::from_payload(&message.payload) {
            Ok(PresenceSignal::SignIn) => {
                if table.start_dispatch(&device_id) {
                    RouteOutcome::DispatchStarted
                } else {
                    table.touch(&device_id);
                    info!(device_id = %device_id, "Device already online");
                    RouteOutcome::AlreadyOnline
                }
            }
            Ok(PresenceSignal::SignOut) => {
                if table.stop_dispatch(&device_id) {
                    RouteOutcome::DispatchStopped
                } else {
                    info!(device_id = %device_id, "Device already offline");
                    RouteOutcome::AlreadyOffline
                }
            }
            Err(e) => {
                error!(device_id = %device_id, error = %e, "Invalid register payload");
                metrics().message_dropped();
                RouteOutcome::Dropped
            }
        },
        TopicCategory::CommandRequest => {
            // Never subscribed by the coordinator; a broker misroute
            debug!(topic = %message.topic, "Ignoring command request echo");
            metrics().message_dropped();
            RouteOutcome::Dropped
        }
    }
}

enum RouterQuery {
    OnlineDevices(oneshot::Sender<Vec<String>>),
}

/// Presence tracking and command dispatch for every device
pub struct Coordinator<T>
where
    T: Transport + 'static,
{
    settings: CoordinatorSection,
    topics: TopicLayout,
    sink: Arc<dyn Sink>,
    transport: Option<T>,
    shared_transport: Option<Arc<T>>,
    router: Option<JoinHandle<()>>,
    query_tx: Option<mpsc::Sender<RouterQuery>>,
    shutdown_tx: watch::Sender<bool>,
    stopped: bool,
}

impl<T> Coordinator<T>
where
    T: Transport + 'static,
{
    pub fn new(
        settings: CoordinatorSection,
        topics: TopicLayout,
        transport: T,
        sink: Arc<dyn Sink>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            settings,
            topics,
            sink,
            transport: Some(transport),
            shared_transport: None,
            router: None,
            query_tx: None,
            shutdown_tx,
            stopped: false,
        }
    }

    pub fn coordinator_id(&self) -> &str {
        &self.settings.id
    }

    pub fn transport(&self) -> Option<&T> {
        self.transport
            .as_ref()
            .or(self.shared_transport.as_deref())
    }

    pub fn is_running(&self) -> bool {
        self.router.is_some() && !self.stopped
    }

    pub fn is_permanently_disconnected(&self) -> bool {
        self.transport()
            .is_some_and(|transport| transport.is_permanently_disconnected())
    }

    /// Connect, subscribe to every device topic and start the router
    pub async fn start(&mut self) -> IotResult<()> {
        let mut transport = self
            .transport
            .take()
            .ok_or_else(|| IotError::invalid_state("Coordinator already started"))?;
        info!(coordinator_id = %self.settings.id, "Starting coordinator");

        let (message_tx, message_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        transport.set_message_sender(message_tx).await;
        transport.connect().await.map_err(IotError::transport)?;

        let filters: Vec<String> = [
            TopicCategory::Data,
            TopicCategory::CommandResponse,
            TopicCategory::Register,
        ]
        .into_iter()
        .map(|category| self.topics.subscription_filter(category))
        .collect();
        transport
            .subscribe(&filters)
            .await
            .map_err(IotError::transport)?;
        info!(filters = ?filters, "Subscribed to device topics");

        let transport = Arc::new(transport);
        let table = PresenceTable::new(
            transport.clone(),
            self.topics.clone(),
            self.settings.dispatch_interval(),
            self.settings.command.clone(),
        );
        let (query_tx, query_rx) = mpsc::channel(QUERY_CHANNEL_CAPACITY);

        let router = RouterTask {
            table,
            sink: self.sink.clone(),
            topics: self.topics.clone(),
            inbound: message_rx,
            queries: query_rx,
            shutdown: self.shutdown_tx.subscribe(),
            presence_timeout: self.settings.presence_timeout(),
        };
        let span = tracing::info_span!("coordinator", coordinator_id = %self.settings.id);
        self.router = Some(tokio::spawn(router.run().instrument(span)));
        self.query_tx = Some(query_tx);
        self.shared_transport = Some(transport);

        info!(coordinator_id = %self.settings.id, "Coordinator started");
        Ok(())
    }

    /// Ids of online devices, as seen by the router
    pub async fn online_devices(&self) -> IotResult<Vec<String>> {
        let query_tx = self
            .query_tx
            .as_ref()
            .ok_or_else(|| IotError::invalid_state("Coordinator not started"))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        query_tx
            .send(RouterQuery::OnlineDevices(reply_tx))
            .await
            .map_err(|_| IotError::internal("Router task is not running"))?;
        reply_rx
            .await
            .map_err(|_| IotError::internal("Router task dropped the query"))
    }

    /// Stop the router, which stops every dispatch task, then disconnect.
    /// Calling it more than once has no further effect.
    pub async fn shutdown(&mut self) -> IotResult<()> {
        if self.stopped {
            debug!(coordinator_id = %self.settings.id, "Coordinator already shut down");
            return Ok(());
        }
        self.stopped = true;
        info!(coordinator_id = %self.settings.id, "Shutting down coordinator");

        self.shutdown_tx.send_replace(true);
        self.query_tx = None;
        if let Some(handle) = self.router.take() {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!("Router task shutdown error: {}", e);
                }
            }
        }

        if let Some(transport) = self.shared_transport.as_ref() {
            transport.disconnect().await.map_err(IotError::transport)?;
        }
        info!(coordinator_id = %self.settings.id, "Coordinator shutdown complete");
        Ok(())
    }
}

struct RouterTask<T>
where
    T: Transport + 'static,
{
    table: PresenceTable<T>,
    sink: Arc<dyn Sink>,
    topics: TopicLayout,
    inbound: mpsc::Receiver<IncomingMessage>,
    queries: mpsc::Receiver<RouterQuery>,
    shutdown: watch::Receiver<bool>,
    presence_timeout: Option<Duration>,
}

impl<T> RouterTask<T>
where
    T: Transport + 'static,
{
    async fn run(mut self) {
        let mut sweep = self.presence_timeout.map(|timeout| {
            let period = (timeout / 2).max(Duration::from_millis(100));
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        debug!("Router shutdown requested");
                        break;
                    }
                }
                message = self.inbound.recv() => {
                    let Some(message) = message else {
                        warn!("Inbound channel closed, router exiting");
                        break;
                    };
                    let outcome = route_message(
                        &mut self.table,
                        self.sink.as_ref(),
                        &self.topics,
                        &message,
                    );
                    debug!(topic = %message.topic, outcome = ?outcome, "Routed message");
                }
                Some(query) = self.queries.recv() => match query {
                    RouterQuery::OnlineDevices(reply) => {
                        let _ = reply.send(self.table.online_devices());
                    }
                },
                _ = next_sweep(&mut sweep) => {
                    if let Some(timeout) = self.presence_timeout {
                        let expired = self.table.expire_silent(timeout);
                        if !expired.is_empty() {
                            info!(expired = ?expired, "Expired silent devices");
                        }
                    }
                }
            }
        }

        self.table.stop_all();
        info!("Router stopped");
    }
}

async fn next_sweep(sweep: &mut Option<Interval>) {
    match sweep {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
