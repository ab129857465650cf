//! Coordinator role: presence tracking and per-device command dispatch

pub mod presence;
pub mod router;

pub use presence::PresenceTable;
pub use router::{coordinator_session, route_message, Coordinator, RouteOutcome};
