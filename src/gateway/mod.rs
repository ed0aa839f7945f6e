//! Gateway module - client-facing stream server
//!
//! Terminates long-lived client streams, bridges each to one upstream
//! connector, and runs heartbeat, staleness watchdog and snapshot fallback
//! per session.

mod api;
mod session;
mod types;

pub use api::{create_router, AppState};
pub use session::{GatewaySession, PollFailure, SessionInbox, SessionMsg, SessionState};
pub use types::*;
