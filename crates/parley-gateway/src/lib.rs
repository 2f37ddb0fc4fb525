//! WebSocket voice gateway.
//!
//! Each connection to `/ws/voice` gets its own turn-taking session; the
//! gateway only adapts the socket and tracks live connections.

pub mod connection;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod server;
pub mod state;

pub use server::{router, start_gateway};
pub use state::GatewayState;
