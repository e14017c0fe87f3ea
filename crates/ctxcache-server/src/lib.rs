//! HTTP and WebSocket surface of the context cache.

pub mod connection;
pub mod errors;
pub mod event_bridge;
pub mod handlers;
pub mod hub;
pub mod protocol;
pub mod server;
pub mod stats;

pub use errors::ApiError;
pub use hub::{Outbound, SubscriptionHub};
pub use protocol::{ClientMessage, ServerMessage};
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
