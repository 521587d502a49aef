//! Resilient JSON-RPC-over-WebSocket transport.
//!
//! The transport owns everything between the trading core and the venue:
//! connection lifecycle (authenticate, heartbeat, reconnect with replayed
//! subscriptions), request/reply correlation, the typed error taxonomy and
//! the rate-limited [`ExchangeApi`] surface the rest of the workspace
//! consumes.

pub mod api;
pub mod client;
pub mod error;
pub mod protocol;
pub mod registry;

pub use api::{ExchangeApi, RpcExchangeApi};
pub use client::{ConnectionState, Credentials, RpcClient};
pub use error::{TransportError, TransportErrorKind, TransportResult};
pub use registry::{ConnectionKey, ConnectionRegistry};
