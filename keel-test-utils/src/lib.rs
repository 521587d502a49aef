//! Test doubles for the trading core: an in-memory scripted [`ExchangeApi`]
//! and a real JSON-RPC WebSocket server for transport tests.

mod exchange;
mod websocket;

pub use exchange::{ApiCall, FailureScript, FailureTrigger, MockExchangeApi};
pub use websocket::MockRpcServer;
