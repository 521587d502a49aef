//! Keel aggregate crate that re-exports the main components for downstream users.

pub use keel_config as config;
pub use keel_core as core;
pub use keel_engine as engine;
pub use keel_execution as execution;
pub use keel_persist as persist;
pub use keel_reconcile as reconcile;
pub use keel_risk as risk;
pub use keel_transport as transport;

/// Convenience prelude to pull commonly used items into scope.
pub mod prelude {
    pub use keel_config::*;
    pub use keel_core::*;
    pub use keel_engine::*;
    pub use keel_execution::*;
    pub use keel_persist::*;
    pub use keel_reconcile::*;
    pub use keel_risk::*;
    pub use keel_transport::*;
}
