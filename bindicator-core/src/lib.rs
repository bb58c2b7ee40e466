//! Core types and service wiring for the bindicator bin collection lookup.

/// Persistent cache of schedule results keyed by postcode or property reference.
pub mod cache;
/// Time sources used for freshness decisions.
pub mod clock;
mod locks;
/// Ranking of free-text house input against address candidates.
pub mod matcher;
/// Domain models and identifiers shared by all sources.
pub mod model;
/// Bundle of ports making up a schedule source.
pub mod plugin;
/// Traits describing the source interfaces.
pub mod ports;
/// High-level service facade used by the HTTP layer.
pub mod service;
/// Same-day freshness rule for cached results.
pub mod staleness;
/// Opportunistic detection of postcodes served by several routes.
pub mod verifier;

pub use cache::*;
pub use clock::*;
pub use matcher::*;
pub use model::*;
pub use plugin::*;
pub use ports::*;
pub use service::*;
pub use staleness::*;
pub use verifier::*;
