//! Request caching for offline support.
//!
//! This module decides how each outgoing request is served:
//! - Classifies requests against an ordered policy table
//! - Serves from named stores with FIFO eviction and lazy expiry
//! - Falls back to cached data when the network is unavailable
//! - Hands failed writes to the mutation queues

mod policy;
mod router;
mod storage;
mod store;
mod traits;

pub use policy::CachePolicyTable;
pub use router::{CacheRouter, RouteOutcome};
#[cfg(test)]
pub use storage::CacheEntry;
pub use storage::{CacheStorage, NoopStorage, SqliteStorage};
pub use traits::CacheSource;
