//! Durable mutation queues, one per data domain.
//!
//! Writes that cannot reach the server are stored here and re-sent when a
//! trigger fires. Every domain uses the same queue type; they differ only in
//! store name, trigger tag and endpoint (see [`Domain`]).

mod domain;
mod replay;
mod storage;

pub use domain::Domain;
pub use replay::{QueueSet, ReplayReport};
pub use storage::{QueueStorage, QueuedMutation};
