//! Background workers.

pub mod replicator;

pub use replicator::{ReplicatorHandle, WorkerExit, WorkerReplicator};
