//! Two-tier retry: an in-process FIFO buffer fed from the persistent retry
//! queue, escalating back to that queue (or the dead-letter queue) once the
//! in-process budget is spent.

pub mod buffer;
pub mod coordinator;

pub use buffer::RetryBuffer;
pub use coordinator::{DrainReport, RetryCoordinator, RetryPolicy};
