//! Document store boundary.
//!
//! The pipeline persists exactly one kind of record, the `call_start` object
//! of an envelope, with an insert-only contract. Implementations decide where
//! it lands.

pub mod in_memory;
pub mod mongo;
pub mod r#trait;

pub use in_memory::InMemoryDocumentStore;
pub use mongo::MongoDocumentStore;
pub use r#trait::{DocumentStore, StoreError};
