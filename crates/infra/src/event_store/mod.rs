//! Append-only event store boundary.
//!
//! [`EventStore`] is the only shared mutable resource of the runtime; the
//! `expected_version` check on append is its entire concurrency control.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use r#trait::{
    AppendOutcome, EventStore, EventStoreError, LoadedStream, SnapshotCandidate, SnapshotPolicy,
    StoredSnapshot, StreamId, UncommittedEvent,
};
