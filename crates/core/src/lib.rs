//! `strata-core`: event-sourced domain building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the domain error model, the `Aggregate` contract with its
//! versioning rules, and the version-keyed upcaster tables used for schema
//! evolution of snapshots and event payloads.

pub mod aggregate;
pub mod error;
pub mod id;
pub mod upcast;

pub use aggregate::{Aggregate, ApplyMode, Recorded};
pub use error::{DomainError, DomainResult};
pub use id::{AggregateId, MessageId, TenantId, UserId};
pub use upcast::{EventUpcasters, UpcastChain, UpcastError, UpcastFn};
