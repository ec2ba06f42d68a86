//! atomsync Engine - keeping the replica in step with the server
//!
//! This crate turns inbound patch notifications into store transactions,
//! recovers missing atoms from the remote ("hammers"), runs full cold starts
//! and maintains the in-memory projections. All work for one change-set
//! pair is serialized through the lanes of the [`QueueOrchestrator`];
//! independent pairs run concurrently up to a configured bound.
//!
//! Hosts drive everything through [`SyncEngine`] and observe it through the
//! [`SyncEvent`] channel.

mod cold_start;
pub mod document;
pub mod engine;
pub mod events;
pub mod hammer;
pub mod lanes;
pub mod lease;
pub mod orchestrator;
pub mod projection;
mod query;
pub mod reconciler;

#[cfg(test)]
mod testing;

pub use engine::{ChangeSetDump, SyncEngine};
pub use events::{ColdStartOutcome, EventSink, SyncEvent};
pub use hammer::{BulkFetch, HammerFetcher, HammerRequest};
pub use orchestrator::{LaneRunner, QueueOrchestrator, Scope};
pub use projection::{Connection, DefaultSubscription, DefaultSubscriptions, ProjectionEngine};
pub use reconciler::{GlobalReconciliation, IndexUpdateOutcome, Reconciliation};
