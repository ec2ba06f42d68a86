//! atomsync Store - durable replica of server-side atoms
//!
//! This crate implements the local, content-addressed replica: atom bytes
//! keyed by `(kind, id, checksum)`, named index snapshots and their
//! membership, the change-set registry, deployment-scoped global atoms,
//! weak references used for invalidation, the single-writer lease and
//! garbage collection.
//!
//! All multi-step mutations go through [`StoreTxn`], a single redb write
//! transaction that commits all-or-nothing.

pub mod error;
pub mod gc;
pub mod keys;
pub mod lease;
mod reads;
pub mod store;
pub mod tables;
pub mod txn;
pub mod types;

pub use error::{StoreError, StoreResult};
pub use gc::{GcReport, RagnarokReport};
pub use lease::LeaseRecord;
pub use store::{AtomStore, StoreStats};
pub use txn::{EnsuredIndex, StoreTxn};
