//! Stored types for replica persistence.
//!
//! These types are serialized to redb via bincode.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// A known index snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredIndex {
    /// Change-set that first pointed at this index, if any
    pub created_by: Option<String>,
    pub created_at_ms: u64,
}

/// Change-set registry row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredChangeSet {
    pub workspace_id: String,
    pub index_checksum: String,
}

/// Deployment-scoped atom, keyed by (kind, id) alone
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredGlobalAtom {
    pub checksum: String,
    pub document: Vec<u8>,
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}
