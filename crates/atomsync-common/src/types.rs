//! Core type definitions for atomsync
//!
//! This module defines the identifiers and the data model shared by the
//! store, the client and the engine: atoms, atom references, change-sets,
//! weak references and the classification of incoming patch items.

use crate::kind::AtomKind;
use bytes::Bytes;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Checksum used on the wire to mean "no object": a `fromChecksum` of zero
/// creates, a `toChecksum` of zero removes.
pub const ZERO_CHECKSUM: &str = "0";

/// Workspace identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[serde(transparent)]
#[display("{_0}")]
pub struct WorkspaceId(String);

impl WorkspaceId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for WorkspaceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for WorkspaceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Change-set identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[serde(transparent)]
#[display("{_0}")]
pub struct ChangeSetId(String);

impl ChangeSetId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ChangeSetId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ChangeSetId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A `(workspace, change-set)` pair: the unit of ordering and locking.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PairKey {
    pub workspace_id: WorkspaceId,
    pub change_set_id: ChangeSetId,
}

impl PairKey {
    #[must_use]
    pub fn new(
        workspace_id: impl Into<WorkspaceId>,
        change_set_id: impl Into<ChangeSetId>,
    ) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            change_set_id: change_set_id.into(),
        }
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.workspace_id, self.change_set_id)
    }
}

/// Logical identity of an atom, independent of version
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AtomKey {
    pub kind: AtomKind,
    pub id: String,
}

impl AtomKey {
    #[must_use]
    pub fn new(kind: AtomKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for AtomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Full identity of one immutable atom version: `(kind, id, checksum)`
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AtomRef {
    pub kind: AtomKind,
    pub id: String,
    pub checksum: String,
}

impl AtomRef {
    #[must_use]
    pub fn new(kind: AtomKind, id: impl Into<String>, checksum: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            checksum: checksum.into(),
        }
    }

    #[must_use]
    pub fn key(&self) -> AtomKey {
        AtomKey::new(self.kind, self.id.clone())
    }
}

impl fmt::Display for AtomRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.kind, self.id, self.checksum)
    }
}

/// An immutable document identified by `(kind, id, checksum)`.
///
/// The document is kept as serialized JSON bytes; the same bytes are
/// written to the store and handed to consumers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Atom {
    pub kind: AtomKind,
    pub id: String,
    pub checksum: String,
    pub document: Bytes,
}

/// Deployment-scoped atom. Same shape, but keyed by `(kind, id)` alone and
/// its checksum is advisory (last write wins).
pub type GlobalAtom = Atom;

impl Atom {
    #[must_use]
    pub fn new(
        kind: AtomKind,
        id: impl Into<String>,
        checksum: impl Into<String>,
        document: impl Into<Bytes>,
    ) -> Self {
        Self {
            kind,
            id: id.into(),
            checksum: checksum.into(),
            document: document.into(),
        }
    }

    /// Build an atom from a JSON document
    pub fn from_value(
        kind: AtomKind,
        id: impl Into<String>,
        checksum: impl Into<String>,
        value: &serde_json::Value,
    ) -> serde_json::Result<Self> {
        let bytes = serde_json::to_vec(value)?;
        Ok(Self::new(kind, id, checksum, bytes))
    }

    /// Decode the document as JSON
    pub fn to_value(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_slice(&self.document)
    }

    #[must_use]
    pub fn atom_ref(&self) -> AtomRef {
        AtomRef::new(self.kind, self.id.clone(), self.checksum.clone())
    }

    #[must_use]
    pub fn key(&self) -> AtomKey {
        AtomKey::new(self.kind, self.id.clone())
    }
}

/// A change-set row: which index the change-set currently points at
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub id: ChangeSetId,
    pub workspace_id: WorkspaceId,
    pub index_checksum: String,
}

/// Directed invalidation edge, scoped to a change-set: when `target`
/// changes, `referrer` must be invalidated.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WeakReference {
    pub change_set_id: ChangeSetId,
    pub target: AtomKey,
    pub referrer: AtomKey,
}

/// Classification of one incoming patch item
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PendingOperation {
    /// Target bytes already exist; only membership needs registering
    NoOp,
    /// Materialize from an empty document
    Create,
    /// Drop membership of the object
    Remove,
    /// Apply operations on top of the predecessor document
    Patch,
}

impl PendingOperation {
    /// Classify a `(fromChecksum, toChecksum)` pair. `target_present`
    /// reports whether bytes for `toChecksum` already exist locally.
    #[must_use]
    pub fn classify(from_checksum: &str, to_checksum: &str, target_present: bool) -> Self {
        if from_checksum == ZERO_CHECKSUM {
            Self::Create
        } else if to_checksum == ZERO_CHECKSUM {
            Self::Remove
        } else if target_present {
            Self::NoOp
        } else {
            Self::Patch
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_pending_operation() {
        assert_eq!(
            PendingOperation::classify("0", "abc", false),
            PendingOperation::Create
        );
        assert_eq!(
            PendingOperation::classify("abc", "0", false),
            PendingOperation::Remove
        );
        assert_eq!(
            PendingOperation::classify("abc", "def", true),
            PendingOperation::NoOp
        );
        assert_eq!(
            PendingOperation::classify("abc", "def", false),
            PendingOperation::Patch
        );
    }

    #[test]
    fn test_create_wins_over_present_target() {
        // A create whose bytes already exist is still a create
        assert_eq!(
            PendingOperation::classify("0", "def", true),
            PendingOperation::Create
        );
    }

    #[test]
    fn test_atom_value_round_trip() {
        let value = serde_json::json!({"x": 1});
        let atom = Atom::from_value(AtomKind::Component, "c1", "sum", &value).unwrap();
        assert_eq!(atom.to_value().unwrap(), value);
        assert_eq!(atom.atom_ref().to_string(), "Component:c1@sum");
    }

    #[test]
    fn test_pair_key_display() {
        let pair = PairKey::new("ws", "cs");
        assert_eq!(pair.to_string(), "ws/cs");
    }
}
