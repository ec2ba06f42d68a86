//! Outbound notifications
//!
//! The engine never calls into its host. Everything a cache consumer or a
//! status display needs is published on an unbounded channel.

use atomsync_common::{AtomKind, ChangeSetId, WorkspaceId};
use tokio::sync::mpsc;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColdStartOutcome {
    /// The replica now mirrors the fetched index
    Completed {
        index_checksum: String,
        members: usize,
        fetched: usize,
    },
    /// The remote is still building the index; nothing was changed
    NotReady,
    Cancelled,
    Failed(String),
}

impl ColdStartOutcome {
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Consumers holding `(kind, id)` for this change-set must re-read it
    CacheBust {
        workspace_id: WorkspaceId,
        change_set_id: ChangeSetId,
        kind: AtomKind,
        id: String,
    },
    /// Membership of `(kind, id)` changed
    AtomUpdated {
        workspace_id: WorkspaceId,
        change_set_id: ChangeSetId,
        kind: AtomKind,
        id: String,
        checksum: String,
        removed: bool,
    },
    HammerInFlight {
        workspace_id: WorkspaceId,
        change_set_id: ChangeSetId,
        kind: AtomKind,
        id: String,
    },
    HammerReturned {
        workspace_id: WorkspaceId,
        change_set_id: ChangeSetId,
        kind: AtomKind,
        id: String,
        found: bool,
    },
    /// Deployment-scoped atom changed
    GlobalUpdated { kind: AtomKind, id: String },
    ColdStartFinished {
        workspace_id: WorkspaceId,
        change_set_id: Option<ChangeSetId>,
        outcome: ColdStartOutcome,
    },
    LeaseLost { holder: String },
}

/// Sending half of the event channel. Events sent after the receiver is
/// dropped are discarded.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<SyncEvent>,
}

impl EventSink {
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SyncEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: SyncEvent) {
        if self.tx.send(event).is_err() {
            trace!("event receiver dropped");
        }
    }
}
