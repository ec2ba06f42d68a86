//! The remote source of truth as seen by the engine

use crate::error::ClientResult;
use crate::wire::{
    AtomRequest, IndexResponse, MjolnirResponse, MultiMjolnirResponse, OpenChangeSets,
};
use async_trait::async_trait;
use atomsync_common::{ChangeSetId, WorkspaceId};

/// Result of an index fetch
#[derive(Debug, Clone)]
pub enum IndexFetch {
    Ready(IndexResponse),
    /// HTTP 202: the server is still building the index
    NotReady,
}

/// Remote API consumed by the synchronization engine.
///
/// Implementations return [`crate::ClientError::Unavailable`] or
/// [`crate::ClientError::Transport`] for failures worth retrying and
/// [`crate::ClientError::Rejected`] for everything the caller should not
/// retry before the next index update.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Full index of a change-set
    async fn fetch_change_set_index(
        &self,
        workspace: &WorkspaceId,
        change_set: &ChangeSetId,
    ) -> ClientResult<IndexFetch>;

    /// One object, by kind and id, optionally at a specific checksum
    async fn fetch_atom(
        &self,
        workspace: &WorkspaceId,
        change_set: &ChangeSetId,
        request: &AtomRequest,
    ) -> ClientResult<MjolnirResponse>;

    /// Many objects in one round trip
    async fn fetch_atoms(
        &self,
        workspace: &WorkspaceId,
        change_set: &ChangeSetId,
        requests: &[AtomRequest],
    ) -> ClientResult<MultiMjolnirResponse>;

    /// Deployment-scoped index
    async fn fetch_deployment_index(&self, workspace: &WorkspaceId) -> ClientResult<IndexFetch>;

    /// Deployment-scoped objects
    async fn fetch_global_atoms(
        &self,
        workspace: &WorkspaceId,
        requests: &[AtomRequest],
    ) -> ClientResult<MultiMjolnirResponse>;

    /// Open change-sets of a workspace and its default change-set
    async fn list_open_change_sets(&self, workspace: &WorkspaceId) -> ClientResult<OpenChangeSets>;

    /// Bearer token for every later request of `workspace`
    fn set_bearer(&self, _workspace: &WorkspaceId, _token: String) {}
}
