//! JSON wire formats
//!
//! Kinds stay strings here. They are parsed into `AtomKind` one entry at a
//! time by the engine, so an unknown kind or a malformed patch affects only
//! its own entry and never the decoding of the whole message.

use atomsync_common::{AtomKind, ChangeSetId, PairKey, UnknownKind, WorkspaceId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---- Inbound notifications ----

/// A message delivered over the update channel, tagged by `kind`
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind")]
pub enum InboundMessage {
    #[serde(rename = "WORKSPACE_PATCH", alias = "PatchMessage")]
    WorkspacePatch(PatchBatch),
    #[serde(rename = "DEPLOYMENT_PATCH")]
    DeploymentPatch(DeploymentPatchBatch),
    #[serde(rename = "WORKSPACE_INDEXUPDATE")]
    WorkspaceIndexUpdate(IndexUpdate),
    #[serde(rename = "DEPLOYMENT_INDEXUPDATE")]
    DeploymentIndexUpdate(DeploymentIndexUpdate),
    #[serde(rename = "MJOLNIR")]
    Mjolnir(MjolnirPush),
}

impl InboundMessage {
    /// Decode one JSON message
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// The change-set pair this message is ordered under, if any
    #[must_use]
    pub fn pair(&self) -> Option<PairKey> {
        match self {
            Self::WorkspacePatch(batch) => Some(batch.meta.pair()),
            Self::WorkspaceIndexUpdate(update) => Some(update.meta.pair()),
            Self::Mjolnir(push) => Some(PairKey::new(
                push.atom.workspace_id.clone(),
                push.atom.change_set_id.clone(),
            )),
            Self::DeploymentPatch(_) | Self::DeploymentIndexUpdate(_) => None,
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::WorkspacePatch(_) => "WORKSPACE_PATCH",
            Self::DeploymentPatch(_) => "DEPLOYMENT_PATCH",
            Self::WorkspaceIndexUpdate(_) => "WORKSPACE_INDEXUPDATE",
            Self::DeploymentIndexUpdate(_) => "DEPLOYMENT_INDEXUPDATE",
            Self::Mjolnir(_) => "MJOLNIR",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchMeta {
    pub workspace_id: WorkspaceId,
    pub change_set_id: ChangeSetId,
    pub from_index_checksum: String,
    pub to_index_checksum: String,
}

impl BatchMeta {
    #[must_use]
    pub fn pair(&self) -> PairKey {
        PairKey::new(self.workspace_id.clone(), self.change_set_id.clone())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentMeta {
    #[serde(default)]
    pub workspace_id: Option<WorkspaceId>,
    pub from_index_checksum: String,
    pub to_index_checksum: String,
}

/// One object-level change
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchEntry {
    pub kind: String,
    #[serde(default)]
    pub id: String,
    pub from_checksum: String,
    pub to_checksum: String,
    /// RFC 6902 operations, decoded per entry
    #[serde(default)]
    pub patch: Value,
}

impl PatchEntry {
    pub fn atom_kind(&self) -> Result<AtomKind, UnknownKind> {
        self.kind.parse()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PatchBatch {
    pub meta: BatchMeta,
    #[serde(default)]
    pub patches: Vec<PatchEntry>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeploymentPatchBatch {
    pub meta: DeploymentMeta,
    #[serde(default)]
    pub patches: Vec<PatchEntry>,
}

/// Patch of a change-set index descriptor
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IndexUpdate {
    pub meta: BatchMeta,
    pub patch: PatchEntry,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeploymentIndexUpdate {
    pub meta: DeploymentMeta,
    pub patch: PatchEntry,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MjolnirAtom {
    pub kind: String,
    pub id: String,
    pub to_checksum: String,
    pub workspace_id: WorkspaceId,
    pub change_set_id: ChangeSetId,
    pub to_index_checksum: String,
    pub from_index_checksum: String,
}

/// Unsolicited full object
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MjolnirPush {
    pub atom: MjolnirAtom,
    pub data: Value,
}

// ---- Remote responses ----

/// A full object as served by the index endpoints
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FrontEndObject {
    pub kind: String,
    pub id: String,
    pub checksum: String,
    #[serde(default)]
    pub data: Value,
}

/// `GET .../index/mjolnir`, and each success of a multi fetch
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MjolnirResponse {
    pub index_checksum: String,
    pub front_end_object: FrontEndObject,
}

/// One `{kind, id, checksum}` row of an index descriptor
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct IndexEntry {
    pub kind: String,
    pub id: String,
    pub checksum: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct IndexData {
    #[serde(default)]
    mv_list: Vec<IndexEntry>,
}

/// `GET .../change-sets/{id}/index` and `GET .../deployment_index`
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexResponse {
    pub index_checksum: String,
    pub front_end_object: FrontEndObject,
}

impl IndexResponse {
    /// Member references listed by the descriptor
    pub fn mv_list(&self) -> serde_json::Result<Vec<IndexEntry>> {
        mv_list(&self.front_end_object.data)
    }
}

/// Read the `mvList` of an index descriptor document
pub fn mv_list(descriptor: &Value) -> serde_json::Result<Vec<IndexEntry>> {
    if descriptor.is_null() {
        return Ok(Vec::new());
    }
    let data: IndexData = serde_json::from_value(descriptor.clone())?;
    Ok(data.mv_list)
}

/// One request of a multi fetch
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AtomRequest {
    pub kind: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl AtomRequest {
    #[must_use]
    pub fn new(kind: AtomKind, id: impl Into<String>, checksum: Option<String>) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            id: id.into(),
            checksum,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MultiMjolnirRequest<'a> {
    pub requests: &'a [AtomRequest],
}

/// `POST .../multi_mjolnir`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MultiMjolnirResponse {
    #[serde(default)]
    pub successful: Vec<MjolnirResponse>,
    #[serde(default)]
    pub failed: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChangeSetSummary {
    pub id: ChangeSetId,
    #[serde(default)]
    pub status: Option<String>,
}

/// `GET v2/workspaces/{ws}/change-sets`
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenChangeSets {
    #[serde(default)]
    pub change_sets: Vec<ChangeSetSummary>,
    pub default_change_set_id: ChangeSetId,
}
