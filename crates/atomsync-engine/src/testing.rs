//! Scripted in-process remote and engine harness for tests.

use crate::engine::SyncEngine;
use crate::events::SyncEvent;
use async_trait::async_trait;
use atomsync_client::{
    AtomRequest, BatchMeta, ChangeSetSummary, ClientError, ClientResult, FrontEndObject, IndexFetch,
    IndexResponse, InboundMessage, MjolnirResponse, MultiMjolnirResponse, OpenChangeSets,
    PatchBatch, PatchEntry, RemoteApi,
};
use atomsync_common::{AtomKey, AtomKind, ChangeSetId, SyncConfig, WorkspaceId};
use atomsync_store::AtomStore;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};

/// Fast retries and a short lease so tests do not wait
pub fn config() -> SyncConfig {
    let mut config = SyncConfig::default();
    config.hammer.max_retries = 2;
    config.hammer.base_delay_ms = 1;
    config.hammer.max_delay_ms = 5;
    config.lease.ttl_ms = 2_000;
    config.lease.renew_interval_ms = 50;
    config
}

pub fn component(id: &str) -> AtomKey {
    AtomKey::new(AtomKind::Component, id)
}

/// Operations materializing `document` from nothing
pub fn create(document: Value) -> Value {
    json!([{"op": "add", "path": "", "value": document}])
}

/// A `WORKSPACE_PATCH` for workspace `w1`; entries are
/// `(kind, id, fromChecksum, toChecksum, operations)`
pub fn patch(
    change_set: &str,
    from: &str,
    to: &str,
    entries: &[(&str, &str, &str, &str, Value)],
) -> InboundMessage {
    InboundMessage::WorkspacePatch(PatchBatch {
        meta: BatchMeta {
            workspace_id: "w1".into(),
            change_set_id: change_set.into(),
            from_index_checksum: from.into(),
            to_index_checksum: to.into(),
        },
        patches: entries
            .iter()
            .map(|(kind, id, from, to, operations)| PatchEntry {
                kind: (*kind).to_string(),
                id: (*id).to_string(),
                from_checksum: (*from).to_string(),
                to_checksum: (*to).to_string(),
                patch: operations.clone(),
            })
            .collect(),
    })
}

/// Everything emitted so far
pub fn drain(events: &mut mpsc::UnboundedReceiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

/// An engine over a fresh store and a scripted remote
pub struct Harness {
    pub dir: TempDir,
    pub store: Arc<AtomStore>,
    pub remote: Arc<MockRemote>,
    pub engine: SyncEngine,
    pub events: mpsc::UnboundedReceiver<SyncEvent>,
}

impl Harness {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(AtomStore::open(dir.path().join("replica.redb")).unwrap());
        let remote = Arc::new(MockRemote::new());
        let (engine, events) =
            SyncEngine::start(
                config(),
                Arc::clone(&store),
                Arc::clone(&remote) as Arc<dyn RemoteApi>,
            ).unwrap();
        Self {
            dir,
            store,
            remote,
            engine,
            events,
        }
    }

    pub fn store(&self) -> &AtomStore {
        &self.store
    }
}

#[derive(Clone)]
enum ScriptedIndex {
    Ready(IndexResponse),
    NotReady,
}

pub struct MockRemote {
    atoms: Mutex<HashMap<(String, AtomKey), (String, Value)>>,
    globals: Mutex<HashMap<AtomKey, (String, Value)>>,
    indexes: Mutex<HashMap<String, ScriptedIndex>>,
    deployment_index: Mutex<Option<IndexResponse>>,
    open_change_sets: Mutex<Option<OpenChangeSets>>,
    failures: Mutex<VecDeque<u16>>,
    bearers: Mutex<HashMap<WorkspaceId, String>>,
    gate: watch::Sender<bool>,
    atom_calls: AtomicUsize,
    multi_calls: AtomicUsize,
    index_calls: AtomicUsize,
}

fn index_response(
    id: &str,
    checksum: &str,
    kind: &str,
    entries: &[(AtomKind, &str, &str)],
) -> IndexResponse {
    let list: Vec<Value> = entries
        .iter()
        .map(|(kind, id, checksum)| json!({"kind": kind.as_str(), "id": id, "checksum": checksum}))
        .collect();
    IndexResponse {
        index_checksum: checksum.to_string(),
        front_end_object: FrontEndObject {
            kind: kind.to_string(),
            id: id.to_string(),
            checksum: checksum.to_string(),
            data: json!({ "mvList": list }),
        },
    }
}

impl MockRemote {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            atoms: Mutex::new(HashMap::new()),
            globals: Mutex::new(HashMap::new()),
            indexes: Mutex::new(HashMap::new()),
            deployment_index: Mutex::new(None),
            open_change_sets: Mutex::new(None),
            failures: Mutex::new(VecDeque::new()),
            bearers: Mutex::new(HashMap::new()),
            gate,
            atom_calls: AtomicUsize::new(0),
            multi_calls: AtomicUsize::new(0),
            index_calls: AtomicUsize::new(0),
        }
    }

    pub fn put_atom(
        &self,
        change_set: &str,
        kind: AtomKind,
        id: &str,
        checksum: &str,
        data: Value,
    ) {
        self.atoms.lock().insert(
            (change_set.to_string(), AtomKey::new(kind, id)),
            (checksum.to_string(), data),
        );
    }

    pub fn put_index(&self, change_set: &str, checksum: &str, entries: &[(AtomKind, &str, &str)]) {
        self.indexes.lock().insert(
            change_set.to_string(),
            ScriptedIndex::Ready(index_response(change_set, checksum, "ChangeSetMvIndex", entries)),
        );
    }

    pub fn index_not_ready(&self, change_set: &str) {
        self.indexes
            .lock()
            .insert(change_set.to_string(), ScriptedIndex::NotReady);
    }

    pub fn put_global(&self, kind: AtomKind, id: &str, checksum: &str, data: Value) {
        self.globals
            .lock()
            .insert(AtomKey::new(kind, id), (checksum.to_string(), data));
    }

    pub fn put_deployment_index(&self, checksum: &str, entries: &[(AtomKind, &str, &str)]) {
        *self.deployment_index.lock() = Some(index_response(
            "deployment",
            checksum,
            "DeploymentMvIndex",
            entries,
        ));
    }

    pub fn set_open_change_sets(&self, default: &str, others: &[&str]) {
        let mut change_sets = vec![ChangeSetSummary {
            id: ChangeSetId::new(default),
            status: Some("Open".into()),
        }];
        change_sets.extend(others.iter().map(|id| ChangeSetSummary {
            id: ChangeSetId::new(*id),
            status: Some("Open".into()),
        }));
        *self.open_change_sets.lock() = Some(OpenChangeSets {
            change_sets,
            default_change_set_id: ChangeSetId::new(default),
        });
    }

    /// The next `count` calls fail with `status`
    pub fn fail_next(&self, status: u16, count: usize) {
        self.failures.lock().extend(std::iter::repeat_n(status, count));
    }

    /// Hold every fetch until [`Self::release`]
    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    pub fn atom_calls(&self) -> usize {
        self.atom_calls.load(Ordering::SeqCst)
    }

    pub fn multi_calls(&self) -> usize {
        self.multi_calls.load(Ordering::SeqCst)
    }

    pub fn index_calls(&self) -> usize {
        self.index_calls.load(Ordering::SeqCst)
    }

    pub fn bearer(&self, workspace: &str) -> Option<String> {
        self.bearers.lock().get(&WorkspaceId::new(workspace)).cloned()
    }

    async fn enter(&self) -> ClientResult<()> {
        let mut gate = self.gate.subscribe();
        gate.wait_for(|open| *open)
            .await
            .map_err(|_| ClientError::Transport("gate closed".into()))?;
        match self.failures.lock().pop_front() {
            Some(status) => Err(ClientError::from_status(status, "scripted failure")),
            None => Ok(()),
        }
    }

    fn lookup(&self, change_set: &ChangeSetId, request: &AtomRequest) -> Option<MjolnirResponse> {
        let kind: AtomKind = request.kind.parse().ok()?;
        let key = AtomKey::new(kind, request.id.clone());
        let (checksum, data) = self
            .atoms
            .lock()
            .get(&(change_set.as_str().to_string(), key))
            .cloned()?;
        Some(MjolnirResponse {
            index_checksum: "remote".into(),
            front_end_object: FrontEndObject {
                kind: request.kind.clone(),
                id: request.id.clone(),
                checksum,
                data,
            },
        })
    }
}

#[async_trait]
impl RemoteApi for MockRemote {
    async fn fetch_change_set_index(
        &self,
        _workspace: &WorkspaceId,
        change_set: &ChangeSetId,
    ) -> ClientResult<IndexFetch> {
        self.index_calls.fetch_add(1, Ordering::SeqCst);
        self.enter().await?;
        match self.indexes.lock().get(change_set.as_str()).cloned() {
            Some(ScriptedIndex::Ready(response)) => Ok(IndexFetch::Ready(response)),
            Some(ScriptedIndex::NotReady) => Ok(IndexFetch::NotReady),
            None => Err(ClientError::from_status(404, "no such change set")),
        }
    }

    async fn fetch_atom(
        &self,
        _workspace: &WorkspaceId,
        change_set: &ChangeSetId,
        request: &AtomRequest,
    ) -> ClientResult<MjolnirResponse> {
        self.atom_calls.fetch_add(1, Ordering::SeqCst);
        self.enter().await?;
        self.lookup(change_set, request)
            .ok_or_else(|| ClientError::from_status(404, "no such atom"))
    }

    async fn fetch_atoms(
        &self,
        _workspace: &WorkspaceId,
        change_set: &ChangeSetId,
        requests: &[AtomRequest],
    ) -> ClientResult<MultiMjolnirResponse> {
        self.multi_calls.fetch_add(1, Ordering::SeqCst);
        self.enter().await?;
        let mut response = MultiMjolnirResponse::default();
        for request in requests {
            match self.lookup(change_set, request) {
                Some(found) => response.successful.push(found),
                None => response.failed.push(json!({"kind": request.kind, "id": request.id})),
            }
        }
        Ok(response)
    }

    async fn fetch_deployment_index(&self, _workspace: &WorkspaceId) -> ClientResult<IndexFetch> {
        self.index_calls.fetch_add(1, Ordering::SeqCst);
        self.enter().await?;
        Ok(self
            .deployment_index
            .lock()
            .clone()
            .map_or(IndexFetch::NotReady, IndexFetch::Ready))
    }

    async fn fetch_global_atoms(
        &self,
        _workspace: &WorkspaceId,
        requests: &[AtomRequest],
    ) -> ClientResult<MultiMjolnirResponse> {
        self.multi_calls.fetch_add(1, Ordering::SeqCst);
        self.enter().await?;
        let globals = self.globals.lock();
        let mut response = MultiMjolnirResponse::default();
        for request in requests {
            let Ok(kind) = request.kind.parse::<AtomKind>() else {
                continue;
            };
            if let Some((checksum, data)) = globals.get(&AtomKey::new(kind, request.id.clone())) {
                response.successful.push(MjolnirResponse {
                    index_checksum: "deployment".into(),
                    front_end_object: FrontEndObject {
                        kind: request.kind.clone(),
                        id: request.id.clone(),
                        checksum: checksum.clone(),
                        data: data.clone(),
                    },
                });
            }
        }
        Ok(response)
    }

    async fn list_open_change_sets(
        &self,
        _workspace: &WorkspaceId,
    ) -> ClientResult<OpenChangeSets> {
        self.enter().await?;
        self.open_change_sets
            .lock()
            .clone()
            .ok_or_else(|| ClientError::from_status(404, "no change sets"))
    }

    fn set_bearer(&self, workspace: &WorkspaceId, token: String) {
        self.bearers.lock().insert(workspace.clone(), token);
    }
}
