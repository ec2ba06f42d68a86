//! SyncEngine: the owner of every piece of synchronization state.
//!
//! Inbound messages, cold starts and hammer results are queued per scope
//! into the [`QueueOrchestrator`]; the engine itself is the lane runner
//! that executes them. Hosts talk to the engine through [`SyncEngine`] and
//! listen on the [`SyncEvent`] channel it returns.

use crate::events::{ColdStartOutcome, EventSink, SyncEvent};
use crate::hammer::{HammerFetcher, HammerRequest};
use crate::lease::LeaseKeeper;
use crate::orchestrator::{LaneRunner, QueueOrchestrator, Scope};
use crate::projection::{Connection, DefaultSubscriptions, ProjectionEngine};
use crate::reconciler::{
    IndexUpdateOutcome, Reconciliation, reconcile_batch, reconcile_deployment_batch,
    reconcile_deployment_index, reconcile_index_update,
};
use async_trait::async_trait;
use atomsync_client::{
    DeploymentIndexUpdate, DeploymentPatchBatch, IndexUpdate, InboundMessage, MjolnirPush,
    PatchBatch, RemoteApi,
};
use atomsync_common::{
    Atom, AtomKey, AtomKind, AtomRef, ChangeSet, ChangeSetId, Error, PairKey, Result, SyncConfig,
    WorkspaceId,
};
use atomsync_store::{AtomStore, GcReport, RagnarokReport, StoreStats, StoreTxn};
use dashmap::DashMap;
use futures::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

/// Work for the patch lane
pub(crate) enum PatchJob {
    Batch(PatchBatch),
    IndexUpdate(IndexUpdate),
    DeploymentBatch(DeploymentPatchBatch),
    DeploymentIndexUpdate(DeploymentIndexUpdate),
}

/// Work for the hammer lane
pub(crate) enum HammerJob {
    /// A hammer fetch came back
    Fetched {
        requests: Vec<HammerRequest>,
        result: Result<Vec<Atom>>,
    },
    /// The wanted version was already stored; only membership is missing
    Local(HammerRequest, Atom),
    /// Unsolicited full object from the server
    Pushed(MjolnirPush),
    /// Deployment-scoped fetch came back
    Globals {
        requested: Vec<AtomKey>,
        result: Result<Vec<Atom>>,
    },
}

/// Work for the bulk lane
pub(crate) enum BulkJob {
    ColdStart {
        workspace: WorkspaceId,
        restarts: u32,
        done: Option<oneshot::Sender<ColdStartOutcome>>,
    },
    Ragnarok {
        restart: bool,
        done: oneshot::Sender<Result<(RagnarokReport, Option<ColdStartOutcome>)>>,
    },
}

pub(crate) struct EngineInner {
    pub(crate) me: Weak<Self>,
    pub(crate) config: SyncConfig,
    pub(crate) store: Arc<AtomStore>,
    pub(crate) remote: Arc<dyn RemoteApi>,
    pub(crate) events: EventSink,
    pub(crate) hammers: HammerFetcher,
    pub(crate) projections: ProjectionEngine,
    pub(crate) queue: QueueOrchestrator<Self>,
    pub(crate) root: CancellationToken,
    pub(crate) bulk_tokens: DashMap<Scope, CancellationToken>,
}

impl EngineInner {
    pub(crate) fn new(
        config: SyncConfig,
        store: Arc<AtomStore>,
        remote: Arc<dyn RemoteApi>,
        events: EventSink,
        root: CancellationToken,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            hammers: HammerFetcher::new(Arc::clone(&remote), config.hammer.clone()),
            queue: QueueOrchestrator::new(config.queue.max_concurrent_pairs),
            projections: ProjectionEngine::new(),
            bulk_tokens: DashMap::new(),
            config,
            store,
            remote,
            events,
            root,
        })
    }

    fn handle(&self) -> Option<Arc<Self>> {
        self.me.upgrade()
    }

    pub(crate) fn push_patch(&self, scope: &Scope, job: PatchJob) {
        if let Some(this) = self.handle() {
            QueueOrchestrator::push_patch(&this, scope, job);
        }
    }

    pub(crate) fn push_hammer(&self, scope: &Scope, job: HammerJob) {
        if let Some(this) = self.handle() {
            QueueOrchestrator::push_hammer(&this, scope, job);
        }
    }

    pub(crate) fn push_bulk(&self, scope: &Scope, job: BulkJob) {
        if let Some(this) = self.handle() {
            QueueOrchestrator::push_bulk(&this, scope, job);
        }
    }

    pub(crate) fn invalidate(&self, scope: &Scope, keys: Vec<AtomKey>) {
        if let Some(this) = self.handle() {
            QueueOrchestrator::push_invalidations(&this, scope, keys);
        }
    }

    pub(crate) fn dispatch(&self, message: InboundMessage) {
        debug!(message = message.name(), "inbound message");
        match message {
            InboundMessage::WorkspacePatch(batch) => {
                let scope = Scope::from(batch.meta.pair());
                self.push_patch(&scope, PatchJob::Batch(batch));
            }
            InboundMessage::WorkspaceIndexUpdate(update) => {
                let scope = Scope::from(update.meta.pair());
                self.push_patch(&scope, PatchJob::IndexUpdate(update));
            }
            InboundMessage::DeploymentPatch(batch) => {
                self.push_patch(&Scope::Deployment, PatchJob::DeploymentBatch(batch));
            }
            InboundMessage::DeploymentIndexUpdate(update) => {
                self.push_patch(&Scope::Deployment, PatchJob::DeploymentIndexUpdate(update));
            }
            InboundMessage::Mjolnir(push) => {
                let pair = PairKey::new(
                    push.atom.workspace_id.clone(),
                    push.atom.change_set_id.clone(),
                );
                self.push_hammer(&Scope::from(pair), HammerJob::Pushed(push));
            }
        }
    }

    // ---- Hammer ----

    /// Fire hammers, skipping what is already stored, frozen or in flight
    pub(crate) fn request_hammers(&self, requests: Vec<HammerRequest>) {
        let mut groups: HashMap<PairKey, Vec<HammerRequest>> = HashMap::new();
        for request in requests {
            if let Some(atom) = self.stored_version(&request) {
                self.push_hammer(
                    &Scope::from(request.pair.clone()),
                    HammerJob::Local(request, atom),
                );
                continue;
            }
            if self.hammers.defer(&request) {
                debug!(pair = %request.pair, atom = %request.key, "hammer held during bulk work");
                continue;
            }
            if !self.hammers.claim(&request) {
                debug!(pair = %request.pair, atom = %request.key, "hammer already in flight");
                continue;
            }
            self.events.emit(SyncEvent::HammerInFlight {
                workspace_id: request.pair.workspace_id.clone(),
                change_set_id: request.pair.change_set_id.clone(),
                kind: request.key.kind,
                id: request.key.id.clone(),
            });
            groups.entry(request.pair.clone()).or_default().push(request);
        }
        for (pair, group) in groups {
            self.spawn_fetch(pair, group);
        }
    }

    fn stored_version(&self, request: &HammerRequest) -> Option<Atom> {
        let checksum = request.checksum.as_ref()?;
        let r = AtomRef::new(request.key.kind, request.key.id.clone(), checksum.clone());
        match self.store.get_atom(&r) {
            Ok(atom) => atom,
            Err(e) => {
                warn!(atom = %r, error = %e, "could not check local bytes");
                None
            }
        }
    }

    fn spawn_fetch(&self, pair: PairKey, requests: Vec<HammerRequest>) {
        let Some(this) = self.handle() else {
            return;
        };
        let scope = Scope::from(pair.clone());
        self.queue.hammer_started(&scope);
        let cancel = self.root.child_token();
        let span = info_span!("hammer", pair = %pair, count = requests.len());
        tokio::spawn(
            async move {
                let result = if let [request] = requests.as_slice() {
                    this.hammers
                        .fetch_one(request, &cancel)
                        .await
                        .map(|atom| atom.into_iter().collect())
                } else {
                    this.hammers
                        .fetch_bulk(&pair, &requests, &cancel)
                        .await
                        .map(|fetched| fetched.resolved)
                };
                let job = HammerJob::Fetched { requests, result };
                QueueOrchestrator::hammer_returned(&this, &scope, job);
            }
            .instrument(span),
        );
    }

    pub(crate) fn fetch_globals(&self, workspace: WorkspaceId, keys: Vec<AtomKey>) {
        if keys.is_empty() {
            return;
        }
        let Some(this) = self.handle() else {
            return;
        };
        self.queue.hammer_started(&Scope::Deployment);
        let cancel = self.root.child_token();
        let span = info_span!("global_hammer", workspace = %workspace, count = keys.len());
        tokio::spawn(
            async move {
                let result = this
                    .hammers
                    .fetch_globals(&workspace, &keys, &cancel)
                    .await
                    .map(|fetched| fetched.resolved);
                let job = HammerJob::Globals {
                    requested: keys,
                    result,
                };
                QueueOrchestrator::hammer_returned(&this, &Scope::Deployment, job);
            }
            .instrument(span),
        );
    }

    /// Write atoms for a pair and register them in the change-set's index.
    /// A push names its own `(to, from)` indexes.
    fn apply_fetched(
        &self,
        pair: &PairKey,
        atoms: &[Atom],
        push_index: Option<(&str, &str)>,
    ) -> Result<()> {
        let change_set = &pair.change_set_id;
        let index = self.store.transact(|txn| -> Result<Option<String>> {
            let index = match (txn.change_set(change_set)?, push_index) {
                (Some(cs), push) => Some(writable_index(txn, pair, cs.index_checksum, push)?),
                (None, Some((to, from))) => {
                    txn.ensure_index(to, &[Some(from)], Some(change_set))?;
                    txn.ensure_change_set(&pair.workspace_id, change_set, to)?;
                    Some(to.to_string())
                }
                (None, None) => None,
            };
            for atom in atoms {
                txn.put_atom(atom)?;
                if let Some(index) = &index
                    && !atom.kind.is_index_descriptor()
                {
                    txn.set_member(index, &atom.atom_ref())?;
                }
            }
            Ok(index)
        })?;
        if index.is_none() {
            warn!(pair = %pair, "change set unknown, stored bytes only");
            return Ok(());
        }

        let mut keys = Vec::new();
        for atom in atoms {
            let key = atom.key();
            match atom.to_value() {
                Ok(document) => {
                    self.projections.apply(change_set, &key, Some(&document));
                }
                Err(e) => {
                    warn!(atom = %atom.atom_ref(), error = %e, "fetched document is not JSON")
                }
            }
            self.events.emit(SyncEvent::AtomUpdated {
                workspace_id: pair.workspace_id.clone(),
                change_set_id: change_set.clone(),
                kind: atom.kind,
                id: atom.id.clone(),
                checksum: atom.checksum.clone(),
                removed: false,
            });
            // structural recovery: referrers are invalidated, lists included
            keys.extend(self.store.referrers(change_set, &key)?);
            keys.push(key);
        }
        self.invalidate(&Scope::from(pair.clone()), keys);
        Ok(())
    }

    fn hammer_returned(&self, pair: &PairKey, requests: &[HammerRequest], atoms: &[Atom]) {
        for request in requests {
            self.hammers.release(pair, &request.key);
            let found = atoms
                .iter()
                .any(|atom| atom.kind == request.key.kind && atom.id == request.key.id);
            if !found {
                debug!(pair = %pair, atom = %request.key, "hammer found nothing");
            }
            self.events.emit(SyncEvent::HammerReturned {
                workspace_id: pair.workspace_id.clone(),
                change_set_id: pair.change_set_id.clone(),
                kind: request.key.kind,
                id: request.key.id.clone(),
                found,
            });
        }
    }

    // ---- Patch ----

    fn after_reconcile(&self, pair: &PairKey, reconciliation: Reconciliation) {
        let change_set = &pair.change_set_id;
        for change in reconciliation.changes() {
            let document = if change.removed { None } else { change.document.as_ref() };
            self.projections.apply(change_set, &change.atom.key(), document);
            self.events.emit(SyncEvent::AtomUpdated {
                workspace_id: pair.workspace_id.clone(),
                change_set_id: change_set.clone(),
                kind: change.atom.kind,
                id: change.atom.id.clone(),
                checksum: change.atom.checksum.clone(),
                removed: change.removed,
            });
        }
        info!(
            pair = %pair,
            index = %reconciliation.index_checksum,
            written = reconciliation.written.len(),
            registered = reconciliation.registered.len(),
            removed = reconciliation.removed.len(),
            hammer = reconciliation.hammer.len(),
            skipped = reconciliation.skipped,
            "applied batch"
        );
        self.invalidate(&Scope::from(pair.clone()), reconciliation.touched());
        let hammers = reconciliation
            .hammer
            .into_iter()
            .map(|r| HammerRequest::new(pair.clone(), r.key(), Some(r.checksum)))
            .collect();
        self.request_hammers(hammers);
    }

    fn apply_change_set_batch(&self, batch: &PatchBatch) {
        let pair = batch.meta.pair();
        match reconcile_batch(&self.store, batch, None) {
            Ok(reconciliation) => self.after_reconcile(&pair, reconciliation),
            Err(e) => error!(
                pair = %pair,
                index = %batch.meta.to_index_checksum,
                error = %e,
                "batch failed, skipped"
            ),
        }
    }

    fn apply_index_update(&self, update: &IndexUpdate) {
        let pair = update.meta.pair();
        match reconcile_index_update(&self.store, update) {
            Ok(IndexUpdateOutcome::Applied(reconciliation)) => {
                self.after_reconcile(&pair, reconciliation)
            }
            Ok(IndexUpdateOutcome::NeedsColdStart) => {
                info!(pair = %pair, "index update needs a cold start");
                let job = BulkJob::ColdStart {
                    workspace: pair.workspace_id.clone(),
                    restarts: 0,
                    done: None,
                };
                self.push_bulk(&Scope::from(pair), job);
            }
            Err(e) => error!(pair = %pair, error = %e, "index update failed, skipped"),
        }
    }

    fn apply_deployment_batch(&self, batch: &DeploymentPatchBatch) {
        match reconcile_deployment_batch(&self.store, batch) {
            Ok(reconciliation) => {
                self.invalidate(&Scope::Deployment, reconciliation.changed);
                match &batch.meta.workspace_id {
                    Some(workspace) => self.fetch_globals(workspace.clone(), reconciliation.fetch),
                    None if !reconciliation.fetch.is_empty() => {
                        warn!(
                            missing = reconciliation.fetch.len(),
                            "no workspace to fetch deployment atoms through"
                        );
                    }
                    None => {}
                }
            }
            Err(e) => error!(error = %e, "deployment batch failed, skipped"),
        }
    }

    fn apply_deployment_index(&self, update: &DeploymentIndexUpdate) {
        match reconcile_deployment_index(&self.store, update) {
            Ok(Some(reconciliation)) => {
                self.invalidate(&Scope::Deployment, reconciliation.changed);
                if let Some(workspace) = &update.meta.workspace_id {
                    self.fetch_globals(workspace.clone(), reconciliation.fetch);
                }
            }
            Ok(None) => match &update.meta.workspace_id {
                Some(workspace) => {
                    let job = BulkJob::ColdStart {
                        workspace: workspace.clone(),
                        restarts: 0,
                        done: None,
                    };
                    self.push_bulk(&Scope::Deployment, job);
                }
                None => warn!("deployment index cannot be patched and names no workspace"),
            },
            Err(e) => error!(error = %e, "deployment index update failed, skipped"),
        }
    }

    /// Rebuild a change-set's projections from its current index
    pub(crate) fn rebuild_projections(&self, change_set: &ChangeSetId) -> Result<()> {
        let Some(cs) = self.store.change_set(change_set)? else {
            self.projections.drop_change_set(change_set);
            return Ok(());
        };
        let mut documents = Vec::new();
        for member in self.store.index_members(&cs.index_checksum)? {
            if !member.kind.is_computed() {
                continue;
            }
            if let Some(atom) = self.store.get_atom(&member)? {
                documents.push((member.key(), atom.to_value()?));
            }
        }
        self.projections
            .rebuild(change_set, documents.iter().map(|(key, document)| (key.clone(), document)));
        Ok(())
    }
}

/// Index of `pair` that fetched atoms may be registered in.
///
/// A push that starts from the current index advances the change-set to
/// the pushed index; a push naming the current index writes into it. Any
/// other write lands in the current index, after copying it to a private
/// checksum if another change-set points at it.
fn writable_index(
    txn: &StoreTxn,
    pair: &PairKey,
    current: String,
    push: Option<(&str, &str)>,
) -> Result<String> {
    let change_set = &pair.change_set_id;
    if let Some((to, from)) = push {
        if to == current {
            return Ok(current);
        }
        if from == current {
            txn.ensure_index(to, &[Some(from)], Some(change_set))?;
            txn.advance_change_set(&pair.workspace_id, change_set, to)?;
            debug!(pair = %pair, from, to, "push advanced change set");
            return Ok(to.to_string());
        }
        debug!(pair = %pair, to, current = %current, "push for another index");
    }
    if !txn.index_shared(&current, change_set)? {
        return Ok(current);
    }
    let private = format!("{current}~{}", Uuid::new_v4().simple());
    txn.ensure_index(&private, &[Some(current.as_str())], Some(change_set))?;
    txn.advance_change_set(&pair.workspace_id, change_set, &private)?;
    debug!(pair = %pair, shared = %current, index = %private, "copied shared index");
    Ok(private)
}

#[async_trait]
impl LaneRunner for EngineInner {
    type Bulk = BulkJob;
    type Patch = PatchJob;
    type Hammer = HammerJob;

    fn queue(&self) -> &QueueOrchestrator<Self> {
        &self.queue
    }

    fn is_stopped(&self) -> bool {
        self.root.is_cancelled()
    }

    async fn run_bulk(&self, scope: &Scope, job: BulkJob) {
        match job {
            BulkJob::ColdStart {
                workspace,
                restarts,
                done,
            } => {
                let span = info_span!("cold_start", scope = %scope, restarts);
                let result = self.cold_start_scope(scope, &workspace).instrument(span).await;
                let outcome = match result {
                    Ok(outcome) => outcome,
                    Err(Error::Cancelled) => ColdStartOutcome::Cancelled,
                    Err(e)
                        if e.is_retryable() && restarts < self.config.cold_start.max_restarts =>
                    {
                        warn!(scope = %scope, error = %e, "cold start failed, restarting");
                        let job = BulkJob::ColdStart {
                            workspace,
                            restarts: restarts + 1,
                            done,
                        };
                        self.push_bulk(scope, job);
                        return;
                    }
                    Err(e) => {
                        error!(scope = %scope, error = %e, "cold start failed");
                        ColdStartOutcome::Failed(e.to_string())
                    }
                };
                self.events.emit(SyncEvent::ColdStartFinished {
                    workspace_id: workspace,
                    change_set_id: match scope {
                        Scope::ChangeSet(pair) => Some(pair.change_set_id.clone()),
                        Scope::Deployment => None,
                    },
                    outcome: outcome.clone(),
                });
                if let Some(done) = done {
                    let _ = done.send(outcome);
                }
            }
            BulkJob::Ragnarok { restart, done } => {
                let result = match scope {
                    Scope::ChangeSet(pair) => self.ragnarok(pair, restart).await,
                    Scope::Deployment => Err(Error::internal("ragnarok needs a change set")),
                };
                let _ = done.send(result);
            }
        }
    }

    async fn run_patch(&self, scope: &Scope, job: PatchJob) {
        match job {
            PatchJob::Batch(batch) => {
                let span = info_span!(
                    "patch_batch",
                    scope = %scope,
                    to = %batch.meta.to_index_checksum
                );
                span.in_scope(|| self.apply_change_set_batch(&batch));
            }
            PatchJob::IndexUpdate(update) => {
                let span = info_span!(
                    "index_update",
                    scope = %scope,
                    to = %update.meta.to_index_checksum
                );
                span.in_scope(|| self.apply_index_update(&update));
            }
            PatchJob::DeploymentBatch(batch) => {
                let span = info_span!("deployment_batch", to = %batch.meta.to_index_checksum);
                span.in_scope(|| self.apply_deployment_batch(&batch));
            }
            PatchJob::DeploymentIndexUpdate(update) => {
                let span = info_span!(
                    "deployment_index_update",
                    to = %update.meta.to_index_checksum
                );
                span.in_scope(|| self.apply_deployment_index(&update));
            }
        }
    }

    async fn run_hammer(&self, scope: &Scope, job: HammerJob) {
        match (scope, job) {
            (Scope::ChangeSet(pair), HammerJob::Fetched { requests, result }) => {
                let atoms = match result {
                    Ok(atoms) => atoms,
                    Err(e) => {
                        warn!(pair = %pair, count = requests.len(), error = %e, "hammer failed");
                        Vec::new()
                    }
                };
                if let Err(e) = self.apply_fetched(pair, &atoms, None) {
                    error!(pair = %pair, error = %e, "could not store hammer result");
                }
                self.hammer_returned(pair, &requests, &atoms);
            }
            (Scope::ChangeSet(pair), HammerJob::Local(request, atom)) => {
                debug!(pair = %pair, atom = %request.key, "wanted version already stored");
                if let Err(e) = self.apply_fetched(pair, std::slice::from_ref(&atom), None) {
                    error!(pair = %pair, error = %e, "could not register stored atom");
                }
            }
            (Scope::ChangeSet(pair), HammerJob::Pushed(push)) => {
                let atom = push.atom;
                let kind: AtomKind = match atom.kind.parse() {
                    Ok(kind) => kind,
                    Err(e) => {
                        debug!(error = %e, "ignoring pushed object");
                        return;
                    }
                };
                let result = Atom::from_value(kind, atom.id, atom.to_checksum, &push.data)
                    .map_err(Error::from)
                    .and_then(|object| {
                        self.apply_fetched(
                            pair,
                            &[object],
                            Some((&atom.to_index_checksum, &atom.from_index_checksum)),
                        )
                    });
                if let Err(e) = result {
                    error!(pair = %pair, error = %e, "could not store pushed object");
                }
            }
            (Scope::Deployment, HammerJob::Globals { requested, result }) => match result {
                Ok(atoms) => {
                    let stored = self.store.transact(|txn| -> Result<()> {
                        for atom in &atoms {
                            txn.put_global(atom)?;
                        }
                        Ok(())
                    });
                    match stored {
                        Ok(()) => self.invalidate(scope, atoms.iter().map(Atom::key).collect()),
                        Err(e) => error!(error = %e, "could not store deployment atoms"),
                    }
                    if atoms.len() < requested.len() {
                        debug!(
                            missing = requested.len() - atoms.len(),
                            "deployment atoms not found"
                        );
                    }
                }
                Err(e) => warn!(count = requested.len(), error = %e, "deployment fetch failed"),
            },
            (scope, _) => warn!(scope = %scope, "hammer job does not belong to this scope"),
        }
    }

    async fn run_invalidations(&self, scope: &Scope, keys: Vec<AtomKey>) {
        debug!(scope = %scope, count = keys.len(), "dispatching invalidations");
        for key in keys {
            let event = match scope {
                Scope::ChangeSet(pair) => SyncEvent::CacheBust {
                    workspace_id: pair.workspace_id.clone(),
                    change_set_id: pair.change_set_id.clone(),
                    kind: key.kind,
                    id: key.id,
                },
                Scope::Deployment => SyncEvent::GlobalUpdated {
                    kind: key.kind,
                    id: key.id,
                },
            };
            self.events.emit(event);
        }
    }
}

/// Everything stored for one change-set
#[derive(Debug, Clone)]
pub struct ChangeSetDump {
    pub change_set: ChangeSet,
    pub atoms: Vec<Atom>,
}

/// Handle to a running synchronization engine
pub struct SyncEngine {
    inner: Arc<EngineInner>,
    lease: LeaseKeeper,
}

impl SyncEngine {
    /// Open the store named by the configuration and start the engine
    pub fn open(
        config: SyncConfig,
        remote: Arc<dyn RemoteApi>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SyncEvent>)> {
        let store = AtomStore::open(&config.store.path)?;
        Self::start(config, Arc::new(store), remote)
    }

    /// Take the writer lease and start the engine on an open store
    pub fn start(
        config: SyncConfig,
        store: Arc<AtomStore>,
        remote: Arc<dyn RemoteApi>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SyncEvent>)> {
        let (events, rx) = EventSink::channel();
        let root = CancellationToken::new();
        let holder = format!("atomsync-{}", Uuid::new_v4());
        let lease = LeaseKeeper::start(
            Arc::clone(&store),
            holder,
            config.lease.clone(),
            events.clone(),
            root.clone(),
        )?;
        let inner = EngineInner::new(config, store, remote, events, root);
        info!(holder = %lease.holder(), "sync engine started");
        Ok((Self { inner, lease }, rx))
    }

    /// Queue one decoded inbound message
    pub fn handle_message(&self, message: InboundMessage) -> Result<()> {
        if self.inner.root.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.inner.dispatch(message);
        Ok(())
    }

    /// Decode and queue one JSON inbound message
    pub fn handle_json(&self, text: &str) -> Result<()> {
        self.handle_message(InboundMessage::parse(text)?)
    }

    /// Full resynchronization of one change-set
    pub async fn cold_start(
        &self,
        workspace: &WorkspaceId,
        change_set: &ChangeSetId,
    ) -> ColdStartOutcome {
        let pair = PairKey::new(workspace.clone(), change_set.clone());
        self.bulk_cold_start(Scope::from(pair), workspace).await
    }

    /// Full resynchronization of the deployment-scoped atoms
    pub async fn deployment_cold_start(&self, workspace: &WorkspaceId) -> ColdStartOutcome {
        self.bulk_cold_start(Scope::Deployment, workspace).await
    }

    async fn bulk_cold_start(&self, scope: Scope, workspace: &WorkspaceId) -> ColdStartOutcome {
        let (done, rx) = oneshot::channel();
        let job = BulkJob::ColdStart {
            workspace: workspace.clone(),
            restarts: 0,
            done: Some(done),
        };
        self.inner.push_bulk(&scope, job);
        rx.await.unwrap_or(ColdStartOutcome::Cancelled)
    }

    /// Cold start every open change-set: the default one first, the rest
    /// with bounded concurrency.
    pub async fn cold_start_workspace(
        &self,
        workspace: &WorkspaceId,
    ) -> Result<Vec<(ChangeSetId, ColdStartOutcome)>> {
        let open = self
            .inner
            .hammers
            .with_retry("open change sets", &self.inner.root, || {
                self.inner.remote.list_open_change_sets(workspace)
            })
            .await?;
        let default = open.default_change_set_id;
        let mut outcomes = vec![(default.clone(), self.cold_start(workspace, &default).await)];

        let others: Vec<ChangeSetId> = open
            .change_sets
            .into_iter()
            .map(|summary| summary.id)
            .filter(|id| *id != default)
            .collect();
        let concurrency = self.inner.config.cold_start.open_change_set_concurrency.max(1);
        let rest: Vec<_> = futures::stream::iter(others)
            .map(|change_set| async move {
                let outcome = self.cold_start(workspace, &change_set).await;
                (change_set, outcome)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;
        outcomes.extend(rest);
        Ok(outcomes)
    }

    /// Cancel a running cold start; returns whether one was running
    pub fn cancel_cold_start(&self, workspace: &WorkspaceId, change_set: &ChangeSetId) -> bool {
        let scope = Scope::from(PairKey::new(workspace.clone(), change_set.clone()));
        self.inner.cancel_bulk(&scope)
    }

    /// Drop everything a change-set owns, optionally followed by a cold start
    pub async fn ragnarok(
        &self,
        workspace: &WorkspaceId,
        change_set: &ChangeSetId,
        restart: bool,
    ) -> Result<(RagnarokReport, Option<ColdStartOutcome>)> {
        let (done, rx) = oneshot::channel();
        let scope = Scope::from(PairKey::new(workspace.clone(), change_set.clone()));
        self.inner.push_bulk(&scope, BulkJob::Ragnarok { restart, done });
        rx.await.map_err(|_| Error::Cancelled)?
    }

    /// Branch `new` off `from`: both point at the same index until the next
    /// patch for `new` copies it.
    pub fn link_change_set(
        &self,
        workspace: &WorkspaceId,
        from: &ChangeSetId,
        new: &ChangeSetId,
    ) -> Result<()> {
        let created = self.inner.store.transact(|txn| -> Result<bool> {
            let Some(source) = txn.change_set(from)? else {
                return Err(Error::ChangeSetNotFound(from.to_string()));
            };
            Ok(txn.ensure_change_set(workspace, new, &source.index_checksum)?)
        })?;
        if created {
            info!(workspace = %workspace, from = %from, change_set = %new, "linked change set");
            self.inner.rebuild_projections(new)?;
        }
        Ok(())
    }

    /// Forget a closed change-set; its indexes become collectable
    pub fn prune_change_set(
        &self,
        workspace: &WorkspaceId,
        change_set: &ChangeSetId,
    ) -> Result<bool> {
        let scope = Scope::from(PairKey::new(workspace.clone(), change_set.clone()));
        self.inner.queue.clear_scope(&scope);
        self.inner.projections.drop_change_set(change_set);
        Ok(self.inner.store.prune_change_set(change_set)?)
    }

    pub fn dump_change_set(&self, change_set: &ChangeSetId) -> Result<ChangeSetDump> {
        let Some(row) = self.inner.store.change_set(change_set)? else {
            return Err(Error::ChangeSetNotFound(change_set.to_string()));
        };
        Ok(ChangeSetDump {
            change_set: row,
            atoms: self.inner.store.dump_change_set(change_set)?,
        })
    }

    /// Drop the contents of every table
    pub fn reset_store(&self) -> Result<()> {
        self.inner.store.reset()?;
        self.inner.projections.clear();
        warn!("store reset");
        Ok(())
    }

    pub fn collect_garbage(&self) -> Result<GcReport> {
        Ok(self.inner.store.collect_garbage()?)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        Ok(self.inner.store.stats()?)
    }

    /// Bearer token for every later request of `workspace`
    pub fn set_bearer(&self, workspace: &WorkspaceId, token: impl Into<String>) {
        self.inner.remote.set_bearer(workspace, token.into());
    }

    /// Fetch `(kind, id)` for a change-set out of band
    pub fn hammer(
        &self,
        workspace: &WorkspaceId,
        change_set: &ChangeSetId,
        key: AtomKey,
        checksum: Option<String>,
    ) {
        let pair = PairKey::new(workspace.clone(), change_set.clone());
        self.inner.request_hammers(vec![HammerRequest::new(pair, key, checksum)]);
    }

    /// Resolve `(kind, id)` with references expanded. `None` means not
    /// present yet; a hammer has been fired for it.
    pub fn get(
        &self,
        workspace: &WorkspaceId,
        change_set: &ChangeSetId,
        key: &AtomKey,
    ) -> Result<Option<Value>> {
        self.inner.get(&PairKey::new(workspace.clone(), change_set.clone()), key)
    }

    /// Resolve a list kind with every member reference replaced by the member
    pub fn get_list(
        &self,
        workspace: &WorkspaceId,
        change_set: &ChangeSetId,
        key: &AtomKey,
    ) -> Result<Option<Value>> {
        if !key.kind.is_list() {
            return Err(Error::Configuration(format!("{} is not a list kind", key.kind)));
        }
        self.get(workspace, change_set, key)
    }

    pub fn get_global(&self, key: &AtomKey) -> Result<Option<Value>> {
        self.inner.get_global(key)
    }

    pub fn change_set_exists(
        &self,
        _workspace: &WorkspaceId,
        change_set: &ChangeSetId,
    ) -> Result<bool> {
        Ok(self.inner.store.change_set_exists(change_set)?)
    }

    #[must_use]
    pub fn outgoing_connections(
        &self,
        change_set: &ChangeSetId,
        component: &str,
    ) -> Vec<Connection> {
        self.inner.projections.outgoing_connections(change_set, component)
    }

    /// Management connections arriving at `component`
    #[must_use]
    pub fn incoming_connections_for(
        &self,
        change_set: &ChangeSetId,
        component: &str,
    ) -> Vec<Connection> {
        self.inner.projections.incoming_management(change_set, component)
    }

    #[must_use]
    pub fn default_subscriptions(&self, change_set: &ChangeSetId) -> DefaultSubscriptions {
        self.inner.projections.default_subscriptions(change_set)
    }

    /// Wait until every lane of every scope is idle
    pub async fn wait_idle(&self) {
        self.inner.queue.wait_idle().await;
    }

    /// Whether the engine stopped, after `shutdown` or a lost lease
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.root.is_cancelled()
    }

    /// Stop the workers, abort network calls and release the lease
    pub async fn shutdown(self) -> Result<()> {
        self.inner.root.cancel();
        self.inner.queue.wait_idle().await;
        self.lease.release()?;
        info!("sync engine stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, component, config, create, drain, patch};
    use serde_json::json;
    use std::time::Duration;

    fn ws() -> WorkspaceId {
        WorkspaceId::new("w1")
    }

    fn cs(id: &str) -> ChangeSetId {
        ChangeSetId::new(id)
    }

    fn replace(path: &str, value: Value) -> Value {
        json!([{"op": "replace", "path": path, "value": value}])
    }

    async fn seed(h: &Harness) {
        h.engine
            .handle_message(patch(
                "head",
                "0",
                "i1",
                &[("Component", "c1", "0", "a", create(json!({"x": 1})))],
            ))
            .unwrap();
        h.engine.wait_idle().await;
    }

    fn members(h: &Harness, index: &str) -> Vec<AtomRef> {
        h.store().index_members(index).unwrap()
    }

    #[tokio::test]
    async fn test_replayed_batch_is_idempotent() {
        let h = Harness::new();
        seed(&h).await;
        let before = members(&h, "i1");
        seed(&h).await;
        assert_eq!(members(&h, "i1"), before);
        assert_eq!(
            h.engine.get(&ws(), &cs("head"), &component("c1")).unwrap(),
            Some(json!({"x": 1}))
        );
    }

    #[tokio::test]
    async fn test_patch_chain_then_remove() {
        let mut h = Harness::new();
        seed(&h).await;
        h.engine
            .handle_message(patch(
                "head",
                "i1",
                "i2",
                &[("Component", "c1", "a", "b", replace("/x", json!(2)))],
            ))
            .unwrap();
        h.engine
            .handle_message(patch(
                "head",
                "i2",
                "i3",
                &[("Component", "c1", "b", "c", replace("/x", json!(3)))],
            ))
            .unwrap();
        h.engine.wait_idle().await;
        assert_eq!(
            h.engine.get(&ws(), &cs("head"), &component("c1")).unwrap(),
            Some(json!({"x": 3}))
        );
        assert_eq!(members(&h, "i3"), vec![AtomRef::new(AtomKind::Component, "c1", "c")]);

        drain(&mut h.events);
        h.engine
            .handle_message(patch(
                "head",
                "i3",
                "i4",
                &[("Component", "c1", "c", "0", Value::Null)],
            ))
            .unwrap();
        h.engine.wait_idle().await;
        assert!(members(&h, "i4").is_empty());
        let events = drain(&mut h.events);
        assert!(events.iter().any(
            |e| matches!(e, SyncEvent::AtomUpdated { removed: true, id, .. } if id == "c1")
        ));
        assert!(events.iter().any(|e| matches!(e, SyncEvent::CacheBust { id, .. } if id == "c1")));
    }

    #[tokio::test]
    async fn test_missing_predecessor_is_recovered_by_hammer() {
        let h = Harness::new();
        seed(&h).await;
        h.remote.put_atom("head", AtomKind::Component, "c2", "q", json!({"y": 2}));
        // c2@p was never seen here
        h.engine
            .handle_message(patch(
                "head",
                "i1",
                "i2",
                &[("Component", "c2", "p", "q", replace("/y", json!(2)))],
            ))
            .unwrap();
        h.engine.wait_idle().await;

        assert_eq!(h.remote.atom_calls(), 1);
        assert_eq!(
            h.engine.get(&ws(), &cs("head"), &component("c2")).unwrap(),
            Some(json!({"y": 2}))
        );
        let mut refs = members(&h, "i2");
        refs.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(
            refs,
            vec![
                AtomRef::new(AtomKind::Component, "c1", "a"),
                AtomRef::new(AtomKind::Component, "c2", "q"),
            ]
        );
    }

    #[tokio::test]
    async fn test_branch_does_not_leak_into_source() {
        let h = Harness::new();
        seed(&h).await;
        h.engine.link_change_set(&ws(), &cs("head"), &cs("feature")).unwrap();
        assert!(h.engine.change_set_exists(&ws(), &cs("feature")).unwrap());

        h.engine
            .handle_message(patch(
                "feature",
                "i1",
                "f2",
                &[("Component", "c1", "a", "b", replace("/x", json!(9)))],
            ))
            .unwrap();
        h.engine.wait_idle().await;

        assert_eq!(
            h.engine.get(&ws(), &cs("feature"), &component("c1")).unwrap(),
            Some(json!({"x": 9}))
        );
        assert_eq!(
            h.engine.get(&ws(), &cs("head"), &component("c1")).unwrap(),
            Some(json!({"x": 1}))
        );
        assert_eq!(members(&h, "i1"), vec![AtomRef::new(AtomKind::Component, "c1", "a")]);
    }

    #[tokio::test]
    async fn test_hammer_on_branch_does_not_leak_into_source() {
        let h = Harness::new();
        seed(&h).await;
        h.engine.link_change_set(&ws(), &cs("head"), &cs("feature")).unwrap();
        h.remote.put_atom("feature", AtomKind::Component, "c1", "b", json!({"x": 99}));
        h.remote.put_atom("feature", AtomKind::Component, "c2", "q", json!({"y": 2}));

        h.engine.hammer(&ws(), &cs("feature"), component("c1"), Some("b".into()));
        h.engine.hammer(&ws(), &cs("feature"), component("c2"), Some("q".into()));
        h.engine.wait_idle().await;

        assert_eq!(
            h.engine.get(&ws(), &cs("head"), &component("c1")).unwrap(),
            Some(json!({"x": 1}))
        );
        assert_eq!(members(&h, "i1"), vec![AtomRef::new(AtomKind::Component, "c1", "a")]);
        assert_eq!(
            h.engine.get(&ws(), &cs("feature"), &component("c1")).unwrap(),
            Some(json!({"x": 99}))
        );

        let feature = h.store().change_set(&cs("feature")).unwrap().unwrap();
        assert!(feature.index_checksum.starts_with("i1~"));
        let forked = members(&h, &feature.index_checksum);
        assert_eq!(forked.len(), 2);
        assert!(forked.contains(&AtomRef::new(AtomKind::Component, "c1", "b")));
        assert!(forked.contains(&AtomRef::new(AtomKind::Component, "c2", "q")));
        assert_eq!(h.store().change_set(&cs("head")).unwrap().unwrap().index_checksum, "i1");
    }

    #[tokio::test]
    async fn test_hammer_on_unshared_index_writes_in_place() {
        let h = Harness::new();
        seed(&h).await;
        h.remote.put_atom("head", AtomKind::Component, "c2", "q", json!({}));

        h.engine.hammer(&ws(), &cs("head"), component("c2"), Some("q".into()));
        h.engine.wait_idle().await;

        assert_eq!(h.store().change_set(&cs("head")).unwrap().unwrap().index_checksum, "i1");
        assert_eq!(members(&h, "i1").len(), 2);
    }

    #[tokio::test]
    async fn test_invalidations_wait_for_in_flight_hammer() {
        let mut h = Harness::new();
        seed(&h).await;
        drain(&mut h.events);
        h.remote.put_atom("head", AtomKind::Component, "c2", "b", json!({}));
        h.remote.hold();

        h.engine.hammer(&ws(), &cs("head"), component("c2"), None);
        h.engine
            .handle_message(patch(
                "head",
                "i1",
                "i2",
                &[("Component", "c3", "0", "c", create(json!({})))],
            ))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let early = drain(&mut h.events);
        assert!(early.iter().any(|e| matches!(e, SyncEvent::AtomUpdated { id, .. } if id == "c3")));
        assert!(!early.iter().any(|e| matches!(e, SyncEvent::CacheBust { .. })));

        h.remote.release();
        h.engine.wait_idle().await;
        let late = drain(&mut h.events);
        let busted: Vec<&str> = late
            .iter()
            .filter_map(|e| match e {
                SyncEvent::CacheBust { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect();
        assert!(busted.contains(&"c2"));
        assert!(busted.contains(&"c3"));
        // c2 landed in the index the patch advanced to
        assert!(h.engine.get(&ws(), &cs("head"), &component("c2")).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_identical_hammers_fetch_once() {
        let h = Harness::new();
        seed(&h).await;
        h.remote.put_atom("head", AtomKind::Component, "c2", "b", json!({}));
        h.remote.hold();
        h.engine.hammer(&ws(), &cs("head"), component("c2"), None);
        h.engine.hammer(&ws(), &cs("head"), component("c2"), Some("b".into()));
        h.remote.release();
        h.engine.wait_idle().await;
        assert_eq!(h.remote.atom_calls(), 1);
        assert_eq!(h.remote.multi_calls(), 0);
    }

    #[tokio::test]
    async fn test_hammer_for_stored_version_skips_the_network() {
        let h = Harness::new();
        seed(&h).await;
        // c1@a is stored; a new change-set pointing at an empty index wants it
        h.engine
            .handle_message(patch(
                "other",
                "0",
                "o1",
                &[("Component", "c9", "0", "z", create(json!({})))],
            ))
            .unwrap();
        h.engine.wait_idle().await;
        h.engine.hammer(&ws(), &cs("other"), component("c1"), Some("a".into()));
        h.engine.wait_idle().await;
        assert_eq!(h.remote.atom_calls(), 0);
        assert_eq!(
            h.engine.get(&ws(), &cs("other"), &component("c1")).unwrap(),
            Some(json!({"x": 1}))
        );
    }

    #[tokio::test]
    async fn test_mjolnir_push_creates_change_set() {
        let h = Harness::new();
        seed(&h).await;
        let push = json!({
            "kind": "MJOLNIR",
            "atom": {"kind": "Component", "id": "c5", "toChecksum": "e", "workspaceId": "w1",
                     "changeSetId": "fresh", "toIndexChecksum": "n1", "fromIndexChecksum": "i1"},
            "data": {"pushed": true}
        });
        h.engine.handle_json(&push.to_string()).unwrap();
        h.engine.wait_idle().await;

        assert_eq!(h.store().change_set(&cs("fresh")).unwrap().unwrap().index_checksum, "n1");
        assert_eq!(
            h.engine.get(&ws(), &cs("fresh"), &component("c5")).unwrap(),
            Some(json!({"pushed": true}))
        );
        // the index was copied from its predecessor
        assert_eq!(
            h.engine.get(&ws(), &cs("fresh"), &component("c1")).unwrap(),
            Some(json!({"x": 1}))
        );
    }

    #[tokio::test]
    async fn test_mjolnir_push_advances_known_change_set() {
        let h = Harness::new();
        seed(&h).await;
        h.engine.link_change_set(&ws(), &cs("head"), &cs("feature")).unwrap();
        let push = json!({
            "kind": "MJOLNIR",
            "atom": {"kind": "Component", "id": "c5", "toChecksum": "e", "workspaceId": "w1",
                     "changeSetId": "head", "toIndexChecksum": "n2", "fromIndexChecksum": "i1"},
            "data": {"pushed": true}
        });
        h.engine.handle_json(&push.to_string()).unwrap();
        h.engine.wait_idle().await;

        assert_eq!(h.store().change_set(&cs("head")).unwrap().unwrap().index_checksum, "n2");
        assert_eq!(members(&h, "n2").len(), 2);
        assert_eq!(members(&h, "i1"), vec![AtomRef::new(AtomKind::Component, "c1", "a")]);
        assert_eq!(h.store().change_set(&cs("feature")).unwrap().unwrap().index_checksum, "i1");
    }

    #[tokio::test]
    async fn test_projections_follow_patches() {
        let h = Harness::new();
        let connections = json!({"connections": [
            {"kind": "prop", "fromComponentId": "a", "toComponentId": "b"}
        ]});
        h.engine
            .handle_message(patch(
                "head",
                "0",
                "i1",
                &[("IncomingConnections", "b", "0", "k", create(connections))],
            ))
            .unwrap();
        h.engine.wait_idle().await;
        assert_eq!(h.engine.outgoing_connections(&cs("head"), "a").len(), 1);

        // a branch sees the same projections
        h.engine.link_change_set(&ws(), &cs("head"), &cs("feature")).unwrap();
        assert_eq!(h.engine.outgoing_connections(&cs("feature"), "a").len(), 1);

        h.engine
            .handle_message(patch(
                "head",
                "i1",
                "i2",
                &[("IncomingConnections", "b", "k", "0", Value::Null)],
            ))
            .unwrap();
        h.engine.wait_idle().await;
        assert!(h.engine.outgoing_connections(&cs("head"), "a").is_empty());
        assert_eq!(h.engine.outgoing_connections(&cs("feature"), "a").len(), 1);
    }

    #[tokio::test]
    async fn test_prune_dump_and_collect() {
        let h = Harness::new();
        seed(&h).await;
        h.engine.link_change_set(&ws(), &cs("head"), &cs("feature")).unwrap();
        h.engine
            .handle_message(patch(
                "feature",
                "i1",
                "f2",
                &[("Component", "c1", "a", "b", replace("/x", json!(5)))],
            ))
            .unwrap();
        h.engine.wait_idle().await;

        let dump = h.engine.dump_change_set(&cs("feature")).unwrap();
        assert_eq!(dump.change_set.index_checksum, "f2");
        assert_eq!(dump.atoms.len(), 1);
        assert_eq!(dump.atoms[0].checksum, "b");

        assert!(h.engine.prune_change_set(&ws(), &cs("feature")).unwrap());
        assert!(!h.engine.change_set_exists(&ws(), &cs("feature")).unwrap());
        assert!(h.engine.outgoing_connections(&cs("feature"), "a").is_empty());

        let report = h.engine.collect_garbage().unwrap();
        assert_eq!(report.indexes_removed, 1);
        assert_eq!(report.atoms_removed, 1);
        assert!(h.store().index_exists("i1").unwrap());
        assert!(matches!(
            h.engine.dump_change_set(&cs("feature")),
            Err(Error::ChangeSetNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cold_start_workspace_goes_head_first() {
        let h = Harness::new();
        h.remote.put_index("head", "i1", &[]);
        h.remote.put_index("cs2", "j1", &[]);
        h.remote.put_index("cs3", "k1", &[]);
        h.remote.set_open_change_sets("head", &["cs2", "cs3"]);

        let outcomes = h.engine.cold_start_workspace(&ws()).await.unwrap();
        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].0, cs("head"));
        assert!(outcomes.iter().all(|(_, outcome)| outcome.is_completed()));
        assert!(h.engine.change_set_exists(&ws(), &cs("cs3")).unwrap());
    }

    #[tokio::test]
    async fn test_bearer_reaches_the_remote() {
        let h = Harness::new();
        h.engine.set_bearer(&ws(), "token-1");
        assert_eq!(h.remote.bearer("w1").as_deref(), Some("token-1"));
    }

    #[tokio::test]
    async fn test_reset_store_empties_everything() {
        let h = Harness::new();
        seed(&h).await;
        h.engine.reset_store().unwrap();
        assert!(!h.engine.change_set_exists(&ws(), &cs("head")).unwrap());
        assert_eq!(h.engine.stats().unwrap().atoms, 0);
    }

    #[tokio::test]
    async fn test_second_engine_is_refused_and_shutdown_releases() {
        let h = Harness::new();
        let remote: Arc<dyn RemoteApi> = Arc::clone(&h.remote) as Arc<dyn RemoteApi>;
        let Err(err) = SyncEngine::start(config(), Arc::clone(&h.store), Arc::clone(&remote)) else {
            panic!("second engine started");
        };
        assert!(matches!(err, Error::LeaseHeld { .. }));

        h.engine.shutdown().await.unwrap();
        assert!(h.store.lease().unwrap().is_none());
        let (engine, _events) = SyncEngine::start(config(), Arc::clone(&h.store), remote).unwrap();
        assert!(!engine.is_stopped());
    }

    #[tokio::test]
    async fn test_lost_lease_stops_engine() {
        let mut h = Harness::new();
        h.store.release_lease(h.engine.lease.holder()).unwrap();
        h.store.acquire_lease("intruder", Duration::from_secs(10)).unwrap();

        tokio::time::timeout(Duration::from_secs(2), h.engine.inner.root.cancelled())
            .await
            .unwrap();
        assert!(h.engine.is_stopped());
        assert!(matches!(h.engine.handle_json("{}"), Err(Error::Cancelled)));
        let events = drain(&mut h.events);
        assert!(events.contains(&SyncEvent::LeaseLost { holder: "intruder".into() }));
    }
}
