//! ColdStartCoordinator: full resynchronization of a change-set or of the
//! deployment-scoped atoms, and the ragnarok teardown.
//!
//! Cold starts run in the bulk lane of their scope, so no patch or hammer
//! result for that scope is applied while one is in progress. Individual
//! hammers for the pair are frozen meanwhile and either discarded (the
//! cold start brought fresher data) or released when it did not complete.

use crate::engine::EngineInner;
use crate::events::ColdStartOutcome;
use crate::hammer::{BulkFetch, HammerRequest};
use crate::orchestrator::Scope;
use atomsync_client::{ClientResult, IndexEntry, IndexFetch, IndexResponse};
use atomsync_common::{Atom, AtomKey, AtomKind, AtomRef, Error, PairKey, Result, WorkspaceId};
use atomsync_store::{RagnarokReport, StoreError, keys};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Map a cold start result to what callers observe
pub(crate) fn settle(result: Result<ColdStartOutcome>) -> ColdStartOutcome {
    match result {
        Ok(outcome) => outcome,
        Err(Error::Cancelled) => ColdStartOutcome::Cancelled,
        Err(e) => ColdStartOutcome::Failed(e.to_string()),
    }
}

/// Index entries that belong in `scope`'s table
fn wanted_refs(entries: Vec<IndexEntry>, global: bool) -> Vec<AtomRef> {
    let mut wanted = Vec::with_capacity(entries.len());
    for entry in entries {
        if !keys::storable(&[&entry.id, &entry.checksum]) {
            debug!(id = ?entry.id, "skipping index entry with NUL in its key");
            continue;
        }
        match entry.kind.parse::<AtomKind>() {
            Ok(kind) if kind.is_index_descriptor() => {}
            Ok(kind) if kind.is_global() == global => wanted.push(AtomRef::new(
                kind,
                entry.id,
                entry.checksum,
            )),
            Ok(kind) => debug!(kind = %kind, id = %entry.id, "index entry outside scope"),
            Err(e) => debug!(error = %e, "skipping index entry"),
        }
    }
    wanted
}

fn sorted_for_invalidation(keys: HashSet<AtomKey>) -> Vec<AtomKey> {
    let mut keys: Vec<AtomKey> = keys.into_iter().collect();
    keys.sort_by_key(|key| key.kind.is_list());
    keys
}

impl EngineInner {
    /// Cancel the running bulk operation of `scope`
    pub(crate) fn cancel_bulk(&self, scope: &Scope) -> bool {
        match self.bulk_tokens.get(scope) {
            Some(token) => {
                token.cancel();
                info!(scope = %scope, "bulk operation cancelled");
                true
            }
            None => false,
        }
    }

    pub(crate) async fn cold_start_scope(
        &self,
        scope: &Scope,
        workspace: &WorkspaceId,
    ) -> Result<ColdStartOutcome> {
        let cancel = self.root.child_token();
        self.bulk_tokens.insert(scope.clone(), cancel.clone());
        let result = match scope {
            Scope::ChangeSet(pair) => self.cold_start_change_set(pair, &cancel).await,
            Scope::Deployment => self.cold_start_deployment(workspace, &cancel).await,
        };
        self.bulk_tokens.remove(scope);
        result
    }

    async fn cold_start_change_set(
        &self,
        pair: &PairKey,
        cancel: &CancellationToken,
    ) -> Result<ColdStartOutcome> {
        self.hammers.freeze(pair);
        let result = self.sync_change_set(pair, cancel).await;
        let held = self.hammers.thaw(pair);
        match result {
            Ok((outcome @ ColdStartOutcome::Completed { .. }, missing)) => {
                if !held.is_empty() {
                    debug!(
                        pair = %pair,
                        discarded = held.len(),
                        "dropping hammers held during cold start"
                    );
                }
                self.request_hammers(missing);
                Ok(outcome)
            }
            other => {
                self.request_hammers(held);
                other.map(|(outcome, _)| outcome)
            }
        }
    }

    async fn index_fetch<F, Fut>(
        &self,
        what: &str,
        cancel: &CancellationToken,
        call: F,
    ) -> Result<Option<IndexResponse>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ClientResult<IndexFetch>>,
    {
        match self.hammers.with_retry(what, cancel, call).await {
            Ok(IndexFetch::Ready(response)) => Ok(Some(response)),
            Ok(IndexFetch::NotReady) => {
                info!(what, "index not ready");
                Ok(None)
            }
            Err(Error::RemoteRejected { status, message }) => {
                info!(what, status, message = %message, "index rejected, treating as not ready");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Mirror the remote index of `pair`. Returns the outcome and the
    /// members that could not be fetched in bulk.
    async fn sync_change_set(
        &self,
        pair: &PairKey,
        cancel: &CancellationToken,
    ) -> Result<(ColdStartOutcome, Vec<HammerRequest>)> {
        let fetched = self
            .index_fetch("change set index", cancel, || {
                self.remote.fetch_change_set_index(&pair.workspace_id, &pair.change_set_id)
            })
            .await?;
        let Some(response) = fetched else {
            return Ok((ColdStartOutcome::NotReady, Vec::new()));
        };
        let wanted = wanted_refs(response.mv_list()?, false);

        let mut requests = Vec::new();
        for r in &wanted {
            if !self.store.atom_exists(r)? {
                requests.push(HammerRequest::new(pair.clone(), r.key(), Some(r.checksum.clone())));
            }
        }
        let BulkFetch {
            resolved,
            still_missing,
        } = if requests.is_empty() {
            BulkFetch::default()
        } else {
            self.hammers.fetch_bulk(pair, &requests, cancel).await?
        };
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let index = response.index_checksum.clone();
        let descriptor = Atom::from_value(
            AtomKind::MvIndex,
            response.front_end_object.id.clone(),
            index.clone(),
            &response.front_end_object.data,
        )?;
        let resolved_by_key: HashMap<AtomKey, &Atom> =
            resolved.iter().map(|atom| (atom.key(), atom)).collect();
        let change_set = &pair.change_set_id;

        let (changed, members) = self.store.transact(|txn| -> Result<(HashSet<AtomKey>, usize)> {
            let previous = txn.change_set(change_set)?.map(|cs| cs.index_checksum);
            let before: HashMap<AtomKey, String> = match &previous {
                Some(previous) => txn
                    .index_members(previous)?
                    .into_iter()
                    .map(|r| (r.key(), r.checksum))
                    .collect(),
                None => HashMap::new(),
            };
            txn.clear_weak_references(change_set)?;
            txn.ensure_index(&index, &[previous.as_deref()], Some(change_set))?;

            for atom in &resolved {
                txn.put_atom(atom)?;
            }
            let mut desired: HashMap<AtomKey, AtomRef> = HashMap::with_capacity(wanted.len());
            for r in &wanted {
                let key = r.key();
                if let Some(atom) = resolved_by_key.get(&key) {
                    desired.insert(key, atom.atom_ref());
                } else if txn.atom_exists(r)? {
                    desired.insert(key, r.clone());
                }
            }
            for current in txn.index_members(&index)? {
                if !desired.contains_key(&current.key()) {
                    txn.remove_member(&index, &current.key())?;
                }
            }
            for r in desired.values() {
                txn.set_member(&index, r)?;
            }
            txn.put_atom(&descriptor)?;
            txn.advance_change_set(&pair.workspace_id, change_set, &index)?;

            let mut changed: HashSet<AtomKey> = before
                .iter()
                .filter(|(key, checksum)| {
                    desired.get(*key).is_none_or(|r| &r.checksum != *checksum)
                })
                .map(|(key, _)| key.clone())
                .collect();
            changed.extend(
                desired
                    .iter()
                    .filter(|(key, r)| before.get(*key) != Some(&r.checksum))
                    .map(|(key, _)| key.clone()),
            );
            Ok((changed, desired.len()))
        })?;

        self.rebuild_projections(change_set)?;
        self.invalidate(&Scope::from(pair.clone()), sorted_for_invalidation(changed));
        info!(
            pair = %pair,
            index = %index,
            members,
            fetched = resolved.len(),
            missing = still_missing.len(),
            "cold start complete"
        );

        let missing = still_missing
            .into_iter()
            .filter_map(|key| {
                let checksum = wanted.iter().find(|r| r.key() == key).map(|r| r.checksum.clone());
                checksum.map(|checksum| HammerRequest::new(pair.clone(), key, Some(checksum)))
            })
            .collect();
        let outcome = ColdStartOutcome::Completed {
            index_checksum: index,
            members,
            fetched: resolved.len(),
        };
        Ok((outcome, missing))
    }

    async fn cold_start_deployment(
        &self,
        workspace: &WorkspaceId,
        cancel: &CancellationToken,
    ) -> Result<ColdStartOutcome> {
        let fetched = self
            .index_fetch("deployment index", cancel, || {
                self.remote.fetch_deployment_index(workspace)
            })
            .await?;
        let Some(response) = fetched else {
            return Ok(ColdStartOutcome::NotReady);
        };
        let wanted = wanted_refs(response.mv_list()?, true);

        let mut stale = Vec::new();
        for r in &wanted {
            let current = self.store.get_global(&r.key())?;
            if current.is_none_or(|atom| atom.checksum != r.checksum) {
                stale.push(r.key());
            }
        }
        let fetched = if stale.is_empty() {
            BulkFetch::default()
        } else {
            self.hammers.fetch_globals(workspace, &stale, cancel).await?
        };
        if !fetched.still_missing.is_empty() {
            warn!(
                missing = fetched.still_missing.len(),
                "deployment atoms missing from the remote"
            );
        }

        let index = response.index_checksum.clone();
        let descriptor = Atom::from_value(
            AtomKind::DeploymentMvIndex,
            response.front_end_object.id.clone(),
            index.clone(),
            &response.front_end_object.data,
        )?;
        let wanted_keys: HashSet<AtomKey> = wanted.iter().map(AtomRef::key).collect();

        let changed = self.store.transact(|txn| -> Result<HashSet<AtomKey>> {
            let mut changed = HashSet::new();
            for atom in &fetched.resolved {
                txn.put_global(atom)?;
                changed.insert(atom.key());
            }
            for r in txn.global_refs()? {
                if r.kind.is_index_descriptor() || wanted_keys.contains(&r.key()) {
                    continue;
                }
                if txn.remove_global(&r.key())? {
                    changed.insert(r.key());
                }
            }
            txn.put_global(&descriptor)?;
            Ok(changed)
        })?;

        self.invalidate(&Scope::Deployment, sorted_for_invalidation(changed));
        info!(
            index = %index,
            members = wanted.len(),
            fetched = fetched.resolved.len(),
            "deployment cold start complete"
        );
        Ok(ColdStartOutcome::Completed {
            index_checksum: index,
            members: wanted.len(),
            fetched: fetched.resolved.len(),
        })
    }

    /// Drop everything a change-set owns, optionally followed by a cold start
    pub(crate) async fn ragnarok(
        &self,
        pair: &PairKey,
        restart: bool,
    ) -> Result<(RagnarokReport, Option<ColdStartOutcome>)> {
        let report = match self.store.ragnarok(&pair.change_set_id) {
            Ok(report) => report,
            Err(StoreError::ChangeSetNotFound(_)) if restart => RagnarokReport::default(),
            Err(e) => return Err(e.into()),
        };
        self.projections.drop_change_set(&pair.change_set_id);
        let held = self.hammers.thaw(pair);
        if !held.is_empty() {
            debug!(pair = %pair, discarded = held.len(), "dropping held hammers");
        }
        if !restart {
            return Ok((report, None));
        }
        let outcome = settle(
            self.cold_start_scope(&Scope::from(pair.clone()), &pair.workspace_id)
                .await,
        );
        Ok((report, Some(outcome)))
    }
}

#[cfg(test)]
mod tests {
    use crate::events::{ColdStartOutcome, SyncEvent};
    use crate::testing::{Harness, component, drain};
    use atomsync_common::{AtomKey, AtomKind, AtomRef, ChangeSetId, WorkspaceId};
    use serde_json::json;

    fn ws() -> WorkspaceId {
        WorkspaceId::new("w1")
    }

    fn cs(id: &str) -> ChangeSetId {
        ChangeSetId::new(id)
    }

    #[tokio::test]
    async fn test_cold_start_mirrors_remote_index() {
        let mut h = Harness::new();
        h.remote.put_atom("cs1", AtomKind::Component, "c1", "a", json!({"id": "c1"}));
        h.remote.put_atom("cs1", AtomKind::Component, "c2", "b", json!({"id": "c2"}));
        h.remote
            .put_index(
                "cs1",
                "i1",
                &[(AtomKind::Component, "c1", "a"), (AtomKind::Component, "c2", "b")],
            );

        let outcome = h.engine.cold_start(&ws(), &cs("cs1")).await;
        assert_eq!(
            outcome,
            ColdStartOutcome::Completed {
                index_checksum: "i1".into(),
                members: 2,
                fetched: 2,
            }
        );
        h.engine.wait_idle().await;

        let store = h.store();
        assert_eq!(store.change_set(&cs("cs1")).unwrap().unwrap().index_checksum, "i1");
        assert_eq!(store.index_members("i1").unwrap().len(), 2);
        assert!(store.atom_exists(&AtomRef::new(AtomKind::MvIndex, "cs1", "i1")).unwrap());
        assert_eq!(h.remote.multi_calls(), 1);

        let events = drain(&mut h.events);
        assert!(events.iter().any(|e| matches!(
            e,
            SyncEvent::ColdStartFinished { outcome, .. } if outcome.is_completed()
        )));
        assert!(events.iter().any(|e| matches!(e, SyncEvent::CacheBust { id, .. } if id == "c2")));
    }

    #[tokio::test]
    async fn test_second_cold_start_fetches_nothing_and_drops_extras() {
        let h = Harness::new();
        h.remote.put_atom("cs1", AtomKind::Component, "c1", "a", json!({}));
        h.remote.put_atom("cs1", AtomKind::Component, "c2", "b", json!({}));
        h.remote
            .put_index(
                "cs1",
                "i1",
                &[(AtomKind::Component, "c1", "a"), (AtomKind::Component, "c2", "b")],
            );
        assert!(h.engine.cold_start(&ws(), &cs("cs1")).await.is_completed());

        h.remote.put_index("cs1", "i2", &[(AtomKind::Component, "c1", "a")]);
        let outcome = h.engine.cold_start(&ws(), &cs("cs1")).await;
        assert_eq!(
            outcome,
            ColdStartOutcome::Completed {
                index_checksum: "i2".into(),
                members: 1,
                fetched: 0,
            }
        );
        assert_eq!(h.remote.multi_calls(), 1);
        let store = h.store();
        assert_eq!(
            store.index_members("i2").unwrap(),
            vec![AtomRef::new(AtomKind::Component, "c1", "a")]
        );
        // the old index is untouched
        assert_eq!(store.index_members("i1").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_not_ready_changes_nothing() {
        let h = Harness::new();
        h.remote.index_not_ready("cs1");

        let outcome = h.engine.cold_start(&ws(), &cs("cs1")).await;
        assert_eq!(outcome, ColdStartOutcome::NotReady);
        assert!(!h.store().change_set_exists(&cs("cs1")).unwrap());

        // an unknown change-set is rejected, which reads the same way
        assert_eq!(h.engine.cold_start(&ws(), &cs("cs9")).await, ColdStartOutcome::NotReady);
    }

    #[tokio::test]
    async fn test_held_hammers_fire_when_cold_start_fails() {
        let h = Harness::new();
        h.remote.put_atom("cs1", AtomKind::Component, "c1", "a", json!({}));
        h.remote.hold();
        let pending = {
            let engine = &h.engine;
            async move { engine.cold_start(&ws(), &cs("cs1")).await }
        };
        let cancel = async {
            // let the cold start reach the gated index fetch
            tokio::task::yield_now().await;
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            h.engine.hammer(&ws(), &cs("cs1"), component("c1"), Some("a".into()));
            assert!(h.engine.cancel_cold_start(&ws(), &cs("cs1")));
        };
        let (outcome, ()) = tokio::join!(pending, cancel);
        assert_eq!(outcome, ColdStartOutcome::Cancelled);

        h.remote.release();
        h.engine.wait_idle().await;
        // the held hammer fired once the cold start gave up
        assert_eq!(h.remote.atom_calls(), 1);
        assert!(h.store().atom_exists(&AtomRef::new(AtomKind::Component, "c1", "a")).unwrap());
    }

    #[tokio::test]
    async fn test_held_hammers_are_discarded_after_completion() {
        let h = Harness::new();
        h.remote.put_atom("cs1", AtomKind::Component, "c1", "a", json!({}));
        h.remote.put_index("cs1", "i1", &[(AtomKind::Component, "c1", "a")]);
        h.remote.hold();
        let pending = {
            let engine = &h.engine;
            async move { engine.cold_start(&ws(), &cs("cs1")).await }
        };
        let hammer = async {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            h.engine.hammer(&ws(), &cs("cs1"), component("c1"), Some("a".into()));
            h.remote.release();
        };
        let (outcome, ()) = tokio::join!(pending, hammer);
        assert!(outcome.is_completed());
        h.engine.wait_idle().await;
        assert_eq!(h.remote.atom_calls(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_remote_restarts_then_fails() {
        let h = Harness::new();
        h.remote.put_index("cs1", "i1", &[]);
        // retries per attempt: 1 + max_retries(2); one restart allowed
        h.remote.fail_next(503, 6);
        let outcome = h.engine.cold_start(&ws(), &cs("cs1")).await;
        assert!(matches!(outcome, ColdStartOutcome::Failed(_)));
        assert_eq!(h.remote.index_calls(), 6);
    }

    #[tokio::test]
    async fn test_ragnarok_then_restart() {
        let h = Harness::new();
        h.remote.put_atom("cs1", AtomKind::Component, "c1", "a", json!({}));
        h.remote.put_index("cs1", "i1", &[(AtomKind::Component, "c1", "a")]);
        assert!(h.engine.cold_start(&ws(), &cs("cs1")).await.is_completed());

        let (report, outcome) = h.engine.ragnarok(&ws(), &cs("cs1"), false).await.unwrap();
        assert_eq!(report.indexes_removed, 1);
        assert!(outcome.is_none());
        assert!(!h.store().change_set_exists(&cs("cs1")).unwrap());
        assert!(!h.store().atom_exists(&AtomRef::new(AtomKind::Component, "c1", "a")).unwrap());

        let (_, outcome) = h.engine.ragnarok(&ws(), &cs("cs1"), true).await.unwrap();
        assert!(outcome.is_some_and(|outcome| outcome.is_completed()));
        assert!(h.store().atom_exists(&AtomRef::new(AtomKind::Component, "c1", "a")).unwrap());
    }

    #[tokio::test]
    async fn test_deployment_cold_start() {
        let h = Harness::new();
        h.remote.put_global(AtomKind::CachedSchema, "s1", "x", json!({"name": "s1"}));
        h.remote.put_deployment_index("d1", &[(AtomKind::CachedSchema, "s1", "x")]);

        let outcome = h.engine.deployment_cold_start(&ws()).await;
        assert!(outcome.is_completed());
        let key = AtomKey::new(AtomKind::CachedSchema, "s1");
        assert_eq!(h.engine.get_global(&key).unwrap(), Some(json!({"name": "s1"})));

        // a second pass finds nothing stale
        h.engine.deployment_cold_start(&ws()).await;
        assert_eq!(h.remote.multi_calls(), 1);
    }
}
