//! HammerFetcher: out-of-band full-object fetches that repair local gaps.
//!
//! The fetcher owns the network side of a hammer: deduplication of
//! identical requests, the per-pair freeze used while a bulk operation is
//! running, and retry with quadratic backoff for an unavailable remote.
//! Writing the results back is the engine's job.

use atomsync_client::{AtomRequest, ClientResult, FrontEndObject, RemoteApi};
use atomsync_common::config::HammerConfig;
use atomsync_common::{Atom, AtomKey, AtomKind, Error, PairKey, Result, WorkspaceId};
use atomsync_store::keys;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One atom to fetch for a change-set pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HammerRequest {
    pub pair: PairKey,
    pub key: AtomKey,
    /// Checksum the caller expects, if it knows one
    pub checksum: Option<String>,
}

impl HammerRequest {
    #[must_use]
    pub fn new(pair: PairKey, key: AtomKey, checksum: Option<String>) -> Self {
        Self {
            pair,
            key,
            checksum,
        }
    }

    fn wire(&self) -> AtomRequest {
        AtomRequest::new(self.key.kind, self.key.id.clone(), self.checksum.clone())
    }
}

/// Result of a bulk fetch
#[derive(Debug, Default)]
pub struct BulkFetch {
    pub resolved: Vec<Atom>,
    pub still_missing: Vec<AtomKey>,
}

pub struct HammerFetcher {
    remote: Arc<dyn RemoteApi>,
    config: HammerConfig,
    in_flight: DashMap<(PairKey, AtomKey), ()>,
    frozen: Mutex<HashMap<PairKey, Vec<HammerRequest>>>,
}

impl HammerFetcher {
    #[must_use]
    pub fn new(remote: Arc<dyn RemoteApi>, config: HammerConfig) -> Self {
        Self {
            remote,
            config,
            in_flight: DashMap::new(),
            frozen: Mutex::new(HashMap::new()),
        }
    }

    /// Mark the request as in flight. Returns `false` when an identical
    /// `(pair, kind, id)` fetch is already outstanding.
    pub fn claim(&self, request: &HammerRequest) -> bool {
        self.in_flight
            .insert((request.pair.clone(), request.key.clone()), ())
            .is_none()
    }

    pub fn release(&self, pair: &PairKey, key: &AtomKey) {
        self.in_flight.remove(&(pair.clone(), key.clone()));
    }

    #[must_use]
    pub fn is_in_flight(&self, pair: &PairKey, key: &AtomKey) -> bool {
        self.in_flight.contains_key(&(pair.clone(), key.clone()))
    }

    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Hold back hammers for `pair` until [`Self::thaw`]
    pub fn freeze(&self, pair: &PairKey) {
        self.frozen.lock().entry(pair.clone()).or_default();
    }

    #[must_use]
    pub fn is_frozen(&self, pair: &PairKey) -> bool {
        self.frozen.lock().contains_key(pair)
    }

    /// Queue the request if its pair is frozen. Returns whether it was held.
    pub fn defer(&self, request: &HammerRequest) -> bool {
        let mut frozen = self.frozen.lock();
        let Some(held) = frozen.get_mut(&request.pair) else {
            return false;
        };
        if !held.iter().any(|r| r.key == request.key) {
            held.push(request.clone());
        }
        true
    }

    /// Unfreeze `pair` and hand back what was held
    pub fn thaw(&self, pair: &PairKey) -> Vec<HammerRequest> {
        self.frozen.lock().remove(pair).unwrap_or_default()
    }

    pub(crate) async fn with_retry<T, F, Fut>(
        &self,
        what: &str,
        cancel: &CancellationToken,
        mut call: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ClientResult<T>>,
    {
        let mut attempt = 0;
        loop {
            let result = tokio::select! {
                () = cancel.cancelled() => return Err(Error::Cancelled),
                result = call() => result,
            };
            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    let delay = self.config.backoff(attempt);
                    warn!(
                        what,
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "remote unavailable, retrying"
                    );
                    tokio::select! {
                        () = cancel.cancelled() => return Err(Error::Cancelled),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Fetch one atom. A rejection is reported as `Ok(None)`.
    pub async fn fetch_one(
        &self,
        request: &HammerRequest,
        cancel: &CancellationToken,
    ) -> Result<Option<Atom>> {
        let wire = request.wire();
        let pair = &request.pair;
        let response = self
            .with_retry("mjolnir", cancel, || {
                self.remote.fetch_atom(&pair.workspace_id, &pair.change_set_id, &wire)
            })
            .await;
        match response {
            Ok(response) => {
                let atom = into_atom(response.front_end_object)?;
                if let Some(atom) = &atom {
                    check_checksum(request, atom);
                }
                Ok(atom)
            }
            Err(e) if e.is_not_found() => {
                debug!(pair = %pair, atom = %request.key, error = %e, "hammer target not found");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Fetch many atoms of one pair in a single round trip
    pub async fn fetch_bulk(
        &self,
        pair: &PairKey,
        requests: &[HammerRequest],
        cancel: &CancellationToken,
    ) -> Result<BulkFetch> {
        if requests.is_empty() {
            return Ok(BulkFetch::default());
        }
        let wire: Vec<_> = requests.iter().map(HammerRequest::wire).collect();
        let response = self
            .with_retry("multi_mjolnir", cancel, || {
                self.remote
                    .fetch_atoms(&pair.workspace_id, &pair.change_set_id, &wire)
            })
            .await;
        let objects = match response {
            Ok(response) => {
                if !response.failed.is_empty() {
                    debug!(
                        pair = %pair,
                        failed = response.failed.len(),
                        "multi mjolnir partially failed"
                    );
                }
                response
                    .successful
                    .into_iter()
                    .map(|r| r.front_end_object)
                    .collect()
            }
            Err(e) if e.is_not_found() => {
                debug!(pair = %pair, error = %e, "multi mjolnir rejected");
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        let fetched = collect(objects)?;
        for atom in &fetched.resolved {
            if let Some(request) = requests.iter().find(|r| r.key == atom.key()) {
                check_checksum(request, atom);
            }
        }
        Ok(fetched.with_missing(requests.iter().map(|r| &r.key)))
    }

    /// Fetch deployment-scoped atoms
    pub async fn fetch_globals(
        &self,
        workspace: &WorkspaceId,
        keys: &[AtomKey],
        cancel: &CancellationToken,
    ) -> Result<BulkFetch> {
        if keys.is_empty() {
            return Ok(BulkFetch::default());
        }
        let wire: Vec<_> = keys
            .iter()
            .map(|key| AtomRequest::new(key.kind, key.id.clone(), None))
            .collect();
        let response = self
            .with_retry("global multi_mjolnir", cancel, || {
                self.remote.fetch_global_atoms(workspace, &wire)
            })
            .await;
        let objects = match response {
            Ok(response) => response
                .successful
                .into_iter()
                .map(|r| r.front_end_object)
                .collect(),
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => return Err(e),
        };
        Ok(collect(objects)?.with_missing(keys.iter()))
    }
}

impl BulkFetch {
    fn with_missing<'a>(mut self, requested: impl Iterator<Item = &'a AtomKey>) -> Self {
        let resolved: HashSet<_> = self.resolved.iter().map(Atom::key).collect();
        self.still_missing = requested
            .filter(|key| !resolved.contains(*key))
            .cloned()
            .collect();
        self
    }
}

fn collect(objects: Vec<FrontEndObject>) -> Result<BulkFetch> {
    let mut fetched = BulkFetch::default();
    for object in objects {
        if let Some(atom) = into_atom(object)? {
            fetched.resolved.push(atom);
        }
    }
    Ok(fetched)
}

/// Convert a fetched object into an atom; unknown kinds are dropped
pub fn into_atom(object: FrontEndObject) -> Result<Option<Atom>> {
    let kind: AtomKind = match object.kind.parse() {
        Ok(kind) => kind,
        Err(e) => {
            warn!(error = %e, id = %object.id, "ignoring fetched object");
            return Ok(None);
        }
    };
    if !keys::storable(&[&object.id, &object.checksum]) {
        warn!(kind = %kind, id = ?object.id, "ignoring fetched object with NUL in its key");
        return Ok(None);
    }
    Ok(Some(Atom::from_value(kind, object.id, object.checksum, &object.data)?))
}

fn check_checksum(request: &HammerRequest, atom: &Atom) {
    if let Some(expected) = &request.checksum
        && *expected != atom.checksum
    {
        let mismatch = Error::ChecksumMismatch {
            kind: atom.kind.to_string(),
            id: atom.id.clone(),
            expected: expected.clone(),
            actual: atom.checksum.clone(),
        };
        warn!(pair = %request.pair, error = %mismatch, "accepting remote version");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockRemote;
    use serde_json::json;
    use std::time::Duration;

    fn config() -> HammerConfig {
        HammerConfig {
            max_retries: 2,
            base_delay_ms: 1,
            max_delay_ms: 5,
        }
    }

    fn request(id: &str, checksum: Option<&str>) -> HammerRequest {
        HammerRequest::new(
            PairKey::new("ws", "cs"),
            AtomKey::new(AtomKind::Component, id),
            checksum.map(str::to_string),
        )
    }

    #[test]
    fn test_claim_dedups_identical_requests() {
        let fetcher = HammerFetcher::new(Arc::new(MockRemote::new()), config());
        assert!(fetcher.claim(&request("c1", None)));
        assert!(!fetcher.claim(&request("c1", Some("b"))));
        assert!(fetcher.claim(&request("c2", None)));
        fetcher.release(&PairKey::new("ws", "cs"), &AtomKey::new(AtomKind::Component, "c1"));
        assert!(fetcher.claim(&request("c1", None)));
    }

    #[test]
    fn test_freeze_defers_until_thaw() {
        let fetcher = HammerFetcher::new(Arc::new(MockRemote::new()), config());
        let pair = PairKey::new("ws", "cs");
        assert!(!fetcher.defer(&request("c1", None)));
        fetcher.freeze(&pair);
        assert!(fetcher.defer(&request("c1", None)));
        assert!(fetcher.defer(&request("c1", None)));
        assert!(fetcher.defer(&request("c2", None)));
        let held = fetcher.thaw(&pair);
        assert_eq!(held.len(), 2);
        assert!(!fetcher.is_frozen(&pair));
    }

    #[tokio::test]
    async fn test_fetch_one_retries_unavailable() {
        let remote = Arc::new(MockRemote::new());
        remote.put_atom("cs", AtomKind::Component, "c1", "b", json!({"id": "c1"}));
        remote.fail_next(503, 2);
        let fetcher = HammerFetcher::new(remote.clone(), config());
        let atom = fetcher
            .fetch_one(&request("c1", Some("b")), &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(atom.checksum, "b");
        assert_eq!(remote.atom_calls(), 3);
    }

    #[tokio::test]
    async fn test_fetch_one_gives_up_after_ceiling() {
        let remote = Arc::new(MockRemote::new());
        remote.fail_next(500, 10);
        let fetcher = HammerFetcher::new(remote.clone(), config());
        let err = fetcher
            .fetch_one(&request("c1", None), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(remote.atom_calls(), 3);
    }

    #[tokio::test]
    async fn test_rejection_is_not_found_without_retry() {
        let remote = Arc::new(MockRemote::new());
        remote.fail_next(404, 1);
        let fetcher = HammerFetcher::new(remote.clone(), config());
        let atom = fetcher
            .fetch_one(&request("c1", None), &CancellationToken::new())
            .await
            .unwrap();
        assert!(atom.is_none());
        assert_eq!(remote.atom_calls(), 1);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_is_accepted() {
        let remote = Arc::new(MockRemote::new());
        remote.put_atom("cs", AtomKind::Component, "c1", "newer", json!({"id": "c1"}));
        let fetcher = HammerFetcher::new(remote, config());
        let atom = fetcher
            .fetch_one(&request("c1", Some("older")), &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(atom.checksum, "newer");
    }

    #[tokio::test]
    async fn test_fetch_bulk_reports_still_missing() {
        let remote = Arc::new(MockRemote::new());
        remote.put_atom("cs", AtomKind::Component, "c1", "a", json!({"id": "c1"}));
        let fetcher = HammerFetcher::new(remote, config());
        let pair = PairKey::new("ws", "cs");
        let fetched = fetcher
            .fetch_bulk(
                &pair,
                &[request("c1", None), request("c2", None)],
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(fetched.resolved.len(), 1);
        assert_eq!(
            fetched.still_missing,
            vec![AtomKey::new(AtomKind::Component, "c2")]
        );
    }

    #[tokio::test]
    async fn test_cancel_aborts_backoff() {
        let remote = Arc::new(MockRemote::new());
        remote.fail_next(503, 10);
        let fetcher = HammerFetcher::new(
            remote,
            HammerConfig {
                max_retries: 5,
                base_delay_ms: 10_000,
                max_delay_ms: 60_000,
            },
        );
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });
        let err = fetcher.fetch_one(&request("c1", None), &cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
