//! QueueOrchestrator: one sequential worker per scope, bounded globally.
//!
//! Work is queued into a scope's [`PairLanes`]. The first push into an idle
//! scope spawns its worker; the worker drains the lanes in dispatch order
//! and exits when nothing is eligible. At most `max_concurrent_pairs`
//! workers run at once.

use crate::lanes::{Dispatch, PairLanes};
use async_trait::async_trait;
use atomsync_common::{AtomKey, PairKey};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};
use tracing::{Instrument, debug, info_span, warn};

/// Unit of ordering: a change-set pair, or the deployment-wide atoms
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    ChangeSet(PairKey),
    Deployment,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChangeSet(pair) => write!(f, "{pair}"),
            Self::Deployment => f.write_str("deployment"),
        }
    }
}

impl From<PairKey> for Scope {
    fn from(pair: PairKey) -> Self {
        Self::ChangeSet(pair)
    }
}

/// Executes dispatched work
#[async_trait]
pub trait LaneRunner: Send + Sync + Sized + 'static {
    type Bulk: Send + 'static;
    type Patch: Send + 'static;
    type Hammer: Send + 'static;

    fn queue(&self) -> &QueueOrchestrator<Self>;

    /// Once stopped, queued work is dropped instead of run
    fn is_stopped(&self) -> bool;

    async fn run_bulk(&self, scope: &Scope, job: Self::Bulk);
    async fn run_patch(&self, scope: &Scope, job: Self::Patch);
    async fn run_hammer(&self, scope: &Scope, job: Self::Hammer);
    async fn run_invalidations(&self, scope: &Scope, keys: Vec<AtomKey>);
}

type Lanes<R> =
    PairLanes<<R as LaneRunner>::Bulk, <R as LaneRunner>::Patch, <R as LaneRunner>::Hammer>;

struct ScopeQueue<R: LaneRunner> {
    lanes: Mutex<Lanes<R>>,
    running: Mutex<bool>,
}

pub struct QueueOrchestrator<R: LaneRunner> {
    scopes: DashMap<Scope, Arc<ScopeQueue<R>>>,
    permits: Arc<Semaphore>,
    changed: Notify,
}

impl<R: LaneRunner> QueueOrchestrator<R> {
    #[must_use]
    pub fn new(max_concurrent_pairs: usize) -> Self {
        Self {
            scopes: DashMap::new(),
            permits: Arc::new(Semaphore::new(max_concurrent_pairs.max(1))),
            changed: Notify::new(),
        }
    }

    fn scope_queue(&self, scope: &Scope) -> Arc<ScopeQueue<R>> {
        self.scopes
            .entry(scope.clone())
            .or_insert_with(|| {
                Arc::new(ScopeQueue {
                    lanes: Mutex::new(PairLanes::default()),
                    running: Mutex::new(false),
                })
            })
            .clone()
    }

    /// Mutate a scope's lanes and make sure a worker will look at them
    pub fn submit(runner: &Arc<R>, scope: &Scope, f: impl FnOnce(&mut Lanes<R>)) {
        let queue = runner.queue().scope_queue(scope);
        f(&mut queue.lanes.lock());
        let spawn = {
            let mut running = queue.running.lock();
            !std::mem::replace(&mut *running, true)
        };
        if spawn {
            let span = info_span!("pair_worker", scope = %scope);
            tokio::spawn(Self::work(Arc::clone(runner), scope.clone(), queue).instrument(span));
        }
        runner.queue().changed.notify_waiters();
    }

    pub fn push_bulk(runner: &Arc<R>, scope: &Scope, job: R::Bulk) {
        Self::submit(runner, scope, |lanes| lanes.push_bulk(job));
    }

    pub fn push_patch(runner: &Arc<R>, scope: &Scope, job: R::Patch) {
        Self::submit(runner, scope, |lanes| lanes.push_patch(job));
    }

    pub fn push_hammer(runner: &Arc<R>, scope: &Scope, job: R::Hammer) {
        Self::submit(runner, scope, |lanes| lanes.push_hammer(job));
    }

    pub fn push_invalidations(runner: &Arc<R>, scope: &Scope, keys: Vec<AtomKey>) {
        if keys.is_empty() {
            return;
        }
        Self::submit(runner, scope, |lanes| lanes.push_invalidations(keys));
    }

    /// Count a hammer fetch for the scope as outstanding
    pub fn hammer_started(&self, scope: &Scope) {
        self.scope_queue(scope).lanes.lock().hammer_started();
    }

    /// Queue a hammer result and release its in-flight slot in one step
    pub fn hammer_returned(runner: &Arc<R>, scope: &Scope, job: R::Hammer) {
        Self::submit(runner, scope, |lanes| {
            lanes.hammer_finished();
            lanes.push_hammer(job);
        });
    }

    /// Whether every lane of every scope is idle
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.scopes
            .iter()
            .all(|entry| entry.value().lanes.lock().is_idle())
    }

    #[must_use]
    pub fn scope_is_idle(&self, scope: &Scope) -> bool {
        self.scopes
            .get(scope)
            .is_none_or(|queue| queue.lanes.lock().is_idle())
    }

    /// Wait until [`Self::is_idle`] holds
    pub async fn wait_idle(&self) {
        loop {
            let changed = self.changed.notified();
            if self.is_idle() {
                return;
            }
            changed.await;
        }
    }

    /// Wake idle waiters after state outside the lanes changed
    pub fn notify(&self) {
        self.changed.notify_waiters();
    }

    /// Forget a scope's queued work
    pub fn clear_scope(&self, scope: &Scope) {
        if let Some(queue) = self.scopes.get(scope) {
            queue.lanes.lock().clear();
        }
        self.changed.notify_waiters();
    }

    async fn work(runner: Arc<R>, scope: Scope, queue: Arc<ScopeQueue<R>>) {
        let permits = Arc::clone(&runner.queue().permits);
        let Ok(_permit) = permits.acquire_owned().await else {
            warn!(scope = %scope, "worker pool closed");
            *queue.running.lock() = false;
            return;
        };
        debug!(scope = %scope, "pair worker started");

        loop {
            let dispatch = {
                let mut lanes = queue.lanes.lock();
                let next = lanes.next();
                if next.is_none() {
                    // the running flag is cleared under the lanes lock, so a
                    // concurrent submit either sees it set or spawns anew
                    *queue.running.lock() = false;
                }
                next
            };
            let Some(dispatch) = dispatch else {
                break;
            };

            if runner.is_stopped() {
                let mut lanes = queue.lanes.lock();
                lanes.clear();
                lanes.finish();
                continue;
            }

            match dispatch {
                Dispatch::Bulk(job) => runner.run_bulk(&scope, job).await,
                Dispatch::Patch(job) => runner.run_patch(&scope, job).await,
                Dispatch::Hammer(job) => runner.run_hammer(&scope, job).await,
                Dispatch::Invalidate(keys) => runner.run_invalidations(&scope, keys).await,
            }
            queue.lanes.lock().finish();
            runner.queue().changed.notify_waiters();
        }

        debug!(scope = %scope, "pair worker idle");
        runner.queue().changed.notify_waiters();
    }
}
