//! Writer lease keeper.
//!
//! Holds the store's single-writer lease for the engine's lifetime and
//! renews it in the background. Losing the lease stops the engine: the root
//! cancellation token is cancelled, which aborts network calls and makes
//! the pair workers drop queued work. No write transaction is ever held
//! across an await, so nothing is left half-written.

use crate::events::{EventSink, SyncEvent};
use atomsync_common::config::LeaseConfig;
use atomsync_common::Result;
use atomsync_store::{AtomStore, StoreError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, trace, warn};

pub struct LeaseKeeper {
    store: Arc<AtomStore>,
    holder: String,
    task: JoinHandle<()>,
}

impl LeaseKeeper {
    /// Take the lease and start renewing it. Fails with `LeaseHeld` while
    /// another live writer holds it.
    pub fn start(
        store: Arc<AtomStore>,
        holder: String,
        config: LeaseConfig,
        events: EventSink,
        root: CancellationToken,
    ) -> Result<Self> {
        let ttl = Duration::from_millis(config.ttl_ms);
        let record = store.acquire_lease(&holder, ttl)?;
        info!(holder = %holder, expires_at_ms = record.expires_at_ms, "writer lease acquired");

        let renewal = Renewal {
            store: Arc::clone(&store),
            holder: holder.clone(),
            ttl,
            interval: Duration::from_millis(config.renew_interval_ms.max(1)),
            events,
            root,
        };
        let span = info_span!("lease", holder = %holder);
        let task = tokio::spawn(renewal.run().instrument(span));
        Ok(Self { store, holder, task })
    }

    #[must_use]
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Stop renewing and give the lease up
    pub fn release(self) -> Result<()> {
        self.task.abort();
        if self.store.release_lease(&self.holder)? {
            info!(holder = %self.holder, "writer lease released");
        }
        Ok(())
    }
}

struct Renewal {
    store: Arc<AtomStore>,
    holder: String,
    ttl: Duration,
    interval: Duration,
    events: EventSink,
    root: CancellationToken,
}

impl Renewal {
    async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        let mut renewed = Instant::now();

        loop {
            tokio::select! {
                () = self.root.cancelled() => return,
                _ = ticker.tick() => {}
            }
            match self.store.renew_lease(&self.holder, self.ttl) {
                Ok(record) => {
                    trace!(expires_at_ms = record.expires_at_ms, "lease renewed");
                    renewed = Instant::now();
                }
                Err(StoreError::LeaseHeld { holder }) => {
                    self.lost(holder);
                    return;
                }
                Err(e) if renewed.elapsed() >= self.ttl => {
                    error!(error = %e, "lease expired while renewal kept failing");
                    self.lost(self.holder.clone());
                    return;
                }
                Err(e) => warn!(error = %e, "lease renewal failed"),
            }
        }
    }

    fn lost(&self, holder: String) {
        error!(taken_by = %holder, "writer lease lost, stopping");
        self.events.emit(SyncEvent::LeaseLost { holder });
        self.root.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atomsync_common::Error;
    use tempfile::TempDir;

    fn config() -> LeaseConfig {
        LeaseConfig {
            ttl_ms: 2_000,
            renew_interval_ms: 20,
        }
    }

    fn open() -> (TempDir, Arc<AtomStore>) {
        let dir = TempDir::new().unwrap();
        let store = AtomStore::open(dir.path().join("replica.redb")).unwrap();
        (dir, Arc::new(store))
    }

    #[tokio::test]
    async fn test_second_writer_is_refused_until_release() {
        let (_dir, store) = open();
        let (events, _rx) = EventSink::channel();
        let first = LeaseKeeper::start(
            Arc::clone(&store),
            "a".into(),
            config(),
            events.clone(),
            CancellationToken::new(),
        )
        .unwrap();

        let Err(err) = LeaseKeeper::start(
            Arc::clone(&store),
            "b".into(),
            config(),
            events.clone(),
            CancellationToken::new(),
        ) else {
            panic!("second writer got the lease");
        };
        assert!(matches!(err, Error::LeaseHeld { holder } if holder == "a"));

        first.release().unwrap();
        let second =
            LeaseKeeper::start(
                Arc::clone(&store),
                "b".into(),
                config(),
                events,
                CancellationToken::new(),
            ).unwrap();
        assert_eq!(second.holder(), "b");
        assert_eq!(store.lease().unwrap().unwrap().holder, "b");
    }

    #[tokio::test]
    async fn test_takeover_cancels_root() {
        let (_dir, store) = open();
        let (events, mut rx) = EventSink::channel();
        let root = CancellationToken::new();
        let _keeper = LeaseKeeper::start(
            Arc::clone(&store),
            "a".into(),
            config(),
            events,
            root.clone(),
        ).unwrap();

        store.release_lease("a").unwrap();
        store.acquire_lease("b", Duration::from_secs(10)).unwrap();

        tokio::time::timeout(Duration::from_secs(2), root.cancelled())
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some(SyncEvent::LeaseLost { holder: "b".into() }));
    }
}
