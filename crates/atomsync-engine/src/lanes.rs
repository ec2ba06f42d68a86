//! Per-pair lane state machine.
//!
//! Four lanes feed one sequential worker. The dispatch rule, evaluated each
//! time the worker is free:
//!
//! 1. bulk work first; while any is queued, patch and invalidation wait
//! 2. then patch batches, FIFO
//! 3. then hammer results; a queued patch always goes ahead of them
//! 4. then invalidations, once no patch or hammer work is queued, running
//!    or in flight on the network
//!
//! The state is level-triggered: every decision reads the current queue
//! contents, never a count of past transitions.

use atomsync_common::AtomKey;
use std::collections::{HashSet, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    Bulk,
    Patch,
    Hammer,
    Invalidation,
}

/// One unit of work handed to the worker
#[derive(Debug)]
pub enum Dispatch<B, P, H> {
    Bulk(B),
    Patch(P),
    Hammer(H),
    /// Deduplicated keys, non-list kinds first
    Invalidate(Vec<AtomKey>),
}

#[derive(Debug)]
pub struct PairLanes<B, P, H> {
    bulk: VecDeque<B>,
    patch: VecDeque<P>,
    hammer: VecDeque<H>,
    invalidations: Vec<AtomKey>,
    invalidation_set: HashSet<AtomKey>,
    hammers_in_flight: usize,
    active: Option<Lane>,
}

impl<B, P, H> Default for PairLanes<B, P, H> {
    fn default() -> Self {
        Self {
            bulk: VecDeque::new(),
            patch: VecDeque::new(),
            hammer: VecDeque::new(),
            invalidations: Vec::new(),
            invalidation_set: HashSet::new(),
            hammers_in_flight: 0,
            active: None,
        }
    }
}

impl<B, P, H> PairLanes<B, P, H> {
    pub fn push_bulk(&mut self, job: B) {
        self.bulk.push_back(job);
    }

    pub fn push_patch(&mut self, job: P) {
        self.patch.push_back(job);
    }

    pub fn push_hammer(&mut self, job: H) {
        self.hammer.push_back(job);
    }

    /// Queue invalidations; keys already pending collapse into one
    pub fn push_invalidations(&mut self, keys: impl IntoIterator<Item = AtomKey>) {
        for key in keys {
            if self.invalidation_set.insert(key.clone()) {
                self.invalidations.push(key);
            }
        }
    }

    /// A hammer fetch for this pair went out on the network
    pub fn hammer_started(&mut self) {
        self.hammers_in_flight += 1;
    }

    /// A hammer fetch came back; its result is queued with `push_hammer`
    pub fn hammer_finished(&mut self) {
        self.hammers_in_flight = self.hammers_in_flight.saturating_sub(1);
    }

    #[must_use]
    pub const fn active(&self) -> Option<Lane> {
        self.active
    }

    #[must_use]
    pub fn patch_idle(&self) -> bool {
        self.patch.is_empty() && self.active != Some(Lane::Patch)
    }

    #[must_use]
    pub fn hammer_idle(&self) -> bool {
        self.hammer.is_empty() && self.hammers_in_flight == 0 && self.active != Some(Lane::Hammer)
    }

    #[must_use]
    pub fn bulk_idle(&self) -> bool {
        self.bulk.is_empty() && self.active != Some(Lane::Bulk)
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.bulk_idle()
            && self.patch_idle()
            && self.hammer_idle()
            && self.invalidations.is_empty()
            && self.active.is_none()
    }

    /// Take the next unit of work, marking its lane active. Returns `None`
    /// while a unit is running or when nothing is eligible.
    pub fn next(&mut self) -> Option<Dispatch<B, P, H>> {
        if self.active.is_some() {
            return None;
        }
        let dispatch = if let Some(job) = self.bulk.pop_front() {
            Dispatch::Bulk(job)
        } else if let Some(job) = self.patch.pop_front() {
            Dispatch::Patch(job)
        } else if let Some(job) = self.hammer.pop_front() {
            Dispatch::Hammer(job)
        } else if !self.invalidations.is_empty() && self.hammers_in_flight == 0 {
            let mut keys = std::mem::take(&mut self.invalidations);
            self.invalidation_set.clear();
            // stable: arrival order within each group
            keys.sort_by_key(|key| key.kind.is_list());
            Dispatch::Invalidate(keys)
        } else {
            return None;
        };
        self.active = Some(match dispatch {
            Dispatch::Bulk(_) => Lane::Bulk,
            Dispatch::Patch(_) => Lane::Patch,
            Dispatch::Hammer(_) => Lane::Hammer,
            Dispatch::Invalidate(_) => Lane::Invalidation,
        });
        Some(dispatch)
    }

    /// The running unit completed
    pub fn finish(&mut self) {
        self.active = None;
    }

    /// Drop all queued work, e.g. after the writer lease was lost
    pub fn clear(&mut self) {
        self.bulk.clear();
        self.patch.clear();
        self.hammer.clear();
        self.invalidations.clear();
        self.invalidation_set.clear();
    }
}
