//! Garbage collection and change-set teardown.
//!
//! An index is live while some change-set points at it. An atom version is
//! live while it is a member of at least one index. Index descriptor atoms
//! live exactly as long as the index they describe.

use crate::error::{StoreError, StoreResult};
use crate::store::AtomStore;
use atomsync_common::ChangeSetId;
use std::collections::HashSet;
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    pub indexes_removed: usize,
    pub atoms_removed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RagnarokReport {
    pub indexes_removed: usize,
    pub atoms_removed: usize,
    pub weak_references_removed: usize,
}

impl AtomStore {
    /// Drop unreferenced indexes, then atoms that belong to no index.
    pub fn collect_garbage(&self) -> StoreResult<GcReport> {
        let report = self.transact(|txn| -> StoreResult<GcReport> {
            let live: HashSet<String> = txn
                .change_sets()?
                .into_iter()
                .map(|cs| cs.index_checksum)
                .collect();
            let mut report = GcReport::default();

            for index in txn.index_checksums()? {
                if !live.contains(&index) {
                    txn.drop_index(&index)?;
                    report.indexes_removed += 1;
                }
            }

            for r in txn.atom_refs()? {
                let retained = if r.kind.is_index_descriptor() {
                    live.contains(&r.checksum)
                } else {
                    !txn.indexes_containing(&r)?.is_empty()
                };
                if !retained && txn.delete_atom(&r)? {
                    report.atoms_removed += 1;
                }
            }
            Ok(report)
        })?;
        info!(
            indexes = report.indexes_removed,
            atoms = report.atoms_removed,
            "garbage collected"
        );
        Ok(report)
    }

    /// Forget a closed change-set. Its indexes and atoms are reclaimed by
    /// the next [`AtomStore::collect_garbage`].
    pub fn prune_change_set(&self, change_set: &ChangeSetId) -> StoreResult<bool> {
        self.transact(|txn| -> StoreResult<bool> {
            let existed = txn.delete_change_set(change_set)?.is_some();
            txn.clear_weak_references(change_set)?;
            Ok(existed)
        })
    }

    /// Tear down a change-set: remove its row and weak references, drop the
    /// indexes it created or pointed at that no other change-set uses, and
    /// every atom left without membership.
    pub fn ragnarok(&self, change_set: &ChangeSetId) -> StoreResult<RagnarokReport> {
        let report = self.transact(|txn| -> StoreResult<RagnarokReport> {
            let Some(cs) = txn.delete_change_set(change_set)? else {
                return Err(StoreError::ChangeSetNotFound(change_set.to_string()));
            };
            let mut report = RagnarokReport {
                weak_references_removed: txn.clear_weak_references(change_set)?,
                ..RagnarokReport::default()
            };

            let live: HashSet<String> = txn
                .change_sets()?
                .into_iter()
                .map(|other| other.index_checksum)
                .collect();

            for index in txn.index_checksums()? {
                if live.contains(&index) {
                    continue;
                }
                let owned = index == cs.index_checksum
                    || txn
                        .index_record(&index)?
                        .and_then(|record| record.created_by)
                        .is_some_and(|creator| creator == change_set.as_str());
                if !owned {
                    continue;
                }
                let members = txn.index_members(&index)?;
                txn.drop_index(&index)?;
                report.atoms_removed += txn.delete_index_descriptors(&index)?;
                report.indexes_removed += 1;
                for r in members {
                    if txn.indexes_containing(&r)?.is_empty() && txn.delete_atom(&r)? {
                        report.atoms_removed += 1;
                    }
                }
            }
            Ok(report)
        })?;
        info!(
            change_set = %change_set,
            indexes = report.indexes_removed,
            atoms = report.atoms_removed,
            "ragnarok complete"
        );
        Ok(report)
    }
}
