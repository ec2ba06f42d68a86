//! PatchReconciler: applies inbound patch batches to the replica.
//!
//! A batch is handled in one write transaction and in two phases. Every
//! entry is first classified and resolved against the state the store had
//! before the batch (entries may refer to each other in any order); only
//! then is the staged result written. Anything that cannot be resolved
//! locally becomes a hammer candidate instead of a guess.

use crate::document::apply_patch;
use atomsync_client::{
    BatchMeta, DeploymentIndexUpdate, DeploymentPatchBatch, IndexUpdate, PatchBatch, PatchEntry,
    mv_list,
};
use atomsync_common::{Atom, AtomKey, AtomKind, AtomRef, PendingOperation, Result, ZERO_CHECKSUM};
use atomsync_store::{AtomStore, StoreTxn, keys};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, warn};

/// One membership change produced by a batch
#[derive(Debug, Clone)]
pub struct AtomChange {
    pub atom: AtomRef,
    /// Current document; `None` once removed or when it could not be read
    pub document: Option<Value>,
    pub removed: bool,
}

/// What a change-set batch did
#[derive(Debug, Default)]
pub struct Reconciliation {
    pub index_checksum: String,
    /// New bytes written and registered
    pub written: Vec<AtomChange>,
    /// Existing bytes registered under the index
    pub registered: Vec<AtomChange>,
    pub removed: Vec<AtomChange>,
    /// Atoms to fetch, at the checksum the batch wanted
    pub hammer: Vec<AtomRef>,
    pub skipped: usize,
}

impl Reconciliation {
    /// Every change, in write order
    pub fn changes(&self) -> impl Iterator<Item = &AtomChange> {
        self.written
            .iter()
            .chain(&self.registered)
            .chain(&self.removed)
    }

    /// Keys to invalidate, non-list kinds before list kinds
    #[must_use]
    pub fn touched(&self) -> Vec<AtomKey> {
        let mut keys: Vec<AtomKey> = self.changes().map(|c| c.atom.key()).collect();
        keys.sort_by_key(|key| key.kind.is_list());
        keys.dedup();
        keys
    }
}

/// Result of an index update
#[derive(Debug)]
pub enum IndexUpdateOutcome {
    Applied(Reconciliation),
    /// The descriptor could not be patched; only a cold start can recover
    NeedsColdStart,
}

enum Staged {
    Write(AtomRef, Value),
    Register(AtomRef, Option<Value>),
    Hammer(AtomRef),
    Remove(AtomKey, Option<Value>),
}

fn document_of(atom: Option<Atom>) -> Option<Value> {
    atom.and_then(|atom| match atom.to_value() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(atom = %atom.atom_ref(), error = %e, "stored document is not JSON");
            None
        }
    })
}

fn parse_kind(entry: &PatchEntry) -> Option<AtomKind> {
    if !keys::storable(&[&entry.id, &entry.from_checksum, &entry.to_checksum]) {
        warn!(id = ?entry.id, "skipping entry with NUL in its key");
        return None;
    }
    match entry.atom_kind() {
        Ok(kind) => Some(kind),
        Err(e) => {
            debug!(error = %e, id = %entry.id, "skipping entry");
            None
        }
    }
}

/// Classify and resolve one entry against pre-batch state
fn stage(txn: &StoreTxn, kind: AtomKind, entry: &PatchEntry) -> Result<Option<Staged>> {
    let key = AtomKey::new(kind, entry.id.clone());
    let target = AtomRef::new(kind, entry.id.clone(), entry.to_checksum.clone());
    let present = entry.to_checksum != ZERO_CHECKSUM && txn.atom_exists(&target)?;
    let operation = PendingOperation::classify(&entry.from_checksum, &entry.to_checksum, present);
    let staged = match operation {
        PendingOperation::NoOp => {
            Staged::Register(target.clone(), document_of(txn.get_atom(&target)?))
        }
        PendingOperation::Create => match apply_patch(None, &entry.patch, &key) {
            Ok(document) => Staged::Write(target, document),
            Err(e) => {
                warn!(error = %e, "skipping entry");
                return Ok(None);
            }
        },
        PendingOperation::Patch => {
            let from = AtomRef::new(kind, entry.id.clone(), entry.from_checksum.clone());
            match document_of(txn.get_atom(&from)?) {
                None => Staged::Hammer(target),
                Some(base) => match apply_patch(Some(base), &entry.patch, &key) {
                    Ok(document) => Staged::Write(target, document),
                    Err(e) => {
                        warn!(error = %e, "skipping entry");
                        return Ok(None);
                    }
                },
            }
        }
        PendingOperation::Remove => {
            let from = AtomRef::new(kind, entry.id.clone(), entry.from_checksum.clone());
            Staged::Remove(key, document_of(txn.get_atom(&from)?))
        }
    };
    Ok(Some(staged))
}

fn ensure_target(txn: &StoreTxn, meta: &BatchMeta, explicit_from: Option<&str>) -> Result<()> {
    let current = txn
        .change_set(&meta.change_set_id)?
        .map(|cs| cs.index_checksum);
    let ensured = txn.ensure_index(
        &meta.to_index_checksum,
        &[
            explicit_from,
            current.as_deref(),
            Some(meta.from_index_checksum.as_str()),
        ],
        Some(&meta.change_set_id),
    )?;
    debug!(index = %meta.to_index_checksum, ?ensured, "target index");
    Ok(())
}

fn write_staged(
    txn: &StoreTxn,
    meta: &BatchMeta,
    staged: Vec<Staged>,
    out: &mut Reconciliation,
) -> Result<()> {
    let index = meta.to_index_checksum.as_str();
    let change_set = &meta.change_set_id;
    for item in staged {
        match item {
            Staged::Write(target, document) => {
                let atom = Atom::from_value(
                    target.kind,
                    target.id.clone(),
                    target.checksum.clone(),
                    &document,
                )?;
                txn.put_atom(&atom)?;
                txn.set_member(index, &target)?;
                txn.clear_weak_references_from(change_set, &target.key())?;
                out.written.push(AtomChange {
                    atom: target,
                    document: Some(document),
                    removed: false,
                });
            }
            Staged::Register(target, document) => {
                txn.set_member(index, &target)?;
                txn.clear_weak_references_from(change_set, &target.key())?;
                out.registered.push(AtomChange {
                    atom: target,
                    document,
                    removed: false,
                });
            }
            Staged::Hammer(target) => {
                // the copied row still names the predecessor
                txn.remove_member(index, &target.key())?;
                if !out.hammer.contains(&target) {
                    out.hammer.push(target);
                }
            }
            Staged::Remove(key, document) => {
                if let Some(previous) = txn.remove_member(index, &key)? {
                    txn.clear_weak_references_from(change_set, &key)?;
                    out.removed.push(AtomChange {
                        atom: AtomRef::new(key.kind, key.id, previous),
                        document,
                        removed: true,
                    });
                }
            }
        }
    }
    Ok(())
}

/// Apply a `WORKSPACE_PATCH` batch. `explicit_from` takes precedence over
/// the change-set's index and the batch's own source index when the target
/// index has to be created.
pub fn reconcile_batch(
    store: &AtomStore,
    batch: &PatchBatch,
    explicit_from: Option<&str>,
) -> Result<Reconciliation> {
    let meta = &batch.meta;
    store.transact(|txn| {
        let mut out = Reconciliation {
            index_checksum: meta.to_index_checksum.clone(),
            ..Reconciliation::default()
        };
        let mut staged = Vec::with_capacity(batch.patches.len());
        for entry in &batch.patches {
            let Some(kind) = parse_kind(entry) else {
                out.skipped += 1;
                continue;
            };
            if kind.is_global() || kind.is_index_descriptor() {
                debug!(kind = %kind, id = %entry.id, "not a change-set member");
                out.skipped += 1;
                continue;
            }
            match stage(txn, kind, entry)? {
                Some(item) => staged.push(item),
                None => out.skipped += 1,
            }
        }

        ensure_target(txn, meta, explicit_from)?;
        write_staged(txn, meta, staged, &mut out)?;
        txn.advance_change_set(&meta.workspace_id, &meta.change_set_id, &meta.to_index_checksum)?;
        Ok(out)
    })
}

/// Apply a `WORKSPACE_INDEXUPDATE`: patch the index descriptor, then make
/// membership of the target index match its `mvList`.
pub fn reconcile_index_update(
    store: &AtomStore,
    update: &IndexUpdate,
) -> Result<IndexUpdateOutcome> {
    let meta = &update.meta;
    let entry = &update.patch;
    let key = AtomKey::new(AtomKind::MvIndex, entry.id.clone());
    store.transact(|txn| {
        let base = if entry.from_checksum == ZERO_CHECKSUM {
            None
        } else {
            let from = AtomRef::new(
                AtomKind::MvIndex,
                entry.id.clone(),
                entry.from_checksum.clone(),
            );
            match document_of(txn.get_atom(&from)?) {
                Some(base) => Some(base),
                None => {
                    debug!(index = %entry.from_checksum, "index descriptor predecessor missing");
                    return Ok(IndexUpdateOutcome::NeedsColdStart);
                }
            }
        };
        let descriptor = match apply_patch(base, &entry.patch, &key) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                warn!(error = %e, "index descriptor patch failed");
                return Ok(IndexUpdateOutcome::NeedsColdStart);
            }
        };
        let wanted = match mv_list(&descriptor) {
            Ok(list) => list,
            Err(e) => {
                warn!(error = %e, "index descriptor has no usable mvList");
                return Ok(IndexUpdateOutcome::NeedsColdStart);
            }
        };

        ensure_target(txn, meta, None)?;
        let index = meta.to_index_checksum.as_str();
        let descriptor_atom = Atom::from_value(
            AtomKind::MvIndex,
            entry.id.clone(),
            entry.to_checksum.clone(),
            &descriptor,
        )?;
        txn.put_atom(&descriptor_atom)?;

        let mut out = Reconciliation {
            index_checksum: index.to_string(),
            ..Reconciliation::default()
        };
        let mut current: HashMap<AtomKey, String> = txn
            .index_members(index)?
            .into_iter()
            .map(|r| (r.key(), r.checksum))
            .collect();

        for item in wanted {
            let Ok(kind) = item.kind.parse::<AtomKind>() else {
                out.skipped += 1;
                continue;
            };
            if !keys::storable(&[&item.id, &item.checksum]) {
                warn!(id = ?item.id, "skipping index entry with NUL in its key");
                out.skipped += 1;
                continue;
            }
            if kind.is_global() || kind.is_index_descriptor() {
                continue;
            }
            let target = AtomRef::new(kind, item.id, item.checksum);
            let member = current.remove(&target.key());
            if member.as_deref() == Some(target.checksum.as_str()) {
                continue;
            }
            if txn.atom_exists(&target)? {
                txn.set_member(index, &target)?;
                let document = document_of(txn.get_atom(&target)?);
                out.registered.push(AtomChange {
                    atom: target,
                    document,
                    removed: false,
                });
            } else {
                txn.remove_member(index, &target.key())?;
                out.hammer.push(target);
            }
        }

        for (key, checksum) in current {
            txn.remove_member(index, &key)?;
            txn.clear_weak_references_from(&meta.change_set_id, &key)?;
            let document = document_of(txn.get_atom(&AtomRef::new(
                key.kind,
                key.id.clone(),
                checksum.clone(),
            ))?);
            out.removed.push(AtomChange {
                atom: AtomRef::new(key.kind, key.id, checksum),
                document,
                removed: true,
            });
        }

        txn.advance_change_set(&meta.workspace_id, &meta.change_set_id, index)?;
        Ok(IndexUpdateOutcome::Applied(out))
    })
}

/// What a deployment batch did
#[derive(Debug, Default)]
pub struct GlobalReconciliation {
    /// Keys whose global row changed
    pub changed: Vec<AtomKey>,
    /// Keys whose current version could not be derived locally
    pub fetch: Vec<AtomKey>,
    pub skipped: usize,
}

/// Apply a `DEPLOYMENT_PATCH` batch to the global table
pub fn reconcile_deployment_batch(
    store: &AtomStore,
    batch: &DeploymentPatchBatch,
) -> Result<GlobalReconciliation> {
    store.transact(|txn| {
        let mut out = GlobalReconciliation::default();
        let mut staged: Vec<(AtomKey, Option<Atom>)> = Vec::new();
        for entry in &batch.patches {
            let Some(kind) = parse_kind(entry) else {
                out.skipped += 1;
                continue;
            };
            if !kind.is_global() {
                debug!(kind = %kind, id = %entry.id, "not a deployment atom");
                out.skipped += 1;
                continue;
            }
            let key = AtomKey::new(kind, entry.id.clone());
            let current = txn.get_global(&key)?;
            if entry.to_checksum == ZERO_CHECKSUM {
                staged.push((key, None));
                continue;
            }
            if current.as_ref().is_some_and(|c| c.checksum == entry.to_checksum) {
                continue;
            }
            let base = if entry.from_checksum == ZERO_CHECKSUM {
                None
            } else {
                match current.filter(|c| c.checksum == entry.from_checksum) {
                    Some(current) => document_of(Some(current)),
                    None => {
                        out.fetch.push(key);
                        continue;
                    }
                }
            };
            match apply_patch(base, &entry.patch, &key) {
                Ok(document) => {
                    let atom = Atom::from_value(
                        kind,
                        entry.id.clone(),
                        entry.to_checksum.clone(),
                        &document,
                    )?;
                    staged.push((key, Some(atom)));
                }
                Err(e) => {
                    warn!(error = %e, "skipping entry");
                    out.skipped += 1;
                }
            }
        }
        for (key, atom) in staged {
            match atom {
                Some(atom) => txn.put_global(&atom)?,
                None => {
                    txn.remove_global(&key)?;
                }
            }
            out.changed.push(key);
        }
        Ok(out)
    })
}

/// Apply a `DEPLOYMENT_INDEXUPDATE`: patch the deployment descriptor and
/// report which globals disagree with its `mvList`.
pub fn reconcile_deployment_index(
    store: &AtomStore,
    update: &DeploymentIndexUpdate,
) -> Result<Option<GlobalReconciliation>> {
    let entry = &update.patch;
    let key = AtomKey::new(AtomKind::DeploymentMvIndex, entry.id.clone());
    store.transact(|txn| {
        let current = txn.get_global(&key)?;
        let base = if entry.from_checksum == ZERO_CHECKSUM {
            None
        } else {
            match current.filter(|c| c.checksum == entry.from_checksum) {
                Some(current) => match document_of(Some(current)) {
                    Some(base) => Some(base),
                    None => return Ok(None),
                },
                None => return Ok(None),
            }
        };
        let Ok(descriptor) = apply_patch(base, &entry.patch, &key) else {
            return Ok(None);
        };
        let Ok(wanted) = mv_list(&descriptor) else {
            return Ok(None);
        };
        txn.put_global(&Atom::from_value(
            AtomKind::DeploymentMvIndex,
            entry.id.clone(),
            entry.to_checksum.clone(),
            &descriptor,
        )?)?;

        let mut out = GlobalReconciliation::default();
        let mut stored: HashMap<AtomKey, String> = txn
            .global_refs()?
            .into_iter()
            .filter(|r| !r.kind.is_index_descriptor())
            .map(|r| (r.key(), r.checksum))
            .collect();
        for item in wanted {
            let Ok(kind) = item.kind.parse::<AtomKind>() else {
                out.skipped += 1;
                continue;
            };
            if !keys::storable(&[&item.id]) {
                out.skipped += 1;
                continue;
            }
            let key = AtomKey::new(kind, item.id);
            if stored.remove(&key).as_deref() != Some(item.checksum.as_str()) {
                out.fetch.push(key);
            }
        }
        for key in stored.into_keys() {
            txn.remove_global(&key)?;
            out.changed.push(key);
        }
        Ok(Some(out))
    })
}
