//! Batch write transaction over the replica.
//!
//! A [`StoreTxn`] wraps one redb write transaction. Reads made through it
//! observe its own staged writes. Nothing is visible to other readers until
//! [`StoreTxn::commit`]; dropping the transaction discards every write.

use crate::error::{StoreError, StoreResult};
use crate::types::{StoredChangeSet, StoredGlobalAtom, StoredIndex, now_ms};
use crate::{keys, reads, tables};
use atomsync_common::{
    Atom, AtomKey, AtomKind, AtomRef, ChangeSet, ChangeSetId, GlobalAtom, WeakReference,
    WorkspaceId,
};
use redb::{ReadableTable, WriteTransaction};
use tracing::debug;

/// Outcome of [`StoreTxn::ensure_index`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnsuredIndex {
    /// The index already existed
    Existing,
    /// The index was created as a copy of `from`
    Copied { from: String, members: usize },
    /// No source index was available; the index starts empty
    Empty,
}

pub struct StoreTxn {
    txn: WriteTransaction,
}

impl StoreTxn {
    pub(crate) const fn new(txn: WriteTransaction) -> Self {
        Self { txn }
    }

    pub fn commit(self) -> StoreResult<()> {
        self.txn.commit()?;
        Ok(())
    }

    // ---- Atoms ----

    /// Write atom bytes. Atoms are immutable, so rewriting is a no-op.
    pub fn put_atom(&self, atom: &Atom) -> StoreResult<()> {
        keys::check("atoms", &[&atom.id, &atom.checksum])?;
        let mut table = self.txn.open_table(tables::ATOMS)?;
        let key = keys::atom(&atom.atom_ref());
        if table.get(key.as_str())?.is_none() {
            table.insert(key.as_str(), atom.document.as_ref())?;
        }
        Ok(())
    }

    pub fn get_atom(&self, r: &AtomRef) -> StoreResult<Option<Atom>> {
        let table = self.txn.open_table(tables::ATOMS)?;
        reads::atom(&table, r)
    }

    pub fn atom_exists(&self, r: &AtomRef) -> StoreResult<bool> {
        let table = self.txn.open_table(tables::ATOMS)?;
        reads::atom_exists(&table, r)
    }

    pub fn delete_atom(&self, r: &AtomRef) -> StoreResult<bool> {
        let mut table = self.txn.open_table(tables::ATOMS)?;
        let removed = table.remove(keys::atom(r).as_str())?.is_some();
        Ok(removed)
    }

    /// Every stored atom version
    pub fn atom_refs(&self) -> StoreResult<Vec<AtomRef>> {
        let table = self.txn.open_table(tables::ATOMS)?;
        let mut refs = Vec::new();
        for entry in table.iter()? {
            let (key, _) = entry?;
            refs.push(keys::parse_atom(key.value())?);
        }
        Ok(refs)
    }

    // ---- Indexes ----

    pub fn index_exists(&self, checksum: &str) -> StoreResult<bool> {
        let table = self.txn.open_table(tables::INDEXES)?;
        let exists = table.get(checksum)?.is_some();
        Ok(exists)
    }

    pub fn create_index(
        &self,
        checksum: &str,
        created_by: Option<&ChangeSetId>,
    ) -> StoreResult<()> {
        keys::check("indexes", &[checksum])?;
        let stored = StoredIndex {
            created_by: created_by.map(|cs| cs.as_str().to_string()),
            created_at_ms: now_ms(),
        };
        let bytes = bincode::serialize(&stored)?;
        let mut table = self.txn.open_table(tables::INDEXES)?;
        table.insert(checksum, bytes.as_slice())?;
        Ok(())
    }

    pub fn index_record(&self, checksum: &str) -> StoreResult<Option<StoredIndex>> {
        let table = self.txn.open_table(tables::INDEXES)?;
        let Some(bytes) = table.get(checksum)? else {
            return Ok(None);
        };
        Ok(Some(bincode::deserialize(bytes.value())?))
    }

    pub fn index_checksums(&self) -> StoreResult<Vec<String>> {
        let table = self.txn.open_table(tables::INDEXES)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (key, _) = entry?;
            result.push(key.value().to_string());
        }
        Ok(result)
    }

    /// Make sure index `to` exists, copying membership from the first
    /// existing candidate when it has to be created.
    ///
    /// Candidates are tried in order; `None` entries and candidates equal
    /// to `to` are skipped.
    pub fn ensure_index(
        &self,
        to: &str,
        candidates: &[Option<&str>],
        created_by: Option<&ChangeSetId>,
    ) -> StoreResult<EnsuredIndex> {
        if self.index_exists(to)? {
            return Ok(EnsuredIndex::Existing);
        }
        self.create_index(to, created_by)?;
        for candidate in candidates.iter().flatten() {
            if *candidate == to || !self.index_exists(candidate)? {
                continue;
            }
            let members = self.copy_index(candidate, to)?;
            debug!(from = %candidate, to = %to, members, "copied index");
            return Ok(EnsuredIndex::Copied {
                from: (*candidate).to_string(),
                members,
            });
        }
        debug!(to = %to, "created empty index");
        Ok(EnsuredIndex::Empty)
    }

    /// Copy every membership row of `from` into `to`, rewriting the index
    /// column. Returns the number of rows copied.
    pub fn copy_index(&self, from: &str, to: &str) -> StoreResult<usize> {
        let rows = self.index_members(from)?;
        let mut members = self.txn.open_table(tables::INDEX_MEMBERS)?;
        let mut membership = self.txn.open_table(tables::ATOM_MEMBERSHIP)?;
        for r in &rows {
            members.insert(keys::member(to, &r.key()).as_str(), r.checksum.as_str())?;
            membership.insert(keys::membership(r, to).as_str(), ())?;
        }
        Ok(rows.len())
    }

    /// Remove an index with all of its membership rows
    pub fn drop_index(&self, checksum: &str) -> StoreResult<usize> {
        let rows = self.index_members(checksum)?;
        {
            let mut members = self.txn.open_table(tables::INDEX_MEMBERS)?;
            let mut membership = self.txn.open_table(tables::ATOM_MEMBERSHIP)?;
            for r in &rows {
                members.remove(keys::member(checksum, &r.key()).as_str())?;
                membership.remove(keys::membership(r, checksum).as_str())?;
            }
        }
        let mut indexes = self.txn.open_table(tables::INDEXES)?;
        indexes.remove(checksum)?;
        Ok(rows.len())
    }

    // ---- Membership ----

    pub fn member_checksum(&self, index: &str, key: &AtomKey) -> StoreResult<Option<String>> {
        let table = self.txn.open_table(tables::INDEX_MEMBERS)?;
        reads::member_checksum(&table, index, key)
    }

    pub fn index_members(&self, index: &str) -> StoreResult<Vec<AtomRef>> {
        let table = self.txn.open_table(tables::INDEX_MEMBERS)?;
        reads::index_members(&table, index)
    }

    /// Point `(index, kind, id)` at `r.checksum`, replacing any prior row
    pub fn set_member(&self, index: &str, r: &AtomRef) -> StoreResult<()> {
        keys::check("index_members", &[index, &r.id, &r.checksum])?;
        let previous = self.member_checksum(index, &r.key())?;
        let mut members = self.txn.open_table(tables::INDEX_MEMBERS)?;
        let mut membership = self.txn.open_table(tables::ATOM_MEMBERSHIP)?;
        if let Some(previous) = previous {
            if previous == r.checksum {
                return Ok(());
            }
            let old = AtomRef::new(r.kind, r.id.clone(), previous);
            membership.remove(keys::membership(&old, index).as_str())?;
        }
        members.insert(keys::member(index, &r.key()).as_str(), r.checksum.as_str())?;
        membership.insert(keys::membership(r, index).as_str(), ())?;
        Ok(())
    }

    /// Drop `(kind, id)` from the index; returns the checksum it pointed at
    pub fn remove_member(&self, index: &str, key: &AtomKey) -> StoreResult<Option<String>> {
        let Some(previous) = self.member_checksum(index, key)? else {
            return Ok(None);
        };
        let mut members = self.txn.open_table(tables::INDEX_MEMBERS)?;
        let mut membership = self.txn.open_table(tables::ATOM_MEMBERSHIP)?;
        members.remove(keys::member(index, key).as_str())?;
        let old = AtomRef::new(key.kind, key.id.clone(), previous.clone());
        membership.remove(keys::membership(&old, index).as_str())?;
        Ok(Some(previous))
    }

    pub fn indexes_containing(&self, r: &AtomRef) -> StoreResult<Vec<String>> {
        let table = self.txn.open_table(tables::ATOM_MEMBERSHIP)?;
        reads::indexes_containing(&table, r)
    }

    // ---- Change-sets ----

    pub fn change_set(&self, id: &ChangeSetId) -> StoreResult<Option<ChangeSet>> {
        let table = self.txn.open_table(tables::CHANGE_SETS)?;
        reads::change_set(&table, id)
    }

    pub fn change_sets(&self) -> StoreResult<Vec<ChangeSet>> {
        let table = self.txn.open_table(tables::CHANGE_SETS)?;
        reads::change_sets(&table)
    }

    /// Whether a change-set other than `except` points at `checksum`
    pub fn index_shared(&self, checksum: &str, except: &ChangeSetId) -> StoreResult<bool> {
        Ok(self
            .change_sets()?
            .iter()
            .any(|cs| cs.index_checksum == checksum && &cs.id != except))
    }

    /// Register a change-set pointing at `index_checksum` unless it is
    /// already known. Returns whether a row was created.
    pub fn ensure_change_set(
        &self,
        workspace: &WorkspaceId,
        id: &ChangeSetId,
        index_checksum: &str,
    ) -> StoreResult<bool> {
        if self.change_set(id)?.is_some() {
            return Ok(false);
        }
        self.write_change_set(workspace, id, index_checksum)?;
        Ok(true)
    }

    /// Move the change-set pointer to `index_checksum`
    pub fn advance_change_set(
        &self,
        workspace: &WorkspaceId,
        id: &ChangeSetId,
        index_checksum: &str,
    ) -> StoreResult<()> {
        self.write_change_set(workspace, id, index_checksum)
    }

    fn write_change_set(
        &self,
        workspace: &WorkspaceId,
        id: &ChangeSetId,
        index_checksum: &str,
    ) -> StoreResult<()> {
        keys::check("change_sets", &[id.as_str(), index_checksum])?;
        let stored = StoredChangeSet {
            workspace_id: workspace.as_str().to_string(),
            index_checksum: index_checksum.to_string(),
        };
        let bytes = bincode::serialize(&stored)?;
        let mut table = self.txn.open_table(tables::CHANGE_SETS)?;
        table.insert(id.as_str(), bytes.as_slice())?;
        Ok(())
    }

    pub fn delete_change_set(&self, id: &ChangeSetId) -> StoreResult<Option<ChangeSet>> {
        let existing = self.change_set(id)?;
        if existing.is_some() {
            let mut table = self.txn.open_table(tables::CHANGE_SETS)?;
            table.remove(id.as_str())?;
        }
        Ok(existing)
    }

    /// Resolve `(kind, id)` through the change-set's current index
    pub fn resolve(&self, change_set: &ChangeSetId, key: &AtomKey) -> StoreResult<Option<Atom>> {
        let Some(cs) = self.change_set(change_set)? else {
            return Err(StoreError::ChangeSetNotFound(change_set.to_string()));
        };
        let Some(checksum) = self.member_checksum(&cs.index_checksum, key)? else {
            return Ok(None);
        };
        self.get_atom(&AtomRef::new(key.kind, key.id.clone(), checksum))
    }

    // ---- Weak references ----

    pub fn add_weak_reference(&self, weak: &WeakReference) -> StoreResult<()> {
        keys::check(
            "weak_references",
            &[weak.change_set_id.as_str(), &weak.target.id, &weak.referrer.id],
        )?;
        let mut table = self.txn.open_table(tables::WEAK_REFERENCES)?;
        table.insert(
            keys::weak_reference(&weak.change_set_id, &weak.target, &weak.referrer).as_str(),
            (),
        )?;
        Ok(())
    }

    pub fn referrers(
        &self,
        change_set: &ChangeSetId,
        target: &AtomKey,
    ) -> StoreResult<Vec<AtomKey>> {
        let table = self.txn.open_table(tables::WEAK_REFERENCES)?;
        reads::referrers(&table, change_set, target)
    }

    /// Drop every weak reference of a change-set
    pub fn clear_weak_references(&self, change_set: &ChangeSetId) -> StoreResult<usize> {
        let mut table = self.txn.open_table(tables::WEAK_REFERENCES)?;
        let doomed = reads::keys_with_prefix(&table, &keys::change_set_prefix(change_set))?;
        for key in &doomed {
            table.remove(key.as_str())?;
        }
        Ok(doomed.len())
    }

    /// Drop the weak references recorded by one referrer
    pub fn clear_weak_references_from(
        &self,
        change_set: &ChangeSetId,
        referrer: &AtomKey,
    ) -> StoreResult<usize> {
        let mut table = self.txn.open_table(tables::WEAK_REFERENCES)?;
        let mut doomed = Vec::new();
        for key in reads::keys_with_prefix(&table, &keys::change_set_prefix(change_set))? {
            let (_, from) = keys::parse_weak_reference(&key)?;
            if &from == referrer {
                doomed.push(key);
            }
        }
        for key in &doomed {
            table.remove(key.as_str())?;
        }
        Ok(doomed.len())
    }

    // ---- Global atoms ----

    pub fn put_global(&self, atom: &GlobalAtom) -> StoreResult<()> {
        keys::check("global_atoms", &[&atom.id])?;
        let stored = StoredGlobalAtom {
            checksum: atom.checksum.clone(),
            document: atom.document.to_vec(),
        };
        let bytes = bincode::serialize(&stored)?;
        let mut table = self.txn.open_table(tables::GLOBAL_ATOMS)?;
        table.insert(keys::global(&atom.key()).as_str(), bytes.as_slice())?;
        Ok(())
    }

    pub fn get_global(&self, key: &AtomKey) -> StoreResult<Option<GlobalAtom>> {
        let table = self.txn.open_table(tables::GLOBAL_ATOMS)?;
        reads::global(&table, key)
    }

    pub fn remove_global(&self, key: &AtomKey) -> StoreResult<bool> {
        let mut table = self.txn.open_table(tables::GLOBAL_ATOMS)?;
        let removed = table.remove(keys::global(key).as_str())?.is_some();
        Ok(removed)
    }

    /// Every deployment-scoped atom key with its checksum
    pub fn global_refs(&self) -> StoreResult<Vec<AtomRef>> {
        let table = self.txn.open_table(tables::GLOBAL_ATOMS)?;
        let mut refs = Vec::new();
        for entry in table.iter()? {
            let (key, bytes) = entry?;
            let atom_key = keys::parse_global(key.value())?;
            let stored: StoredGlobalAtom = bincode::deserialize(bytes.value())?;
            refs.push(AtomRef::new(atom_key.kind, atom_key.id, stored.checksum));
        }
        Ok(refs)
    }

    /// Remove descriptor atoms of a dropped index
    pub fn delete_index_descriptors(&self, checksum: &str) -> StoreResult<usize> {
        let mut table = self.txn.open_table(tables::ATOMS)?;
        let mut doomed = Vec::new();
        for key in reads::keys_with_prefix(&table, &keys::atom_kind_prefix(AtomKind::MvIndex))? {
            if keys::parse_atom(&key)?.checksum == checksum {
                doomed.push(key);
            }
        }
        for key in &doomed {
            table.remove(key.as_str())?;
        }
        Ok(doomed.len())
    }
}
