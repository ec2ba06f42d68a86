//! Persistent atom replica backed by redb.
//!
//! Reads open their own read transaction and always see the last committed
//! state. Writes are grouped with [`AtomStore::transact`], which commits
//! only when the closure succeeds.

use crate::error::{StoreError, StoreResult};
use crate::txn::StoreTxn;
use crate::{reads, tables};
use atomsync_common::{Atom, AtomKey, AtomRef, ChangeSet, ChangeSetId, GlobalAtom};
use redb::{Database, ReadableTable, ReadableTableMetadata};
use std::path::Path;
use tracing::{debug, info};

/// Row counts per table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub atoms: u64,
    pub global_atoms: u64,
    pub indexes: u64,
    pub index_members: u64,
    pub change_sets: u64,
    pub weak_references: u64,
}

/// Local replica of server-side atoms.
pub struct AtomStore {
    db: Database,
}

impl AtomStore {
    /// Open (or create) the redb database at the given path.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create all tables eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(tables::ATOMS)?;
            let _t = write_txn.open_table(tables::GLOBAL_ATOMS)?;
            let _t = write_txn.open_table(tables::INDEXES)?;
            let _t = write_txn.open_table(tables::INDEX_MEMBERS)?;
            let _t = write_txn.open_table(tables::ATOM_MEMBERSHIP)?;
            let _t = write_txn.open_table(tables::CHANGE_SETS)?;
            let _t = write_txn.open_table(tables::WEAK_REFERENCES)?;
            let _t = write_txn.open_table(tables::LEASES)?;
        }
        write_txn.commit()?;

        info!(path = %path.display(), "opened atom store");
        Ok(Self { db })
    }

    /// Begin a batch write transaction
    pub fn begin(&self) -> StoreResult<StoreTxn> {
        Ok(StoreTxn::new(self.db.begin_write()?))
    }

    /// Run `f` inside one write transaction, committing only on success.
    pub fn transact<T, E>(&self, f: impl FnOnce(&StoreTxn) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let txn = self.begin()?;
        let value = f(&txn)?;
        txn.commit()?;
        Ok(value)
    }

    // ---- Atoms ----

    pub fn get_atom(&self, r: &AtomRef) -> StoreResult<Option<Atom>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::ATOMS)?;
        reads::atom(&table, r)
    }

    pub fn atom_exists(&self, r: &AtomRef) -> StoreResult<bool> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::ATOMS)?;
        reads::atom_exists(&table, r)
    }

    // ---- Indexes ----

    pub fn index_exists(&self, checksum: &str) -> StoreResult<bool> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::INDEXES)?;
        let exists = table.get(checksum)?.is_some();
        Ok(exists)
    }

    pub fn member_checksum(&self, index: &str, key: &AtomKey) -> StoreResult<Option<String>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::INDEX_MEMBERS)?;
        reads::member_checksum(&table, index, key)
    }

    pub fn index_members(&self, index: &str) -> StoreResult<Vec<AtomRef>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::INDEX_MEMBERS)?;
        reads::index_members(&table, index)
    }

    /// Indexes in which this exact atom version is a member
    pub fn exists_in_index(&self, r: &AtomRef) -> StoreResult<Vec<String>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::ATOM_MEMBERSHIP)?;
        reads::indexes_containing(&table, r)
    }

    // ---- Change-sets ----

    pub fn change_set(&self, id: &ChangeSetId) -> StoreResult<Option<ChangeSet>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::CHANGE_SETS)?;
        reads::change_set(&table, id)
    }

    pub fn change_set_exists(&self, id: &ChangeSetId) -> StoreResult<bool> {
        Ok(self.change_set(id)?.is_some())
    }

    pub fn change_sets(&self) -> StoreResult<Vec<ChangeSet>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::CHANGE_SETS)?;
        reads::change_sets(&table)
    }

    /// Resolve `(kind, id)` through the change-set's current index.
    ///
    /// Returns `Ok(None)` when the change-set is known but has no such
    /// member, or the member's bytes are missing.
    pub fn get(&self, change_set: &ChangeSetId, key: &AtomKey) -> StoreResult<Option<Atom>> {
        let read_txn = self.db.begin_read()?;
        let change_sets = read_txn.open_table(tables::CHANGE_SETS)?;
        let Some(cs) = reads::change_set(&change_sets, change_set)? else {
            return Err(StoreError::ChangeSetNotFound(change_set.to_string()));
        };
        let members = read_txn.open_table(tables::INDEX_MEMBERS)?;
        let Some(checksum) = reads::member_checksum(&members, &cs.index_checksum, key)? else {
            return Ok(None);
        };
        let atoms = read_txn.open_table(tables::ATOMS)?;
        reads::atom(&atoms, &AtomRef::new(key.kind, key.id.clone(), checksum))
    }

    /// Every member of the change-set's current index with its bytes.
    /// Members whose bytes are missing are skipped.
    pub fn dump_change_set(&self, change_set: &ChangeSetId) -> StoreResult<Vec<Atom>> {
        let read_txn = self.db.begin_read()?;
        let change_sets = read_txn.open_table(tables::CHANGE_SETS)?;
        let Some(cs) = reads::change_set(&change_sets, change_set)? else {
            return Err(StoreError::ChangeSetNotFound(change_set.to_string()));
        };
        let members = read_txn.open_table(tables::INDEX_MEMBERS)?;
        let atoms = read_txn.open_table(tables::ATOMS)?;
        let mut result = Vec::new();
        for r in reads::index_members(&members, &cs.index_checksum)? {
            if let Some(atom) = reads::atom(&atoms, &r)? {
                result.push(atom);
            }
        }
        Ok(result)
    }

    // ---- Weak references ----

    pub fn referrers(
        &self,
        change_set: &ChangeSetId,
        target: &AtomKey,
    ) -> StoreResult<Vec<AtomKey>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::WEAK_REFERENCES)?;
        reads::referrers(&table, change_set, target)
    }

    // ---- Global atoms ----

    pub fn get_global(&self, key: &AtomKey) -> StoreResult<Option<GlobalAtom>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::GLOBAL_ATOMS)?;
        reads::global(&table, key)
    }

    // ---- Maintenance ----

    pub fn stats(&self) -> StoreResult<StoreStats> {
        let read_txn = self.db.begin_read()?;
        Ok(StoreStats {
            atoms: read_txn.open_table(tables::ATOMS)?.len()?,
            global_atoms: read_txn.open_table(tables::GLOBAL_ATOMS)?.len()?,
            indexes: read_txn.open_table(tables::INDEXES)?.len()?,
            index_members: read_txn.open_table(tables::INDEX_MEMBERS)?.len()?,
            change_sets: read_txn.open_table(tables::CHANGE_SETS)?.len()?,
            weak_references: read_txn.open_table(tables::WEAK_REFERENCES)?.len()?,
        })
    }

    /// Drop every row of every table except the writer lease.
    pub fn reset(&self) -> StoreResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            for table in [
                tables::ATOMS,
                tables::GLOBAL_ATOMS,
                tables::INDEXES,
                tables::CHANGE_SETS,
            ] {
                let mut t = write_txn.open_table(table)?;
                t.retain(|_, _| false)?;
            }
            write_txn
                .open_table(tables::INDEX_MEMBERS)?
                .retain(|_, _| false)?;
            for table in [tables::ATOM_MEMBERSHIP, tables::WEAK_REFERENCES] {
                write_txn.open_table(table)?.retain(|_, _| false)?;
            }
        }
        write_txn.commit()?;
        debug!("reset atom store");
        Ok(())
    }

    pub(crate) const fn db(&self) -> &Database {
        &self.db
    }
}
