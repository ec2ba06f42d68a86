//! Table reads shared by read-only and write transactions.

use crate::error::StoreResult;
use crate::keys;
use crate::types::{StoredChangeSet, StoredGlobalAtom};
use atomsync_common::{
    Atom, AtomKey, AtomRef, ChangeSet, ChangeSetId, GlobalAtom, WorkspaceId,
};
use redb::ReadableTable;

/// Keys starting with `prefix`, in key order
pub fn keys_with_prefix<V, T>(table: &T, prefix: &str) -> StoreResult<Vec<String>>
where
    V: redb::Value + 'static,
    T: ReadableTable<&'static str, V>,
{
    let mut keys = Vec::new();
    for entry in table.range(prefix..)? {
        let (key, _) = entry?;
        let key = key.value();
        if !key.starts_with(prefix) {
            break;
        }
        keys.push(key.to_string());
    }
    Ok(keys)
}

pub fn atom<T>(table: &T, r: &AtomRef) -> StoreResult<Option<Atom>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    Ok(table
        .get(keys::atom(r).as_str())?
        .map(|bytes| Atom::new(r.kind, r.id.clone(), r.checksum.clone(), bytes.value().to_vec())))
}

pub fn atom_exists<T>(table: &T, r: &AtomRef) -> StoreResult<bool>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    Ok(table.get(keys::atom(r).as_str())?.is_some())
}

pub fn member_checksum<T>(table: &T, index: &str, key: &AtomKey) -> StoreResult<Option<String>>
where
    T: ReadableTable<&'static str, &'static str>,
{
    Ok(table
        .get(keys::member(index, key).as_str())?
        .map(|checksum| checksum.value().to_string()))
}

pub fn index_members<T>(table: &T, index: &str) -> StoreResult<Vec<AtomRef>>
where
    T: ReadableTable<&'static str, &'static str>,
{
    let prefix = keys::index_prefix(index);
    let mut members = Vec::new();
    for entry in table.range(prefix.as_str()..)? {
        let (key, checksum) = entry?;
        let key = key.value();
        if !key.starts_with(&prefix) {
            break;
        }
        let (_, atom_key) = keys::parse_member(key)?;
        members.push(AtomRef::new(atom_key.kind, atom_key.id, checksum.value()));
    }
    Ok(members)
}

pub fn indexes_containing<T>(table: &T, r: &AtomRef) -> StoreResult<Vec<String>>
where
    T: ReadableTable<&'static str, ()>,
{
    keys_with_prefix(table, &keys::membership_prefix(r))?
        .iter()
        .map(|key| keys::parse_membership_index(key))
        .collect()
}

pub fn change_set<T>(table: &T, id: &ChangeSetId) -> StoreResult<Option<ChangeSet>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    let Some(bytes) = table.get(id.as_str())? else {
        return Ok(None);
    };
    let stored: StoredChangeSet = bincode::deserialize(bytes.value())?;
    Ok(Some(ChangeSet {
        id: id.clone(),
        workspace_id: WorkspaceId::new(stored.workspace_id),
        index_checksum: stored.index_checksum,
    }))
}

pub fn change_sets<T>(table: &T) -> StoreResult<Vec<ChangeSet>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    let mut result = Vec::new();
    for entry in table.iter()? {
        let (key, bytes) = entry?;
        let stored: StoredChangeSet = bincode::deserialize(bytes.value())?;
        result.push(ChangeSet {
            id: ChangeSetId::new(key.value()),
            workspace_id: WorkspaceId::new(stored.workspace_id),
            index_checksum: stored.index_checksum,
        });
    }
    Ok(result)
}

pub fn referrers<T>(
    table: &T,
    change_set: &ChangeSetId,
    target: &AtomKey,
) -> StoreResult<Vec<AtomKey>>
where
    T: ReadableTable<&'static str, ()>,
{
    keys_with_prefix(table, &keys::weak_target_prefix(change_set, target))?
        .iter()
        .map(|key| keys::parse_weak_reference(key).map(|(_, referrer)| referrer))
        .collect()
}

pub fn global<T>(table: &T, key: &AtomKey) -> StoreResult<Option<GlobalAtom>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    let Some(bytes) = table.get(keys::global(key).as_str())? else {
        return Ok(None);
    };
    let stored: StoredGlobalAtom = bincode::deserialize(bytes.value())?;
    Ok(Some(Atom::new(key.kind, key.id.clone(), stored.checksum, stored.document)))
}
