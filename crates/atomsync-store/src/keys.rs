//! Composite key encoding
//!
//! Key parts are joined with a NUL byte, so a part must never contain one.
//! Writers check their parts with [`check`]; given that, a prefix ending in
//! NUL matches exactly one parent.

use crate::error::{StoreError, StoreResult};
use atomsync_common::{AtomKey, AtomKind, AtomRef, ChangeSetId};

pub const SEP: char = '\0';

/// Whether every part can be encoded into a key
pub fn storable(parts: &[&str]) -> bool {
    parts.iter().all(|part| !part.contains(SEP))
}

/// Refuse parts that would split into extra key segments
pub fn check(table: &'static str, parts: &[&str]) -> StoreResult<()> {
    if storable(parts) {
        return Ok(());
    }
    Err(StoreError::UnstorableKey {
        table,
        key: join(parts),
    })
}

fn join(parts: &[&str]) -> String {
    let mut key = String::with_capacity(parts.iter().map(|p| p.len() + 1).sum());
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            key.push(SEP);
        }
        key.push_str(part);
    }
    key
}

fn prefix(parts: &[&str]) -> String {
    let mut key = join(parts);
    key.push(SEP);
    key
}

fn split<'a, const N: usize>(table: &'static str, key: &'a str) -> StoreResult<[&'a str; N]> {
    let parts: Vec<&str> = key.split(SEP).collect();
    <[&str; N]>::try_from(parts).map_err(|_| StoreError::CorruptKey {
        table,
        key: key.to_string(),
    })
}

fn parse_kind(table: &'static str, key: &str, kind: &str) -> StoreResult<AtomKind> {
    kind.parse().map_err(|_| StoreError::CorruptKey {
        table,
        key: key.to_string(),
    })
}

// ---- atoms: kind\0id\0checksum ----

pub fn atom(r: &AtomRef) -> String {
    join(&[r.kind.as_str(), &r.id, &r.checksum])
}

pub fn atom_kind_prefix(kind: AtomKind) -> String {
    prefix(&[kind.as_str()])
}

pub fn parse_atom(key: &str) -> StoreResult<AtomRef> {
    let [kind, id, checksum] = split::<3>("atoms", key)?;
    Ok(AtomRef::new(parse_kind("atoms", key, kind)?, id, checksum))
}

// ---- global atoms: kind\0id ----

pub fn global(key: &AtomKey) -> String {
    join(&[key.kind.as_str(), &key.id])
}

pub fn parse_global(key: &str) -> StoreResult<AtomKey> {
    let [kind, id] = split::<2>("global_atoms", key)?;
    Ok(AtomKey::new(parse_kind("global_atoms", key, kind)?, id))
}

// ---- index members: index\0kind\0id ----

pub fn member(index: &str, key: &AtomKey) -> String {
    join(&[index, key.kind.as_str(), &key.id])
}

pub fn index_prefix(index: &str) -> String {
    prefix(&[index])
}

pub fn parse_member(key: &str) -> StoreResult<(String, AtomKey)> {
    let [index, kind, id] = split::<3>("index_members", key)?;
    Ok((
        index.to_string(),
        AtomKey::new(parse_kind("index_members", key, kind)?, id),
    ))
}

// ---- reverse membership: kind\0id\0checksum\0index ----

pub fn membership(r: &AtomRef, index: &str) -> String {
    join(&[r.kind.as_str(), &r.id, &r.checksum, index])
}

pub fn membership_prefix(r: &AtomRef) -> String {
    prefix(&[r.kind.as_str(), &r.id, &r.checksum])
}

pub fn parse_membership_index(key: &str) -> StoreResult<String> {
    let [_, _, _, index] = split::<4>("atom_membership", key)?;
    Ok(index.to_string())
}

// ---- weak references: cs\0targetKind\0targetId\0referrerKind\0referrerId ----

pub fn weak_reference(
    change_set: &ChangeSetId,
    target: &AtomKey,
    referrer: &AtomKey,
) -> String {
    join(&[
        change_set.as_str(),
        target.kind.as_str(),
        &target.id,
        referrer.kind.as_str(),
        &referrer.id,
    ])
}

pub fn weak_target_prefix(change_set: &ChangeSetId, target: &AtomKey) -> String {
    prefix(&[change_set.as_str(), target.kind.as_str(), &target.id])
}

pub fn change_set_prefix(change_set: &ChangeSetId) -> String {
    prefix(&[change_set.as_str()])
}

pub fn parse_weak_reference(key: &str) -> StoreResult<(AtomKey, AtomKey)> {
    let [_, tkind, tid, rkind, rid] = split::<5>("weak_references", key)?;
    Ok((
        AtomKey::new(parse_kind("weak_references", key, tkind)?, tid),
        AtomKey::new(parse_kind("weak_references", key, rkind)?, rid),
    ))
}
