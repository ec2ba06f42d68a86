//! Redb table definitions for the local replica.
//!
//! Composite keys join their parts with `\x00` (see [`crate::keys`]) so a
//! prefix scan selects every row of one index, one atom or one change-set.

use redb::TableDefinition;

// Atom bytes. Key: "kind\0id\0checksum", Value: JSON document
pub const ATOMS: TableDefinition<&str, &[u8]> = TableDefinition::new("atoms");

// Deployment-scoped atoms. Key: "kind\0id", Value: bincode StoredGlobalAtom
pub const GLOBAL_ATOMS: TableDefinition<&str, &[u8]> = TableDefinition::new("global_atoms");

// Known index snapshots. Key: index checksum, Value: bincode StoredIndex
pub const INDEXES: TableDefinition<&str, &[u8]> = TableDefinition::new("indexes");

// Index membership. Key: "index\0kind\0id", Value: atom checksum.
// One row per (index, kind, id): inserting replaces.
pub const INDEX_MEMBERS: TableDefinition<&str, &str> = TableDefinition::new("index_members");

// Reverse membership. Key: "kind\0id\0checksum\0index"
pub const ATOM_MEMBERSHIP: TableDefinition<&str, ()> = TableDefinition::new("atom_membership");

// Change-sets. Key: change-set id, Value: bincode StoredChangeSet
pub const CHANGE_SETS: TableDefinition<&str, &[u8]> = TableDefinition::new("change_sets");

// Weak references. Key: "changeSet\0targetKind\0targetId\0referrerKind\0referrerId"
pub const WEAK_REFERENCES: TableDefinition<&str, ()> = TableDefinition::new("weak_references");

// Writer lease. Key: lease name, Value: bincode LeaseRecord
pub const LEASES: TableDefinition<&str, &[u8]> = TableDefinition::new("leases");
