//! Single-writer lease.
//!
//! Only the lease holder may mutate the replica. The lease is a row with an
//! expiry; the holder renews it periodically and any other candidate may
//! take it over once it has expired.

use crate::error::{StoreError, StoreResult};
use crate::store::AtomStore;
use crate::tables;
use crate::types::now_ms;
use redb::ReadableTable;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

const WRITER_LEASE: &str = "writer";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub holder: String,
    pub expires_at_ms: u64,
}

impl LeaseRecord {
    #[must_use]
    pub const fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms <= now_ms
    }
}

fn ttl_ms(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
}

impl AtomStore {
    pub fn lease(&self) -> StoreResult<Option<LeaseRecord>> {
        let read_txn = self.db().begin_read()?;
        let table = read_txn.open_table(tables::LEASES)?;
        let Some(bytes) = table.get(WRITER_LEASE)? else {
            return Ok(None);
        };
        Ok(Some(bincode::deserialize(bytes.value())?))
    }

    /// Take the writer lease, or extend it if `holder` already has it.
    pub fn acquire_lease(&self, holder: &str, ttl: Duration) -> StoreResult<LeaseRecord> {
        self.acquire_lease_at(holder, ttl, now_ms())
    }

    /// Extend the lease. Fails if another holder has taken it over.
    pub fn renew_lease(&self, holder: &str, ttl: Duration) -> StoreResult<LeaseRecord> {
        self.acquire_lease_at(holder, ttl, now_ms())
    }

    pub(crate) fn acquire_lease_at(
        &self,
        holder: &str,
        ttl: Duration,
        now: u64,
    ) -> StoreResult<LeaseRecord> {
        let write_txn = self.db().begin_write()?;
        let record = {
            let mut table = write_txn.open_table(tables::LEASES)?;
            let current: Option<LeaseRecord> = match table.get(WRITER_LEASE)? {
                Some(bytes) => Some(bincode::deserialize(bytes.value())?),
                None => None,
            };
            if let Some(current) = current
                && current.holder != holder
                && !current.is_expired(now)
            {
                return Err(StoreError::LeaseHeld {
                    holder: current.holder,
                });
            }
            let record = LeaseRecord {
                holder: holder.to_string(),
                expires_at_ms: now.saturating_add(ttl_ms(ttl)),
            };
            let bytes = bincode::serialize(&record)?;
            table.insert(WRITER_LEASE, bytes.as_slice())?;
            record
        };
        write_txn.commit()?;
        debug!(holder, expires_at_ms = record.expires_at_ms, "writer lease held");
        Ok(record)
    }

    /// Give the lease up. Returns false if `holder` did not hold it.
    pub fn release_lease(&self, holder: &str) -> StoreResult<bool> {
        let write_txn = self.db().begin_write()?;
        let released = {
            let mut table = write_txn.open_table(tables::LEASES)?;
            let owned = match table.get(WRITER_LEASE)? {
                Some(bytes) => bincode::deserialize::<LeaseRecord>(bytes.value())?.holder == holder,
                None => false,
            };
            if owned {
                table.remove(WRITER_LEASE)?;
            } else {
                warn!(holder, "release of a lease not held");
            }
            owned
        };
        write_txn.commit()?;
        Ok(released)
    }
}
