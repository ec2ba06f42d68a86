//! Error type for store operations

use atomsync_common::Error;

/// Error type for replica store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt key in {table}: {key:?}")]
    CorruptKey { table: &'static str, key: String },
    #[error("key part contains NUL in {table}: {key:?}")]
    UnstorableKey { table: &'static str, key: String },
    #[error("change set not found: {0}")]
    ChangeSetNotFound(String),
    #[error("writer lease held by {holder}")]
    LeaseHeld { holder: String },
}

impl From<redb::TransactionError> for StoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::ChangeSetNotFound(id) => Self::ChangeSetNotFound(id),
            StoreError::LeaseHeld { holder } => Self::LeaseHeld { holder },
            other => Self::Storage(other.to_string()),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
