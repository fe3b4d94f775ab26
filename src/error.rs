//! Error taxonomy shared by every layer of the store.

use std::io;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The closed set of failures a store operation can surface.
///
/// Decode failures are never defaulted away: an unknown tag or a dangling
/// lookup reference means the record (or the lookup garbage collector) is
/// broken and the operation must stop.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("storage engine error: {0}")]
    Engine(#[from] redb::Error),
    #[error("corrupt record: {0}")]
    CorruptRecord(String),
    #[error("capacity exceeded: {what} (limit {limit})")]
    CapacityExceeded {
        /// Which counter or fixed-width field ran out of room.
        what: &'static str,
        /// The configured limit that would have been crossed.
        limit: u64,
    },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("schema mismatch: {0}")]
    Schema(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Shorthand for a `CorruptRecord` with a formatted message.
    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        Error::CorruptRecord(msg.into())
    }
}

// The engine reports distinct error types per phase; fold them all into the
// umbrella variant so `?` works at every call site.
impl From<redb::DatabaseError> for Error {
    fn from(e: redb::DatabaseError) -> Self {
        Error::Engine(e.into())
    }
}

impl From<redb::TransactionError> for Error {
    fn from(e: redb::TransactionError) -> Self {
        Error::Engine(e.into())
    }
}

impl From<redb::TableError> for Error {
    fn from(e: redb::TableError) -> Self {
        Error::Engine(e.into())
    }
}

impl From<redb::StorageError> for Error {
    fn from(e: redb::StorageError) -> Self {
        Error::Engine(e.into())
    }
}

impl From<redb::CommitError> for Error {
    fn from(e: redb::CommitError) -> Self {
        Error::Engine(e.into())
    }
}
