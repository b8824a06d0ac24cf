//! Crate-wide error taxonomy.
//!
//! A single enum covers every failure category named in the specification:
//! corruption, not-found, invalid-argument, conflict, deadlock, unsupported,
//! disposed, and transient/IO. Individual corrupt entries encountered while
//! scanning are never turned into this error; they are skipped by the caller
//! (see `data_page::scan_documents`).

use std::fmt;
use std::sync::PoisonError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bson serialize error: {0}")]
    BsonSer(#[from] bson::ser::Error),

    #[error("bson deserialize error: {0}")]
    BsonDe(#[from] bson::de::Error),

    #[error("header checksum mismatch")]
    HeaderChecksumMismatch,

    #[error("page checksum mismatch for page {0}")]
    PageChecksumMismatch(u32),

    #[error("page {0} not found")]
    PageNotFound(u32),

    #[error("invalid database magic")]
    InvalidMagic,

    #[error("unsupported database version: {0:#010x}")]
    UnsupportedVersion(u32),

    #[error("database is not valid: {0}")]
    InvalidDatabase(String),

    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    #[error("illegal collection name: {0}")]
    IllegalCollectionName(String),

    #[error("collection already exists: {0}")]
    CollectionAlreadyExists(String),

    #[error("document has no `_id` field")]
    MissingId,

    #[error("duplicate key: {0}")]
    DuplicateKey(bson::Bson),

    #[error("foreign key violation: field `{field}` references unknown document in collection `{collection}`")]
    ForeignKeyViolation { field: String, collection: String },

    #[error("metadata for collection is too large to fit in a single page")]
    MetadataTooLarge,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("lock request timed out")]
    LockTimeout,

    #[error("transaction was chosen as a deadlock victim")]
    DeadlockVictim,

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("engine has been disposed")]
    Disposed,

    #[error("transaction is not active")]
    TransactionNotActive,

    #[error("invalid or released savepoint")]
    InvalidSavepoint,

    #[error("too many active transactions")]
    TooManyTransactions,

    #[error("Duplicate document IDs detected in transaction")]
    DuplicateKeysInTransaction,

    #[error("failed to commit transaction: {0}")]
    TransactionCommitError(Box<Error>),

    #[error("lock poisoned")]
    LockPoisoned,

    #[error("{0}")]
    Other(String),
}

impl<T> From<PoisonError<T>> for Error {
    fn from(_: PoisonError<T>) -> Self {
        Error::LockPoisoned
    }
}

/// Aggregate of independent failures from a batch operation (see
/// `Engine::insert_documents`). Each element corresponds to one input
/// document that failed; succeeding documents are not reported here.
#[derive(Debug)]
pub struct AggregateError {
    pub errors: Vec<(usize, Error)>,
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} of the batch operations failed:", self.errors.len())?;
        for (idx, err) in &self.errors {
            writeln!(f, "  [{}] {}", idx, err)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}
