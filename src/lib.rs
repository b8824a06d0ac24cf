//! VaultDB is an embedded, single-file document database.
//!
//! It stores BSON-style documents in named collections inside one on-disk
//! file (plus an optional write-ahead log sibling), and supports insert,
//! update, delete, and find together with secondary indexes and
//! multi-statement transactions that survive a crash mid-commit.
//!
//! This crate implements the storage and transaction engine only: the
//! paged file format, the page manager and its freelist, the collection
//! metadata store, the document slot layout (including the large-document
//! overflow chain), the write-ahead log with crash-recovery replay, the
//! lock manager, and the transaction manager's two-phase commit with
//! compensation rollback. Secondary-index structures are a pluggable
//! [`IndexManager`] the caller supplies or defaults to [`BTreeIndexManager`].
//!
//! # Usage
//!
//! ```no_run
//! use vaultdb::{Engine, Options};
//! use bson::doc;
//!
//! let engine = Engine::open("my.db", Options::default()).unwrap();
//! let id = engine.insert_document("users", doc! { "name": "ada" }, None).unwrap();
//! let found = engine.find_by_id("users", &id, None).unwrap();
//! assert!(found.is_some());
//! ```

mod collection_meta;
mod collection_state;
mod data_page;
mod disk_stream;
mod engine;
mod error;
mod header;
mod index_manager;
mod large_doc;
mod lock_manager;
mod options;
mod page;
mod page_manager;
mod stats;
mod transaction;
mod transaction_manager;
mod wal;

pub use crate::engine::{BatchInsertOutcome, Engine};
pub use crate::error::{AggregateError, Error, Result};
pub use crate::index_manager::{BTreeIndexManager, IndexDescriptor, IndexManager};
pub use crate::lock_manager::{LockMode, LockRequest, WaitOutcome};
pub use crate::options::{FlushInterval, Options, OptionsBuilder, WriteConcern};
pub use crate::page::PageType;
pub use crate::stats::EngineStatistics;
pub use crate::transaction::TransactionIdKind;
pub use crate::transaction_manager::{CollectionSchema, ForeignKeyLink, OperationSink, TransactionManagerStats};

pub extern crate bson;
