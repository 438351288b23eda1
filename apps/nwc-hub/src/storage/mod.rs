// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Embedded Storage
//!
//! Every persisted entity of the gateway lives in a single redb database
//! (pure Rust, ACID). Rows are JSON-encoded; secondary indexes use string
//! keys of the form `<prefix>|<zero-padded id>` so that a prefix range scan
//! returns the rows of one owner in id order.
//!
//! ## Table Layout
//!
//! | Table | Key | Value |
//! |-------|-----|-------|
//! | `apps` | app id | `App` |
//! | `app_pubkey_index` | app pubkey | app id |
//! | `wallet_pubkey_index` | wallet pubkey | app id |
//! | `app_permissions` | `app_id|scope` | `AppPermission` |
//! | `transactions` | tx id | `Transaction` |
//! | `tx_hash_index` | `payment_hash|tx_id` | tx id |
//! | `tx_app_index` | `app_id|tx_id` | tx id |
//! | `forwards` | forward id | `Forward` |
//! | `lsps` | lsp pubkey | `LspRecord` |
//! | `lsps1_orders` | order id | `Lsps1OrderRecord` |
//! | `lsps_states` | key | opaque bytes |
//! | `request_events` | request id | `RequestEvent` |
//! | `request_event_nostr_index` | nostr event id | request id |
//! | `response_events` | response id | `ResponseEvent` |
//! | `response_events_index` | `request_id|response_id` | response id |
//! | `user_config` | key | `ConfigEntry` |
//! | `counters` | counter name | last issued id |

pub mod apps;
pub mod config;
pub mod forwards;
pub mod lsps;
pub mod nostr_events;
pub mod transactions;

use std::path::Path;

use redb::{
    Database, ReadTransaction, ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction,
};
use serde::de::DeserializeOwned;

// =============================================================================
// Table Definitions
// =============================================================================

/// Monotonic id counters: counter name → last issued id.
const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");

// =============================================================================
// Error Type
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::Error),

    #[error("redb database error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("redb transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("redb table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("redb storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("redb commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unique constraint violated: {0}")]
    Conflict(String),
}

pub type DbResult<T> = Result<T, DbError>;

// =============================================================================
// Index Key Helpers
// =============================================================================

/// Composite index key `prefix|<20-digit id>`.
pub(crate) fn index_key(prefix: &str, id: u64) -> String {
    format!("{prefix}|{id:020}")
}

/// Bounds of a range scan over every key starting with `prefix|`.
///
/// `~` sorts after every digit, so the upper bound is past any padded id.
pub(crate) fn prefix_bounds(prefix: &str) -> (String, String) {
    (format!("{prefix}|"), format!("{prefix}|~"))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> DbResult<T> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Issue the next id of the named counter inside `txn`.
pub(crate) fn next_id(txn: &WriteTransaction, counter: &str) -> DbResult<u64> {
    let mut table = txn.open_table(COUNTERS)?;
    let current = table.get(counter)?.map(|v| v.value()).unwrap_or(0);
    let next = current + 1;
    table.insert(counter, next)?;
    Ok(next)
}

// =============================================================================
// Db
// =============================================================================

/// Shared handle to the gateway database.
pub struct Db {
    db: Database,
}

impl Db {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> DbResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let db = Database::create(path)?;

        // Pre-create all tables so later read transactions don't fail
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(COUNTERS)?;
            apps::create_tables(&write_txn)?;
            transactions::create_tables(&write_txn)?;
            forwards::create_tables(&write_txn)?;
            lsps::create_tables(&write_txn)?;
            nostr_events::create_tables(&write_txn)?;
            config::create_tables(&write_txn)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    pub fn begin_write(&self) -> DbResult<WriteTransaction> {
        Ok(self.db.begin_write()?)
    }

    pub fn begin_read(&self) -> DbResult<ReadTransaction> {
        Ok(self.db.begin_read()?)
    }
}

#[cfg(test)]
pub(crate) fn temp_db() -> (std::sync::Arc<Db>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open(&dir.path().join("nwc.redb")).unwrap();
    (std::sync::Arc::new(db), dir)
}
