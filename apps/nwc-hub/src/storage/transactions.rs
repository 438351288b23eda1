// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Transaction rows and their indexes.
//!
//! The ledger is the only writer; everything else reads through the
//! query helpers here.

use chrono::{DateTime, Utc};
use redb::{ReadableTable, TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{decode, index_key, next_id, prefix_bounds, DbError, DbResult};

// =============================================================================
// Table Definitions
// =============================================================================

/// Primary table: tx id → serialized Transaction (JSON bytes).
pub(crate) const TRANSACTIONS: TableDefinition<u64, &[u8]> = TableDefinition::new("transactions");

/// Index: `payment_hash|tx_id` → tx id.
pub(crate) const TX_HASH_INDEX: TableDefinition<&str, u64> = TableDefinition::new("tx_hash_index");

/// Index: `app_id|tx_id` → tx id.
pub(crate) const TX_APP_INDEX: TableDefinition<&str, u64> = TableDefinition::new("tx_app_index");

const TX_COUNTER: &str = "transactions";

pub(crate) fn create_tables(txn: &WriteTransaction) -> DbResult<()> {
    let _ = txn.open_table(TRANSACTIONS)?;
    let _ = txn.open_table(TX_HASH_INDEX)?;
    let _ = txn.open_table(TX_APP_INDEX)?;
    Ok(())
}

// =============================================================================
// Row Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Incoming,
    Outgoing,
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionType::Incoming => write!(f, "incoming"),
            TransactionType::Outgoing => write!(f, "outgoing"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionState {
    Pending,
    Accepted,
    Settled,
    Failed,
}

impl TransactionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransactionState::Settled | TransactionState::Failed)
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionState::Pending => write!(f, "pending"),
            TransactionState::Accepted => write!(f, "accepted"),
            TransactionState::Settled => write!(f, "settled"),
            TransactionState::Failed => write!(f, "failed"),
        }
    }
}

/// A ledger row. Amounts are in millisatoshis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: u64,
    pub app_id: Option<u64>,
    pub request_event_id: Option<u64>,
    #[serde(rename = "type")]
    pub tx_type: TransactionType,
    pub state: TransactionState,
    pub amount_msat: u64,
    pub fee_msat: u64,
    pub fee_reserve_msat: u64,
    pub payment_request: String,
    pub payment_hash: String,
    pub preimage: Option<String>,
    pub description: String,
    pub description_hash: String,
    pub settle_deadline: Option<u32>,
    pub self_payment: bool,
    pub hold: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub settled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: Option<Value>,
    pub boostagram: Option<Value>,
    pub failure_reason: Option<String>,
}

impl Transaction {
    /// A fresh pending row; the id is assigned on insert.
    pub fn new_pending(tx_type: TransactionType, payment_hash: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            app_id: None,
            request_event_id: None,
            tx_type,
            state: TransactionState::Pending,
            amount_msat: 0,
            fee_msat: 0,
            fee_reserve_msat: 0,
            payment_request: String::new(),
            payment_hash: payment_hash.into(),
            preimage: None,
            description: String::new(),
            description_hash: String::new(),
            settle_deadline: None,
            self_payment: false,
            hold: false,
            expires_at: None,
            settled_at: None,
            created_at: now,
            updated_at: now,
            metadata: None,
            boostagram: None,
            failure_reason: None,
        }
    }

    /// Amount counted against budgets and isolated balances.
    pub fn counted_outgoing_msat(&self) -> u64 {
        self.amount_msat
            .saturating_add(self.fee_msat)
            .saturating_add(self.fee_reserve_msat)
    }
}

// =============================================================================
// Queries (work on read and write transactions alike)
// =============================================================================

pub(crate) fn get<T>(table: &T, id: u64) -> DbResult<Option<Transaction>>
where
    T: ReadableTable<u64, &'static [u8]>,
{
    match table.get(id)? {
        Some(value) => Ok(Some(decode(value.value())?)),
        None => Ok(None),
    }
}

/// Ids listed under `prefix` in an index table, in ascending id order.
pub(crate) fn index_ids<T>(index: &T, prefix: &str) -> DbResult<Vec<u64>>
where
    T: ReadableTable<&'static str, u64>,
{
    let (start, end) = prefix_bounds(prefix);
    let mut ids = Vec::new();
    for entry in index.range(start.as_str()..end.as_str())? {
        let (_, id) = entry?;
        ids.push(id.value());
    }
    Ok(ids)
}

/// Every row with the given payment hash.
pub(crate) fn by_hash<T, I>(table: &T, hash_index: &I, payment_hash: &str) -> DbResult<Vec<Transaction>>
where
    T: ReadableTable<u64, &'static [u8]>,
    I: ReadableTable<&'static str, u64>,
{
    let mut rows = Vec::new();
    for id in index_ids(hash_index, payment_hash)? {
        if let Some(tx) = get(table, id)? {
            rows.push(tx);
        }
    }
    Ok(rows)
}

/// Every row attributed to the app.
pub(crate) fn by_app<T, I>(table: &T, app_index: &I, app_id: u64) -> DbResult<Vec<Transaction>>
where
    T: ReadableTable<u64, &'static [u8]>,
    I: ReadableTable<&'static str, u64>,
{
    let mut rows = Vec::new();
    for id in index_ids(app_index, &app_id.to_string())? {
        if let Some(tx) = get(table, id)? {
            rows.push(tx);
        }
    }
    Ok(rows)
}

pub(crate) fn all<T>(table: &T) -> DbResult<Vec<Transaction>>
where
    T: ReadableTable<u64, &'static [u8]>,
{
    let mut rows = Vec::new();
    for entry in table.iter()? {
        let (_, value) = entry?;
        rows.push(decode(value.value())?);
    }
    Ok(rows)
}

// =============================================================================
// Writes
// =============================================================================

/// Insert a new row, assigning its id and index entries.
///
/// Rejects a second settled row for the same `(payment_hash, type)`.
pub(crate) fn insert(txn: &WriteTransaction, tx: &mut Transaction) -> DbResult<()> {
    if tx.state == TransactionState::Settled {
        ensure_no_settled_duplicate(txn, tx, None)?;
    }
    tx.id = next_id(txn, TX_COUNTER)?;
    let json = serde_json::to_vec(tx)?;

    let mut table = txn.open_table(TRANSACTIONS)?;
    table.insert(tx.id, json.as_slice())?;

    let mut hash_index = txn.open_table(TX_HASH_INDEX)?;
    hash_index.insert(index_key(&tx.payment_hash, tx.id).as_str(), tx.id)?;

    if let Some(app_id) = tx.app_id {
        let mut app_index = txn.open_table(TX_APP_INDEX)?;
        app_index.insert(index_key(&app_id.to_string(), tx.id).as_str(), tx.id)?;
    }
    Ok(())
}

/// Apply `update` to the row only if its current state is in `expected`.
///
/// Returns the updated row, or `None` when the row has already moved on.
/// The state predicate serializes concurrent transitions of one row.
pub(crate) fn transition<F>(
    txn: &WriteTransaction,
    id: u64,
    expected: &[TransactionState],
    update: F,
) -> DbResult<Option<Transaction>>
where
    F: FnOnce(&mut Transaction),
{
    let current = {
        let table = txn.open_table(TRANSACTIONS)?;
        get(&table, id)?.ok_or_else(|| DbError::NotFound(format!("transaction {id}")))?
    };
    if !expected.contains(&current.state) {
        return Ok(None);
    }

    let mut next = current;
    update(&mut next);
    next.updated_at = Utc::now();
    if next.state.is_terminal() {
        next.fee_reserve_msat = 0;
    }
    if next.state == TransactionState::Settled {
        ensure_no_settled_duplicate(txn, &next, Some(id))?;
    }

    let json = serde_json::to_vec(&next)?;
    let mut table = txn.open_table(TRANSACTIONS)?;
    table.insert(id, json.as_slice())?;
    Ok(Some(next))
}

fn ensure_no_settled_duplicate(
    txn: &WriteTransaction,
    tx: &Transaction,
    except: Option<u64>,
) -> DbResult<()> {
    let table = txn.open_table(TRANSACTIONS)?;
    let hash_index = txn.open_table(TX_HASH_INDEX)?;
    let duplicate = by_hash(&table, &hash_index, &tx.payment_hash)?
        .into_iter()
        .any(|row| {
            Some(row.id) != except
                && row.tx_type == tx.tx_type
                && row.state == TransactionState::Settled
        });
    if duplicate {
        return Err(DbError::Conflict(format!(
            "settled {} transaction for payment hash {}",
            tx.tx_type, tx.payment_hash
        )));
    }
    Ok(())
}

/// Remove every row of an app (app deletion cascade).
pub(crate) fn delete_for_app(txn: &WriteTransaction, app_id: u64) -> DbResult<usize> {
    let ids = {
        let app_index = txn.open_table(TX_APP_INDEX)?;
        index_ids(&app_index, &app_id.to_string())?
    };

    let mut table = txn.open_table(TRANSACTIONS)?;
    let mut hash_index = txn.open_table(TX_HASH_INDEX)?;
    let mut app_index = txn.open_table(TX_APP_INDEX)?;
    for id in &ids {
        let hash = match table.remove(*id)? {
            Some(value) => decode::<Transaction>(value.value())?.payment_hash,
            None => continue,
        };
        hash_index.remove(index_key(&hash, *id).as_str())?;
        app_index.remove(index_key(&app_id.to_string(), *id).as_str())?;
    }
    Ok(ids.len())
}
