// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! LSP directory, LSPS1 orders and opaque liquidity-manager state.

use chrono::{DateTime, Utc};
use redb::{ReadableTable, TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};

use super::{decode, Db, DbError, DbResult};

// =============================================================================
// Table Definitions
// =============================================================================

/// lowercase LSP pubkey → serialized LspRecord.
pub(crate) const LSPS: TableDefinition<&str, &[u8]> = TableDefinition::new("lsps");

/// order id → serialized Lsps1OrderRecord.
pub(crate) const LSPS1_ORDERS: TableDefinition<&str, &[u8]> = TableDefinition::new("lsps1_orders");

/// Opaque key → bytes (catalog cache, sync checkpoints).
pub(crate) const LSPS_STATES: TableDefinition<&str, &[u8]> = TableDefinition::new("lsps_states");

pub(crate) fn create_tables(txn: &WriteTransaction) -> DbResult<()> {
    let _ = txn.open_table(LSPS)?;
    let _ = txn.open_table(LSPS1_ORDERS)?;
    let _ = txn.open_table(LSPS_STATES)?;
    Ok(())
}

// =============================================================================
// Row Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LspOrigin {
    Community,
    User,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LspRecord {
    pub pubkey: String,
    /// `host:port`
    pub host: String,
    pub name: String,
    pub origin: LspOrigin,
    pub is_active: bool,
    pub website: Option<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LspRecord {
    pub fn new(pubkey: &str, host: &str, name: &str, origin: LspOrigin) -> Self {
        let now = Utc::now();
        Self {
            pubkey: pubkey.to_lowercase(),
            host: host.to_string(),
            name: name.to_string(),
            origin,
            is_active: true,
            website: None,
            description: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Split `host:port` into its parts.
    pub fn address(&self) -> Option<(String, u16)> {
        let (host, port) = self.host.rsplit_once(':')?;
        Some((host.to_string(), port.parse().ok()?))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lsps1OrderRecord {
    pub order_id: String,
    pub lsp_pubkey: String,
    /// `CREATED`, `COMPLETED` or `FAILED`.
    pub state: String,
    pub payment_invoice: Option<String>,
    pub fee_total_sat: u64,
    pub order_total_sat: u64,
    pub lsp_balance_sat: u64,
    pub client_balance_sat: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Lsps1OrderRecord {
    pub fn is_terminal(&self) -> bool {
        matches!(self.state.as_str(), "COMPLETED" | "FAILED")
    }
}

// =============================================================================
// LspStore
// =============================================================================

#[derive(Clone, Copy)]
pub struct LspStore<'a> {
    db: &'a Db,
}

impl<'a> LspStore<'a> {
    pub fn new(db: &'a Db) -> Self {
        Self { db }
    }

    pub fn get(&self, pubkey: &str) -> DbResult<Option<LspRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(LSPS)?;
        match table.get(pubkey.to_lowercase().as_str())? {
            Some(value) => Ok(Some(decode(value.value())?)),
            None => Ok(None),
        }
    }

    pub fn list(&self) -> DbResult<Vec<LspRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(LSPS)?;
        let mut records = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            records.push(decode(value.value())?);
        }
        Ok(records)
    }

    pub fn active(&self) -> DbResult<Vec<LspRecord>> {
        Ok(self.list()?.into_iter().filter(|l| l.is_active).collect())
    }

    pub fn put(&self, record: &LspRecord) -> DbResult<()> {
        let mut record = record.clone();
        record.pubkey = record.pubkey.to_lowercase();
        let json = serde_json::to_vec(&record)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(LSPS)?;
            table.insert(record.pubkey.as_str(), json.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn set_active(&self, pubkey: &str, active: bool) -> DbResult<LspRecord> {
        let mut record = self
            .get(pubkey)?
            .ok_or_else(|| DbError::NotFound(format!("lsp {pubkey}")))?;
        record.is_active = active;
        record.updated_at = Utc::now();
        self.put(&record)?;
        Ok(record)
    }

    pub fn remove(&self, pubkey: &str) -> DbResult<bool> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(LSPS)?;
            let removed = table.remove(pubkey.to_lowercase().as_str())?.is_some();
            removed
        };
        write_txn.commit()?;
        Ok(removed)
    }

    /// Upsert catalog entries as community LSPs.
    ///
    /// User-added entries are left alone and `is_active` is never touched on
    /// existing rows.
    pub fn upsert_community(&self, entries: &[LspRecord]) -> DbResult<usize> {
        let write_txn = self.db.begin_write()?;
        let mut written = 0;
        {
            let mut table = write_txn.open_table(LSPS)?;
            for entry in entries {
                let key = entry.pubkey.to_lowercase();
                let existing: Option<LspRecord> = match table.get(key.as_str())? {
                    Some(value) => Some(decode(value.value())?),
                    None => None,
                };
                let record = match existing {
                    Some(existing) if existing.origin == LspOrigin::User => continue,
                    Some(existing) => LspRecord {
                        host: entry.host.clone(),
                        name: entry.name.clone(),
                        website: entry.website.clone(),
                        description: entry.description.clone(),
                        updated_at: Utc::now(),
                        ..existing
                    },
                    None => LspRecord {
                        pubkey: key.clone(),
                        origin: LspOrigin::Community,
                        ..entry.clone()
                    },
                };
                let json = serde_json::to_vec(&record)?;
                table.insert(key.as_str(), json.as_slice())?;
                written += 1;
            }
        }
        write_txn.commit()?;
        Ok(written)
    }

    // =========================================================================
    // LSPS1 orders
    // =========================================================================

    pub fn put_order(&self, order: &Lsps1OrderRecord) -> DbResult<()> {
        let json = serde_json::to_vec(order)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(LSPS1_ORDERS)?;
            table.insert(order.order_id.as_str(), json.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn get_order(&self, order_id: &str) -> DbResult<Option<Lsps1OrderRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(LSPS1_ORDERS)?;
        match table.get(order_id)? {
            Some(value) => Ok(Some(decode(value.value())?)),
            None => Ok(None),
        }
    }

    pub fn list_orders(&self) -> DbResult<Vec<Lsps1OrderRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(LSPS1_ORDERS)?;
        let mut orders = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            orders.push(decode(value.value())?);
        }
        Ok(orders)
    }

    /// Record a new state on an existing order. Terminal orders are not mutated.
    pub fn update_order_state(&self, order_id: &str, state: &str) -> DbResult<Option<Lsps1OrderRecord>> {
        let write_txn = self.db.begin_write()?;
        let updated = {
            let mut table = write_txn.open_table(LSPS1_ORDERS)?;
            let existing: Option<Lsps1OrderRecord> = match table.get(order_id)? {
                Some(value) => Some(decode(value.value())?),
                None => None,
            };
            match existing {
                Some(mut order) if !order.is_terminal() => {
                    order.state = state.to_string();
                    order.updated_at = Utc::now();
                    let json = serde_json::to_vec(&order)?;
                    table.insert(order_id, json.as_slice())?;
                    Some(order)
                }
                Some(order) => Some(order),
                None => None,
            }
        };
        write_txn.commit()?;
        Ok(updated)
    }

    // =========================================================================
    // Opaque state
    // =========================================================================

    pub fn get_state(&self, key: &str) -> DbResult<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(LSPS_STATES)?;
        Ok(table.get(key)?.map(|v| v.value().to_vec()))
    }

    pub fn set_state(&self, key: &str, value: &[u8]) -> DbResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(LSPS_STATES)?;
            table.insert(key, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::temp_db;

    #[test]
    fn community_sync_preserves_active_flag_and_user_entries() {
        let (db, _dir) = temp_db();
        let store = LspStore::new(&db);

        let mut user = LspRecord::new("02AA", "user.example:9735", "mine", LspOrigin::User);
        user.is_active = false;
        store.put(&user).unwrap();
        store
            .put(&LspRecord::new("02bb", "old.example:9735", "old", LspOrigin::Community))
            .unwrap();
        store.set_active("02BB", false).unwrap();

        let catalog = vec![
            LspRecord::new("02aa", "catalog.example:9735", "catalog", LspOrigin::Community),
            LspRecord::new("02bb", "new.example:9735", "renamed", LspOrigin::Community),
            LspRecord::new("02cc", "fresh.example:9735", "fresh", LspOrigin::Community),
        ];
        assert_eq!(store.upsert_community(&catalog).unwrap(), 2);

        let aa = store.get("02aa").unwrap().unwrap();
        assert_eq!(aa.host, "user.example:9735");
        let bb = store.get("02bb").unwrap().unwrap();
        assert_eq!(bb.name, "renamed");
        assert!(!bb.is_active);
        assert!(store.get("02cc").unwrap().unwrap().is_active);
        assert_eq!(store.active().unwrap().len(), 1);
    }

    #[test]
    fn terminal_orders_are_not_mutated() {
        let (db, _dir) = temp_db();
        let store = LspStore::new(&db);
        let now = Utc::now();
        let order = Lsps1OrderRecord {
            order_id: "o1".into(),
            lsp_pubkey: "02aa".into(),
            state: "CREATED".into(),
            payment_invoice: None,
            fee_total_sat: 10,
            order_total_sat: 110,
            lsp_balance_sat: 100_000,
            client_balance_sat: 0,
            created_at: now,
            updated_at: now,
            expires_at: None,
        };
        store.put_order(&order).unwrap();

        let completed = store.update_order_state("o1", "COMPLETED").unwrap().unwrap();
        assert_eq!(completed.state, "COMPLETED");
        let still = store.update_order_state("o1", "FAILED").unwrap().unwrap();
        assert_eq!(still.state, "COMPLETED");
        assert!(store.update_order_state("missing", "FAILED").unwrap().is_none());
    }

    #[test]
    fn address_splits_host_and_port() {
        let lsp = LspRecord::new("02aa", "lsp.example.com:9735", "x", LspOrigin::User);
        assert_eq!(lsp.address(), Some(("lsp.example.com".into(), 9735)));
    }
}
