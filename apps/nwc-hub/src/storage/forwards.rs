// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Append-only log of forwarded payments.

use chrono::{DateTime, Utc};
use redb::{ReadableTable, TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};

use super::{decode, next_id, Db, DbResult};

pub(crate) const FORWARDS: TableDefinition<u64, &[u8]> = TableDefinition::new("forwards");

const FORWARD_COUNTER: &str = "forwards";

pub(crate) fn create_tables(txn: &WriteTransaction) -> DbResult<()> {
    let _ = txn.open_table(FORWARDS)?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forward {
    pub id: u64,
    pub outbound_amount_forwarded_msat: u64,
    pub total_fee_earned_msat: u64,
    pub forwarded_at: DateTime<Utc>,
}

/// Totals over every recorded forward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ForwardTotals {
    pub count: u64,
    pub outbound_amount_forwarded_msat: u64,
    pub total_fee_earned_msat: u64,
}

pub struct ForwardStore<'a> {
    db: &'a Db,
}

impl<'a> ForwardStore<'a> {
    pub fn new(db: &'a Db) -> Self {
        Self { db }
    }

    /// Append forwards in one transaction.
    pub fn append(&self, forwards: &[(u64, u64, DateTime<Utc>)]) -> DbResult<usize> {
        let write_txn = self.db.begin_write()?;
        for (amount, fee, at) in forwards {
            let row = Forward {
                id: next_id(&write_txn, FORWARD_COUNTER)?,
                outbound_amount_forwarded_msat: *amount,
                total_fee_earned_msat: *fee,
                forwarded_at: *at,
            };
            let json = serde_json::to_vec(&row)?;
            let mut table = write_txn.open_table(FORWARDS)?;
            table.insert(row.id, json.as_slice())?;
        }
        write_txn.commit()?;
        Ok(forwards.len())
    }

    pub fn totals(&self) -> DbResult<ForwardTotals> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(FORWARDS)?;
        let mut totals = ForwardTotals::default();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let row: Forward = decode(value.value())?;
            totals.count += 1;
            totals.outbound_amount_forwarded_msat += row.outbound_amount_forwarded_msat;
            totals.total_fee_earned_msat += row.total_fee_earned_msat;
        }
        Ok(totals)
    }
}
