// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Key-value settings (`user_config`).

use redb::{ReadableTable, TableDefinition, WriteTransaction};

use super::{Db, DbResult};

pub(crate) const USER_CONFIG: TableDefinition<&str, &str> = TableDefinition::new("user_config");

pub(crate) fn create_tables(txn: &WriteTransaction) -> DbResult<()> {
    let _ = txn.open_table(USER_CONFIG)?;
    Ok(())
}

/// Well-known config keys.
pub mod keys {
    pub const MNEMONIC: &str = "Mnemonic";
    pub const UNLOCK_CHECK: &str = "UnlockPasswordCheck";
    pub const JWT_SECRET: &str = "JWTSecret";
    pub const NODE_LAST_START_TIME: &str = "NodeLastStartTime";
    pub const FORWARDS_OFFSET: &str = "ForwardsOffset";
}

#[derive(Clone, Copy)]
pub struct ConfigStore<'a> {
    db: &'a Db,
}

impl<'a> ConfigStore<'a> {
    pub fn new(db: &'a Db) -> Self {
        Self { db }
    }

    pub fn get(&self, key: &str) -> DbResult<Option<String>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(USER_CONFIG)?;
        Ok(table.get(key)?.map(|v| v.value().to_string()))
    }

    pub fn set(&self, key: &str, value: &str) -> DbResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(USER_CONFIG)?;
            table.insert(key, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Store `value` only when the key is absent. Returns the stored value.
    pub fn set_if_absent(&self, key: &str, value: &str) -> DbResult<String> {
        let write_txn = self.db.begin_write()?;
        let stored = {
            let mut table = write_txn.open_table(USER_CONFIG)?;
            let existing = table.get(key)?.map(|v| v.value().to_string());
            match existing {
                Some(existing) => existing,
                None => {
                    table.insert(key, value)?;
                    value.to_string()
                }
            }
        };
        write_txn.commit()?;
        Ok(stored)
    }

    pub fn get_u64(&self, key: &str) -> DbResult<u64> {
        Ok(self
            .get(key)?
            .and_then(|v| v.parse().ok())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::temp_db;

    #[test]
    fn set_if_absent_keeps_first_value() {
        let (db, _dir) = temp_db();
        let store = ConfigStore::new(&db);
        assert_eq!(store.set_if_absent("k", "one").unwrap(), "one");
        assert_eq!(store.set_if_absent("k", "two").unwrap(), "one");
        store.set("k", "three").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("three"));
        assert_eq!(store.get_u64("missing").unwrap(), 0);
    }
}
