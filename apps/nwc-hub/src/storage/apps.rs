// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! App and permission rows.

use chrono::{DateTime, Utc};
use redb::{ReadableTable, TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{decode, next_id, prefix_bounds, DbError, DbResult};
use crate::permissions::{BudgetRenewal, Scope};

// =============================================================================
// Table Definitions
// =============================================================================

pub(crate) const APPS: TableDefinition<u64, &[u8]> = TableDefinition::new("apps");

/// Unique index: app pubkey (hex) → app id.
pub(crate) const APP_PUBKEY_INDEX: TableDefinition<&str, u64> =
    TableDefinition::new("app_pubkey_index");

/// Unique index: derived wallet pubkey (hex) → app id.
pub(crate) const WALLET_PUBKEY_INDEX: TableDefinition<&str, u64> =
    TableDefinition::new("wallet_pubkey_index");

/// `app_id|scope` → serialized AppPermission.
pub(crate) const APP_PERMISSIONS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("app_permissions");

const APP_COUNTER: &str = "apps";

pub(crate) fn create_tables(txn: &WriteTransaction) -> DbResult<()> {
    let _ = txn.open_table(APPS)?;
    let _ = txn.open_table(APP_PUBKEY_INDEX)?;
    let _ = txn.open_table(WALLET_PUBKEY_INDEX)?;
    let _ = txn.open_table(APP_PERMISSIONS)?;
    Ok(())
}

// =============================================================================
// Row Types
// =============================================================================

/// Metadata key naming the app-store entry an app was created from.
pub const APP_STORE_APP_ID_KEY: &str = "app_store_app_id";

/// `app_store_app_id` value marking an isolated sub-wallet.
pub const SUBWALLET_APP_STORE_APP_ID: &str = "subwallet";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct App {
    pub id: u64,
    pub name: String,
    /// x-only pubkey of the connecting client (hex).
    pub app_pubkey: String,
    /// Derived wallet pubkey (hex). `None` for legacy apps served by the node key.
    pub wallet_pubkey: Option<String>,
    pub isolated: bool,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl App {
    pub fn app_store_app_id(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get(APP_STORE_APP_ID_KEY))
            .and_then(Value::as_str)
    }

    pub fn is_subwallet(&self) -> bool {
        self.app_store_app_id() == Some(SUBWALLET_APP_STORE_APP_ID)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppPermission {
    pub app_id: u64,
    pub scope: Scope,
    /// Spending limit in whole satoshis; 0 means unlimited.
    pub max_amount_sat: u64,
    pub budget_renewal: BudgetRenewal,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AppPermission {
    pub fn new(app_id: u64, scope: Scope) -> Self {
        let now = Utc::now();
        Self {
            app_id,
            scope,
            max_amount_sat: 0,
            budget_renewal: BudgetRenewal::default(),
            expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

fn permission_key(app_id: u64, scope: Scope) -> String {
    format!("{app_id}|{scope}")
}

// =============================================================================
// Queries
// =============================================================================

pub(crate) fn get_app<T>(table: &T, id: u64) -> DbResult<Option<App>>
where
    T: ReadableTable<u64, &'static [u8]>,
{
    match table.get(id)? {
        Some(value) => Ok(Some(decode(value.value())?)),
        None => Ok(None),
    }
}

pub(crate) fn lookup_index<T>(index: &T, pubkey: &str) -> DbResult<Option<u64>>
where
    T: ReadableTable<&'static str, u64>,
{
    Ok(index.get(pubkey.to_lowercase().as_str())?.map(|v| v.value()))
}

pub(crate) fn list_apps<T>(table: &T) -> DbResult<Vec<App>>
where
    T: ReadableTable<u64, &'static [u8]>,
{
    let mut apps = Vec::new();
    for entry in table.iter()? {
        let (_, value) = entry?;
        apps.push(decode(value.value())?);
    }
    Ok(apps)
}

pub(crate) fn permissions_for_app<T>(table: &T, app_id: u64) -> DbResult<Vec<AppPermission>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    let (start, end) = prefix_bounds(&app_id.to_string());
    let mut permissions = Vec::new();
    for entry in table.range(start.as_str()..end.as_str())? {
        let (_, value) = entry?;
        permissions.push(decode(value.value())?);
    }
    Ok(permissions)
}

pub(crate) fn get_permission<T>(table: &T, app_id: u64, scope: Scope) -> DbResult<Option<AppPermission>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(permission_key(app_id, scope).as_str())? {
        Some(value) => Ok(Some(decode(value.value())?)),
        None => Ok(None),
    }
}

// =============================================================================
// Writes
// =============================================================================

pub(crate) fn allocate_app_id(txn: &WriteTransaction) -> DbResult<u64> {
    next_id(txn, APP_COUNTER)
}

/// Insert a new app, enforcing uniqueness of both pubkeys.
pub(crate) fn insert_app(txn: &WriteTransaction, app: &App) -> DbResult<()> {
    let app_pubkey = app.app_pubkey.to_lowercase();
    let wallet_pubkey = app.wallet_pubkey.as_deref().map(str::to_lowercase);

    let mut pubkeys = txn.open_table(APP_PUBKEY_INDEX)?;
    let mut wallets = txn.open_table(WALLET_PUBKEY_INDEX)?;
    if pubkeys.get(app_pubkey.as_str())?.is_some() {
        return Err(DbError::Conflict(format!("app pubkey {app_pubkey}")));
    }
    if let Some(wallet_pubkey) = &wallet_pubkey {
        if wallets.get(wallet_pubkey.as_str())?.is_some() {
            return Err(DbError::Conflict(format!("wallet pubkey {wallet_pubkey}")));
        }
        wallets.insert(wallet_pubkey.as_str(), app.id)?;
    }
    pubkeys.insert(app_pubkey.as_str(), app.id)?;

    put_app(txn, app)
}

/// Rewrite an existing app row. Pubkeys are immutable and not reindexed.
pub(crate) fn put_app(txn: &WriteTransaction, app: &App) -> DbResult<()> {
    let json = serde_json::to_vec(app)?;
    let mut table = txn.open_table(APPS)?;
    table.insert(app.id, json.as_slice())?;
    Ok(())
}

/// Delete the app row, its indexes and its permissions.
pub(crate) fn delete_app(txn: &WriteTransaction, id: u64) -> DbResult<App> {
    let app: App = {
        let mut table = txn.open_table(APPS)?;
        let removed = table.remove(id)?;
        match removed {
            Some(value) => decode(value.value())?,
            None => return Err(DbError::NotFound(format!("app {id}"))),
        }
    };

    {
        let mut pubkeys = txn.open_table(APP_PUBKEY_INDEX)?;
        pubkeys.remove(app.app_pubkey.to_lowercase().as_str())?;
        if let Some(wallet_pubkey) = &app.wallet_pubkey {
            let mut wallets = txn.open_table(WALLET_PUBKEY_INDEX)?;
            wallets.remove(wallet_pubkey.to_lowercase().as_str())?;
        }
    }

    let scopes: Vec<Scope> = {
        let permissions = txn.open_table(APP_PERMISSIONS)?;
        permissions_for_app(&permissions, id)?
            .into_iter()
            .map(|p| p.scope)
            .collect()
    };
    for scope in scopes {
        delete_permission(txn, id, scope)?;
    }
    Ok(app)
}

pub(crate) fn put_permission(txn: &WriteTransaction, permission: &AppPermission) -> DbResult<()> {
    let json = serde_json::to_vec(permission)?;
    let mut table = txn.open_table(APP_PERMISSIONS)?;
    table.insert(
        permission_key(permission.app_id, permission.scope).as_str(),
        json.as_slice(),
    )?;
    Ok(())
}

pub(crate) fn delete_permission(txn: &WriteTransaction, app_id: u64, scope: Scope) -> DbResult<()> {
    let mut table = txn.open_table(APP_PERMISSIONS)?;
    table.remove(permission_key(app_id, scope).as_str())?;
    Ok(())
}
