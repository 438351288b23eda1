// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Permissions & Budgets
//!
//! Each app holds a set of scopes. `pay_invoice` may carry a spending limit
//! that renews on a calendar cadence; isolated apps additionally spend only
//! from their own balance.
//!
//! | Scope | NWC methods |
//! |-------|-------------|
//! | `pay_invoice` | `pay_invoice`, `multi_pay_invoice`, `pay_keysend`, `multi_pay_keysend` |
//! | `get_balance` | `get_balance`, `get_budget` |
//! | `get_info` | `get_info` |
//! | `make_invoice` | `make_invoice` |
//! | `lookup_invoice` | `lookup_invoice` |
//! | `list_transactions` | `list_transactions` |
//! | `sign_message` | `sign_message` |
//! | `make_hold_invoice` | `make_hold_invoice` |
//! | `settle_hold_invoice` | `settle_hold_invoice` |
//! | `cancel_hold_invoice` | `cancel_hold_invoice` |
//! | `notifications` | none (enables notification events) |
//! | `superuser` | none (app management) |

pub mod budget;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::storage::apps::{self as app_rows, App, AppPermission, APP_PERMISSIONS};
use crate::storage::transactions::{self as tx_rows, TRANSACTIONS, TX_APP_INDEX};
use crate::storage::{Db, DbResult};

pub use budget::{BudgetStatus, PermissionError};

// =============================================================================
// Scope
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    PayInvoice,
    GetBalance,
    GetInfo,
    MakeInvoice,
    LookupInvoice,
    ListTransactions,
    SignMessage,
    Notifications,
    MakeHoldInvoice,
    SettleHoldInvoice,
    CancelHoldInvoice,
    Superuser,
}

impl Scope {
    pub const ALL: [Scope; 12] = [
        Scope::PayInvoice,
        Scope::GetBalance,
        Scope::GetInfo,
        Scope::MakeInvoice,
        Scope::LookupInvoice,
        Scope::ListTransactions,
        Scope::SignMessage,
        Scope::Notifications,
        Scope::MakeHoldInvoice,
        Scope::SettleHoldInvoice,
        Scope::CancelHoldInvoice,
        Scope::Superuser,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Scope::PayInvoice => "pay_invoice",
            Scope::GetBalance => "get_balance",
            Scope::GetInfo => "get_info",
            Scope::MakeInvoice => "make_invoice",
            Scope::LookupInvoice => "lookup_invoice",
            Scope::ListTransactions => "list_transactions",
            Scope::SignMessage => "sign_message",
            Scope::Notifications => "notifications",
            Scope::MakeHoldInvoice => "make_hold_invoice",
            Scope::SettleHoldInvoice => "settle_hold_invoice",
            Scope::CancelHoldInvoice => "cancel_hold_invoice",
            Scope::Superuser => "superuser",
        }
    }

    /// NWC methods unlocked by this scope.
    pub fn methods(self) -> &'static [&'static str] {
        match self {
            Scope::PayInvoice => &[
                "pay_invoice",
                "multi_pay_invoice",
                "pay_keysend",
                "multi_pay_keysend",
            ],
            Scope::GetBalance => &["get_balance", "get_budget"],
            Scope::GetInfo => &["get_info"],
            Scope::MakeInvoice => &["make_invoice"],
            Scope::LookupInvoice => &["lookup_invoice"],
            Scope::ListTransactions => &["list_transactions"],
            Scope::SignMessage => &["sign_message"],
            Scope::MakeHoldInvoice => &["make_hold_invoice"],
            Scope::SettleHoldInvoice => &["settle_hold_invoice"],
            Scope::CancelHoldInvoice => &["cancel_hold_invoice"],
            Scope::Notifications | Scope::Superuser => &[],
        }
    }

    /// The scope required to call an NWC method.
    pub fn for_method(method: &str) -> Option<Scope> {
        Scope::ALL
            .into_iter()
            .find(|scope| scope.methods().contains(&method))
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown scope: {0}")]
pub struct UnknownScope(pub String);

impl FromStr for Scope {
    type Err = UnknownScope;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Scope::ALL
            .into_iter()
            .find(|scope| scope.as_str() == s)
            .ok_or_else(|| UnknownScope(s.to_string()))
    }
}

// =============================================================================
// Budget renewal
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetRenewal {
    Never,
    Daily,
    Weekly,
    #[default]
    Monthly,
    Yearly,
}

impl fmt::Display for BudgetRenewal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BudgetRenewal::Never => "never",
            BudgetRenewal::Daily => "daily",
            BudgetRenewal::Weekly => "weekly",
            BudgetRenewal::Monthly => "monthly",
            BudgetRenewal::Yearly => "yearly",
        };
        f.write_str(s)
    }
}

// =============================================================================
// PermissionsService
// =============================================================================

/// Outcome of a scope check.
#[derive(Debug, Clone, PartialEq)]
pub enum PermissionCheck {
    Granted(AppPermission),
    Missing,
    Expired,
}

pub struct PermissionsService {
    db: Arc<Db>,
}

impl PermissionsService {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    pub fn check(&self, app: &App, scope: Scope) -> DbResult<PermissionCheck> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(APP_PERMISSIONS)?;
        Ok(match app_rows::get_permission(&table, app.id, scope)? {
            Some(permission) if permission.is_expired(Utc::now()) => PermissionCheck::Expired,
            Some(permission) => PermissionCheck::Granted(permission),
            None => PermissionCheck::Missing,
        })
    }

    pub fn permissions(&self, app_id: u64) -> DbResult<Vec<AppPermission>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(APP_PERMISSIONS)?;
        app_rows::permissions_for_app(&table, app_id)
    }

    /// Unexpired scopes of the app.
    pub fn scopes(&self, app_id: u64) -> DbResult<Vec<Scope>> {
        let now = Utc::now();
        let mut scopes: Vec<Scope> = self
            .permissions(app_id)?
            .into_iter()
            .filter(|p| !p.is_expired(now))
            .map(|p| p.scope)
            .collect();
        scopes.sort();
        Ok(scopes)
    }

    /// Budget state of the app's `pay_invoice` permission, if it has a limit.
    pub fn budget_status(&self, app_id: u64) -> DbResult<Option<BudgetStatus>> {
        let read_txn = self.db.begin_read()?;
        let permissions = read_txn.open_table(APP_PERMISSIONS)?;
        let Some(permission) = app_rows::get_permission(&permissions, app_id, Scope::PayInvoice)?
        else {
            return Ok(None);
        };
        if permission.max_amount_sat == 0 {
            return Ok(None);
        }
        let table = read_txn.open_table(TRANSACTIONS)?;
        let index = read_txn.open_table(TX_APP_INDEX)?;
        let rows = tx_rows::by_app(&table, &index, app_id)?;
        Ok(Some(BudgetStatus::compute(&permission, &rows, Utc::now())))
    }

    /// Spendable balance of an isolated app in millisatoshis.
    pub fn isolated_balance_msat(&self, app_id: u64) -> DbResult<i64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TRANSACTIONS)?;
        let index = read_txn.open_table(TX_APP_INDEX)?;
        let rows = tx_rows::by_app(&table, &index, app_id)?;
        Ok(budget::isolated_balance_msat(&rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scopes_round_trip_through_strings() {
        for scope in Scope::ALL {
            assert_eq!(scope.as_str().parse::<Scope>().unwrap(), scope);
            assert_eq!(
                serde_json::to_string(&scope).unwrap(),
                format!("\"{}\"", scope.as_str())
            );
        }
        assert!("pay".parse::<Scope>().is_err());
    }

    #[test]
    fn methods_map_to_their_scope() {
        assert_eq!(Scope::for_method("multi_pay_keysend"), Some(Scope::PayInvoice));
        assert_eq!(Scope::for_method("get_budget"), Some(Scope::GetBalance));
        assert_eq!(Scope::for_method("cancel_hold_invoice"), Some(Scope::CancelHoldInvoice));
        assert_eq!(Scope::for_method("superuser"), None);
        assert_eq!(Scope::for_method("unknown"), None);
    }
}
