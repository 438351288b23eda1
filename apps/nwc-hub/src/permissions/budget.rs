// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Budget windows, usage arithmetic and the isolated-balance rule.
//!
//! Windows are truncated in UTC. Weeks start on Monday, months on the 1st
//! and years on January 1st. `never` counts from the beginning of time.

use chrono::{DateTime, Datelike, Days, Months, NaiveDate, NaiveTime, Utc};
use redb::WriteTransaction;
use serde::Serialize;

use super::{BudgetRenewal, Scope};
use crate::storage::apps::{self as app_rows, AppPermission, APPS, APP_PERMISSIONS};
use crate::storage::transactions::{
    self as tx_rows, Transaction, TransactionState, TransactionType, TRANSACTIONS, TX_APP_INDEX,
};
use crate::storage::DbError;

/// Share of the budget at which a warning event is emitted.
pub const BUDGET_WARNING_PERCENT: u64 = 80;

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

/// Start of the renewal window containing `now`.
pub fn window_start(renewal: BudgetRenewal, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let today = now.date_naive();
    let start = match renewal {
        BudgetRenewal::Never => return None,
        BudgetRenewal::Daily => today,
        BudgetRenewal::Weekly => {
            today - Days::new(u64::from(today.weekday().num_days_from_monday()))
        }
        BudgetRenewal::Monthly => today.with_day(1)?,
        BudgetRenewal::Yearly => NaiveDate::from_ymd_opt(today.year(), 1, 1)?,
    };
    Some(midnight(start))
}

/// Start of the next renewal window.
pub fn renews_at(renewal: BudgetRenewal, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let start = window_start(renewal, now)?.date_naive();
    let next = match renewal {
        BudgetRenewal::Never => return None,
        BudgetRenewal::Daily => start.checked_add_days(Days::new(1))?,
        BudgetRenewal::Weekly => start.checked_add_days(Days::new(7))?,
        BudgetRenewal::Monthly => start.checked_add_months(Months::new(1))?,
        BudgetRenewal::Yearly => start.checked_add_months(Months::new(12))?,
    };
    Some(midnight(next))
}

fn counts_against_app(tx: &Transaction) -> bool {
    tx.tx_type == TransactionType::Outgoing
        && matches!(tx.state, TransactionState::Settled | TransactionState::Pending)
}

/// Sum of `amount + fee + fee_reserve` of counted outgoing rows since `since`.
pub fn budget_usage_msat(rows: &[Transaction], since: Option<DateTime<Utc>>) -> u64 {
    rows.iter()
        .filter(|tx| counts_against_app(tx))
        .filter(|tx| since.is_none_or(|since| tx.created_at >= since))
        .map(Transaction::counted_outgoing_msat)
        .fold(0, u64::saturating_add)
}

/// `Σ incoming settled − Σ outgoing (settled + pending) incl. fees and reserves`.
pub fn isolated_balance_msat(rows: &[Transaction]) -> i64 {
    let received: u64 = rows
        .iter()
        .filter(|tx| {
            tx.tx_type == TransactionType::Incoming && tx.state == TransactionState::Settled
        })
        .map(|tx| tx.amount_msat)
        .fold(0, u64::saturating_add);
    let spent: u64 = rows
        .iter()
        .filter(|tx| counts_against_app(tx))
        .map(Transaction::counted_outgoing_msat)
        .fold(0, u64::saturating_add);
    i64::try_from(received).unwrap_or(i64::MAX) - i64::try_from(spent).unwrap_or(i64::MAX)
}

/// A limit of `max_amount_sat` whole units in milli-units.
pub fn limit_msat(max_amount_sat: u64) -> u64 {
    max_amount_sat.saturating_mul(1000)
}

/// Whether spending `amount_with_reserve_msat` on top of `usage_msat`
/// would exceed a limit of `max_amount_sat` whole units.
pub fn exceeds_budget(max_amount_sat: u64, usage_msat: u64, amount_with_reserve_msat: u64) -> bool {
    max_amount_sat > 0
        && usage_msat.div_ceil(1000) + amount_with_reserve_msat.div_ceil(1000) > max_amount_sat
}

/// Whether usage moving from `before_msat` to `after_msat` crosses the
/// warning threshold of the limit.
pub fn crosses_warning(max_amount_sat: u64, before_msat: u64, after_msat: u64) -> bool {
    if max_amount_sat == 0 {
        return false;
    }
    let threshold_msat = max_amount_sat.saturating_mul(10 * BUDGET_WARNING_PERCENT);
    before_msat < threshold_msat && after_msat >= threshold_msat
}

// =============================================================================
// BudgetStatus
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetStatus {
    pub used_msat: u64,
    pub total_msat: u64,
    pub renewal: BudgetRenewal,
    pub renews_at: Option<DateTime<Utc>>,
}

impl BudgetStatus {
    pub fn compute(permission: &AppPermission, rows: &[Transaction], now: DateTime<Utc>) -> Self {
        let since = window_start(permission.budget_renewal, now);
        Self {
            used_msat: budget_usage_msat(rows, since),
            total_msat: limit_msat(permission.max_amount_sat),
            renewal: permission.budget_renewal,
            renews_at: renews_at(permission.budget_renewal, now),
        }
    }
}

// =============================================================================
// Affordability check
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum PermissionError {
    #[error("insufficient balance: {balance_msat} msat available, {required_msat} msat required")]
    InsufficientBalance { balance_msat: i64, required_msat: u64 },

    #[error("budget exceeded: {used_sat} of {max_sat} sat used, {required_sat} sat required")]
    QuotaExceeded {
        used_sat: u64,
        max_sat: u64,
        required_sat: u64,
    },

    #[error(transparent)]
    Db(#[from] DbError),
}

impl From<redb::TableError> for PermissionError {
    fn from(e: redb::TableError) -> Self {
        PermissionError::Db(e.into())
    }
}

/// Validate that the app may spend `amount_with_reserve_msat`, reading
/// inside the caller's write transaction so the check and the following
/// insert are atomic.
pub fn check_can_pay(
    txn: &WriteTransaction,
    app_id: Option<u64>,
    amount_with_reserve_msat: u64,
    now: DateTime<Utc>,
) -> Result<(), PermissionError> {
    let Some(app_id) = app_id else {
        return Ok(());
    };

    let app = {
        let apps = txn.open_table(APPS)?;
        app_rows::get_app(&apps, app_id)?
            .ok_or_else(|| DbError::NotFound(format!("app {app_id}")))?
    };
    let permission = {
        let permissions = txn.open_table(APP_PERMISSIONS)?;
        app_rows::get_permission(&permissions, app_id, Scope::PayInvoice)?
    };
    let rows = {
        let table = txn.open_table(TRANSACTIONS)?;
        let index = txn.open_table(TX_APP_INDEX)?;
        tx_rows::by_app(&table, &index, app_id)?
    };

    if app.isolated {
        let balance_msat = isolated_balance_msat(&rows);
        if i128::from(amount_with_reserve_msat) > i128::from(balance_msat) {
            return Err(PermissionError::InsufficientBalance {
                balance_msat,
                required_msat: amount_with_reserve_msat,
            });
        }
    }

    if let Some(permission) = permission.filter(|p| p.max_amount_sat > 0) {
        let usage_msat = budget_usage_msat(&rows, window_start(permission.budget_renewal, now));
        if exceeds_budget(permission.max_amount_sat, usage_msat, amount_with_reserve_msat) {
            return Err(PermissionError::QuotaExceeded {
                used_sat: usage_msat.div_ceil(1000),
                max_sat: permission.max_amount_sat,
                required_sat: amount_with_reserve_msat.div_ceil(1000),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 30, 0).unwrap()
    }

    fn row(tx_type: TransactionType, state: TransactionState, amount: u64) -> Transaction {
        let mut tx = Transaction::new_pending(tx_type, "h");
        tx.state = state;
        tx.amount_msat = amount;
        tx
    }

    #[test]
    fn windows_truncate_in_utc_with_monday_weeks() {
        // 2026-10-15 is a Thursday
        let now = at(2026, 10, 15, 17);
        assert_eq!(window_start(BudgetRenewal::Never, now), None);
        assert_eq!(window_start(BudgetRenewal::Daily, now), Some(at(2026, 10, 15, 0) - chrono::Duration::minutes(30)));
        assert_eq!(
            window_start(BudgetRenewal::Weekly, now).unwrap().date_naive(),
            NaiveDate::from_ymd_opt(2026, 10, 12).unwrap()
        );
        assert_eq!(
            window_start(BudgetRenewal::Monthly, now).unwrap().date_naive(),
            NaiveDate::from_ymd_opt(2026, 10, 1).unwrap()
        );
        assert_eq!(
            window_start(BudgetRenewal::Yearly, now).unwrap().date_naive(),
            NaiveDate::from_ymd_opt(2026, 1, 1).unwrap()
        );
    }

    #[test]
    fn renewal_points_follow_the_window() {
        let now = at(2026, 12, 31, 23);
        assert_eq!(
            renews_at(BudgetRenewal::Monthly, now).unwrap().date_naive(),
            NaiveDate::from_ymd_opt(2027, 1, 1).unwrap()
        );
        assert_eq!(
            renews_at(BudgetRenewal::Weekly, now).unwrap().date_naive(),
            NaiveDate::from_ymd_opt(2027, 1, 4).unwrap()
        );
        assert_eq!(renews_at(BudgetRenewal::Never, now), None);
    }

    #[test]
    fn usage_counts_settled_and_pending_outgoing_only() {
        let mut pending = row(TransactionType::Outgoing, TransactionState::Pending, 1_000);
        pending.fee_reserve_msat = 10_000;
        let mut settled = row(TransactionType::Outgoing, TransactionState::Settled, 2_000);
        settled.fee_msat = 5;
        let rows = vec![
            pending,
            settled,
            row(TransactionType::Outgoing, TransactionState::Failed, 50_000),
            row(TransactionType::Incoming, TransactionState::Settled, 70_000),
        ];
        assert_eq!(budget_usage_msat(&rows, None), 13_005);
        assert_eq!(isolated_balance_msat(&rows), 70_000 - 13_005);
    }

    #[test]
    fn budget_compares_whole_units_rounded_up() {
        assert!(!exceeds_budget(0, u64::MAX / 2, 1));
        assert!(!exceeds_budget(1000, 600_000, 400_000));
        assert!(exceeds_budget(1000, 600_000, 400_001));
        assert!(exceeds_budget(1000, 600_000, 510_000));
    }

    #[test]
    fn warning_fires_only_on_crossing() {
        assert!(crosses_warning(1000, 700_000, 800_000));
        assert!(!crosses_warning(1000, 800_000, 900_000));
        assert!(!crosses_warning(1000, 100_000, 200_000));
        assert!(!crosses_warning(0, 0, 1));
        assert!(crosses_warning(u64::MAX, 0, u64::MAX));
        assert!(!crosses_warning(u64::MAX, 0, u64::MAX - 1));
    }
}
