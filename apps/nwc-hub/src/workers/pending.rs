// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::ledger::{LedgerResult, TransactionsService};

const POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Catches incoming payments the backend streams missed and fails invoices
/// that expired unpaid.
pub struct PendingInvoiceChecker {
    ledger: Arc<TransactionsService>,
}

impl PendingInvoiceChecker {
    pub fn new(ledger: Arc<TransactionsService>) -> Self {
        Self { ledger }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let this = &self;
        super::every("pending-invoices", POLL_INTERVAL, shutdown, move || async move {
            match this.poll_step().await {
                Ok((0, 0)) => {}
                Ok((settled, expired)) => {
                    tracing::info!(settled, expired, "Reconciled pending invoices");
                }
                Err(e) => tracing::warn!(error = %e, "Pending invoice check failed"),
            }
        })
        .await;
    }

    /// Returns `(settled, expired)`.
    pub async fn poll_step(&self) -> LedgerResult<(usize, usize)> {
        let settled = self.ledger.reconcile_pending_incoming().await?;
        let expired = self.ledger.expire_pending_incoming(Utc::now())?;
        Ok((settled, expired))
    }
}
