// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Reconciliation Loops
//!
//! Background tasks started with the node and stopped with it:
//!
//! | Loop | Interval | Work |
//! |------|----------|------|
//! | [`ForwardsPoller`] | 30 s | copy new forwarding events into `forwards` |
//! | [`PendingInvoiceChecker`] | 60 s | settle paid and fail expired incoming rows |
//! | [`EventGc`] | 1 h | trim the request/response event log |
//!
//! Each loop runs one sweep immediately, then sleeps until the next tick or
//! until the shutdown token fires.

mod event_gc;
mod forwards;
mod pending;

pub use event_gc::{EventGc, EVENT_GC_KEEP, EVENT_GC_MAX_DELETE};
pub use forwards::{ForwardsPoller, FORWARDS_BATCH};
pub use pending::PendingInvoiceChecker;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::ledger::TransactionsService;
use crate::lnclient::LnClient;
use crate::storage::Db;

/// Spawn every reconciliation loop under `shutdown`.
pub fn spawn_all(
    db: Arc<Db>,
    client: Arc<dyn LnClient>,
    ledger: Arc<TransactionsService>,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(ForwardsPoller::new(db.clone(), client).run(shutdown.clone())),
        tokio::spawn(PendingInvoiceChecker::new(ledger).run(shutdown.clone())),
        tokio::spawn(EventGc::new(db).run(shutdown)),
    ]
}

/// Sweep, then wait for the next tick. Returns when `shutdown` fires.
async fn every<F, Fut>(name: &'static str, interval: Duration, shutdown: CancellationToken, mut sweep: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    tracing::info!(worker = name, interval_secs = interval.as_secs(), "Worker starting");
    loop {
        if shutdown.is_cancelled() {
            break;
        }
        sweep().await;
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.cancelled() => break,
        }
    }
    tracing::info!(worker = name, "Worker shutting down");
}
