// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::storage::nostr_events::NostrEventStore;
use crate::storage::{Db, DbResult};

const GC_INTERVAL: Duration = Duration::from_secs(60 * 60);
/// Newest request events kept in the log.
pub const EVENT_GC_KEEP: u64 = 5_000;
/// Most request events removed by one sweep.
pub const EVENT_GC_MAX_DELETE: usize = 1_000;

/// Trims the request/response event log. Transactions are never touched.
pub struct EventGc {
    db: Arc<Db>,
}

impl EventGc {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let this = &self;
        super::every("event-gc", GC_INTERVAL, shutdown, move || async move {
            match this.poll_step() {
                Ok(0) => {}
                Ok(deleted) => tracing::info!(deleted, "Deleted excess request events"),
                Err(e) => tracing::warn!(error = %e, "Event GC failed"),
            }
        })
        .await;
    }

    pub fn poll_step(&self) -> DbResult<usize> {
        let store = NostrEventStore::new(&self.db);
        if store.count_requests()? <= EVENT_GC_KEEP {
            return Ok(0);
        }
        store.delete_excess(EVENT_GC_KEEP, EVENT_GC_MAX_DELETE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::testing::harness;
    use crate::ledger::{InvoiceRequest, ListQuery};

    #[tokio::test]
    async fn one_sweep_trims_towards_the_bound() {
        let h = harness().await;
        let db = h.db.clone();
        let store = NostrEventStore::new(&db);
        for i in 0..6_100 {
            store.record_request(Some(1), &format!("ev{i}")).unwrap();
        }
        h.ledger
            .make_invoice(InvoiceRequest {
                amount_msat: 1_000,
                ..Default::default()
            })
            .await
            .unwrap();
        let unpaid = ListQuery {
            unpaid_incoming: true,
            ..Default::default()
        };

        let gc = EventGc::new(db.clone());
        let deleted = gc.poll_step().unwrap();
        assert!(deleted >= 100);
        let left = store.count_requests().unwrap();
        assert!(left <= EVENT_GC_KEEP + EVENT_GC_MAX_DELETE as u64);
        assert_eq!(left, 6_100 - deleted as u64);
        // oldest go first
        assert!(store.get_request(1).unwrap().is_none());
        assert!(store.get_request(6_100).unwrap().is_some());
        assert_eq!(h.ledger.list(&unpaid).await.unwrap().1, 1);

        assert_eq!(gc.poll_step().unwrap(), 100);
        assert_eq!(gc.poll_step().unwrap(), 0);
    }
}
