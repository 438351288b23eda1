// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::lnclient::{LnClient, LnClientError};
use crate::storage::config::{keys, ConfigStore};
use crate::storage::forwards::ForwardStore;
use crate::storage::{Db, DbError};

const POLL_INTERVAL: Duration = Duration::from_secs(30);
/// Forwarding events requested from the backend per call.
pub const FORWARDS_BATCH: u64 = 100;

#[derive(Debug, thiserror::Error)]
pub enum ForwardsError {
    #[error(transparent)]
    LnClient(#[from] LnClientError),

    #[error(transparent)]
    Db(#[from] DbError),
}

/// Copies the node's forwarding history into the `forwards` table,
/// resuming from the offset stored under `ForwardsOffset`.
pub struct ForwardsPoller {
    db: Arc<Db>,
    client: Arc<dyn LnClient>,
}

impl ForwardsPoller {
    pub fn new(db: Arc<Db>, client: Arc<dyn LnClient>) -> Self {
        Self { db, client }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let this = &self;
        super::every("forwards", POLL_INTERVAL, shutdown, move || async move {
            match this.poll_step().await {
                Ok(0) => {}
                Ok(count) => tracing::info!(count, "Stored forwarding events"),
                Err(e) => tracing::warn!(error = %e, "Forwarding poll failed"),
            }
        })
        .await;
    }

    /// Drain every forward past the stored offset. Returns how many were stored.
    pub async fn poll_step(&self) -> Result<usize, ForwardsError> {
        let mut stored = 0;
        loop {
            let offset = ConfigStore::new(&self.db).get_u64(keys::FORWARDS_OFFSET)?;
            let batch = self.client.list_forwards(offset, FORWARDS_BATCH).await?;
            if batch.is_empty() {
                return Ok(stored);
            }
            let rows: Vec<(u64, u64, DateTime<Utc>)> = batch
                .iter()
                .map(|f| {
                    (
                        f.outbound_amount_forwarded_msat,
                        f.total_fee_earned_msat,
                        DateTime::from_timestamp(f.forwarded_at, 0).unwrap_or_else(Utc::now),
                    )
                })
                .collect();
            let count = ForwardStore::new(&self.db).append(&rows)?;
            ConfigStore::new(&self.db)
                .set(keys::FORWARDS_OFFSET, &(offset + count as u64).to_string())?;
            stored += count;
            if (count as u64) < FORWARDS_BATCH {
                return Ok(stored);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lnclient::memory::MemoryLnClient;
    use crate::storage::temp_db;

    #[tokio::test]
    async fn resumes_from_stored_offset() {
        let (db, _dir) = temp_db();
        let ln = Arc::new(MemoryLnClient::random().unwrap());
        for i in 0..150 {
            ln.add_forward(1_000 + i, 1);
        }
        let poller = ForwardsPoller::new(db.clone(), ln.clone());

        assert_eq!(poller.poll_step().await.unwrap(), 150);
        assert_eq!(ConfigStore::new(&db).get_u64(keys::FORWARDS_OFFSET).unwrap(), 150);
        assert_eq!(poller.poll_step().await.unwrap(), 0);

        ln.add_forward(5_000, 7);
        assert_eq!(poller.poll_step().await.unwrap(), 1);
        let totals = ForwardStore::new(&db).totals().unwrap();
        assert_eq!(totals.count, 151);
        assert_eq!(totals.total_fee_earned_msat, 157);
    }
}
