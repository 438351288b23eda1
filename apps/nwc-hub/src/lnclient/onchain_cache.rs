// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Snapshot cache of the node's on-chain transaction list.
//!
//! Pages are served from one snapshot so pagination stays consistent; the
//! transactions stream invalidates it.

use std::sync::Arc;

use tokio::sync::RwLock;

use super::{LnClient, LnResult, OnchainTransaction};

pub struct OnchainTxCache {
    client: Arc<dyn LnClient>,
    snapshot: RwLock<Option<Arc<Vec<OnchainTransaction>>>>,
}

impl OnchainTxCache {
    pub fn new(client: Arc<dyn LnClient>) -> Self {
        Self {
            client,
            snapshot: RwLock::new(None),
        }
    }

    async fn snapshot(&self) -> LnResult<Arc<Vec<OnchainTransaction>>> {
        if let Some(snapshot) = self.snapshot.read().await.as_ref() {
            return Ok(snapshot.clone());
        }
        let mut slot = self.snapshot.write().await;
        if let Some(snapshot) = slot.as_ref() {
            return Ok(snapshot.clone());
        }
        let mut fresh = self.client.list_onchain_transactions().await?;
        fresh.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let fresh = Arc::new(fresh);
        *slot = Some(fresh.clone());
        Ok(fresh)
    }

    /// Newest-first page plus the total count.
    pub async fn page(&self, limit: usize, offset: usize) -> LnResult<(Vec<OnchainTransaction>, usize)> {
        let snapshot = self.snapshot().await?;
        let page = snapshot.iter().skip(offset).take(limit).cloned().collect();
        Ok((page, snapshot.len()))
    }

    pub async fn invalidate(&self) {
        *self.snapshot.write().await = None;
    }
}
