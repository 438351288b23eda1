// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! LSPS0: protocol discovery.

use serde::{Deserialize, Serialize};

use super::transport::{PendingRequests, RpcChannel};
use super::LspsError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListProtocolsResult {
    pub protocols: Vec<u16>,
}

pub(crate) struct Lsps0Client {
    rpc: RpcChannel,
    pub(crate) pending: PendingRequests,
}

impl Lsps0Client {
    pub fn new(rpc: RpcChannel) -> Self {
        Self {
            rpc,
            pending: PendingRequests::new("lsps0"),
        }
    }

    pub async fn list_protocols(&self, peer: &str) -> Result<ListProtocolsResult, LspsError> {
        self.rpc
            .call(&self.pending, peer, "lsps0.list_protocols", &serde_json::json!({}))
            .await
    }
}
