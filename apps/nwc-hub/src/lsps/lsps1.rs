// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! LSPS1: channel purchase orders paid ahead of time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::jsonrpc::amount;
use super::transport::{PendingRequests, RpcChannel};
use super::LspsError;
use crate::storage::lsps::Lsps1OrderRecord;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Lsps1Options {
    #[serde(default)]
    pub min_required_channel_confirmations: u32,
    #[serde(default)]
    pub min_funding_confirms_within_blocks: u32,
    #[serde(default)]
    pub supports_zero_channel_reserve: bool,
    #[serde(default)]
    pub max_channel_expiry_blocks: u32,
    #[serde(default, with = "amount::option", skip_serializing_if = "Option::is_none")]
    pub min_initial_client_balance_sat: Option<u64>,
    #[serde(default, with = "amount::option", skip_serializing_if = "Option::is_none")]
    pub max_initial_client_balance_sat: Option<u64>,
    #[serde(default, with = "amount::option", skip_serializing_if = "Option::is_none")]
    pub min_initial_lsp_balance_sat: Option<u64>,
    #[serde(default, with = "amount::option", skip_serializing_if = "Option::is_none")]
    pub max_initial_lsp_balance_sat: Option<u64>,
    #[serde(default, with = "amount::option", skip_serializing_if = "Option::is_none")]
    pub min_channel_balance_sat: Option<u64>,
    #[serde(default, with = "amount::option", skip_serializing_if = "Option::is_none")]
    pub max_channel_balance_sat: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Lsps1GetInfoResult {
    #[serde(default)]
    pub options: Lsps1Options,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateOrderRequest {
    #[serde(with = "amount")]
    pub lsp_balance_sat: u64,
    #[serde(with = "amount")]
    pub client_balance_sat: u64,
    pub required_channel_confirmations: u32,
    pub funding_confirms_within_blocks: u32,
    pub channel_expiry_blocks: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refund_onchain_address: Option<String>,
    pub announce_channel: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bolt11Payment {
    pub state: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(with = "amount")]
    pub fee_total_sat: u64,
    #[serde(with = "amount")]
    pub order_total_sat: u64,
    pub invoice: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderPayment {
    #[serde(default)]
    pub bolt11: Option<Bolt11Payment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lsps1Order {
    pub order_id: String,
    #[serde(with = "amount")]
    pub lsp_balance_sat: u64,
    #[serde(with = "amount")]
    pub client_balance_sat: u64,
    /// `CREATED`, `COMPLETED` or `FAILED`.
    pub order_state: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub payment: OrderPayment,
    #[serde(default)]
    pub channel: Option<serde_json::Value>,
}

impl Lsps1Order {
    pub fn to_record(&self, lsp_pubkey: &str) -> Lsps1OrderRecord {
        let now = Utc::now();
        let bolt11 = self.payment.bolt11.as_ref();
        Lsps1OrderRecord {
            order_id: self.order_id.clone(),
            lsp_pubkey: lsp_pubkey.to_lowercase(),
            state: self.order_state.clone(),
            payment_invoice: bolt11.map(|p| p.invoice.clone()),
            fee_total_sat: bolt11.map_or(0, |p| p.fee_total_sat),
            order_total_sat: bolt11.map_or(0, |p| p.order_total_sat),
            lsp_balance_sat: self.lsp_balance_sat,
            client_balance_sat: self.client_balance_sat,
            created_at: self.created_at.unwrap_or(now),
            updated_at: now,
            expires_at: bolt11.and_then(|p| p.expires_at),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct GetOrderParams<'a> {
    order_id: &'a str,
}

pub(crate) struct Lsps1Client {
    rpc: RpcChannel,
    pub(crate) pending: PendingRequests,
}

impl Lsps1Client {
    pub fn new(rpc: RpcChannel) -> Self {
        Self {
            rpc,
            pending: PendingRequests::new("lsps1"),
        }
    }

    pub async fn get_info(&self, peer: &str) -> Result<Lsps1GetInfoResult, LspsError> {
        self.rpc
            .call(&self.pending, peer, "lsps1.get_info", &serde_json::json!({}))
            .await
    }

    pub async fn create_order(
        &self,
        peer: &str,
        request: &CreateOrderRequest,
    ) -> Result<Lsps1Order, LspsError> {
        self.rpc
            .call(&self.pending, peer, "lsps1.create_order", request)
            .await
    }

    pub async fn get_order(&self, peer: &str, order_id: &str) -> Result<Lsps1Order, LspsError> {
        self.rpc
            .call(&self.pending, peer, "lsps1.get_order", &GetOrderParams { order_id })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn order_maps_to_a_persisted_record() {
        let order: Lsps1Order = serde_json::from_value(json!({
            "order_id": "bb4b5d0a",
            "lsp_balance_sat": "1000000",
            "client_balance_sat": "0",
            "order_state": "CREATED",
            "created_at": "2026-01-01T00:00:00Z",
            "payment": {"bolt11": {
                "state": "EXPECT_PAYMENT",
                "expires_at": "2026-01-01T01:00:00Z",
                "fee_total_sat": "8888",
                "order_total_sat": "8888",
                "invoice": "lnbc88880n1..."
            }},
            "channel": null
        }))
        .unwrap();
        let record = order.to_record("02ABCD");
        assert_eq!(record.lsp_pubkey, "02abcd");
        assert_eq!(record.fee_total_sat, 8888);
        assert_eq!(record.lsp_balance_sat, 1_000_000);
        assert_eq!(record.state, "CREATED");
        assert!(record.expires_at.is_some());
        assert!(!record.is_terminal());
    }
}
