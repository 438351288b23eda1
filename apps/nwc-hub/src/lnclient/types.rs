// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Backend-neutral value types exchanged with a Lightning node.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::storage::transactions::TransactionType;

/// Custom-record TLV carrying the target app id of an unsolicited payment.
pub const APP_ID_TLV_TYPE: u64 = 696_969;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub alias: String,
    pub color: String,
    pub pubkey: String,
    pub network: String,
    pub block_height: u32,
    pub block_hash: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightningBalance {
    pub total_spendable_msat: u64,
    pub total_receivable_msat: u64,
    pub next_max_spendable_msat: u64,
    pub next_max_receivable_msat: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnchainBalance {
    pub spendable_sat: u64,
    pub total_sat: u64,
    pub reserved_sat: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balances {
    pub lightning: LightningBalance,
    pub onchain: OnchainBalance,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub remote_pubkey: String,
    pub local_balance_msat: u64,
    pub remote_balance_msat: u64,
    pub active: bool,
    pub public: bool,
    pub funding_tx_id: String,
    pub confirmations: Option<u32>,
    pub confirmations_required: Option<u32>,
}

impl Channel {
    /// Inactive although its funding has the required confirmations.
    pub fn is_offline(&self) -> bool {
        if self.active {
            return false;
        }
        match (self.confirmations, self.confirmations_required) {
            (Some(have), Some(need)) => have >= need,
            (_, None) => true,
            (None, Some(_)) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDetails {
    pub node_id: String,
    pub address: String,
    pub is_persisted: bool,
    pub is_connected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenChannelRequest {
    pub pubkey: String,
    pub amount_sat: u64,
    pub public: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenChannelResponse {
    pub funding_tx_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseChannelRequest {
    pub channel_id: String,
    pub node_id: String,
    pub force: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateChannelRequest {
    pub channel_id: String,
    pub node_id: String,
    pub forwarding_fee_base_msat: u32,
    pub forwarding_fee_proportional_millionths: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectPeerRequest {
    pub pubkey: String,
    pub address: String,
    pub port: u16,
}

/// Parameters for `make_invoice` / `make_hold_invoice`.
#[derive(Debug, Clone, Default)]
pub struct MakeInvoiceParams {
    pub amount_msat: u64,
    pub description: String,
    pub description_hash: Option<String>,
    /// Seconds until the invoice expires; backends pick a default when `None`.
    pub expiry_secs: Option<u64>,
    /// Single-hop route hint through an LSP, set by the JIT weaver.
    pub route_hint: Option<JitRouteHint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JitRouteHint {
    pub lsp_pubkey: String,
    pub short_channel_id: u64,
    pub cltv_expiry_delta: u16,
    pub fee_base_msat: u32,
    pub fee_proportional_millionths: u32,
}

/// A payment or invoice as the backend reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LnTransaction {
    #[serde(rename = "type")]
    pub tx_type: TransactionType,
    pub invoice: Option<String>,
    pub description: Option<String>,
    pub description_hash: Option<String>,
    pub preimage: Option<String>,
    pub payment_hash: String,
    pub amount_msat: u64,
    pub fees_paid_msat: u64,
    pub created_at: i64,
    pub expires_at: Option<i64>,
    pub settled_at: Option<i64>,
    pub settle_deadline: Option<u32>,
    /// Custom records, e.g. `{"tlv_records": [{"type": 696969, "value": "..."}]}`.
    pub metadata: Option<Value>,
}

impl LnTransaction {
    /// App id carried by the `696969` custom record, if any.
    pub fn app_id_tlv(&self) -> Option<u64> {
        let records = self.metadata.as_ref()?.get("tlv_records")?.as_array()?;
        records.iter().find_map(|record| {
            if record.get("type")?.as_u64()? != APP_ID_TLV_TYPE {
                return None;
            }
            let raw = hex::decode(record.get("value")?.as_str()?).ok()?;
            String::from_utf8(raw).ok()?.trim().parse().ok()
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlvRecord {
    #[serde(rename = "type")]
    pub tlv_type: u64,
    /// Hex-encoded value.
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayInvoiceResponse {
    pub preimage: String,
    pub fee_msat: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnchainTransaction {
    pub txid: String,
    pub amount_sat: u64,
    pub incoming: bool,
    pub confirmations: u32,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardEvent {
    pub outbound_amount_forwarded_msat: u64,
    pub total_fee_earned_msat: u64,
    pub forwarded_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeStatus {
    pub is_ready: bool,
    pub internal: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomMessage {
    pub peer: String,
    pub msg_type: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelAcceptRequest {
    pub id: u64,
    pub node_pubkey: String,
    pub funding_amount_sat: u64,
    pub wants_zero_conf: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelAcceptResponse {
    pub id: u64,
    pub accept: bool,
    pub min_accept_depth: u32,
    pub zero_conf: bool,
}

/// Push notification kinds a backend can deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    PaymentReceived,
    PaymentSent,
    HoldInvoiceAccepted,
}

impl NotificationType {
    pub const ALL: [NotificationType; 3] = [
        NotificationType::PaymentReceived,
        NotificationType::PaymentSent,
        NotificationType::HoldInvoiceAccepted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            NotificationType::PaymentReceived => "payment_received",
            NotificationType::PaymentSent => "payment_sent",
            NotificationType::HoldInvoiceAccepted => "hold_invoice_accepted",
        }
    }
}

/// Item of the backend's long-lived streams.
#[derive(Debug, Clone, PartialEq)]
pub enum LnEvent {
    PaymentReceived(LnTransaction),
    PaymentSent(LnTransaction),
    PaymentFailed {
        payment_hash: String,
        reason: String,
    },
    HoldInvoiceAccepted {
        transaction: LnTransaction,
        settle_deadline: u32,
    },
    InvoiceCanceled {
        payment_hash: String,
    },
    ChannelOpened(Channel),
    ChannelClosed {
        channel_id: String,
        remote_pubkey: String,
    },
    OnchainTransaction(OnchainTransaction),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tx(metadata: Option<Value>) -> LnTransaction {
        LnTransaction {
            tx_type: TransactionType::Incoming,
            invoice: None,
            description: None,
            description_hash: None,
            preimage: None,
            payment_hash: "00".into(),
            amount_msat: 1000,
            fees_paid_msat: 0,
            created_at: 0,
            expires_at: None,
            settled_at: None,
            settle_deadline: None,
            metadata,
        }
    }

    #[test]
    fn app_id_is_read_from_custom_record() {
        let with = tx(Some(json!({
            "tlv_records": [
                {"type": 5482373484u64, "value": "abcd"},
                {"type": 696969, "value": hex::encode("42")}
            ]
        })));
        assert_eq!(with.app_id_tlv(), Some(42));
        assert_eq!(tx(None).app_id_tlv(), None);
        let garbage = tx(Some(json!({"tlv_records": [{"type": 696969, "value": "zz"}]})));
        assert_eq!(garbage.app_id_tlv(), None);
    }

    #[test]
    fn offline_channels_need_confirmations() {
        let mut channel = Channel {
            id: "1".into(),
            remote_pubkey: "02".into(),
            local_balance_msat: 0,
            remote_balance_msat: 0,
            active: false,
            public: false,
            funding_tx_id: "tx".into(),
            confirmations: Some(1),
            confirmations_required: Some(3),
        };
        assert!(!channel.is_offline());
        channel.confirmations = Some(3);
        assert!(channel.is_offline());
        channel.active = true;
        assert!(!channel.is_offline());
    }
}
