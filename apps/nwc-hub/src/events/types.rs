// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Event names and typed payloads.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::lnclient::types::LnTransaction;
use crate::storage::transactions::Transaction;

// =============================================================================
// Event names
// =============================================================================

pub const NODE_STARTED: &str = "nwc_node_started";
pub const NODE_START_FAILED: &str = "nwc_node_start_failed";
pub const NODE_STOPPED: &str = "nwc_node_stopped";

pub const APP_CREATED: &str = "nwc_app_created";
pub const APP_UPDATED: &str = "nwc_app_updated";
pub const APP_DELETED: &str = "nwc_app_deleted";

pub const PAYMENT_SENT: &str = "nwc_payment_sent";
pub const PAYMENT_FAILED: &str = "nwc_payment_failed";
pub const PAYMENT_RECEIVED: &str = "nwc_payment_received";
pub const HOLD_INVOICE_ACCEPTED: &str = "nwc_hold_invoice_accepted";
pub const HOLD_INVOICE_CANCELED: &str = "nwc_hold_invoice_canceled";
pub const BUDGET_WARNING: &str = "nwc_budget_warning";
pub const PERMISSION_DENIED: &str = "nwc_permission_denied";

/// Raw backend stream events, consumed by the ledger.
pub const LNCLIENT_PAYMENT_RECEIVED: &str = "nwc_lnclient_payment_received";
pub const LNCLIENT_PAYMENT_SENT: &str = "nwc_lnclient_payment_sent";
pub const LNCLIENT_PAYMENT_FAILED: &str = "nwc_lnclient_payment_failed";
pub const LNCLIENT_HOLD_INVOICE_ACCEPTED: &str = "nwc_lnclient_hold_invoice_accepted";
pub const LNCLIENT_INVOICE_CANCELED: &str = "nwc_lnclient_invoice_canceled";
pub const LNCLIENT_CHANNEL_OPENED: &str = "nwc_lnclient_channel_opened";
pub const LNCLIENT_CHANNEL_CLOSED: &str = "nwc_lnclient_channel_closed";
pub const LNCLIENT_ONCHAIN_TRANSACTION: &str = "nwc_lnclient_onchain_transaction";

pub const LSPS2_JIT_PURCHASED: &str = "nwc_lsps2_jit_channel_purchased";
pub const LSPS1_ORDER_STATE_CHANGED: &str = "nwc_lsps1_order_state_changed";
pub const LSPS5_NOTIFICATION: &str = "nwc_lsps5_notification";

// =============================================================================
// Event
// =============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    None,
    Transaction(Box<Transaction>),
    LnTransaction(Box<LnTransaction>),
    HoldInvoiceAccepted {
        transaction: Box<LnTransaction>,
        settle_deadline: Option<u32>,
    },
    PaymentFailed {
        payment_hash: String,
        reason: String,
    },
    InvoiceCanceled {
        payment_hash: String,
    },
    App {
        app_id: u64,
        app_pubkey: String,
        wallet_pubkey: Option<String>,
    },
    PermissionDenied {
        app_id: u64,
        code: String,
        message: String,
    },
    BudgetWarning {
        app_id: u64,
        used_msat: u64,
        total_msat: u64,
    },
    Lsps5Notification {
        lsp_pubkey: String,
        method: String,
        params: Value,
    },
    Json(Value),
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub name: String,
    pub payload: EventPayload,
    pub globals: BTreeMap<String, String>,
}

impl Event {
    pub fn new(name: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            name: name.into(),
            payload,
            globals: BTreeMap::new(),
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, EventPayload::None)
    }

    /// Payload and globals as a JSON object, for logs and SSE.
    pub fn properties(&self) -> Value {
        serde_json::json!({
            "event": self.name,
            "properties": self.payload,
            "globals": self.globals,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn properties_carry_tagged_payload() {
        let event = Event::new(
            PAYMENT_FAILED,
            EventPayload::PaymentFailed {
                payment_hash: "ab".into(),
                reason: "no route".into(),
            },
        );
        let props = event.properties();
        assert_eq!(props["event"], "nwc_payment_failed");
        assert_eq!(props["properties"]["kind"], "payment_failed");
        assert_eq!(props["properties"]["data"]["reason"], "no route");
    }
}
