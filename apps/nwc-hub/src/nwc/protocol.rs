// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! NIP-47 wire types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::apps::AppError;
use crate::ledger::LedgerError;
use crate::lnclient::{LnClientError, TlvRecord};
use crate::storage::transactions::Transaction;
use crate::storage::DbError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NwcErrorCode {
    BadRequest,
    NotFound,
    InsufficientBalance,
    QuotaExceeded,
    Internal,
    Restricted,
    Unauthorized,
    NotImplemented,
    Expired,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code:?}: {message}")]
pub struct NwcError {
    pub code: NwcErrorCode,
    pub message: String,
}

impl NwcError {
    pub fn new(code: NwcErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(NwcErrorCode::BadRequest, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(NwcErrorCode::Internal, message)
    }
}

impl From<LedgerError> for NwcError {
    fn from(e: LedgerError) -> Self {
        let code = match &e {
            LedgerError::BadRequest(_) => NwcErrorCode::BadRequest,
            LedgerError::NotFound(_) => NwcErrorCode::NotFound,
            LedgerError::InsufficientBalance { .. } => NwcErrorCode::InsufficientBalance,
            LedgerError::QuotaExceeded { .. } => NwcErrorCode::QuotaExceeded,
            LedgerError::PaymentFailed(_) => NwcErrorCode::Other,
            LedgerError::Backend(LnClientError::NotFound(_)) => NwcErrorCode::NotFound,
            LedgerError::Backend(LnClientError::InvalidInvoice(_)) => NwcErrorCode::BadRequest,
            LedgerError::Backend(LnClientError::Unsupported(_)) => NwcErrorCode::NotImplemented,
            LedgerError::Backend(_) | LedgerError::Db(_) => NwcErrorCode::Internal,
        };
        NwcError::new(code, e.to_string())
    }
}

impl From<LnClientError> for NwcError {
    fn from(e: LnClientError) -> Self {
        LedgerError::Backend(e).into()
    }
}

impl From<DbError> for NwcError {
    fn from(e: DbError) -> Self {
        NwcError::internal(e.to_string())
    }
}

impl From<AppError> for NwcError {
    fn from(e: AppError) -> Self {
        match e {
            AppError::NotFound(_) => NwcError::new(NwcErrorCode::Unauthorized, e.to_string()),
            other => NwcError::internal(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub result_type: String,
    pub error: Option<NwcError>,
    pub result: Option<Value>,
}

impl Response {
    pub fn ok(method: &str, result: Value) -> Self {
        Self {
            result_type: method.to_string(),
            error: None,
            result: Some(result),
        }
    }

    pub fn err(method: &str, error: NwcError) -> Self {
        Self {
            result_type: method.to_string(),
            error: Some(error),
            result: None,
        }
    }
}

/// Transaction as NIP-47 clients see it. Amounts in msat, times in unix
/// seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NwcTransaction {
    #[serde(rename = "type")]
    pub tx_type: String,
    pub state: String,
    pub invoice: String,
    pub description: String,
    pub description_hash: String,
    pub preimage: String,
    pub payment_hash: String,
    pub amount: u64,
    pub fees_paid: u64,
    pub created_at: i64,
    pub expires_at: Option<i64>,
    pub settled_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settle_deadline: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl From<&Transaction> for NwcTransaction {
    fn from(tx: &Transaction) -> Self {
        let mut metadata = tx.metadata.clone();
        if let Some(boostagram) = &tx.boostagram {
            let map = metadata.get_or_insert_with(|| Value::Object(Default::default()));
            if let Some(map) = map.as_object_mut() {
                map.insert("boostagram".into(), boostagram.clone());
            }
        }
        Self {
            tx_type: tx.tx_type.to_string(),
            state: tx.state.to_string(),
            invoice: tx.payment_request.clone(),
            description: tx.description.clone(),
            description_hash: tx.description_hash.clone(),
            preimage: tx.preimage.clone().unwrap_or_default(),
            payment_hash: tx.payment_hash.clone(),
            amount: tx.amount_msat,
            fees_paid: tx.fee_msat,
            created_at: tx.created_at.timestamp(),
            expires_at: tx.expires_at.map(|t| t.timestamp()),
            settled_at: tx.settled_at.map(|t| t.timestamp()),
            settle_deadline: tx.settle_deadline,
            metadata,
        }
    }
}

/// Content of a kind 23196/23197 event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub notification_type: String,
    pub notification: NwcTransaction,
}

// =============================================================================
// Method params
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct PayInvoiceParams {
    /// Client-chosen id, echoed as the `d` tag in multi-pay responses.
    pub id: Option<String>,
    pub invoice: String,
    pub amount: Option<u64>,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MultiPayInvoiceParams {
    pub invoices: Vec<PayInvoiceParams>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlvParam {
    #[serde(rename = "type")]
    pub tlv_type: u64,
    /// Hex-encoded value.
    pub value: String,
}

impl From<&TlvParam> for TlvRecord {
    fn from(p: &TlvParam) -> Self {
        TlvRecord {
            tlv_type: p.tlv_type,
            value: p.value.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PayKeysendParams {
    pub id: Option<String>,
    pub amount: u64,
    pub pubkey: String,
    pub preimage: Option<String>,
    #[serde(default)]
    pub tlv_records: Vec<TlvParam>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MultiPayKeysendParams {
    pub keysends: Vec<PayKeysendParams>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MakeInvoiceParams {
    pub amount: u64,
    #[serde(default)]
    pub description: String,
    pub description_hash: Option<String>,
    pub expiry: Option<u64>,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MakeHoldInvoiceParams {
    pub amount: u64,
    #[serde(default)]
    pub description: String,
    pub description_hash: Option<String>,
    pub expiry: Option<u64>,
    pub payment_hash: String,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SettleHoldInvoiceParams {
    pub preimage: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CancelHoldInvoiceParams {
    pub payment_hash: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LookupInvoiceParams {
    pub payment_hash: Option<String>,
    pub invoice: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListTransactionsParams {
    pub from: Option<i64>,
    pub until: Option<i64>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    #[serde(default)]
    pub unpaid: bool,
    pub unpaid_outgoing: Option<bool>,
    pub unpaid_incoming: Option<bool>,
    #[serde(rename = "type")]
    pub tx_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignMessageParams {
    pub message: String,
}

/// Decode `params` into a method's param struct.
pub fn parse_params<T: serde::de::DeserializeOwned>(params: &Value) -> Result<T, NwcError> {
    serde_json::from_value(params.clone())
        .map_err(|e| NwcError::bad_request(format!("invalid params: {e}")))
}
