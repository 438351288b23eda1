// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Transaction Ledger
//!
//! The ledger is the single writer of transaction rows. Outgoing payments
//! reserve their amount plus a fee reserve inside one database transaction
//! taken under the process-wide balance lock, then call the backend and
//! always finish with a terminal row. Incoming settlement is driven by the
//! backend streams (see [`consumer`]).
//!
//! ## States
//!
//! ```text
//! outgoing: pending ──► settled | failed
//! incoming: pending ──► settled
//!           pending ──► accepted ──► settled | failed   (hold invoices)
//!           pending ──► failed                          (canceled)
//! ```

pub mod consumer;
pub mod fees;
mod outgoing;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;

use crate::events::types::{self as names, Event, EventPayload};
use crate::events::EventPublisher;
use crate::lnclient::bolt11::DecodedInvoice;
use crate::lnclient::{
    JitRouteHint, LnClient, LnClientError, LnTransaction, MakeInvoiceParams, NotificationType,
};
use crate::permissions::PermissionError;
use crate::storage::transactions::{
    self as tx_rows, Transaction, TransactionState, TransactionType, TRANSACTIONS, TX_APP_INDEX,
    TX_HASH_INDEX,
};
use crate::storage::{Db, DbError};

pub use consumer::LedgerEventConsumer;
pub use outgoing::{KeysendRequest, PayInvoiceRequest, BOOSTAGRAM_TLV_TYPE};

/// Largest accepted `metadata` blob, in bytes of JSON.
pub const MAX_METADATA_BYTES: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("{0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("insufficient balance: {balance_msat} msat available, {required_msat} msat required")]
    InsufficientBalance { balance_msat: i64, required_msat: u64 },

    #[error("budget exceeded: {used_sat} of {max_sat} sat used, {required_sat} sat required")]
    QuotaExceeded {
        used_sat: u64,
        max_sat: u64,
        required_sat: u64,
    },

    #[error("payment failed: {0}")]
    PaymentFailed(String),

    #[error(transparent)]
    Backend(#[from] LnClientError),

    #[error(transparent)]
    Db(#[from] DbError),
}

impl From<PermissionError> for LedgerError {
    fn from(e: PermissionError) -> Self {
        match e {
            PermissionError::InsufficientBalance {
                balance_msat,
                required_msat,
            } => LedgerError::InsufficientBalance {
                balance_msat,
                required_msat,
            },
            PermissionError::QuotaExceeded {
                used_sat,
                max_sat,
                required_sat,
            } => LedgerError::QuotaExceeded {
                used_sat,
                max_sat,
                required_sat,
            },
            PermissionError::Db(e) => LedgerError::Db(e),
        }
    }
}

macro_rules! db_from {
    ($($t:ty),*) => {
        $(impl From<$t> for LedgerError {
            fn from(e: $t) -> Self {
                LedgerError::Db(e.into())
            }
        })*
    };
}
db_from!(
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError
);

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Arguments of `make_invoice` / `make_hold_invoice`.
#[derive(Debug, Clone, Default)]
pub struct InvoiceRequest {
    pub amount_msat: u64,
    pub description: String,
    pub description_hash: Option<String>,
    pub expiry_secs: Option<u64>,
    pub metadata: Option<Value>,
    pub app_id: Option<u64>,
    pub request_event_id: Option<u64>,
    /// Route hint and fee from a JIT purchase; the invoice asks for
    /// `amount_msat - jit_fee_msat`.
    pub jit: Option<JitWeave>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JitWeave {
    pub route_hint: JitRouteHint,
    pub jit_fee_msat: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    pub from: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: usize,
    pub unpaid_outgoing: bool,
    pub unpaid_incoming: bool,
    pub tx_type: Option<TransactionType>,
    pub app_id: Option<u64>,
}

/// How a self-paid hold invoice was resolved.
#[derive(Debug, Clone)]
enum SelfPaymentOutcome {
    Settled { preimage: String },
    Canceled,
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub(crate) fn validate_metadata(metadata: Option<&Value>) -> LedgerResult<()> {
    if let Some(metadata) = metadata {
        let size = serde_json::to_vec(metadata).map_err(DbError::from)?.len();
        if size > MAX_METADATA_BYTES {
            return Err(LedgerError::BadRequest(format!(
                "metadata exceeds {MAX_METADATA_BYTES} bytes"
            )));
        }
    }
    Ok(())
}

fn parse_hash(hex_str: &str) -> LedgerResult<[u8; 32]> {
    hex::decode(hex_str)
        .ok()
        .and_then(|b| <[u8; 32]>::try_from(b).ok())
        .ok_or_else(|| LedgerError::BadRequest("payment hash must be 32 bytes of hex".into()))
}

pub struct TransactionsService {
    db: Arc<Db>,
    client: Arc<dyn LnClient>,
    publisher: Arc<EventPublisher>,
    /// Serializes affordability checks with the pending-row insert.
    balance_lock: tokio::sync::Mutex<()>,
    self_payment_waiters: Mutex<HashMap<String, oneshot::Sender<SelfPaymentOutcome>>>,
}

impl TransactionsService {
    pub fn new(db: Arc<Db>, client: Arc<dyn LnClient>, publisher: Arc<EventPublisher>) -> Self {
        Self {
            db,
            client,
            publisher,
            balance_lock: tokio::sync::Mutex::new(()),
            self_payment_waiters: Mutex::new(HashMap::new()),
        }
    }

    pub fn client(&self) -> &Arc<dyn LnClient> {
        &self.client
    }

    fn emit(&self, name: &str, tx: &Transaction) {
        self.publisher
            .publish(Event::new(name, EventPayload::Transaction(Box::new(tx.clone()))));
    }

    // -------------------------------------------------------------------------
    // Row access
    // -------------------------------------------------------------------------

    pub(crate) fn rows_by_hash(&self, payment_hash: &str) -> LedgerResult<Vec<Transaction>> {
        let read = self.db.begin_read()?;
        let table = read.open_table(TRANSACTIONS)?;
        let index = read.open_table(TX_HASH_INDEX)?;
        Ok(tx_rows::by_hash(&table, &index, payment_hash)?)
    }

    pub(crate) fn get(&self, id: u64) -> LedgerResult<Transaction> {
        let read = self.db.begin_read()?;
        let table = read.open_table(TRANSACTIONS)?;
        tx_rows::get(&table, id)?.ok_or_else(|| LedgerError::NotFound(format!("transaction {id}")))
    }

    fn insert(&self, tx: &mut Transaction) -> LedgerResult<()> {
        let txn = self.db.begin_write()?;
        tx_rows::insert(&txn, tx)?;
        txn.commit()?;
        Ok(())
    }

    /// Compare-and-set transition in its own write transaction.
    pub(crate) fn transition<F>(
        &self,
        id: u64,
        expected: &[TransactionState],
        update: F,
    ) -> LedgerResult<Option<Transaction>>
    where
        F: FnOnce(&mut Transaction),
    {
        let txn = self.db.begin_write()?;
        let updated = tx_rows::transition(&txn, id, expected, update)?;
        txn.commit()?;
        Ok(updated)
    }

    /// The hold invoice for `payment_hash`; with `app_id`, only that app's.
    fn incoming_hold_row(&self, payment_hash: &str, app_id: Option<u64>) -> LedgerResult<Transaction> {
        self.rows_by_hash(payment_hash)?
            .into_iter()
            .filter(|tx| app_id.is_none_or(|id| tx.app_id == Some(id)))
            .find(|tx| tx.tx_type == TransactionType::Incoming && tx.hold)
            .ok_or_else(|| LedgerError::NotFound(format!("hold invoice {payment_hash}")))
    }

    // -------------------------------------------------------------------------
    // Incoming
    // -------------------------------------------------------------------------

    pub async fn make_invoice(&self, request: InvoiceRequest) -> LedgerResult<Transaction> {
        validate_metadata(request.metadata.as_ref())?;
        let (amount_msat, route_hint) = match &request.jit {
            Some(weave) if weave.jit_fee_msat < request.amount_msat => (
                request.amount_msat - weave.jit_fee_msat,
                Some(weave.route_hint.clone()),
            ),
            _ => (request.amount_msat, None),
        };

        let ln_tx = self
            .client
            .make_invoice(MakeInvoiceParams {
                amount_msat,
                description: request.description.clone(),
                description_hash: request.description_hash.clone(),
                expiry_secs: request.expiry_secs,
                route_hint,
            })
            .await?;

        let mut tx = incoming_row(&ln_tx, &request);
        if let Some(weave) = &request.jit {
            let meta = tx.metadata.get_or_insert_with(|| Value::Object(Default::default()));
            if let Some(obj) = meta.as_object_mut() {
                obj.insert("jit_fee_msat".into(), Value::from(weave.jit_fee_msat));
            }
        }
        self.insert(&mut tx)?;
        tracing::info!(
            tx_id = tx.id,
            app_id = ?tx.app_id,
            amount_msat = tx.amount_msat,
            "Invoice created"
        );
        Ok(tx)
    }

    pub async fn make_hold_invoice(
        &self,
        request: InvoiceRequest,
        payment_hash: &str,
    ) -> LedgerResult<Transaction> {
        validate_metadata(request.metadata.as_ref())?;
        parse_hash(payment_hash)?;
        let ln_tx = self
            .client
            .make_hold_invoice(
                MakeInvoiceParams {
                    amount_msat: request.amount_msat,
                    description: request.description.clone(),
                    description_hash: request.description_hash.clone(),
                    expiry_secs: request.expiry_secs,
                    route_hint: None,
                },
                payment_hash,
            )
            .await?;

        let mut tx = incoming_row(&ln_tx, &request);
        tx.hold = true;
        tx.preimage = None;
        self.insert(&mut tx)?;
        tracing::info!(tx_id = tx.id, app_id = ?tx.app_id, "Hold invoice created");
        Ok(tx)
    }

    /// Reveal the preimage of an accepted hold invoice. With `app_id` the
    /// invoice must belong to that app.
    pub async fn settle_hold_invoice(
        &self,
        preimage: &str,
        app_id: Option<u64>,
    ) -> LedgerResult<Transaction> {
        let bytes = hex::decode(preimage)
            .map_err(|_| LedgerError::BadRequest("preimage must be hex".into()))?;
        let payment_hash = sha256_hex(&bytes);
        let row = self.incoming_hold_row(&payment_hash, app_id)?;
        if row.state != TransactionState::Accepted {
            return Err(LedgerError::BadRequest(format!(
                "hold invoice is {}, not accepted",
                row.state
            )));
        }

        let waiter = self.take_waiter(&payment_hash);
        if waiter.is_none() {
            self.client.settle_hold_invoice(preimage).await?;
        }

        let settled = self.transition(row.id, &[TransactionState::Accepted], |tx| {
            tx.state = TransactionState::Settled;
            tx.preimage = Some(preimage.to_string());
            tx.settled_at = Some(Utc::now());
        })?;
        let settled = match settled {
            Some(tx) => {
                self.emit(names::PAYMENT_RECEIVED, &tx);
                tx
            }
            None => self.get(row.id)?,
        };
        if let Some(waiter) = waiter {
            let _ = waiter.send(SelfPaymentOutcome::Settled {
                preimage: preimage.to_string(),
            });
        }
        Ok(settled)
    }

    pub async fn cancel_hold_invoice(
        &self,
        payment_hash: &str,
        app_id: Option<u64>,
    ) -> LedgerResult<Transaction> {
        parse_hash(payment_hash)?;
        let row = self.incoming_hold_row(payment_hash, app_id)?;
        if row.state.is_terminal() {
            return Err(LedgerError::BadRequest(format!(
                "hold invoice is already {}",
                row.state
            )));
        }

        let waiter = self.take_waiter(payment_hash);
        if waiter.is_none() {
            self.client.cancel_hold_invoice(payment_hash).await?;
        }
        let canceled = self.mark_incoming_canceled(row.id)?;
        if let Some(waiter) = waiter {
            let _ = waiter.send(SelfPaymentOutcome::Canceled);
        }
        Ok(canceled)
    }

    pub(crate) fn mark_incoming_canceled(&self, id: u64) -> LedgerResult<Transaction> {
        let updated = self.transition(
            id,
            &[TransactionState::Pending, TransactionState::Accepted],
            |tx| {
                tx.state = TransactionState::Failed;
                tx.failure_reason = Some("canceled".into());
            },
        )?;
        match updated {
            Some(tx) => {
                if tx.hold {
                    self.emit(names::HOLD_INVOICE_CANCELED, &tx);
                }
                Ok(tx)
            }
            None => self.get(id),
        }
    }

    fn take_waiter(&self, payment_hash: &str) -> Option<oneshot::Sender<SelfPaymentOutcome>> {
        self.self_payment_waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(payment_hash)
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Find the transaction for a payment hash, preferring a settled row.
    pub async fn lookup(
        &self,
        payment_hash: &str,
        tx_type: Option<TransactionType>,
        app_id: Option<u64>,
    ) -> LedgerResult<Transaction> {
        self.reconcile_if_polling().await;
        let mut rows: Vec<Transaction> = self
            .rows_by_hash(payment_hash)?
            .into_iter()
            .filter(|tx| tx_type.is_none_or(|t| tx.tx_type == t))
            .filter(|tx| app_id.is_none_or(|id| tx.app_id == Some(id)))
            .collect();
        rows.sort_by_key(|tx| (tx.state == TransactionState::Settled, tx.id));
        rows.pop()
            .ok_or_else(|| LedgerError::NotFound(format!("transaction {payment_hash}")))
    }

    /// Newest-first page and the total number of matching rows.
    pub async fn list(&self, query: &ListQuery) -> LedgerResult<(Vec<Transaction>, usize)> {
        self.reconcile_if_polling().await;
        let rows = {
            let read = self.db.begin_read()?;
            let table = read.open_table(TRANSACTIONS)?;
            match query.app_id {
                Some(app_id) => {
                    let index = read.open_table(TX_APP_INDEX)?;
                    tx_rows::by_app(&table, &index, app_id)?
                }
                None => tx_rows::all(&table)?,
            }
        };

        let mut matching: Vec<Transaction> = rows
            .into_iter()
            .filter(|tx| query.tx_type.is_none_or(|t| tx.tx_type == t))
            .filter(|tx| {
                tx.state == TransactionState::Settled
                    || match tx.tx_type {
                        TransactionType::Outgoing => query.unpaid_outgoing,
                        TransactionType::Incoming => query.unpaid_incoming,
                    }
            })
            .filter(|tx| {
                let at = tx.settled_at.unwrap_or(tx.created_at);
                query.from.is_none_or(|from| at >= from) && query.until.is_none_or(|until| at <= until)
            })
            .collect();
        matching.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });

        let total = matching.len();
        let page = matching
            .into_iter()
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .collect();
        Ok((page, total))
    }

    /// Worst-case routing fee of paying `bolt11`, from its route hints.
    pub fn estimate_fee(&self, bolt11: &str) -> LedgerResult<u64> {
        let invoice = DecodedInvoice::decode(bolt11)
            .map_err(|e| LedgerError::BadRequest(e.to_string()))?;
        Ok(invoice.estimate_fee_msat(invoice.amount_msat.unwrap_or(0)))
    }

    /// Settle pending incoming rows the backend reports as paid.
    ///
    /// Returns the number of rows settled.
    pub async fn reconcile_pending_incoming(&self) -> LedgerResult<usize> {
        let pending: Vec<Transaction> = {
            let read = self.db.begin_read()?;
            let table = read.open_table(TRANSACTIONS)?;
            tx_rows::all(&table)?
                .into_iter()
                .filter(|tx| {
                    tx.tx_type == TransactionType::Incoming
                        && tx.state == TransactionState::Pending
                        && !tx.hold
                })
                .collect()
        };

        let mut settled = 0;
        for row in pending {
            match self.client.lookup_invoice(&row.payment_hash).await {
                Ok(remote) if remote.settled_at.is_some() => {
                    if self.apply_payment_received(&remote)?.is_some() {
                        settled += 1;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(payment_hash = %row.payment_hash, error = %e, "Invoice lookup failed");
                }
            }
        }
        Ok(settled)
    }

    /// Fail pending incoming rows whose invoice expired.
    pub fn expire_pending_incoming(&self, now: DateTime<Utc>) -> LedgerResult<usize> {
        let expired: Vec<u64> = {
            let read = self.db.begin_read()?;
            let table = read.open_table(TRANSACTIONS)?;
            tx_rows::all(&table)?
                .into_iter()
                .filter(|tx| {
                    tx.tx_type == TransactionType::Incoming
                        && tx.state == TransactionState::Pending
                        && tx.expires_at.is_some_and(|at| at < now)
                })
                .map(|tx| tx.id)
                .collect()
        };
        let mut count = 0;
        for id in expired {
            let updated = self.transition(id, &[TransactionState::Pending], |tx| {
                tx.state = TransactionState::Failed;
                tx.failure_reason = Some("expired".into());
            })?;
            count += usize::from(updated.is_some());
        }
        Ok(count)
    }

    async fn reconcile_if_polling(&self) {
        if self
            .client
            .supported_notification_types()
            .contains(&NotificationType::PaymentReceived)
        {
            return;
        }
        if let Err(e) = self.reconcile_pending_incoming().await {
            tracing::warn!(error = %e, "Pending invoice reconciliation failed");
        }
    }
}

fn incoming_row(ln_tx: &LnTransaction, request: &InvoiceRequest) -> Transaction {
    let mut tx = Transaction::new_pending(TransactionType::Incoming, ln_tx.payment_hash.clone());
    tx.app_id = request.app_id;
    tx.request_event_id = request.request_event_id;
    tx.amount_msat = ln_tx.amount_msat;
    tx.payment_request = ln_tx.invoice.clone().unwrap_or_default();
    tx.preimage = ln_tx.preimage.clone();
    tx.description = request.description.clone();
    tx.description_hash = request.description_hash.clone().unwrap_or_default();
    tx.expires_at = ln_tx.expires_at.and_then(|at| DateTime::from_timestamp(at, 0));
    tx.metadata = request.metadata.clone();
    tx
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::events::testing::RecordingSubscriber;
    use crate::lnclient::memory::MemoryLnClient;
    use crate::storage::temp_db;
    use bitcoin::secp256k1::SecretKey;

    pub struct Harness {
        pub db: Arc<Db>,
        pub ln: Arc<MemoryLnClient>,
        pub bus: Arc<EventPublisher>,
        pub ledger: Arc<TransactionsService>,
        pub _dir: tempfile::TempDir,
    }

    /// Ledger over a temp database and an in-memory node, with the
    /// backend-event consumer registered.
    pub async fn harness() -> Harness {
        let (db, dir) = temp_db();
        let ln = Arc::new(MemoryLnClient::new(SecretKey::from_slice(&[11u8; 32]).unwrap()));
        let bus = Arc::new(EventPublisher::new());
        let ledger = Arc::new(TransactionsService::new(db.clone(), ln.clone(), bus.clone()));
        bus.register(Arc::new(LedgerEventConsumer::new(&ledger)));
        Harness {
            db,
            ln,
            bus,
            ledger,
            _dir: dir,
        }
    }

    /// Event names seen by `recorder` once `name` shows up (or after a second).
    pub async fn wait_for(recorder: &RecordingSubscriber, name: &str) -> Vec<String> {
        for _ in 0..100 {
            let names = recorder.names().await;
            if names.iter().any(|n| n == name) {
                return names;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        recorder.names().await
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::events::testing::RecordingSubscriber;
    use crate::lnclient::subscriptions::to_bus_event;
    use crate::lnclient::LnEvent;

    #[tokio::test]
    async fn make_invoice_records_pending_row_with_preimage() {
        let h = harness().await;
        let tx = h
            .ledger
            .make_invoice(InvoiceRequest {
                amount_msat: 21_000,
                description: "tip".into(),
                app_id: Some(3),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(tx.state, TransactionState::Pending);
        assert_eq!(tx.tx_type, TransactionType::Incoming);
        assert_eq!(tx.app_id, Some(3));
        let preimage = hex::decode(tx.preimage.as_ref().unwrap()).unwrap();
        assert_eq!(sha256_hex(&preimage), tx.payment_hash);
    }

    #[tokio::test]
    async fn oversized_metadata_is_rejected() {
        let h = harness().await;
        let big = Value::String("x".repeat(MAX_METADATA_BYTES));
        let err = h
            .ledger
            .make_invoice(InvoiceRequest {
                amount_msat: 1_000,
                metadata: Some(big),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::BadRequest(_)));
    }

    #[tokio::test]
    async fn jit_weave_reduces_the_invoice_amount() {
        let h = harness().await;
        let lsp = bitcoin::secp256k1::SecretKey::from_slice(&[12u8; 32])
            .unwrap()
            .public_key(&bitcoin::secp256k1::Secp256k1::new())
            .to_string();
        let tx = h
            .ledger
            .make_invoice(InvoiceRequest {
                amount_msat: 100_000,
                jit: Some(JitWeave {
                    route_hint: JitRouteHint {
                        lsp_pubkey: lsp,
                        short_channel_id: 1,
                        cltv_expiry_delta: 144,
                        fee_base_msat: 2_000,
                        fee_proportional_millionths: 0,
                    },
                    jit_fee_msat: 2_000,
                }),
                ..Default::default()
            })
            .await
            .unwrap();
        let decoded = DecodedInvoice::decode(&tx.payment_request).unwrap();
        assert_eq!(decoded.amount_msat, Some(98_000));
        assert_eq!(decoded.route_hints.len(), 1);
        assert_eq!(tx.metadata.unwrap()["jit_fee_msat"], 2_000);
    }

    #[tokio::test]
    async fn hold_invoice_happy_path() {
        let h = harness().await;
        let recorder = Arc::new(RecordingSubscriber::default());
        h.bus.register(recorder.clone());
        h.bus
            .publish_sync(Event::named("warmup"))
            .await;

        let preimage = [42u8; 32];
        let hash = sha256_hex(&preimage);
        let tx = h
            .ledger
            .make_hold_invoice(
                InvoiceRequest {
                    amount_msat: 1_000,
                    expiry_secs: Some(3600),
                    ..Default::default()
                },
                &hash,
            )
            .await
            .unwrap();
        assert_eq!(tx.state, TransactionState::Pending);
        assert!(tx.hold && tx.preimage.is_none());

        // backend reports the HTLC as held
        h.bus
            .publish_sync(to_bus_event(LnEvent::HoldInvoiceAccepted {
                transaction: h.ln.lookup_invoice(&hash).await.unwrap(),
                settle_deadline: 144,
            }))
            .await;
        let accepted = h.ledger.get(tx.id).unwrap();
        assert_eq!(accepted.state, TransactionState::Accepted);
        assert_eq!(accepted.settle_deadline, Some(144));

        let settled = h.ledger.settle_hold_invoice(&hex::encode(preimage), None).await.unwrap();
        assert_eq!(settled.state, TransactionState::Settled);
        assert_eq!(settled.preimage.as_deref(), Some(hex::encode(preimage).as_str()));

        let seen = wait_for(&recorder, names::PAYMENT_RECEIVED).await;
        let accepted_at = seen.iter().position(|n| n == names::HOLD_INVOICE_ACCEPTED).unwrap();
        let received_at = seen.iter().position(|n| n == names::PAYMENT_RECEIVED).unwrap();
        assert!(accepted_at < received_at);
    }

    #[tokio::test]
    async fn settle_requires_accepted_state_and_matching_hash() {
        let h = harness().await;
        let preimage = [8u8; 32];
        let hash = sha256_hex(&preimage);
        h.ledger
            .make_hold_invoice(InvoiceRequest { amount_msat: 1_000, ..Default::default() }, &hash)
            .await
            .unwrap();
        assert!(matches!(
            h.ledger.settle_hold_invoice(&hex::encode(preimage), None).await,
            Err(LedgerError::BadRequest(_))
        ));
        assert!(matches!(
            h.ledger.settle_hold_invoice(&hex::encode([9u8; 32]), None).await,
            Err(LedgerError::NotFound(_))
        ));
        let canceled = h.ledger.cancel_hold_invoice(&hash, None).await.unwrap();
        assert_eq!(canceled.state, TransactionState::Failed);
        assert!(matches!(
            h.ledger.make_hold_invoice(InvoiceRequest::default(), "abcd").await,
            Err(LedgerError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn list_defaults_to_settled_and_honours_limit() {
        let h = harness().await;
        let mut hashes = Vec::new();
        for amount in [1_000, 2_000, 3_000] {
            let tx = h
                .ledger
                .make_invoice(InvoiceRequest {
                    amount_msat: amount,
                    ..Default::default()
                })
                .await
                .unwrap();
            hashes.push(tx.payment_hash);
        }
        h.ln.simulate_incoming_payment(&hashes[0]).unwrap();
        h.bus
            .publish_sync(to_bus_event(LnEvent::PaymentReceived(
                h.ln.lookup_invoice(&hashes[0]).await.unwrap(),
            )))
            .await;

        let (page, total) = h.ledger.list(&ListQuery::default()).await.unwrap();
        assert_eq!((page.len(), total), (1, 1));

        let query = ListQuery {
            unpaid_incoming: true,
            limit: Some(2),
            ..Default::default()
        };
        let (page, total) = h.ledger.list(&query).await.unwrap();
        assert_eq!(total, 3);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].amount_msat, 3_000);
    }

    #[tokio::test]
    async fn polling_backends_reconcile_before_lookup() {
        let h = harness().await;
        h.ln.set_notification_types(Default::default());
        let tx = h
            .ledger
            .make_invoice(InvoiceRequest {
                amount_msat: 5_000,
                ..Default::default()
            })
            .await
            .unwrap();
        h.ln.simulate_incoming_payment(&tx.payment_hash).unwrap();
        // the stream is not consumed here; lookup must poll the backend
        let found = h.ledger.lookup(&tx.payment_hash, None, None).await.unwrap();
        assert_eq!(found.state, TransactionState::Settled);
    }

    #[tokio::test]
    async fn expired_pending_invoices_fail() {
        let h = harness().await;
        let tx = h
            .ledger
            .make_invoice(InvoiceRequest {
                amount_msat: 5_000,
                expiry_secs: Some(60),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(h.ledger.expire_pending_incoming(Utc::now()).unwrap(), 0);
        let later = Utc::now() + chrono::Duration::seconds(120);
        assert_eq!(h.ledger.expire_pending_incoming(later).unwrap(), 1);
        assert_eq!(h.ledger.get(tx.id).unwrap().state, TransactionState::Failed);
    }
}
