// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Outgoing payments: reserve, execute, finish.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::oneshot;

use super::fees::{fee_reserve_msat, MAX_AMOUNT_MSAT};
use super::{
    sha256_hex, validate_metadata, LedgerError, LedgerResult, SelfPaymentOutcome,
    TransactionsService,
};
use crate::events::types::{self as names, Event, EventPayload};
use crate::lnclient::bolt11::DecodedInvoice;
use crate::lnclient::TlvRecord;
use crate::permissions::budget::{
    budget_usage_msat, check_can_pay, crosses_warning, limit_msat, window_start,
};
use crate::permissions::{PermissionError, Scope};
use crate::storage::apps::{self as app_rows, APP_PERMISSIONS};
use crate::storage::transactions::{
    self as tx_rows, Transaction, TransactionState, TransactionType, TRANSACTIONS, TX_APP_INDEX,
    TX_HASH_INDEX,
};

/// TLV type carrying a boostagram JSON blob.
pub const BOOSTAGRAM_TLV_TYPE: u64 = 7_629_169;

/// Upper bound on how long a self-paid hold invoice is awaited when the
/// invoice has no expiry.
const DEFAULT_HOLD_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Default)]
pub struct PayInvoiceRequest {
    pub bolt11: String,
    /// Required for zero-amount invoices, ignored otherwise.
    pub amount_msat: Option<u64>,
    pub metadata: Option<Value>,
    pub app_id: Option<u64>,
    pub request_event_id: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct KeysendRequest {
    pub amount_msat: u64,
    pub destination: String,
    pub tlv_records: Vec<TlvRecord>,
    /// Hex preimage; generated when absent.
    pub preimage: Option<String>,
    pub metadata: Option<Value>,
    pub app_id: Option<u64>,
    pub request_event_id: Option<u64>,
}

/// What the backend (or the self-payment path) reported.
type PaymentOutcome = Result<(String, u64), String>;

enum Route {
    Backend {
        bolt11: String,
        amount_msat: Option<u64>,
    },
    Keysend {
        destination: String,
        tlv_records: Vec<TlvRecord>,
        preimage: String,
    },
    SelfPayment(Transaction),
}

fn boostagram(records: &[TlvRecord]) -> Option<Value> {
    let record = records.iter().find(|r| r.tlv_type == BOOSTAGRAM_TLV_TYPE)?;
    let raw = hex::decode(&record.value).ok()?;
    serde_json::from_slice(&raw).ok()
}

impl TransactionsService {
    /// Pay a BOLT11 invoice and wait for the terminal state.
    pub async fn send_payment_sync(
        self: &Arc<Self>,
        request: PayInvoiceRequest,
    ) -> LedgerResult<Transaction> {
        validate_metadata(request.metadata.as_ref())?;
        let invoice = DecodedInvoice::decode(&request.bolt11)
            .map_err(|e| LedgerError::BadRequest(e.to_string()))?;
        if invoice.is_expired(Utc::now()) {
            return Err(LedgerError::BadRequest("invoice expired".into()));
        }
        let amount_msat = invoice
            .amount_msat
            .or(request.amount_msat)
            .filter(|amount| *amount > 0)
            .ok_or_else(|| LedgerError::BadRequest("amount required for zero-amount invoice".into()))?;

        let mut draft = Transaction::new_pending(TransactionType::Outgoing, &invoice.payment_hash);
        draft.app_id = request.app_id;
        draft.request_event_id = request.request_event_id;
        draft.amount_msat = amount_msat;
        draft.payment_request = invoice.bolt11.clone();
        draft.description = invoice.description.clone().unwrap_or_default();
        draft.description_hash = invoice.description_hash.clone().unwrap_or_default();
        draft.expires_at = Some(invoice.expires_at);
        draft.metadata = request.metadata;

        let to_self = invoice.payee_pubkey == self.client.node_pubkey();
        let (pending, self_row) = self.reserve_outgoing(draft, to_self).await?;
        let route = match self_row {
            Some(incoming) => Route::SelfPayment(incoming),
            None => Route::Backend {
                bolt11: invoice.bolt11,
                amount_msat: invoice.amount_msat.is_none().then_some(amount_msat),
            },
        };
        self.execute(pending, route).await
    }

    /// Spontaneous payment to a node pubkey.
    pub async fn send_keysend(self: &Arc<Self>, request: KeysendRequest) -> LedgerResult<Transaction> {
        validate_metadata(request.metadata.as_ref())?;
        if request.amount_msat == 0 {
            return Err(LedgerError::BadRequest("amount must be positive".into()));
        }
        let preimage = match request.preimage {
            Some(preimage) => preimage,
            None => hex::encode(rand::random::<[u8; 32]>()),
        };
        let preimage_bytes = hex::decode(&preimage)
            .ok()
            .filter(|b| b.len() == 32)
            .ok_or_else(|| LedgerError::BadRequest("preimage must be 32 bytes of hex".into()))?;

        let mut draft = Transaction::new_pending(TransactionType::Outgoing, sha256_hex(&preimage_bytes));
        draft.app_id = request.app_id;
        draft.request_event_id = request.request_event_id;
        draft.amount_msat = request.amount_msat;
        draft.metadata = request.metadata;
        draft.boostagram = boostagram(&request.tlv_records);

        let (pending, _) = self.reserve_outgoing(draft, false).await?;
        let route = Route::Keysend {
            destination: request.destination,
            tlv_records: request.tlv_records,
            preimage,
        };
        self.execute(pending, route).await
    }

    /// Check affordability and insert the pending row atomically.
    ///
    /// Returns the inserted row and, for a payment to one of our own pending
    /// invoices, the incoming row it will settle.
    async fn reserve_outgoing(
        &self,
        mut draft: Transaction,
        to_self: bool,
    ) -> LedgerResult<(Transaction, Option<Transaction>)> {
        if draft.amount_msat > MAX_AMOUNT_MSAT {
            return Err(LedgerError::BadRequest("amount is too large".into()));
        }
        let _guard = self.balance_lock.lock().await;
        let txn = self.db.begin_write()?;

        let existing = {
            let table = txn.open_table(TRANSACTIONS)?;
            let index = txn.open_table(TX_HASH_INDEX)?;
            tx_rows::by_hash(&table, &index, &draft.payment_hash)?
        };
        if existing.iter().any(|tx| {
            tx.tx_type == TransactionType::Outgoing
                && matches!(tx.state, TransactionState::Settled | TransactionState::Pending)
        }) {
            return Err(LedgerError::BadRequest(
                "invoice is already paid or being paid".into(),
            ));
        }

        let self_row = existing.into_iter().find(|tx| {
            to_self && tx.tx_type == TransactionType::Incoming && tx.state == TransactionState::Pending
        });
        if self_row.is_some() {
            draft.self_payment = true;
        } else {
            draft.fee_reserve_msat = fee_reserve_msat(draft.amount_msat);
        }

        let required_msat = draft
            .amount_msat
            .checked_add(draft.fee_reserve_msat)
            .ok_or_else(|| LedgerError::BadRequest("amount is too large".into()))?;
        if let Err(e) = check_can_pay(&txn, draft.app_id, required_msat, Utc::now()) {
            drop(txn);
            if let Some(app_id) = draft.app_id {
                self.emit_permission_denied(app_id, &e);
            }
            return Err(e.into());
        }

        tx_rows::insert(&txn, &mut draft)?;
        txn.commit()?;
        tracing::info!(
            tx_id = draft.id,
            app_id = ?draft.app_id,
            amount_msat = draft.amount_msat,
            fee_reserve_msat = draft.fee_reserve_msat,
            self_payment = draft.self_payment,
            "Outgoing payment reserved"
        );
        Ok((draft, self_row))
    }

    fn emit_permission_denied(&self, app_id: u64, error: &PermissionError) {
        let code = match error {
            PermissionError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            PermissionError::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            PermissionError::Db(_) => return,
        };
        self.publisher.publish(Event::new(
            names::PERMISSION_DENIED,
            EventPayload::PermissionDenied {
                app_id,
                code: code.to_string(),
                message: error.to_string(),
            },
        ));
    }

    /// Run the payment on its own task so a dropped caller cannot leave
    /// the row pending.
    async fn execute(self: &Arc<Self>, pending: Transaction, route: Route) -> LedgerResult<Transaction> {
        let this = Arc::clone(self);
        let id = pending.id;
        tokio::spawn(async move {
            let outcome = this.run_route(&pending, route).await;
            this.finish_outgoing(&pending, outcome)
        })
        .await
        .map_err(|e| {
            tracing::error!(tx_id = id, error = %e, "Payment task aborted");
            LedgerError::PaymentFailed(e.to_string())
        })?
    }

    async fn run_route(&self, pending: &Transaction, route: Route) -> PaymentOutcome {
        match route {
            Route::Backend { bolt11, amount_msat } => self
                .client
                .send_payment_sync(&bolt11, amount_msat)
                .await
                .map(|r| (r.preimage, r.fee_msat))
                .map_err(|e| e.to_string()),
            Route::Keysend {
                destination,
                tlv_records,
                preimage,
            } => self
                .client
                .send_keysend(pending.amount_msat, &destination, &tlv_records, &preimage)
                .await
                .map(|r| (r.preimage, r.fee_msat))
                .map_err(|e| e.to_string()),
            Route::SelfPayment(incoming) => self.pay_self(incoming).await,
        }
    }

    async fn pay_self(&self, incoming: Transaction) -> PaymentOutcome {
        if !incoming.hold {
            let preimage = incoming
                .preimage
                .clone()
                .ok_or_else(|| "own invoice has no preimage".to_string())?;
            let settled = self
                .transition(incoming.id, &[TransactionState::Pending], |tx| {
                    tx.state = TransactionState::Settled;
                    tx.self_payment = true;
                    tx.settled_at = Some(Utc::now());
                })
                .map_err(|e| e.to_string())?
                .ok_or_else(|| "invoice is no longer payable".to_string())?;
            self.emit(names::PAYMENT_RECEIVED, &settled);
            return Ok((preimage, 0));
        }

        let (tx, rx) = oneshot::channel();
        self.self_payment_waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(incoming.payment_hash.clone(), tx);

        let accepted = self.transition(incoming.id, &[TransactionState::Pending], |tx| {
            tx.state = TransactionState::Accepted;
            tx.self_payment = true;
        });
        match accepted {
            Ok(Some(row)) => self.emit(names::HOLD_INVOICE_ACCEPTED, &row),
            Ok(None) => {
                self.take_waiter(&incoming.payment_hash);
                return Err("invoice is no longer payable".into());
            }
            Err(e) => {
                self.take_waiter(&incoming.payment_hash);
                return Err(e.to_string());
            }
        }

        let wait = incoming
            .expires_at
            .and_then(|at| (at - Utc::now()).to_std().ok())
            .unwrap_or(DEFAULT_HOLD_WAIT);
        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(SelfPaymentOutcome::Settled { preimage })) => Ok((preimage, 0)),
            Ok(Ok(SelfPaymentOutcome::Canceled)) | Ok(Err(_)) => Err("hold invoice canceled".into()),
            Err(_) => {
                self.take_waiter(&incoming.payment_hash);
                if let Err(e) = self.mark_incoming_canceled(incoming.id) {
                    tracing::warn!(tx_id = incoming.id, error = %e, "Failed to cancel expired hold invoice");
                }
                Err("hold invoice expired".into())
            }
        }
    }

    fn finish_outgoing(&self, pending: &Transaction, outcome: PaymentOutcome) -> LedgerResult<Transaction> {
        match outcome {
            Ok((preimage, fee_msat)) => {
                let settled = self.transition(pending.id, &[TransactionState::Pending], |tx| {
                    tx.state = TransactionState::Settled;
                    tx.preimage = Some(preimage);
                    tx.fee_msat = fee_msat;
                    tx.settled_at = Some(Utc::now());
                })?;
                match settled {
                    Some(tx) => {
                        tracing::info!(tx_id = tx.id, fee_msat = tx.fee_msat, "Payment sent");
                        self.emit(names::PAYMENT_SENT, &tx);
                        self.check_budget_warning(&tx);
                        Ok(tx)
                    }
                    // settled by the payments stream first
                    None => self.get(pending.id),
                }
            }
            Err(reason) => {
                let failed = self.transition(pending.id, &[TransactionState::Pending], |tx| {
                    tx.state = TransactionState::Failed;
                    tx.failure_reason = Some(reason.clone());
                })?;
                match failed {
                    Some(tx) => {
                        tracing::warn!(tx_id = tx.id, reason = %reason, "Payment failed");
                        self.emit(names::PAYMENT_FAILED, &tx);
                    }
                    None => {
                        let current = self.get(pending.id)?;
                        if current.state == TransactionState::Settled {
                            return Ok(current);
                        }
                    }
                }
                Err(LedgerError::PaymentFailed(reason))
            }
        }
    }

    /// Emit a budget warning when this settlement pushed usage across the
    /// warning threshold.
    pub(super) fn check_budget_warning(&self, settled: &Transaction) {
        let Some(app_id) = settled.app_id else {
            return;
        };
        let result: LedgerResult<()> = (|| {
            let read = self.db.begin_read()?;
            let permissions = read.open_table(APP_PERMISSIONS)?;
            let Some(permission) = app_rows::get_permission(&permissions, app_id, Scope::PayInvoice)?
                .filter(|p| p.max_amount_sat > 0)
            else {
                return Ok(());
            };
            let table = read.open_table(TRANSACTIONS)?;
            let index = read.open_table(TX_APP_INDEX)?;
            let rows = tx_rows::by_app(&table, &index, app_id)?;
            let after = budget_usage_msat(&rows, window_start(permission.budget_renewal, Utc::now()));
            let before = after.saturating_sub(settled.counted_outgoing_msat());
            if crosses_warning(permission.max_amount_sat, before, after) {
                tracing::info!(app_id, used_msat = after, "Budget warning threshold crossed");
                self.publisher.publish(Event::new(
                    names::BUDGET_WARNING,
                    EventPayload::BudgetWarning {
                        app_id,
                        used_msat: after,
                        total_msat: limit_msat(permission.max_amount_sat),
                    },
                ));
            }
            Ok(())
        })();
        if let Err(e) = result {
            tracing::warn!(app_id, error = %e, "Budget warning check failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::testing::RecordingSubscriber;
    use crate::ledger::testing::*;
    use crate::ledger::InvoiceRequest;
    use crate::permissions::BudgetRenewal;
    use crate::storage::apps::{App, AppPermission};
    use crate::storage::Db;

    fn create_app(db: &Db, isolated: bool, max_amount_sat: u64) -> u64 {
        let txn = db.begin_write().unwrap();
        let id = app_rows::allocate_app_id(&txn).unwrap();
        let now = Utc::now();
        let app = App {
            id,
            name: format!("app {id}"),
            app_pubkey: hex::encode([id as u8; 32]),
            wallet_pubkey: None,
            isolated,
            metadata: None,
            created_at: now,
            updated_at: now,
            last_used_at: None,
        };
        app_rows::insert_app(&txn, &app).unwrap();
        let mut permission = AppPermission::new(id, Scope::PayInvoice);
        permission.max_amount_sat = max_amount_sat;
        permission.budget_renewal = BudgetRenewal::Daily;
        app_rows::put_permission(&txn, &permission).unwrap();
        txn.commit().unwrap();
        id
    }

    fn credit(db: &Db, app_id: u64, amount_msat: u64) {
        let txn = db.begin_write().unwrap();
        let mut tx = Transaction::new_pending(TransactionType::Incoming, hex::encode(rand::random::<[u8; 32]>()));
        tx.app_id = Some(app_id);
        tx.state = TransactionState::Settled;
        tx.amount_msat = amount_msat;
        tx_rows::insert(&txn, &mut tx).unwrap();
        txn.commit().unwrap();
    }

    fn app_rows_of(db: &Db, app_id: u64) -> Vec<Transaction> {
        let read = db.begin_read().unwrap();
        let table = read.open_table(TRANSACTIONS).unwrap();
        let index = read.open_table(TX_APP_INDEX).unwrap();
        tx_rows::by_app(&table, &index, app_id).unwrap()
    }

    #[tokio::test]
    async fn settled_payment_zeroes_reserve_and_records_fee() {
        let h = harness().await;
        h.ln.set_payment_fee_msat(12);
        let bolt11 = h.ln.external_invoice(50_000, "coffee").unwrap();
        let tx = h
            .ledger
            .send_payment_sync(PayInvoiceRequest {
                bolt11,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(tx.state, TransactionState::Settled);
        assert_eq!(tx.fee_msat, 12);
        assert_eq!(tx.fee_reserve_msat, 0);
        assert_eq!(tx.description, "coffee");
        assert!(tx.preimage.is_some());
    }

    #[tokio::test]
    async fn failed_payment_is_terminal_and_reported() {
        let h = harness().await;
        let recorder = Arc::new(RecordingSubscriber::default());
        h.bus.register(recorder.clone());
        h.ln.set_payment_failure(Some("no route"));
        let bolt11 = h.ln.external_invoice(50_000, "x").unwrap();
        let hash = DecodedInvoice::decode(&bolt11).unwrap().payment_hash;
        let err = h
            .ledger
            .send_payment_sync(PayInvoiceRequest {
                bolt11,
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::PaymentFailed(_)));
        let rows = h.ledger.rows_by_hash(&hash).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].state, TransactionState::Failed);
        assert_eq!(rows[0].fee_reserve_msat, 0);
        assert!(wait_for(&recorder, names::PAYMENT_FAILED)
            .await
            .contains(&names::PAYMENT_FAILED.to_string()));
    }

    #[tokio::test]
    async fn paying_the_same_invoice_twice_is_rejected() {
        let h = harness().await;
        let bolt11 = h.ln.external_invoice(1_000, "once").unwrap();
        let request = PayInvoiceRequest {
            bolt11,
            ..Default::default()
        };
        h.ledger.send_payment_sync(request.clone()).await.unwrap();
        assert!(matches!(
            h.ledger.send_payment_sync(request).await,
            Err(LedgerError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn budget_exhaustion_rejects_second_payment_without_a_row() {
        let h = harness().await;
        let recorder = Arc::new(RecordingSubscriber::default());
        h.bus.register(recorder.clone());
        let app_id = create_app(&h.db, false, 1_000);

        let first = h.ln.external_invoice(600_000, "first").unwrap();
        let tx = h
            .ledger
            .send_payment_sync(PayInvoiceRequest {
                bolt11: first,
                app_id: Some(app_id),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(tx.state, TransactionState::Settled);

        let second = h.ln.external_invoice(500_000, "second").unwrap();
        let err = h
            .ledger
            .send_payment_sync(PayInvoiceRequest {
                bolt11: second,
                app_id: Some(app_id),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::QuotaExceeded { max_sat: 1_000, .. }));

        let outgoing: Vec<_> = app_rows_of(&h.db, app_id)
            .into_iter()
            .filter(|tx| tx.tx_type == TransactionType::Outgoing)
            .collect();
        assert_eq!(outgoing.len(), 1);
        assert!(wait_for(&recorder, names::PERMISSION_DENIED)
            .await
            .contains(&names::PERMISSION_DENIED.to_string()));
    }

    #[tokio::test]
    async fn isolated_concurrent_payments_only_one_fits() {
        let h = harness().await;
        h.ln.set_payment_delay(Duration::from_millis(50));
        let app_id = create_app(&h.db, true, 0);
        credit(&h.db, app_id, 10_000_000);

        let a = h.ln.external_invoice(8_000_000, "a").unwrap();
        let b = h.ln.external_invoice(8_000_000, "b").unwrap();
        let pay = |bolt11: String| {
            let ledger = h.ledger.clone();
            async move {
                ledger
                    .send_payment_sync(PayInvoiceRequest {
                        bolt11,
                        app_id: Some(app_id),
                        ..Default::default()
                    })
                    .await
            }
        };
        let (ra, rb) = tokio::join!(pay(a), pay(b));
        let results = [ra, rb];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(LedgerError::InsufficientBalance { .. }))));
    }

    #[tokio::test]
    async fn budget_warning_fires_once_on_crossing() {
        let h = harness().await;
        let recorder = Arc::new(RecordingSubscriber::default());
        h.bus.register(recorder.clone());
        let app_id = create_app(&h.db, false, 100);

        for amount in [50_000, 30_000] {
            let bolt11 = h.ln.external_invoice(amount, "w").unwrap();
            h.ledger
                .send_payment_sync(PayInvoiceRequest {
                    bolt11,
                    app_id: Some(app_id),
                    ..Default::default()
                })
                .await
                .unwrap();
        }
        let seen = wait_for(&recorder, names::BUDGET_WARNING).await;
        assert_eq!(seen.iter().filter(|n| *n == names::BUDGET_WARNING).count(), 1);
    }

    #[tokio::test]
    async fn self_payment_settles_both_rows_without_the_backend() {
        let h = harness().await;
        let incoming = h
            .ledger
            .make_invoice(InvoiceRequest {
                amount_msat: 7_000,
                ..Default::default()
            })
            .await
            .unwrap();
        h.ln.set_payment_failure(Some("backend must not be used"));

        let outgoing = h
            .ledger
            .send_payment_sync(PayInvoiceRequest {
                bolt11: incoming.payment_request.clone(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(outgoing.self_payment);
        assert_eq!(outgoing.fee_msat, 0);
        assert_eq!(outgoing.preimage, incoming.preimage);
        assert_eq!(h.ledger.get(incoming.id).unwrap().state, TransactionState::Settled);
    }

    #[tokio::test]
    async fn self_paid_hold_invoice_waits_for_settle() {
        let h = harness().await;
        let preimage = [5u8; 32];
        let hash = sha256_hex(&preimage);
        let hold = h
            .ledger
            .make_hold_invoice(
                InvoiceRequest {
                    amount_msat: 3_000,
                    expiry_secs: Some(60),
                    ..Default::default()
                },
                &hash,
            )
            .await
            .unwrap();

        let ledger = h.ledger.clone();
        let bolt11 = hold.payment_request.clone();
        let payer = tokio::spawn(async move {
            ledger
                .send_payment_sync(PayInvoiceRequest {
                    bolt11,
                    ..Default::default()
                })
                .await
        });

        for _ in 0..100 {
            if h.ledger.get(hold.id).unwrap().state == TransactionState::Accepted {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        h.ledger.settle_hold_invoice(&hex::encode(preimage), None).await.unwrap();

        let outgoing = payer.await.unwrap().unwrap();
        assert_eq!(outgoing.state, TransactionState::Settled);
        assert_eq!(outgoing.preimage.as_deref(), Some(hex::encode(preimage).as_str()));
    }

    #[tokio::test]
    async fn oversized_keysend_is_rejected_without_a_row() {
        let h = harness().await;
        let app_id = create_app(&h.db, true, 0);
        credit(&h.db, app_id, 10_000);
        let destination = bitcoin::secp256k1::SecretKey::from_slice(&[3u8; 32])
            .unwrap()
            .public_key(&bitcoin::secp256k1::Secp256k1::new())
            .to_string();
        let keysend = |amount_msat| KeysendRequest {
            amount_msat,
            destination: destination.clone(),
            app_id: Some(app_id),
            ..Default::default()
        };

        for amount_msat in [u64::MAX - 10, u64::MAX / 101 * 100, MAX_AMOUNT_MSAT + 1] {
            let ledger = h.ledger.clone();
            let request = keysend(amount_msat);
            let result = tokio::spawn(async move { ledger.send_keysend(request).await })
                .await
                .unwrap();
            assert!(matches!(result, Err(LedgerError::BadRequest(_))), "{amount_msat}");
        }
        assert!(matches!(
            h.ledger.send_keysend(keysend(MAX_AMOUNT_MSAT)).await,
            Err(LedgerError::InsufficientBalance { .. })
        ));
        assert!(app_rows_of(&h.db, app_id)
            .iter()
            .all(|tx| tx.tx_type == TransactionType::Incoming));
    }

    #[tokio::test]
    async fn keysend_records_boostagram() {
        let h = harness().await;
        let destination = bitcoin::secp256k1::SecretKey::from_slice(&[3u8; 32])
            .unwrap()
            .public_key(&bitcoin::secp256k1::Secp256k1::new())
            .to_string();
        let boost = serde_json::json!({ "message": "great show", "value_msat_total": 2000 });
        let tx = h
            .ledger
            .send_keysend(KeysendRequest {
                amount_msat: 2_000,
                destination,
                tlv_records: vec![TlvRecord {
                    tlv_type: BOOSTAGRAM_TLV_TYPE,
                    value: hex::encode(boost.to_string()),
                }],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(tx.state, TransactionState::Settled);
        assert_eq!(tx.boostagram, Some(boost));
        let preimage = hex::decode(tx.preimage.unwrap()).unwrap();
        assert_eq!(sha256_hex(&preimage), tx.payment_hash);
    }
}
