// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Applies backend stream events to the ledger.
//!
//! Every handler is idempotent: transitions are compare-and-set on the row
//! state, so a settlement seen twice (stream replay, reconciliation racing
//! the stream) changes the row and emits its event once.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::outgoing::BOOSTAGRAM_TLV_TYPE;
use super::{LedgerResult, TransactionsService};
use crate::events::types::{self as names, Event, EventPayload};
use crate::events::EventSubscriber;
use crate::lnclient::{LnTransaction, TlvRecord};
use crate::storage::apps::{self as app_rows, APPS};
use crate::storage::transactions::{self as tx_rows, Transaction, TransactionState, TransactionType};

/// Bus subscriber feeding `nwc_lnclient_*` events into the ledger.
pub struct LedgerEventConsumer {
    ledger: Weak<TransactionsService>,
}

impl LedgerEventConsumer {
    pub fn new(ledger: &Arc<TransactionsService>) -> Self {
        Self {
            ledger: Arc::downgrade(ledger),
        }
    }
}

#[async_trait]
impl EventSubscriber for LedgerEventConsumer {
    async fn consume_event(&self, event: Arc<Event>) {
        let Some(ledger) = self.ledger.upgrade() else {
            return;
        };
        let result = match (event.name.as_str(), &event.payload) {
            (names::LNCLIENT_PAYMENT_RECEIVED, EventPayload::LnTransaction(tx)) => {
                ledger.apply_payment_received(tx).map(|_| ())
            }
            (names::LNCLIENT_PAYMENT_SENT, EventPayload::LnTransaction(tx)) => {
                ledger.apply_payment_sent(tx).map(|_| ())
            }
            (
                names::LNCLIENT_PAYMENT_FAILED,
                EventPayload::PaymentFailed {
                    payment_hash,
                    reason,
                },
            ) => ledger.apply_payment_failed(payment_hash, reason),
            (
                names::LNCLIENT_HOLD_INVOICE_ACCEPTED,
                EventPayload::HoldInvoiceAccepted {
                    transaction,
                    settle_deadline,
                },
            ) => ledger.apply_hold_accepted(&transaction.payment_hash, *settle_deadline),
            (names::LNCLIENT_INVOICE_CANCELED, EventPayload::InvoiceCanceled { payment_hash }) => {
                ledger.apply_invoice_canceled(payment_hash)
            }
            _ => Ok(()),
        };
        if let Err(e) = result {
            tracing::error!(event = %event.name, error = %e, "Failed to apply backend event");
        }
    }
}

fn timestamp(secs: Option<i64>) -> Option<DateTime<Utc>> {
    secs.and_then(|s| DateTime::from_timestamp(s, 0))
}

fn boostagram(tx: &LnTransaction) -> Option<serde_json::Value> {
    let records: Vec<TlvRecord> =
        serde_json::from_value(tx.metadata.as_ref()?.get("tlv_records")?.clone()).ok()?;
    let record = records.into_iter().find(|r| r.tlv_type == BOOSTAGRAM_TLV_TYPE)?;
    serde_json::from_slice(&hex::decode(record.value).ok()?).ok()
}

impl TransactionsService {
    /// Settle the incoming row for `ln_tx`, synthesizing one for unsolicited
    /// payments. Returns the row when this call settled it.
    pub(crate) fn apply_payment_received(
        &self,
        ln_tx: &LnTransaction,
    ) -> LedgerResult<Option<Transaction>> {
        let rows = self.rows_by_hash(&ln_tx.payment_hash)?;
        let incoming: Vec<&Transaction> = rows
            .iter()
            .filter(|tx| tx.tx_type == TransactionType::Incoming)
            .collect();
        if incoming.iter().any(|tx| tx.state == TransactionState::Settled) {
            return Ok(None);
        }

        let settled = match incoming.iter().find(|tx| !tx.state.is_terminal()) {
            Some(row) => self.transition(
                row.id,
                &[TransactionState::Pending, TransactionState::Accepted],
                |tx| {
                    tx.state = TransactionState::Settled;
                    if ln_tx.preimage.is_some() {
                        tx.preimage = ln_tx.preimage.clone();
                    }
                    if ln_tx.amount_msat > 0 {
                        tx.amount_msat = ln_tx.amount_msat;
                    }
                    tx.settled_at = timestamp(ln_tx.settled_at).or_else(|| Some(Utc::now()));
                },
            )?,
            None => Some(self.synthesize_incoming(ln_tx)?),
        };

        if let Some(tx) = &settled {
            tracing::info!(
                tx_id = tx.id,
                app_id = ?tx.app_id,
                amount_msat = tx.amount_msat,
                "Payment received"
            );
            self.emit(names::PAYMENT_RECEIVED, tx);
        }
        Ok(settled)
    }

    /// Insert a settled row for a payment we never issued an invoice for.
    fn synthesize_incoming(&self, ln_tx: &LnTransaction) -> LedgerResult<Transaction> {
        let mut tx = Transaction::new_pending(TransactionType::Incoming, &ln_tx.payment_hash);
        tx.state = TransactionState::Settled;
        tx.amount_msat = ln_tx.amount_msat;
        tx.payment_request = ln_tx.invoice.clone().unwrap_or_default();
        tx.preimage = ln_tx.preimage.clone();
        tx.description = ln_tx.description.clone().unwrap_or_default();
        tx.description_hash = ln_tx.description_hash.clone().unwrap_or_default();
        tx.settled_at = timestamp(ln_tx.settled_at).or_else(|| Some(Utc::now()));
        tx.metadata = ln_tx.metadata.clone();
        tx.boostagram = boostagram(ln_tx);

        let txn = self.db.begin_write()?;
        if let Some(app_id) = ln_tx.app_id_tlv() {
            let apps = txn.open_table(APPS)?;
            if app_rows::get_app(&apps, app_id)?.is_some() {
                tx.app_id = Some(app_id);
            } else {
                tracing::debug!(app_id, "Payment names an unknown app, leaving unattributed");
            }
        }
        tx_rows::insert(&txn, &mut tx)?;
        txn.commit()?;
        Ok(tx)
    }

    pub(crate) fn apply_payment_sent(&self, ln_tx: &LnTransaction) -> LedgerResult<Option<Transaction>> {
        let Some(row) = self
            .rows_by_hash(&ln_tx.payment_hash)?
            .into_iter()
            .find(|tx| tx.tx_type == TransactionType::Outgoing && tx.state == TransactionState::Pending)
        else {
            return Ok(None);
        };
        let settled = self.transition(row.id, &[TransactionState::Pending], |tx| {
            tx.state = TransactionState::Settled;
            if let Some(preimage) = &ln_tx.preimage {
                tx.preimage = Some(preimage.clone());
            }
            tx.fee_msat = ln_tx.fees_paid_msat;
            tx.settled_at = timestamp(ln_tx.settled_at).or_else(|| Some(Utc::now()));
        })?;
        if let Some(tx) = &settled {
            self.emit(names::PAYMENT_SENT, tx);
            self.check_budget_warning(tx);
        }
        Ok(settled)
    }

    fn apply_payment_failed(&self, payment_hash: &str, reason: &str) -> LedgerResult<()> {
        let rows = self.rows_by_hash(payment_hash)?;
        for row in rows
            .iter()
            .filter(|tx| tx.tx_type == TransactionType::Outgoing && tx.state == TransactionState::Pending)
        {
            if let Some(tx) = self.transition(row.id, &[TransactionState::Pending], |tx| {
                tx.state = TransactionState::Failed;
                tx.failure_reason = Some(reason.to_string());
            })? {
                self.emit(names::PAYMENT_FAILED, &tx);
            }
        }
        Ok(())
    }

    fn apply_hold_accepted(&self, payment_hash: &str, settle_deadline: Option<u32>) -> LedgerResult<()> {
        let Some(row) = self
            .rows_by_hash(payment_hash)?
            .into_iter()
            .find(|tx| tx.tx_type == TransactionType::Incoming && tx.hold)
        else {
            tracing::debug!(payment_hash, "HTLC accepted for unknown hold invoice");
            return Ok(());
        };
        if let Some(tx) = self.transition(row.id, &[TransactionState::Pending], |tx| {
            tx.state = TransactionState::Accepted;
            tx.settle_deadline = settle_deadline;
        })? {
            tracing::info!(tx_id = tx.id, settle_deadline = ?settle_deadline, "Hold invoice accepted");
            self.emit(names::HOLD_INVOICE_ACCEPTED, &tx);
        }
        Ok(())
    }

    fn apply_invoice_canceled(&self, payment_hash: &str) -> LedgerResult<()> {
        let open: Vec<u64> = self
            .rows_by_hash(payment_hash)?
            .into_iter()
            .filter(|tx| tx.tx_type == TransactionType::Incoming && !tx.state.is_terminal())
            .map(|tx| tx.id)
            .collect();
        for id in open {
            self.mark_incoming_canceled(id)?;
        }
        Ok(())
    }
}
