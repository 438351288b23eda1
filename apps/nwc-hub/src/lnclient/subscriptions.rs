// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Workers pumping the backend's long-lived streams onto the event bus.
//!
//! Each stream gets its own task. A failed subscribe, an error item or a
//! closed stream triggers a resubscribe after a backoff that doubles from
//! 1 s up to 60 s and resets after the first delivered item.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::onchain_cache::OnchainTxCache;
use super::{LnClient, LnEvent, LnEventStream, LnResult};
use crate::events::types::{self as names, Event, EventPayload};
use crate::events::EventPublisher;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Payments,
    Invoices,
    ChannelEvents,
    Transactions,
}

impl StreamKind {
    pub const ALL: [StreamKind; 4] = [
        StreamKind::Payments,
        StreamKind::Invoices,
        StreamKind::ChannelEvents,
        StreamKind::Transactions,
    ];

    fn as_str(self) -> &'static str {
        match self {
            StreamKind::Payments => "payments",
            StreamKind::Invoices => "invoices",
            StreamKind::ChannelEvents => "channel_events",
            StreamKind::Transactions => "transactions",
        }
    }

    async fn subscribe(self, client: &dyn LnClient) -> LnResult<LnEventStream> {
        match self {
            StreamKind::Payments => client.subscribe_payments().await,
            StreamKind::Invoices => client.subscribe_invoices().await,
            StreamKind::ChannelEvents => client.subscribe_channel_events().await,
            StreamKind::Transactions => client.subscribe_transactions().await,
        }
    }
}

pub fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

/// Bus event for a backend stream item.
pub fn to_bus_event(event: LnEvent) -> Event {
    match event {
        LnEvent::PaymentReceived(tx) => Event::new(
            names::LNCLIENT_PAYMENT_RECEIVED,
            EventPayload::LnTransaction(Box::new(tx)),
        ),
        LnEvent::PaymentSent(tx) => Event::new(
            names::LNCLIENT_PAYMENT_SENT,
            EventPayload::LnTransaction(Box::new(tx)),
        ),
        LnEvent::PaymentFailed {
            payment_hash,
            reason,
        } => Event::new(
            names::LNCLIENT_PAYMENT_FAILED,
            EventPayload::PaymentFailed {
                payment_hash,
                reason,
            },
        ),
        LnEvent::HoldInvoiceAccepted {
            transaction,
            settle_deadline,
        } => Event::new(
            names::LNCLIENT_HOLD_INVOICE_ACCEPTED,
            EventPayload::HoldInvoiceAccepted {
                transaction: Box::new(transaction),
                settle_deadline: Some(settle_deadline),
            },
        ),
        LnEvent::InvoiceCanceled { payment_hash } => Event::new(
            names::LNCLIENT_INVOICE_CANCELED,
            EventPayload::InvoiceCanceled { payment_hash },
        ),
        LnEvent::ChannelOpened(channel) => Event::new(
            names::LNCLIENT_CHANNEL_OPENED,
            EventPayload::Json(serde_json::to_value(channel).unwrap_or_default()),
        ),
        LnEvent::ChannelClosed {
            channel_id,
            remote_pubkey,
        } => Event::new(
            names::LNCLIENT_CHANNEL_CLOSED,
            EventPayload::Json(serde_json::json!({
                "channel_id": channel_id,
                "remote_pubkey": remote_pubkey,
            })),
        ),
        LnEvent::OnchainTransaction(tx) => Event::new(
            names::LNCLIENT_ONCHAIN_TRANSACTION,
            EventPayload::Json(serde_json::to_value(tx).unwrap_or_default()),
        ),
    }
}

/// Start one worker per backend stream.
pub fn spawn_all(
    client: Arc<dyn LnClient>,
    publisher: Arc<EventPublisher>,
    onchain_cache: Arc<OnchainTxCache>,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    StreamKind::ALL
        .into_iter()
        .map(|kind| {
            tokio::spawn(run(
                kind,
                client.clone(),
                publisher.clone(),
                onchain_cache.clone(),
                shutdown.clone(),
            ))
        })
        .collect()
}

async fn run(
    kind: StreamKind,
    client: Arc<dyn LnClient>,
    publisher: Arc<EventPublisher>,
    onchain_cache: Arc<OnchainTxCache>,
    shutdown: CancellationToken,
) {
    tracing::info!(stream = kind.as_str(), "Backend subscription starting");
    let mut backoff = INITIAL_BACKOFF;

    loop {
        let subscribed = tokio::select! {
            result = kind.subscribe(client.as_ref()) => result,
            _ = shutdown.cancelled() => break,
        };

        match subscribed {
            Ok(mut stream) => loop {
                let item = tokio::select! {
                    item = stream.next() => item,
                    _ = shutdown.cancelled() => {
                        tracing::info!(stream = kind.as_str(), "Backend subscription stopped");
                        return;
                    }
                };
                match item {
                    Some(Ok(event)) => {
                        backoff = INITIAL_BACKOFF;
                        if matches!(event, LnEvent::OnchainTransaction(_)) {
                            onchain_cache.invalidate().await;
                        }
                        publisher.publish_sync(to_bus_event(event)).await;
                    }
                    Some(Err(e)) => {
                        tracing::warn!(stream = kind.as_str(), error = %e, "Backend stream error, resubscribing");
                        break;
                    }
                    None => {
                        tracing::warn!(stream = kind.as_str(), "Backend stream closed, resubscribing");
                        break;
                    }
                }
            },
            Err(e) => {
                tracing::warn!(stream = kind.as_str(), error = %e, "Backend subscribe failed");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.cancelled() => break,
        }
        backoff = next_backoff(backoff);
    }
    tracing::info!(stream = kind.as_str(), "Backend subscription stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::testing::RecordingSubscriber;
    use crate::lnclient::memory::MemoryLnClient;
    use crate::lnclient::{MakeInvoiceParams, OnchainTransaction};
    use bitcoin::secp256k1::SecretKey;

    #[test]
    fn backoff_doubles_up_to_a_minute() {
        let mut b = INITIAL_BACKOFF;
        let mut seen = Vec::new();
        for _ in 0..8 {
            seen.push(b.as_secs());
            b = next_backoff(b);
        }
        assert_eq!(seen, [1, 2, 4, 8, 16, 32, 60, 60]);
    }

    #[tokio::test]
    async fn stream_items_reach_the_bus_and_invalidate_cache() {
        let ln = Arc::new(MemoryLnClient::new(SecretKey::from_slice(&[2u8; 32]).unwrap()));
        let bus = Arc::new(EventPublisher::new());
        let recorder = Arc::new(RecordingSubscriber::default());
        bus.register(recorder.clone());
        let cache = Arc::new(OnchainTxCache::new(ln.clone()));
        let shutdown = CancellationToken::new();
        let handles = spawn_all(ln.clone(), bus.clone(), cache.clone(), shutdown.clone());
        // let the workers subscribe
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(cache.page(10, 0).await.unwrap().1, 0);
        let tx = ln
            .make_invoice(MakeInvoiceParams {
                amount_msat: 5_000,
                ..Default::default()
            })
            .await
            .unwrap();
        ln.simulate_incoming_payment(&tx.payment_hash).unwrap();
        ln.simulate_onchain_transaction(OnchainTransaction {
            txid: "t".into(),
            amount_sat: 1,
            incoming: true,
            confirmations: 0,
            created_at: 1,
        });

        for _ in 0..100 {
            if recorder.events.lock().await.len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let seen = recorder.names().await;
        assert!(seen.contains(&names::LNCLIENT_PAYMENT_RECEIVED.to_string()));
        assert!(seen.contains(&names::LNCLIENT_ONCHAIN_TRANSACTION.to_string()));
        assert_eq!(cache.page(10, 0).await.unwrap().1, 1);

        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
