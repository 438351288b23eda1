// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Relay transport seam.
//!
//! The session and publishers talk to relays through [`RelayTransport`];
//! production uses the nostr-sdk relay pool, tests use
//! [`super::memory::MemoryRelay`].

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use nostr_sdk::prelude::*;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);
const SUBSCRIPTION_BUFFER: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("nostr client error: {0}")]
    Client(#[from] nostr_sdk::client::Error),

    #[error("nostr tag error: {0}")]
    Tag(#[from] nostr_sdk::nostr::event::tag::Error),

    #[error("event builder error: {0}")]
    Builder(#[from] nostr_sdk::nostr::event::builder::Error),

    #[error("no relay accepted the event: {0}")]
    Rejected(String),

    #[error("publish timed out")]
    Timeout,
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Events matching one subscription; ends when the subscription closes.
pub type EventStream = BoxStream<'static, Event>;

/// Which events a subscription wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionFilter {
    pub kinds: Vec<Kind>,
    /// `#p` tag values.
    pub pubkeys: Vec<PublicKey>,
}

impl SubscriptionFilter {
    pub fn requests_to(kind: Kind, pubkey: PublicKey) -> Self {
        Self {
            kinds: vec![kind],
            pubkeys: vec![pubkey],
        }
    }

    pub fn to_filter(&self) -> Filter {
        Filter::new()
            .kinds(self.kinds.iter().copied())
            .pubkeys(self.pubkeys.iter().copied())
    }

    pub fn matches(&self, event: &Event) -> bool {
        self.kinds.contains(&event.kind)
            && event.tags.public_keys().any(|pk| self.pubkeys.contains(pk))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub success: Vec<String>,
    pub failed: Vec<(String, String)>,
}

#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn subscribe(&self, filter: SubscriptionFilter) -> TransportResult<EventStream>;

    /// Publish a signed event to every relay.
    async fn publish(&self, event: &Event) -> TransportResult<PublishReport>;

    /// Publish a signed event to one relay.
    async fn publish_to(&self, relay: &str, event: &Event) -> TransportResult<PublishReport>;

    fn relay_urls(&self) -> Vec<String>;

    /// `(url, online)` for every relay.
    async fn relay_statuses(&self) -> Vec<(String, bool)>;

    async fn shutdown(&self);
}

fn report<T: std::fmt::Debug>(output: Output<T>) -> TransportResult<PublishReport> {
    let report = PublishReport {
        success: output.success.iter().map(|url| url.to_string()).collect(),
        failed: output
            .failed
            .iter()
            .map(|(url, e)| (url.to_string(), e.to_string()))
            .collect(),
    };
    if report.success.is_empty() {
        let reasons: Vec<String> = report.failed.iter().map(|(u, e)| format!("{u}: {e}")).collect();
        return Err(TransportError::Rejected(reasons.join("; ")));
    }
    Ok(report)
}

/// Relay pool backed by `nostr_sdk::Client`. Events are signed by the
/// caller, so the client carries no signer.
pub struct NostrSdkTransport {
    client: Client,
    relays: Vec<String>,
}

impl NostrSdkTransport {
    pub async fn connect(relays: &[String]) -> TransportResult<Self> {
        let client = Client::default();
        for relay in relays {
            client.add_relay(relay).await?;
        }
        client.connect().await;
        tracing::info!(relays = relays.len(), "Relay pool connected");
        Ok(Self {
            client,
            relays: relays.to_vec(),
        })
    }
}

#[async_trait]
impl RelayTransport for NostrSdkTransport {
    async fn subscribe(&self, filter: SubscriptionFilter) -> TransportResult<EventStream> {
        let mut notifications = self.client.notifications();
        let output = self.client.subscribe(filter.to_filter(), None).await?;
        let subscription = output.val;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let client = self.client.clone();
        tokio::spawn(async move {
            loop {
                match notifications.recv().await {
                    Ok(RelayPoolNotification::Event {
                        subscription_id,
                        event,
                        ..
                    }) if subscription_id == subscription => {
                        if tx.send(*event).await.is_err() {
                            break;
                        }
                    }
                    Ok(RelayPoolNotification::Shutdown) => break,
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Relay notifications lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            client.unsubscribe(&subscription).await;
        });

        // relays deliver the same event once per relay
        let mut seen = std::collections::HashSet::new();
        Ok(Box::pin(
            ReceiverStream::new(rx).filter(move |event| seen.insert(event.id)),
        ))
    }

    async fn publish(&self, event: &Event) -> TransportResult<PublishReport> {
        let output = tokio::time::timeout(PUBLISH_TIMEOUT, self.client.send_event(event))
            .await
            .map_err(|_| TransportError::Timeout)??;
        report(output)
    }

    async fn publish_to(&self, relay: &str, event: &Event) -> TransportResult<PublishReport> {
        let output = tokio::time::timeout(PUBLISH_TIMEOUT, self.client.send_event_to([relay], event))
            .await
            .map_err(|_| TransportError::Timeout)??;
        report(output)
    }

    fn relay_urls(&self) -> Vec<String> {
        self.relays.clone()
    }

    async fn relay_statuses(&self) -> Vec<(String, bool)> {
        self.client
            .relays()
            .await
            .iter()
            .map(|(url, relay)| (url.to_string(), relay.status() == RelayStatus::Connected))
            .collect()
    }

    async fn shutdown(&self) {
        self.client.shutdown().await;
    }
}
