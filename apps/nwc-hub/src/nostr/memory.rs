// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! In-process relay used by tests and the development backend.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use nostr_sdk::prelude::*;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::transport::{
    EventStream, PublishReport, RelayTransport, SubscriptionFilter, TransportError, TransportResult,
};

struct Subscriber {
    filter: SubscriptionFilter,
    tx: mpsc::UnboundedSender<Event>,
}

#[derive(Default)]
struct RelayState {
    online: HashMap<String, bool>,
    subscribers: Vec<Subscriber>,
    published: Vec<(String, Event)>,
    subscribe_calls: usize,
}

/// Relay that keeps published events in memory and routes injected
/// events to matching subscriptions.
pub struct MemoryRelay {
    urls: Vec<String>,
    state: Mutex<RelayState>,
}

impl MemoryRelay {
    pub fn new(urls: &[&str]) -> Self {
        let urls: Vec<String> = urls.iter().map(|u| u.to_string()).collect();
        let state = RelayState {
            online: urls.iter().map(|u| (u.clone(), true)).collect(),
            ..Default::default()
        };
        Self {
            urls,
            state: Mutex::new(state),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Deliver an event as if it arrived from a relay.
    pub fn inject(&self, event: Event) {
        let mut state = self.state();
        state.subscribers.retain(|s| !s.tx.is_closed());
        for subscriber in &state.subscribers {
            if subscriber.filter.matches(&event) {
                let _ = subscriber.tx.send(event.clone());
            }
        }
    }

    /// Close every open subscription stream.
    pub fn drop_subscriptions(&self) {
        self.state().subscribers.clear();
    }

    pub fn set_online(&self, url: &str, online: bool) {
        self.state().online.insert(url.to_string(), online);
    }

    /// Every accepted event with the relay that took it.
    pub fn published(&self) -> Vec<(String, Event)> {
        self.state().published.clone()
    }

    pub fn published_of_kind(&self, kind: Kind) -> Vec<Event> {
        let mut seen = std::collections::HashSet::new();
        self.state()
            .published
            .iter()
            .filter(|(_, e)| e.kind == kind && seen.insert(e.id))
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub fn open_subscriptions(&self) -> usize {
        let mut state = self.state();
        state.subscribers.retain(|s| !s.tx.is_closed());
        state.subscribers.len()
    }

    pub fn subscribe_calls(&self) -> usize {
        self.state().subscribe_calls
    }

    fn accept(&self, relays: &[String], event: &Event) -> TransportResult<PublishReport> {
        event
            .verify()
            .map_err(|e| TransportError::Rejected(format!("invalid event: {e}")))?;
        let mut state = self.state();
        let mut report = PublishReport::default();
        for url in relays {
            if state.online.get(url).copied().unwrap_or(false) {
                state.published.push((url.clone(), event.clone()));
                report.success.push(url.clone());
            } else {
                report.failed.push((url.clone(), "offline".into()));
            }
        }
        if report.success.is_empty() {
            return Err(TransportError::Rejected("all relays offline".into()));
        }
        Ok(report)
    }
}

#[async_trait]
impl RelayTransport for MemoryRelay {
    async fn subscribe(&self, filter: SubscriptionFilter) -> TransportResult<EventStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state();
        state.subscribe_calls += 1;
        state.subscribers.push(Subscriber { filter, tx });
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn publish(&self, event: &Event) -> TransportResult<PublishReport> {
        self.accept(&self.urls, event)
    }

    async fn publish_to(&self, relay: &str, event: &Event) -> TransportResult<PublishReport> {
        self.accept(&[relay.to_string()], event)
    }

    fn relay_urls(&self) -> Vec<String> {
        self.urls.clone()
    }

    async fn relay_statuses(&self) -> Vec<(String, bool)> {
        let state = self.state();
        self.urls
            .iter()
            .map(|u| (u.clone(), state.online.get(u).copied().unwrap_or(false)))
            .collect()
    }

    async fn shutdown(&self) {
        self.drop_subscriptions();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn injected_events_reach_matching_subscribers() {
        let relay = MemoryRelay::new(&["wss://a", "wss://b"]);
        let wallet = Keys::generate();
        let mut stream = relay
            .subscribe(SubscriptionFilter::requests_to(Kind::Custom(23194), wallet.public_key()))
            .await
            .unwrap();

        let event = EventBuilder::new(Kind::Custom(23194), "hi")
            .tags([Tag::public_key(wallet.public_key())])
            .sign_with_keys(&Keys::generate())
            .unwrap();
        relay.inject(event.clone());
        assert_eq!(stream.next().await.unwrap().id, event.id);

        relay.drop_subscriptions();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn offline_relays_reject_publishes() {
        let relay = MemoryRelay::new(&["wss://a", "wss://b"]);
        relay.set_online("wss://b", false);
        let event = EventBuilder::new(Kind::TextNote, "x")
            .sign_with_keys(&Keys::generate())
            .unwrap();
        let report = relay.publish(&event).await.unwrap();
        assert_eq!(report.success, vec!["wss://a".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert!(relay.publish_to("wss://b", &event).await.is_err());
        assert_eq!(
            relay.relay_statuses().await,
            vec![("wss://a".to_string(), true), ("wss://b".to_string(), false)]
        );
    }
}
