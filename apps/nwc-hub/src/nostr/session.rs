// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Long-lived relay subscriptions.
//!
//! One subscription per app wallet key, `{kinds:[23194], #p:[wallet]}`,
//! plus one on the node key for legacy apps. A subscription whose stream
//! ends is re-opened after a short delay until the session stops. App
//! creation and deletion add and cancel subscriptions at runtime.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use nostr_sdk::prelude::*;
use tokio_util::sync::CancellationToken;

use super::info::InfoPublisher;
use super::kinds;
use super::transport::{RelayTransport, SubscriptionFilter};
use crate::apps::AppsService;
use crate::events::types as names;
use crate::events::{EventPayload, EventSubscriber};

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(3);
const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Receives every request event delivered by a subscription.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle_event(&self, event: Event);
}

pub struct RelaySession {
    transport: Arc<dyn RelayTransport>,
    apps: Arc<AppsService>,
    info: Arc<InfoPublisher>,
    handler: Arc<dyn RequestHandler>,
    /// Wallet pubkey (hex) → token cancelling its subscription loop.
    subscriptions: Mutex<HashMap<String, CancellationToken>>,
    statuses: RwLock<HashMap<String, bool>>,
    shutdown: CancellationToken,
    resubscribe_delay: Duration,
}

impl RelaySession {
    pub fn new(
        transport: Arc<dyn RelayTransport>,
        apps: Arc<AppsService>,
        info: Arc<InfoPublisher>,
        handler: Arc<dyn RequestHandler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            apps,
            info,
            handler,
            subscriptions: Mutex::new(HashMap::new()),
            statuses: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            resubscribe_delay: RESUBSCRIBE_DELAY,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_resubscribe_delay(mut self: Arc<Self>, delay: Duration) -> Arc<Self> {
        if let Some(session) = Arc::get_mut(&mut self) {
            session.resubscribe_delay = delay;
        }
        self
    }

    pub fn transport(&self) -> &Arc<dyn RelayTransport> {
        &self.transport
    }

    /// Open subscriptions for the node key and every app, and start the
    /// relay status poller.
    pub async fn start(self: &Arc<Self>) -> Result<(), crate::apps::AppError> {
        self.subscribe(self.apps.keys().node_keys().public_key());
        let apps = self.apps.list()?;
        for app in &apps {
            if let Some(wallet) = app.wallet_pubkey.as_deref() {
                match PublicKey::from_hex(wallet) {
                    Ok(pubkey) => self.subscribe(pubkey),
                    Err(e) => tracing::warn!(app_id = app.id, error = %e, "Invalid wallet pubkey"),
                }
            }
        }
        self.spawn_status_poller();
        tracing::info!(apps = apps.len(), relays = self.transport.relay_urls().len(), "Relay session started");
        Ok(())
    }

    /// Cancel every subscription and close the relay pool.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.lock_subscriptions().clear();
        self.transport.shutdown().await;
        tracing::info!("Relay session stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Start the subscription loop for `wallet` unless one is running.
    pub fn subscribe(self: &Arc<Self>, wallet: PublicKey) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let token = self.shutdown.child_token();
        {
            let mut subscriptions = self.lock_subscriptions();
            if subscriptions.contains_key(&wallet.to_hex()) {
                return;
            }
            subscriptions.insert(wallet.to_hex(), token.clone());
        }
        let session = Arc::clone(self);
        tokio::spawn(async move {
            session.subscription_loop(wallet, token).await;
        });
    }

    pub fn unsubscribe(&self, wallet: &str) {
        if let Some(token) = self.lock_subscriptions().remove(&wallet.to_lowercase()) {
            token.cancel();
            tracing::debug!(wallet = %wallet, "Subscription cancelled");
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.lock_subscriptions().len()
    }

    async fn subscription_loop(&self, wallet: PublicKey, token: CancellationToken) {
        let filter = SubscriptionFilter::requests_to(Kind::Custom(kinds::REQUEST), wallet);
        loop {
            match self.transport.subscribe(filter.clone()).await {
                Ok(mut stream) => {
                    tracing::debug!(wallet = %wallet, "Subscribed to requests");
                    loop {
                        tokio::select! {
                            _ = token.cancelled() => return,
                            next = stream.next() => match next {
                                Some(event) => {
                                    let handler = Arc::clone(&self.handler);
                                    tokio::spawn(async move { handler.handle_event(event).await });
                                }
                                None => break,
                            },
                        }
                    }
                    tracing::warn!(wallet = %wallet, "Subscription closed, resubscribing");
                }
                Err(e) => {
                    tracing::warn!(wallet = %wallet, error = %e, "Failed to subscribe");
                }
            }
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(self.resubscribe_delay) => {}
            }
        }
    }

    fn spawn_status_poller(self: &Arc<Self>) {
        let session = Arc::downgrade(self);
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(STATUS_POLL_INTERVAL);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = interval.tick() => {}
                }
                let Some(session) = session.upgrade() else {
                    return;
                };
                session.refresh_statuses().await;
            }
        });
    }

    pub async fn refresh_statuses(&self) {
        let statuses = self.transport.relay_statuses().await;
        let mut current = self.statuses.write().unwrap_or_else(|e| e.into_inner());
        for (url, online) in statuses {
            if current.insert(url.clone(), online) != Some(online) {
                tracing::info!(relay = %url, online, "Relay status changed");
            }
        }
    }

    /// Last polled `(url, online)` of every relay.
    pub fn relay_statuses(&self) -> Vec<(String, bool)> {
        let current = self.statuses.read().unwrap_or_else(|e| e.into_inner());
        let mut statuses: Vec<(String, bool)> =
            current.iter().map(|(url, online)| (url.clone(), *online)).collect();
        statuses.sort();
        statuses
    }

    fn lock_subscriptions(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn on_app_created(self: &Arc<Self>, app_id: u64, wallet: Option<&str>) {
        let Some(wallet) = wallet else { return };
        match PublicKey::from_hex(wallet) {
            Ok(pubkey) => self.subscribe(pubkey),
            Err(e) => tracing::warn!(app_id, error = %e, "Invalid wallet pubkey"),
        }
        self.republish_info(app_id).await;
    }

    async fn republish_info(&self, app_id: u64) {
        let result = match self.apps.get(app_id) {
            Ok(app) => self.info.publish_for_app(&app).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            tracing::warn!(app_id, error = %e, "Failed to publish app info event");
        }
    }

    async fn on_app_deleted(&self, app_id: u64, wallet: Option<&str>) {
        let Some(wallet) = wallet else { return };
        self.unsubscribe(wallet);
        let keys = match self.apps.keys().app_wallet_key(app_id) {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!(app_id, error = %e, "Cannot derive deleted app key");
                return;
            }
        };
        if let Err(e) = self.info.delete_for(&keys).await {
            tracing::warn!(app_id, error = %e, "Failed to publish info deletion");
        }
    }
}

/// Keeps subscriptions and info events in step with the app registry.
pub struct AppLifecycleListener {
    session: Weak<RelaySession>,
}

impl AppLifecycleListener {
    pub fn new(session: &Arc<RelaySession>) -> Self {
        Self {
            session: Arc::downgrade(session),
        }
    }
}

#[async_trait]
impl EventSubscriber for AppLifecycleListener {
    async fn consume_event(&self, event: Arc<crate::events::Event>) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        if session.is_stopped() {
            return;
        }
        let EventPayload::App {
            app_id,
            wallet_pubkey,
            ..
        } = &event.payload
        else {
            return;
        };
        match event.name.as_str() {
            names::APP_CREATED => session.on_app_created(*app_id, wallet_pubkey.as_deref()).await,
            names::APP_UPDATED => session.republish_info(*app_id).await,
            names::APP_DELETED => session.on_app_deleted(*app_id, wallet_pubkey.as_deref()).await,
            _ => {}
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use tokio::sync::Mutex as AsyncMutex;

    /// Handler that records delivered events.
    #[derive(Default)]
    pub struct RecordingHandler {
        pub events: AsyncMutex<Vec<Event>>,
    }

    #[async_trait]
    impl RequestHandler for RecordingHandler {
        async fn handle_event(&self, event: Event) {
            self.events.lock().await.push(event);
        }
    }

    pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::apps::testing::apps_harness;
    use crate::apps::CreateAppRequest;
    use crate::nostr::memory::MemoryRelay;
    use crate::permissions::{PermissionsService, Scope};

    struct Fixture {
        relay: Arc<MemoryRelay>,
        apps: Arc<AppsService>,
        handler: Arc<RecordingHandler>,
        session: Arc<RelaySession>,
        _h: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let h = apps_harness();
        let apps = Arc::new(h.apps);
        let relay = Arc::new(MemoryRelay::new(&["wss://a"]));
        let info = Arc::new(InfoPublisher::new(
            relay.clone(),
            apps.clone(),
            Arc::new(PermissionsService::new(h.db.clone())),
        ));
        let handler = Arc::new(RecordingHandler::default());
        let session = RelaySession::new(relay.clone(), apps.clone(), info, handler.clone())
            .with_resubscribe_delay(Duration::from_millis(20));
        h.bus.register(Arc::new(AppLifecycleListener::new(&session)));
        Fixture {
            relay,
            apps,
            handler,
            session,
            _h: h._dir,
        }
    }

    fn request_to(wallet: PublicKey) -> Event {
        EventBuilder::new(Kind::Custom(23194), "sealed")
            .tags([Tag::public_key(wallet)])
            .sign_with_keys(&Keys::generate())
            .unwrap()
    }

    #[tokio::test]
    async fn created_apps_are_subscribed_without_restart() {
        let f = fixture();
        f.session.start().await.unwrap();
        assert_eq!(f.session.subscription_count(), 1);

        let created = f
            .apps
            .create(CreateAppRequest {
                name: "late".into(),
                scopes: vec![Scope::GetInfo],
                ..Default::default()
            })
            .await
            .unwrap();
        let session = f.session.clone();
        assert!(eventually(|| session.subscription_count() == 2).await);
        let relay = f.relay.clone();
        assert!(eventually(|| relay.open_subscriptions() == 2).await);
        assert!(eventually(|| !relay.published_of_kind(Kind::Custom(13194)).is_empty()).await);

        let wallet = PublicKey::from_hex(created.app.wallet_pubkey.as_deref().unwrap()).unwrap();
        f.relay.inject(request_to(wallet));
        for _ in 0..100 {
            if !f.handler.events.lock().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(f.handler.events.lock().await.len(), 1);

        f.apps.delete(created.app.id).unwrap();
        assert!(eventually(|| session.subscription_count() == 1).await);
        assert!(eventually(|| relay.published_of_kind(Kind::Custom(5)).len() == 1).await);
    }

    #[tokio::test]
    async fn closed_streams_are_reopened() {
        let f = fixture();
        f.session.start().await.unwrap();
        let relay = f.relay.clone();
        assert!(eventually(|| relay.subscribe_calls() == 1).await);

        f.relay.drop_subscriptions();
        assert!(eventually(|| relay.subscribe_calls() == 2).await);
        assert!(eventually(|| relay.open_subscriptions() == 1).await);

        f.session.stop().await;
        assert_eq!(f.session.subscription_count(), 0);
    }

    #[tokio::test]
    async fn statuses_follow_the_transport() {
        let f = fixture();
        f.relay.set_online("wss://a", false);
        f.session.refresh_statuses().await;
        assert_eq!(f.session.relay_statuses(), vec![("wss://a".to_string(), false)]);
    }
}
