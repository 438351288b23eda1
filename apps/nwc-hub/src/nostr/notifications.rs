// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! NIP-47 notifications.
//!
//! Settled payments and accepted hold invoices are pushed to every app that
//! holds the `notifications` scope. Isolated apps only hear about their own
//! transactions. Each notification goes out twice: kind 23196 sealed with
//! NIP-04 and kind 23197 sealed with NIP-44.

use std::sync::Arc;

use async_trait::async_trait;
use nostr_sdk::prelude::*;

use super::transport::RelayTransport;
use super::{kinds, Encryption};
use crate::apps::AppsService;
use crate::events::types as names;
use crate::events::{EventPayload, EventSubscriber};
use crate::lnclient::NotificationType;
use crate::nwc::protocol::{Notification, NwcTransaction};
use crate::permissions::{PermissionCheck, PermissionsService, Scope};
use crate::storage::apps::App;
use crate::storage::transactions::Transaction;

#[derive(Debug, thiserror::Error)]
enum NotifyError {
    #[error(transparent)]
    Key(#[from] crate::keys::KeyError),

    #[error("invalid app pubkey: {0}")]
    PublicKey(#[from] nostr_sdk::nostr::key::Error),

    #[error(transparent)]
    Crypto(#[from] super::CryptoError),

    #[error(transparent)]
    Builder(#[from] nostr_sdk::nostr::event::builder::Error),

    #[error(transparent)]
    Transport(#[from] super::transport::TransportError),
}

pub struct NotificationPublisher {
    transport: Arc<dyn RelayTransport>,
    apps: Arc<AppsService>,
    permissions: Arc<PermissionsService>,
}

fn notification_type(event_name: &str) -> Option<NotificationType> {
    match event_name {
        names::PAYMENT_RECEIVED => Some(NotificationType::PaymentReceived),
        names::PAYMENT_SENT => Some(NotificationType::PaymentSent),
        names::HOLD_INVOICE_ACCEPTED => Some(NotificationType::HoldInvoiceAccepted),
        _ => None,
    }
}

impl NotificationPublisher {
    pub fn new(
        transport: Arc<dyn RelayTransport>,
        apps: Arc<AppsService>,
        permissions: Arc<PermissionsService>,
    ) -> Self {
        Self {
            transport,
            apps,
            permissions,
        }
    }

    fn recipients(&self, tx: &Transaction) -> Vec<App> {
        let apps = match self.apps.list() {
            Ok(apps) => apps,
            Err(e) => {
                tracing::error!(error = %e, "Failed to list apps for notification");
                return Vec::new();
            }
        };
        apps.into_iter()
            .filter(|app| !app.isolated || tx.app_id == Some(app.id))
            .filter(|app| {
                matches!(
                    self.permissions.check(app, Scope::Notifications),
                    Ok(PermissionCheck::Granted(_))
                )
            })
            .collect()
    }

    pub async fn notify(&self, kind: NotificationType, tx: &Transaction) {
        let notification = Notification {
            notification_type: kind.as_str().to_string(),
            notification: NwcTransaction::from(tx),
        };
        let content = match serde_json::to_string(&notification) {
            Ok(content) => content,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize notification");
                return;
            }
        };

        for app in self.recipients(tx) {
            if let Err(e) = self.send(&app, &content).await {
                tracing::warn!(
                    app_id = app.id,
                    notification_type = kind.as_str(),
                    error = %e,
                    "Failed to publish notification"
                );
            }
        }
    }

    async fn send(&self, app: &App, content: &str) -> Result<(), NotifyError> {
        let keys = self.apps.keys().wallet_keys_for(app)?;
        let peer = PublicKey::from_hex(&app.app_pubkey)?;
        for (kind, scheme) in [
            (kinds::NOTIFICATION_NIP04, Encryption::Nip04),
            (kinds::NOTIFICATION, Encryption::Nip44V2),
        ] {
            let sealed = scheme.encrypt(keys.secret_key(), &peer, content)?;
            let event = EventBuilder::new(Kind::Custom(kind), sealed)
                .tags([Tag::public_key(peer)])
                .sign_with_keys(&keys)?;
            self.transport.publish(&event).await?;
        }
        tracing::debug!(app_id = app.id, "Notification published");
        Ok(())
    }
}

#[async_trait]
impl EventSubscriber for NotificationPublisher {
    async fn consume_event(&self, event: Arc<crate::events::Event>) {
        let Some(kind) = notification_type(&event.name) else {
            return;
        };
        if let EventPayload::Transaction(tx) = &event.payload {
            self.notify(kind, tx).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apps::testing::apps_harness;
    use crate::apps::CreateAppRequest;
    use crate::nostr::memory::MemoryRelay;
    use crate::storage::transactions::TransactionType;

    #[tokio::test]
    async fn notifications_reach_scoped_apps_in_both_kinds() {
        let h = apps_harness();
        let apps = Arc::new(h.apps);
        let relay = Arc::new(MemoryRelay::new(&["wss://a"]));
        let notifier = NotificationPublisher::new(
            relay.clone(),
            apps.clone(),
            Arc::new(PermissionsService::new(h.db.clone())),
        );

        let client = Keys::generate();
        let listening = apps
            .create(CreateAppRequest {
                name: "listening".into(),
                app_pubkey: Some(client.public_key().to_hex()),
                scopes: vec![Scope::Notifications, Scope::GetInfo],
                ..Default::default()
            })
            .await
            .unwrap();
        apps.create(CreateAppRequest {
            name: "deaf".into(),
            scopes: vec![Scope::GetInfo],
            ..Default::default()
        })
        .await
        .unwrap();
        apps.create(CreateAppRequest {
            name: "isolated".into(),
            scopes: vec![Scope::Notifications],
            isolated: true,
            ..Default::default()
        })
        .await
        .unwrap();

        let mut tx = Transaction::new_pending(TransactionType::Incoming, "ab".repeat(32));
        tx.amount_msat = 21_000;
        notifier.notify(NotificationType::PaymentReceived, &tx).await;

        let nip04 = relay.published_of_kind(Kind::Custom(23196));
        let nip44 = relay.published_of_kind(Kind::Custom(23197));
        assert_eq!(nip04.len(), 1);
        assert_eq!(nip44.len(), 1);

        let wallet = apps.keys().wallet_keys_for(&listening.app).unwrap();
        assert_eq!(nip44[0].pubkey, wallet.public_key());
        let opened = Encryption::Nip44V2
            .decrypt(client.secret_key(), &wallet.public_key(), &nip44[0].content)
            .unwrap();
        let parsed: Notification = serde_json::from_str(&opened).unwrap();
        assert_eq!(parsed.notification_type, "payment_received");
        assert_eq!(parsed.notification.amount, 21_000);
    }
}
