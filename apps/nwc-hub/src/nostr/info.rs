// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! NIP-47 info events (kind 13194).
//!
//! Each app wallet key advertises the methods its app may call. Legacy
//! apps share the node key, which advertises every method. Publishes are
//! remembered per `(wallet key, relay)` so an unchanged info event is not
//! sent twice to the same relay.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use nostr_sdk::prelude::*;

use super::kinds;
use super::transport::{RelayTransport, TransportResult};
use super::Encryption;
use crate::apps::{AppError, AppsService};
use crate::lnclient::NotificationType;
use crate::permissions::{PermissionsService, Scope};
use crate::storage::apps::App;

/// Methods unlocked by `scopes`, in scope order.
pub fn methods_for(scopes: &[Scope]) -> Vec<&'static str> {
    let mut scopes = scopes.to_vec();
    scopes.sort();
    scopes.iter().flat_map(|scope| scope.methods().iter().copied()).collect()
}

pub fn notification_types() -> String {
    NotificationType::ALL
        .iter()
        .map(|t| t.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn build_info_event(keys: &Keys, scopes: &[Scope]) -> TransportResult<Event> {
    let content = methods_for(scopes).join(" ");
    let mut tags = vec![Tag::parse(["encryption", Encryption::SUPPORTED])?];
    if scopes.contains(&Scope::Notifications) {
        tags.push(Tag::parse(["notifications", notification_types().as_str()])?);
    }
    Ok(EventBuilder::new(Kind::Custom(kinds::INFO), content)
        .tags(tags)
        .sign_with_keys(keys)?)
}

/// Kind-5 deletion of the info event published under `keys`.
pub fn build_deletion_event(keys: &Keys, info_event: Option<EventId>) -> TransportResult<Event> {
    let coordinate = format!("{}:{}:", kinds::INFO, keys.public_key().to_hex());
    let mut tags = vec![
        Tag::parse(["a", coordinate.as_str()])?,
        Tag::parse(["k", kinds::INFO.to_string().as_str()])?,
    ];
    if let Some(id) = info_event {
        tags.push(Tag::event(id));
    }
    Ok(EventBuilder::new(Kind::Custom(kinds::DELETION), "app deleted")
        .tags(tags)
        .sign_with_keys(keys)?)
}

#[derive(Debug, thiserror::Error)]
pub enum InfoError {
    #[error(transparent)]
    App(#[from] AppError),

    #[error(transparent)]
    Transport(#[from] super::transport::TransportError),

    #[error(transparent)]
    Db(#[from] crate::storage::DbError),
}

struct Published {
    content: String,
    event_id: EventId,
}

pub struct InfoPublisher {
    transport: Arc<dyn RelayTransport>,
    apps: Arc<AppsService>,
    permissions: Arc<PermissionsService>,
    /// `(wallet pubkey, relay)` → last info event accepted there.
    published: Mutex<HashMap<(String, String), Published>>,
}

impl InfoPublisher {
    pub fn new(
        transport: Arc<dyn RelayTransport>,
        apps: Arc<AppsService>,
        permissions: Arc<PermissionsService>,
    ) -> Self {
        Self {
            transport,
            apps,
            permissions,
            published: Mutex::new(HashMap::new()),
        }
    }

    /// Publish info events for every app, plus the node key if any legacy
    /// app exists.
    pub async fn publish_all(&self) -> Result<(), InfoError> {
        let apps = self.apps.list()?;
        let mut has_legacy = false;
        for app in &apps {
            if app.wallet_pubkey.is_none() {
                has_legacy = true;
                continue;
            }
            if let Err(e) = self.publish_for_app(app).await {
                tracing::warn!(app_id = app.id, error = %e, "Failed to publish app info event");
            }
        }
        if has_legacy {
            let keys = self.apps.keys().node_keys().clone();
            self.publish_with(&keys, &Scope::ALL).await?;
        }
        Ok(())
    }

    pub async fn publish_for_app(&self, app: &App) -> Result<(), InfoError> {
        let keys = self
            .apps
            .keys()
            .wallet_keys_for(app)
            .map_err(AppError::from)?;
        let scopes = self.permissions.scopes(app.id)?;
        self.publish_with(&keys, &scopes).await
    }

    async fn publish_with(&self, keys: &Keys, scopes: &[Scope]) -> Result<(), InfoError> {
        let event = build_info_event(keys, scopes)?;
        let wallet = keys.public_key().to_hex();
        for relay in self.transport.relay_urls() {
            let key = (wallet.clone(), relay.clone());
            let unchanged = self
                .lock()
                .get(&key)
                .is_some_and(|p| p.content == event.content);
            if unchanged {
                continue;
            }
            match self.transport.publish_to(&relay, &event).await {
                Ok(_) => {
                    tracing::debug!(wallet = %wallet, relay = %relay, "Info event published");
                    self.lock().insert(
                        key,
                        Published {
                            content: event.content.clone(),
                            event_id: event.id,
                        },
                    );
                }
                Err(e) => {
                    tracing::warn!(wallet = %wallet, relay = %relay, error = %e, "Info event rejected");
                }
            }
        }
        Ok(())
    }

    /// Publish a deletion for the info event of a removed app.
    pub async fn delete_for(&self, keys: &Keys) -> Result<(), InfoError> {
        let wallet = keys.public_key().to_hex();
        let last_id = {
            let mut published = self.lock();
            let mut last_id = None;
            published.retain(|(pk, _), p| {
                if *pk == wallet {
                    last_id = Some(p.event_id);
                    false
                } else {
                    true
                }
            });
            last_id
        };
        let event = build_deletion_event(keys, last_id)?;
        self.transport.publish(&event).await?;
        tracing::info!(wallet = %wallet, "Info event deletion published");
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(String, String), Published>> {
        self.published.lock().unwrap_or_else(|e| e.into_inner())
    }
}
