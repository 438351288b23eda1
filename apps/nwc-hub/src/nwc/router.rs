// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use nostr_sdk::prelude::*;

use super::handlers::{self, RequestContext};
use super::protocol::{NwcError, NwcErrorCode, Request, Response};
use super::responder::Responder;
use crate::apps::AppsService;
use crate::events::types as names;
use crate::events::{EventPayload, EventPublisher};
use crate::jit::JitWeaver;
use crate::ledger::TransactionsService;
use crate::nostr::session::RequestHandler;
use crate::nostr::transport::RelayTransport;
use crate::nostr::{tag_value, Encryption};
use crate::permissions::{PermissionCheck, PermissionsService, Scope};
use crate::storage::apps::App;
use crate::storage::nostr_events::{NostrEventStore, RequestEventState};
use crate::storage::Db;

pub struct NwcRouter {
    pub(super) db: Arc<Db>,
    pub(super) transport: Arc<dyn RelayTransport>,
    pub(super) apps: Arc<AppsService>,
    pub(super) permissions: Arc<PermissionsService>,
    pub(super) ledger: Arc<TransactionsService>,
    pub(super) jit: Option<Arc<JitWeaver>>,
    pub(super) publisher: Arc<EventPublisher>,
}

impl NwcRouter {
    pub fn new(
        db: Arc<Db>,
        transport: Arc<dyn RelayTransport>,
        apps: Arc<AppsService>,
        permissions: Arc<PermissionsService>,
        ledger: Arc<TransactionsService>,
        jit: Option<Arc<JitWeaver>>,
        publisher: Arc<EventPublisher>,
    ) -> Self {
        Self {
            db,
            transport,
            apps,
            permissions,
            ledger,
            jit,
            publisher,
        }
    }

    fn events(&self) -> NostrEventStore<'_> {
        NostrEventStore::new(&self.db)
    }

    fn set_state(&self, request_id: u64, state: RequestEventState, method: Option<&str>) {
        if let Err(e) = self.events().update_request(request_id, state, method) {
            tracing::error!(request_id, error = %e, "Failed to update request state");
        }
    }

    /// App addressed by the request: by wallet key, or for the node key by
    /// the author's app pubkey.
    fn resolve_app(&self, event: &Event) -> Result<Option<App>, NwcError> {
        let Some(wallet) = event.tags.public_keys().next() else {
            return Ok(None);
        };
        let node = self.apps.keys().node_keys().public_key();
        let app = if *wallet == node {
            self.apps
                .find_by_app_pubkey(&event.pubkey.to_hex())?
                .filter(|app| app.wallet_pubkey.is_none())
        } else {
            self.apps.find_by_wallet_pubkey(&wallet.to_hex())?
        };
        Ok(app.filter(|app| app.app_pubkey.eq_ignore_ascii_case(&event.pubkey.to_hex())))
    }

    fn is_expired(event: &Event) -> bool {
        tag_value(event, "expiration")
            .and_then(|v| v.parse::<i64>().ok())
            .is_some_and(|at| at < Utc::now().timestamp())
    }

    fn deny(&self, app: &App, error: &NwcError) {
        self.publisher.publish(crate::events::Event::new(
            names::PERMISSION_DENIED,
            EventPayload::PermissionDenied {
                app_id: app.id,
                code: format!("{:?}", error.code),
                message: error.message.clone(),
            },
        ));
    }

    fn check_scope(&self, app: &App, method: &str) -> Result<(), NwcError> {
        let Some(scope) = Scope::for_method(method) else {
            return Err(NwcError::new(
                NwcErrorCode::NotImplemented,
                format!("unknown method {method}"),
            ));
        };
        let denied = match self.permissions.check(app, scope)? {
            PermissionCheck::Granted(_) => return Ok(()),
            PermissionCheck::Missing => {
                NwcError::new(NwcErrorCode::Restricted, format!("app lacks the {scope} scope"))
            }
            PermissionCheck::Expired => {
                NwcError::new(NwcErrorCode::Expired, format!("the {scope} permission expired"))
            }
        };
        self.deny(app, &denied);
        Err(denied)
    }

    async fn process(&self, event: Event) {
        let nostr_id = event.id.to_hex();
        let app = match self.resolve_app(&event) {
            Ok(app) => app,
            Err(e) => {
                tracing::error!(event_id = %nostr_id, error = %e, "Failed to resolve app");
                return;
            }
        };

        let request = match self.events().record_request(app.as_ref().map(|a| a.id), &nostr_id) {
            Ok(Some(request)) => request,
            Ok(None) => {
                tracing::debug!(event_id = %nostr_id, "Duplicate request ignored");
                return;
            }
            Err(e) => {
                tracing::error!(event_id = %nostr_id, error = %e, "Failed to record request");
                return;
            }
        };

        let Some(app) = app else {
            tracing::warn!(event_id = %nostr_id, author = %event.pubkey, "Request from unknown app");
            self.set_state(request.id, RequestEventState::Error, None);
            return;
        };

        if Self::is_expired(&event) {
            tracing::info!(app_id = app.id, event_id = %nostr_id, "Request expired before execution");
            self.set_state(request.id, RequestEventState::Expired, None);
            return;
        }

        let wallet = match self.apps.keys().wallet_keys_for(&app) {
            Ok(keys) => keys,
            Err(e) => {
                tracing::error!(app_id = app.id, error = %e, "Cannot derive wallet key");
                self.set_state(request.id, RequestEventState::Error, None);
                return;
            }
        };

        let encryption = match Encryption::from_tag(tag_value(&event, "encryption")) {
            Ok(encryption) => encryption,
            Err(e) => {
                let responder = Responder::new(
                    self.db.clone(),
                    self.transport.clone(),
                    wallet,
                    Encryption::Nip04,
                    &event,
                    request.id,
                );
                responder
                    .send(
                        Response::err("", NwcError::new(NwcErrorCode::NotImplemented, e.to_string())),
                        None,
                    )
                    .await;
                self.set_state(request.id, RequestEventState::Error, None);
                return;
            }
        };

        let payload = match encryption.decrypt(wallet.secret_key(), &event.pubkey, &event.content) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(app_id = app.id, error = %e, "Failed to decrypt request");
                self.set_state(request.id, RequestEventState::Error, None);
                return;
            }
        };

        let responder = Responder::new(
            self.db.clone(),
            self.transport.clone(),
            wallet,
            encryption,
            &event,
            request.id,
        );

        let parsed: Request = match serde_json::from_str(&payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                responder
                    .send(
                        Response::err("", NwcError::bad_request(format!("invalid request: {e}"))),
                        None,
                    )
                    .await;
                self.set_state(request.id, RequestEventState::Error, None);
                return;
            }
        };

        self.set_state(request.id, RequestEventState::Executing, Some(&parsed.method));
        if let Err(e) = self.apps.touch(app.id) {
            tracing::warn!(app_id = app.id, error = %e, "Failed to stamp last use");
        }
        tracing::info!(app_id = app.id, method = %parsed.method, request_id = request.id, "NWC request");

        if let Err(error) = self.check_scope(&app, &parsed.method) {
            tracing::info!(app_id = app.id, method = %parsed.method, code = ?error.code, "Request refused");
            responder.send(Response::err(&parsed.method, error), None).await;
            self.set_state(request.id, RequestEventState::Error, None);
            return;
        }

        let ctx = RequestContext {
            router: self,
            app: &app,
            method: &parsed.method,
            params: &parsed.params,
            request_id: request.id,
            responder: &responder,
        };
        handlers::dispatch(ctx).await;
        self.set_state(request.id, RequestEventState::Executed, None);
    }
}

#[async_trait]
impl RequestHandler for NwcRouter {
    async fn handle_event(&self, event: Event) {
        self.process(event).await;
    }
}
