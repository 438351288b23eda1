// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::sync::Arc;

use nostr_sdk::prelude::*;

use super::protocol::Response;
use crate::nostr::transport::RelayTransport;
use crate::nostr::{kinds, tag_value, Encryption};
use crate::storage::nostr_events::{NostrEventStore, ResponseEventState};
use crate::storage::Db;

#[derive(Debug, thiserror::Error)]
enum BuildError {
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Crypto(#[from] crate::nostr::CryptoError),

    #[error(transparent)]
    Tag(#[from] nostr_sdk::nostr::event::tag::Error),

    #[error(transparent)]
    Builder(#[from] nostr_sdk::nostr::event::builder::Error),
}

/// Publishes the responses of one request: encrypted to the client with the
/// request's cipher, signed by the wallet key, tagged with the request id
/// and carrying the request's expiration.
pub struct Responder {
    db: Arc<Db>,
    transport: Arc<dyn RelayTransport>,
    wallet: Keys,
    client: PublicKey,
    encryption: Encryption,
    request_nostr_id: EventId,
    request_row_id: u64,
    expiration: Option<String>,
}

impl Responder {
    pub(crate) fn new(
        db: Arc<Db>,
        transport: Arc<dyn RelayTransport>,
        wallet: Keys,
        encryption: Encryption,
        request: &Event,
        request_row_id: u64,
    ) -> Self {
        Self {
            db,
            transport,
            wallet,
            client: request.pubkey,
            encryption,
            request_nostr_id: request.id,
            request_row_id,
            expiration: tag_value(request, "expiration").map(str::to_string),
        }
    }

    fn build(&self, response: &Response, d_tag: Option<&str>) -> Result<Event, BuildError> {
        let content = serde_json::to_string(response)?;
        let sealed = self
            .encryption
            .encrypt(self.wallet.secret_key(), &self.client, &content)?;
        let mut tags = vec![Tag::public_key(self.client), Tag::event(self.request_nostr_id)];
        if let Some(d) = d_tag {
            tags.push(Tag::identifier(d));
        }
        if let Some(expiration) = &self.expiration {
            tags.push(Tag::parse(["expiration", expiration.as_str()])?);
        }
        if self.encryption == Encryption::Nip44V2 {
            tags.push(Tag::parse(["encryption", self.encryption.tag_value()])?);
        }
        Ok(EventBuilder::new(Kind::Custom(kinds::RESPONSE), sealed)
            .tags(tags)
            .sign_with_keys(&self.wallet)?)
    }

    /// Publish one response. `d_tag` keys sub-responses of multi methods.
    pub async fn send(&self, response: Response, d_tag: Option<&str>) {
        let event = match self.build(&response, d_tag) {
            Ok(event) => event,
            Err(e) => {
                tracing::error!(request_id = self.request_row_id, error = %e, "Failed to build response");
                return;
            }
        };
        let state = match self.transport.publish(&event).await {
            Ok(report) => {
                tracing::debug!(
                    request_id = self.request_row_id,
                    method = %response.result_type,
                    relays = report.success.len(),
                    "Response published"
                );
                ResponseEventState::Published
            }
            Err(e) => {
                tracing::warn!(request_id = self.request_row_id, error = %e, "Failed to publish response");
                ResponseEventState::Failed
            }
        };
        if let Err(e) = NostrEventStore::new(&self.db).record_response(
            self.request_row_id,
            &event.id.to_hex(),
            state,
        ) {
            tracing::error!(request_id = self.request_row_id, error = %e, "Failed to record response");
        }
    }
}
