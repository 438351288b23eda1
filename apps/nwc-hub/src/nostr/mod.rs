// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Nostr Relay Session
//!
//! Everything that talks to relays: the transport seam, the per-app
//! request subscriptions, the NIP-47 info event publisher and the
//! notification fan-out.

pub mod info;
pub mod memory;
pub mod notifications;
pub mod session;
pub mod transport;

pub use session::{RelaySession, RequestHandler};
pub use transport::{NostrSdkTransport, RelayTransport, SubscriptionFilter, TransportError};

/// NIP-47 event kinds.
pub mod kinds {
    pub const INFO: u16 = 13194;
    pub const REQUEST: u16 = 23194;
    pub const RESPONSE: u16 = 23195;
    /// NIP-04 encrypted notification.
    pub const NOTIFICATION_NIP04: u16 = 23196;
    /// NIP-44 encrypted notification.
    pub const NOTIFICATION: u16 = 23197;
    pub const DELETION: u16 = 5;
}

/// Encryption scheme of a request, taken from its `encryption` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encryption {
    Nip04,
    Nip44V2,
}

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("unsupported encryption: {0}")]
    Unsupported(String),

    #[error("nip04: {0}")]
    Nip04(#[from] nostr_sdk::nostr::nips::nip04::Error),

    #[error("nip44: {0}")]
    Nip44(#[from] nostr_sdk::nostr::nips::nip44::Error),
}

impl Encryption {
    pub const SUPPORTED: &'static str = "nip44_v2 nip04";

    /// Scheme named by an `encryption` tag; requests without one use NIP-04.
    pub fn from_tag(value: Option<&str>) -> Result<Self, CryptoError> {
        match value.map(str::trim) {
            None | Some("") | Some("nip04") => Ok(Encryption::Nip04),
            Some("nip44_v2") => Ok(Encryption::Nip44V2),
            Some(other) => Err(CryptoError::Unsupported(other.to_string())),
        }
    }

    pub fn tag_value(self) -> &'static str {
        match self {
            Encryption::Nip04 => "nip04",
            Encryption::Nip44V2 => "nip44_v2",
        }
    }

    pub fn encrypt(
        self,
        secret_key: &nostr_sdk::SecretKey,
        peer: &nostr_sdk::PublicKey,
        plaintext: &str,
    ) -> Result<String, CryptoError> {
        use nostr_sdk::nostr::nips::{nip04, nip44};
        Ok(match self {
            Encryption::Nip04 => nip04::encrypt(secret_key, peer, plaintext)?,
            Encryption::Nip44V2 => {
                nip44::encrypt(secret_key, peer, plaintext, nip44::Version::V2)?
            }
        })
    }

    pub fn decrypt(
        self,
        secret_key: &nostr_sdk::SecretKey,
        peer: &nostr_sdk::PublicKey,
        ciphertext: &str,
    ) -> Result<String, CryptoError> {
        use nostr_sdk::nostr::nips::{nip04, nip44};
        Ok(match self {
            Encryption::Nip04 => nip04::decrypt(secret_key, peer, ciphertext)?,
            Encryption::Nip44V2 => nip44::decrypt(secret_key, peer, ciphertext)?,
        })
    }
}

/// First value of the first tag named `name`.
pub fn tag_value<'a>(event: &'a nostr_sdk::Event, name: &str) -> Option<&'a str> {
    event
        .tags
        .iter()
        .map(|tag| tag.as_slice())
        .find(|parts| parts.first().map(String::as_str) == Some(name))
        .and_then(|parts| parts.get(1))
        .map(String::as_str)
}
