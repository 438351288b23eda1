// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! LSPS5 webhook signatures and the SSE fan-out of webhook notifications.
//!
//! The LSP signs `"LSPS5: DO NOT SIGN THIS MESSAGE MANUALLY: LSP: At <ts> I
//! notify <body>"` with its node key. The signature is a 65-byte recoverable
//! ECDSA signature (header byte first), zbase32 encoded; the double SHA-256
//! of the message is the signed digest.

use std::sync::Mutex;

use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

/// Buffered events per SSE client.
pub const SSE_CLIENT_BUFFER: usize = 16;

const ZBASE32_ALPHABET: &[u8; 32] = b"ybndrfg8ejkmcpqxot1uwisza345h769";

pub fn zbase32_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity((data.len() * 8).div_ceil(5));
    let mut buffer: u32 = 0;
    let mut bits = 0;
    for &byte in data {
        buffer = (buffer << 8) | u32::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(char::from(ZBASE32_ALPHABET[((buffer >> bits) & 0x1f) as usize]));
        }
    }
    if bits > 0 {
        out.push(char::from(ZBASE32_ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize]));
    }
    out
}

pub fn zbase32_decode(text: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(text.len() * 5 / 8);
    let mut buffer: u32 = 0;
    let mut bits = 0;
    for c in text.bytes() {
        let value = ZBASE32_ALPHABET.iter().position(|&a| a == c)?;
        buffer = (buffer << 5) | value as u32;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push(((buffer >> bits) & 0xff) as u8);
        }
    }
    Some(out)
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WebhookError {
    #[error("malformed webhook: {0}")]
    Malformed(String),

    #[error("webhook signature does not match the LSP")]
    SignatureMismatch,
}

pub fn signed_message(timestamp: &str, body: &str) -> String {
    format!("LSPS5: DO NOT SIGN THIS MESSAGE MANUALLY: LSP: At {timestamp} I notify {body}")
}

pub fn message_digest(timestamp: &str, body: &str) -> [u8; 32] {
    let first = Sha256::digest(signed_message(timestamp, body).as_bytes());
    Sha256::digest(first).into()
}

/// Hex of the compressed pubkey that produced `signature`.
pub fn recover_signer(timestamp: &str, body: &str, signature: &str) -> Result<String, WebhookError> {
    let raw = zbase32_decode(signature)
        .ok_or_else(|| WebhookError::Malformed("signature is not zbase32".into()))?;
    if raw.len() != 65 {
        return Err(WebhookError::Malformed(format!(
            "signature is {} bytes, expected 65",
            raw.len()
        )));
    }
    let recid = match raw[0] {
        h @ 31..=34 => h - 31,
        h @ 27..=30 => h - 27,
        h @ 0..=3 => h,
        h => return Err(WebhookError::Malformed(format!("bad recovery header {h}"))),
    };
    let recovery_id = RecoveryId::from_byte(recid)
        .ok_or_else(|| WebhookError::Malformed("bad recovery id".into()))?;
    let sig = Signature::from_slice(&raw[1..])
        .map_err(|e| WebhookError::Malformed(e.to_string()))?;
    let key = VerifyingKey::recover_from_prehash(&message_digest(timestamp, body), &sig, recovery_id)
        .map_err(|_| WebhookError::SignatureMismatch)?;
    Ok(hex::encode(key.to_encoded_point(true).as_bytes()))
}

pub fn verify_webhook(
    lsp_pubkey: &str,
    timestamp: &str,
    signature: &str,
    body: &str,
) -> Result<(), WebhookError> {
    let signer = recover_signer(timestamp, body, signature)?;
    if signer.eq_ignore_ascii_case(lsp_pubkey) {
        Ok(())
    } else {
        tracing::warn!(lsp = %lsp_pubkey, signer = %signer, "LSPS5 webhook signed by another key");
        Err(WebhookError::SignatureMismatch)
    }
}

/// A webhook notification forwarded to SSE listeners.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookEvent {
    pub lsp_pubkey: String,
    pub method: String,
    pub params: Value,
}

/// Fan-out to SSE clients; a full client buffer drops the event for that
/// client only.
#[derive(Default)]
pub struct WebhookEvents {
    clients: Mutex<Vec<mpsc::Sender<WebhookEvent>>>,
}

impl WebhookEvents {
    pub fn subscribe(&self) -> mpsc::Receiver<WebhookEvent> {
        let (tx, rx) = mpsc::channel(SSE_CLIENT_BUFFER);
        self.clients.lock().unwrap_or_else(|e| e.into_inner()).push(tx);
        rx
    }

    pub fn broadcast(&self, event: &WebhookEvent) {
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        clients.retain(|client| match client.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!(method = %event.method, "SSE client buffer full, dropping event");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use k256::ecdsa::SigningKey;

    pub fn lsp_key(seed: u8) -> SigningKey {
        SigningKey::from_slice(&[seed; 32]).unwrap()
    }

    pub fn pubkey_hex(key: &SigningKey) -> String {
        hex::encode(key.verifying_key().to_encoded_point(true).as_bytes())
    }

    pub fn sign(key: &SigningKey, timestamp: &str, body: &str) -> String {
        let (sig, recid) = key
            .sign_prehash_recoverable(&message_digest(timestamp, body))
            .unwrap();
        let mut raw = vec![31 + recid.to_byte()];
        raw.extend_from_slice(&sig.to_bytes());
        zbase32_encode(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{lsp_key, pubkey_hex, sign};
    use super::*;

    #[test]
    fn zbase32_matches_known_vectors_and_is_a_fixpoint() {
        assert_eq!(zbase32_encode(b""), "");
        assert_eq!(zbase32_encode(&[0xf0, 0xbf, 0xc7]), "6n9hq");
        assert_eq!(zbase32_encode(&[0xd4, 0x7a, 0x04]), "4t7ye");

        let signature: Vec<u8> = (0u8..65).map(|i| i.wrapping_mul(37)).collect();
        let encoded = zbase32_encode(&signature);
        assert_eq!(encoded.len(), 104);
        let decoded = zbase32_decode(&encoded).unwrap();
        assert_eq!(decoded, signature);
        assert_eq!(zbase32_encode(&decoded), encoded);
        assert!(zbase32_decode("not zbase32!").is_none());
    }

    #[test]
    fn webhook_signature_recovers_the_lsp_key() {
        let key = lsp_key(7);
        let body = r#"{"jsonrpc":"2.0","method":"lsps5.payment_incoming","params":{}}"#;
        let ts = "2026-05-04T10:52:58.395Z";
        let signature = sign(&key, ts, body);
        assert_eq!(verify_webhook(&pubkey_hex(&key).to_uppercase(), ts, &signature, body), Ok(()));

        let intruder = pubkey_hex(&lsp_key(8));
        assert_eq!(
            verify_webhook(&intruder, ts, &signature, body),
            Err(WebhookError::SignatureMismatch)
        );
        assert_eq!(
            verify_webhook(&pubkey_hex(&key), ts, &signature, "{}"),
            Err(WebhookError::SignatureMismatch)
        );
        assert!(matches!(
            verify_webhook(&pubkey_hex(&key), ts, "yyyy", body),
            Err(WebhookError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn full_sse_clients_miss_events_without_blocking_others() {
        let events = WebhookEvents::default();
        let mut slow = events.subscribe();
        let event = |n: u64| WebhookEvent {
            lsp_pubkey: "02aa".into(),
            method: "lsps5.expiry_soon".into(),
            params: serde_json::json!({ "n": n }),
        };
        for n in 0..SSE_CLIENT_BUFFER as u64 {
            events.broadcast(&event(n));
        }
        let mut fast = events.subscribe();
        events.broadcast(&event(99));
        assert_eq!(fast.recv().await.unwrap().params["n"], 99);
        for n in 0..SSE_CLIENT_BUFFER as u64 {
            assert_eq!(slow.recv().await.unwrap().params["n"], n);
        }
        assert!(slow.try_recv().is_err());

        drop(fast);
        events.broadcast(&event(100));
        assert_eq!(events.client_count(), 1);
    }
}
