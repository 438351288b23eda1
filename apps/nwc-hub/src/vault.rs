// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Vault
//!
//! The mnemonic rests encrypted in `user_config`:
//!
//! ```text
//! key        = scrypt(password, salt)            (32 bytes)
//! ciphertext = XChaCha20-Poly1305(key, nonce, mnemonic)
//! stored     = hex(salt) ":" hex(nonce) ":" hex(ciphertext)
//! ```
//!
//! Unlocking only borrows the mnemonic long enough to build the key store;
//! the gateway never writes it anywhere else.

use std::sync::Arc;

use bip39::Mnemonic;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::storage::config::{keys, ConfigStore};
use crate::storage::{Db, DbError};

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 24;
const KEY_LEN: usize = 32;

/// Default scrypt cost (N = 2^15, r = 8, p = 1).
pub const DEFAULT_SCRYPT_LOG_N: u8 = 15;

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("vault is not set up")]
    NotSetUp,

    #[error("vault is already set up")]
    AlreadySetUp,

    #[error("invalid password")]
    InvalidPassword,

    #[error("corrupt vault entry")]
    Corrupt,

    #[error("invalid mnemonic: {0}")]
    Mnemonic(#[from] bip39::Error),

    #[error("key stretching failed: {0}")]
    Kdf(String),

    #[error(transparent)]
    Db(#[from] DbError),
}

pub type VaultResult<T> = Result<T, VaultError>;

pub struct Vault {
    db: Arc<Db>,
    scrypt_log_n: u8,
}

impl Vault {
    pub fn new(db: Arc<Db>) -> Self {
        Self::with_cost(db, DEFAULT_SCRYPT_LOG_N)
    }

    pub fn with_cost(db: Arc<Db>, scrypt_log_n: u8) -> Self {
        Self { db, scrypt_log_n }
    }

    fn config(&self) -> ConfigStore<'_> {
        ConfigStore::new(&self.db)
    }

    pub fn is_set_up(&self) -> VaultResult<bool> {
        Ok(self.config().get(keys::MNEMONIC)?.is_some())
    }

    /// Encrypt and store a mnemonic, generating a fresh one if none is given.
    pub fn setup(&self, password: &str, mnemonic: Option<&str>) -> VaultResult<String> {
        if self.is_set_up()? {
            return Err(VaultError::AlreadySetUp);
        }
        let mnemonic = match mnemonic {
            Some(words) => Mnemonic::parse(words.trim())?,
            None => Mnemonic::from_entropy(&rand::random::<[u8; 16]>())?,
        };
        let phrase = mnemonic.to_string();

        let salt: [u8; SALT_LEN] = rand::random();
        let nonce: [u8; NONCE_LEN] = rand::random();
        let key = self.stretch(password, &salt)?;
        let cipher = XChaCha20Poly1305::new_from_slice(&key).map_err(|_| VaultError::Corrupt)?;
        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), phrase.as_bytes())
            .map_err(|_| VaultError::Corrupt)?;

        let stored = format!(
            "{}:{}:{}",
            hex::encode(salt),
            hex::encode(nonce),
            hex::encode(ciphertext)
        );
        self.config().set(keys::MNEMONIC, &stored)?;
        tracing::info!("Vault initialised");
        Ok(phrase)
    }

    /// Decrypt the mnemonic.
    pub fn unlock(&self, password: &str) -> VaultResult<String> {
        let stored = self
            .config()
            .get(keys::MNEMONIC)?
            .ok_or(VaultError::NotSetUp)?;
        let mut parts = stored.split(':');
        let (Some(salt), Some(nonce), Some(ciphertext), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(VaultError::Corrupt);
        };
        let salt = hex::decode(salt).map_err(|_| VaultError::Corrupt)?;
        let nonce = hex::decode(nonce).map_err(|_| VaultError::Corrupt)?;
        let ciphertext = hex::decode(ciphertext).map_err(|_| VaultError::Corrupt)?;
        if nonce.len() != NONCE_LEN {
            return Err(VaultError::Corrupt);
        }

        let key = self.stretch(password, &salt)?;
        let cipher = XChaCha20Poly1305::new_from_slice(&key).map_err(|_| VaultError::Corrupt)?;
        let plaintext = cipher
            .decrypt(XNonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| VaultError::InvalidPassword)?;
        String::from_utf8(plaintext).map_err(|_| VaultError::Corrupt)
    }

    pub fn check_unlock_password(&self, password: &str) -> bool {
        self.unlock(password).is_ok()
    }

    /// Derive (once) and return the JWT signing secret for the HTTP frontend.
    pub fn jwt_secret(&self, password: &str) -> VaultResult<String> {
        self.unlock(password)?;
        if let Some(existing) = self.config().get(keys::JWT_SECRET)? {
            return Ok(existing);
        }
        let salt = vault_salt(&self.config().get(keys::MNEMONIC)?.unwrap_or_default());
        let key = self.stretch(password, &salt)?;
        let mut mac =
            <Hmac<Sha256> as Mac>::new_from_slice(&key).map_err(|e| VaultError::Kdf(e.to_string()))?;
        mac.update(b"jwt-secret");
        let secret = hex::encode(mac.finalize().into_bytes());
        Ok(self.config().set_if_absent(keys::JWT_SECRET, &secret)?)
    }

    fn stretch(&self, password: &str, salt: &[u8]) -> VaultResult<[u8; KEY_LEN]> {
        let params = scrypt::Params::new(self.scrypt_log_n, 8, 1, KEY_LEN)
            .map_err(|e| VaultError::Kdf(e.to_string()))?;
        let mut key = [0u8; KEY_LEN];
        scrypt::scrypt(password.as_bytes(), salt, &params, &mut key)
            .map_err(|e| VaultError::Kdf(e.to_string()))?;
        Ok(key)
    }
}

/// Salt for the JWT key: the stored vault salt, so the secret is bound to
/// this vault.
fn vault_salt(stored: &str) -> Vec<u8> {
    stored
        .split(':')
        .next()
        .and_then(|salt| hex::decode(salt).ok())
        .unwrap_or_default()
}
