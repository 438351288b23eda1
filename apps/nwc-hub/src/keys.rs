// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Key Derivation
//!
//! All Nostr identities of the gateway come from one BIP-39 mnemonic
//! (NIP-06 coin type 1237):
//!
//! | Path | Use |
//! |------|-----|
//! | `m/44'/1237'/0'/0/0` | node wallet key, serves legacy apps |
//! | `m/44'/1237'/1'/0/<app_id>` | per-app wallet key |
//!
//! The app pubkey is persisted on the app row at creation, so hot paths
//! never re-derive it.

use bip39::Mnemonic;
use bitcoin::bip32::{ChildNumber, DerivationPath, Xpriv};
use bitcoin::key::Secp256k1;
use bitcoin::secp256k1::All;
use bitcoin::Network;
use nostr_sdk::{Keys, SecretKey};

use crate::storage::apps::App;

const NOSTR_COIN_TYPE: u32 = 1237;
const NODE_ACCOUNT: u32 = 0;
const APP_ACCOUNT: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("invalid mnemonic: {0}")]
    Mnemonic(#[from] bip39::Error),

    #[error("key derivation failed: {0}")]
    Bip32(#[from] bitcoin::bip32::Error),

    #[error("invalid secret key: {0}")]
    Key(#[from] nostr_sdk::nostr::key::Error),

    #[error("app id {0} is out of the derivable range")]
    AppIdOutOfRange(u64),
}

/// Derivation root held for the lifetime of a running node.
pub struct KeyStore {
    secp: Secp256k1<All>,
    node_keys: Keys,
    app_root: Xpriv,
}

impl KeyStore {
    pub fn from_mnemonic(mnemonic: &str) -> Result<Self, KeyError> {
        let seed = Mnemonic::parse(mnemonic.trim())?.to_seed("");
        let secp = Secp256k1::new();
        let master = Xpriv::new_master(Network::Bitcoin, &seed)?;

        let node_path = DerivationPath::from(vec![
            ChildNumber::from_hardened_idx(44)?,
            ChildNumber::from_hardened_idx(NOSTR_COIN_TYPE)?,
            ChildNumber::from_hardened_idx(NODE_ACCOUNT)?,
            ChildNumber::from_normal_idx(0)?,
            ChildNumber::from_normal_idx(0)?,
        ]);
        let node = master.derive_priv(&secp, &node_path)?;
        let node_keys = Keys::new(SecretKey::from_slice(&node.private_key.secret_bytes())?);

        let app_path = DerivationPath::from(vec![
            ChildNumber::from_hardened_idx(44)?,
            ChildNumber::from_hardened_idx(NOSTR_COIN_TYPE)?,
            ChildNumber::from_hardened_idx(APP_ACCOUNT)?,
            ChildNumber::from_normal_idx(0)?,
        ]);
        let app_root = master.derive_priv(&secp, &app_path)?;

        Ok(Self {
            secp,
            node_keys,
            app_root,
        })
    }

    /// Key serving legacy apps and signing node-level events.
    pub fn node_keys(&self) -> &Keys {
        &self.node_keys
    }

    pub fn node_pubkey_hex(&self) -> String {
        self.node_keys.public_key().to_hex()
    }

    /// Deterministic wallet key for an app id.
    pub fn app_wallet_key(&self, app_id: u64) -> Result<Keys, KeyError> {
        let index = u32::try_from(app_id).map_err(|_| KeyError::AppIdOutOfRange(app_id))?;
        let child = ChildNumber::from_normal_idx(index)
            .map_err(|_| KeyError::AppIdOutOfRange(app_id))?;
        let derived = self.app_root.derive_priv(&self.secp, &[child])?;
        Ok(Keys::new(SecretKey::from_slice(
            &derived.private_key.secret_bytes(),
        )?))
    }

    /// The key an app's requests are encrypted to and its responses signed with.
    pub fn wallet_keys_for(&self, app: &App) -> Result<Keys, KeyError> {
        match app.wallet_pubkey {
            Some(_) => self.app_wallet_key(app.id),
            None => Ok(self.node_keys.clone()),
        }
    }
}
