// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # App Registry
//!
//! Creates, updates and deletes app connections. Creation mints a pairing
//! secret, derives the app's wallet key and writes the app row together
//! with its permission rows in one database transaction.
//!
//! ## Pairing URI
//!
//! ```text
//! nostr+walletconnect://<wallet_pub>?relay=<r1>&relay=<r2>&secret=<hex>[&lud16=<addr>]
//! ```

pub mod cache;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nostr_sdk::{Keys, PublicKey, SecretKey};
use serde_json::Value;

use crate::events::types::{self as names, Event, EventPayload};
use crate::events::EventPublisher;
use crate::keys::{KeyError, KeyStore};
use crate::permissions::{BudgetRenewal, Scope};
use crate::storage::apps::{
    self as app_rows, App, AppPermission, APPS, APP_PERMISSIONS, APP_PUBKEY_INDEX,
    WALLET_PUBKEY_INDEX,
};
use crate::storage::transactions as tx_rows;
use crate::storage::{Db, DbError};
use crate::vault::Vault;

use cache::AppCache;

const CACHE_CAPACITY: usize = 1024;
const CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),

    #[error("app not found: {0}")]
    NotFound(String),

    #[error("invalid unlock password")]
    InvalidPassword,

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Db(#[from] DbError),
}

impl From<redb::TableError> for AppError {
    fn from(e: redb::TableError) -> Self {
        AppError::Db(e.into())
    }
}

impl From<redb::CommitError> for AppError {
    fn from(e: redb::CommitError) -> Self {
        AppError::Db(e.into())
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Clone, Default)]
pub struct CreateAppRequest {
    pub name: String,
    /// Client-supplied pubkey; a pairing secret is generated when absent.
    pub app_pubkey: Option<String>,
    pub scopes: Vec<Scope>,
    pub max_amount_sat: u64,
    pub budget_renewal: BudgetRenewal,
    pub expires_at: Option<DateTime<Utc>>,
    pub isolated: bool,
    pub metadata: Option<Value>,
    /// Re-checked when `superuser` is requested.
    pub unlock_password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreatedApp {
    pub app: App,
    pub pairing_secret: Option<String>,
    pub pairing_uri: String,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateAppRequest {
    pub name: Option<String>,
    pub metadata: Option<Value>,
    pub isolated: Option<bool>,
    pub scopes: Option<Vec<Scope>>,
    pub max_amount_sat: Option<u64>,
    pub budget_renewal: Option<BudgetRenewal>,
    /// `Some(None)` clears the expiry.
    pub expires_at: Option<Option<DateTime<Utc>>>,
}

pub struct AppsService {
    db: Arc<Db>,
    keys: Arc<KeyStore>,
    vault: Arc<Vault>,
    publisher: Arc<EventPublisher>,
    relays: Vec<String>,
    lud16: Option<String>,
    cache: AppCache,
}

fn parse_pubkey(hex_key: &str) -> AppResult<PublicKey> {
    PublicKey::from_hex(hex_key)
        .map_err(|_| AppError::BadRequest(format!("invalid app pubkey {hex_key}")))
}

fn app_event(name: &str, app: &App) -> Event {
    Event::new(
        name,
        EventPayload::App {
            app_id: app.id,
            app_pubkey: app.app_pubkey.clone(),
            wallet_pubkey: app.wallet_pubkey.clone(),
        },
    )
}

impl AppsService {
    pub fn new(
        db: Arc<Db>,
        keys: Arc<KeyStore>,
        vault: Arc<Vault>,
        publisher: Arc<EventPublisher>,
        relays: Vec<String>,
        lud16: Option<String>,
    ) -> Self {
        Self {
            db,
            keys,
            vault,
            publisher,
            relays,
            lud16,
            cache: AppCache::new(CACHE_CAPACITY, CACHE_TTL),
        }
    }

    pub fn keys(&self) -> &Arc<KeyStore> {
        &self.keys
    }

    /// `secret` is left out for apps that brought their own pubkey.
    pub fn pairing_uri(&self, wallet_pubkey: &str, secret: Option<&str>) -> String {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        for relay in &self.relays {
            query.append_pair("relay", relay);
        }
        if let Some(secret) = secret {
            query.append_pair("secret", secret);
        }
        if let Some(lud16) = &self.lud16 {
            query.append_pair("lud16", lud16);
        }
        format!("nostr+walletconnect://{wallet_pubkey}?{}", query.finish())
    }

    pub async fn create(&self, request: CreateAppRequest) -> AppResult<CreatedApp> {
        if request.name.trim().is_empty() {
            return Err(AppError::BadRequest("app name is required".into()));
        }
        let scopes: BTreeSet<Scope> = request.scopes.iter().copied().collect();
        if scopes.is_empty() {
            return Err(AppError::BadRequest("at least one scope is required".into()));
        }
        if scopes.contains(&Scope::Superuser) {
            let password = request.unlock_password.as_deref().unwrap_or_default();
            if !self.vault.check_unlock_password(password) {
                return Err(AppError::InvalidPassword);
            }
        }

        let (app_pubkey, pairing_secret) = match &request.app_pubkey {
            Some(pubkey) => (parse_pubkey(pubkey)?.to_hex(), None),
            None => {
                let secret = SecretKey::from_slice(&rand::random::<[u8; 32]>())
                    .map_err(KeyError::from)?;
                let keys = Keys::new(secret);
                (keys.public_key().to_hex(), Some(keys.secret_key().to_secret_hex()))
            }
        };

        let now = Utc::now();
        let txn = self.db.begin_write()?;
        let id = app_rows::allocate_app_id(&txn)?;
        let wallet_pubkey = self.keys.app_wallet_key(id)?.public_key().to_hex();
        let app = App {
            id,
            name: request.name.trim().to_string(),
            app_pubkey,
            wallet_pubkey: Some(wallet_pubkey.clone()),
            isolated: request.isolated,
            metadata: request.metadata,
            created_at: now,
            updated_at: now,
            last_used_at: None,
        };
        app_rows::insert_app(&txn, &app).map_err(|e| match e {
            DbError::Conflict(what) => AppError::BadRequest(format!("duplicate {what}")),
            other => other.into(),
        })?;
        for scope in &scopes {
            let mut permission = AppPermission::new(id, *scope);
            permission.expires_at = request.expires_at;
            if *scope == Scope::PayInvoice {
                permission.max_amount_sat = request.max_amount_sat;
                permission.budget_renewal = request.budget_renewal;
            }
            app_rows::put_permission(&txn, &permission)?;
        }
        txn.commit()?;

        tracing::info!(app_id = id, name = %app.name, isolated = app.isolated, "App created");
        self.publisher.publish(app_event(names::APP_CREATED, &app));

        let pairing_uri = self.pairing_uri(&wallet_pubkey, pairing_secret.as_deref());
        Ok(CreatedApp {
            app,
            pairing_secret,
            pairing_uri,
        })
    }

    pub fn update(&self, app_id: u64, request: UpdateAppRequest) -> AppResult<App> {
        let txn = self.db.begin_write()?;
        let mut app = {
            let apps = txn.open_table(APPS)?;
            app_rows::get_app(&apps, app_id)?.ok_or_else(|| AppError::NotFound(app_id.to_string()))?
        };
        let existing = {
            let permissions = txn.open_table(APP_PERMISSIONS)?;
            app_rows::permissions_for_app(&permissions, app_id)?
        };

        if let Some(name) = request.name {
            if name.trim().is_empty() {
                return Err(AppError::BadRequest("app name is required".into()));
            }
            app.name = name.trim().to_string();
        }
        if let Some(metadata) = request.metadata {
            app.metadata = Some(metadata);
        }
        if let Some(isolated) = request.isolated {
            if app.isolated && !isolated && app.is_subwallet() {
                return Err(AppError::BadRequest("sub-wallets cannot be un-isolated".into()));
            }
            app.isolated = isolated;
        }

        let current: BTreeSet<Scope> = existing.iter().map(|p| p.scope).collect();
        let wanted: BTreeSet<Scope> = match request.scopes {
            Some(scopes) => scopes.into_iter().collect(),
            None => current.clone(),
        };
        if wanted.is_empty() {
            return Err(AppError::BadRequest("at least one scope is required".into()));
        }
        if wanted.contains(&Scope::Superuser) && !current.contains(&Scope::Superuser) {
            return Err(AppError::BadRequest(
                "superuser can only be granted at creation".into(),
            ));
        }

        for scope in current.difference(&wanted) {
            app_rows::delete_permission(&txn, app_id, *scope)?;
        }
        for scope in &wanted {
            let mut permission = existing
                .iter()
                .find(|p| p.scope == *scope)
                .cloned()
                .unwrap_or_else(|| AppPermission::new(app_id, *scope));
            if let Some(expires_at) = request.expires_at {
                permission.expires_at = expires_at;
            }
            if *scope == Scope::PayInvoice {
                if let Some(max) = request.max_amount_sat {
                    permission.max_amount_sat = max;
                }
                if let Some(renewal) = request.budget_renewal {
                    permission.budget_renewal = renewal;
                }
            }
            permission.updated_at = Utc::now();
            app_rows::put_permission(&txn, &permission)?;
        }

        app.updated_at = Utc::now();
        app_rows::put_app(&txn, &app)?;
        txn.commit()?;
        self.cache.invalidate_app(app_id);

        tracing::info!(app_id, "App updated");
        self.publisher.publish(app_event(names::APP_UPDATED, &app));
        Ok(app)
    }

    /// Delete the app with its permissions and transactions.
    pub fn delete(&self, app_id: u64) -> AppResult<App> {
        let txn = self.db.begin_write()?;
        let app = app_rows::delete_app(&txn, app_id).map_err(|e| match e {
            DbError::NotFound(_) => AppError::NotFound(app_id.to_string()),
            other => other.into(),
        })?;
        let removed = tx_rows::delete_for_app(&txn, app_id)?;
        txn.commit()?;
        self.cache.invalidate_app(app_id);

        tracing::info!(app_id, transactions = removed, "App deleted");
        self.publisher.publish(app_event(names::APP_DELETED, &app));
        Ok(app)
    }

    pub fn get(&self, app_id: u64) -> AppResult<App> {
        let read = self.db.begin_read()?;
        let apps = read.open_table(APPS)?;
        app_rows::get_app(&apps, app_id)?.ok_or_else(|| AppError::NotFound(app_id.to_string()))
    }

    pub fn list(&self) -> AppResult<Vec<App>> {
        let read = self.db.begin_read()?;
        let apps = read.open_table(APPS)?;
        Ok(app_rows::list_apps(&apps)?)
    }

    /// App whose derived wallet key is `wallet_pubkey`.
    pub fn find_by_wallet_pubkey(&self, wallet_pubkey: &str) -> AppResult<Option<App>> {
        self.find_indexed(WALLET_PUBKEY_INDEX, "w", wallet_pubkey)
    }

    /// App paired with `app_pubkey` (used for legacy apps served by the node key).
    pub fn find_by_app_pubkey(&self, app_pubkey: &str) -> AppResult<Option<App>> {
        self.find_indexed(APP_PUBKEY_INDEX, "a", app_pubkey)
    }

    fn find_indexed(
        &self,
        index: redb::TableDefinition<&str, u64>,
        cache_prefix: &str,
        pubkey: &str,
    ) -> AppResult<Option<App>> {
        let cache_key = format!("{cache_prefix}:{pubkey}");
        if let Some(app) = self.cache.get(&cache_key) {
            return Ok(Some(app));
        }
        let read = self.db.begin_read()?;
        let index = read.open_table(index)?;
        let Some(id) = app_rows::lookup_index(&index, pubkey)? else {
            return Ok(None);
        };
        let apps = read.open_table(APPS)?;
        let app = app_rows::get_app(&apps, id)?;
        if let Some(app) = &app {
            self.cache.put(&cache_key, app.clone());
        }
        Ok(app)
    }

    /// Stamp `last_used_at` on a request from the app.
    pub fn touch(&self, app_id: u64) -> AppResult<()> {
        let txn = self.db.begin_write()?;
        let app = {
            let apps = txn.open_table(APPS)?;
            app_rows::get_app(&apps, app_id)?
        };
        let Some(mut app) = app else {
            return Ok(());
        };
        app.last_used_at = Some(Utc::now());
        app_rows::put_app(&txn, &app)?;
        txn.commit()?;
        Ok(())
    }
}
