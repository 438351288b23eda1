// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! LRU cache for app lookups by wallet pubkey.
//!
//! Every inbound request resolves its app by the `p` tag; caching the row
//! avoids a redb read per request. Entries expire after a TTL and are
//! invalidated on app update and deletion.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::storage::apps::App;

struct CacheEntry {
    app: App,
    inserted_at: Instant,
}

pub struct AppCache {
    cache: Mutex<LruCache<String, CacheEntry>>,
    ttl: Duration,
}

impl AppCache {
    /// - `capacity`: max number of apps held.
    /// - `ttl`: lifetime of each entry.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            )),
            ttl,
        }
    }

    pub fn get(&self, wallet_pubkey: &str) -> Option<App> {
        let key = wallet_pubkey.to_lowercase();
        let mut cache = self.cache.lock().ok()?;
        if let Some(entry) = cache.get(&key) {
            if entry.inserted_at.elapsed() < self.ttl {
                return Some(entry.app.clone());
            }
            cache.pop(&key);
        }
        None
    }

    pub fn put(&self, wallet_pubkey: &str, app: App) {
        let key = wallet_pubkey.to_lowercase();
        if let Ok(mut cache) = self.cache.lock() {
            cache.put(
                key,
                CacheEntry {
                    app,
                    inserted_at: Instant::now(),
                },
            );
        }
    }

    /// Drop every entry pointing at `app_id`.
    pub fn invalidate_app(&self, app_id: u64) {
        if let Ok(mut cache) = self.cache.lock() {
            let stale: Vec<String> = cache
                .iter()
                .filter(|(_, entry)| entry.app.id == app_id)
                .map(|(key, _)| key.clone())
                .collect();
            for key in stale {
                cache.pop(&key);
            }
        }
    }
}
