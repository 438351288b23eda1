// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Relational NWC Hub - Nostr Wallet Connect gateway
//!
//! Exposes one Lightning node to many applications over NIP-47, with
//! per-app budgets, isolated sub-wallets and JIT liquidity bought from LSPs.
//!
//! ## Modules
//!
//! - `startup` - unlock, backend construction and service wiring
//! - `nostr` - relay sessions, info events and notifications
//! - `nwc` - NIP-47 request routing and method handlers
//! - `ledger` - transactions, fees and settlement
//! - `permissions` - scopes and budgets
//! - `apps` - app registry and key derivation
//! - `lnclient` - Lightning backend abstraction and in-memory node
//! - `lsps` - LSPS0/1/2/5 client and liquidity manager
//! - `jit` - JIT channel weaving into invoices
//! - `workers` - reconciliation loops
//! - `storage` - redb tables
//! - `api` - HTTP surface (Axum)

pub mod api;
pub mod apps;
pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod jit;
pub mod keys;
pub mod ledger;
pub mod lnclient;
pub mod lsps;
pub mod nostr;
pub mod nwc;
pub mod permissions;
pub mod startup;
pub mod state;
pub mod storage;
pub mod vault;
pub mod workers;
