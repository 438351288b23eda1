// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # LSPS Liquidity Manager
//!
//! Client side of the LSP specifications, spoken over custom peer messages
//! of type 37913:
//!
//! | Protocol | Use |
//! |----------|-----|
//! | LSPS0 | protocol discovery |
//! | LSPS1 | prepaid channel orders, persisted in `lsps1_orders` |
//! | LSPS2 | JIT channels bought by the invoice weaver |
//! | LSPS5 | webhook registration and notifications |
//!
//! A single inbound stream is demultiplexed to the protocol clients by
//! response id. Background loops keep active LSPs connected, sync the
//! community catalog, prune stale requests and answer the node's
//! channel-accept hook.

pub mod acceptor;
pub mod catalog;
mod demux;
pub mod jsonrpc;
pub mod lsps0;
pub mod lsps1;
pub mod lsps2;
pub mod lsps5;
mod manager;
mod transport;
pub mod webhook;

pub use jsonrpc::{JsonRpcMessage, RpcError, LSPS_MESSAGE_TYPE};
pub use manager::{LiquidityConfig, LiquidityManager};
pub use webhook::{WebhookError, WebhookEvent};

use crate::lnclient::LnClientError;
use crate::storage::DbError;

#[derive(Debug, thiserror::Error)]
pub enum LspsError {
    #[error("malformed LSPS message: {0}")]
    Malformed(String),

    #[error("LSP returned error {}: {}", .0.code, .0.message)]
    Rpc(RpcError),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("{0} was dropped before a response arrived")]
    Dropped(&'static str),

    #[error("unknown LSP {0}")]
    UnknownLsp(String),

    #[error("no active LSP")]
    NoActiveLsp,

    #[error("no opening fee params cover {0} msat")]
    NoSuitableParams(u64),

    #[error("invalid short channel id {0}")]
    InvalidScid(String),

    #[error("catalog exceeds the size limit")]
    CatalogTooLarge,

    #[error(transparent)]
    LnClient(#[from] LnClientError),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl LspsError {
    /// Stale fee params: refetch the menu and buy again.
    pub fn is_stale_promise(&self) -> bool {
        matches!(
            self,
            LspsError::Rpc(e)
                if e.code == lsps2::ERROR_INVALID_PARAMS
                    || e.code == lsps2::ERROR_LEGACY_EXPIRED_PROMISE
        )
    }
}
