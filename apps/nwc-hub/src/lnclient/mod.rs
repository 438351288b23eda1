// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Lightning Backend Adapter
//!
//! `LnClient` is the uniform capability surface the gateway needs from a
//! Lightning node. Concrete backends live outside this crate; the in-memory
//! node in [`memory`] implements the trait for development and tests.
//!
//! Long-lived streams (payments, invoices, channel events, on-chain
//! transactions) are pumped onto the event bus by [`subscriptions`], which
//! reconnects with bounded exponential backoff.

pub mod bolt11;
pub mod memory;
pub mod onchain_cache;
pub mod subscriptions;
pub mod types;

use std::collections::HashSet;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::mpsc;

pub use types::*;

#[derive(Debug, Clone, thiserror::Error)]
pub enum LnClientError {
    #[error("not supported by this backend: {0}")]
    Unsupported(&'static str),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid invoice: {0}")]
    InvalidInvoice(String),

    #[error("payment failed: {0}")]
    PaymentFailed(String),

    #[error("stream closed")]
    StreamClosed,

    #[error("backend error: {0}")]
    Backend(String),
}

pub type LnResult<T> = Result<T, LnClientError>;

pub type LnEventStream = BoxStream<'static, LnResult<LnEvent>>;

/// Channel-accept hook: requests in, decisions out.
pub struct ChannelAcceptor {
    pub requests: mpsc::Receiver<ChannelAcceptRequest>,
    pub responses: mpsc::Sender<ChannelAcceptResponse>,
}

#[async_trait]
pub trait LnClient: Send + Sync {
    /// Hex pubkey of the local node.
    fn node_pubkey(&self) -> String;

    async fn get_info(&self) -> LnResult<NodeInfo>;
    async fn get_balances(&self) -> LnResult<Balances>;
    async fn get_node_status(&self) -> LnResult<NodeStatus>;

    async fn list_channels(&self) -> LnResult<Vec<Channel>>;
    async fn list_peers(&self) -> LnResult<Vec<PeerDetails>>;
    async fn open_channel(&self, request: OpenChannelRequest) -> LnResult<OpenChannelResponse>;
    async fn close_channel(&self, request: CloseChannelRequest) -> LnResult<()>;
    async fn update_channel(&self, request: UpdateChannelRequest) -> LnResult<()>;
    async fn connect_peer(&self, request: ConnectPeerRequest) -> LnResult<()>;
    async fn disconnect_peer(&self, pubkey: &str) -> LnResult<()>;

    async fn new_onchain_address(&self) -> LnResult<String>;
    async fn unused_onchain_address(&self) -> LnResult<String>;
    async fn redeem_onchain_funds(&self, to: &str, amount_sat: u64, send_all: bool)
        -> LnResult<String>;
    async fn list_onchain_transactions(&self) -> LnResult<Vec<OnchainTransaction>>;

    async fn make_invoice(&self, params: MakeInvoiceParams) -> LnResult<LnTransaction>;
    async fn make_hold_invoice(
        &self,
        params: MakeInvoiceParams,
        payment_hash: &str,
    ) -> LnResult<LnTransaction>;
    async fn lookup_invoice(&self, payment_hash: &str) -> LnResult<LnTransaction>;
    async fn send_payment_sync(
        &self,
        bolt11: &str,
        amount_msat: Option<u64>,
    ) -> LnResult<PayInvoiceResponse>;
    async fn send_keysend(
        &self,
        amount_msat: u64,
        destination: &str,
        custom_records: &[TlvRecord],
        preimage: &str,
    ) -> LnResult<PayInvoiceResponse>;
    async fn settle_hold_invoice(&self, preimage: &str) -> LnResult<()>;
    async fn cancel_hold_invoice(&self, payment_hash: &str) -> LnResult<()>;
    async fn list_transactions(&self, limit: usize, offset: usize) -> LnResult<Vec<LnTransaction>>;
    async fn list_forwards(&self, offset: u64, max: u64) -> LnResult<Vec<ForwardEvent>>;
    async fn sign_message(&self, message: &str) -> LnResult<String>;

    async fn subscribe_payments(&self) -> LnResult<LnEventStream>;
    async fn subscribe_invoices(&self) -> LnResult<LnEventStream>;
    async fn subscribe_channel_events(&self) -> LnResult<LnEventStream>;
    async fn subscribe_transactions(&self) -> LnResult<LnEventStream>;

    async fn send_custom_message(&self, peer: &str, msg_type: u32, data: Vec<u8>) -> LnResult<()>;
    async fn subscribe_custom_messages(
        &self,
    ) -> LnResult<(mpsc::Receiver<CustomMessage>, mpsc::Receiver<LnClientError>)>;
    async fn subscribe_channel_acceptor(&self) -> LnResult<ChannelAcceptor>;

    /// Push notifications this backend delivers on its streams.
    fn supported_notification_types(&self) -> HashSet<NotificationType>;

    async fn reset_router(&self, _key: Option<&str>) -> LnResult<()> {
        Err(LnClientError::Unsupported("reset_router"))
    }

    async fn shutdown(&self) -> LnResult<()>;
}
