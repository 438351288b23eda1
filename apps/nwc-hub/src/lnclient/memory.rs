// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! In-memory Lightning node.
//!
//! Issues real, signed BOLT11 invoices under its own node key and keeps
//! balances, invoices and payments in process memory. Payments only
//! succeed towards invoices it knows the preimage of: its own, or the ones
//! minted with [`MemoryLnClient::external_invoice`]. The `simulate_*` and
//! `set_*` helpers drive the backend streams from tests and dev setups.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::hashes::{sha256, sha256d, Hash};
use bitcoin::secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use chrono::Utc;
use futures::StreamExt;
use lightning_invoice::{Currency, InvoiceBuilder};
use lightning_types::payment::PaymentSecret;
use lightning_types::routing::{RouteHint, RouteHintHop, RoutingFees};
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::BroadcastStream;

use super::bolt11::DecodedInvoice;
use super::*;
use crate::lsps::webhook::zbase32_encode;
use crate::storage::transactions::TransactionType;

const DEFAULT_EXPIRY_SECS: u64 = 86_400;
const STREAM_CAPACITY: usize = 256;

/// Build and sign a BOLT11 invoice (regtest) with `node_key`.
pub fn build_invoice(
    node_key: &SecretKey,
    payment_hash: [u8; 32],
    amount_msat: Option<u64>,
    description: &str,
    description_hash: Option<&str>,
    expiry_secs: u64,
    route_hint: Option<&JitRouteHint>,
) -> LnResult<String> {
    let secp = Secp256k1::new();
    let mut builder = InvoiceBuilder::new(Currency::Regtest)
        .payment_hash(sha256::Hash::from_byte_array(payment_hash))
        .payment_secret(PaymentSecret(rand::random()))
        .current_timestamp()
        .min_final_cltv_expiry_delta(144)
        .expiry_time(Duration::from_secs(expiry_secs));
    if let Some(amount) = amount_msat {
        builder = builder.amount_milli_satoshis(amount);
    }
    if let Some(hint) = route_hint {
        let src_node_id: PublicKey = hint
            .lsp_pubkey
            .parse()
            .map_err(|_| LnClientError::InvalidInvoice("bad LSP pubkey".into()))?;
        builder = builder.private_route(RouteHint(vec![RouteHintHop {
            src_node_id,
            short_channel_id: hint.short_channel_id,
            fees: RoutingFees {
                base_msat: hint.fee_base_msat,
                proportional_millionths: hint.fee_proportional_millionths,
            },
            cltv_expiry_delta: hint.cltv_expiry_delta,
            htlc_minimum_msat: None,
            htlc_maximum_msat: None,
        }]));
    }

    let sign = |msg: &Message| secp.sign_ecdsa_recoverable(msg, node_key);
    let invoice = match description_hash {
        Some(hash_hex) => {
            let bytes: [u8; 32] = hex::decode(hash_hex)
                .ok()
                .and_then(|b| b.try_into().ok())
                .ok_or_else(|| LnClientError::InvalidInvoice("bad description hash".into()))?;
            builder
                .description_hash(sha256::Hash::from_byte_array(bytes))
                .build_signed(sign)
        }
        None => builder.description(description.to_string()).build_signed(sign),
    }
    .map_err(|e| LnClientError::InvalidInvoice(e.to_string()))?;
    Ok(invoice.to_string())
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

struct MemoryInvoice {
    tx: LnTransaction,
    hold: bool,
    canceled: bool,
}

struct MemoryState {
    invoices: HashMap<String, MemoryInvoice>,
    payments: Vec<LnTransaction>,
    external_preimages: HashMap<String, String>,
    balances: Balances,
    channels: Vec<Channel>,
    peers: Vec<PeerDetails>,
    onchain: Vec<OnchainTransaction>,
    forwards: Vec<ForwardEvent>,
    ready: bool,
    block_height: u32,
    payment_failure: Option<String>,
    payment_fee_msat: u64,
    payment_delay: Duration,
    notification_types: HashSet<NotificationType>,
    sent_custom: Vec<CustomMessage>,
    custom_in: Option<mpsc::Sender<CustomMessage>>,
    custom_errors: Option<mpsc::Sender<LnClientError>>,
}

type CustomResponder = Box<dyn FnMut(&CustomMessage) -> Vec<CustomMessage> + Send>;

struct Acceptor {
    requests: mpsc::Sender<ChannelAcceptRequest>,
    responses: mpsc::Receiver<ChannelAcceptResponse>,
}

pub struct MemoryLnClient {
    secp: Secp256k1<bitcoin::secp256k1::All>,
    node_key: SecretKey,
    state: Mutex<MemoryState>,
    responder: Mutex<Option<CustomResponder>>,
    acceptor: tokio::sync::Mutex<Option<Acceptor>>,
    payments: broadcast::Sender<LnEvent>,
    invoices: broadcast::Sender<LnEvent>,
    channels: broadcast::Sender<LnEvent>,
    transactions: broadcast::Sender<LnEvent>,
}

impl MemoryLnClient {
    pub fn new(node_key: SecretKey) -> Self {
        Self {
            secp: Secp256k1::new(),
            node_key,
            state: Mutex::new(MemoryState {
                invoices: HashMap::new(),
                payments: Vec::new(),
                external_preimages: HashMap::new(),
                balances: Balances {
                    lightning: LightningBalance {
                        total_spendable_msat: 1_000_000_000,
                        total_receivable_msat: 1_000_000_000,
                        next_max_spendable_msat: 1_000_000_000,
                        next_max_receivable_msat: 1_000_000_000,
                    },
                    onchain: OnchainBalance::default(),
                },
                channels: Vec::new(),
                peers: Vec::new(),
                onchain: Vec::new(),
                forwards: Vec::new(),
                ready: true,
                block_height: 800_000,
                payment_failure: None,
                payment_fee_msat: 0,
                payment_delay: Duration::ZERO,
                notification_types: NotificationType::ALL.into_iter().collect(),
                sent_custom: Vec::new(),
                custom_in: None,
                custom_errors: None,
            }),
            responder: Mutex::new(None),
            acceptor: tokio::sync::Mutex::new(None),
            payments: broadcast::channel(STREAM_CAPACITY).0,
            invoices: broadcast::channel(STREAM_CAPACITY).0,
            channels: broadcast::channel(STREAM_CAPACITY).0,
            transactions: broadcast::channel(STREAM_CAPACITY).0,
        }
    }

    /// A node with a random key.
    pub fn random() -> LnResult<Self> {
        let key = SecretKey::from_slice(&rand::random::<[u8; 32]>())
            .map_err(|e| LnClientError::Backend(e.to_string()))?;
        Ok(Self::new(key))
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn stream(sender: &broadcast::Sender<LnEvent>) -> LnEventStream {
        BroadcastStream::new(sender.subscribe())
            .filter_map(|item| async move { item.ok().map(Ok) })
            .boxed()
    }

    // -------------------------------------------------------------------------
    // Test and dev controls
    // -------------------------------------------------------------------------

    pub fn set_spendable_msat(&self, msat: u64) {
        let mut state = self.state();
        state.balances.lightning.total_spendable_msat = msat;
        state.balances.lightning.next_max_spendable_msat = msat;
    }

    pub fn set_receivable_msat(&self, msat: u64) {
        let mut state = self.state();
        state.balances.lightning.total_receivable_msat = msat;
        state.balances.lightning.next_max_receivable_msat = msat;
    }

    pub fn set_ready(&self, ready: bool) {
        self.state().ready = ready;
    }

    pub fn set_channels(&self, channels: Vec<Channel>) {
        self.state().channels = channels;
    }

    pub fn set_payment_failure(&self, reason: Option<&str>) {
        self.state().payment_failure = reason.map(str::to_string);
    }

    pub fn set_payment_fee_msat(&self, fee_msat: u64) {
        self.state().payment_fee_msat = fee_msat;
    }

    pub fn set_payment_delay(&self, delay: Duration) {
        self.state().payment_delay = delay;
    }

    pub fn set_notification_types(&self, types: HashSet<NotificationType>) {
        self.state().notification_types = types;
    }

    pub fn add_forward(&self, outbound_msat: u64, fee_msat: u64) {
        self.state().forwards.push(ForwardEvent {
            outbound_amount_forwarded_msat: outbound_msat,
            total_fee_earned_msat: fee_msat,
            forwarded_at: Utc::now().timestamp(),
        });
    }

    /// Replies produced by `responder` are fed back as inbound custom messages.
    pub fn set_custom_message_responder<F>(&self, responder: F)
    where
        F: FnMut(&CustomMessage) -> Vec<CustomMessage> + Send + 'static,
    {
        *self.responder.lock().unwrap_or_else(|e| e.into_inner()) = Some(Box::new(responder));
    }

    pub fn sent_custom_messages(&self) -> Vec<CustomMessage> {
        self.state().sent_custom.clone()
    }

    pub fn inject_custom_message(&self, message: CustomMessage) {
        let sender = self.state().custom_in.clone();
        if let Some(sender) = sender {
            if sender.try_send(message).is_err() {
                tracing::warn!("Custom message queue full or closed");
            }
        }
    }

    pub fn inject_custom_message_error(&self, error: LnClientError) {
        let sender = self.state().custom_errors.clone();
        if let Some(sender) = sender {
            let _ = sender.try_send(error);
        }
    }

    /// Offer an inbound channel to the installed acceptor and wait for its answer.
    pub async fn request_channel_accept(
        &self,
        request: ChannelAcceptRequest,
    ) -> Option<ChannelAcceptResponse> {
        let mut guard = self.acceptor.lock().await;
        let acceptor = guard.as_mut()?;
        acceptor.requests.send(request).await.ok()?;
        acceptor.responses.recv().await
    }

    /// Mint an invoice payable by this node, as if issued by a remote node.
    pub fn external_invoice(&self, amount_msat: u64, description: &str) -> LnResult<String> {
        let remote = SecretKey::from_slice(&rand::random::<[u8; 32]>())
            .map_err(|e| LnClientError::Backend(e.to_string()))?;
        let preimage: [u8; 32] = rand::random();
        let hash: [u8; 32] = Sha256::digest(preimage).into();
        let bolt11 = build_invoice(
            &remote,
            hash,
            Some(amount_msat),
            description,
            None,
            DEFAULT_EXPIRY_SECS,
            None,
        )?;
        self.state()
            .external_preimages
            .insert(hex::encode(hash), hex::encode(preimage));
        Ok(bolt11)
    }

    /// Settle one of our plain invoices as paid by a remote node.
    pub fn simulate_incoming_payment(&self, payment_hash: &str) -> LnResult<LnTransaction> {
        let tx = {
            let mut state = self.state();
            let invoice = state
                .invoices
                .get_mut(payment_hash)
                .ok_or_else(|| LnClientError::NotFound(payment_hash.to_string()))?;
            if invoice.hold || invoice.canceled || invoice.tx.settled_at.is_some() {
                return Err(LnClientError::Backend("invoice is not payable".into()));
            }
            invoice.tx.settled_at = Some(Utc::now().timestamp());
            let tx = invoice.tx.clone();
            state.balances.lightning.total_spendable_msat += tx.amount_msat;
            tx
        };
        let _ = self.invoices.send(LnEvent::PaymentReceived(tx.clone()));
        Ok(tx)
    }

    /// An unsolicited keysend arriving with the given custom records.
    pub fn simulate_keysend_received(&self, amount_msat: u64, records: &[TlvRecord]) -> LnTransaction {
        let preimage: [u8; 32] = rand::random();
        let now = Utc::now().timestamp();
        let tx = LnTransaction {
            tx_type: TransactionType::Incoming,
            invoice: None,
            description: None,
            description_hash: None,
            preimage: Some(hex::encode(preimage)),
            payment_hash: sha256_hex(&preimage),
            amount_msat,
            fees_paid_msat: 0,
            created_at: now,
            expires_at: None,
            settled_at: Some(now),
            settle_deadline: None,
            metadata: Some(serde_json::json!({ "tlv_records": records })),
        };
        self.state().balances.lightning.total_spendable_msat += amount_msat;
        let _ = self.invoices.send(LnEvent::PaymentReceived(tx.clone()));
        tx
    }

    /// Report an HTLC held against one of our hold invoices.
    pub fn simulate_htlc_accepted(&self, payment_hash: &str, settle_deadline: u32) -> LnResult<()> {
        let tx = {
            let mut state = self.state();
            let invoice = state
                .invoices
                .get_mut(payment_hash)
                .filter(|i| i.hold && !i.canceled)
                .ok_or_else(|| LnClientError::NotFound(payment_hash.to_string()))?;
            invoice.tx.settle_deadline = Some(settle_deadline);
            invoice.tx.clone()
        };
        let _ = self.invoices.send(LnEvent::HoldInvoiceAccepted {
            transaction: tx,
            settle_deadline,
        });
        Ok(())
    }

    pub fn simulate_onchain_transaction(&self, tx: OnchainTransaction) {
        self.state().onchain.push(tx.clone());
        let _ = self.transactions.send(LnEvent::OnchainTransaction(tx));
    }

    fn new_invoice(
        &self,
        params: &MakeInvoiceParams,
        payment_hash: [u8; 32],
        preimage: Option<[u8; 32]>,
    ) -> LnResult<LnTransaction> {
        let expiry = params.expiry_secs.unwrap_or(DEFAULT_EXPIRY_SECS);
        let bolt11 = build_invoice(
            &self.node_key,
            payment_hash,
            Some(params.amount_msat),
            &params.description,
            params.description_hash.as_deref(),
            expiry,
            params.route_hint.as_ref(),
        )?;
        let now = Utc::now().timestamp();
        Ok(LnTransaction {
            tx_type: TransactionType::Incoming,
            invoice: Some(bolt11),
            description: Some(params.description.clone()),
            description_hash: params.description_hash.clone(),
            preimage: preimage.map(hex::encode),
            payment_hash: hex::encode(payment_hash),
            amount_msat: params.amount_msat,
            fees_paid_msat: 0,
            created_at: now,
            expires_at: Some(now + i64::try_from(expiry).unwrap_or(i64::MAX / 2)),
            settled_at: None,
            settle_deadline: None,
            metadata: None,
        })
    }

    /// Common outgoing path for invoices and keysends.
    async fn pay(
        &self,
        payment_hash: String,
        preimage: String,
        amount_msat: u64,
        invoice: Option<String>,
        metadata: Option<serde_json::Value>,
    ) -> LnResult<PayInvoiceResponse> {
        let delay = self.state().payment_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let outcome = {
            let mut state = self.state();
            let fee = state.payment_fee_msat;
            if let Some(reason) = state.payment_failure.clone() {
                Err(reason)
            } else if state.balances.lightning.total_spendable_msat < amount_msat + fee {
                Err("insufficient outbound liquidity".to_string())
            } else {
                state.balances.lightning.total_spendable_msat -= amount_msat + fee;
                state.balances.lightning.next_max_spendable_msat =
                    state.balances.lightning.total_spendable_msat;
                let now = Utc::now().timestamp();
                let tx = LnTransaction {
                    tx_type: TransactionType::Outgoing,
                    invoice,
                    description: None,
                    description_hash: None,
                    preimage: Some(preimage.clone()),
                    payment_hash: payment_hash.clone(),
                    amount_msat,
                    fees_paid_msat: fee,
                    created_at: now,
                    expires_at: None,
                    settled_at: Some(now),
                    settle_deadline: None,
                    metadata,
                };
                state.payments.push(tx.clone());
                Ok((tx, fee))
            }
        };

        match outcome {
            Ok((tx, fee_msat)) => {
                let _ = self.payments.send(LnEvent::PaymentSent(tx));
                Ok(PayInvoiceResponse { preimage, fee_msat })
            }
            Err(reason) => {
                let _ = self.payments.send(LnEvent::PaymentFailed {
                    payment_hash,
                    reason: reason.clone(),
                });
                Err(LnClientError::PaymentFailed(reason))
            }
        }
    }
}

#[async_trait]
impl LnClient for MemoryLnClient {
    fn node_pubkey(&self) -> String {
        self.node_key.public_key(&self.secp).to_string()
    }

    async fn get_info(&self) -> LnResult<NodeInfo> {
        Ok(NodeInfo {
            alias: "nwc-hub-memory".into(),
            color: "#3399ff".into(),
            pubkey: self.node_pubkey(),
            network: "regtest".into(),
            block_height: self.state().block_height,
            block_hash: hex::encode([0u8; 32]),
        })
    }

    async fn get_balances(&self) -> LnResult<Balances> {
        Ok(self.state().balances.clone())
    }

    async fn get_node_status(&self) -> LnResult<NodeStatus> {
        let ready = self.state().ready;
        Ok(NodeStatus {
            is_ready: ready,
            internal: serde_json::json!({ "backend": "memory" }),
        })
    }

    async fn list_channels(&self) -> LnResult<Vec<Channel>> {
        Ok(self.state().channels.clone())
    }

    async fn list_peers(&self) -> LnResult<Vec<PeerDetails>> {
        Ok(self.state().peers.clone())
    }

    async fn open_channel(&self, request: OpenChannelRequest) -> LnResult<OpenChannelResponse> {
        let funding_tx_id = hex::encode(rand::random::<[u8; 32]>());
        let channel = Channel {
            id: hex::encode(rand::random::<[u8; 8]>()),
            remote_pubkey: request.pubkey,
            local_balance_msat: request.amount_sat * 1000,
            remote_balance_msat: 0,
            active: true,
            public: request.public,
            funding_tx_id: funding_tx_id.clone(),
            confirmations: Some(0),
            confirmations_required: Some(3),
        };
        self.state().channels.push(channel.clone());
        let _ = self.channels.send(LnEvent::ChannelOpened(channel));
        Ok(OpenChannelResponse { funding_tx_id })
    }

    async fn close_channel(&self, request: CloseChannelRequest) -> LnResult<()> {
        let removed = {
            let mut state = self.state();
            let before = state.channels.len();
            state.channels.retain(|c| c.id != request.channel_id);
            before != state.channels.len()
        };
        if !removed {
            return Err(LnClientError::NotFound(request.channel_id));
        }
        let _ = self.channels.send(LnEvent::ChannelClosed {
            channel_id: request.channel_id,
            remote_pubkey: request.node_id,
        });
        Ok(())
    }

    async fn update_channel(&self, request: UpdateChannelRequest) -> LnResult<()> {
        let state = self.state();
        if state.channels.iter().any(|c| c.id == request.channel_id) {
            Ok(())
        } else {
            Err(LnClientError::NotFound(request.channel_id))
        }
    }

    async fn connect_peer(&self, request: ConnectPeerRequest) -> LnResult<()> {
        let mut state = self.state();
        let node_id = request.pubkey.to_lowercase();
        state.peers.retain(|p| p.node_id != node_id);
        state.peers.push(PeerDetails {
            node_id,
            address: format!("{}:{}", request.address, request.port),
            is_persisted: true,
            is_connected: true,
        });
        Ok(())
    }

    async fn disconnect_peer(&self, pubkey: &str) -> LnResult<()> {
        self.state()
            .peers
            .retain(|p| !p.node_id.eq_ignore_ascii_case(pubkey));
        Ok(())
    }

    async fn new_onchain_address(&self) -> LnResult<String> {
        Ok(format!("bcrt1q{}", hex::encode(rand::random::<[u8; 20]>())))
    }

    async fn unused_onchain_address(&self) -> LnResult<String> {
        self.new_onchain_address().await
    }

    async fn redeem_onchain_funds(
        &self,
        _to: &str,
        amount_sat: u64,
        send_all: bool,
    ) -> LnResult<String> {
        let txid = hex::encode(rand::random::<[u8; 32]>());
        let spent = {
            let mut state = self.state();
            let available = state.balances.onchain.spendable_sat;
            let spent = if send_all { available } else { amount_sat };
            if spent > available {
                return Err(LnClientError::Backend("insufficient on-chain funds".into()));
            }
            state.balances.onchain.spendable_sat -= spent;
            state.balances.onchain.total_sat = state.balances.onchain.total_sat.saturating_sub(spent);
            spent
        };
        self.simulate_onchain_transaction(OnchainTransaction {
            txid: txid.clone(),
            amount_sat: spent,
            incoming: false,
            confirmations: 0,
            created_at: Utc::now().timestamp(),
        });
        Ok(txid)
    }

    async fn list_onchain_transactions(&self) -> LnResult<Vec<OnchainTransaction>> {
        Ok(self.state().onchain.clone())
    }

    async fn make_invoice(&self, params: MakeInvoiceParams) -> LnResult<LnTransaction> {
        let preimage: [u8; 32] = rand::random();
        let hash: [u8; 32] = Sha256::digest(preimage).into();
        let tx = self.new_invoice(&params, hash, Some(preimage))?;
        self.state().invoices.insert(
            tx.payment_hash.clone(),
            MemoryInvoice {
                tx: tx.clone(),
                hold: false,
                canceled: false,
            },
        );
        Ok(tx)
    }

    async fn make_hold_invoice(
        &self,
        params: MakeInvoiceParams,
        payment_hash: &str,
    ) -> LnResult<LnTransaction> {
        let hash: [u8; 32] = hex::decode(payment_hash)
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| LnClientError::InvalidInvoice("payment hash must be 32 bytes".into()))?;
        let tx = self.new_invoice(&params, hash, None)?;
        self.state().invoices.insert(
            tx.payment_hash.clone(),
            MemoryInvoice {
                tx: tx.clone(),
                hold: true,
                canceled: false,
            },
        );
        Ok(tx)
    }

    async fn lookup_invoice(&self, payment_hash: &str) -> LnResult<LnTransaction> {
        let state = self.state();
        if let Some(invoice) = state.invoices.get(payment_hash) {
            return Ok(invoice.tx.clone());
        }
        state
            .payments
            .iter()
            .find(|p| p.payment_hash == payment_hash)
            .cloned()
            .ok_or_else(|| LnClientError::NotFound(payment_hash.to_string()))
    }

    async fn send_payment_sync(
        &self,
        bolt11: &str,
        amount_msat: Option<u64>,
    ) -> LnResult<PayInvoiceResponse> {
        let decoded = DecodedInvoice::decode(bolt11)?;
        let amount = amount_msat
            .or(decoded.amount_msat)
            .ok_or_else(|| LnClientError::InvalidInvoice("amount required".into()))?;

        let preimage = {
            let state = self.state();
            match state.invoices.get(&decoded.payment_hash) {
                Some(own) if !own.hold && !own.canceled => own.tx.preimage.clone(),
                Some(_) => None,
                None => state.external_preimages.get(&decoded.payment_hash).cloned(),
            }
        };
        let Some(preimage) = preimage else {
            let reason = "no route".to_string();
            let _ = self.payments.send(LnEvent::PaymentFailed {
                payment_hash: decoded.payment_hash,
                reason: reason.clone(),
            });
            return Err(LnClientError::PaymentFailed(reason));
        };

        let response = self
            .pay(
                decoded.payment_hash.clone(),
                preimage,
                amount,
                Some(decoded.bolt11),
                None,
            )
            .await?;
        if decoded.payee_pubkey == self.node_pubkey() {
            // paid ourselves through the backend
            let _ = self.simulate_incoming_payment(&decoded.payment_hash);
        }
        Ok(response)
    }

    async fn send_keysend(
        &self,
        amount_msat: u64,
        destination: &str,
        custom_records: &[TlvRecord],
        preimage: &str,
    ) -> LnResult<PayInvoiceResponse> {
        destination
            .parse::<PublicKey>()
            .map_err(|_| LnClientError::Backend(format!("invalid destination {destination}")))?;
        let preimage_bytes =
            hex::decode(preimage).map_err(|_| LnClientError::Backend("invalid preimage".into()))?;
        self.pay(
            sha256_hex(&preimage_bytes),
            preimage.to_string(),
            amount_msat,
            None,
            Some(serde_json::json!({ "tlv_records": custom_records })),
        )
        .await
    }

    async fn settle_hold_invoice(&self, preimage: &str) -> LnResult<()> {
        let bytes =
            hex::decode(preimage).map_err(|_| LnClientError::Backend("invalid preimage".into()))?;
        let hash = sha256_hex(&bytes);
        let tx = {
            let mut state = self.state();
            let invoice = state
                .invoices
                .get_mut(&hash)
                .filter(|i| i.hold && !i.canceled && i.tx.settled_at.is_none())
                .ok_or_else(|| LnClientError::NotFound(hash.clone()))?;
            invoice.tx.preimage = Some(preimage.to_string());
            invoice.tx.settled_at = Some(Utc::now().timestamp());
            let tx = invoice.tx.clone();
            state.balances.lightning.total_spendable_msat += tx.amount_msat;
            tx
        };
        let _ = self.invoices.send(LnEvent::PaymentReceived(tx));
        Ok(())
    }

    async fn cancel_hold_invoice(&self, payment_hash: &str) -> LnResult<()> {
        {
            let mut state = self.state();
            let invoice = state
                .invoices
                .get_mut(payment_hash)
                .filter(|i| i.tx.settled_at.is_none())
                .ok_or_else(|| LnClientError::NotFound(payment_hash.to_string()))?;
            invoice.canceled = true;
        }
        let _ = self.invoices.send(LnEvent::InvoiceCanceled {
            payment_hash: payment_hash.to_string(),
        });
        Ok(())
    }

    async fn list_transactions(&self, limit: usize, offset: usize) -> LnResult<Vec<LnTransaction>> {
        let state = self.state();
        let mut all: Vec<LnTransaction> = state
            .invoices
            .values()
            .map(|i| i.tx.clone())
            .chain(state.payments.iter().cloned())
            .collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all.into_iter().skip(offset).take(limit).collect())
    }

    async fn list_forwards(&self, offset: u64, max: u64) -> LnResult<Vec<ForwardEvent>> {
        let state = self.state();
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        let take = usize::try_from(max).unwrap_or(usize::MAX);
        Ok(state.forwards.iter().skip(start).take(take).cloned().collect())
    }

    async fn sign_message(&self, message: &str) -> LnResult<String> {
        let mut payload = b"Lightning Signed Message:".to_vec();
        payload.extend_from_slice(message.as_bytes());
        let digest = sha256d::Hash::hash(&payload).to_byte_array();
        let msg = Message::from_digest(digest);
        let (recovery_id, compact) = self
            .secp
            .sign_ecdsa_recoverable(&msg, &self.node_key)
            .serialize_compact();
        let mut raw = Vec::with_capacity(65);
        let recid = u8::try_from(recovery_id.to_i32()).unwrap_or(0);
        raw.push(31 + recid);
        raw.extend_from_slice(&compact);
        Ok(zbase32_encode(&raw))
    }

    async fn subscribe_payments(&self) -> LnResult<LnEventStream> {
        Ok(Self::stream(&self.payments))
    }

    async fn subscribe_invoices(&self) -> LnResult<LnEventStream> {
        Ok(Self::stream(&self.invoices))
    }

    async fn subscribe_channel_events(&self) -> LnResult<LnEventStream> {
        Ok(Self::stream(&self.channels))
    }

    async fn subscribe_transactions(&self) -> LnResult<LnEventStream> {
        Ok(Self::stream(&self.transactions))
    }

    async fn send_custom_message(&self, peer: &str, msg_type: u32, data: Vec<u8>) -> LnResult<()> {
        let message = CustomMessage {
            peer: peer.to_lowercase(),
            msg_type,
            data,
        };
        self.state().sent_custom.push(message.clone());
        let replies = {
            let mut responder = self.responder.lock().unwrap_or_else(|e| e.into_inner());
            match responder.as_mut() {
                Some(respond) => respond(&message),
                None => Vec::new(),
            }
        };
        for reply in replies {
            self.inject_custom_message(reply);
        }
        Ok(())
    }

    async fn subscribe_custom_messages(
        &self,
    ) -> LnResult<(mpsc::Receiver<CustomMessage>, mpsc::Receiver<LnClientError>)> {
        let (msg_tx, msg_rx) = mpsc::channel(64);
        let (err_tx, err_rx) = mpsc::channel(4);
        let mut state = self.state();
        state.custom_in = Some(msg_tx);
        state.custom_errors = Some(err_tx);
        Ok((msg_rx, err_rx))
    }

    async fn subscribe_channel_acceptor(&self) -> LnResult<ChannelAcceptor> {
        let (req_tx, req_rx) = mpsc::channel(16);
        let (resp_tx, resp_rx) = mpsc::channel(16);
        *self.acceptor.lock().await = Some(Acceptor {
            requests: req_tx,
            responses: resp_rx,
        });
        Ok(ChannelAcceptor {
            requests: req_rx,
            responses: resp_tx,
        })
    }

    fn supported_notification_types(&self) -> HashSet<NotificationType> {
        self.state().notification_types.clone()
    }

    async fn shutdown(&self) -> LnResult<()> {
        let mut state = self.state();
        state.custom_in = None;
        state.custom_errors = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> MemoryLnClient {
        MemoryLnClient::new(SecretKey::from_slice(&[3u8; 32]).unwrap())
    }

    #[tokio::test]
    async fn own_invoice_carries_preimage_and_hash() {
        let ln = node();
        let tx = ln
            .make_invoice(MakeInvoiceParams {
                amount_msat: 21_000,
                description: "tip".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let preimage = hex::decode(tx.preimage.as_ref().unwrap()).unwrap();
        assert_eq!(sha256_hex(&preimage), tx.payment_hash);

        let decoded = DecodedInvoice::decode(tx.invoice.as_ref().unwrap()).unwrap();
        assert_eq!(decoded.payee_pubkey, ln.node_pubkey());
        assert_eq!(decoded.amount_msat, Some(21_000));
    }

    #[tokio::test]
    async fn external_payment_debits_balance_and_streams() {
        let ln = node();
        ln.set_spendable_msat(100_000);
        ln.set_payment_fee_msat(7);
        let mut payments = ln.subscribe_payments().await.unwrap();

        let bolt11 = ln.external_invoice(50_000, "bill").unwrap();
        let paid = ln.send_payment_sync(&bolt11, None).await.unwrap();
        assert_eq!(paid.fee_msat, 7);
        assert_eq!(
            ln.get_balances().await.unwrap().lightning.total_spendable_msat,
            49_993
        );
        assert!(matches!(payments.next().await, Some(Ok(LnEvent::PaymentSent(_)))));

        let unknown = build_invoice(
            &SecretKey::from_slice(&[4u8; 32]).unwrap(),
            [9u8; 32],
            Some(1_000),
            "",
            None,
            60,
            None,
        )
        .unwrap();
        assert!(matches!(
            ln.send_payment_sync(&unknown, None).await,
            Err(LnClientError::PaymentFailed(_))
        ));
    }

    #[tokio::test]
    async fn hold_invoice_lifecycle() {
        let ln = node();
        let preimage = [5u8; 32];
        let hash = sha256_hex(&preimage);
        let mut invoices = ln.subscribe_invoices().await.unwrap();

        ln.make_hold_invoice(
            MakeInvoiceParams {
                amount_msat: 1_000,
                ..Default::default()
            },
            &hash,
        )
        .await
        .unwrap();
        ln.simulate_htlc_accepted(&hash, 144).unwrap();
        match invoices.next().await {
            Some(Ok(LnEvent::HoldInvoiceAccepted { settle_deadline, .. })) => {
                assert_eq!(settle_deadline, 144)
            }
            other => panic!("unexpected {other:?}"),
        }

        ln.settle_hold_invoice(&hex::encode(preimage)).await.unwrap();
        assert!(matches!(
            invoices.next().await,
            Some(Ok(LnEvent::PaymentReceived(_)))
        ));
        assert!(ln.cancel_hold_invoice(&hash).await.is_err());
    }

    #[tokio::test]
    async fn custom_messages_loop_through_responder() {
        let ln = node();
        let (mut inbound, _errors) = ln.subscribe_custom_messages().await.unwrap();
        ln.set_custom_message_responder(|msg| {
            vec![CustomMessage {
                peer: msg.peer.clone(),
                msg_type: msg.msg_type,
                data: b"pong".to_vec(),
            }]
        });
        ln.send_custom_message("02AB", 37913, b"ping".to_vec())
            .await
            .unwrap();
        let reply = inbound.recv().await.unwrap();
        assert_eq!(reply.peer, "02ab");
        assert_eq!(reply.data, b"pong");
        assert_eq!(ln.sent_custom_messages().len(), 1);
    }
}
