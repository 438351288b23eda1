// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::lsps0::{ListProtocolsResult, Lsps0Client};
use super::lsps1::{CreateOrderRequest, Lsps1Client, Lsps1GetInfoResult, Lsps1Order};
use super::lsps2::{self, Lsps2Client, Lsps2GetInfoResult};
use super::lsps5::{ListWebhooksResult, Lsps5Client, Lsps5Notification, SetWebhookResult};
use super::transport::RpcChannel;
use super::webhook::{verify_webhook, WebhookError, WebhookEvent, WebhookEvents};
use super::{acceptor, catalog, demux, JsonRpcMessage, LspsError};
use crate::events::types::{self as names, Event, EventPayload};
use crate::events::EventPublisher;
use crate::jit::{JitChannelSource, JitPurchase};
use crate::ledger::TransactionsService;
use crate::lnclient::{ChannelAcceptor, ConnectPeerRequest, LnClient};
use crate::storage::lsps::{LspRecord, LspStore};
use crate::storage::Db;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(120);
const CATALOG_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);
const PRUNE_INTERVAL: Duration = Duration::from_secs(30);
/// How long a bought JIT channel is expected to be opened by its LSP.
const JIT_OPEN_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);
const CATALOG_STATE_KEY: &str = "catalog";
const WEBHOOK_APP_NAME: &str = "relational-nwc-hub";

#[derive(Debug, Clone)]
pub struct LiquidityConfig {
    /// Base of the LSPS5 webhook URL handed to LSPs.
    pub public_base_url: String,
    /// Community catalog; sync is disabled when unset.
    pub services_url: Option<String>,
    /// Pending LSPS requests older than this are evicted.
    pub pending_max_age: Duration,
    pub request_timeout: Duration,
}

impl LiquidityConfig {
    pub fn new(public_base_url: impl Into<String>) -> Self {
        Self {
            public_base_url: public_base_url.into(),
            services_url: None,
            pending_max_age: Duration::from_secs(300),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Counts a JIT buy as in flight until dropped, including when the buy
/// future is cancelled mid-await.
struct BuyInFlight<'a>(&'a AtomicUsize);

impl<'a> BuyInFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for BuyInFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct LiquidityManager {
    db: Arc<Db>,
    pub(super) client: Arc<dyn LnClient>,
    publisher: Arc<EventPublisher>,
    ledger: Option<Arc<TransactionsService>>,
    config: LiquidityConfig,
    http: reqwest::Client,
    pub(super) lsps0: Lsps0Client,
    pub(super) lsps1: Lsps1Client,
    pub(super) lsps2: Lsps2Client,
    pub(super) lsps5: Lsps5Client,
    webhook_events: WebhookEvents,
    buys_in_flight: AtomicUsize,
    expected_jit: Mutex<HashMap<String, Instant>>,
    pub(super) shutdown: CancellationToken,
}

impl LiquidityManager {
    pub fn new(
        db: Arc<Db>,
        client: Arc<dyn LnClient>,
        publisher: Arc<EventPublisher>,
        ledger: Option<Arc<TransactionsService>>,
        config: LiquidityConfig,
    ) -> Arc<Self> {
        let rpc = RpcChannel::new(client.clone(), config.request_timeout);
        Arc::new(Self {
            db,
            client,
            publisher,
            ledger,
            config,
            http: reqwest::Client::new(),
            lsps0: Lsps0Client::new(rpc.clone()),
            lsps1: Lsps1Client::new(rpc.clone()),
            lsps2: Lsps2Client::new(rpc.clone()),
            lsps5: Lsps5Client::new(rpc),
            webhook_events: WebhookEvents::default(),
            buys_in_flight: AtomicUsize::new(0),
            expected_jit: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Subscribe to custom messages and the channel-accept hook, then spawn
    /// the background loops. Subscriptions are in place when this returns.
    pub async fn start(self: &Arc<Self>) -> Result<(), LspsError> {
        let inbound = self.client.subscribe_custom_messages().await?;
        tokio::spawn(demux::run(self.clone(), inbound));

        match self.client.subscribe_channel_acceptor().await {
            Ok(acceptor) => {
                tokio::spawn(self.clone().run_acceptor(acceptor));
            }
            Err(e) => tracing::warn!(error = %e, "Channel acceptor unavailable, zero-conf disabled"),
        }

        tokio::spawn(self.clone().run_maintenance());
        tokio::spawn(self.clone().run_pruner());
        if self.config.services_url.is_some() {
            tokio::spawn(self.clone().run_catalog_sync());
        }
        tracing::info!("Liquidity manager started");
        Ok(())
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    fn store(&self) -> LspStore<'_> {
        LspStore::new(&self.db)
    }

    fn active_lsp(&self, pubkey: &str) -> Result<LspRecord, LspsError> {
        match self.store().get(pubkey)? {
            Some(lsp) if lsp.is_active => Ok(lsp),
            _ => Err(LspsError::UnknownLsp(pubkey.to_string())),
        }
    }

    // =========================================================================
    // LSPS0 / LSPS1
    // =========================================================================

    pub async fn list_protocols(&self, lsp: &str) -> Result<ListProtocolsResult, LspsError> {
        self.lsps0.list_protocols(lsp).await
    }

    pub async fn lsps1_get_info(&self, lsp: &str) -> Result<Lsps1GetInfoResult, LspsError> {
        self.active_lsp(lsp)?;
        self.lsps1.get_info(lsp).await
    }

    /// Place an LSPS1 order and persist it.
    pub async fn create_order(
        &self,
        lsp: &str,
        request: &CreateOrderRequest,
    ) -> Result<Lsps1Order, LspsError> {
        self.active_lsp(lsp)?;
        let order = self.lsps1.create_order(lsp, request).await?;
        self.store().put_order(&order.to_record(lsp))?;
        tracing::info!(lsp, order_id = %order.order_id, state = %order.order_state, "LSPS1 order created");
        Ok(order)
    }

    /// Fetch an order from its LSP and refresh the stored row.
    pub async fn get_order(&self, lsp: &str, order_id: &str) -> Result<Lsps1Order, LspsError> {
        let order = self.lsps1.get_order(lsp, order_id).await?;
        let mut record = order.to_record(lsp);
        if let Some(existing) = self.store().get_order(order_id)? {
            record.created_at = existing.created_at;
        }
        self.store().put_order(&record)?;
        Ok(order)
    }

    // =========================================================================
    // LSPS2
    // =========================================================================

    pub async fn lsps2_get_info(
        &self,
        lsp: &str,
        token: Option<&str>,
    ) -> Result<Lsps2GetInfoResult, LspsError> {
        self.lsps2.get_info(lsp, token).await
    }

    async fn fetch_and_buy(&self, lsp: &str, payment_size_msat: u64) -> Result<JitPurchase, LspsError> {
        let menu = self.lsps2.get_info(lsp, None).await?;
        let params = lsps2::select_params(&menu.opening_fee_params_menu, payment_size_msat, Utc::now())
            .ok_or(LspsError::NoSuitableParams(payment_size_msat))?;
        let fee_msat = params
            .fee_msat(payment_size_msat)
            .ok_or(LspsError::NoSuitableParams(payment_size_msat))?;
        let bought = self.lsps2.buy(lsp, params, payment_size_msat).await?;
        Ok(JitPurchase {
            lsp_pubkey: lsp.to_lowercase(),
            short_channel_id: lsps2::parse_scid(&bought.jit_channel_scid)?,
            cltv_expiry_delta: bought.lsp_cltv_expiry_delta,
            fee_msat,
        })
    }

    /// Buy a JIT channel from `lsp`, refetching the menu once when the LSP
    /// rejects the promise as stale.
    pub async fn buy_jit_channel_from(
        &self,
        lsp: &str,
        payment_size_msat: u64,
    ) -> Result<JitPurchase, LspsError> {
        self.active_lsp(lsp)?;
        let in_flight = BuyInFlight::enter(&self.buys_in_flight);
        let result = match self.fetch_and_buy(lsp, payment_size_msat).await {
            Err(e) if e.is_stale_promise() => {
                tracing::info!(lsp, error = %e, "Opening fee params rejected, refetching menu");
                self.fetch_and_buy(lsp, payment_size_msat).await
            }
            other => other,
        };
        drop(in_flight);

        let purchase = result?;
        self.expected_jit
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(purchase.lsp_pubkey.clone(), Instant::now());
        tracing::info!(
            lsp,
            scid = %lsps2::format_scid(purchase.short_channel_id),
            fee_msat = purchase.fee_msat,
            "JIT channel purchased"
        );
        self.publisher.publish(Event::new(
            names::LSPS2_JIT_PURCHASED,
            EventPayload::Json(json!({
                "lsp_pubkey": purchase.lsp_pubkey,
                "short_channel_id": purchase.short_channel_id,
                "payment_size_msat": payment_size_msat,
                "fee_msat": purchase.fee_msat,
            })),
        ));
        Ok(purchase)
    }

    /// Whether an inbound channel from `pubkey` should skip confirmations.
    pub fn is_expecting_jit(&self, pubkey: &str) -> bool {
        let key = pubkey.to_lowercase();
        let is_active_lsp = self
            .store()
            .active()
            .map(|lsps| lsps.iter().any(|l| l.pubkey.eq_ignore_ascii_case(&key)))
            .unwrap_or(false);
        if !is_active_lsp {
            return false;
        }
        self.buys_in_flight.load(Ordering::SeqCst) > 0
            || self
                .expected_jit
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .contains_key(&key)
    }

    // =========================================================================
    // LSPS5
    // =========================================================================

    pub fn webhook_url(&self, lsp: &str) -> String {
        format!(
            "{}/api/lsps5/webhook-callback?lsp={}",
            self.config.public_base_url.trim_end_matches('/'),
            lsp.to_lowercase()
        )
    }

    pub async fn register_webhook(&self, lsp: &str) -> Result<SetWebhookResult, LspsError> {
        self.active_lsp(lsp)?;
        let url = self.webhook_url(lsp);
        let result = self.lsps5.set_webhook(lsp, WEBHOOK_APP_NAME, &url).await?;
        tracing::info!(lsp, webhook = %url, num_webhooks = result.num_webhooks, "LSPS5 webhook registered");
        Ok(result)
    }

    pub async fn list_webhooks(&self, lsp: &str) -> Result<ListWebhooksResult, LspsError> {
        self.lsps5.list_webhooks(lsp).await
    }

    pub async fn remove_webhook(&self, lsp: &str) -> Result<(), LspsError> {
        self.lsps5.remove_webhook(lsp, WEBHOOK_APP_NAME).await
    }

    pub fn subscribe_webhook_events(&self) -> mpsc::Receiver<WebhookEvent> {
        self.webhook_events.subscribe()
    }

    /// Verify and dispatch an HTTP webhook delivery. Only an undecodable
    /// delivery or a bad signature is an error; handling failures after
    /// that are logged.
    pub async fn handle_webhook(
        &self,
        lsp: &str,
        order: Option<&str>,
        timestamp: &str,
        signature: &str,
        body: &[u8],
    ) -> Result<(), WebhookError> {
        let body = std::str::from_utf8(body)
            .map_err(|_| WebhookError::Malformed("body is not utf-8".into()))?;
        verify_webhook(lsp, timestamp, signature, body)?;
        let (method, params) = match JsonRpcMessage::decode(body.as_bytes()) {
            Ok(JsonRpcMessage::Notification { method, params }) => (method, params),
            Ok(_) => return Err(WebhookError::Malformed("not a notification".into())),
            Err(e) => return Err(WebhookError::Malformed(e.to_string())),
        };
        let notification = Lsps5Notification::parse(&method, &params)
            .map_err(|e| WebhookError::Malformed(e.to_string()))?;
        if let Err(e) = self
            .handle_lsps5_notification(lsp, order, notification, &method, params)
            .await
        {
            tracing::warn!(lsp, method = %method, error = %e, "LSPS5 webhook handling failed");
        }
        Ok(())
    }

    pub(super) async fn handle_lsps5_notification(
        &self,
        lsp: &str,
        order: Option<&str>,
        notification: Lsps5Notification,
        method: &str,
        params: Value,
    ) -> Result<(), LspsError> {
        tracing::info!(lsp, method, "LSPS5 notification");
        self.publisher.publish(Event::new(
            names::LSPS5_NOTIFICATION,
            EventPayload::Lsps5Notification {
                lsp_pubkey: lsp.to_lowercase(),
                method: method.to_string(),
                params: params.clone(),
            },
        ));

        match notification {
            Lsps5Notification::PaymentIncoming => {
                if let Some(ledger) = &self.ledger {
                    if let Err(e) = ledger.reconcile_pending_incoming().await {
                        tracing::warn!(error = %e, "Wallet sync after payment_incoming failed");
                    }
                }
                match self.store().get(lsp)? {
                    Some(record) => {
                        if let Err(e) = self.connect(&record).await {
                            tracing::warn!(lsp, error = %e, "Reconnect after payment_incoming failed");
                        }
                    }
                    None => tracing::warn!(lsp, "payment_incoming from unknown LSP"),
                }
            }
            Lsps5Notification::OrderStateChanged { order_id, state } => {
                let order_id = order_id
                    .or_else(|| order.map(str::to_string))
                    .ok_or_else(|| LspsError::Malformed("order_state_changed without order id".into()))?;
                match self.store().update_order_state(&order_id, &state)? {
                    Some(updated) => {
                        tracing::info!(order_id = %order_id, state = %updated.state, "LSPS1 order state changed");
                        self.publisher.publish(Event::new(
                            names::LSPS1_ORDER_STATE_CHANGED,
                            EventPayload::Json(json!({
                                "order_id": order_id,
                                "lsp_pubkey": updated.lsp_pubkey,
                                "state": updated.state,
                            })),
                        ));
                    }
                    None => tracing::warn!(order_id = %order_id, "State change for unknown LSPS1 order"),
                }
            }
            _ => self.webhook_events.broadcast(&WebhookEvent {
                lsp_pubkey: lsp.to_lowercase(),
                method: method.to_string(),
                params,
            }),
        }
        Ok(())
    }

    // =========================================================================
    // Catalog and connections
    // =========================================================================

    /// Raw catalog JSON from the last successful sync.
    pub fn catalog(&self) -> Result<Option<Value>, LspsError> {
        match self.store().get_state(CATALOG_STATE_KEY)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every known LSP, user-added and community.
    pub fn lsps(&self) -> Result<Vec<LspRecord>, LspsError> {
        Ok(self.store().list()?)
    }

    /// Upsert the catalog's entries as community LSPs and cache the document.
    pub fn apply_catalog(&self, raw: &Value) -> Result<usize, LspsError> {
        let records = catalog::parse_catalog(raw)?;
        let written = self.store().upsert_community(&records)?;
        self.store()
            .set_state(CATALOG_STATE_KEY, &serde_json::to_vec(raw)?)?;
        Ok(written)
    }

    pub async fn sync_catalog(&self) -> Result<usize, LspsError> {
        let Some(url) = &self.config.services_url else {
            return Ok(0);
        };
        let raw = catalog::fetch_catalog(&self.http, url).await?;
        let written = self.apply_catalog(&raw)?;
        tracing::info!(url = %url, written, "LSP catalog synced");
        Ok(written)
    }

    async fn connect(&self, lsp: &LspRecord) -> Result<(), LspsError> {
        let (address, port) = lsp
            .address()
            .ok_or_else(|| LspsError::Malformed(format!("LSP host {}", lsp.host)))?;
        self.client
            .connect_peer(ConnectPeerRequest {
                pubkey: lsp.pubkey.clone(),
                address,
                port,
            })
            .await?;
        Ok(())
    }

    /// Connect every active LSP that is not a current peer. Returns the
    /// number of connection attempts.
    pub async fn ensure_connected(&self) -> Result<usize, LspsError> {
        let peers: HashSet<String> = self
            .client
            .list_peers()
            .await?
            .into_iter()
            .filter(|p| p.is_connected)
            .map(|p| p.node_id.to_lowercase())
            .collect();
        let missing: Vec<LspRecord> = self
            .store()
            .active()?
            .into_iter()
            .filter(|lsp| !peers.contains(&lsp.pubkey.to_lowercase()))
            .collect();
        for lsp in &missing {
            match self.connect(lsp).await {
                Ok(()) => tracing::info!(lsp = %lsp.pubkey, host = %lsp.host, "Connected to LSP"),
                Err(e) => tracing::warn!(lsp = %lsp.pubkey, error = %e, "Failed to connect to LSP"),
            }
        }
        Ok(missing.len())
    }

    /// Evict stale pending requests and expired JIT expectations.
    pub fn prune_pending(&self) -> usize {
        let max_age = self.config.pending_max_age;
        let evicted = self.lsps0.pending.prune(max_age)
            + self.lsps1.pending.prune(max_age)
            + self.lsps2.pending_get_info.prune(max_age)
            + self.lsps2.pending_buy.prune(max_age)
            + self.lsps5.pending.prune(max_age);
        self.expected_jit
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, at| at.elapsed() < JIT_OPEN_WINDOW);
        evicted
    }

    // =========================================================================
    // Loops
    // =========================================================================

    async fn run_acceptor(self: Arc<Self>, mut acceptor: ChannelAcceptor) {
        loop {
            let request = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                request = acceptor.requests.recv() => match request {
                    Some(request) => request,
                    None => {
                        tracing::warn!("Channel acceptor stream closed");
                        break;
                    }
                },
            };
            let expecting = self.is_expecting_jit(&request.node_pubkey);
            let decision = acceptor::decide(&request, expecting);
            if decision.zero_conf {
                self.expected_jit
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&request.node_pubkey.to_lowercase());
            }
            tracing::info!(
                peer = %request.node_pubkey,
                funding_sat = request.funding_amount_sat,
                zero_conf = decision.zero_conf,
                "Inbound channel accepted"
            );
            if acceptor.responses.send(decision).await.is_err() {
                tracing::warn!("Channel acceptor response channel closed");
                break;
            }
        }
        tracing::info!("Channel acceptor stopped");
    }

    async fn run_maintenance(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.ensure_connected().await {
                        tracing::warn!(error = %e, "LSP connection maintenance failed");
                    }
                }
            }
        }
        tracing::info!("LSP connection maintenance stopped");
    }

    async fn run_pruner(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let evicted = self.prune_pending();
                    if evicted > 0 {
                        tracing::info!(evicted, "Pruned stale LSPS requests");
                    }
                }
            }
        }
    }

    async fn run_catalog_sync(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(CATALOG_INTERVAL);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sync_catalog().await {
                        tracing::warn!(error = %e, "LSP catalog sync failed");
                    }
                }
            }
        }
        tracing::info!("LSP catalog sync stopped");
    }
}

#[async_trait]
impl JitChannelSource for LiquidityManager {
    async fn buy_jit_channel(&self, payment_size_msat: u64) -> Result<JitPurchase, String> {
        let lsps = self.store().active().map_err(|e| e.to_string())?;
        let lsp = lsps.first().ok_or_else(|| LspsError::NoActiveLsp.to_string())?;
        self.buy_jit_channel_from(&lsp.pubkey, payment_size_msat)
            .await
            .map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lnclient::memory::MemoryLnClient;
    use crate::lnclient::{ChannelAcceptRequest, CustomMessage};
    use crate::lsps::lsps2::testing::params;
    use crate::lsps::webhook::testing::{lsp_key, pubkey_hex, sign};
    use crate::lsps::LSPS_MESSAGE_TYPE;
    use crate::storage::lsps::{Lsps1OrderRecord, LspOrigin};
    use crate::storage::temp_db;
    use bitcoin::secp256k1::SecretKey;
    use std::sync::atomic::AtomicBool;

    struct Fixture {
        manager: Arc<LiquidityManager>,
        ln: Arc<MemoryLnClient>,
        db: Arc<Db>,
        lsp: String,
        _dir: tempfile::TempDir,
    }

    fn reply(to: &CustomMessage, id: String, result: Result<Value, crate::lsps::RpcError>) -> Vec<CustomMessage> {
        let data = JsonRpcMessage::Response { id, result }.encode().unwrap();
        vec![CustomMessage {
            peer: to.peer.clone(),
            msg_type: LSPS_MESSAGE_TYPE,
            data,
        }]
    }

    /// Manager against an in-memory node whose LSP peer rejects the first
    /// `lsps2.buy` with `reject_code`, when set.
    async fn fixture(reject_code: Option<i64>) -> Fixture {
        let (db, dir) = temp_db();
        let ln = Arc::new(MemoryLnClient::new(SecretKey::from_slice(&[21u8; 32]).unwrap()));
        let lsp = pubkey_hex(&lsp_key(7));
        LspStore::new(&db)
            .put(&LspRecord::new(&lsp, "lsp.example:9735", "Example", LspOrigin::User))
            .unwrap();

        let rejected = AtomicBool::new(reject_code.is_none());
        ln.set_custom_message_responder(move |msg| {
            let JsonRpcMessage::Request { id, method, .. } = JsonRpcMessage::decode(&msg.data).unwrap()
            else {
                return Vec::new();
            };
            let until = Utc::now() + chrono::Duration::hours(1);
            match method.as_str() {
                "lsps0.list_protocols" => reply(msg, id, Ok(json!({"protocols": [1, 2, 5]}))),
                "lsps2.get_info" => reply(
                    msg,
                    id,
                    Ok(json!({"opening_fee_params_menu": [params(2_000, 1_000, until)]})),
                ),
                "lsps2.buy" if !rejected.swap(true, Ordering::SeqCst) => reply(
                    msg,
                    id,
                    Err(crate::lsps::RpcError {
                        code: reject_code.unwrap_or_default(),
                        message: "invalid_opening_fee_params".into(),
                        data: None,
                    }),
                ),
                "lsps2.buy" => reply(
                    msg,
                    id,
                    Ok(json!({"jit_channel_scid": "800000x1x1", "lsp_cltv_expiry_delta": 144})),
                ),
                "lsps5.set_webhook" => reply(msg, id, Ok(json!({"num_webhooks": 1, "max_webhooks": 5}))),
                _ => Vec::new(),
            }
        });

        let bus = Arc::new(EventPublisher::new());
        let mut config = LiquidityConfig::new("https://hub.example/");
        config.request_timeout = Duration::from_secs(5);
        let manager = LiquidityManager::new(db.clone(), ln.clone(), bus, None, config);
        manager.start().await.unwrap();
        Fixture {
            manager,
            ln,
            db,
            lsp,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn stale_promise_is_retried_once_with_a_fresh_menu() {
        for code in [lsps2::ERROR_INVALID_PARAMS, lsps2::ERROR_LEGACY_EXPIRED_PROMISE] {
            let f = fixture(Some(code)).await;
            let purchase = f.manager.buy_jit_channel(1_000_000).await.unwrap();
            assert_eq!(purchase.short_channel_id, 879_609_302_220_865_537);
            assert_eq!(purchase.cltv_expiry_delta, 144);
            assert_eq!(purchase.fee_msat, 2_000);
            assert_eq!(purchase.lsp_pubkey, f.lsp);

            let methods: Vec<String> = f
                .ln
                .sent_custom_messages()
                .iter()
                .filter_map(|m| match JsonRpcMessage::decode(&m.data) {
                    Ok(JsonRpcMessage::Request { method, .. }) => Some(method),
                    _ => None,
                })
                .collect();
            assert_eq!(methods, ["lsps2.get_info", "lsps2.buy", "lsps2.get_info", "lsps2.buy"]);
            assert_eq!(f.manager.lsps2.pending_buy.len(), 0);
            f.manager.stop();
        }
    }

    #[tokio::test]
    async fn bought_channel_is_accepted_zero_conf() {
        let f = fixture(None).await;
        let stranger = ChannelAcceptRequest {
            id: 1,
            node_pubkey: "02".to_string() + &"ab".repeat(32),
            funding_amount_sat: 50_000,
            wants_zero_conf: true,
        };
        let from_lsp = ChannelAcceptRequest {
            id: 2,
            node_pubkey: f.lsp.to_uppercase(),
            funding_amount_sat: 50_000,
            wants_zero_conf: true,
        };

        let before = f.ln.request_channel_accept(from_lsp.clone()).await.unwrap();
        assert!(!before.zero_conf);

        f.manager.buy_jit_channel(1_000_000).await.unwrap();
        let other = f.ln.request_channel_accept(stranger).await.unwrap();
        assert_eq!((other.accept, other.min_accept_depth, other.zero_conf), (true, 1, false));
        let jit = f.ln.request_channel_accept(from_lsp).await.unwrap();
        assert_eq!((jit.id, jit.accept, jit.min_accept_depth, jit.zero_conf), (2, true, 0, true));
        f.manager.stop();
    }

    #[tokio::test]
    async fn cancelled_buy_does_not_leave_zero_conf_open() {
        let f = fixture(None).await;
        f.ln.set_custom_message_responder(|msg| {
            let Ok(JsonRpcMessage::Request { id, method, .. }) = JsonRpcMessage::decode(&msg.data) else {
                return Vec::new();
            };
            let until = Utc::now() + chrono::Duration::hours(1);
            match method.as_str() {
                "lsps2.get_info" => reply(
                    msg,
                    id,
                    Ok(json!({"opening_fee_params_menu": [params(2_000, 1_000, until)]})),
                ),
                _ => Vec::new(),
            }
        });

        let cancelled =
            tokio::time::timeout(Duration::from_millis(100), f.manager.buy_jit_channel(1_000_000)).await;
        assert!(cancelled.is_err());
        assert_eq!(f.manager.buys_in_flight.load(Ordering::SeqCst), 0);

        let decision = f
            .ln
            .request_channel_accept(ChannelAcceptRequest {
                id: 1,
                node_pubkey: f.lsp.clone(),
                funding_amount_sat: 50_000,
                wants_zero_conf: true,
            })
            .await
            .unwrap();
        assert!(!decision.zero_conf);
        assert_eq!(decision.min_accept_depth, 1);
        f.manager.stop();
    }

    #[tokio::test]
    async fn unclaimed_responses_are_dropped() {
        let f = fixture(None).await;
        f.ln.inject_custom_message(CustomMessage {
            peer: f.lsp.clone(),
            msg_type: LSPS_MESSAGE_TYPE,
            data: br#"{"jsonrpc":"2.0","id":"nobody","result":{}}"#.to_vec(),
        });
        let protocols = f.manager.list_protocols(&f.lsp).await.unwrap();
        assert_eq!(protocols.protocols, vec![1, 2, 5]);
        f.manager.stop();
    }

    #[tokio::test]
    async fn webhook_registration_points_at_the_callback() {
        let f = fixture(None).await;
        f.manager.register_webhook(&f.lsp).await.unwrap();
        let sent = f.ln.sent_custom_messages();
        let Ok(JsonRpcMessage::Request { params, .. }) = JsonRpcMessage::decode(&sent[0].data) else {
            panic!("not a request");
        };
        assert_eq!(
            params["webhook"],
            format!("https://hub.example/api/lsps5/webhook-callback?lsp={}", f.lsp)
        );
        f.manager.stop();
    }

    fn order(id: &str, lsp: &str) -> Lsps1OrderRecord {
        let now = Utc::now();
        Lsps1OrderRecord {
            order_id: id.into(),
            lsp_pubkey: lsp.into(),
            state: "CREATED".into(),
            payment_invoice: None,
            fee_total_sat: 1,
            order_total_sat: 2,
            lsp_balance_sat: 100_000,
            client_balance_sat: 0,
            created_at: now,
            updated_at: now,
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn webhook_from_another_key_is_rejected_and_changes_nothing() {
        let f = fixture(None).await;
        LspStore::new(&f.db).put_order(&order("o1", &f.lsp)).unwrap();
        let body = r#"{"jsonrpc":"2.0","method":"lsps5.order_state_changed","params":{"order_id":"o1","order_state":"COMPLETED"}}"#;
        let ts = "2026-05-04T10:52:58.395Z";

        let forged = sign(&lsp_key(9), ts, body);
        let result = f
            .manager
            .handle_webhook(&f.lsp, None, ts, &forged, body.as_bytes())
            .await;
        assert_eq!(result, Err(WebhookError::SignatureMismatch));
        assert_eq!(LspStore::new(&f.db).get_order("o1").unwrap().unwrap().state, "CREATED");

        let genuine = sign(&lsp_key(7), ts, body);
        f.manager
            .handle_webhook(&f.lsp, None, ts, &genuine, body.as_bytes())
            .await
            .unwrap();
        assert_eq!(LspStore::new(&f.db).get_order("o1").unwrap().unwrap().state, "COMPLETED");
        f.manager.stop();
    }

    #[tokio::test]
    async fn other_notifications_reach_sse_listeners() {
        let f = fixture(None).await;
        let mut events = f.manager.subscribe_webhook_events();
        let body = r#"{"jsonrpc":"2.0","method":"lsps5.expiry_soon","params":{"timeout":720000}}"#;
        let ts = "2026-05-04T10:52:58.395Z";
        let signature = sign(&lsp_key(7), ts, body);
        f.manager
            .handle_webhook(&f.lsp, None, ts, &signature, body.as_bytes())
            .await
            .unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event.method, "lsps5.expiry_soon");
        assert_eq!(event.params["timeout"], 720_000);
        f.manager.stop();
    }

    #[tokio::test]
    async fn signed_unknown_notifications_are_accepted_and_forwarded() {
        let f = fixture(None).await;
        let mut events = f.manager.subscribe_webhook_events();
        let ts = "2026-05-04T10:52:58.395Z";
        let deliver = |body: &'static str| {
            let signature = sign(&lsp_key(7), ts, body);
            let manager = f.manager.clone();
            let lsp = f.lsp.clone();
            async move {
                manager
                    .handle_webhook(&lsp, None, ts, &signature, body.as_bytes())
                    .await
            }
        };

        let future = r#"{"jsonrpc":"2.0","method":"lsps5.some_future_notification","params":{"x":1}}"#;
        assert_eq!(deliver(future).await, Ok(()));
        let event = events.recv().await.unwrap();
        assert_eq!(event.method, "lsps5.some_future_notification");
        assert_eq!(event.params["x"], 1);

        // No order id in params or query: logged, still a success.
        let orphan = r#"{"jsonrpc":"2.0","method":"lsps5.order_state_changed","params":{"order_state":"FAILED"}}"#;
        assert_eq!(deliver(orphan).await, Ok(()));

        let not_rpc = r#"{"hello":"world"}"#;
        assert!(matches!(deliver(not_rpc).await, Err(WebhookError::Malformed(_))));
        f.manager.stop();
    }

    #[tokio::test]
    async fn maintenance_connects_missing_lsps_once() {
        let f = fixture(None).await;
        assert_eq!(f.manager.ensure_connected().await.unwrap(), 1);
        assert_eq!(f.manager.ensure_connected().await.unwrap(), 0);
        let peers = f.ln.list_peers().await.unwrap();
        assert!(peers.iter().any(|p| p.node_id == f.lsp));
        f.manager.stop();
    }

    #[tokio::test]
    async fn applied_catalog_is_cached_and_upserted() {
        let f = fixture(None).await;
        assert!(f.manager.catalog().unwrap().is_none());
        let raw = json!({"lsps": [{"pubkey": "02cc", "host": "cat.example:9735", "name": "Cat"}]});
        assert_eq!(f.manager.apply_catalog(&raw).unwrap(), 1);
        assert_eq!(f.manager.catalog().unwrap(), Some(raw));
        assert_eq!(LspStore::new(&f.db).active().unwrap().len(), 2);
        f.manager.stop();
    }
}
