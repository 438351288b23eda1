// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Startup Orchestrator
//!
//! [`Gateway::start`] brings the node up in a fixed order:
//!
//! 1. unlock the vault (initialising it on first start) and derive the JWT secret
//! 2. derive the key store
//! 3. build the Lightning backend, retried 5 times 2 s apart
//! 4. verify it with `get_info`, 3 attempts of 10 s each
//! 5. wire ledger, permissions, apps, liquidity, JIT weaver and NWC router
//! 6. publish `nwc_node_started`
//! 7. publish every app's info event
//! 8. start the relay session, liquidity manager and reconciliation loops
//! 9. stamp `NodeLastStartTime`
//!
//! Any failure undoes the partial start and publishes `nwc_node_start_failed`.
//! Start, stop and router resets are serialised by one mutex; `stop` on a
//! stopped gateway is a no-op.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::apps::{AppError, AppsService};
use crate::config::GatewayConfig;
use crate::events::types::{self as names, Event, EventPayload};
use crate::events::{EventPublisher, SubscriberId};
use crate::jit::JitWeaver;
use crate::keys::{KeyError, KeyStore};
use crate::ledger::{LedgerEventConsumer, TransactionsService};
use crate::lnclient::memory::MemoryLnClient;
use crate::lnclient::onchain_cache::OnchainTxCache;
use crate::lnclient::{subscriptions, LnClient, LnClientError, LnResult, NodeInfo};
use crate::lsps::{LiquidityConfig, LiquidityManager, LspsError};
use crate::nostr::info::{InfoError, InfoPublisher};
use crate::nostr::notifications::NotificationPublisher;
use crate::nostr::session::AppLifecycleListener;
use crate::nostr::{NostrSdkTransport, RelaySession, RelayTransport, TransportError};
use crate::nwc::NwcRouter;
use crate::permissions::PermissionsService;
use crate::storage::config::{keys, ConfigStore};
use crate::storage::{Db, DbError};
use crate::vault::{Vault, VaultError};
use crate::workers;

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("node is already running")]
    AlreadyRunning,

    #[error("node is not running")]
    NotRunning,

    #[error("startup cancelled")]
    Cancelled,

    #[error("backend did not answer get_info after {0} attempts")]
    Verification(u32),

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Keys(#[from] KeyError),

    #[error("backend: {0}")]
    Backend(#[from] LnClientError),

    #[error("relays: {0}")]
    Relays(#[from] TransportError),

    #[error(transparent)]
    Info(#[from] InfoError),

    #[error(transparent)]
    Apps(#[from] AppError),

    #[error(transparent)]
    Liquidity(#[from] LspsError),

    #[error(transparent)]
    Db(#[from] DbError),
}

/// Retry budget for backend construction and verification.
#[derive(Debug, Clone, Copy)]
pub struct StartupPolicy {
    pub connect_attempts: u32,
    pub connect_delay: Duration,
    pub verify_attempts: u32,
    pub verify_timeout: Duration,
}

impl Default for StartupPolicy {
    fn default() -> Self {
        Self {
            connect_attempts: 5,
            connect_delay: Duration::from_secs(2),
            verify_attempts: 3,
            verify_timeout: Duration::from_secs(10),
        }
    }
}

/// Builds the external adapters for a start.
#[async_trait]
pub trait Backends: Send + Sync {
    async fn lightning(&self, keys: &KeyStore) -> LnResult<Arc<dyn LnClient>>;

    async fn relays(&self, urls: &[String]) -> Result<Arc<dyn RelayTransport>, TransportError>;
}

/// Development backends: one shared in-memory node and a real relay pool.
pub struct DevBackends {
    node: Arc<MemoryLnClient>,
}

impl DevBackends {
    pub fn new() -> LnResult<Self> {
        Ok(Self {
            node: Arc::new(MemoryLnClient::random()?),
        })
    }
}

#[async_trait]
impl Backends for DevBackends {
    async fn lightning(&self, _keys: &KeyStore) -> LnResult<Arc<dyn LnClient>> {
        Ok(self.node.clone())
    }

    async fn relays(&self, urls: &[String]) -> Result<Arc<dyn RelayTransport>, TransportError> {
        Ok(Arc::new(NostrSdkTransport::connect(urls).await?))
    }
}

/// Everything that exists while the node runs.
pub struct Running {
    pub keys: Arc<KeyStore>,
    pub client: Arc<dyn LnClient>,
    pub node_info: NodeInfo,
    pub ledger: Arc<TransactionsService>,
    pub permissions: Arc<PermissionsService>,
    pub apps: Arc<AppsService>,
    pub liquidity: Arc<LiquidityManager>,
    pub router: Arc<NwcRouter>,
    pub session: Arc<RelaySession>,
    pub onchain: Arc<OnchainTxCache>,
    jwt_secret: String,
    shutdown: CancellationToken,
    subscribers: Vec<SubscriberId>,
    tasks: Vec<JoinHandle<()>>,
}

impl Running {
    pub fn jwt_secret(&self) -> &str {
        &self.jwt_secret
    }
}

/// Pieces a start has created so far, torn down if a later step fails.
struct Partial {
    shutdown: CancellationToken,
    subscribers: Vec<SubscriberId>,
    tasks: Vec<JoinHandle<()>>,
    client: Option<Arc<dyn LnClient>>,
    session: Option<Arc<RelaySession>>,
    liquidity: Option<Arc<LiquidityManager>>,
}

impl Partial {
    fn new(shutdown: CancellationToken) -> Self {
        Self {
            shutdown,
            subscribers: Vec::new(),
            tasks: Vec::new(),
            client: None,
            session: None,
            liquidity: None,
        }
    }

    async fn abort(self, publisher: &EventPublisher) {
        self.shutdown.cancel();
        if let Some(liquidity) = &self.liquidity {
            liquidity.stop();
        }
        if let Some(session) = &self.session {
            session.stop().await;
        }
        for id in self.subscribers {
            publisher.remove(id);
        }
        if let Some(client) = &self.client {
            if let Err(e) = client.shutdown().await {
                tracing::warn!(error = %e, "Backend shutdown failed");
            }
        }
    }
}

pub struct Gateway {
    config: GatewayConfig,
    db: Arc<Db>,
    vault: Arc<Vault>,
    publisher: Arc<EventPublisher>,
    backends: Arc<dyn Backends>,
    policy: StartupPolicy,
    start_lock: tokio::sync::Mutex<()>,
    running: RwLock<Option<Arc<Running>>>,
    /// Process-wide; cancels an in-flight start on shutdown.
    cancel: CancellationToken,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        db: Arc<Db>,
        vault: Arc<Vault>,
        publisher: Arc<EventPublisher>,
        backends: Arc<dyn Backends>,
    ) -> Self {
        Self {
            config,
            db,
            vault,
            publisher,
            backends,
            policy: StartupPolicy::default(),
            start_lock: tokio::sync::Mutex::new(()),
            running: RwLock::new(None),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_policy(mut self, policy: StartupPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn db(&self) -> &Arc<Db> {
        &self.db
    }

    pub fn vault(&self) -> &Arc<Vault> {
        &self.vault
    }

    pub fn publisher(&self) -> &Arc<EventPublisher> {
        &self.publisher
    }

    /// Services of the running node, if it is running.
    pub fn running(&self) -> Option<Arc<Running>> {
        self.running
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub async fn start(&self, password: &str) -> Result<(), StartupError> {
        let _guard = self.start_lock.lock().await;
        if self.running().is_some() {
            return Err(StartupError::AlreadyRunning);
        }

        let mut partial = Partial::new(self.cancel.child_token());
        match self.launch(password, &mut partial).await {
            Ok(running) => {
                *self.running.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(running));
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Node start failed");
                partial.abort(&self.publisher).await;
                self.publisher.publish(Event::new(
                    names::NODE_START_FAILED,
                    EventPayload::Json(json!({ "error": e.to_string() })),
                ));
                Err(e)
            }
        }
    }

    async fn launch(&self, password: &str, partial: &mut Partial) -> Result<Running, StartupError> {
        if !self.vault.is_set_up()? {
            self.vault.setup(password, None)?;
        }
        let mnemonic = self.vault.unlock(password)?;
        let jwt_secret = self.vault.jwt_secret(password)?;
        let keys = Arc::new(KeyStore::from_mnemonic(&mnemonic)?);
        tracing::info!(node_pubkey = %keys.node_pubkey_hex(), "Keys unlocked");

        let client = self.connect_backend(&keys).await?;
        partial.client = Some(client.clone());
        let node_info = self.verify_backend(client.as_ref()).await?;
        self.publisher.set_global_property("node_pubkey", node_info.pubkey.clone());
        self.publisher.set_global_property("network", node_info.network.clone());

        let transport = self.backends.relays(&self.config.relays).await?;
        let ledger = Arc::new(TransactionsService::new(
            self.db.clone(),
            client.clone(),
            self.publisher.clone(),
        ));
        let permissions = Arc::new(PermissionsService::new(self.db.clone()));
        let apps = Arc::new(AppsService::new(
            self.db.clone(),
            keys.clone(),
            self.vault.clone(),
            self.publisher.clone(),
            self.config.relays.clone(),
            self.config.lud16.clone(),
        ));

        let mut liquidity_config = LiquidityConfig::new(self.config.public_base_url.clone());
        liquidity_config.services_url = self.config.lsps_services_url.clone();
        liquidity_config.pending_max_age = self.config.lsps_pending_max_age;
        let liquidity = LiquidityManager::new(
            self.db.clone(),
            client.clone(),
            self.publisher.clone(),
            Some(ledger.clone()),
            liquidity_config,
        );
        let jit = Arc::new(JitWeaver::new(
            client.clone(),
            liquidity.clone(),
            self.config.jit_enabled,
        ));
        let router = Arc::new(NwcRouter::new(
            self.db.clone(),
            transport.clone(),
            apps.clone(),
            permissions.clone(),
            ledger.clone(),
            Some(jit),
            self.publisher.clone(),
        ));
        let info = Arc::new(InfoPublisher::new(
            transport.clone(),
            apps.clone(),
            permissions.clone(),
        ));
        let session = RelaySession::new(transport.clone(), apps.clone(), info.clone(), router.clone());
        partial.session = Some(session.clone());

        partial
            .subscribers
            .push(self.publisher.register(Arc::new(LedgerEventConsumer::new(&ledger))));
        partial
            .subscribers
            .push(self.publisher.register(Arc::new(NotificationPublisher::new(
                transport.clone(),
                apps.clone(),
                permissions.clone(),
            ))));
        partial
            .subscribers
            .push(self.publisher.register(Arc::new(AppLifecycleListener::new(&session))));

        let onchain = Arc::new(OnchainTxCache::new(client.clone()));
        partial.tasks.extend(subscriptions::spawn_all(
            client.clone(),
            self.publisher.clone(),
            onchain.clone(),
            partial.shutdown.clone(),
        ));

        self.publisher.publish(Event::new(
            names::NODE_STARTED,
            EventPayload::Json(json!({
                "node_pubkey": node_info.pubkey,
                "network": node_info.network,
            })),
        ));

        info.publish_all().await?;
        session.start().await?;

        partial.liquidity = Some(liquidity.clone());
        liquidity.start().await?;

        partial.tasks.extend(workers::spawn_all(
            self.db.clone(),
            client.clone(),
            ledger.clone(),
            partial.shutdown.clone(),
        ));

        ConfigStore::new(&self.db).set(
            keys::NODE_LAST_START_TIME,
            &Utc::now().timestamp().to_string(),
        )?;
        tracing::info!(
            alias = %node_info.alias,
            network = %node_info.network,
            relays = self.config.relays.len(),
            "Node started"
        );

        Ok(Running {
            keys,
            client,
            node_info,
            ledger,
            permissions,
            apps,
            liquidity,
            router,
            session,
            onchain,
            jwt_secret,
            shutdown: partial.shutdown.clone(),
            subscribers: std::mem::take(&mut partial.subscribers),
            tasks: std::mem::take(&mut partial.tasks),
        })
    }

    async fn connect_backend(&self, keys: &KeyStore) -> Result<Arc<dyn LnClient>, StartupError> {
        let attempts = self.policy.connect_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.backends.lightning(keys).await {
                Ok(client) => return Ok(client),
                Err(e) if attempt >= attempts => return Err(e.into()),
                Err(e) => {
                    tracing::warn!(attempt, attempts, error = %e, "Backend construction failed, retrying");
                }
            }
            attempt += 1;
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(StartupError::Cancelled),
                _ = tokio::time::sleep(self.policy.connect_delay) => {}
            }
        }
    }

    async fn verify_backend(&self, client: &dyn LnClient) -> Result<NodeInfo, StartupError> {
        let attempts = self.policy.verify_attempts.max(1);
        for attempt in 1..=attempts {
            let result = tokio::select! {
                _ = self.cancel.cancelled() => return Err(StartupError::Cancelled),
                r = tokio::time::timeout(self.policy.verify_timeout, client.get_info()) => r,
            };
            match result {
                Ok(Ok(info)) => return Ok(info),
                Ok(Err(e)) => tracing::warn!(attempt, error = %e, "Backend verification failed"),
                Err(_) => tracing::warn!(attempt, "Backend verification timed out"),
            }
        }
        Err(StartupError::Verification(attempts))
    }

    /// Stop the node. Returns `false` when it was not running.
    pub async fn stop(&self) -> bool {
        let _guard = self.start_lock.lock().await;
        let Some(running) = self
            .running
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            return false;
        };

        running.shutdown.cancel();
        running.liquidity.stop();
        running.session.stop().await;
        for id in &running.subscribers {
            self.publisher.remove(*id);
        }
        if let Err(e) = running.client.shutdown().await {
            tracing::warn!(error = %e, "Backend shutdown failed");
        }
        for task in &running.tasks {
            task.abort();
        }
        self.publisher.publish(Event::named(names::NODE_STOPPED));
        tracing::info!("Node stopped");
        true
    }

    /// Reset the backend's routing state.
    pub async fn reset_router(&self, key: Option<&str>) -> Result<(), StartupError> {
        let _guard = self.start_lock.lock().await;
        let running = self.running().ok_or(StartupError::NotRunning)?;
        running.client.reset_router(key).await?;
        Ok(())
    }

    /// Cancel any in-flight start and stop the node.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.stop().await;
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::nostr::memory::MemoryRelay;
    use bitcoin::secp256k1::SecretKey;
    use std::sync::atomic::{AtomicU32, Ordering};

    pub const RELAY: &str = "wss://relay.test";

    /// In-memory node and relay; the node fails its first `failures` builds.
    pub struct TestBackends {
        pub ln: Arc<MemoryLnClient>,
        pub relay: Arc<MemoryRelay>,
        pub failures: AtomicU32,
        pub builds: AtomicU32,
    }

    impl TestBackends {
        pub fn new(failures: u32) -> Self {
            Self {
                ln: Arc::new(MemoryLnClient::new(SecretKey::from_slice(&[31u8; 32]).unwrap())),
                relay: Arc::new(MemoryRelay::new(&[RELAY])),
                failures: AtomicU32::new(failures),
                builds: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Backends for TestBackends {
        async fn lightning(&self, _keys: &KeyStore) -> LnResult<Arc<dyn LnClient>> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(LnClientError::Backend("node not reachable".into()));
            }
            Ok(self.ln.clone())
        }

        async fn relays(&self, _urls: &[String]) -> Result<Arc<dyn RelayTransport>, TransportError> {
            Ok(self.relay.clone())
        }
    }

    pub fn fast_policy() -> StartupPolicy {
        StartupPolicy {
            connect_attempts: 5,
            connect_delay: Duration::from_millis(10),
            verify_attempts: 3,
            verify_timeout: Duration::from_secs(1),
        }
    }

    pub fn test_gateway(backends: Arc<TestBackends>) -> (Gateway, tempfile::TempDir) {
        let (db, dir) = crate::storage::temp_db();
        let mut config = GatewayConfig::with_data_dir(dir.path());
        config.relays = vec![RELAY.to_string()];
        let vault = Arc::new(Vault::with_cost(db.clone(), 4));
        let gateway = Gateway::new(config, db, vault, Arc::new(EventPublisher::new()), backends)
            .with_policy(fast_policy());
        (gateway, dir)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::apps::testing::{MNEMONIC, PASSWORD};
    use crate::events::testing::RecordingSubscriber;
    use crate::ledger::testing::wait_for;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn start_and_stop_are_symmetric() {
        let backends = Arc::new(TestBackends::new(0));
        let (gateway, _dir) = test_gateway(backends.clone());
        gateway.vault().setup(PASSWORD, Some(MNEMONIC)).unwrap();
        let recorder = Arc::new(RecordingSubscriber::default());
        gateway.publisher().register(recorder.clone());

        gateway.start(PASSWORD).await.unwrap();
        let running = gateway.running().unwrap();
        assert_eq!(running.node_info.pubkey, backends.ln.node_pubkey());
        assert!(!running.jwt_secret().is_empty());
        assert!(ConfigStore::new(gateway.db())
            .get(keys::NODE_LAST_START_TIME)
            .unwrap()
            .is_some());
        assert!(matches!(gateway.start(PASSWORD).await, Err(StartupError::AlreadyRunning)));
        assert!(wait_for(&recorder, names::NODE_STARTED).await.contains(&names::NODE_STARTED.to_string()));

        assert!(gateway.stop().await);
        assert!(gateway.running().is_none());
        assert!(!gateway.stop().await);
        let seen = wait_for(&recorder, names::NODE_STOPPED).await;
        assert_eq!(seen.iter().filter(|n| *n == names::NODE_STOPPED).count(), 1);

        gateway.start(PASSWORD).await.unwrap();
        assert!(gateway.stop().await);
    }

    #[tokio::test]
    async fn wrong_password_fails_the_start() {
        let (gateway, _dir) = test_gateway(Arc::new(TestBackends::new(0)));
        gateway.vault().setup(PASSWORD, Some(MNEMONIC)).unwrap();
        let recorder = Arc::new(RecordingSubscriber::default());
        gateway.publisher().register(recorder.clone());

        let err = gateway.start("wrong").await.unwrap_err();
        assert!(matches!(err, StartupError::Vault(VaultError::InvalidPassword)));
        assert!(gateway.running().is_none());
        let seen = wait_for(&recorder, names::NODE_START_FAILED).await;
        assert!(seen.contains(&names::NODE_START_FAILED.to_string()));
        assert!(!seen.contains(&names::NODE_STARTED.to_string()));
    }

    #[tokio::test]
    async fn first_start_initialises_the_vault() {
        let (gateway, _dir) = test_gateway(Arc::new(TestBackends::new(0)));
        assert!(!gateway.vault().is_set_up().unwrap());
        gateway.start(PASSWORD).await.unwrap();
        assert!(gateway.vault().check_unlock_password(PASSWORD));
        gateway.stop().await;
    }

    #[tokio::test]
    async fn backend_construction_is_retried() {
        let backends = Arc::new(TestBackends::new(3));
        let (gateway, _dir) = test_gateway(backends.clone());
        gateway.start(PASSWORD).await.unwrap();
        assert_eq!(backends.builds.load(Ordering::SeqCst), 4);
        gateway.stop().await;

        let backends = Arc::new(TestBackends::new(10));
        let (gateway, _dir) = test_gateway(backends.clone());
        let err = gateway.start(PASSWORD).await.unwrap_err();
        assert!(matches!(err, StartupError::Backend(_)));
        assert_eq!(backends.builds.load(Ordering::SeqCst), 5);
        assert!(gateway.running().is_none());
    }

    #[tokio::test]
    async fn shutdown_cancels_a_pending_start() {
        let backends = Arc::new(TestBackends::new(10));
        let (gateway, _dir) = test_gateway(backends);
        let gateway = Arc::new(gateway.with_policy(StartupPolicy {
            connect_delay: Duration::from_secs(30),
            ..fast_policy()
        }));
        let starting = tokio::spawn({
            let gateway = gateway.clone();
            async move { gateway.start(PASSWORD).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        gateway.cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), starting)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(StartupError::Cancelled)));
    }
}
