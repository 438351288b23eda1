// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Request/response plumbing over custom peer messages.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;

use super::jsonrpc::{new_request_id, JsonRpcMessage, RpcError, LSPS_MESSAGE_TYPE};
use super::LspsError;
use crate::lnclient::LnClient;

type Reply = Result<Value, RpcError>;

pub(crate) struct Pending {
    pub method: &'static str,
    pub created_at: Instant,
    reply: oneshot::Sender<Reply>,
}

impl Pending {
    pub fn resolve(self, reply: Reply) {
        // The caller may have timed out already.
        let _ = self.reply.send(reply);
    }
}

/// Outstanding requests of one protocol client, per peer.
pub(crate) struct PendingRequests {
    name: &'static str,
    peers: Mutex<HashMap<String, HashMap<String, Pending>>>,
}

impl PendingRequests {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            peers: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, HashMap<String, Pending>>> {
        self.peers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn insert(&self, peer: &str, id: &str, method: &'static str) -> oneshot::Receiver<Reply> {
        let (reply, rx) = oneshot::channel();
        self.lock().entry(peer.to_lowercase()).or_default().insert(
            id.to_string(),
            Pending {
                method,
                created_at: Instant::now(),
                reply,
            },
        );
        rx
    }

    /// Remove and return the entry for `id`, if this client issued it.
    pub fn claim(&self, peer: &str, id: &str) -> Option<Pending> {
        let mut peers = self.lock();
        let key = peer.to_lowercase();
        let requests = peers.get_mut(&key)?;
        let pending = requests.remove(id);
        if requests.is_empty() {
            peers.remove(&key);
        }
        pending
    }

    /// Evict entries older than `max_age`; their callers see the request as dropped.
    pub fn prune(&self, max_age: Duration) -> usize {
        let mut peers = self.lock();
        let mut evicted = 0;
        for requests in peers.values_mut() {
            let before = requests.len();
            requests.retain(|_, p| p.created_at.elapsed() < max_age);
            evicted += before - requests.len();
        }
        peers.retain(|_, requests| !requests.is_empty());
        evicted
    }

    pub fn len(&self) -> usize {
        self.lock().values().map(HashMap::len).sum()
    }
}

/// Sends LSPS requests to peers and waits for the demuxed response.
#[derive(Clone)]
pub(crate) struct RpcChannel {
    client: Arc<dyn LnClient>,
    timeout: Duration,
}

impl RpcChannel {
    pub fn new(client: Arc<dyn LnClient>, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    pub async fn call<P, R>(
        &self,
        pending: &PendingRequests,
        peer: &str,
        method: &'static str,
        params: &P,
    ) -> Result<R, LspsError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let id = new_request_id();
        let message = JsonRpcMessage::Request {
            id: id.clone(),
            method: method.to_string(),
            params: serde_json::to_value(params)?,
        };
        let payload = message.encode()?;

        // Registered before sending: the response may arrive before send returns.
        let rx = pending.insert(peer, &id, method);
        tracing::debug!(peer, method, id = %id, "Sending LSPS request");
        if let Err(e) = self
            .client
            .send_custom_message(peer, LSPS_MESSAGE_TYPE, payload)
            .await
        {
            pending.claim(peer, &id);
            return Err(e.into());
        }

        let reply = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(LspsError::Dropped(method)),
            Err(_) => {
                pending.claim(peer, &id);
                return Err(LspsError::Timeout(method));
            }
        };
        let value = reply.map_err(LspsError::Rpc)?;
        serde_json::from_value(value).map_err(|e| LspsError::Malformed(format!("{method}: {e}")))
    }
}
