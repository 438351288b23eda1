// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Fan-out of inbound LSPS messages to the protocol clients.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use super::lsps5::Lsps5Notification;
use super::manager::LiquidityManager;
use super::transport::PendingRequests;
use super::{JsonRpcMessage, LSPS_MESSAGE_TYPE};
use crate::lnclient::{CustomMessage, LnClientError};

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(2);

type Inbound = (mpsc::Receiver<CustomMessage>, mpsc::Receiver<LnClientError>);

impl LiquidityManager {
    /// Clients in dispatch order; the first one holding the id claims it.
    fn handlers(&self) -> [&PendingRequests; 5] {
        [
            &self.lsps0.pending,
            &self.lsps1.pending,
            &self.lsps2.pending_get_info,
            &self.lsps2.pending_buy,
            &self.lsps5.pending,
        ]
    }

    pub(super) async fn route(&self, message: CustomMessage) {
        if message.msg_type != LSPS_MESSAGE_TYPE {
            return;
        }
        let peer = message.peer.as_str();
        let decoded = match JsonRpcMessage::decode(&message.data) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::debug!(peer, error = %e, "Undecodable LSPS message");
                return;
            }
        };
        match decoded {
            JsonRpcMessage::Response { id, result } => {
                for pending in self.handlers() {
                    if let Some(entry) = pending.claim(peer, &id) {
                        tracing::debug!(peer, client = pending.name(), method = entry.method, "LSPS response claimed");
                        entry.resolve(result);
                        return;
                    }
                }
                tracing::debug!(peer, id = %id, "Unclaimed LSPS response");
            }
            JsonRpcMessage::Notification { method, params } => {
                match Lsps5Notification::parse(&method, &params) {
                    Ok(notification) => {
                        if let Err(e) = self
                            .handle_lsps5_notification(peer, None, notification, &method, params)
                            .await
                        {
                            tracing::warn!(peer, method = %method, error = %e, "LSPS notification failed");
                        }
                    }
                    Err(e) => tracing::warn!(peer, method = %method, error = %e, "Malformed LSPS notification"),
                }
            }
            JsonRpcMessage::Request { method, .. } => {
                tracing::debug!(peer, method = %method, "Ignoring LSPS request from peer");
            }
        }
    }
}

pub(super) async fn run(manager: Arc<LiquidityManager>, inbound: Inbound) {
    let (mut messages, mut errors) = inbound;
    tracing::info!("LSPS message demux started");
    loop {
        tokio::select! {
            _ = manager.shutdown.cancelled() => break,
            message = messages.recv() => match message {
                Some(message) => manager.route(message).await,
                None => {
                    tracing::warn!("Custom message stream closed, resubscribing");
                    match resubscribe(&manager).await {
                        Some((m, e)) => { messages = m; errors = e; }
                        None => break,
                    }
                }
            },
            Some(error) = errors.recv() => {
                tracing::warn!(error = %error, "Custom message stream error, resubscribing");
                match resubscribe(&manager).await {
                    Some((m, e)) => { messages = m; errors = e; }
                    None => break,
                }
            }
        }
    }
    tracing::info!("LSPS message demux stopped");
}

async fn resubscribe(manager: &LiquidityManager) -> Option<Inbound> {
    loop {
        tokio::select! {
            _ = manager.shutdown.cancelled() => return None,
            _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
        }
        match manager.client.subscribe_custom_messages().await {
            Ok(inbound) => return Some(inbound),
            Err(e) => tracing::warn!(error = %e, "Custom message resubscribe failed"),
        }
    }
}
