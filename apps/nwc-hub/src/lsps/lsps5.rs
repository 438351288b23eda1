// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! LSPS5: webhook registration and the notifications delivered through it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::transport::{PendingRequests, RpcChannel};
use super::LspsError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetWebhookResult {
    pub num_webhooks: u32,
    pub max_webhooks: u32,
    #[serde(default)]
    pub no_change: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListWebhooksResult {
    #[serde(default)]
    pub app_names: Vec<String>,
    #[serde(default)]
    pub max_webhooks: u32,
}

/// Notification methods an LSP may send, with typed params. Methods this
/// client does not know are kept as `Other`.
#[derive(Debug, Clone, PartialEq)]
pub enum Lsps5Notification {
    WebhookRegistered,
    PaymentIncoming,
    ExpirySoon { timeout: Option<u32> },
    LiquidityManagementRequest,
    OnionMessageIncoming,
    OrderStateChanged {
        order_id: Option<String>,
        state: String,
    },
    Other(String),
}

impl Lsps5Notification {
    pub fn parse(method: &str, params: &Value) -> Result<Self, LspsError> {
        match method {
            "lsps5.webhook_registered" => Ok(Self::WebhookRegistered),
            "lsps5.payment_incoming" => Ok(Self::PaymentIncoming),
            "lsps5.expiry_soon" => Ok(Self::ExpirySoon {
                timeout: params
                    .get("timeout")
                    .and_then(Value::as_u64)
                    .and_then(|t| u32::try_from(t).ok()),
            }),
            "lsps5.liquidity_management_request" => Ok(Self::LiquidityManagementRequest),
            "lsps5.onion_message_incoming" => Ok(Self::OnionMessageIncoming),
            "lsps5.order_state_changed" => {
                let state = params
                    .get("order_state")
                    .or_else(|| params.get("state"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| LspsError::Malformed("order_state_changed without state".into()))?;
                Ok(Self::OrderStateChanged {
                    order_id: params
                        .get("order_id")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    state: state.to_string(),
                })
            }
            other => Ok(Self::Other(other.to_string())),
        }
    }
}

#[derive(Serialize)]
struct SetWebhookParams<'a> {
    app_name: &'a str,
    webhook: &'a str,
}

#[derive(Serialize)]
struct RemoveWebhookParams<'a> {
    app_name: &'a str,
}

pub(crate) struct Lsps5Client {
    rpc: RpcChannel,
    pub(crate) pending: PendingRequests,
}

impl Lsps5Client {
    pub fn new(rpc: RpcChannel) -> Self {
        Self {
            rpc,
            pending: PendingRequests::new("lsps5"),
        }
    }

    pub async fn set_webhook(
        &self,
        peer: &str,
        app_name: &str,
        webhook: &str,
    ) -> Result<SetWebhookResult, LspsError> {
        self.rpc
            .call(
                &self.pending,
                peer,
                "lsps5.set_webhook",
                &SetWebhookParams { app_name, webhook },
            )
            .await
    }

    pub async fn list_webhooks(&self, peer: &str) -> Result<ListWebhooksResult, LspsError> {
        self.rpc
            .call(&self.pending, peer, "lsps5.list_webhooks", &serde_json::json!({}))
            .await
    }

    pub async fn remove_webhook(&self, peer: &str, app_name: &str) -> Result<(), LspsError> {
        let _: Value = self
            .rpc
            .call(
                &self.pending,
                peer,
                "lsps5.remove_webhook",
                &RemoveWebhookParams { app_name },
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn notifications_are_typed_by_method() {
        assert_eq!(
            Lsps5Notification::parse("lsps5.payment_incoming", &json!({})).unwrap(),
            Lsps5Notification::PaymentIncoming
        );
        assert_eq!(
            Lsps5Notification::parse("lsps5.expiry_soon", &json!({"timeout": 144})).unwrap(),
            Lsps5Notification::ExpirySoon { timeout: Some(144) }
        );
        assert_eq!(
            Lsps5Notification::parse(
                "lsps5.order_state_changed",
                &json!({"order_id": "o1", "order_state": "COMPLETED"})
            )
            .unwrap(),
            Lsps5Notification::OrderStateChanged {
                order_id: Some("o1".into()),
                state: "COMPLETED".into()
            }
        );
        assert!(Lsps5Notification::parse("lsps5.order_state_changed", &json!({})).is_err());
        assert_eq!(
            Lsps5Notification::parse("lsps5.some_future_notification", &json!({})).unwrap(),
            Lsps5Notification::Other("lsps5.some_future_notification".into())
        );
    }
}
