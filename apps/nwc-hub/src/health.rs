// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Health aggregation over the relay session, the node and its channels.

use serde::Serialize;
use serde_json::{json, Value};
use utoipa::ToSchema;

use crate::startup::Running;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AlarmKind {
    NostrRelayOffline,
    NodeNotReady,
    ChannelsOffline,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Alarm {
    pub kind: AlarmKind,
    /// Raw status of whatever raised the alarm.
    #[schema(value_type = Object)]
    pub detail: Value,
}

impl Alarm {
    fn new(kind: AlarmKind, detail: Value) -> Self {
        Self { kind, detail }
    }
}

/// Every anomaly of the running node, in a stable order.
pub async fn alarms(running: &Running) -> Vec<Alarm> {
    let mut alarms = Vec::new();

    running.session.refresh_statuses().await;
    let offline: Vec<String> = running
        .session
        .relay_statuses()
        .into_iter()
        .filter(|(_, online)| !online)
        .map(|(url, _)| url)
        .collect();
    if !offline.is_empty() {
        alarms.push(Alarm::new(AlarmKind::NostrRelayOffline, json!(offline)));
    }

    match running.client.get_node_status().await {
        Ok(status) if status.is_ready => {}
        Ok(status) => alarms.push(Alarm::new(AlarmKind::NodeNotReady, status.internal)),
        Err(e) => alarms.push(Alarm::new(
            AlarmKind::NodeNotReady,
            json!({ "error": e.to_string() }),
        )),
    }

    match running.client.list_channels().await {
        Ok(channels) => {
            let offline: Vec<_> = channels.into_iter().filter(|c| c.is_offline()).collect();
            if !offline.is_empty() {
                alarms.push(Alarm::new(
                    AlarmKind::ChannelsOffline,
                    serde_json::to_value(&offline).unwrap_or_default(),
                ));
            }
        }
        Err(e) => tracing::warn!(error = %e, "Cannot list channels for health check"),
    }

    alarms
}
