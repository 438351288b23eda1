// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use utoipa::ToSchema;

use crate::error::ApiError;
use crate::health::{self, Alarm};
use crate::state::AppState;

/// Health check response with individual component status.
#[derive(Debug, Serialize, ToSchema)]
pub struct ReadyResponse {
    /// Overall health status ("ok" or "degraded").
    pub status: String,
    /// Individual health checks and their results.
    pub checks: HealthChecks,
}

/// Individual health check results.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthChecks {
    /// Whether the service process is running.
    pub service: String,
    /// "running" or "stopped".
    pub node: String,
    /// Number of active alarms while the node runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alarms: Option<usize>,
}

/// Simple health check response for liveness probes.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AlarmsResponse {
    pub alarms: Vec<Alarm>,
}

/// Health check endpoint handler.
///
/// Returns 200 when the node runs without alarms, 503 otherwise.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    responses(
        (status = 200, description = "Service is healthy", body = ReadyResponse),
        (status = 503, description = "Service is unhealthy", body = ReadyResponse)
    )
)]
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    let (node, alarms) = match state.gateway.running() {
        Some(running) => ("running", Some(health::alarms(&running).await.len())),
        None => ("stopped", None),
    };
    let all_ok = alarms == Some(0);

    let response = ReadyResponse {
        status: if all_ok { "ok" } else { "degraded" }.to_string(),
        checks: HealthChecks {
            service: "ok".to_string(),
            node: node.to_string(),
            alarms,
        },
    };

    let status = if all_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(response))
}

/// Liveness probe handler.
///
/// Always returns 200 if the process is running.
/// Does not check dependencies - use readiness for that.
#[utoipa::path(
    get,
    path = "/health/live",
    tag = "Health",
    responses(
        (status = 200, description = "Service is alive", body = HealthResponse)
    )
)]
pub async fn liveness() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// Readiness probe handler.
#[utoipa::path(
    get,
    path = "/health/ready",
    tag = "Health",
    responses(
        (status = 200, description = "Node is running without alarms", body = ReadyResponse),
        (status = 503, description = "Node is stopped or alarming", body = ReadyResponse)
    )
)]
pub async fn readiness(state: State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    health(state).await
}

/// Relay, node and channel alarms of the running node.
#[utoipa::path(
    get,
    path = "/api/health/alarms",
    tag = "Health",
    responses(
        (status = 200, description = "Current alarms", body = AlarmsResponse),
        (status = 503, description = "Node is not running")
    )
)]
pub async fn alarms(State(state): State<AppState>) -> Result<Json<AlarmsResponse>, ApiError> {
    let running = state.running()?;
    Ok(Json(AlarmsResponse {
        alarms: health::alarms(&running).await,
    }))
}
