// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::convert::Infallible;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    Json,
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use utoipa::{IntoParams, ToSchema};

use crate::error::ApiError;
use crate::state::AppState;
use crate::storage::lsps::LspRecord;

pub const TIMESTAMP_HEADER: &str = "x-lsps5-timestamp";
pub const SIGNATURE_HEADER: &str = "x-lsps5-signature";

#[derive(Debug, Serialize, ToSchema)]
pub struct CatalogResponse {
    /// Known LSPs, user-added and community.
    #[schema(value_type = Vec<Object>)]
    pub lsps: Vec<LspRecord>,
    /// Last synced community catalog document.
    #[schema(value_type = Option<Object>)]
    pub catalog: Option<Value>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct WebhookQuery {
    /// Pubkey of the LSP the webhook was registered with.
    pub lsp: Option<String>,
    /// LSPS1 order the notification refers to.
    pub order: Option<String>,
}

/// LSPs known to the liquidity manager and the cached catalog.
#[utoipa::path(
    get,
    path = "/api/lsps/catalog",
    tag = "LSPS",
    responses(
        (status = 200, description = "Known LSPs", body = CatalogResponse),
        (status = 503, description = "Node is not running")
    )
)]
pub async fn catalog(State(state): State<AppState>) -> Result<Json<CatalogResponse>, ApiError> {
    let running = state.running()?;
    Ok(Json(CatalogResponse {
        lsps: running.liquidity.lsps()?,
        catalog: running.liquidity.catalog()?,
    }))
}

/// Stream of LSPS5 notifications as server-sent events.
///
/// Each event is named after the notification method; its data is the
/// notification as JSON. Slow clients miss events rather than stall others.
#[utoipa::path(
    get,
    path = "/api/lsps5/events",
    tag = "LSPS",
    responses(
        (status = 200, description = "text/event-stream of LSPS5 notifications"),
        (status = 503, description = "Node is not running")
    )
)]
pub async fn events(
    State(state): State<AppState>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let running = state.running()?;
    let receiver = running.liquidity.subscribe_webhook_events();
    let stream = ReceiverStream::new(receiver).filter_map(|event| {
        match SseEvent::default().event(event.method.clone()).json_data(&event) {
            Ok(sse) => Some(Ok(sse)),
            Err(e) => {
                tracing::warn!(error = %e, method = %event.method, "Cannot encode SSE event");
                None
            }
        }
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, ApiError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::bad_request(format!("missing {name} header")))
}

/// Signed LSPS5 notification delivered by an LSP.
#[utoipa::path(
    post,
    path = "/api/lsps5/webhook-callback",
    tag = "LSPS",
    params(WebhookQuery),
    request_body(content = String, description = "JSON-RPC notification", content_type = "application/json"),
    responses(
        (status = 200, description = "Notification accepted"),
        (status = 400, description = "Malformed delivery"),
        (status = 401, description = "Signature does not match the LSP"),
        (status = 503, description = "Node is not running")
    )
)]
pub async fn webhook_callback(
    State(state): State<AppState>,
    Query(query): Query<WebhookQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let lsp = query
        .lsp
        .filter(|l| !l.is_empty())
        .ok_or_else(|| ApiError::bad_request("missing lsp"))?;
    let timestamp = header(&headers, TIMESTAMP_HEADER)?;
    let signature = header(&headers, SIGNATURE_HEADER)?;
    let running = state.running()?;

    running
        .liquidity
        .handle_webhook(&lsp, query.order.as_deref(), timestamp, signature, &body)
        .await
        .inspect_err(|e| tracing::warn!(lsp = %lsp, error = %e, "Rejected LSPS5 webhook"))?;
    Ok(StatusCode::OK)
}
