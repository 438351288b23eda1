// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::CorsLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::health::{Alarm, AlarmKind};
use crate::state::AppState;

pub mod health;
pub mod lsps;

pub fn router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/health/alarms", get(health::alarms))
        .route("/lsps/catalog", get(lsps::catalog))
        .route("/lsps5/events", get(lsps::events))
        .route("/lsps5/webhook-callback", post(lsps::webhook_callback))
        .with_state(state.clone());

    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .with_state(state);

    Router::new()
        .merge(health_routes)
        .nest("/api", api_routes)
        .merge(SwaggerUi::new("/docs").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(CorsLayer::permissive())
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health,
        health::liveness,
        health::readiness,
        health::alarms,
        lsps::catalog,
        lsps::events,
        lsps::webhook_callback
    ),
    components(
        schemas(
            health::ReadyResponse,
            health::HealthChecks,
            health::HealthResponse,
            health::AlarmsResponse,
            Alarm,
            AlarmKind,
            lsps::CatalogResponse
        )
    ),
    tags(
        (name = "Health", description = "Liveness, readiness and alarms"),
        (name = "LSPS", description = "LSP catalog and LSPS5 webhooks")
    )
)]
struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apps::testing::PASSWORD;
    use crate::lsps::webhook::testing::{lsp_key, pubkey_hex, sign};
    use crate::startup::testing::{test_gateway, TestBackends};
    use crate::storage::lsps::{LspOrigin, LspRecord, LspStore};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use futures::StreamExt;
    use serde_json::Value;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    const TS: &str = "2026-05-04T10:52:58.395Z";
    const EXPIRY_SOON: &str =
        r#"{"jsonrpc":"2.0","method":"lsps5.expiry_soon","params":{"timeout":720000}}"#;

    async fn state() -> (AppState, Arc<TestBackends>, tempfile::TempDir) {
        let backends = Arc::new(TestBackends::new(0));
        let (gateway, dir) = test_gateway(backends.clone());
        (AppState::new(Arc::new(gateway)), backends, dir)
    }

    async fn get(app: &Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .clone()
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    fn webhook(lsp: &str, signature: &str, body: &'static str) -> Request<Body> {
        Request::post(format!("/api/lsps5/webhook-callback?lsp={lsp}"))
            .header(lsps::TIMESTAMP_HEADER, TS)
            .header(lsps::SIGNATURE_HEADER, signature)
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn stopped_node_is_alive_but_not_ready() {
        let (state, _backends, _dir) = state().await;
        let app = router(state);

        let (status, body) = get(&app, "/health/live").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = get(&app, "/health/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["checks"]["node"], "stopped");

        let (status, body) = get(&app, "/api/health/alarms").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "node is not running");
    }

    #[tokio::test]
    async fn running_node_reports_ready_and_alarms() {
        let (state, backends, _dir) = state().await;
        state.gateway.start(PASSWORD).await.unwrap();
        let app = router(state.clone());

        let (status, body) = get(&app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["checks"]["alarms"], 0);

        backends.ln.set_ready(false);
        let (status, _) = get(&app, "/health/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let (status, body) = get(&app, "/api/health/alarms").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["alarms"][0]["kind"], "node_not_ready");

        state.gateway.stop().await;
    }

    #[tokio::test]
    async fn catalog_lists_known_lsps() {
        let (state, _backends, _dir) = state().await;
        state.gateway.start(PASSWORD).await.unwrap();
        LspStore::new(state.gateway.db())
            .put(&LspRecord::new("02AB", "lsp.example:9735", "Example", LspOrigin::User))
            .unwrap();
        let app = router(state.clone());

        let (status, body) = get(&app, "/api/lsps/catalog").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["lsps"][0]["pubkey"], "02ab");
        assert_eq!(body["catalog"], Value::Null);

        state.gateway.stop().await;
    }

    #[tokio::test]
    async fn webhook_callback_statuses() {
        let (state, _backends, _dir) = state().await;
        state.gateway.start(PASSWORD).await.unwrap();
        let app = router(state.clone());
        let lsp = pubkey_hex(&lsp_key(7));

        let missing_lsp = Request::post("/api/lsps5/webhook-callback")
            .header(lsps::TIMESTAMP_HEADER, TS)
            .header(lsps::SIGNATURE_HEADER, "x")
            .body(Body::from(EXPIRY_SOON))
            .unwrap();
        let response = app.clone().oneshot(missing_lsp).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let forged = sign(&lsp_key(9), TS, EXPIRY_SOON);
        let response = app.clone().oneshot(webhook(&lsp, &forged, EXPIRY_SOON)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .clone()
            .oneshot(webhook(&lsp, "not zbase32!", EXPIRY_SOON))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let genuine = sign(&lsp_key(7), TS, EXPIRY_SOON);
        let response = app.clone().oneshot(webhook(&lsp, &genuine, EXPIRY_SOON)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        state.gateway.stop().await;
    }

    #[tokio::test]
    async fn sse_clients_receive_webhook_notifications() {
        let (state, _backends, _dir) = state().await;
        state.gateway.start(PASSWORD).await.unwrap();
        let app = router(state.clone());
        let lsp = pubkey_hex(&lsp_key(7));

        let response = app
            .clone()
            .oneshot(Request::get("/api/lsps5/events").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "text/event-stream");
        let mut frames = response.into_body().into_data_stream();

        let signature = sign(&lsp_key(7), TS, EXPIRY_SOON);
        let delivered = app.clone().oneshot(webhook(&lsp, &signature, EXPIRY_SOON)).await.unwrap();
        assert_eq!(delivered.status(), StatusCode::OK);

        let frame = tokio::time::timeout(Duration::from_secs(2), frames.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let text = String::from_utf8(frame.to_vec()).unwrap();
        assert!(text.contains("event: lsps5.expiry_soon"));
        assert!(text.contains("\"timeout\":720000"));

        state.gateway.stop().await;
    }
}
