// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::error::Error;
use std::sync::Arc;

use relational_nwc_hub::api::router;
use relational_nwc_hub::config::{env_or_default, GatewayConfig, LOG_FORMAT_ENV};
use relational_nwc_hub::events::EventPublisher;
use relational_nwc_hub::startup::{DevBackends, Gateway};
use relational_nwc_hub::state::AppState;
use relational_nwc_hub::storage::Db;
use relational_nwc_hub::vault::Vault;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let registry = tracing_subscriber::registry().with(filter);
    if env_or_default(LOG_FORMAT_ENV, "pretty") == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    init_tracing();

    let config = GatewayConfig::from_env()?;
    let db = Arc::new(Db::open(&config.db_path())?);
    tracing::info!(path = %config.db_path().display(), "Database opened");

    let vault = Arc::new(Vault::new(db.clone()));
    let publisher = Arc::new(EventPublisher::new());
    // No production Lightning adapter is bundled; the in-memory node stands in.
    let backends = Arc::new(DevBackends::new()?);
    let gateway = Arc::new(Gateway::new(
        config.clone(),
        db,
        vault,
        publisher,
        backends,
    ));

    if let Some(password) = &config.unlock_password {
        let gateway = gateway.clone();
        let password = password.clone();
        tokio::spawn(async move {
            if let Err(e) = gateway.start(&password).await {
                tracing::error!(error = %e, "Automatic start failed");
            }
        });
    } else {
        tracing::warn!("UNLOCK_PASSWORD not set, node stays stopped");
    }

    let app = router(AppState::new(gateway.clone()));
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "Relational NWC Hub listening (docs at /docs)");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    gateway.shutdown().await;
    Ok(())
}
