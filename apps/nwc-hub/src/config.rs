// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Runtime Configuration
//!
//! Configuration is loaded once from the environment at startup.
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `DATA_DIR` | Directory holding `nwc.redb` | `./data` |
//! | `HOST` | Server bind address | `0.0.0.0` |
//! | `PORT` | Server bind port | `8080` |
//! | `RELAYS` | Comma-separated relay URLs | `wss://relay.getalby.com/v1` |
//! | `PUBLIC_BASE_URL` | Externally reachable base URL (LSPS5 webhooks) | `http://localhost:8080` |
//! | `LSPS_SERVICES_URL` | Community LSP catalog | unset (no sync) |
//! | `LUD16` | Lightning address advertised in pairing URIs | unset |
//! | `JIT_ENABLED` | Buy JIT channels for oversized invoices | `true` |
//! | `LSPS_PENDING_MAX_AGE_SECS` | Age after which LSPS requests are pruned | `300` |
//! | `UNLOCK_PASSWORD` | Start the node on boot with this password | unset |
//! | `LOG_FORMAT` | Logging format (`json` or `pretty`) | `pretty` |
//! | `RUST_LOG` | Log level filter | `info,tower_http=debug` |

use std::env;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Root directory for the gateway database.
pub const DATA_DIR_ENV: &str = "DATA_DIR";
pub const HOST_ENV: &str = "HOST";
pub const PORT_ENV: &str = "PORT";
pub const RELAYS_ENV: &str = "RELAYS";
pub const PUBLIC_BASE_URL_ENV: &str = "PUBLIC_BASE_URL";
pub const LSPS_SERVICES_URL_ENV: &str = "LSPS_SERVICES_URL";
pub const LUD16_ENV: &str = "LUD16";
pub const JIT_ENABLED_ENV: &str = "JIT_ENABLED";
pub const LSPS_PENDING_MAX_AGE_ENV: &str = "LSPS_PENDING_MAX_AGE_SECS";
/// Never logged.
pub const UNLOCK_PASSWORD_ENV: &str = "UNLOCK_PASSWORD";
pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";

pub const DEFAULT_RELAY: &str = "wss://relay.getalby.com/v1";
pub const DB_FILE_NAME: &str = "nwc.redb";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} is required")]
    Missing { name: &'static str },

    #[error("{name} has an invalid value: {value}")]
    Invalid { name: &'static str, value: String },
}

/// Value of `name`, or `default` when unset or empty.
pub fn env_or_default(name: &str, default: &str) -> String {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => value.trim().to_string(),
        _ => default.to_string(),
    }
}

fn env_optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            name,
            value: value.to_string(),
        }),
    }
}

fn parse_relays(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub data_dir: PathBuf,
    pub bind_addr: SocketAddr,
    pub relays: Vec<String>,
    pub public_base_url: String,
    pub lsps_services_url: Option<String>,
    pub lud16: Option<String>,
    pub jit_enabled: bool,
    pub lsps_pending_max_age: Duration,
    pub unlock_password: Option<String>,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env_or_default(HOST_ENV, "0.0.0.0");
        let host: IpAddr = host.parse().map_err(|_| ConfigError::Invalid {
            name: HOST_ENV,
            value: host.clone(),
        })?;
        let port = env_or_default(PORT_ENV, "8080");
        let port: u16 = port.parse().map_err(|_| ConfigError::Invalid {
            name: PORT_ENV,
            value: port.clone(),
        })?;

        let relays = parse_relays(&env_or_default(RELAYS_ENV, DEFAULT_RELAY));
        if relays.is_empty() {
            return Err(ConfigError::Missing { name: RELAYS_ENV });
        }

        let max_age = env_or_default(LSPS_PENDING_MAX_AGE_ENV, "300");
        let max_age: u64 = max_age.parse().map_err(|_| ConfigError::Invalid {
            name: LSPS_PENDING_MAX_AGE_ENV,
            value: max_age.clone(),
        })?;

        Ok(Self {
            data_dir: PathBuf::from(env_or_default(DATA_DIR_ENV, "./data")),
            bind_addr: SocketAddr::new(host, port),
            relays,
            public_base_url: env_or_default(PUBLIC_BASE_URL_ENV, "http://localhost:8080"),
            lsps_services_url: env_optional(LSPS_SERVICES_URL_ENV),
            lud16: env_optional(LUD16_ENV),
            jit_enabled: parse_bool(JIT_ENABLED_ENV, &env_or_default(JIT_ENABLED_ENV, "true"))?,
            lsps_pending_max_age: Duration::from_secs(max_age),
            unlock_password: env_optional(UNLOCK_PASSWORD_ENV),
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE_NAME)
    }

    /// Configuration for tests and embedding: defaults, no environment.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            relays: vec![DEFAULT_RELAY.to_string()],
            public_base_url: "http://localhost:8080".to_string(),
            lsps_services_url: None,
            lud16: None,
            jit_enabled: true,
            lsps_pending_max_age: Duration::from_secs(300),
            unlock_password: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_list_is_trimmed() {
        assert_eq!(
            parse_relays(" wss://a , ,wss://b"),
            vec!["wss://a".to_string(), "wss://b".to_string()]
        );
    }

    #[test]
    fn booleans() {
        assert!(parse_bool(JIT_ENABLED_ENV, "TRUE").unwrap());
        assert!(!parse_bool(JIT_ENABLED_ENV, "0").unwrap());
        assert!(matches!(
            parse_bool(JIT_ENABLED_ENV, "maybe"),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn db_path_is_under_data_dir() {
        let config = GatewayConfig::with_data_dir("/tmp/hub");
        assert_eq!(config.db_path(), PathBuf::from("/tmp/hub/nwc.redb"));
        assert_eq!(config.lsps_pending_max_age, Duration::from_secs(300));
    }
}
