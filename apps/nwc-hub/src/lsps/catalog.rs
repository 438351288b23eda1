// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Community LSP catalog (`services.json`).

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use super::LspsError;
use crate::storage::lsps::{LspOrigin, LspRecord};

/// Largest catalog body accepted.
pub const MAX_CATALOG_BYTES: usize = 10 * 1024 * 1024;

const FETCH_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Deserialize)]
struct CatalogEntry {
    pubkey: String,
    #[serde(alias = "address")]
    host: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    website: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CatalogDocument {
    Wrapped { lsps: Vec<CatalogEntry> },
    Bare(Vec<CatalogEntry>),
}

/// Community records described by a catalog document.
pub fn parse_catalog(raw: &Value) -> Result<Vec<LspRecord>, LspsError> {
    let document: CatalogDocument = serde_json::from_value(raw.clone())
        .map_err(|e| LspsError::Malformed(format!("catalog: {e}")))?;
    let entries = match document {
        CatalogDocument::Wrapped { lsps } => lsps,
        CatalogDocument::Bare(lsps) => lsps,
    };
    Ok(entries
        .into_iter()
        .filter(|e| !e.pubkey.is_empty() && e.host.contains(':'))
        .map(|e| {
            let name = e.name.unwrap_or_else(|| e.host.clone());
            let mut record = LspRecord::new(&e.pubkey, &e.host, &name, LspOrigin::Community);
            record.website = e.website;
            record.description = e.description;
            record
        })
        .collect())
}

/// Download the catalog, refusing bodies larger than [`MAX_CATALOG_BYTES`].
pub async fn fetch_catalog(http: &reqwest::Client, url: &str) -> Result<Value, LspsError> {
    let mut response = http
        .get(url)
        .timeout(FETCH_TIMEOUT)
        .send()
        .await?
        .error_for_status()?;
    if response
        .content_length()
        .is_some_and(|len| len > MAX_CATALOG_BYTES as u64)
    {
        return Err(LspsError::CatalogTooLarge);
    }
    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        if body.len() + chunk.len() > MAX_CATALOG_BYTES {
            return Err(LspsError::CatalogTooLarge);
        }
        body.extend_from_slice(&chunk);
    }
    serde_json::from_slice(&body).map_err(|e| LspsError::Malformed(format!("catalog: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn both_catalog_shapes_are_accepted() {
        let wrapped = json!({"lsps": [
            {"pubkey": "02AA", "host": "lsp.one:9735", "name": "One", "website": "https://one"},
            {"pubkey": "02bb", "address": "lsp.two:9735"},
            {"pubkey": "02cc", "host": "no-port"}
        ]});
        let records = parse_catalog(&wrapped).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].pubkey, "02aa");
        assert_eq!(records[0].website.as_deref(), Some("https://one"));
        assert_eq!(records[1].name, "lsp.two:9735");
        assert!(records.iter().all(|r| r.origin == LspOrigin::Community));

        let bare = json!([{"pubkey": "02dd", "host": "lsp.four:9735", "name": "Four"}]);
        assert_eq!(parse_catalog(&bare).unwrap()[0].name, "Four");

        assert!(parse_catalog(&json!({"services": 1})).is_err());
    }
}
