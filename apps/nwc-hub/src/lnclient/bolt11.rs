// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! BOLT11 decoding and route-hint fee estimation.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use lightning_invoice::{Bolt11Invoice, Bolt11InvoiceDescriptionRef};

use super::LnClientError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HopFee {
    pub base_msat: u32,
    pub proportional_millionths: u32,
}

/// The fields of a BOLT11 invoice the gateway acts on.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedInvoice {
    pub bolt11: String,
    pub payment_hash: String,
    pub amount_msat: Option<u64>,
    pub payee_pubkey: String,
    pub description: Option<String>,
    pub description_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub route_hints: Vec<Vec<HopFee>>,
}

impl DecodedInvoice {
    pub fn decode(bolt11: &str) -> Result<Self, LnClientError> {
        let trimmed = bolt11.trim();
        let stripped = trimmed
            .strip_prefix("lightning:")
            .or_else(|| trimmed.strip_prefix("LIGHTNING:"))
            .unwrap_or(trimmed);
        let invoice = Bolt11Invoice::from_str(stripped)
            .map_err(|e| LnClientError::InvalidInvoice(e.to_string()))?;

        let (description, description_hash) = match invoice.description() {
            Bolt11InvoiceDescriptionRef::Direct(d) => (Some(d.to_string()), None),
            Bolt11InvoiceDescriptionRef::Hash(h) => (None, Some(h.0.to_string())),
        };

        let created_secs = invoice.duration_since_epoch().as_secs();
        let expiry_secs = invoice.expiry_time().as_secs();
        let created_at = DateTime::from_timestamp(i64::try_from(created_secs).unwrap_or(0), 0)
            .ok_or_else(|| LnClientError::InvalidInvoice("timestamp out of range".into()))?;
        let expires_at = DateTime::from_timestamp(
            i64::try_from(created_secs.saturating_add(expiry_secs)).unwrap_or(i64::MAX / 2),
            0,
        )
        .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let route_hints = invoice
            .route_hints()
            .into_iter()
            .map(|hint| {
                hint.0
                    .iter()
                    .map(|hop| HopFee {
                        base_msat: hop.fees.base_msat,
                        proportional_millionths: hop.fees.proportional_millionths,
                    })
                    .collect()
            })
            .collect();

        Ok(Self {
            bolt11: stripped.to_string(),
            payment_hash: invoice.payment_hash().to_string(),
            amount_msat: invoice.amount_milli_satoshis(),
            payee_pubkey: invoice.get_payee_pub_key().to_string(),
            description,
            description_hash,
            created_at,
            expires_at,
            route_hints,
        })
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Worst-case routing fee over the invoice's route hints:
    /// `max over hints of Σ(base + amount·ppm/10⁶)`.
    pub fn estimate_fee_msat(&self, amount_msat: u64) -> u64 {
        self.route_hints
            .iter()
            .map(|hops| {
                hops.iter()
                    .map(|hop| {
                        u64::from(hop.base_msat)
                            + amount_msat.saturating_mul(u64::from(hop.proportional_millionths))
                                / 1_000_000
                    })
                    .sum::<u64>()
            })
            .max()
            .unwrap_or(0)
    }
}
