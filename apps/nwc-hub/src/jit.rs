// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # JIT Invoice Weaver
//!
//! When inbound capacity cannot cover an invoice, a JIT channel is bought
//! from an LSP and the invoice is rewritten to route through it: a single
//! hint hop through the LSP whose base fee is the whole JIT fee, and an
//! invoice amount reduced by that fee.

use std::sync::Arc;

use async_trait::async_trait;

use crate::ledger::JitWeave;
use crate::lnclient::{JitRouteHint, LnClient};

/// A JIT channel bought for one payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JitPurchase {
    pub lsp_pubkey: String,
    pub short_channel_id: u64,
    pub cltv_expiry_delta: u16,
    pub fee_msat: u64,
}

/// Source of JIT channels; implemented by the liquidity manager.
#[async_trait]
pub trait JitChannelSource: Send + Sync {
    async fn buy_jit_channel(&self, payment_size_msat: u64) -> Result<JitPurchase, String>;
}

pub struct JitWeaver {
    client: Arc<dyn LnClient>,
    source: Arc<dyn JitChannelSource>,
    enabled: bool,
}

impl JitWeaver {
    pub fn new(client: Arc<dyn LnClient>, source: Arc<dyn JitChannelSource>, enabled: bool) -> Self {
        Self {
            client,
            source,
            enabled,
        }
    }

    /// Routing rewrite for an invoice of `amount_msat`, or `None` when the
    /// node can already receive it or no channel could be bought.
    pub async fn weave(&self, amount_msat: u64) -> Option<JitWeave> {
        if !self.enabled || amount_msat == 0 {
            return None;
        }
        let receivable = match self.client.get_balances().await {
            Ok(balances) => balances.lightning.total_receivable_msat,
            Err(e) => {
                tracing::warn!(error = %e, "Cannot read inbound capacity, skipping JIT");
                return None;
            }
        };
        if receivable >= amount_msat {
            return None;
        }

        tracing::info!(amount_msat, receivable, "Inbound capacity short, buying JIT channel");
        let purchase = match self.source.buy_jit_channel(amount_msat).await {
            Ok(purchase) => purchase,
            Err(e) => {
                tracing::warn!(amount_msat, error = %e, "JIT channel purchase failed");
                return None;
            }
        };
        if purchase.fee_msat >= amount_msat {
            tracing::warn!(
                amount_msat,
                fee_msat = purchase.fee_msat,
                "JIT fee meets or exceeds the invoice amount, not weaving"
            );
            return None;
        }
        Some(JitWeave {
            route_hint: JitRouteHint {
                lsp_pubkey: purchase.lsp_pubkey,
                short_channel_id: purchase.short_channel_id,
                cltv_expiry_delta: purchase.cltv_expiry_delta,
                fee_base_msat: u32::try_from(purchase.fee_msat).unwrap_or(u32::MAX),
                fee_proportional_millionths: 0,
            },
            jit_fee_msat: purchase.fee_msat,
        })
    }
}
