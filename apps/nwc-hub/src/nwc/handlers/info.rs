// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use serde_json::{json, Value};

use super::RequestContext;
use crate::nostr::info::methods_for;
use crate::nwc::protocol::{parse_params, NwcError, SignMessageParams};
use crate::permissions::Scope;

pub(super) async fn get_info(ctx: &RequestContext<'_>) -> Result<Value, NwcError> {
    let node = ctx.router.ledger.client().get_info().await?;
    let scopes = ctx.router.permissions.scopes(ctx.app.id)?;
    let notifications: Vec<&str> = if scopes.contains(&Scope::Notifications) {
        crate::lnclient::NotificationType::ALL
            .iter()
            .map(|t| t.as_str())
            .collect()
    } else {
        Vec::new()
    };
    Ok(json!({
        "alias": node.alias,
        "color": node.color,
        "pubkey": node.pubkey,
        "network": node.network,
        "block_height": node.block_height,
        "block_hash": node.block_hash,
        "methods": methods_for(&scopes),
        "notifications": notifications,
    }))
}

pub(super) async fn get_balance(ctx: &RequestContext<'_>) -> Result<Value, NwcError> {
    let balance_msat = if ctx.app.isolated {
        let balance = ctx.router.permissions.isolated_balance_msat(ctx.app.id)?;
        u64::try_from(balance).unwrap_or(0)
    } else {
        ctx.router
            .ledger
            .client()
            .get_balances()
            .await?
            .lightning
            .total_spendable_msat
    };
    Ok(json!({ "balance": balance_msat }))
}

pub(super) fn get_budget(ctx: &RequestContext<'_>) -> Result<Value, NwcError> {
    let Some(status) = ctx.router.permissions.budget_status(ctx.app.id)? else {
        return Ok(json!({}));
    };
    Ok(json!({
        "used_budget": status.used_msat,
        "total_budget": status.total_msat,
        "renews_at": status.renews_at.map(|at| at.timestamp()),
        "renewal_period": status.renewal.to_string(),
    }))
}

pub(super) async fn sign_message(ctx: &RequestContext<'_>) -> Result<Value, NwcError> {
    let params: SignMessageParams = parse_params(ctx.params)?;
    let signature = ctx.router.ledger.client().sign_message(&params.message).await?;
    Ok(json!({ "message": params.message, "signature": signature }))
}
