// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use super::RequestContext;
use crate::ledger::{InvoiceRequest, ListQuery};
use crate::lnclient::bolt11::DecodedInvoice;
use crate::nwc::protocol::{
    parse_params, CancelHoldInvoiceParams, ListTransactionsParams, LookupInvoiceParams,
    MakeHoldInvoiceParams, MakeInvoiceParams, NwcError, NwcTransaction, SettleHoldInvoiceParams,
};
use crate::storage::transactions::{Transaction, TransactionType};

fn wire(tx: &Transaction) -> Result<Value, NwcError> {
    serde_json::to_value(NwcTransaction::from(tx)).map_err(|e| NwcError::internal(e.to_string()))
}

/// Rows an app may see: its own when isolated, all otherwise.
fn visible_app(ctx: &RequestContext<'_>) -> Option<u64> {
    ctx.app.isolated.then_some(ctx.app.id)
}

pub(super) async fn make_invoice(ctx: &RequestContext<'_>) -> Result<Value, NwcError> {
    let params: MakeInvoiceParams = parse_params(ctx.params)?;
    let jit = match &ctx.router.jit {
        Some(weaver) => weaver.weave(params.amount).await,
        None => None,
    };
    let tx = ctx
        .router
        .ledger
        .make_invoice(InvoiceRequest {
            amount_msat: params.amount,
            description: params.description,
            description_hash: params.description_hash,
            expiry_secs: params.expiry,
            metadata: params.metadata,
            app_id: Some(ctx.app.id),
            request_event_id: Some(ctx.request_id),
            jit,
        })
        .await?;
    wire(&tx)
}

pub(super) async fn make_hold_invoice(ctx: &RequestContext<'_>) -> Result<Value, NwcError> {
    let params: MakeHoldInvoiceParams = parse_params(ctx.params)?;
    let tx = ctx
        .router
        .ledger
        .make_hold_invoice(
            InvoiceRequest {
                amount_msat: params.amount,
                description: params.description,
                description_hash: params.description_hash,
                expiry_secs: params.expiry,
                metadata: params.metadata,
                app_id: Some(ctx.app.id),
                request_event_id: Some(ctx.request_id),
                jit: None,
            },
            &params.payment_hash,
        )
        .await?;
    wire(&tx)
}

pub(super) async fn settle_hold_invoice(ctx: &RequestContext<'_>) -> Result<Value, NwcError> {
    let params: SettleHoldInvoiceParams = parse_params(ctx.params)?;
    ctx.router
        .ledger
        .settle_hold_invoice(&params.preimage, visible_app(ctx))
        .await?;
    Ok(json!({}))
}

pub(super) async fn cancel_hold_invoice(ctx: &RequestContext<'_>) -> Result<Value, NwcError> {
    let params: CancelHoldInvoiceParams = parse_params(ctx.params)?;
    ctx.router
        .ledger
        .cancel_hold_invoice(&params.payment_hash, visible_app(ctx))
        .await?;
    Ok(json!({}))
}

pub(super) async fn lookup_invoice(ctx: &RequestContext<'_>) -> Result<Value, NwcError> {
    let params: LookupInvoiceParams = parse_params(ctx.params)?;
    let payment_hash = match (params.payment_hash, params.invoice) {
        (Some(hash), _) => hash,
        (None, Some(invoice)) => {
            DecodedInvoice::decode(&invoice)
                .map_err(|e| NwcError::bad_request(e.to_string()))?
                .payment_hash
        }
        (None, None) => {
            return Err(NwcError::bad_request("payment_hash or invoice is required"));
        }
    };
    let tx = ctx
        .router
        .ledger
        .lookup(&payment_hash, None, visible_app(ctx))
        .await?;
    wire(&tx)
}

fn timestamp(secs: Option<i64>) -> Result<Option<DateTime<Utc>>, NwcError> {
    secs.map(|s| {
        DateTime::from_timestamp(s, 0).ok_or_else(|| NwcError::bad_request(format!("bad timestamp {s}")))
    })
    .transpose()
}

pub(super) async fn list_transactions(ctx: &RequestContext<'_>) -> Result<Value, NwcError> {
    let params: ListTransactionsParams = if ctx.params.is_null() {
        ListTransactionsParams::default()
    } else {
        parse_params(ctx.params)?
    };
    let tx_type = match params.tx_type.as_deref() {
        None | Some("") => None,
        Some("incoming") => Some(TransactionType::Incoming),
        Some("outgoing") => Some(TransactionType::Outgoing),
        Some(other) => return Err(NwcError::bad_request(format!("unknown type {other}"))),
    };
    let query = ListQuery {
        from: timestamp(params.from)?,
        until: timestamp(params.until)?,
        limit: params.limit,
        offset: params.offset.unwrap_or(0),
        unpaid_outgoing: params.unpaid || params.unpaid_outgoing.unwrap_or(false),
        unpaid_incoming: params.unpaid || params.unpaid_incoming.unwrap_or(false),
        tx_type,
        app_id: visible_app(ctx),
    };
    let (rows, total) = ctx.router.ledger.list(&query).await?;
    let transactions = rows.iter().map(wire).collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "transactions": transactions, "total_count": total }))
}

#[cfg(test)]
mod tests {
    use crate::apps::CreateAppRequest;
    use crate::ledger::sha256_hex;
    use crate::nwc::protocol::NwcErrorCode;
    use crate::nwc::router::testing::router_harness;
    use crate::permissions::Scope;
    use serde_json::json;

    fn all_invoice_scopes() -> CreateAppRequest {
        CreateAppRequest {
            name: "merchant".into(),
            scopes: vec![
                Scope::MakeInvoice,
                Scope::LookupInvoice,
                Scope::ListTransactions,
                Scope::MakeHoldInvoice,
                Scope::SettleHoldInvoice,
                Scope::CancelHoldInvoice,
            ],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn make_then_lookup_by_hash_and_by_invoice() {
        let h = router_harness().await;
        let (created, client) = h.create_app(all_invoice_scopes()).await;
        let made = h
            .call(
                &created,
                &client,
                json!({"method": "make_invoice", "params": {"amount": 21_000, "description": "coffee"}}),
            )
            .await;
        let invoice = made[0].1.result.clone().unwrap();
        assert_eq!(invoice["type"], "incoming");
        assert_eq!(invoice["state"], "pending");
        assert_eq!(invoice["amount"], 21_000);

        let by_hash = h
            .call(
                &created,
                &client,
                json!({"method": "lookup_invoice", "params": {"payment_hash": invoice["payment_hash"]}}),
            )
            .await;
        assert_eq!(by_hash[0].1.result.as_ref().unwrap()["invoice"], invoice["invoice"]);

        let by_invoice = h
            .call(
                &created,
                &client,
                json!({"method": "lookup_invoice", "params": {"invoice": invoice["invoice"]}}),
            )
            .await;
        assert_eq!(
            by_invoice[0].1.result.as_ref().unwrap()["payment_hash"],
            invoice["payment_hash"]
        );

        let missing = h
            .call(
                &created,
                &client,
                json!({"method": "lookup_invoice", "params": {"payment_hash": "00".repeat(32)}}),
            )
            .await;
        assert_eq!(missing[0].1.error.as_ref().unwrap().code, NwcErrorCode::NotFound);
    }

    #[tokio::test]
    async fn oversized_metadata_is_bad_request() {
        let h = router_harness().await;
        let (created, client) = h.create_app(all_invoice_scopes()).await;
        let responses = h
            .call(
                &created,
                &client,
                json!({"method": "make_invoice", "params": {
                    "amount": 1_000,
                    "metadata": {"blob": "x".repeat(5_000)}
                }}),
            )
            .await;
        assert_eq!(responses[0].1.error.as_ref().unwrap().code, NwcErrorCode::BadRequest);
    }

    #[tokio::test]
    async fn hold_invoice_cancel_over_nwc() {
        let h = router_harness().await;
        let (created, client) = h.create_app(all_invoice_scopes()).await;
        let preimage = "11".repeat(32);
        let hash = sha256_hex(&hex::decode(&preimage).unwrap());
        let made = h
            .call(
                &created,
                &client,
                json!({"method": "make_hold_invoice", "params": {"amount": 1_000, "payment_hash": hash, "expiry": 3600}}),
            )
            .await;
        assert!(made[0].1.error.is_none());

        let premature = h
            .call(
                &created,
                &client,
                json!({"method": "settle_hold_invoice", "params": {"preimage": preimage}}),
            )
            .await;
        assert_eq!(premature[0].1.error.as_ref().unwrap().code, NwcErrorCode::BadRequest);

        let canceled = h
            .call(
                &created,
                &client,
                json!({"method": "cancel_hold_invoice", "params": {"payment_hash": hash}}),
            )
            .await;
        assert_eq!(canceled[0].1.result, Some(json!({})));
    }

    #[tokio::test]
    async fn isolated_apps_cannot_touch_each_others_hold_invoices() {
        let h = router_harness().await;
        let isolated = |name: &str| CreateAppRequest {
            name: name.into(),
            isolated: true,
            ..all_invoice_scopes()
        };
        let (owner, owner_client) = h.create_app(isolated("owner")).await;
        let (other, other_client) = h.create_app(isolated("other")).await;
        let preimage = "22".repeat(32);
        let hash = sha256_hex(&hex::decode(&preimage).unwrap());
        let made = h
            .call(
                &owner,
                &owner_client,
                json!({"method": "make_hold_invoice", "params": {"amount": 1_000, "payment_hash": hash, "expiry": 3600}}),
            )
            .await;
        assert!(made[0].1.error.is_none());

        for request in [
            json!({"method": "cancel_hold_invoice", "params": {"payment_hash": hash}}),
            json!({"method": "settle_hold_invoice", "params": {"preimage": preimage}}),
        ] {
            let denied = h.call(&other, &other_client, request).await;
            assert_eq!(denied[0].1.error.as_ref().unwrap().code, NwcErrorCode::NotFound);
        }

        let still = h
            .call(
                &owner,
                &owner_client,
                json!({"method": "lookup_invoice", "params": {"payment_hash": hash}}),
            )
            .await;
        assert_eq!(still[0].1.result.as_ref().unwrap()["state"], "pending");

        let canceled = h
            .call(
                &owner,
                &owner_client,
                json!({"method": "cancel_hold_invoice", "params": {"payment_hash": hash}}),
            )
            .await;
        assert_eq!(canceled[0].1.result, Some(json!({})));
    }

    #[tokio::test]
    async fn list_transactions_respects_limit() {
        let h = router_harness().await;
        let (created, client) = h.create_app(all_invoice_scopes()).await;
        for amount in [1_000, 2_000, 3_000] {
            h.call(
                &created,
                &client,
                json!({"method": "make_invoice", "params": {"amount": amount}}),
            )
            .await;
        }
        let listed = h
            .call(
                &created,
                &client,
                json!({"method": "list_transactions", "params": {"limit": 2, "unpaid": true}}),
            )
            .await;
        let result = listed[0].1.result.clone().unwrap();
        assert_eq!(result["transactions"].as_array().unwrap().len(), 2);
        assert_eq!(result["total_count"], 3);
        assert_eq!(result["transactions"][0]["amount"], 3_000);

        let settled_only = h
            .call(&created, &client, json!({"method": "list_transactions", "params": {}}))
            .await;
        assert_eq!(settled_only[0].1.result.as_ref().unwrap()["total_count"], 0);
    }
}
