// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use futures::future::join_all;
use serde_json::{json, Value};

use super::RequestContext;
use crate::ledger::{KeysendRequest, PayInvoiceRequest};
use crate::lnclient::bolt11::DecodedInvoice;
use crate::lnclient::TlvRecord;
use crate::nwc::protocol::{
    parse_params, MultiPayInvoiceParams, MultiPayKeysendParams, NwcError, PayInvoiceParams,
    PayKeysendParams, Response,
};
use crate::storage::transactions::Transaction;

fn paid(tx: &Transaction) -> Value {
    json!({
        "preimage": tx.preimage.clone().unwrap_or_default(),
        "fees_paid": tx.fee_msat,
    })
}

async fn pay_one(ctx: &RequestContext<'_>, params: PayInvoiceParams) -> Result<Value, NwcError> {
    let tx = ctx
        .router
        .ledger
        .send_payment_sync(PayInvoiceRequest {
            bolt11: params.invoice,
            amount_msat: params.amount,
            metadata: params.metadata,
            app_id: Some(ctx.app.id),
            request_event_id: Some(ctx.request_id),
        })
        .await?;
    Ok(paid(&tx))
}

async fn keysend_one(ctx: &RequestContext<'_>, params: PayKeysendParams) -> Result<Value, NwcError> {
    let tx = ctx
        .router
        .ledger
        .send_keysend(KeysendRequest {
            amount_msat: params.amount,
            destination: params.pubkey,
            tlv_records: params.tlv_records.iter().map(TlvRecord::from).collect(),
            preimage: params.preimage,
            metadata: None,
            app_id: Some(ctx.app.id),
            request_event_id: Some(ctx.request_id),
        })
        .await?;
    Ok(paid(&tx))
}

pub(super) async fn pay_invoice(ctx: &RequestContext<'_>) -> Result<Value, NwcError> {
    let params: PayInvoiceParams = parse_params(ctx.params)?;
    pay_one(ctx, params).await
}

pub(super) async fn pay_keysend(ctx: &RequestContext<'_>) -> Result<Value, NwcError> {
    let params: PayKeysendParams = parse_params(ctx.params)?;
    keysend_one(ctx, params).await
}

async fn reply_keyed(ctx: &RequestContext<'_>, d_tag: &str, result: Result<Value, NwcError>) {
    let response = match result {
        Ok(value) => Response::ok(ctx.method, value),
        Err(error) => {
            tracing::info!(app_id = ctx.app.id, d = %d_tag, code = ?error.code, "Multi-pay item failed");
            Response::err(ctx.method, error)
        }
    };
    ctx.responder.send(response, Some(d_tag)).await;
}

/// Pays every invoice concurrently. Each item answers with its own
/// response keyed by the client id, or the payment hash.
pub(super) async fn multi_pay_invoice(ctx: &RequestContext<'_>) {
    let params: MultiPayInvoiceParams = match parse_params(ctx.params) {
        Ok(params) => params,
        Err(e) => return ctx.reply(Err(e)).await,
    };
    let items = params.invoices.into_iter().map(|item| async move {
        let d_tag = item.id.clone().unwrap_or_else(|| {
            DecodedInvoice::decode(&item.invoice)
                .map(|invoice| invoice.payment_hash)
                .unwrap_or_default()
        });
        let result = pay_one(ctx, item).await;
        reply_keyed(ctx, &d_tag, result).await;
    });
    join_all(items).await;
}

/// Keysend counterpart of [`multi_pay_invoice`]; items are keyed by client
/// id or destination pubkey.
pub(super) async fn multi_pay_keysend(ctx: &RequestContext<'_>) {
    let params: MultiPayKeysendParams = match parse_params(ctx.params) {
        Ok(params) => params,
        Err(e) => return ctx.reply(Err(e)).await,
    };
    let items = params.keysends.into_iter().map(|item| async move {
        let d_tag = item.id.clone().unwrap_or_else(|| item.pubkey.clone());
        let result = keysend_one(ctx, item).await;
        reply_keyed(ctx, &d_tag, result).await;
    });
    join_all(items).await;
}

#[cfg(test)]
mod tests {
    use crate::apps::CreateAppRequest;
    use crate::nwc::protocol::NwcErrorCode;
    use crate::nwc::router::testing::router_harness;
    use crate::permissions::{BudgetRenewal, Scope};
    use serde_json::json;

    #[tokio::test]
    async fn pay_invoice_over_budget_is_quota_exceeded() {
        let h = router_harness().await;
        let (created, client) = h
            .create_app(CreateAppRequest {
                name: "spender".into(),
                scopes: vec![Scope::PayInvoice],
                max_amount_sat: 1000,
                budget_renewal: BudgetRenewal::Daily,
                ..Default::default()
            })
            .await;

        let first = h.ln().external_invoice(600_000, "first").unwrap();
        let ok = h
            .call(&created, &client, json!({"method": "pay_invoice", "params": {"invoice": first}}))
            .await;
        assert!(ok[0].1.error.is_none(), "{:?}", ok[0].1.error);
        assert_eq!(ok[0].1.result.as_ref().unwrap()["preimage"].as_str().unwrap().len(), 64);

        let second = h.ln().external_invoice(500_000, "second").unwrap();
        let denied = h
            .call(&created, &client, json!({"method": "pay_invoice", "params": {"invoice": second}}))
            .await;
        assert_eq!(denied[0].1.error.as_ref().unwrap().code, NwcErrorCode::QuotaExceeded);
    }

    #[tokio::test]
    async fn multi_pay_answers_each_item_by_d_tag() {
        let h = router_harness().await;
        let (created, client) = h
            .create_app(CreateAppRequest {
                name: "batch".into(),
                scopes: vec![Scope::PayInvoice],
                ..Default::default()
            })
            .await;
        let a = h.ln().external_invoice(1_000, "a").unwrap();
        let b = h.ln().external_invoice(2_000, "b").unwrap();
        let mut responses = h
            .call(
                &created,
                &client,
                json!({"method": "multi_pay_invoice", "params": {"invoices": [
                    {"id": "first", "invoice": a},
                    {"id": "second", "invoice": b},
                    {"id": "broken", "invoice": "lnbc1garbage"}
                ]}}),
            )
            .await;
        responses.sort_by(|x, y| x.0.cmp(&y.0));
        let tags: Vec<_> = responses.iter().map(|(d, _)| d.clone().unwrap()).collect();
        assert_eq!(tags, vec!["broken", "first", "second"]);
        assert_eq!(
            responses[0].1.error.as_ref().unwrap().code,
            NwcErrorCode::BadRequest
        );
        assert!(responses[1].1.error.is_none());
        assert!(responses[2].1.error.is_none());
        assert!(responses.iter().all(|(_, r)| r.result_type == "multi_pay_invoice"));
    }

    #[tokio::test]
    async fn isolated_app_without_funds_is_insufficient_balance() {
        let h = router_harness().await;
        let (created, client) = h
            .create_app(CreateAppRequest {
                name: "sub".into(),
                scopes: vec![Scope::PayInvoice],
                isolated: true,
                ..Default::default()
            })
            .await;
        let invoice = h.ln().external_invoice(5_000, "x").unwrap();
        let responses = h
            .call(&created, &client, json!({"method": "pay_invoice", "params": {"invoice": invoice}}))
            .await;
        assert_eq!(
            responses[0].1.error.as_ref().unwrap().code,
            NwcErrorCode::InsufficientBalance
        );
    }
}
