// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! NIP-47 method handlers. Each handler publishes its own responses through
//! the request's [`Responder`]; multi methods publish one per item.

mod info;
mod invoices;
mod payments;

use serde_json::Value;

use super::protocol::{NwcError, Response};
use super::responder::Responder;
use super::router::NwcRouter;
use crate::storage::apps::App;

pub(super) struct RequestContext<'a> {
    pub router: &'a NwcRouter,
    pub app: &'a App,
    pub method: &'a str,
    pub params: &'a Value,
    pub request_id: u64,
    pub responder: &'a Responder,
}

impl RequestContext<'_> {
    /// Publish the single response of a one-shot method.
    async fn reply(&self, result: Result<Value, NwcError>) {
        let response = match result {
            Ok(value) => Response::ok(self.method, value),
            Err(error) => {
                tracing::info!(
                    app_id = self.app.id,
                    method = self.method,
                    code = ?error.code,
                    message = %error.message,
                    "NWC request failed"
                );
                Response::err(self.method, error)
            }
        };
        self.responder.send(response, None).await;
    }
}

pub(super) async fn dispatch(ctx: RequestContext<'_>) {
    match ctx.method {
        "get_info" => ctx.reply(info::get_info(&ctx).await).await,
        "get_balance" => ctx.reply(info::get_balance(&ctx).await).await,
        "get_budget" => ctx.reply(info::get_budget(&ctx)).await,
        "sign_message" => ctx.reply(info::sign_message(&ctx).await).await,
        "pay_invoice" => ctx.reply(payments::pay_invoice(&ctx).await).await,
        "pay_keysend" => ctx.reply(payments::pay_keysend(&ctx).await).await,
        "multi_pay_invoice" => payments::multi_pay_invoice(&ctx).await,
        "multi_pay_keysend" => payments::multi_pay_keysend(&ctx).await,
        "make_invoice" => ctx.reply(invoices::make_invoice(&ctx).await).await,
        "make_hold_invoice" => ctx.reply(invoices::make_hold_invoice(&ctx).await).await,
        "settle_hold_invoice" => ctx.reply(invoices::settle_hold_invoice(&ctx).await).await,
        "cancel_hold_invoice" => ctx.reply(invoices::cancel_hold_invoice(&ctx).await).await,
        "lookup_invoice" => ctx.reply(invoices::lookup_invoice(&ctx).await).await,
        "list_transactions" => ctx.reply(invoices::list_transactions(&ctx).await).await,
        other => {
            ctx.reply(Err(NwcError::new(
                super::protocol::NwcErrorCode::NotImplemented,
                format!("unknown method {other}"),
            )))
            .await
        }
    }
}
