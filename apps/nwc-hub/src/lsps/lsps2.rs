// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! LSPS2: just-in-time channels.
//!
//! The client asks for a menu of opening fee parameters, picks one and buys
//! a channel for a payment size. The LSP answers with an intercept SCID that
//! goes into the invoice's route hint.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use super::jsonrpc::amount;
use super::transport::{PendingRequests, RpcChannel};
use super::LspsError;

/// `invalid_opening_fee_params` in LSPS2.
pub const ERROR_INVALID_PARAMS: i64 = 201;
/// Legacy "expired promise" code of older flspd servers.
pub const ERROR_LEGACY_EXPIRED_PROMISE: i64 = 100;

/// Opening fee parameters as offered by the LSP. Milli-unit amounts are
/// named `*_mloki` on the wire; standard `*_msat` names are accepted too.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpeningFeeParams {
    #[serde(rename = "min_fee_mloki", alias = "min_fee_msat", with = "amount")]
    pub min_fee_msat: u64,
    pub proportional: u32,
    /// Kept verbatim: the promise covers the exact string.
    pub valid_until: String,
    pub min_lifetime: u32,
    pub max_client_to_self_delay: u32,
    #[serde(
        rename = "min_payment_size_mloki",
        alias = "min_payment_size_msat",
        with = "amount"
    )]
    pub min_payment_size_msat: u64,
    #[serde(
        rename = "max_payment_size_mloki",
        alias = "max_payment_size_msat",
        with = "amount"
    )]
    pub max_payment_size_msat: u64,
    pub promise: String,
}

impl OpeningFeeParams {
    /// `max(min_fee, ceil(size * proportional / 1e6))`, or `None` on overflow.
    pub fn fee_msat(&self, payment_size_msat: u64) -> Option<u64> {
        let product = u128::from(payment_size_msat).checked_mul(u128::from(self.proportional))?;
        let proportional = product.div_ceil(1_000_000);
        let proportional = u64::try_from(proportional).ok()?;
        Some(proportional.max(self.min_fee_msat))
    }

    pub fn valid_until(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.valid_until)
            .ok()
            .map(|at| at.with_timezone(&Utc))
    }

    pub fn is_usable_for(&self, payment_size_msat: u64, now: DateTime<Utc>) -> bool {
        (self.min_payment_size_msat..=self.max_payment_size_msat).contains(&payment_size_msat)
            && self.valid_until().is_some_and(|until| until > now)
    }

    /// HMAC-SHA256 over the big-endian field concatenation, keyed by the
    /// LSP's secret.
    pub fn compute_promise(&self, secret: &[u8]) -> Result<String, LspsError> {
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(secret)
            .map_err(|e| LspsError::Malformed(e.to_string()))?;
        mac.update(&self.min_fee_msat.to_be_bytes());
        mac.update(&self.proportional.to_be_bytes());
        mac.update(self.valid_until.as_bytes());
        mac.update(&self.min_lifetime.to_be_bytes());
        mac.update(&self.max_client_to_self_delay.to_be_bytes());
        mac.update(&self.min_payment_size_msat.to_be_bytes());
        mac.update(&self.max_payment_size_msat.to_be_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

/// Cheapest menu entry that covers the payment size and is still valid.
pub fn select_params(
    menu: &[OpeningFeeParams],
    payment_size_msat: u64,
    now: DateTime<Utc>,
) -> Option<&OpeningFeeParams> {
    menu.iter()
        .filter(|p| p.is_usable_for(payment_size_msat, now))
        .filter_map(|p| p.fee_msat(payment_size_msat).map(|fee| (fee, p)))
        .min_by_key(|(fee, _)| *fee)
        .map(|(_, p)| p)
}

/// Decode a `BLOCKxTXxOUTPUT` short channel id.
pub fn parse_scid(scid: &str) -> Result<u64, LspsError> {
    let invalid = || LspsError::InvalidScid(scid.to_string());
    let mut parts = scid.split('x');
    let (Some(block), Some(tx), Some(output), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(invalid());
    };
    let block: u64 = block.parse().map_err(|_| invalid())?;
    let tx: u64 = tx.parse().map_err(|_| invalid())?;
    let output: u64 = output.parse().map_err(|_| invalid())?;
    if block >= 1 << 24 || tx >= 1 << 24 || output >= 1 << 16 {
        return Err(invalid());
    }
    Ok((block << 40) | (tx << 16) | output)
}

pub fn format_scid(scid: u64) -> String {
    format!("{}x{}x{}", scid >> 40, (scid >> 16) & 0xff_ffff, scid & 0xffff)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lsps2GetInfoResult {
    #[serde(default)]
    pub opening_fee_params_menu: Vec<OpeningFeeParams>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lsps2BuyResult {
    pub jit_channel_scid: String,
    pub lsp_cltv_expiry_delta: u16,
    #[serde(default)]
    pub client_trusts_lsp: bool,
}

#[derive(Serialize)]
struct GetInfoParams<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<&'a str>,
}

#[derive(Serialize)]
struct BuyParams<'a> {
    opening_fee_params: &'a OpeningFeeParams,
    #[serde(rename = "payment_size_mloki", with = "amount")]
    payment_size_msat: u64,
}

/// LSPS2 client; `get_info` and `buy` are tracked in separate maps.
pub(crate) struct Lsps2Client {
    rpc: RpcChannel,
    pub(crate) pending_get_info: PendingRequests,
    pub(crate) pending_buy: PendingRequests,
}

impl Lsps2Client {
    pub fn new(rpc: RpcChannel) -> Self {
        Self {
            rpc,
            pending_get_info: PendingRequests::new("lsps2.get_info"),
            pending_buy: PendingRequests::new("lsps2.buy"),
        }
    }

    pub async fn get_info(
        &self,
        peer: &str,
        token: Option<&str>,
    ) -> Result<Lsps2GetInfoResult, LspsError> {
        self.rpc
            .call(&self.pending_get_info, peer, "lsps2.get_info", &GetInfoParams { token })
            .await
    }

    pub async fn buy(
        &self,
        peer: &str,
        params: &OpeningFeeParams,
        payment_size_msat: u64,
    ) -> Result<Lsps2BuyResult, LspsError> {
        self.rpc
            .call(
                &self.pending_buy,
                peer,
                "lsps2.buy",
                &BuyParams {
                    opening_fee_params: params,
                    payment_size_msat,
                },
            )
            .await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub const SECRET: &[u8] = b"lsp-promise-secret";

    pub fn params(min_fee_msat: u64, proportional: u32, valid_until: DateTime<Utc>) -> OpeningFeeParams {
        let mut params = OpeningFeeParams {
            min_fee_msat,
            proportional,
            valid_until: valid_until.to_rfc3339(),
            min_lifetime: 1008,
            max_client_to_self_delay: 2016,
            min_payment_size_msat: 1_000,
            max_payment_size_msat: 1_000_000_000,
            promise: String::new(),
        };
        params.promise = params.compute_promise(SECRET).unwrap();
        params
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{params, SECRET};
    use super::*;
    use chrono::Duration;

    #[test]
    fn scid_round_trips_and_matches_the_known_value() {
        assert_eq!(parse_scid("800000x1x1").unwrap(), 879_609_302_220_865_537);
        assert_eq!(format_scid(879_609_302_220_865_537), "800000x1x1");
        let max = parse_scid("16777215x16777215x65535").unwrap();
        assert_eq!(format_scid(max), "16777215x16777215x65535");
        assert!(parse_scid("16777216x0x0").is_err());
        assert!(parse_scid("1x2").is_err());
        assert!(parse_scid("1x2x3x4").is_err());
        assert!(parse_scid("axbxc").is_err());
    }

    #[test]
    fn fee_is_the_larger_of_minimum_and_rounded_up_proportional() {
        let p = params(2_000, 1_000, Utc::now());
        assert_eq!(p.fee_msat(1_000_000), Some(2_000));
        assert_eq!(p.fee_msat(10_000_001), Some(10_001));
    }

    #[test]
    fn selection_skips_expired_and_out_of_range_entries() {
        let now = Utc::now();
        let cheap_but_expired = params(100, 0, now - Duration::minutes(1));
        let mut too_small = params(200, 0, now + Duration::hours(1));
        too_small.max_payment_size_msat = 5_000;
        let pricey = params(5_000, 100, now + Duration::hours(1));
        let fair = params(3_000, 100, now + Duration::hours(1));
        let menu = vec![cheap_but_expired, too_small, pricey, fair.clone()];
        assert_eq!(select_params(&menu, 50_000, now), Some(&fair));
        assert_eq!(select_params(&menu, 2_000_000_000, now), None);
    }

    #[test]
    fn promise_is_reproducible_until_a_field_changes() {
        let p = params(2_000, 1_000, Utc::now());
        assert_eq!(p.compute_promise(SECRET).unwrap(), p.promise);
        let mut tampered = p.clone();
        tampered.min_fee_msat += 1;
        assert_ne!(tampered.compute_promise(SECRET).unwrap(), p.promise);
        assert_ne!(p.compute_promise(b"other").unwrap(), p.promise);
    }

    #[test]
    fn wire_names_use_milli_units() {
        let p = params(2_000, 1_000, Utc::now());
        let wire = serde_json::to_value(&p).unwrap();
        assert_eq!(wire["min_fee_mloki"], "2000");
        let legacy = serde_json::json!({
            "min_fee_msat": "10", "proportional": 0, "valid_until": p.valid_until,
            "min_lifetime": 1, "max_client_to_self_delay": 1,
            "min_payment_size_msat": "1", "max_payment_size_msat": "2", "promise": "00"
        });
        let parsed: OpeningFeeParams = serde_json::from_value(legacy).unwrap();
        assert_eq!(parsed.min_fee_msat, 10);
    }
}
