// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

/// Largest payment amount accepted: the 21M coin supply in milli-units.
pub const MAX_AMOUNT_MSAT: u64 = 2_100_000_000_000_000_000;

/// Floor of the routing-fee reserve carved out of every outgoing payment.
pub const MIN_FEE_RESERVE_MSAT: u64 = 10_000;

/// `max(⌈amount · 1%⌉, 10 000 msat)`
pub fn fee_reserve_msat(amount_msat: u64) -> u64 {
    amount_msat.div_ceil(100).max(MIN_FEE_RESERVE_MSAT)
}
