// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Zero-conf policy for inbound channels.

use crate::lnclient::{ChannelAcceptRequest, ChannelAcceptResponse};

/// Every inbound channel is accepted. Channels from an active LSP that we
/// are expecting a JIT channel from skip confirmations; all others need one.
pub fn decide(request: &ChannelAcceptRequest, expecting_jit_from_lsp: bool) -> ChannelAcceptResponse {
    if expecting_jit_from_lsp {
        ChannelAcceptResponse {
            id: request.id,
            accept: true,
            min_accept_depth: 0,
            zero_conf: true,
        }
    } else {
        ChannelAcceptResponse {
            id: request.id,
            accept: true,
            min_accept_depth: 1,
            zero_conf: false,
        }
    }
}
