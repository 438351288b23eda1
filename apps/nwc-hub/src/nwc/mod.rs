// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # NWC Request Router
//!
//! Decrypts NIP-47 requests, checks the app's scopes, dispatches to the
//! method handlers and publishes the signed responses.
//!
//! ## Request lifecycle
//!
//! ```text
//! received ──► executing ──► executed | error
//!    │
//!    └──► expired   (expiration tag in the past)
//! ```
//!
//! Requests are recorded by nostr event id before anything else, so a relay
//! replaying an event never executes it twice.

mod handlers;
pub mod protocol;
mod responder;
mod router;

pub use protocol::{NwcError, NwcErrorCode, Request, Response};
pub use responder::Responder;
pub use router::NwcRouter;
