// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::sync::Arc;

use crate::error::ApiError;
use crate::startup::{Gateway, Running};

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
}

impl AppState {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    /// Services of the running node, or 503.
    pub fn running(&self) -> Result<Arc<Running>, ApiError> {
        self.gateway.running().ok_or_else(ApiError::not_running)
    }
}
