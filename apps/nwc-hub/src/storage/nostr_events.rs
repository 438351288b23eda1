// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Log of inbound NWC request events and the responses published for them.
//!
//! The nostr-id index makes request handling idempotent against relays
//! replaying an event we already processed.

use chrono::{DateTime, Utc};
use redb::{ReadableTable, ReadableTableMetadata, TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};

use super::transactions::index_ids;
use super::{decode, index_key, next_id, Db, DbError, DbResult};

// =============================================================================
// Table Definitions
// =============================================================================

pub(crate) const REQUEST_EVENTS: TableDefinition<u64, &[u8]> = TableDefinition::new("request_events");

pub(crate) const REQUEST_EVENT_NOSTR_INDEX: TableDefinition<&str, u64> =
    TableDefinition::new("request_event_nostr_index");

pub(crate) const RESPONSE_EVENTS: TableDefinition<u64, &[u8]> = TableDefinition::new("response_events");

/// `request_id|response_id` → response id.
pub(crate) const RESPONSE_EVENTS_INDEX: TableDefinition<&str, u64> =
    TableDefinition::new("response_events_index");

const REQUEST_COUNTER: &str = "request_events";
const RESPONSE_COUNTER: &str = "response_events";

pub(crate) fn create_tables(txn: &WriteTransaction) -> DbResult<()> {
    let _ = txn.open_table(REQUEST_EVENTS)?;
    let _ = txn.open_table(REQUEST_EVENT_NOSTR_INDEX)?;
    let _ = txn.open_table(RESPONSE_EVENTS)?;
    let _ = txn.open_table(RESPONSE_EVENTS_INDEX)?;
    Ok(())
}

// =============================================================================
// Row Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestEventState {
    Received,
    Executing,
    Executed,
    Error,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEvent {
    pub id: u64,
    pub app_id: Option<u64>,
    pub nostr_id: String,
    pub method: Option<String>,
    pub state: RequestEventState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseEventState {
    Published,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEvent {
    pub id: u64,
    pub request_id: u64,
    pub nostr_id: String,
    pub state: ResponseEventState,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// NostrEventStore
// =============================================================================

#[derive(Clone, Copy)]
pub struct NostrEventStore<'a> {
    db: &'a Db,
}

impl<'a> NostrEventStore<'a> {
    pub fn new(db: &'a Db) -> Self {
        Self { db }
    }

    /// Record a freshly received request. Returns `None` if this nostr event
    /// was already recorded.
    pub fn record_request(&self, app_id: Option<u64>, nostr_id: &str) -> DbResult<Option<RequestEvent>> {
        let write_txn = self.db.begin_write()?;
        let event = {
            let mut index = write_txn.open_table(REQUEST_EVENT_NOSTR_INDEX)?;
            if index.get(nostr_id)?.is_some() {
                return Ok(None);
            }
            let now = Utc::now();
            let event = RequestEvent {
                id: next_id(&write_txn, REQUEST_COUNTER)?,
                app_id,
                nostr_id: nostr_id.to_string(),
                method: None,
                state: RequestEventState::Received,
                created_at: now,
                updated_at: now,
            };
            index.insert(nostr_id, event.id)?;
            let json = serde_json::to_vec(&event)?;
            let mut table = write_txn.open_table(REQUEST_EVENTS)?;
            table.insert(event.id, json.as_slice())?;
            event
        };
        write_txn.commit()?;
        Ok(Some(event))
    }

    pub fn update_request(
        &self,
        id: u64,
        state: RequestEventState,
        method: Option<&str>,
    ) -> DbResult<RequestEvent> {
        let write_txn = self.db.begin_write()?;
        let event = {
            let mut table = write_txn.open_table(REQUEST_EVENTS)?;
            let mut event: RequestEvent = match table.get(id)? {
                Some(value) => decode(value.value())?,
                None => return Err(DbError::NotFound(format!("request event {id}"))),
            };
            event.state = state;
            if let Some(method) = method {
                event.method = Some(method.to_string());
            }
            event.updated_at = Utc::now();
            let json = serde_json::to_vec(&event)?;
            table.insert(id, json.as_slice())?;
            event
        };
        write_txn.commit()?;
        Ok(event)
    }

    pub fn get_request(&self, id: u64) -> DbResult<Option<RequestEvent>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(REQUEST_EVENTS)?;
        match table.get(id)? {
            Some(value) => Ok(Some(decode(value.value())?)),
            None => Ok(None),
        }
    }

    pub fn record_response(
        &self,
        request_id: u64,
        nostr_id: &str,
        state: ResponseEventState,
    ) -> DbResult<ResponseEvent> {
        let write_txn = self.db.begin_write()?;
        let response = ResponseEvent {
            id: next_id(&write_txn, RESPONSE_COUNTER)?,
            request_id,
            nostr_id: nostr_id.to_string(),
            state,
            created_at: Utc::now(),
        };
        {
            let json = serde_json::to_vec(&response)?;
            let mut table = write_txn.open_table(RESPONSE_EVENTS)?;
            table.insert(response.id, json.as_slice())?;
            let mut index = write_txn.open_table(RESPONSE_EVENTS_INDEX)?;
            index.insert(
                index_key(&request_id.to_string(), response.id).as_str(),
                response.id,
            )?;
        }
        write_txn.commit()?;
        Ok(response)
    }

    pub fn responses_for(&self, request_id: u64) -> DbResult<Vec<ResponseEvent>> {
        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_table(RESPONSE_EVENTS_INDEX)?;
        let table = read_txn.open_table(RESPONSE_EVENTS)?;
        let mut responses = Vec::new();
        for id in index_ids(&index, &request_id.to_string())? {
            if let Some(value) = table.get(id)? {
                responses.push(decode(value.value())?);
            }
        }
        Ok(responses)
    }

    pub fn count_requests(&self) -> DbResult<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(REQUEST_EVENTS)?;
        Ok(table.len()?)
    }

    /// Delete the oldest request events (with their responses) beyond the
    /// newest `keep`, at most `max_delete` per call.
    pub fn delete_excess(&self, keep: u64, max_delete: usize) -> DbResult<usize> {
        let write_txn = self.db.begin_write()?;
        let deleted = {
            let mut requests = write_txn.open_table(REQUEST_EVENTS)?;
            let total = requests.len()?;
            if total <= keep {
                return Ok(0);
            }
            let excess = usize::try_from(total - keep).unwrap_or(usize::MAX);
            let limit = excess.min(max_delete);

            let mut victims: Vec<(u64, String)> = Vec::with_capacity(limit);
            for entry in requests.iter()?.take(limit) {
                let (id, value) = entry?;
                let event: RequestEvent = decode(value.value())?;
                victims.push((id.value(), event.nostr_id));
            }

            let mut nostr_index = write_txn.open_table(REQUEST_EVENT_NOSTR_INDEX)?;
            let mut responses = write_txn.open_table(RESPONSE_EVENTS)?;
            let mut response_index = write_txn.open_table(RESPONSE_EVENTS_INDEX)?;
            for (id, nostr_id) in &victims {
                requests.remove(*id)?;
                nostr_index.remove(nostr_id.as_str())?;
                let response_ids = index_ids(&response_index, &id.to_string())?;
                for response_id in response_ids {
                    responses.remove(response_id)?;
                    response_index.remove(index_key(&id.to_string(), response_id).as_str())?;
                }
            }
            victims.len()
        };
        write_txn.commit()?;
        Ok(deleted)
    }
}
