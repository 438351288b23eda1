// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! JSON-RPC 2.0 framing of LSPS messages.
//!
//! Every LSPS message is one JSON-RPC object carried in the payload of a
//! custom peer message of type [`LSPS_MESSAGE_TYPE`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::LspsError;

/// Custom message type reserved by LSPS0.
pub const LSPS_MESSAGE_TYPE: u32 = 37913;

const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JsonRpcMessage {
    Request {
        id: String,
        method: String,
        params: Value,
    },
    Response {
        id: String,
        result: Result<Value, RpcError>,
    },
    Notification {
        method: String,
        params: Value,
    },
}

#[derive(Serialize, Deserialize)]
struct RawMessage {
    jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

impl JsonRpcMessage {
    pub fn decode(bytes: &[u8]) -> Result<Self, LspsError> {
        let raw: RawMessage =
            serde_json::from_slice(bytes).map_err(|e| LspsError::Malformed(e.to_string()))?;
        if raw.jsonrpc != JSONRPC_VERSION {
            return Err(LspsError::Malformed(format!(
                "unsupported jsonrpc version {}",
                raw.jsonrpc
            )));
        }
        let params = raw.params.unwrap_or_else(|| Value::Object(Default::default()));
        match (raw.id, raw.method) {
            (Some(id), Some(method)) => Ok(Self::Request { id, method, params }),
            (None, Some(method)) => Ok(Self::Notification { method, params }),
            (Some(id), None) => {
                let result = match raw.error {
                    Some(error) => Err(error),
                    None => Ok(raw.result.unwrap_or(Value::Null)),
                };
                Ok(Self::Response { id, result })
            }
            (None, None) => Err(LspsError::Malformed("neither id nor method".into())),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, LspsError> {
        let mut raw = RawMessage {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: None,
            params: None,
            result: None,
            error: None,
        };
        match self {
            Self::Request { id, method, params } => {
                raw.id = Some(id.clone());
                raw.method = Some(method.clone());
                raw.params = Some(params.clone());
            }
            Self::Response { id, result } => {
                raw.id = Some(id.clone());
                match result {
                    Ok(value) => raw.result = Some(value.clone()),
                    Err(error) => raw.error = Some(error.clone()),
                }
            }
            Self::Notification { method, params } => {
                raw.method = Some(method.clone());
                raw.params = Some(params.clone());
            }
        }
        Ok(serde_json::to_vec(&raw)?)
    }
}

/// 16 random bytes, hex encoded.
pub fn new_request_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

/// LSPS amounts travel as decimal strings; numbers are accepted too.
pub(crate) mod amount {
    use serde::{de, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Wire {
        Text(String),
        Number(u64),
    }

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        match Wire::deserialize(deserializer)? {
            Wire::Number(n) => Ok(n),
            Wire::Text(s) => s.parse().map_err(de::Error::custom),
        }
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};

        #[derive(Deserialize)]
        struct Wrapped(#[serde(with = "super")] u64);

        pub fn serialize<S: Serializer>(value: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error> {
            match value {
                Some(v) => super::serialize(v, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
            Ok(Option::<Wrapped>::deserialize(deserializer)?.map(|w| w.0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_messages_by_id_and_method() {
        let request = br#"{"jsonrpc":"2.0","id":"ab","method":"lsps2.get_info","params":{}}"#;
        assert!(matches!(
            JsonRpcMessage::decode(request).unwrap(),
            JsonRpcMessage::Request { ref method, .. } if method == "lsps2.get_info"
        ));

        let error = br#"{"jsonrpc":"2.0","id":"ab","error":{"code":201,"message":"stale"}}"#;
        match JsonRpcMessage::decode(error).unwrap() {
            JsonRpcMessage::Response { id, result } => {
                assert_eq!(id, "ab");
                assert_eq!(result.unwrap_err().code, 201);
            }
            other => panic!("unexpected {other:?}"),
        }

        let notification = br#"{"jsonrpc":"2.0","method":"lsps5.payment_incoming"}"#;
        assert_eq!(
            JsonRpcMessage::decode(notification).unwrap(),
            JsonRpcMessage::Notification {
                method: "lsps5.payment_incoming".into(),
                params: json!({}),
            }
        );

        assert!(JsonRpcMessage::decode(br#"{"jsonrpc":"1.0","id":"x","result":1}"#).is_err());
        assert!(JsonRpcMessage::decode(br#"{"jsonrpc":"2.0"}"#).is_err());
    }

    #[test]
    fn request_ids_are_sixteen_random_bytes() {
        let a = new_request_id();
        assert_eq!(a.len(), 32);
        assert_ne!(a, new_request_id());
    }

    #[test]
    fn amounts_accept_strings_and_numbers() {
        #[derive(Deserialize, Serialize)]
        struct Row {
            #[serde(with = "amount")]
            fee: u64,
            #[serde(default, with = "amount::option")]
            cap: Option<u64>,
        }
        let row: Row = serde_json::from_value(json!({"fee": "1500", "cap": 7})).unwrap();
        assert_eq!((row.fee, row.cap), (1500, Some(7)));
        let row: Row = serde_json::from_value(json!({"fee": 2})).unwrap();
        assert_eq!(row.cap, None);
        assert_eq!(serde_json::to_value(&row).unwrap()["fee"], "2");
    }
}
