// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! JSON-RPC 2.0 wire types.
//!
//! Specification: <https://www.jsonrpc.org/specification>. Parsing is strict:
//! `jsonrpc` must equal `"2.0"`, `method` must be a string, and `id` — when
//! present — must be a string, a number, or null. Anything else is an
//! Invalid Request (−32600); unparseable JSON is a Parse Error (−32700).

use serde::{Deserialize, Serialize};
use serde_json::Value;

// JSON-RPC 2.0 standard error codes. Server codes −32000..−32099 are reserved.
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

/// A request id: string, number, or null.
///
/// A request whose `id` is absent *or* null is a notification and produces no
/// response; `Null` still exists as a value because error responses for
/// unparseable requests carry `"id": null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Str(String),
    Num(i64),
    Null,
}

impl RequestId {
    /// Extract an id from a raw JSON value, if it is a legal id type.
    pub fn from_value(v: &Value) -> Option<RequestId> {
        match v {
            Value::String(s) => Some(RequestId::Str(s.clone())),
            Value::Number(n) => n.as_i64().map(RequestId::Num),
            Value::Null => Some(RequestId::Null),
            _ => None,
        }
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Str(s) => write!(f, "{s}"),
            RequestId::Num(n) => write!(f, "{n}"),
            RequestId::Null => write!(f, "null"),
        }
    }
}

/// A validated JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
}

impl RpcRequest {
    pub fn new(method: impl Into<String>, params: Option<Value>, id: Option<RequestId>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params,
            id,
        }
    }

    /// True when this request expects no response.
    pub fn is_notification(&self) -> bool {
        matches!(self.id, None | Some(RequestId::Null))
    }

    /// Validate and build a request from a raw JSON value.
    ///
    /// Returns `Err` with the Invalid Request error (and the element's id, if
    /// one could be extracted) so batch handling can respond per element.
    pub fn from_value(v: &Value) -> Result<RpcRequest, (RpcError, Option<RequestId>)> {
        let obj = match v.as_object() {
            Some(o) => o,
            None => {
                return Err((
                    RpcError::invalid_request("request must be an object"),
                    None,
                ))
            }
        };

        let id = match obj.get("id") {
            None => None,
            Some(raw) => match RequestId::from_value(raw) {
                Some(id) => Some(id),
                None => {
                    return Err((
                        RpcError::invalid_request("'id' must be string, number, or null"),
                        None,
                    ))
                }
            },
        };

        if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            return Err((
                RpcError::invalid_request("missing or invalid 'jsonrpc' field"),
                id,
            ));
        }

        let method = match obj.get("method") {
            Some(Value::String(m)) => m.clone(),
            Some(_) => {
                return Err((RpcError::invalid_request("'method' must be a string"), id))
            }
            None => return Err((RpcError::invalid_request("missing 'method' field"), id)),
        };

        Ok(RpcRequest {
            jsonrpc: "2.0".into(),
            method,
            params: obj.get("params").cloned(),
            id,
        })
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            code,
            message: message.into(),
            data,
        }
    }

    pub fn parse_error() -> Self {
        Self::new(PARSE_ERROR, "Parse error", None)
    }

    pub fn invalid_request(detail: impl Into<String>) -> Self {
        Self::new(
            INVALID_REQUEST,
            "Invalid Request",
            Some(Value::String(detail.into())),
        )
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            METHOD_NOT_FOUND,
            "Method not found",
            Some(serde_json::json!({ "method": method })),
        )
    }

    pub fn invalid_params(detail: impl Into<String>) -> Self {
        Self::new(
            INVALID_PARAMS,
            "Invalid params",
            Some(Value::String(detail.into())),
        )
    }

    pub fn internal_error(detail: impl Into<String>) -> Self {
        Self::new(
            INTERNAL_ERROR,
            "Internal error",
            Some(Value::String(detail.into())),
        )
    }
}

/// A JSON-RPC 2.0 response — exactly one of `result` / `error` is present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: RequestId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: RequestId, error: RpcError) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn valid_request_parses() {
        let v = json!({"jsonrpc": "2.0", "method": "ping", "params": [1, 2], "id": 7});
        let req = RpcRequest::from_value(&v).unwrap();
        assert_eq!(req.method, "ping");
        assert_eq!(req.id, Some(RequestId::Num(7)));
        assert!(!req.is_notification());
    }

    #[test]
    fn missing_jsonrpc_is_invalid() {
        let v = json!({"method": "ping", "id": 1});
        let (err, id) = RpcRequest::from_value(&v).unwrap_err();
        assert_eq!(err.code, INVALID_REQUEST);
        assert_eq!(id, Some(RequestId::Num(1)));
    }

    #[test]
    fn wrong_jsonrpc_version_is_invalid() {
        let v = json!({"jsonrpc": "1.0", "method": "ping", "id": 1});
        assert!(RpcRequest::from_value(&v).is_err());
    }

    #[test]
    fn non_string_method_is_invalid() {
        let v = json!({"jsonrpc": "2.0", "method": 42, "id": 1});
        assert!(RpcRequest::from_value(&v).is_err());
    }

    #[test]
    fn bool_id_is_invalid() {
        let v = json!({"jsonrpc": "2.0", "method": "ping", "id": true});
        assert!(RpcRequest::from_value(&v).is_err());
    }

    #[test]
    fn null_and_absent_id_are_notifications() {
        let with_null = json!({"jsonrpc": "2.0", "method": "ping", "id": null});
        assert!(RpcRequest::from_value(&with_null).unwrap().is_notification());
        let absent = json!({"jsonrpc": "2.0", "method": "ping"});
        assert!(RpcRequest::from_value(&absent).unwrap().is_notification());
    }

    #[test]
    fn response_serializes_only_one_branch() {
        let ok = RpcResponse::success(RequestId::Num(1), json!({"v": 1}));
        let text = serde_json::to_string(&ok).unwrap();
        assert!(text.contains("result"));
        assert!(!text.contains("error"));

        let err = RpcResponse::failure(RequestId::Null, RpcError::parse_error());
        let text = serde_json::to_string(&err).unwrap();
        assert!(text.contains("error"));
        assert!(!text.contains("result"));
        assert!(text.contains("\"id\":null"));
    }

    #[test]
    fn request_id_round_trips_through_json() {
        for id in [
            RequestId::Str("abc".into()),
            RequestId::Num(-3),
            RequestId::Null,
        ] {
            let text = serde_json::to_string(&id).unwrap();
            let back: RequestId = serde_json::from_str(&text).unwrap();
            assert_eq!(id, back);
        }
    }
}
