// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! [`RpcHandler`] — method registry and dispatcher.
//!
//! Handlers are registered under a method name as either a synchronous
//! closure or an async closure returning a boxed future; the dispatcher
//! branches on the variant exactly once per call. Handlers receive the raw
//! `params` value (array, object, or absent) and report failures through
//! [`HandlerError`], which the dispatcher maps onto −32602 / −32603.
//!
//! Notifications (no id / null id) are executed for their side effects and
//! produce no response. A batch dispatches each element independently and
//! collects the responses of the elements that have one, preserving order.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::HandlerError;
use crate::protocol::{RequestId, RpcError, RpcRequest, RpcResponse};

type SyncFn = dyn Fn(Option<Value>) -> Result<Value, HandlerError> + Send + Sync;
type AsyncFn =
    dyn Fn(Option<Value>) -> BoxFuture<'static, Result<Value, HandlerError>> + Send + Sync;

/// A registered method handler.
///
/// The dynamic sync-vs-async introspection of a scripting runtime becomes a
/// tagged variant here; `dispatch` branches on it once.
#[derive(Clone)]
pub enum Method {
    Sync(Arc<SyncFn>),
    Async(Arc<AsyncFn>),
}

impl Method {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(Option<Value>) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        Method::Sync(Arc::new(f))
    }

    pub fn r#async<F>(f: F) -> Self
    where
        F: Fn(Option<Value>) -> BoxFuture<'static, Result<Value, HandlerError>>
            + Send
            + Sync
            + 'static,
    {
        Method::Async(Arc::new(f))
    }
}

/// What `handle_message` produced: one response, a batch, or nothing.
#[derive(Debug, Clone)]
pub enum RpcReply {
    Single(RpcResponse),
    Batch(Vec<RpcResponse>),
}

impl RpcReply {
    pub fn to_json(&self) -> String {
        match self {
            RpcReply::Single(r) => serde_json::to_string(r).unwrap_or_default(),
            RpcReply::Batch(rs) => serde_json::to_string(rs).unwrap_or_default(),
        }
    }
}

/// JSON-RPC 2.0 dispatcher.
#[derive(Default, Clone)]
pub struct RpcHandler {
    methods: HashMap<String, Method>,
}

impl RpcHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, method: impl Into<String>, handler: Method) {
        let method = method.into();
        tracing::debug!(%method, "registered method handler");
        self.methods.insert(method, handler);
    }

    pub fn register_sync<F>(&mut self, method: impl Into<String>, f: F)
    where
        F: Fn(Option<Value>) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        self.register(method, Method::sync(f));
    }

    pub fn register_async<F>(&mut self, method: impl Into<String>, f: F)
    where
        F: Fn(Option<Value>) -> BoxFuture<'static, Result<Value, HandlerError>>
            + Send
            + Sync
            + 'static,
    {
        self.register(method, Method::r#async(f));
    }

    pub fn unregister(&mut self, method: &str) {
        self.methods.remove(method);
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    pub fn method_names(&self) -> Vec<String> {
        self.methods.keys().cloned().collect()
    }

    /// Handle a raw JSON-RPC message (single request or batch).
    pub async fn handle_message(&self, message: &str) -> Option<RpcReply> {
        let data: Value = match serde_json::from_str(message) {
            Ok(v) => v,
            Err(_) => {
                return Some(RpcReply::Single(RpcResponse::failure(
                    RequestId::Null,
                    RpcError::parse_error(),
                )))
            }
        };
        self.handle_value(data).await
    }

    /// Handle an already-parsed JSON-RPC message.
    pub async fn handle_value(&self, data: Value) -> Option<RpcReply> {
        if let Value::Array(items) = data {
            if items.is_empty() {
                return Some(RpcReply::Single(RpcResponse::failure(
                    RequestId::Null,
                    RpcError::invalid_request("empty batch array"),
                )));
            }
            let mut responses = Vec::new();
            for item in items {
                if let Some(resp) = self.handle_single(&item).await {
                    responses.push(resp);
                }
            }
            if responses.is_empty() {
                // Batch of notifications only.
                return None;
            }
            return Some(RpcReply::Batch(responses));
        }

        self.handle_single(&data).await.map(RpcReply::Single)
    }

    async fn handle_single(&self, data: &Value) -> Option<RpcResponse> {
        let request = match RpcRequest::from_value(data) {
            Ok(req) => req,
            Err((err, id)) => {
                return Some(RpcResponse::failure(id.unwrap_or(RequestId::Null), err))
            }
        };
        self.dispatch(request).await
    }

    /// Dispatch one validated request; `None` for notifications.
    pub async fn dispatch(&self, request: RpcRequest) -> Option<RpcResponse> {
        let notification = request.is_notification();
        let respond = |outcome: Result<Value, RpcError>| {
            if notification {
                return None;
            }
            let id = request.id.clone().unwrap_or(RequestId::Null);
            Some(match outcome {
                Ok(result) => RpcResponse::success(id, result),
                Err(err) => RpcResponse::failure(id, err),
            })
        };

        let Some(handler) = self.methods.get(&request.method) else {
            tracing::debug!(method = %request.method, "method not found");
            return respond(Err(RpcError::method_not_found(&request.method)));
        };

        // Params must be positional (array), named (object), or absent.
        if let Some(p) = &request.params {
            if !p.is_array() && !p.is_object() {
                return respond(Err(RpcError::invalid_params(
                    "params must be array, object, or null",
                )));
            }
        }

        let outcome = match handler {
            Method::Sync(f) => f(request.params.clone()),
            Method::Async(f) => f(request.params.clone()).await,
        };

        let outcome = outcome.map_err(|e| match e {
            HandlerError::InvalidParams(msg) => {
                tracing::warn!(method = %request.method, "invalid params: {msg}");
                RpcError::invalid_params(msg)
            }
            HandlerError::Internal(msg) => {
                tracing::error!(method = %request.method, "handler error: {msg}");
                RpcError::internal_error(msg)
            }
        });

        respond(outcome)
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
