// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! [`McpServer`] — the MCP surface one agent exposes to the network.
//!
//! Wraps tool/resource/prompt registries behind the six conventional MCP
//! methods. The server is stateless: every call executes in isolation, and
//! a failing tool produces `isError: true` in the tool result rather than a
//! JSON-RPC error, so callers can distinguish protocol faults from tool
//! faults.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::error::HandlerError;
use crate::handler::{RpcHandler, RpcReply};
use crate::prompts::{McpPrompt, PromptHandler, PromptRegistry};
use crate::resources::{McpResource, ResourceHandler, ResourceRegistry};
use crate::tools::{McpTool, ToolHandler, ToolRegistry};

pub struct McpServer {
    name: String,
    handler: RpcHandler,
    tools: Arc<ToolRegistry>,
    resources: Arc<ResourceRegistry>,
    prompts: Arc<PromptRegistry>,
}

impl McpServer {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let tools = Arc::new(ToolRegistry::new());
        let resources = Arc::new(ResourceRegistry::new());
        let prompts = Arc::new(PromptRegistry::new());

        let mut handler = RpcHandler::new();

        let t = Arc::clone(&tools);
        handler.register_async("tools/list", move |_params| {
            let t = Arc::clone(&t);
            Box::pin(async move { Ok(json!({ "tools": t.list_tools() })) })
        });

        let t = Arc::clone(&tools);
        handler.register_async("tools/call", move |params| {
            let t = Arc::clone(&t);
            Box::pin(async move {
                let params = params.unwrap_or(Value::Null);
                let name = params
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| HandlerError::invalid_params("missing 'name'"))?
                    .to_string();
                let arguments = params
                    .get("arguments")
                    .cloned()
                    .unwrap_or_else(|| json!({}));
                Ok(tool_result(t.call_tool(&name, arguments).await))
            })
        });

        let r = Arc::clone(&resources);
        handler.register_async("resources/list", move |_params| {
            let r = Arc::clone(&r);
            Box::pin(async move { Ok(json!({ "resources": r.list_resources() })) })
        });

        let r = Arc::clone(&resources);
        handler.register_async("resources/read", move |params| {
            let r = Arc::clone(&r);
            Box::pin(async move {
                let params = params.unwrap_or(Value::Null);
                let uri = params
                    .get("uri")
                    .and_then(Value::as_str)
                    .ok_or_else(|| HandlerError::invalid_params("missing 'uri'"))?
                    .to_string();
                // Everything besides `uri` is passed through to the reader.
                let mut extra = params.as_object().cloned().unwrap_or_default();
                extra.remove("uri");
                match r.read_resource(&uri, Value::Object(extra)).await {
                    Ok(text) => {
                        let mime = r
                            .get_resource(&uri)
                            .map(|res| res.mime_type)
                            .unwrap_or_else(|| "text/plain".into());
                        Ok(json!({
                            "contents": [{ "uri": uri, "mimeType": mime, "text": text }]
                        }))
                    }
                    Err(e) => Ok(json!({ "contents": [], "error": e })),
                }
            })
        });

        let p = Arc::clone(&prompts);
        handler.register_async("prompts/list", move |_params| {
            let p = Arc::clone(&p);
            Box::pin(async move { Ok(json!({ "prompts": p.list_prompts() })) })
        });

        let p = Arc::clone(&prompts);
        handler.register_async("prompts/get", move |params| {
            let p = Arc::clone(&p);
            Box::pin(async move {
                let params = params.unwrap_or(Value::Null);
                let name = params
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| HandlerError::invalid_params("missing 'name'"))?
                    .to_string();
                let arguments = params
                    .get("arguments")
                    .cloned()
                    .unwrap_or_else(|| json!({}));
                match p.get_prompt_text(&name, arguments).await {
                    Ok(text) => {
                        let description = p
                            .get_prompt(&name)
                            .and_then(|pr| pr.description)
                            .unwrap_or_default();
                        Ok(json!({
                            "description": description,
                            "messages": [{
                                "role": "user",
                                "content": { "type": "text", "text": text }
                            }]
                        }))
                    }
                    Err(e) => Ok(json!({ "error": e })),
                }
            })
        });

        tracing::info!(server = %name, "MCP server initialized");
        Self {
            name,
            handler,
            tools,
            resources,
            prompts,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handle an incoming JSON-RPC message; `None` for notifications.
    pub async fn handle_message(&self, message: &str) -> Option<String> {
        self.handler
            .handle_message(message)
            .await
            .map(|reply| reply.to_json())
    }

    /// Handle an already-parsed JSON-RPC value.
    pub async fn handle_value(&self, value: Value) -> Option<RpcReply> {
        self.handler.handle_value(value).await
    }

    // ── Registration ──────────────────────────────────────────────────────────

    pub fn register_tool(&self, tool: McpTool, handler: ToolHandler) {
        self.tools.register(tool, handler);
    }

    pub fn register_function<F>(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Option<Value>,
        handler: F,
    ) where
        F: Fn(Value) -> futures::future::BoxFuture<'static, Result<Value, String>>
            + Send
            + Sync
            + 'static,
    {
        self.tools
            .register_function(name, description, input_schema, handler);
    }

    pub fn register_resource(&self, resource: McpResource, handler: ResourceHandler) {
        self.resources.register(resource, handler);
    }

    pub fn register_prompt(&self, prompt: McpPrompt, handler: PromptHandler) {
        self.prompts.register(prompt, handler);
    }

    // ── Introspection (used when announcing the agent into the registry) ──────

    pub fn tools(&self) -> Vec<McpTool> {
        self.tools.list_tools()
    }

    pub fn resources(&self) -> Vec<McpResource> {
        self.resources.list_resources()
    }

    pub fn prompts(&self) -> Vec<McpPrompt> {
        self.prompts.list_prompts()
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.has_tool(name)
    }
}

/// Convert a tool outcome into the MCP `tools/call` result shape.
fn tool_result(outcome: Result<Value, String>) -> Value {
    match outcome {
        Ok(value) => {
            let text = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            json!({
                "content": [{ "type": "text", "text": text }],
                "isError": false
            })
        }
        Err(e) => json!({
            "content": [{ "type": "text", "text": format!("Error: {e}") }],
            "isError": true
        }),
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
//
// Full request/response round-trips live in tests/integration.rs; these cover
// the result-shaping helpers.
