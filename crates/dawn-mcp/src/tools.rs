// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! MCP tool definitions and the per-agent tool registry.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Async tool implementation: receives the `arguments` object, returns the
/// raw result value or an error string (surfaced as `isError: true`).
pub type ToolHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

/// An MCP tool definition as it appears in `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct McpTool {
    pub name: String,
    pub description: String,
    /// JSON Schema describing the `arguments` object.
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

struct ToolEntry {
    tool: McpTool,
    handler: ToolHandler,
}

/// Registry of the tools one agent exposes.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, ToolEntry>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Re-registering a name replaces the previous tool.
    pub fn register(&self, tool: McpTool, handler: ToolHandler) {
        let mut tools = self.tools.write().unwrap();
        if tools.contains_key(&tool.name) {
            tracing::warn!(tool = %tool.name, "tool already registered, overwriting");
        }
        tools.insert(tool.name.clone(), ToolEntry { tool, handler });
    }

    /// Register an async closure as a tool.
    pub fn register_function<F>(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Option<Value>,
        handler: F,
    ) where
        F: Fn(Value) -> BoxFuture<'static, Result<Value, String>> + Send + Sync + 'static,
    {
        let tool = McpTool {
            name: name.into(),
            description: description.into(),
            input_schema: input_schema
                .unwrap_or_else(|| serde_json::json!({"type": "object", "properties": {}})),
        };
        self.register(tool, Arc::new(handler));
    }

    pub fn unregister(&self, name: &str) {
        self.tools.write().unwrap().remove(name);
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.read().unwrap().contains_key(name)
    }

    /// Tool definitions for `tools/list`.
    pub fn list_tools(&self) -> Vec<McpTool> {
        let mut tools: Vec<McpTool> = self
            .tools
            .read()
            .unwrap()
            .values()
            .map(|e| e.tool.clone())
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Execute a tool by name with the given arguments object.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, String> {
        let handler = {
            let tools = self.tools.read().unwrap();
            match tools.get(name) {
                Some(entry) => Arc::clone(&entry.handler),
                None => return Err(format!("tool '{name}' not found")),
            }
        };
        handler(arguments).await
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
