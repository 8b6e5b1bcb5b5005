// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! `dawn-mcp` — JSON-RPC 2.0 message protocol and the MCP agent surface.
//!
//! Agents in the dawn network speak MCP: a JSON-RPC 2.0 dialect with the
//! conventional methods `tools/list`, `tools/call`, `resources/list`,
//! `resources/read`, `prompts/list`, `prompts/get`. This crate provides the
//! strict protocol layer ([`protocol`]), a dispatcher that routes method
//! names to registered sync or async handlers ([`handler`]), and the
//! [`McpServer`] an agent exposes to the rest of the network.
//!
//! # Architecture
//!
//! ```text
//! inbound JSON text
//!       │  parse + validate (−32700 / −32600)
//!       ▼
//! RpcHandler::handle_message          batch / single / notification
//!       │  method lookup (−32601)
//!       ▼
//! Method::Sync(f) | Method::Async(f)  (−32602 / −32603 on failure)
//!       │
//!       ▼
//! McpServer registries  ──►  tools / resources / prompts
//! ```

pub mod error;
pub mod handler;
pub mod prompts;
pub mod protocol;
pub mod resources;
pub mod server;
pub mod tools;

pub use error::HandlerError;
pub use handler::{Method, RpcHandler, RpcReply};
pub use protocol::{RequestId, RpcError, RpcRequest, RpcResponse};
pub use server::McpServer;
pub use tools::{McpTool, ToolRegistry};
