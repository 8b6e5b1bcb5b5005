// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! End-to-end MCP server tests: JSON in, JSON out, no transport.

use std::sync::Arc;

use dawn_mcp::resources::McpResource;
use dawn_mcp::McpServer;
use serde_json::{json, Value};

fn echo_server() -> McpServer {
    let server = McpServer::new("test-agent");
    server.register_function(
        "echo",
        "echo the text argument back",
        Some(json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"]
        })),
        |args| {
            Box::pin(async move {
                args.get("text")
                    .and_then(Value::as_str)
                    .map(|s| Value::String(s.to_string()))
                    .ok_or_else(|| "missing 'text' argument".to_string())
            })
        },
    );
    server
}

async fn call(server: &McpServer, msg: &str) -> Value {
    let reply = server.handle_message(msg).await.expect("expected a reply");
    serde_json::from_str(&reply).unwrap()
}

// ── tools ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn tools_list_includes_schema() {
    let server = echo_server();
    let resp = call(
        &server,
        r#"{"jsonrpc":"2.0","method":"tools/list","id":1}"#,
    )
    .await;
    let tools = &resp["result"]["tools"];
    assert_eq!(tools[0]["name"], "echo");
    assert_eq!(tools[0]["inputSchema"]["required"][0], "text");
}

#[tokio::test]
async fn tools_call_round_trip() {
    let server = echo_server();
    let resp = call(
        &server,
        r#"{"jsonrpc":"2.0","method":"tools/call","params":{"name":"echo","arguments":{"text":"hi"}},"id":1}"#,
    )
    .await;
    assert_eq!(
        resp["result"],
        json!({
            "content": [{ "type": "text", "text": "hi" }],
            "isError": false
        })
    );
    assert_eq!(resp["id"], 1);
}

#[tokio::test]
async fn failing_tool_is_is_error_not_rpc_error() {
    let server = echo_server();
    let resp = call(
        &server,
        r#"{"jsonrpc":"2.0","method":"tools/call","params":{"name":"echo","arguments":{}},"id":2}"#,
    )
    .await;
    assert!(resp.get("error").is_none());
    assert_eq!(resp["result"]["isError"], true);
}

#[tokio::test]
async fn unknown_tool_is_is_error() {
    let server = echo_server();
    let resp = call(
        &server,
        r#"{"jsonrpc":"2.0","method":"tools/call","params":{"name":"nope"},"id":3}"#,
    )
    .await;
    assert_eq!(resp["result"]["isError"], true);
}

#[tokio::test]
async fn tools_call_without_name_is_invalid_params() {
    let server = echo_server();
    let resp = call(
        &server,
        r#"{"jsonrpc":"2.0","method":"tools/call","params":{},"id":4}"#,
    )
    .await;
    assert_eq!(resp["error"]["code"], -32602);
}

// ── resources ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn resources_read_round_trip() {
    let server = echo_server();
    server.register_resource(
        McpResource {
            uri: "dawn://motd".into(),
            name: "motd".into(),
            description: None,
            mime_type: "text/plain".into(),
        },
        Arc::new(|_| Box::pin(async { Ok("welcome".to_string()) })),
    );

    let resp = call(
        &server,
        r#"{"jsonrpc":"2.0","method":"resources/read","params":{"uri":"dawn://motd"},"id":5}"#,
    )
    .await;
    let contents = &resp["result"]["contents"][0];
    assert_eq!(contents["uri"], "dawn://motd");
    assert_eq!(contents["mimeType"], "text/plain");
    assert_eq!(contents["text"], "welcome");
}

#[tokio::test]
async fn resources_read_unknown_uri_reports_error_field() {
    let server = echo_server();
    let resp = call(
        &server,
        r#"{"jsonrpc":"2.0","method":"resources/read","params":{"uri":"dawn://nope"},"id":6}"#,
    )
    .await;
    assert_eq!(resp["result"]["contents"], json!([]));
    assert!(resp["result"]["error"].is_string());
}

// ── prompts ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn prompts_get_round_trip() {
    use dawn_mcp::prompts::McpPrompt;
    let server = echo_server();
    server.register_prompt(
        McpPrompt {
            name: "summarize".into(),
            description: Some("summarize some text".into()),
            arguments: vec![json!({"name": "text", "required": true})],
        },
        Arc::new(|args| {
            Box::pin(async move {
                Ok(format!(
                    "Summarize: {}",
                    args["text"].as_str().unwrap_or_default()
                ))
            })
        }),
    );

    let resp = call(
        &server,
        r#"{"jsonrpc":"2.0","method":"prompts/get","params":{"name":"summarize","arguments":{"text":"abc"}},"id":7}"#,
    )
    .await;
    assert_eq!(resp["result"]["description"], "summarize some text");
    assert_eq!(
        resp["result"]["messages"][0]["content"]["text"],
        "Summarize: abc"
    );
}

// ── protocol behavior through the server ──────────────────────────────────────

#[tokio::test]
async fn notification_yields_no_reply() {
    let server = echo_server();
    assert!(server
        .handle_message(r#"{"jsonrpc":"2.0","method":"tools/list"}"#)
        .await
        .is_none());
}

#[tokio::test]
async fn batch_of_three_preserves_order() {
    let server = echo_server();
    let msg = r#"[
        {"jsonrpc":"2.0","method":"tools/list","id":1},
        {"jsonrpc":"2.0","method":"prompts/list","id":2},
        {"jsonrpc":"2.0","method":"resources/list","id":3}
    ]"#;
    let reply = server.handle_message(msg).await.unwrap();
    let parsed: Value = serde_json::from_str(&reply).unwrap();
    let arr = parsed.as_array().unwrap();
    assert_eq!(arr.len(), 3);
    assert_eq!(arr[0]["id"], 1);
    assert_eq!(arr[1]["id"], 2);
    assert_eq!(arr[2]["id"], 3);
}

#[tokio::test]
async fn unknown_method_is_32601() {
    let server = echo_server();
    let resp = call(
        &server,
        r#"{"jsonrpc":"2.0","method":"does/not/exist","id":9}"#,
    )
    .await;
    assert_eq!(resp["error"]["code"], -32601);
}
