// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::net::TcpListener as StdTcpListener;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde_json::{json, Value};
use tracing_subscriber::{filter::EnvFilter, fmt};

use cli::Cli;
use dawn_crypto::NodeIdentity;
use dawn_mcp::McpServer;
use dawn_p2p::{DawnNode, NodeConfig};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    if let Err(e) = run(cli).await {
        tracing::error!("fatal: {e:#}");
        std::process::exit(1);
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    fmt().with_env_filter(filter).init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    // ── Listener address (env overrides, free-port fallback) ─────────────────
    let (host, desired_port) = parse_listen(&cli.listen)
        .with_context(|| format!("invalid listen address '{}'", cli.listen))?;
    let host = std::env::var("PROJECT_DAWN_HOST").unwrap_or(host);
    let desired_port = std::env::var("PROJECT_DAWN_WS_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(desired_port);
    let port = pick_port(&host, desired_port);
    if port != desired_port {
        tracing::warn!("port {desired_port} unavailable, using {port}");
    }

    // ── Identity ─────────────────────────────────────────────────────────────
    let data_dir = if cli.ephemeral {
        None
    } else {
        Some(cli.data_dir.clone().unwrap_or_else(default_data_dir))
    };
    let identity = match &data_dir {
        Some(dir) => NodeIdentity::load_or_create(&dir.join("vault/node_identity.key"))
            .context("loading node identity")?,
        None => NodeIdentity::generate(),
    };
    tracing::info!("node id: {}…", &identity.node_id()[..16]);

    // ── Node ─────────────────────────────────────────────────────────────────
    let mut config = NodeConfig::new(format!("ws://{host}:{port}"));
    config.data_dir = data_dir;
    config.bootstrap_nodes = cli.bootstrap.clone();
    config.enable_encryption = !cli.plaintext;
    config.enable_privacy = cli.enable_privacy;
    config.enable_dht = cli.enable_dht;
    config.enable_mdns = cli.enable_mdns;

    let node = DawnNode::new(identity, config).context("building node")?;
    node.register_agent("agent1", build_first_agent(&node));
    node.start().await.context("starting node")?;
    tracing::info!("listening on {}", node.ws_url());

    // ── Run until ctrl-c ─────────────────────────────────────────────────────
    tokio::signal::ctrl_c().await.ok();
    tracing::info!("interrupt received");
    node.shutdown().await;
    tracing::info!("dawn stopped");
    Ok(())
}

/// The default agent every node ships with: a handful of introspection
/// tools so a fresh network has something to call.
fn build_first_agent(node: &DawnNode) -> Arc<McpServer> {
    let server = Arc::new(McpServer::new("FirstAgent"));

    server.register_function(
        "echo",
        "Echo the given text back",
        Some(json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"]
        })),
        |args| {
            Box::pin(async move {
                args.get("text")
                    .cloned()
                    .ok_or_else(|| "missing 'text' argument".to_string())
            })
        },
    );

    server.register_function(
        "get_time",
        "Current unix time in seconds",
        None,
        |_args| Box::pin(async { Ok(json!(dawn_crdt::unix_now())) }),
    );

    let info_node = node.clone();
    server.register_function(
        "get_node_info",
        "This node's identity and subsystem status",
        None,
        move |_args| {
            let node = info_node.clone();
            Box::pin(async move {
                match node
                    .handle_request(json!({
                        "jsonrpc": "2.0",
                        "method": "node/get_info",
                        "id": "local",
                    }))
                    .await
                {
                    Some(response) => Ok(response
                        .get("result")
                        .cloned()
                        .unwrap_or(Value::Null)),
                    None => Err("node info unavailable".to_string()),
                }
            })
        },
    );

    server
}

fn parse_listen(listen: &str) -> Option<(String, u16)> {
    let rest = listen
        .strip_prefix("ws://")
        .or_else(|| listen.strip_prefix("wss://"))?;
    let (host, port) = rest.split('/').next()?.rsplit_once(':')?;
    Some((host.to_string(), port.parse().ok()?))
}

/// Bind-probe the desired port; fall back to an OS-assigned one.
fn pick_port(host: &str, desired: u16) -> u16 {
    if desired == 0 {
        return 0;
    }
    if StdTcpListener::bind((host, desired)).is_ok() {
        return desired;
    }
    StdTcpListener::bind((host, 0))
        .and_then(|l| l.local_addr())
        .map(|a| a.port())
        .unwrap_or(0)
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dawn")
}
