// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Per-peer WebSocket transport.
//!
//! One [`Transport`] wraps one WebSocket connection. Two tasks run per
//! connection: a writer draining an outbound queue into the sink, and a
//! reader that drives the handshake, decrypts inbound frames, and forwards
//! application messages to the node as [`TransportEvent`]s.
//!
//! # Handshake
//!
//! ```text
//! initiator                                   responder
//!     │ ── key_exchange {x25519 pub, node id} ──►
//!     │                                            derive session key
//!     │ ◄── key_exchange {x25519 pub, node id} ──
//!     derive session key
//!     ▼
//! session established — frames are seal()ed / open()ed from here on
//! ```
//!
//! Until establishment every non-handshake frame is silently dropped. With
//! encryption enabled a plaintext frame after establishment (or vice versa)
//! is a downgrade and fails the connection. Each new handshake replaces the
//! session key; there is no mid-session rotation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use dawn_crypto::{KeyExchange, MessageCipher, NodeIdentity};

use crate::envelope::{self, WireEnvelope};
use crate::error::P2pError;

/// Which side of the connection we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Events a transport reports to its owning node.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Handshake completed; the peer's node id is now known.
    Established { conn_id: Uuid, node_id: String },
    /// A decrypted (or plaintext-mode) application frame.
    Message {
        conn_id: Uuid,
        node_id: String,
        value: Value,
    },
    /// The connection ended (close, error, or protocol downgrade).
    Closed {
        conn_id: Uuid,
        node_id: Option<String>,
    },
}

struct SessionState {
    conn_id: Uuid,
    role: Role,
    encryption: bool,
    identity: Arc<NodeIdentity>,
    exchange: KeyExchange,
    cipher: Mutex<Option<Arc<MessageCipher>>>,
    peer: Mutex<Option<String>>,
    sent_kx: AtomicBool,
    established_tx: watch::Sender<bool>,
}

impl SessionState {
    fn established(&self) -> bool {
        *self.established_tx.borrow()
    }
}

/// Cheap-to-clone handle to one peer connection.
#[derive(Clone)]
pub struct Transport {
    session: Arc<SessionState>,
    out_tx: mpsc::Sender<Message>,
    established_rx: watch::Receiver<bool>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("conn_id", &self.session.conn_id)
            .field("peer", &self.peer_node_id())
            .finish()
    }
}

impl Transport {
    /// Spawn reader + writer tasks over an accepted or dialed WebSocket.
    ///
    /// The initiator queues its `key_exchange` immediately; the responder
    /// answers when the initiator's arrives.
    pub fn spawn<S>(
        ws: WebSocketStream<S>,
        role: Role,
        identity: Arc<NodeIdentity>,
        encryption: bool,
        events: mpsc::Sender<TransportEvent>,
    ) -> Transport
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (established_tx, established_rx) = watch::channel(false);
        let session = Arc::new(SessionState {
            conn_id: Uuid::new_v4(),
            role,
            encryption,
            identity,
            exchange: KeyExchange::generate(),
            cipher: Mutex::new(None),
            peer: Mutex::new(None),
            sent_kx: AtomicBool::new(false),
            established_tx,
        });

        let (out_tx, mut out_rx) = mpsc::channel::<Message>(64);
        let (mut sink, stream) = ws.split();

        // Writer: drain the outbound queue into the sink.
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if sink.send(msg).await.is_err() || closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let transport = Transport {
            session: Arc::clone(&session),
            out_tx: out_tx.clone(),
            established_rx,
        };

        if role == Role::Initiator {
            session.sent_kx.store(true, Ordering::SeqCst);
            let _ = out_tx.try_send(kx_frame(&session));
        }

        tokio::spawn(read_loop(stream, session, out_tx, events));
        transport
    }

    pub fn conn_id(&self) -> Uuid {
        self.session.conn_id
    }

    /// The peer's node id, once the handshake has delivered it.
    pub fn peer_node_id(&self) -> Option<String> {
        self.session.peer.lock().unwrap().clone()
    }

    /// Wait until the session is established, up to `timeout`.
    pub async fn wait_established(&self, timeout: Duration) -> Result<String, P2pError> {
        let mut rx = self.established_rx.clone();
        let wait = async {
            loop {
                if *rx.borrow() {
                    return Ok(());
                }
                if rx.changed().await.is_err() {
                    return Err(P2pError::Transport("connection closed".into()));
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| P2pError::Handshake("handshake timed out".into()))??;
        self.peer_node_id()
            .ok_or_else(|| P2pError::Handshake("handshake incomplete".into()))
    }

    /// Send a JSON value, sealing it when the session is encrypted.
    ///
    /// Suspends while the peer's send buffer is full (backpressure).
    pub async fn send_value(&self, value: &Value) -> Result<(), P2pError> {
        let text = self.wire_text(value)?;
        self.out_tx
            .send(Message::Text(text))
            .await
            .map_err(|_| P2pError::Transport("connection closed".into()))
    }

    /// Best-effort send that drops the frame when the buffer is full.
    ///
    /// Used for gossip, which tolerates loss; RPC traffic never goes through
    /// here.
    pub fn send_value_lossy(&self, value: &Value) -> Result<(), P2pError> {
        let text = self.wire_text(value)?;
        if let Err(e) = self.out_tx.try_send(Message::Text(text)) {
            tracing::debug!(conn = %self.session.conn_id, "dropping gossip frame: {e}");
        }
        Ok(())
    }

    fn wire_text(&self, value: &Value) -> Result<String, P2pError> {
        if !self.session.established() {
            return Err(P2pError::Handshake("session not established".into()));
        }
        if self.session.encryption {
            let cipher = self
                .session
                .cipher
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| P2pError::Handshake("no session key".into()))?;
            let env = envelope::seal(
                &self.session.identity,
                &cipher,
                &serde_json::to_vec(value)?,
            )?;
            Ok(serde_json::to_string(&env)?)
        } else {
            Ok(serde_json::to_string(value)?)
        }
    }

    /// Graceful close: queue a Close frame; the writer shuts the sink down.
    pub async fn close(&self) {
        let _ = self.out_tx.send(Message::Close(None)).await;
    }
}

fn kx_frame(session: &SessionState) -> Message {
    let env = WireEnvelope::KeyExchange {
        public_key: hex::encode(session.exchange.public_key_bytes()),
        node_id: session.identity.node_id(),
    };
    Message::Text(serde_json::to_string(&env).unwrap_or_default())
}

async fn read_loop<S>(
    mut stream: futures::stream::SplitStream<WebSocketStream<S>>,
    session: Arc<SessionState>,
    out_tx: mpsc::Sender<Message>,
    events: mpsc::Sender<TransportEvent>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(t)) => t,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue, // binary / ping / pong
        };

        let value: Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(conn = %session.conn_id, "unparseable frame: {e}");
                continue;
            }
        };

        match WireEnvelope::classify(&value) {
            Some(WireEnvelope::KeyExchange {
                public_key,
                node_id,
            }) => {
                if let Err(e) = on_key_exchange(&session, &out_tx, &events, &public_key, &node_id)
                    .await
                {
                    tracing::warn!(conn = %session.conn_id, "handshake failed: {e}");
                    break;
                }
            }

            Some(env @ WireEnvelope::Encrypted { .. }) => {
                if !session.encryption {
                    tracing::warn!(
                        conn = %session.conn_id,
                        "peer sent encrypted frame on a plaintext connection; closing"
                    );
                    break;
                }
                if !session.established() {
                    tracing::debug!(conn = %session.conn_id, "frame before handshake, dropping");
                    continue;
                }
                let cipher = session.cipher.lock().unwrap().clone();
                let Some(cipher) = cipher else { continue };
                match envelope::open(&cipher, &env) {
                    Ok((plaintext, sender)) => {
                        let expected = session.peer.lock().unwrap().clone();
                        if expected.as_deref() != Some(sender.as_str()) {
                            tracing::warn!(
                                conn = %session.conn_id,
                                "envelope sender does not match handshake peer, dropping"
                            );
                            continue;
                        }
                        match serde_json::from_slice::<Value>(&plaintext) {
                            Ok(inner) => {
                                emit_message(&session, &events, sender, inner).await;
                            }
                            Err(e) => {
                                tracing::debug!(conn = %session.conn_id, "bad plaintext: {e}");
                            }
                        }
                    }
                    Err(e) => {
                        // Crypto faults are fatal to the session.
                        tracing::warn!(conn = %session.conn_id, "dropping session: {e}");
                        break;
                    }
                }
            }

            // Plaintext application frames (typed or bare JSON-RPC).
            _ => {
                if session.encryption {
                    tracing::warn!(
                        conn = %session.conn_id,
                        "peer downgraded to plaintext mid-stream; closing"
                    );
                    break;
                }
                if !session.established() {
                    tracing::debug!(conn = %session.conn_id, "frame before handshake, dropping");
                    continue;
                }
                let Some(peer) = session.peer.lock().unwrap().clone() else {
                    continue;
                };
                emit_message(&session, &events, peer, value).await;
            }
        }
    }

    let node_id = session.peer.lock().unwrap().clone();
    let _ = events
        .send(TransportEvent::Closed {
            conn_id: session.conn_id,
            node_id,
        })
        .await;
}

async fn emit_message(
    session: &SessionState,
    events: &mpsc::Sender<TransportEvent>,
    node_id: String,
    value: Value,
) {
    let _ = events
        .send(TransportEvent::Message {
            conn_id: session.conn_id,
            node_id,
            value,
        })
        .await;
}

async fn on_key_exchange(
    session: &Arc<SessionState>,
    out_tx: &mpsc::Sender<Message>,
    events: &mpsc::Sender<TransportEvent>,
    public_key_hex: &str,
    node_id: &str,
) -> Result<(), P2pError> {
    let rekey = session.established();

    if session.encryption {
        let peer_pub = hex::decode(public_key_hex)
            .map_err(|e| P2pError::Handshake(format!("public key is not hex: {e}")))?;
        let key = session
            .exchange
            .derive_shared_secret(&peer_pub, None, None)?;
        *session.cipher.lock().unwrap() = Some(Arc::new(MessageCipher::new(key)));
    }
    *session.peer.lock().unwrap() = Some(node_id.to_string());

    // The responder answers with its own key_exchange exactly once.
    if session.role == Role::Responder && !session.sent_kx.swap(true, Ordering::SeqCst) {
        let _ = out_tx.send(kx_frame(session)).await;
    }

    let _ = session.established_tx.send(true);
    if rekey {
        tracing::debug!(conn = %session.conn_id, "session rekeyed by new handshake");
        return Ok(());
    }

    tracing::debug!(
        conn = %session.conn_id,
        peer = %&node_id[..node_id.len().min(16)],
        "session established"
    );
    let _ = events
        .send(TransportEvent::Established {
            conn_id: session.conn_id,
            node_id: node_id.to_string(),
        })
        .await;
    Ok(())
}

// ── Unit tests ────────────────────────────────────────────────────────────────
//
// These run over an in-memory duplex pipe; real TCP round-trips live in the
// crate integration tests.
