// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Traffic-analysis countermeasures: padding, onion framing, timing
//! obfuscation.
//!
//! [`PrivacyLayer::send`] applies **pad → onion → schedule**;
//! [`PrivacyLayer::receive`] applies **peel → unpad** and reports whether the
//! result is for local delivery or must be forwarded to the next hop.
//!
//! # Onion keying
//!
//! Every layer is sealed with a fresh ephemeral X25519 key against the hop's
//! long-lived exchange key; the ephemeral public key travels next to the
//! `{encrypted, nonce}` envelope, so only that hop —
//! `ECDH(hop_private, ephemeral_public)` — can peel its layer. Hops learn
//! the next hop and nothing else.
//!
//! With onion routing enabled but no path configured the layer degrades
//! explicitly to padding + timing only; an empty path would otherwise mean
//! "onion framing to nobody".

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use rand::Rng;
use rand::RngCore;
use serde_json::{json, Value};

use dawn_crypto::{KeyExchange, MessageCipher};

use crate::error::P2pError;

pub const MIN_PADDING_SIZE: usize = 64;
pub const MAX_PADDING_SIZE: usize = 1024;
pub const MIN_DELAY_MS: u64 = 10;
pub const MAX_DELAY_MS: u64 = 100;
pub const BATCH_WINDOW_MS: u64 = 50;

/// HKDF info string separating onion-layer keys from session keys.
const ONION_INFO: &[u8] = b"dawn-onion-layer";

/// Callback the privacy layer uses to put bytes on the wire:
/// `(message, target_node_id)`.
pub type SendFn = Arc<dyn Fn(Vec<u8>, String) -> BoxFuture<'static, ()> + Send + Sync>;

// ── Padding ───────────────────────────────────────────────────────────────────

/// Pads messages to obscure their true length.
///
/// Frame: `[u32 BE original length][original bytes][random padding]`.
#[derive(Debug, Clone)]
pub struct MessagePadder {
    min_size: usize,
    max_padding: usize,
}

impl Default for MessagePadder {
    fn default() -> Self {
        Self {
            min_size: MIN_PADDING_SIZE,
            max_padding: MAX_PADDING_SIZE,
        }
    }
}

impl MessagePadder {
    pub fn new(min_size: usize, max_padding: usize) -> Self {
        Self {
            min_size,
            max_padding,
        }
    }

    pub fn pad_message(&self, message: &[u8]) -> Vec<u8> {
        let mut rng = OsRng;
        let padding_size = if message.len() >= self.min_size {
            rng.gen_range(0..=self.max_padding.min(message.len() / 10))
        } else {
            self.min_size - message.len() + rng.gen_range(0..=self.max_padding)
        };

        let mut padding = vec![0u8; padding_size];
        rng.fill_bytes(&mut padding);

        let mut out = Vec::with_capacity(4 + message.len() + padding_size);
        out.extend_from_slice(&(message.len() as u32).to_be_bytes());
        out.extend_from_slice(message);
        out.extend_from_slice(&padding);
        out
    }

    pub fn unpad_message(&self, padded: &[u8]) -> Result<Vec<u8>, P2pError> {
        if padded.len() < 4 {
            return Err(P2pError::InvalidPadding);
        }
        let length = u32::from_be_bytes([padded[0], padded[1], padded[2], padded[3]]) as usize;
        if length > padded.len() - 4 {
            return Err(P2pError::InvalidPadding);
        }
        Ok(padded[4..4 + length].to_vec())
    }
}

// ── Onion routing ─────────────────────────────────────────────────────────────

/// One hop of an onion path: who it is and its exchange key.
#[derive(Debug, Clone)]
pub struct OnionHop {
    pub node_id: String,
    pub exchange_public_key: [u8; 32],
}

/// Outcome of peeling one layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Peeled {
    /// This node was the final destination; the payload is unpadded.
    Delivered(Vec<u8>),
    /// Forward the peeled payload to `next_hop`.
    Forward { next_hop: String, payload: Vec<u8> },
}

/// Builds and peels multi-hop onion frames.
pub struct OnionRouter {
    exchange: Arc<KeyExchange>,
    padder: MessagePadder,
}

impl OnionRouter {
    /// `exchange` is this node's long-lived routing key; peers learn its
    /// public half from gossip and seal layers against it.
    pub fn new(exchange: Arc<KeyExchange>, padder: MessagePadder) -> Self {
        Self { exchange, padder }
    }

    /// Build an onion for `path` (intermediate hops first, final target
    /// last). The message is padded before the innermost layer is sealed.
    pub fn build_onion(&self, message: &[u8], path: &[OnionHop]) -> Result<Vec<u8>, P2pError> {
        if path.is_empty() {
            return Err(P2pError::OnionPeel("empty onion path".into()));
        }

        let padded = self.padder.pad_message(message);

        // Innermost layer first, then wrap outwards toward the first hop.
        let mut current = Vec::new();
        for (i, hop) in path.iter().enumerate().rev() {
            let layer = if i == path.len() - 1 {
                json!({ "payload": hex::encode(&padded) })
            } else {
                json!({
                    "next_hop": path[i + 1].node_id,
                    "payload": hex::encode(&current),
                })
            };
            current = seal_layer(hop, &layer)?;
        }
        Ok(current)
    }

    /// Peel the layer addressed to this node.
    pub fn peel_layer(&self, data: &[u8]) -> Result<Peeled, P2pError> {
        let frame: Value = serde_json::from_slice(data)
            .map_err(|e| P2pError::OnionPeel(format!("layer is not JSON: {e}")))?;
        let encrypted = hex_field(&frame, "encrypted")?;
        let nonce = hex_field(&frame, "nonce")?;
        let ephemeral = hex_field(&frame, "ephemeral_key")?;

        let key = self
            .exchange
            .derive_shared_secret(&ephemeral, None, Some(ONION_INFO))
            .map_err(|e| P2pError::OnionPeel(e.to_string()))?;
        let plaintext = MessageCipher::new(key)
            .decrypt(&nonce, &encrypted, None)
            .map_err(|_| P2pError::OnionPeel("layer decryption failed".into()))?;

        let inner: Value = serde_json::from_slice(&plaintext)
            .map_err(|e| P2pError::OnionPeel(format!("inner layer is not JSON: {e}")))?;
        let payload = hex_field(&inner, "payload")?;

        match inner.get("next_hop").and_then(Value::as_str) {
            Some(next_hop) => Ok(Peeled::Forward {
                next_hop: next_hop.to_string(),
                payload,
            }),
            None => Ok(Peeled::Delivered(self.padder.unpad_message(&payload)?)),
        }
    }
}

/// Does this frame look like an onion layer?
pub fn is_onion_frame(data: &[u8]) -> bool {
    serde_json::from_slice::<Value>(data)
        .map(|v| v.get("encrypted").is_some() && v.get("ephemeral_key").is_some())
        .unwrap_or(false)
}

fn seal_layer(hop: &OnionHop, layer: &Value) -> Result<Vec<u8>, P2pError> {
    let ephemeral = KeyExchange::generate();
    let key = ephemeral.derive_shared_secret(&hop.exchange_public_key, None, Some(ONION_INFO))?;
    let (nonce, ciphertext) = MessageCipher::new(key).encrypt(&serde_json::to_vec(layer)?, None)?;
    Ok(serde_json::to_vec(&json!({
        "encrypted": hex::encode(ciphertext),
        "nonce": hex::encode(nonce),
        "ephemeral_key": hex::encode(ephemeral.public_key_bytes()),
    }))?)
}

fn hex_field(value: &Value, field: &str) -> Result<Vec<u8>, P2pError> {
    let text = value
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| P2pError::OnionPeel(format!("missing '{field}'")))?;
    hex::decode(text).map_err(|e| P2pError::OnionPeel(format!("'{field}' is not hex: {e}")))
}

// ── Timing obfuscation ────────────────────────────────────────────────────────

/// Delays or batches sends to blur timing patterns.
///
/// The two techniques are independent: [`delay`] sleeps a uniform random
/// interval; [`batch_send`] queues messages, and a flush task drains the
/// queue after the batch window, shuffled.
///
/// [`delay`]: TimingObfuscator::delay
/// [`batch_send`]: TimingObfuscator::batch_send
pub struct TimingObfuscator {
    min_delay: Duration,
    max_delay: Duration,
    batch_window: Duration,
    queue: Arc<Mutex<Vec<(Vec<u8>, String)>>>,
    flushing: Arc<AtomicBool>,
}

impl Default for TimingObfuscator {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(MIN_DELAY_MS),
            Duration::from_millis(MAX_DELAY_MS),
            Duration::from_millis(BATCH_WINDOW_MS),
        )
    }
}

impl TimingObfuscator {
    pub fn new(min_delay: Duration, max_delay: Duration, batch_window: Duration) -> Self {
        Self {
            min_delay,
            max_delay,
            batch_window,
            queue: Arc::new(Mutex::new(Vec::new())),
            flushing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Sleep a uniform random interval in `[min_delay, max_delay]`.
    pub async fn delay(&self) {
        let range = self.max_delay.saturating_sub(self.min_delay);
        let jitter = if range.is_zero() {
            Duration::ZERO
        } else {
            Duration::from_micros(OsRng.gen_range(0..=range.as_micros() as u64))
        };
        tokio::time::sleep(self.min_delay + jitter).await;
    }

    /// Queue a message; a flush task drains and shuffles the batch after the
    /// window elapses.
    pub fn batch_send(&self, message: Vec<u8>, target: String, send: SendFn) {
        self.queue.lock().unwrap().push((message, target));

        if self.flushing.swap(true, Ordering::SeqCst) {
            return; // a flush is already scheduled
        }
        let queue = Arc::clone(&self.queue);
        let flushing = Arc::clone(&self.flushing);
        let window = self.batch_window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let mut batch = {
                let mut q = queue.lock().unwrap();
                std::mem::take(&mut *q)
            };
            flushing.store(false, Ordering::SeqCst);
            batch.shuffle(&mut OsRng);
            for (message, target) in batch {
                send(message, target).await;
            }
        });
    }
}

// ── Unified layer ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PrivacyConfig {
    pub enable_padding: bool,
    pub enable_onion: bool,
    pub enable_timing: bool,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            enable_padding: true,
            enable_onion: true,
            enable_timing: true,
        }
    }
}

/// What [`PrivacyLayer::receive`] decided about an inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Received {
    /// Deliver these plaintext bytes locally.
    Delivered(Vec<u8>),
    /// Not for us — relay the payload to `next_hop`.
    Forward { next_hop: String, payload: Vec<u8> },
}

pub struct PrivacyLayer {
    config: PrivacyConfig,
    padder: MessagePadder,
    onion: OnionRouter,
    timing: TimingObfuscator,
}

impl PrivacyLayer {
    pub fn new(config: PrivacyConfig, exchange: Arc<KeyExchange>) -> Self {
        let padder = MessagePadder::default();
        Self {
            onion: OnionRouter::new(exchange, padder.clone()),
            timing: TimingObfuscator::default(),
            padder,
            config,
        }
    }

    pub fn config(&self) -> &PrivacyConfig {
        &self.config
    }

    /// Apply pad → onion → schedule and hand the result to `send`.
    ///
    /// `path` is the onion route (final target last). With onion enabled but
    /// `path` empty the layer degrades to padding + timing.
    pub async fn send(
        &self,
        message: &[u8],
        target: &str,
        path: &[OnionHop],
        send: SendFn,
    ) -> Result<(), P2pError> {
        let (bytes, first_hop) = if self.config.enable_onion && !path.is_empty() {
            // build_onion pads internally.
            (
                self.onion.build_onion(message, path)?,
                path[0].node_id.clone(),
            )
        } else {
            if self.config.enable_onion {
                tracing::debug!("onion path empty; sending with padding and timing only");
            }
            let bytes = if self.config.enable_padding {
                self.padder.pad_message(message)
            } else {
                message.to_vec()
            };
            (bytes, target.to_string())
        };

        if self.config.enable_timing {
            self.timing.batch_send(bytes, first_hop, send);
        } else {
            send(bytes, first_hop).await;
        }
        Ok(())
    }

    /// Peel / unpad an inbound frame.
    pub fn receive(&self, data: &[u8]) -> Result<Received, P2pError> {
        if self.config.enable_onion && is_onion_frame(data) {
            return match self.onion.peel_layer(data)? {
                Peeled::Delivered(bytes) => Ok(Received::Delivered(bytes)),
                Peeled::Forward { next_hop, payload } => {
                    Ok(Received::Forward { next_hop, payload })
                }
            };
        }
        if self.config.enable_padding {
            return Ok(Received::Delivered(self.padder.unpad_message(data)?));
        }
        Ok(Received::Delivered(data.to_vec()))
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
