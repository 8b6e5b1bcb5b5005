// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Wire envelopes.
//!
//! Every frame on a peer connection is a JSON object. Frames carrying a
//! `type` field are envelopes ([`WireEnvelope`]); anything else is a bare
//! JSON-RPC message (plaintext mode only).
//!
//! Encrypted envelopes are signed: the Ed25519 signature covers the
//! canonical serialization of the unsigned envelope (`serde_json` with its
//! default ordered map, so both ends produce identical bytes), and `sender`
//! carries the signer's node id — which *is* its public key, so verification
//! needs nothing but the envelope itself.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use dawn_crypto::{MessageCipher, NodeIdentity};

use crate::error::P2pError;

/// Typed frames exchanged on a peer connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireEnvelope {
    /// Handshake: sent by the initiator on connect and echoed by the
    /// responder once it has derived the session key.
    KeyExchange {
        /// Hex-encoded X25519 public key (32 bytes).
        public_key: String,
        node_id: String,
    },

    /// An AES-256-GCM sealed JSON-RPC message.
    Encrypted {
        /// Hex-encoded 96-bit nonce.
        nonce: String,
        /// Hex-encoded ciphertext including the 16-byte tag.
        ciphertext: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        sender: Option<String>,
    },

    /// Privacy-layer bytes (padded and possibly onion-framed), hex-encoded so
    /// the binary framing survives JSON text transport.
    Private { data: String },

    /// Periodic unsolicited peer/registry fan-out. Never answered.
    GossipAnnouncement {
        timestamp: f64,
        peers: Vec<Value>,
        task_registry: Value,
        agent_registry: Value,
    },
}

impl WireEnvelope {
    /// Parse a frame into an envelope, or `None` when it is a bare JSON-RPC
    /// object (no `type` tag).
    pub fn classify(value: &Value) -> Option<WireEnvelope> {
        value.get("type")?;
        serde_json::from_value(value.clone()).ok()
    }
}

/// The bytes covered by the envelope signature.
fn signing_bytes(nonce_hex: &str, ciphertext_hex: &str) -> Vec<u8> {
    // serde_json maps are ordered, so this serialization is canonical.
    serde_json::to_vec(&json!({
        "type": "encrypted",
        "nonce": nonce_hex,
        "ciphertext": ciphertext_hex,
    }))
    .unwrap_or_default()
}

/// Encrypt and sign a plaintext payload into an `Encrypted` envelope.
pub fn seal(
    identity: &NodeIdentity,
    cipher: &MessageCipher,
    plaintext: &[u8],
) -> Result<WireEnvelope, P2pError> {
    let (nonce, ciphertext) = cipher.encrypt(plaintext, None)?;
    let nonce_hex = hex::encode(nonce);
    let ct_hex = hex::encode(&ciphertext);
    let signature = identity.sign(&signing_bytes(&nonce_hex, &ct_hex))?;
    Ok(WireEnvelope::Encrypted {
        nonce: nonce_hex,
        ciphertext: ct_hex,
        signature: Some(hex::encode(signature)),
        sender: Some(identity.node_id()),
    })
}

/// Verify and decrypt an `Encrypted` envelope, returning the plaintext and
/// the verified sender node id.
pub fn open(
    cipher: &MessageCipher,
    envelope: &WireEnvelope,
) -> Result<(Vec<u8>, String), P2pError> {
    let WireEnvelope::Encrypted {
        nonce,
        ciphertext,
        signature,
        sender,
    } = envelope
    else {
        return Err(P2pError::Transport("not an encrypted envelope".into()));
    };

    let sender = sender
        .as_deref()
        .ok_or_else(|| P2pError::Handshake("encrypted envelope without sender".into()))?;
    let signature_hex = signature
        .as_deref()
        .ok_or_else(|| P2pError::Handshake("encrypted envelope without signature".into()))?;

    let verifier = NodeIdentity::from_node_id(sender)?;
    let signature = hex::decode(signature_hex)
        .map_err(|e| P2pError::Handshake(format!("signature is not hex: {e}")))?;
    if !verifier.verify(&signing_bytes(nonce, ciphertext), &signature) {
        return Err(P2pError::Handshake(format!(
            "signature verification failed for sender {}",
            &sender[..sender.len().min(16)]
        )));
    }

    let nonce = hex::decode(nonce).map_err(|e| P2pError::Handshake(format!("bad nonce: {e}")))?;
    let ciphertext = hex::decode(ciphertext)
        .map_err(|e| P2pError::Handshake(format!("bad ciphertext: {e}")))?;
    let plaintext = cipher.decrypt(&nonce, &ciphertext, None)?;
    Ok((plaintext, sender.to_string()))
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use dawn_crypto::KeyExchange;

    fn session() -> (NodeIdentity, MessageCipher, MessageCipher) {
        let identity = NodeIdentity::generate();
        let a = KeyExchange::generate();
        let b = KeyExchange::generate();
        let ka = a
            .derive_shared_secret(&b.public_key_bytes(), None, None)
            .unwrap();
        let kb = b
            .derive_shared_secret(&a.public_key_bytes(), None, None)
            .unwrap();
        (identity, MessageCipher::new(ka), MessageCipher::new(kb))
    }

    #[test]
    fn seal_open_round_trip() {
        let (identity, tx, rx) = session();
        let env = seal(&identity, &tx, b"{\"method\":\"tools/list\"}").unwrap();
        let (plain, sender) = open(&rx, &env).unwrap();
        assert_eq!(plain, b"{\"method\":\"tools/list\"}");
        assert_eq!(sender, identity.node_id());
    }

    #[test]
    fn ciphertext_hides_the_plaintext() {
        let (identity, tx, _) = session();
        let plaintext = b"tools/call secret-method-name";
        let env = seal(&identity, &tx, plaintext).unwrap();
        let WireEnvelope::Encrypted { ciphertext, .. } = &env else {
            panic!()
        };
        let ct = hex::decode(ciphertext).unwrap();
        // No window of the ciphertext equals any plaintext substring ≥ 4 bytes.
        for window in ct.windows(4) {
            assert!(!plaintext
                .windows(4)
                .any(|needle| needle == window));
        }
    }

    #[test]
    fn wrong_session_key_fails() {
        let (identity, tx, _) = session();
        let (_, _, other_rx) = session();
        let env = seal(&identity, &tx, b"payload").unwrap();
        assert!(open(&other_rx, &env).is_err());
    }

    #[test]
    fn forged_sender_fails_verification() {
        let (identity, tx, rx) = session();
        let env = seal(&identity, &tx, b"payload").unwrap();
        let WireEnvelope::Encrypted {
            nonce,
            ciphertext,
            signature,
            ..
        } = env
        else {
            panic!()
        };
        let impostor = NodeIdentity::generate();
        let forged = WireEnvelope::Encrypted {
            nonce,
            ciphertext,
            signature,
            sender: Some(impostor.node_id()),
        };
        assert!(matches!(open(&rx, &forged), Err(P2pError::Handshake(_))));
    }

    #[test]
    fn tampered_ciphertext_fails_signature_check() {
        let (identity, tx, rx) = session();
        let env = seal(&identity, &tx, b"payload").unwrap();
        let WireEnvelope::Encrypted {
            nonce,
            mut ciphertext,
            signature,
            sender,
        } = env
        else {
            panic!()
        };
        // Flip one hex digit.
        let flipped = if ciphertext.as_bytes()[0] == b'0' { "1" } else { "0" };
        ciphertext.replace_range(0..1, flipped);
        let tampered = WireEnvelope::Encrypted {
            nonce,
            ciphertext,
            signature,
            sender,
        };
        assert!(open(&rx, &tampered).is_err());
    }

    #[test]
    fn unsigned_envelope_is_rejected() {
        let (identity, tx, rx) = session();
        let env = seal(&identity, &tx, b"payload").unwrap();
        let WireEnvelope::Encrypted {
            nonce, ciphertext, ..
        } = env
        else {
            panic!()
        };
        let unsigned = WireEnvelope::Encrypted {
            nonce,
            ciphertext,
            signature: None,
            sender: None,
        };
        assert!(open(&rx, &unsigned).is_err());
    }

    #[test]
    fn classify_distinguishes_envelopes_from_rpc() {
        let kx = serde_json::json!({
            "type": "key_exchange",
            "public_key": "00".repeat(32),
            "node_id": "ab".repeat(32),
        });
        assert!(matches!(
            WireEnvelope::classify(&kx),
            Some(WireEnvelope::KeyExchange { .. })
        ));

        let rpc = serde_json::json!({"jsonrpc": "2.0", "method": "node/get_info", "id": 1});
        assert!(WireEnvelope::classify(&rpc).is_none());

        let gossip = serde_json::json!({
            "type": "gossip_announcement",
            "timestamp": 1.0,
            "peers": [],
            "task_registry": {},
            "agent_registry": {},
        });
        assert!(matches!(
            WireEnvelope::classify(&gossip),
            Some(WireEnvelope::GossipAnnouncement { .. })
        ));
    }

    #[test]
    fn envelope_json_round_trip() {
        let env = WireEnvelope::Private {
            data: "deadbeef".into(),
        };
        let text = serde_json::to_string(&env).unwrap();
        assert!(text.contains("\"type\":\"private\""));
        let back: WireEnvelope = serde_json::from_str(&text).unwrap();
        assert_eq!(env, back);
    }
}
