// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! `dawn-crypto` — identity and cryptographic primitives for dawn nodes.
//!
//! Every node carries one long-lived Ed25519 signing key ([`NodeIdentity`]);
//! the hex encoding of its public key **is** the node id. Sessions between
//! peers are keyed by an ephemeral X25519 exchange ([`KeyExchange`]) whose
//! output is stretched through HKDF-SHA256, and the resulting 32-byte key
//! drives an AES-256-GCM channel ([`MessageCipher`]).
//!
//! # Layout
//!
//! ```text
//! identity  — Ed25519 keypair, node id, seed persistence
//! exchange  — X25519 ECDH + HKDF-SHA256 derivation
//! cipher    — AES-256-GCM authenticated encryption
//! hash      — digests, constant-time compare, PBKDF2, CSPRNG helpers
//! ```

pub mod cipher;
pub mod error;
pub mod exchange;
pub mod hash;
pub mod identity;

pub use cipher::MessageCipher;
pub use error::CryptoError;
pub use exchange::{KeyExchange, KEY_EXCHANGE_SALT};
pub use hash::{
    constant_time_compare, derive_key_from_password, generate_nonce, generate_salt, random_bytes,
};
pub use identity::NodeIdentity;
