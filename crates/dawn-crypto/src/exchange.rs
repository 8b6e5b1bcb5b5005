// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! [`KeyExchange`] — X25519 ECDH with HKDF-SHA256 key derivation.
//!
//! Each transport session creates a fresh exchange keypair; both ends derive
//! the same 32-byte session key from their private key and the peer's public
//! key, stretched through HKDF so the raw curve output never keys a cipher
//! directly.

use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::CryptoError;

/// Domain-separation salt for the v2 handshake. Both ends must use the same
/// salt or the derived session keys will not match.
pub const KEY_EXCHANGE_SALT: &[u8] = b"project-dawn-v2-key-exchange";

/// X25519 key-exchange state for one session.
pub struct KeyExchange {
    secret: StaticSecret,
    public: PublicKey,
}

impl std::fmt::Debug for KeyExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyExchange")
            .field("public_key", &hex::encode(self.public.as_bytes()))
            .finish()
    }
}

impl Default for KeyExchange {
    fn default() -> Self {
        Self::generate()
    }
}

impl KeyExchange {
    /// Generate a fresh exchange keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Rebuild from a persisted 32-byte private key.
    pub fn from_private_key_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    pub fn private_key_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// Derive the shared session key from the peer's public key.
    ///
    /// `salt` defaults to [`KEY_EXCHANGE_SALT`], `info` to empty. The output
    /// is always 32 bytes: HKDF-SHA256(salt, X25519(our_priv, peer_pub)).
    pub fn derive_shared_secret(
        &self,
        peer_public_key: &[u8],
        salt: Option<&[u8]>,
        info: Option<&[u8]>,
    ) -> Result<[u8; 32], CryptoError> {
        let peer: [u8; 32] = peer_public_key
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("peer public key must be 32 bytes".into()))?;
        let shared = self.secret.diffie_hellman(&PublicKey::from(peer));

        let hk = Hkdf::<Sha256>::new(Some(salt.unwrap_or(KEY_EXCHANGE_SALT)), shared.as_bytes());
        let mut okm = [0u8; 32];
        hk.expand(info.unwrap_or(b""), &mut okm)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(okm)
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
