// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! [`MessageCipher`] — AES-256-GCM authenticated encryption.
//!
//! One cipher per peer session, keyed by the handshake-derived shared secret.
//! Nonces are 96-bit and drawn fresh from the OS CSPRNG for every message;
//! the 128-bit tag is appended to the ciphertext. Any tag, nonce, or AAD
//! mismatch fails with [`CryptoError::Decryption`] — the error deliberately
//! carries no detail that could act as a decryption oracle.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::error::CryptoError;

pub const NONCE_LEN: usize = 12;
pub const KEY_LEN: usize = 32;

pub struct MessageCipher {
    cipher: Aes256Gcm,
    key: Zeroizing<[u8; KEY_LEN]>,
}

impl std::fmt::Debug for MessageCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.write_str("MessageCipher")
    }
}

impl MessageCipher {
    /// Create a cipher from a 32-byte session key.
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        Self {
            cipher,
            key: Zeroizing::new(key),
        }
    }

    /// Create a cipher with a fresh random key.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self::new(key)
    }

    pub fn key(&self) -> &[u8; KEY_LEN] {
        &self.key
    }

    /// Encrypt `plaintext`, returning `(nonce, ciphertext)`.
    ///
    /// The ciphertext includes the 16-byte GCM tag. `aad` is authenticated
    /// but not encrypted and must match exactly at decryption time.
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        aad: Option<&[u8]>,
    ) -> Result<([u8; NONCE_LEN], Vec<u8>), CryptoError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let payload = Payload {
            msg: plaintext,
            aad: aad.unwrap_or(b""),
        };
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), payload)
            .map_err(|_| CryptoError::Decryption)?;
        Ok((nonce, ciphertext))
    }

    /// Decrypt `ciphertext` with the given nonce and AAD.
    pub fn decrypt(
        &self,
        nonce: &[u8],
        ciphertext: &[u8],
        aad: Option<&[u8]>,
    ) -> Result<Vec<u8>, CryptoError> {
        if nonce.len() != NONCE_LEN {
            return Err(CryptoError::Decryption);
        }
        let payload = Payload {
            msg: ciphertext,
            aad: aad.unwrap_or(b""),
        };
        self.cipher
            .decrypt(Nonce::from_slice(nonce), payload)
            .map_err(|_| CryptoError::Decryption)
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_round_trip() {
        let cipher = MessageCipher::generate();
        let (nonce, ct) = cipher.encrypt(b"secret payload", None).unwrap();
        assert_eq!(cipher.decrypt(&nonce, &ct, None).unwrap(), b"secret payload");
    }

    #[test]
    fn ciphertext_includes_tag_overhead() {
        let cipher = MessageCipher::generate();
        let (_, ct) = cipher.encrypt(b"abc", None).unwrap();
        assert_eq!(ct.len(), 3 + 16);
    }

    #[test]
    fn round_trip_with_aad() {
        let cipher = MessageCipher::generate();
        let (nonce, ct) = cipher.encrypt(b"payload", Some(b"header")).unwrap();
        assert_eq!(
            cipher.decrypt(&nonce, &ct, Some(b"header")).unwrap(),
            b"payload"
        );
    }

    #[test]
    fn wrong_aad_fails() {
        let cipher = MessageCipher::generate();
        let (nonce, ct) = cipher.encrypt(b"payload", Some(b"header")).unwrap();
        assert!(matches!(
            cipher.decrypt(&nonce, &ct, Some(b"other")),
            Err(CryptoError::Decryption)
        ));
    }

    #[test]
    fn wrong_key_fails() {
        let a = MessageCipher::generate();
        let b = MessageCipher::generate();
        let (nonce, ct) = a.encrypt(b"payload", None).unwrap();
        assert!(b.decrypt(&nonce, &ct, None).is_err());
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let cipher = MessageCipher::generate();
        let (nonce, mut ct) = cipher.encrypt(b"payload", None).unwrap();
        ct[0] ^= 0x01;
        assert!(cipher.decrypt(&nonce, &ct, None).is_err());
    }

    #[test]
    fn wrong_nonce_length_fails() {
        let cipher = MessageCipher::generate();
        let (_, ct) = cipher.encrypt(b"payload", None).unwrap();
        assert!(cipher.decrypt(b"short", &ct, None).is_err());
    }

    #[test]
    fn same_key_two_instances_interoperate() {
        let a = MessageCipher::generate();
        let b = MessageCipher::new(*a.key());
        let (nonce, ct) = a.encrypt(b"shared", None).unwrap();
        assert_eq!(b.decrypt(&nonce, &ct, None).unwrap(), b"shared");
    }
}
