// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Digest, comparison, and key-derivation helpers.

use blake2::Blake2b512;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

pub fn sha512(data: &[u8]) -> [u8; 64] {
    Sha512::digest(data).into()
}

pub fn blake2b(data: &[u8]) -> [u8; 64] {
    Blake2b512::digest(data).into()
}

/// Hex digest of a UTF-8 string, SHA-256.
pub fn sha256_hex(data: &str) -> String {
    hex::encode(sha256(data.as_bytes()))
}

/// Constant-time byte comparison.
///
/// Lengths are compared first (that much is observable from the inputs
/// anyway); the byte comparison itself never short-circuits.
pub fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    bool::from(a.ct_eq(b))
}

/// PBKDF2-HMAC-SHA256 password KDF, 100 000 iterations.
pub fn derive_key_from_password(password: &str, salt: &[u8], length: usize) -> Vec<u8> {
    const ITERATIONS: u32 = 100_000;
    let mut out = vec![0u8; length];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, ITERATIONS, &mut out);
    out
}

/// Cryptographically secure random bytes from the OS CSPRNG.
pub fn random_bytes(length: usize) -> Vec<u8> {
    let mut out = vec![0u8; length];
    OsRng.fill_bytes(&mut out);
    out
}

/// 96-bit nonce suitable for AES-GCM.
pub fn generate_nonce() -> [u8; 12] {
    let mut out = [0u8; 12];
    OsRng.fill_bytes(&mut out);
    out
}

/// 128-bit salt for password KDFs.
pub fn generate_salt() -> [u8; 16] {
    let mut out = [0u8; 16];
    OsRng.fill_bytes(&mut out);
    out
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_known_vector() {
        // SHA-256("abc")
        assert_eq!(
            hex::encode(sha256(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn digest_lengths() {
        assert_eq!(sha256(b"x").len(), 32);
        assert_eq!(sha512(b"x").len(), 64);
        assert_eq!(blake2b(b"x").len(), 64);
    }

    #[test]
    fn constant_time_compare_equal_and_unequal() {
        assert!(constant_time_compare(b"same", b"same"));
        assert!(!constant_time_compare(b"same", b"sam_"));
        assert!(!constant_time_compare(b"same", b"longer"));
        assert!(constant_time_compare(b"", b""));
    }

    #[test]
    fn pbkdf2_is_deterministic_and_salt_sensitive() {
        let k1 = derive_key_from_password("hunter2", b"salt-one-16bytes", 32);
        let k2 = derive_key_from_password("hunter2", b"salt-one-16bytes", 32);
        let k3 = derive_key_from_password("hunter2", b"salt-two-16bytes", 32);
        assert_eq!(k1, k2);
        assert_ne!(k1, k3);
        assert_eq!(k1.len(), 32);
    }

    #[test]
    fn random_bytes_are_distinct() {
        assert_ne!(random_bytes(32), random_bytes(32));
        assert_eq!(random_bytes(7).len(), 7);
    }
}
