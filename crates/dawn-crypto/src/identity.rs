// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! [`NodeIdentity`] — the long-lived Ed25519 keypair that names a node.
//!
//! The node id is the lowercase hex encoding of the 32-byte verifying key, so
//! any peer can verify a signed envelope from the sender's node id alone.
//! Only the 32-byte seed is ever persisted, written with mode 0o600 via a
//! temp-file + fsync + rename so a crash can never leave a partial key file.

use std::fs;
use std::path::Path;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::CryptoError;

/// Ed25519 node identity.
///
/// Constructed from a fresh random seed, a persisted seed, or — for
/// verification of remote envelopes — from public-key bytes alone, in which
/// case [`NodeIdentity::sign`] fails with [`CryptoError::NoPrivateKey`].
#[derive(Clone)]
pub struct NodeIdentity {
    signing: Option<SigningKey>,
    verifying: VerifyingKey,
}

impl std::fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("node_id", &self.node_id())
            .field("has_private_key", &self.signing.is_some())
            .finish()
    }
}

impl NodeIdentity {
    /// Generate a fresh identity from the OS CSPRNG.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        Self::from_seed(seed)
    }

    /// Rebuild an identity from a persisted 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let signing = SigningKey::from_bytes(&seed);
        let verifying = signing.verifying_key();
        Self {
            signing: Some(signing),
            verifying,
        }
    }

    /// Build a verify-only identity from a peer's public key bytes.
    pub fn from_public_key_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("public key must be 32 bytes".into()))?;
        let verifying = VerifyingKey::from_bytes(&arr)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self {
            signing: None,
            verifying,
        })
    }

    /// Build a verify-only identity from a hex node id.
    pub fn from_node_id(node_id: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(node_id)
            .map_err(|e| CryptoError::InvalidKey(format!("node id is not hex: {e}")))?;
        Self::from_public_key_bytes(&bytes)
    }

    /// The node id: lowercase hex of the verifying key.
    pub fn node_id(&self) -> String {
        hex::encode(self.verifying.as_bytes())
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.verifying.to_bytes()
    }

    /// The 32-byte private seed, for persistence.
    pub fn seed(&self) -> Result<[u8; 32], CryptoError> {
        match &self.signing {
            Some(k) => Ok(k.to_bytes()),
            None => Err(CryptoError::NoPrivateKey),
        }
    }

    /// Sign `message` with the private key.
    pub fn sign(&self, message: &[u8]) -> Result<[u8; 64], CryptoError> {
        match &self.signing {
            Some(k) => Ok(k.sign(message).to_bytes()),
            None => Err(CryptoError::NoPrivateKey),
        }
    }

    /// Verify `signature` over `message` against this identity's public key.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(sig) = Signature::from_slice(signature) else {
            return false;
        };
        self.verifying.verify(message, &sig).is_ok()
    }

    /// Load a persisted identity from `path`, or generate a new one and
    /// write its seed there.
    ///
    /// A key file of the wrong length is **not** silently replaced — rotating
    /// the identity changes the node id, which would orphan every peer and
    /// registry entry that references it. The operator must delete the file
    /// explicitly to re-key.
    pub fn load_or_create(path: &Path) -> Result<Self, CryptoError> {
        if path.exists() {
            let raw = fs::read(path).map_err(|e| CryptoError::Keypair(e.to_string()))?;
            let seed: [u8; 32] = raw.as_slice().try_into().map_err(|_| {
                CryptoError::Keypair(format!(
                    "identity file '{}' has {} bytes, expected a 32-byte seed. \
                     Delete the file to generate a new identity (this changes the node id).",
                    path.display(),
                    raw.len()
                ))
            })?;
            return Ok(Self::from_seed(seed));
        }

        let identity = Self::generate();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| CryptoError::Keypair(e.to_string()))?;
        }
        write_secret_file(path, &identity.seed()?)?;
        tracing::info!("Generated new node identity at {}", path.display());
        Ok(identity)
    }
}

/// Write `data` to `path` atomically with mode 0o600 on Unix.
///
/// temp file in the same directory → write → fsync → rename, so readers see
/// either the old file or the complete new one, never a partial write.
pub fn write_secret_file(path: &Path, data: &[u8]) -> Result<(), CryptoError> {
    use std::io::Write;

    let tmp = path.with_extension("tmp");
    {
        let mut opts = fs::OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o600);
        }
        let mut f = opts.open(&tmp)?;
        f.write_all(data)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_is_hex_of_public_key() {
        let id = NodeIdentity::generate();
        assert_eq!(id.node_id(), hex::encode(id.public_key_bytes()));
        assert_eq!(id.node_id().len(), 64);
    }

    #[test]
    fn identity_stable_under_seed_round_trip() {
        let id = NodeIdentity::generate();
        let restored = NodeIdentity::from_seed(id.seed().unwrap());
        assert_eq!(id.node_id(), restored.node_id());
    }

    #[test]
    fn sign_verify_round_trip() {
        let id = NodeIdentity::generate();
        let msg = b"hello dawn";
        let sig = id.sign(msg).unwrap();
        assert!(id.verify(msg, &sig));
    }

    #[test]
    fn wrong_key_fails_verification() {
        let a = NodeIdentity::generate();
        let b = NodeIdentity::generate();
        let sig = a.sign(b"msg").unwrap();
        assert!(!b.verify(b"msg", &sig));
    }

    #[test]
    fn tampered_message_fails_verification() {
        let id = NodeIdentity::generate();
        let sig = id.sign(b"original").unwrap();
        assert!(!id.verify(b"tampered", &sig));
    }

    #[test]
    fn public_only_identity_cannot_sign() {
        let id = NodeIdentity::generate();
        let pub_only = NodeIdentity::from_public_key_bytes(&id.public_key_bytes()).unwrap();
        assert!(matches!(
            pub_only.sign(b"x"),
            Err(CryptoError::NoPrivateKey)
        ));
        // but it can still verify
        let sig = id.sign(b"x").unwrap();
        assert!(pub_only.verify(b"x", &sig));
    }

    #[test]
    fn verify_rejects_garbage_signature_bytes() {
        let id = NodeIdentity::generate();
        assert!(!id.verify(b"msg", b"short"));
    }

    #[test]
    fn load_or_create_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault/node_identity.key");
        let first = NodeIdentity::load_or_create(&path).unwrap();
        let second = NodeIdentity::load_or_create(&path).unwrap();
        assert_eq!(first.node_id(), second.node_id());
    }

    #[test]
    fn load_or_create_rejects_wrong_length_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node_identity.key");
        std::fs::write(&path, b"not a seed").unwrap();
        assert!(NodeIdentity::load_or_create(&path).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn secret_file_has_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("id.key");
        NodeIdentity::load_or_create(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
