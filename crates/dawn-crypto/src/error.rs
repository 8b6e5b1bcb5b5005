use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum CryptoError {
    #[error("decryption failed")]
    Decryption,

    #[error("identity has no private key (built from public-key bytes)")]
    NoPrivateKey,

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("invalid signature encoding: {0}")]
    InvalidSignature(String),

    #[error("keypair error: {0}")]
    Keypair(String),

    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for CryptoError {
    fn from(e: std::io::Error) -> Self {
        CryptoError::Io(e.to_string())
    }
}
