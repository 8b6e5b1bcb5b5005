use thiserror::Error;

use dawn_crypto::CryptoError;

#[derive(Debug, Error, Clone)]
pub enum P2pError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("handshake error: {0}")]
    Handshake(String),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("discovery error: {0}")]
    Discovery(String),

    #[error("peer not found: {0}")]
    PeerNotFound(String),

    #[error("invalid address: {0}")]
    Address(String),

    #[error("request timed out")]
    Timeout,

    #[error("node already shut down")]
    Shutdown,

    #[error("invalid padding")]
    InvalidPadding,

    #[error("onion peel error: {0}")]
    OnionPeel(String),

    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for P2pError {
    fn from(e: std::io::Error) -> Self {
        P2pError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for P2pError {
    fn from(e: serde_json::Error) -> Self {
        P2pError::Transport(format!("serialization: {e}"))
    }
}
