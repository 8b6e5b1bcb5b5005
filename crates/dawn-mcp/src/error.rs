use thiserror::Error;

/// Failure modes a method handler can report to the dispatcher.
///
/// The dispatcher maps these onto the JSON-RPC error codes; handlers never
/// construct wire errors themselves.
#[derive(Debug, Error, Clone)]
pub enum HandlerError {
    /// Parameters did not match what the method expects (→ −32602).
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// The handler itself failed (→ −32603, message carried as `data`).
    #[error("{0}")]
    Internal(String),
}

impl HandlerError {
    pub fn invalid_params(msg: impl Into<String>) -> Self {
        HandlerError::InvalidParams(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        HandlerError::Internal(msg.into())
    }
}
