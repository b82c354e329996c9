//! Error types for the vault observer

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by chain clients and the endpoint pool
#[derive(Error, Debug)]
pub enum ChainError {
    /// Block or receipt not produced yet. Callers retry later.
    #[error("not found")]
    NotFound,

    #[error("rpc error from {endpoint}: {message}")]
    Rpc { endpoint: String, message: String },

    #[error("rpc call to {endpoint} timed out after {after:?}")]
    Timeout { endpoint: String, after: Duration },

    #[error("no healthy endpoint for chain {chain}")]
    NoHealthyEndpoint {
        chain: String,
        #[source]
        last: Option<Box<ChainError>>,
    },

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// The node answered and refused the request
    #[error("rejected by node: {0}")]
    Rejected(String),
}

impl ChainError {
    /// Whether the pool should move on to the next endpoint
    pub fn is_failover(&self) -> bool {
        matches!(
            self,
            ChainError::Rpc { .. } | ChainError::Timeout { .. } | ChainError::NoHealthyEndpoint { .. }
        )
    }

    /// Innermost message, looking through `NoHealthyEndpoint`
    pub fn root_message(&self) -> String {
        match self {
            ChainError::NoHealthyEndpoint {
                last: Some(inner), ..
            } => inner.root_message(),
            ChainError::Rpc { message, .. } => message.clone(),
            ChainError::Rejected(message) => message.clone(),
            other => other.to_string(),
        }
    }
}

/// Typed failures while decoding chain payloads
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("empty payload")]
    Empty,

    #[error("malformed transaction: {0}")]
    Transaction(String),

    #[error("malformed block: {0}")]
    Block(String),

    #[error("invalid address {0}")]
    Address(String),

    #[error("invalid public key: {0}")]
    PublicKey(String),
}

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Chain {chain} failed to start: {source}")]
    Startup {
        chain: String,
        #[source]
        source: Box<EngineError>,
    },

    #[error("Chain {0} not found")]
    ChainNotFound(String),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn startup(chain: &str, source: EngineError) -> Self {
        EngineError::Startup {
            chain: chain.to_string(),
            source: Box::new(source),
        }
    }
}

/// Categorised dispatch failure reported back to the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchErrorKind {
    Decode,
    InsufficientBalance,
    NonceConflict,
    SubmitFailed,
    ChainNotFound,
}

impl DispatchErrorKind {
    /// Classify a node's submission failure from its message
    pub fn from_submit_error(err: &ChainError) -> Self {
        let message = err.root_message().to_lowercase();
        if message.contains("insufficient funds") {
            DispatchErrorKind::InsufficientBalance
        } else if message.contains("nonce too low")
            || message.contains("nonce too high")
            || message.contains("replacement transaction underpriced")
        {
            DispatchErrorKind::NonceConflict
        } else {
            DispatchErrorKind::SubmitFailed
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchErrorKind::Decode => "decode",
            DispatchErrorKind::InsufficientBalance => "insufficient_balance",
            DispatchErrorKind::NonceConflict => "nonce_conflict",
            DispatchErrorKind::SubmitFailed => "submit_failed",
            DispatchErrorKind::ChainNotFound => "chain_not_found",
        }
    }
}

/// Result type for chain operations
pub type ChainResult<T> = Result<T, ChainError>;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failover_classification() {
        let rpc = ChainError::Rpc {
            endpoint: "http://a".into(),
            message: "connection refused".into(),
        };
        assert!(rpc.is_failover());
        assert!(!ChainError::NotFound.is_failover());
        assert!(!ChainError::Rejected("nonce too low".into()).is_failover());
    }

    #[test]
    fn test_submit_error_categories() {
        let wrapped = ChainError::NoHealthyEndpoint {
            chain: "eth".into(),
            last: Some(Box::new(ChainError::Rejected(
                "insufficient funds for gas * price + value".into(),
            ))),
        };
        assert_eq!(
            DispatchErrorKind::from_submit_error(&wrapped),
            DispatchErrorKind::InsufficientBalance
        );
        assert_eq!(
            DispatchErrorKind::from_submit_error(&ChainError::Rejected("nonce too low".into())),
            DispatchErrorKind::NonceConflict
        );
        assert_eq!(
            DispatchErrorKind::from_submit_error(&ChainError::NotFound),
            DispatchErrorKind::SubmitFailed
        );
    }
}
