use thiserror::Error;

use lovelock_shared::error::{CryptoError, DerivationError, IdentifierError};

use crate::backend::BackendError;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("No active pairing")]
    NotPaired,

    #[error("Pairing in progress, shared key not ready yet")]
    NotReady,

    #[error("Message is empty")]
    EmptyMessage,

    #[error("Pairing was replaced or torn down before it completed")]
    Superseded,

    #[error("Session task is no longer running")]
    Closed,

    #[error("Invalid identifier: {0}")]
    Identifier(#[from] IdentifierError),

    #[error("Key derivation failed: {0}")]
    Derivation(#[from] DerivationError),

    #[error("Encryption failed: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Background task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;
