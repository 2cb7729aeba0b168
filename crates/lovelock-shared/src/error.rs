use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentifierError {
    #[error("Participant identifier is empty")]
    Empty,

    #[error("A participant cannot be paired with itself")]
    SelfPairing,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DerivationError {
    #[error("Cannot derive a shared key from an empty participant identifier")]
    EmptyIdentifier,
}

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Malformed envelope: missing ':' delimiter")]
    MalformedEnvelope,

    #[error("Malformed envelope: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    #[error("Invalid IV length: expected 12 bytes, got {0}")]
    InvalidIvLength(usize),

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Decrypted body is not valid UTF-8")]
    InvalidUtf8,
}

/// A message row that failed validation on its way in from the backend.
#[derive(Error, Debug)]
pub enum RowError {
    #[error("Row is missing field `{0}`")]
    MissingField(&'static str),

    #[error("Invalid message id: {0}")]
    InvalidId(#[from] uuid::Error),

    #[error("Invalid participant in `{field}`: {source}")]
    InvalidParticipant {
        field: &'static str,
        source: IdentifierError,
    },

    #[error("Invalid timestamp in `{field}`: {value}")]
    InvalidTimestamp { field: &'static str, value: String },

    #[error("Row is not a valid message object: {0}")]
    Json(#[from] serde_json::Error),
}
