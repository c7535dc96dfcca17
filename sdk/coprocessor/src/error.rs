use thiserror::Error;
use veil_types::Handle;

/// Coprocessor errors
#[derive(Debug, Error)]
pub enum CoprocessorError {
    #[error("input proof is malformed")]
    MalformedProof,

    #[error("input proof does not verify for this contract and user")]
    InvalidProof,

    #[error("unknown ciphertext handle {0}")]
    UnknownHandle(Handle),

    #[error("type mismatch on handle {0}")]
    TypeMismatch(Handle),

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("re-encrypted payload could not be opened")]
    ReencryptionFailed,

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("payload could not be encoded: {0}")]
    Encoding(String),
}
