use thiserror::Error;

/// Errors raised by the encryption adapter
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Key derivation failed: {0}")]
    KdfFailed(String),

    #[error("Encryption failed")]
    EncryptionFailed,

    /// Wrong key, or the ciphertext was tampered with
    #[error("Authentication failed - wrong key or tampered data")]
    AuthenticationFailed,

    #[error("Malformed ciphertext: {0}")]
    Malformed(String),

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("Payload is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CryptoError {
    /// Whether this error means "the key does not open this ciphertext",
    /// as opposed to a local encoding problem
    pub fn is_decryption_failure(&self) -> bool {
        matches!(
            self,
            CryptoError::AuthenticationFailed
                | CryptoError::Malformed(_)
                | CryptoError::Serialization(_)
        )
    }
}
