use thiserror::Error;

/// Errors that can occur during secrets operations.
#[derive(Debug, Error)]
pub enum SecretsError {
    /// The master key is missing or not a base64-encoded 32-byte value.
    #[error("invalid master key: {0}")]
    MasterKey(String),

    /// Decryption failed. The ciphertext was tampered with or the master
    /// key does not match the one the value was encrypted under.
    #[error("invalid encryption key or corrupted data")]
    InvalidKey,

    /// A SQLite operation failed.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, SecretsError>;
