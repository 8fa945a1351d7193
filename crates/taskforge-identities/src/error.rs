use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity not found: {id}")]
    NotFound { id: i64 },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Secrets(#[from] taskforge_secrets::SecretsError),
}

pub type Result<T> = std::result::Result<T, IdentityError>;
