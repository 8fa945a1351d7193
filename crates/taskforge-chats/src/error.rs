use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("chat not found: {id}")]
    NotFound { id: i64 },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, ChatError>;
