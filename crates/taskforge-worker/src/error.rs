use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Task(#[from] taskforge_tasks::TaskError),

    #[error(transparent)]
    Chat(#[from] taskforge_chats::ChatError),

    #[error(transparent)]
    Secrets(#[from] taskforge_secrets::SecretsError),

    #[error("agent unavailable: {0}")]
    AgentUnavailable(String),

    #[error("agent process error: {0}")]
    AgentProcess(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WorkerError>;
