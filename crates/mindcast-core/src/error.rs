use thiserror::Error;

#[derive(Debug, Error)]
pub enum MindcastError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Bus error: {0}")]
    Bus(String),

    #[error("Executor error: {0}")]
    Executor(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, MindcastError>;
