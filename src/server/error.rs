use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Malformed request: {0}")]
    ParseError(String),

    #[error("Conversion queue is full")]
    QueueFull,

    #[error("Worker pool is shut down")]
    PoolClosed,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ServerError>;
