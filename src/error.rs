use std::io;

#[derive(Debug, thiserror::Error)]
pub enum PlaybackError {
    #[error("audio error: {0}")]
    Audio(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("resample error: {0}")]
    Resample(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, PlaybackError>;
