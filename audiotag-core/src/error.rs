use std::time::Duration;

use thiserror::Error;

/// All errors produced by audiotag-core.
///
/// The set is closed: transports translate `kind()` into a response status
/// in exactly one place and never inspect the message text.
#[derive(Debug, Error)]
pub enum AudiotagError {
    #[error("download failed: {0}")]
    Download(String),

    #[error("audio decode failed: {0}")]
    Decode(String),

    #[error("invalid audio: {0}")]
    InvalidAudio(String),

    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("prediction failed: {0}")]
    Prediction(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("request exceeded its {0:?} deadline")]
    Timeout(Duration),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Coarse classification of an [`AudiotagError`] for transport mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Download,
    Decode,
    InvalidAudio,
    ModelUnavailable,
    Prediction,
    InvalidRequest,
    Timeout,
    Internal,
}

impl AudiotagError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AudiotagError::Download(_) => ErrorKind::Download,
            AudiotagError::Decode(_) => ErrorKind::Decode,
            AudiotagError::InvalidAudio(_) => ErrorKind::InvalidAudio,
            AudiotagError::ModelUnavailable(_) => ErrorKind::ModelUnavailable,
            AudiotagError::Prediction(_) => ErrorKind::Prediction,
            AudiotagError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            AudiotagError::Timeout(_) => ErrorKind::Timeout,
            AudiotagError::Other(_) => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, AudiotagError>;
