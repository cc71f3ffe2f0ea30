use crate::core::logging::LoggingError;
use crate::recorder::errors::SessionError;
use thiserror::Error;

/// Errors that end the command-line run.
#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Logging(#[from] LoggingError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Recording failed: {0}")]
    RecordingFailed(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl AppError {
    pub fn recording_failed(msg: impl Into<String>) -> Self {
        AppError::RecordingFailed(msg.into())
    }
}
