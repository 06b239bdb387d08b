//! Error types for the live session engine

use thiserror::Error;

/// Result type alias for engine operations
pub type LiveResult<T> = Result<T, LiveError>;

/// Errors that can occur while running a live session
#[derive(Error, Debug)]
pub enum LiveError {
    #[error("Microphone permission denied: {0}")]
    Permission(String),

    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Speech recognition error: {0}")]
    Recognition(String),

    #[error("Speech recognition unavailable: {0}")]
    RecognitionUnavailable(String),

    #[error("Speech recognition stopped restarting after {0} attempts")]
    RestartLimitExceeded(u32),

    #[error("Completion error: {0}")]
    Completion(String),

    #[error("TTS error: {0}")]
    Synthesis(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Recording error: {0}")]
    Recording(String),

    #[error("History store error: {0}")]
    History(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid session transition: {0}")]
    InvalidState(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] sled::Error),
}

impl LiveError {
    /// Fatal-session errors stop the whole session; everything else is recoverable per turn.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LiveError::Permission(_)
                | LiveError::AudioDevice(_)
                | LiveError::RecognitionUnavailable(_)
                | LiveError::RestartLimitExceeded(_)
        )
    }

    /// Expected cancellation is never reported to the user.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, LiveError::Cancelled)
    }
}

impl From<config::ConfigError> for LiveError {
    fn from(err: config::ConfigError) -> Self {
        LiveError::Config(err.to_string())
    }
}

impl From<hound::Error> for LiveError {
    fn from(err: hound::Error) -> Self {
        LiveError::Recording(err.to_string())
    }
}
