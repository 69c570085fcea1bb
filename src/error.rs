//! Error types for the metronome engine

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    /// A run configuration was rejected before the run started
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Device audio is unavailable or could not be resumed
    #[error("Audio unsupported: {0}")]
    UnsupportedAudio(#[from] AudioError),

    #[error("Configuration file error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for errors caused by the user-supplied run configuration
    pub fn is_invalid_config(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }

    /// True for errors caused by the audio device
    pub fn is_unsupported_audio(&self) -> bool {
        matches!(self, Error::UnsupportedAudio(_))
    }
}

/// Audio subsystem errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Failed to resume device: {0}")]
    ResumeFailed(String),

    #[error("Device is closed")]
    Closed,
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
