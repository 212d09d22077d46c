//! Error types for the CRM voice assistant

use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur anywhere in the voice core.
///
/// All payloads are strings so the same error can be returned to the caller,
/// emitted as an event and remembered as the last failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VoiceError {
    #[error("Microphone unavailable: {0}")]
    DeviceAccess(String),

    #[error("Audio device lost: {0}")]
    DeviceLost(String),

    #[error("Recording already in progress")]
    AlreadyRecording,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Recognition service error: {0}")]
    RecognitionService(String),

    #[error("Synthesis service error: {0}")]
    SynthesisService(String),

    #[error("Unsupported voice: {0}")]
    UnsupportedVoice(String),

    #[error("Initialization failed: {0}")]
    Initialization(String),

    #[error("Voice service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Audio decode error: {0}")]
    Decode(String),

    #[error("Reply generation failed: {0}")]
    Reply(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl VoiceError {
    /// Errors that end the current session and need an explicit restart.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            VoiceError::DeviceAccess(_)
                | VoiceError::DeviceLost(_)
                | VoiceError::Initialization(_)
                | VoiceError::ServiceUnavailable(_)
        )
    }
}

impl From<std::io::Error> for VoiceError {
    fn from(err: std::io::Error) -> Self {
        VoiceError::Io(err.to_string())
    }
}

impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::DeviceAccess(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        VoiceError::DeviceAccess(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        VoiceError::DeviceAccess(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::DeviceAccess(err.to_string())
    }
}

impl From<hound::Error> for VoiceError {
    fn from(err: hound::Error) -> Self {
        VoiceError::Decode(err.to_string())
    }
}

impl From<config::ConfigError> for VoiceError {
    fn from(err: config::ConfigError) -> Self {
        VoiceError::Config(err.to_string())
    }
}
