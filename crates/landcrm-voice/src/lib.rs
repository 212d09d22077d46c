//! # LandCRM Voice - Hands-free Assistant Core
//!
//! Microphone capture with voice activity detection, remote speech recognition
//! and synthesis, queued playback, and the half-duplex turn-taking loop that
//! ties them together. The business layer plugs in through [`ReplyGenerator`].
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         Voice Assistant                          │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐   │
//! │  │   Capture    │→ │ Meter + VAD  │→ │  Conversation Machine │   │
//! │  │    (cpal)    │  │  (rustfft)   │  │  (generation tagged)  │   │
//! │  └──────────────┘  └──────────────┘  └──────────────────────┘   │
//! │                                        ↓        ↑        ↓       │
//! │  ┌──────────────┐  ┌──────────────┐  ┌────────┐  ┌───────────┐  │
//! │  │   Playback   │← │  Synthesis   │← │ Reply  │← │Recognition│  │
//! │  │   (rodio)    │  │  (VoiceKit)  │  │ (ext.) │  │ (VoiceKit)│  │
//! │  └──────────────┘  └──────────────┘  └────────┘  └───────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod capture;
pub mod config;
pub mod connection;
pub mod error;
pub mod meter;
pub mod microphone;
pub mod orchestrator;
pub mod playback;
pub mod provider;
pub mod speaker;
pub mod stt;
pub mod tts;
pub mod turn;
pub mod vad;

pub use audio::{AudioChunk, AudioEncoding, AudioFormat, PcmBuffer};
pub use capture::{
    AudioCapture, CaptureEvent, CaptureEventKind, InputDevice, InputStream, RecordingStatus,
};
pub use config::{
    CaptureConfig, ConnectionSettings, PlaybackConfig, RecognitionConfig, SynthesisConfig,
    VadConfig, VoiceSettings,
};
pub use connection::{redact, ConnectionClient, ConnectionCredentials, ConnectionInfo};
pub use error::{VoiceError, VoiceResult};
pub use meter::SpectrumMeter;
pub use microphone::CpalMicrophone;
pub use orchestrator::{AssistantSnapshot, ReplyGenerator, VoiceAssistant, VoiceComponents};
pub use playback::{AudioOutput, AudioPlayback, PlaybackEvent, PlaybackState};
pub use provider::{RecognizeRequest, SynthesizeRequest, VoiceKitHttp, VoiceProvider};
pub use speaker::RodioOutput;
pub use stt::{Alternative, RecognitionResult, SpeechRecognizer};
pub use tts::{
    available_voices, is_voice_supported, split_into_chunks, SpeechSynthesizer, SynthesisResult,
    SynthesisSegment,
};
pub use turn::{AssistantEvent, ConversationMachine, ConversationState};
pub use vad::{VadEvent, VoiceActivityDetector};
