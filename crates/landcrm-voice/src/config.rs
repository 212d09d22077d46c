//! Voice configuration loaded from `config/voice.toml` and the environment.
//!
//! Every knob the voice core exposes lives in one of the sections below, and each
//! section states its defaults exactly once in its `Default` impl. Files and env
//! vars only override what they mention.
//!
//! | Env | Default | Description |
//! |-----|---------|-------------|
//! | LANDCRM_VOICE_CONFIG | config/voice | Path (extension optional) of the TOML file. |
//! | LANDCRM__CONNECTION__API_KEY | (none) | VoiceKit API key. |
//! | LANDCRM__CONNECTION__SECRET_KEY | (none) | VoiceKit secret key (base64). |
//! | LANDCRM__VAD__VOLUME_THRESHOLD | 20 | Speech threshold on the 0–100 volume scale. |
//! | LANDCRM__SYNTHESIS__VOICE | alena | Voice id from the supported catalogue. |

use crate::audio::{AudioEncoding, AudioFormat};
use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Remote service endpoints and credentials.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub api_key: String,
    #[serde(skip_serializing)]
    pub secret_key: String,
    /// Base URL of the recognition service, without trailing slash.
    pub stt_url: String,
    /// Base URL of the synthesis service, without trailing slash.
    pub tts_url: String,
    /// When set, `health_check` also requires a 2xx GET from this URL.
    pub health_url: Option<String>,
    pub timeout_secs: u64,
    /// Lifetime of minted bearer tokens.
    pub token_ttl_secs: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            secret_key: String::new(),
            stt_url: "https://stt.tinkoff.ru/v1".to_string(),
            tts_url: "https://tts.tinkoff.ru/v1".to_string(),
            health_url: None,
            timeout_secs: 30,
            token_ttl_secs: 600,
        }
    }
}

impl fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSettings")
            .field("api_key", &crate::connection::redact(&self.api_key))
            .field("secret_key", &"[REDACTED]")
            .field("stt_url", &self.stt_url)
            .field("tts_url", &self.tts_url)
            .field("health_url", &self.health_url)
            .field("timeout_secs", &self.timeout_secs)
            .field("token_ttl_secs", &self.token_ttl_secs)
            .finish()
    }
}

impl ConnectionSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }
}

/// Microphone request and capture cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    /// How often `DataAvailable` chunks are emitted while recording.
    pub chunk_interval_ms: u64,
    /// Analyser window size in samples. Must be a power of two.
    pub fft_size: usize,
    /// Analyser smoothing time constant (0 = no smoothing).
    pub smoothing: f32,
    /// Audio kept from before speech start while nobody is talking.
    pub pre_roll_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            chunk_interval_ms: 100,
            fft_size: 2048,
            smoothing: 0.3,
            pre_roll_ms: 300,
        }
    }
}

impl CaptureConfig {
    pub fn chunk_interval(&self) -> Duration {
        Duration::from_millis(self.chunk_interval_ms)
    }

    pub fn pre_roll(&self) -> Duration {
        Duration::from_millis(self.pre_roll_ms)
    }
}

/// Voice activity thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Speech threshold on the 0–100 volume scale.
    pub volume_threshold: f32,
    /// Shorter segments are treated as noise and dropped.
    pub min_speech_duration_ms: u64,
    /// Hard cap on a single utterance.
    pub max_speech_duration_ms: u64,
    /// Continuous silence that ends an utterance.
    pub silence_duration_threshold_ms: u64,
    /// Volume sampling period.
    pub poll_interval_ms: u64,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            volume_threshold: 20.0,
            min_speech_duration_ms: 500,
            max_speech_duration_ms: 30_000,
            silence_duration_threshold_ms: 1500,
            poll_interval_ms: 50,
        }
    }
}

impl VadConfig {
    pub fn min_speech_duration(&self) -> Duration {
        Duration::from_millis(self.min_speech_duration_ms)
    }

    pub fn max_speech_duration(&self) -> Duration {
        Duration::from_millis(self.max_speech_duration_ms)
    }

    pub fn silence_duration_threshold(&self) -> Duration {
        Duration::from_millis(self.silence_duration_threshold_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Recognition request defaults. Per-call overrides replace the whole struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionConfig {
    pub encoding: AudioEncoding,
    pub sample_rate: u32,
    pub channels: u16,
    pub language: String,
    pub model: String,
    pub enable_automatic_punctuation: bool,
    pub enable_profanity_filter: bool,
    pub max_alternatives: u32,
    /// Ask the streaming endpoint for interim (non-final) hypotheses.
    pub interim_results: bool,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            encoding: AudioEncoding::Linear16,
            sample_rate: 16000,
            channels: 1,
            language: "ru-RU".to_string(),
            model: "general".to_string(),
            enable_automatic_punctuation: true,
            enable_profanity_filter: false,
            max_alternatives: 1,
            interim_results: true,
        }
    }
}

impl RecognitionConfig {
    pub fn format(&self) -> AudioFormat {
        AudioFormat::linear16(self.sample_rate, self.channels)
    }
}

/// Synthesis request defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    pub voice: String,
    pub encoding: AudioEncoding,
    pub sample_rate: u32,
    pub speed: f32,
    pub pitch: f32,
    /// Upper bound for one streamed synthesis chunk, in characters.
    pub max_chunk_chars: usize,
    /// Estimated speech rate used to size the silent fallback buffer.
    pub fallback_seconds_per_char: f32,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            voice: "alena".to_string(),
            encoding: AudioEncoding::Linear16,
            sample_rate: 48000,
            speed: 1.0,
            pitch: 1.0,
            max_chunk_chars: 200,
            fallback_seconds_per_char: 0.1,
        }
    }
}

impl SynthesisConfig {
    pub fn format(&self) -> AudioFormat {
        AudioFormat::linear16(self.sample_rate, 1)
    }
}

/// Output volume and worker cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub volume: f32,
    /// How often the worker checks whether the current buffer finished.
    pub poll_interval_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            volume: 0.8,
            poll_interval_ms: 20,
        }
    }
}

impl PlaybackConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Everything `VoiceAssistant::initialize` needs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceSettings {
    pub connection: ConnectionSettings,
    pub capture: CaptureConfig,
    pub vad: VadConfig,
    pub recognition: RecognitionConfig,
    pub synthesis: SynthesisConfig,
    pub playback: PlaybackConfig,
}

impl VoiceSettings {
    /// Load settings from file and environment. Precedence: env `LANDCRM__*` > file > defaults.
    /// The file path comes from `LANDCRM_VOICE_CONFIG` (default `config/voice`); a missing file is fine.
    pub fn load() -> VoiceResult<Self> {
        let config_path =
            std::env::var("LANDCRM_VOICE_CONFIG").unwrap_or_else(|_| "config/voice".to_string());

        let built = config::Config::builder()
            .add_source(config::File::with_name(&config_path).required(false))
            .add_source(
                config::Environment::with_prefix("LANDCRM")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: VoiceSettings = built.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from a TOML string (defaults fill the gaps).
    pub fn from_toml(source: &str) -> VoiceResult<Self> {
        let built = config::Config::builder()
            .add_source(config::File::from_str(source, config::FileFormat::Toml))
            .build()?;
        let settings: VoiceSettings = built.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject values the components cannot run with.
    pub fn validate(&self) -> VoiceResult<()> {
        let vad = &self.vad;
        if !(0.0..=100.0).contains(&vad.volume_threshold) {
            return Err(VoiceError::Config(format!(
                "vad.volume_threshold must be within 0..=100, got {}",
                vad.volume_threshold
            )));
        }
        if vad.poll_interval_ms == 0 || vad.silence_duration_threshold_ms == 0 {
            return Err(VoiceError::Config(
                "vad intervals must be greater than zero".to_string(),
            ));
        }
        if vad.min_speech_duration_ms >= vad.max_speech_duration_ms {
            return Err(VoiceError::Config(format!(
                "vad.min_speech_duration_ms ({}) must be below vad.max_speech_duration_ms ({})",
                vad.min_speech_duration_ms, vad.max_speech_duration_ms
            )));
        }

        let capture = &self.capture;
        if capture.sample_rate == 0 || capture.channels == 0 || capture.chunk_interval_ms == 0 {
            return Err(VoiceError::Config(
                "capture sample_rate, channels and chunk_interval_ms must be non-zero".to_string(),
            ));
        }
        if !capture.fft_size.is_power_of_two() || capture.fft_size < 32 {
            return Err(VoiceError::Config(format!(
                "capture.fft_size must be a power of two >= 32, got {}",
                capture.fft_size
            )));
        }
        if !(0.0..=1.0).contains(&capture.smoothing) {
            return Err(VoiceError::Config(format!(
                "capture.smoothing must be within 0..=1, got {}",
                capture.smoothing
            )));
        }

        if self.recognition.sample_rate == 0 || self.recognition.channels == 0 {
            return Err(VoiceError::Config(
                "recognition sample_rate and channels must be non-zero".to_string(),
            ));
        }

        let synthesis = &self.synthesis;
        if !crate::tts::is_voice_supported(&synthesis.voice) {
            return Err(VoiceError::UnsupportedVoice(synthesis.voice.clone()));
        }
        if synthesis.sample_rate == 0 || synthesis.max_chunk_chars == 0 {
            return Err(VoiceError::Config(
                "synthesis sample_rate and max_chunk_chars must be non-zero".to_string(),
            ));
        }
        if synthesis.fallback_seconds_per_char < 0.0 {
            return Err(VoiceError::Config(
                "synthesis.fallback_seconds_per_char must not be negative".to_string(),
            ));
        }

        if self.playback.poll_interval_ms == 0 {
            return Err(VoiceError::Config(
                "playback.poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
