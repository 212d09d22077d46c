//! Credentials and the connection to the remote speech services
//!
//! One [`ConnectionClient`] is built per assistant and handed to whoever needs
//! it; the recognizer and synthesizer are constructed from it, so they share the
//! same provider and credentials.

use crate::config::{ConnectionSettings, RecognitionConfig, SynthesisConfig};
use crate::error::{VoiceError, VoiceResult};
use crate::provider::{VoiceKitHttp, VoiceProvider};
use crate::stt::SpeechRecognizer;
use crate::tts::{is_voice_supported, SpeechSynthesizer};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Show at most the last four characters of a key
pub fn redact(key: &str) -> String {
    if key.is_empty() {
        return String::new();
    }
    let chars: Vec<char> = key.chars().collect();
    let tail: String = chars[chars.len().saturating_sub(4)..].iter().collect();
    format!("***{}", tail)
}

/// API key and secret. Immutable once built; `Debug` never prints either in full.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionCredentials {
    api_key: String,
    secret_key: String,
}

impl ConnectionCredentials {
    pub fn new(api_key: impl Into<String>, secret_key: impl Into<String>) -> VoiceResult<Self> {
        let api_key = api_key.into().trim().to_string();
        let secret_key = secret_key.into().trim().to_string();

        if api_key.is_empty() {
            return Err(VoiceError::Initialization("API key is missing".to_string()));
        }
        if secret_key.is_empty() {
            return Err(VoiceError::Initialization("secret key is missing".to_string()));
        }
        if api_key.chars().any(char::is_whitespace) {
            return Err(VoiceError::Initialization(
                "API key contains whitespace".to_string(),
            ));
        }
        if BASE64.decode(&secret_key).is_err() {
            return Err(VoiceError::Initialization(
                "secret key is not valid base64".to_string(),
            ));
        }

        Ok(Self {
            api_key,
            secret_key,
        })
    }

    /// Read `VOICEKIT_API_KEY` and `VOICEKIT_SECRET_KEY`
    pub fn from_env() -> VoiceResult<Self> {
        let api_key = std::env::var("VOICEKIT_API_KEY").unwrap_or_default();
        let secret_key = std::env::var("VOICEKIT_SECRET_KEY").unwrap_or_default();
        Self::new(api_key, secret_key)
    }

    /// Build from settings, falling back to the environment when the settings carry no key
    pub fn from_settings(settings: &ConnectionSettings) -> VoiceResult<Self> {
        if settings.api_key.is_empty() && settings.secret_key.is_empty() {
            return Self::from_env();
        }
        Self::new(settings.api_key.clone(), settings.secret_key.clone())
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub(crate) fn secret_key(&self) -> &str {
        &self.secret_key
    }
}

impl fmt::Debug for ConnectionCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionCredentials")
            .field("api_key", &redact(&self.api_key))
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}

/// Display-safe view of the connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub api_key: String,
    pub provider: String,
    pub stt_url: String,
    pub tts_url: String,
    pub secret_configured: bool,
}

#[derive(Clone)]
pub struct ConnectionClient {
    credentials: ConnectionCredentials,
    settings: ConnectionSettings,
    provider: Arc<dyn VoiceProvider>,
}

impl fmt::Debug for ConnectionClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionClient")
            .field("credentials", &self.credentials)
            .field("provider", &self.provider.name())
            .finish()
    }
}

impl ConnectionClient {
    /// Connect to VoiceKit over HTTP
    pub fn new(credentials: ConnectionCredentials, settings: ConnectionSettings) -> VoiceResult<Self> {
        let provider = VoiceKitHttp::new(credentials.clone(), settings.clone())?;
        info!(
            "🔌 Voice connection ready (key {}, stt {}, tts {})",
            redact(credentials.api_key()),
            settings.stt_url,
            settings.tts_url
        );
        Ok(Self {
            credentials,
            settings,
            provider: Arc::new(provider),
        })
    }

    /// Use any provider, e.g. a different vendor or a test double
    pub fn with_provider(credentials: ConnectionCredentials, provider: Arc<dyn VoiceProvider>) -> Self {
        Self {
            credentials,
            settings: ConnectionSettings::default(),
            provider,
        }
    }

    pub fn provider(&self) -> Arc<dyn VoiceProvider> {
        self.provider.clone()
    }

    pub fn recognizer(&self, config: RecognitionConfig) -> SpeechRecognizer {
        SpeechRecognizer::new(self.provider.clone(), config)
    }

    /// Fails with `UnsupportedVoice` when the configured voice is not in the catalogue
    pub fn synthesizer(&self, config: SynthesisConfig) -> VoiceResult<SpeechSynthesizer> {
        if !is_voice_supported(&config.voice) {
            return Err(VoiceError::UnsupportedVoice(config.voice));
        }
        Ok(SpeechSynthesizer::new(self.provider.clone(), config))
    }

    /// Never fails; any error reads as unhealthy
    pub async fn health_check(&self) -> bool {
        match self.provider.health().await {
            Ok(()) => true,
            Err(e) => {
                warn!("Voice service health check failed: {}", e);
                false
            }
        }
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            api_key: redact(self.credentials.api_key()),
            provider: self.provider.name().to_string(),
            stt_url: self.settings.stt_url.clone(),
            tts_url: self.settings.tts_url.clone(),
            secret_configured: !self.credentials.secret_key().is_empty(),
        }
    }
}
