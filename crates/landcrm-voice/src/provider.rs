//! Remote speech service seam and the VoiceKit HTTP adapter
//!
//! Everything vendor-specific lives here. The rest of the crate talks to a
//! [`VoiceProvider`], which moves raw JSON and audio bytes; interpreting
//! recognition responses is the job of [`crate::stt`].

use crate::config::{ConnectionSettings, RecognitionConfig, SynthesisConfig};
use crate::connection::ConnectionCredentials;
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

const STT_AUDIENCE: &str = "tinkoff.cloud.stt";
const TTS_AUDIENCE: &str = "tinkoff.cloud.tts";

/// One-shot recognition request. `audio` is LINEAR16 PCM in the configured format.
#[derive(Debug, Clone)]
pub struct RecognizeRequest {
    pub config: RecognitionConfig,
    pub audio: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct SynthesizeRequest {
    pub text: String,
    pub config: SynthesisConfig,
}

/// LINEAR16 audio fed to a streaming recognition call
pub type AudioByteStream = BoxStream<'static, Vec<u8>>;
/// Raw responses of a streaming recognition call, in arrival order
pub type ResponseStream = BoxStream<'static, VoiceResult<Value>>;

#[async_trait]
pub trait VoiceProvider: Send + Sync {
    /// Short vendor name for logs
    fn name(&self) -> &str;

    /// Single round-trip recognition; returns the raw response document
    async fn recognize(&self, request: RecognizeRequest) -> VoiceResult<Value>;

    /// Streaming recognition. The default collects the whole source and answers once.
    async fn recognize_stream(
        &self,
        config: RecognitionConfig,
        audio: AudioByteStream,
    ) -> VoiceResult<ResponseStream> {
        let bytes: Vec<u8> = audio.concat().await;
        let response = self.recognize(RecognizeRequest { config, audio: bytes }).await;
        Ok(stream::once(async move { response }).boxed())
    }

    /// Synthesize text; returns audio in the requested encoding
    async fn synthesize(&self, request: SynthesizeRequest) -> VoiceResult<Vec<u8>>;

    /// Cheap reachability probe
    async fn health(&self) -> VoiceResult<()>;

    fn supports_streaming(&self) -> bool {
        false
    }
}

#[derive(Serialize)]
struct Claims<'a> {
    iss: &'a str,
    sub: &'a str,
    aud: &'a str,
    iat: u64,
    exp: u64,
}

/// Tinkoff VoiceKit over its REST gateway
pub struct VoiceKitHttp {
    client: reqwest::Client,
    credentials: ConnectionCredentials,
    settings: ConnectionSettings,
}

impl fmt::Debug for VoiceKitHttp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VoiceKitHttp")
            .field("credentials", &self.credentials)
            .field("stt_url", &self.settings.stt_url)
            .field("tts_url", &self.settings.tts_url)
            .finish()
    }
}

impl VoiceKitHttp {
    pub fn new(credentials: ConnectionCredentials, settings: ConnectionSettings) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout())
            .build()
            .map_err(|e| VoiceError::Initialization(format!("HTTP client: {}", e)))?;
        // fail at construction rather than on the first request
        EncodingKey::from_base64_secret(credentials.secret_key())
            .map_err(|e| VoiceError::Initialization(format!("secret key: {}", e)))?;
        Ok(Self {
            client,
            credentials,
            settings,
        })
    }

    /// Mint a short-lived HS256 bearer token for one audience
    pub fn token(&self, audience: &str) -> VoiceResult<String> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let claims = Claims {
            iss: "landcrm",
            sub: self.credentials.api_key(),
            aud: audience,
            iat: now,
            exp: now + self.settings.token_ttl_secs,
        };
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(self.credentials.api_key().to_string());
        let key = EncodingKey::from_base64_secret(self.credentials.secret_key())
            .map_err(|e| VoiceError::Initialization(format!("secret key: {}", e)))?;
        encode(&header, &claims, &key)
            .map_err(|e| VoiceError::Initialization(format!("token: {}", e)))
    }

    fn url(base: &str, path: &str) -> String {
        format!("{}/{}", base.trim_end_matches('/'), path)
    }
}

/// Recognition config in the wire shape of the recognition service
pub fn recognition_config_json(config: &RecognitionConfig) -> Value {
    json!({
        "encoding": config.encoding.as_str(),
        "sample_rate_hertz": config.sample_rate,
        "num_channels": config.channels,
        "language_code": config.language,
        "model": config.model,
        "enable_automatic_punctuation": config.enable_automatic_punctuation,
        "profanity_filter": config.enable_profanity_filter,
        "max_alternatives": config.max_alternatives,
    })
}

/// Synthesis request in the wire shape of the synthesis service
pub fn synthesis_request_json(text: &str, config: &SynthesisConfig) -> Value {
    json!({
        "input": { "text": text },
        "voice": { "name": config.voice },
        "audioConfig": {
            "audio_encoding": config.encoding.as_str(),
            "sample_rate_hertz": config.sample_rate,
            "speaking_rate": config.speed,
            "pitch": config.pitch,
        },
    })
}

#[async_trait]
impl VoiceProvider for VoiceKitHttp {
    fn name(&self) -> &str {
        "voicekit"
    }

    async fn recognize(&self, request: RecognizeRequest) -> VoiceResult<Value> {
        let token = self.token(STT_AUDIENCE)?;
        let body = json!({
            "config": recognition_config_json(&request.config),
            "audio": { "content": BASE64.encode(&request.audio) },
        });
        let url = Self::url(&self.settings.stt_url, "stt:recognize");
        debug!(bytes = request.audio.len(), "POST {}", url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| VoiceError::RecognitionService(e.to_string()))?;
        let response = check_status(response, VoiceError::RecognitionService).await?;
        response
            .json::<Value>()
            .await
            .map_err(|e| VoiceError::RecognitionService(format!("invalid response: {}", e)))
    }

    async fn recognize_stream(
        &self,
        config: RecognitionConfig,
        audio: AudioByteStream,
    ) -> VoiceResult<ResponseStream> {
        let token = self.token(STT_AUDIENCE)?;
        let header = json!({
            "streaming_config": {
                "config": recognition_config_json(&config),
                "interim_results_config": { "enable_interim_results": config.interim_results },
            }
        });
        let first = stream::iter(std::iter::once(header));
        let frames = audio.map(|bytes| json!({ "audio_content": BASE64.encode(bytes) }));
        let mut lines = first.chain(frames).map(|message| {
            let mut line = message.to_string();
            line.push('\n');
            Ok::<_, std::io::Error>(line.into_bytes())
        });

        // the request body must be Sync; pump the audio through a channel
        let (body_tx, body_rx) = futures::channel::mpsc::unbounded();
        tokio::spawn(async move {
            while let Some(line) = lines.next().await {
                if body_tx.unbounded_send(line).is_err() {
                    break;
                }
            }
        });

        let url = Self::url(&self.settings.stt_url, "stt:streaming_recognize");
        debug!("POST {} (streaming)", url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(reqwest::Body::wrap_stream(body_rx))
            .send()
            .await
            .map_err(|e| VoiceError::RecognitionService(e.to_string()))?;
        let response = check_status(response, VoiceError::RecognitionService).await?;
        Ok(ndjson_values(response.bytes_stream()))
    }

    async fn synthesize(&self, request: SynthesizeRequest) -> VoiceResult<Vec<u8>> {
        let token = self.token(TTS_AUDIENCE)?;
        let url = Self::url(&self.settings.tts_url, "tts:synthesize");
        debug!(chars = request.text.chars().count(), voice = %request.config.voice, "POST {}", url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&synthesis_request_json(&request.text, &request.config))
            .send()
            .await
            .map_err(|e| VoiceError::SynthesisService(e.to_string()))?;
        let response = check_status(response, VoiceError::SynthesisService).await?;

        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("json"))
            .unwrap_or(false);
        let bytes = response
            .bytes()
            .await
            .map_err(|e| VoiceError::SynthesisService(e.to_string()))?;
        if is_json {
            audio_from_json(&bytes)
        } else {
            Ok(bytes.to_vec())
        }
    }

    async fn health(&self) -> VoiceResult<()> {
        let token = self.token(STT_AUDIENCE)?;
        let Some(url) = &self.settings.health_url else {
            return Ok(());
        };
        let response = self
            .client
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| VoiceError::ServiceUnavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(VoiceError::ServiceUnavailable(format!(
                "health endpoint returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    fn supports_streaming(&self) -> bool {
        true
    }
}

async fn check_status(
    response: reqwest::Response,
    to_error: fn(String) -> VoiceError,
) -> VoiceResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    warn!("Speech service returned {}: {}", status, body);
    Err(to_error(format!("HTTP {}: {}", status.as_u16(), body)))
}

/// Pull base64 audio out of a JSON synthesis response
fn audio_from_json(bytes: &[u8]) -> VoiceResult<Vec<u8>> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| VoiceError::SynthesisService(format!("invalid response: {}", e)))?;
    let encoded = value
        .get("audio_content")
        .or_else(|| value.get("audioContent"))
        .and_then(Value::as_str)
        .ok_or_else(|| VoiceError::SynthesisService("response carries no audio".to_string()))?;
    BASE64
        .decode(encoded)
        .map_err(|e| VoiceError::SynthesisService(format!("audio is not base64: {}", e)))
}

/// Split a byte stream into newline-delimited JSON documents
pub fn ndjson_values<S, B, E>(body: S) -> ResponseStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let state = (Box::pin(body), Vec::<u8>::new(), false);
    stream::unfold(state, |(mut body, mut buf, mut done)| async move {
        loop {
            if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                return Some((parse_line(&line), (body, buf, done)));
            }
            if done {
                if buf.iter().all(u8::is_ascii_whitespace) {
                    return None;
                }
                let line = std::mem::take(&mut buf);
                return Some((parse_line(&line), (body, buf, done)));
            }
            match body.next().await {
                Some(Ok(bytes)) => buf.extend_from_slice(bytes.as_ref()),
                Some(Err(e)) => {
                    buf.clear();
                    return Some((
                        Err(VoiceError::RecognitionService(format!("stream broke: {}", e))),
                        (body, buf, true),
                    ));
                }
                None => done = true,
            }
        }
    })
    .boxed()
}

fn parse_line(line: &[u8]) -> VoiceResult<Value> {
    serde_json::from_slice(line)
        .map_err(|e| VoiceError::RecognitionService(format!("invalid stream message: {}", e)))
}
