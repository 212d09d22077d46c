//! Speech recognition client
//!
//! Converts captured audio to LINEAR16, hands it to the provider and turns the
//! provider's JSON into [`RecognitionResult`]s. Response parsing is tolerant of
//! schema variation and lives only here.

use crate::audio::{self, AudioChunk};
use crate::config::RecognitionConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::provider::{RecognizeRequest, VoiceProvider};
use futures::future;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A lower-ranked hypothesis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alternative {
    pub transcript: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionResult {
    /// Best hypothesis as ranked by the service
    pub transcript: String,
    /// Confidence of `transcript`, 0..=1
    pub confidence: f32,
    /// Remaining hypotheses in the service's order
    pub alternatives: Vec<Alternative>,
    /// Always true for batch results; streaming results may be interim
    pub is_final: bool,
}

impl RecognitionResult {
    pub fn empty(is_final: bool) -> Self {
        Self {
            transcript: String::new(),
            confidence: 0.0,
            alternatives: Vec::new(),
            is_final,
        }
    }

    /// A command the user typed instead of saying
    pub fn typed(text: &str) -> Self {
        Self {
            transcript: text.to_string(),
            confidence: 1.0,
            alternatives: Vec::new(),
            is_final: true,
        }
    }

    /// Whitespace-only transcripts carry no speech
    pub fn is_blank(&self) -> bool {
        self.transcript.trim().is_empty()
    }
}

pub struct SpeechRecognizer {
    provider: Arc<dyn VoiceProvider>,
    config: RecognitionConfig,
}

impl SpeechRecognizer {
    pub fn new(provider: Arc<dyn VoiceProvider>, config: RecognitionConfig) -> Self {
        Self { provider, config }
    }

    pub fn config(&self) -> &RecognitionConfig {
        &self.config
    }

    pub fn update_config(&mut self, config: RecognitionConfig) {
        self.config = config;
    }

    pub fn supports_streaming(&self) -> bool {
        self.provider.supports_streaming()
    }

    /// One round-trip. Transport and service failures propagate as `RecognitionService`.
    pub async fn recognize_batch(
        &self,
        chunk: &AudioChunk,
        config: Option<&RecognitionConfig>,
    ) -> VoiceResult<RecognitionResult> {
        let config = config.unwrap_or(&self.config).clone();
        let pcm = audio::to_linear16(chunk, config.sample_rate, config.channels)?;
        info!(
            "📝 Recognizing {:?} of audio ({} bytes LINEAR16)",
            chunk.duration(),
            pcm.len()
        );

        let raw = self
            .provider
            .recognize(RecognizeRequest { config, audio: pcm })
            .await
            .map_err(as_recognition_error)?;
        let result = parse_batch_response(&raw);
        debug!(transcript = %result.transcript, confidence = result.confidence, "Recognition result");
        Ok(result)
    }

    /// Open a fresh remote stream fed by `source`.
    ///
    /// Yields interim and final results in arrival order. The stream ends after
    /// the first final result, after the first error, or when the remote side closes.
    pub fn recognize_stream<S>(
        &self,
        source: S,
        config: Option<&RecognitionConfig>,
    ) -> BoxStream<'static, VoiceResult<RecognitionResult>>
    where
        S: Stream<Item = AudioChunk> + Send + 'static,
    {
        let config = config.unwrap_or(&self.config).clone();
        let provider = self.provider.clone();
        let (rate, channels) = (config.sample_rate, config.channels);

        let audio_bytes = source
            .filter_map(move |chunk| {
                let converted = match audio::to_linear16(&chunk, rate, channels) {
                    Ok(bytes) if !bytes.is_empty() => Some(bytes),
                    Ok(_) => None,
                    Err(e) => {
                        warn!("Dropping unconvertible audio chunk: {}", e);
                        None
                    }
                };
                future::ready(converted)
            })
            .boxed();

        let opened = async move { provider.recognize_stream(config, audio_bytes).await };

        let results = stream::once(opened)
            .map(|opened| match opened {
                Ok(responses) => responses
                    .filter_map(|response| {
                        future::ready(match response {
                            Ok(value) => parse_streaming_response(&value).map(Ok),
                            Err(e) => Some(Err(as_recognition_error(e))),
                        })
                    })
                    .boxed(),
                Err(e) => stream::once(future::ready(Err(as_recognition_error(e)))).boxed(),
            })
            .flatten()
            .boxed();

        // stop before polling the remote side again
        stream::unfold((results, false), |(mut results, finished)| async move {
            if finished {
                return None;
            }
            let item: VoiceResult<RecognitionResult> = results.next().await?;
            let finished = match &item {
                Ok(result) => result.is_final,
                Err(_) => true,
            };
            Some((item, (results, finished)))
        })
        .boxed()
    }
}

fn as_recognition_error(err: VoiceError) -> VoiceError {
    match err {
        VoiceError::RecognitionService(_) => err,
        other => VoiceError::RecognitionService(other.to_string()),
    }
}

/// Parse a one-shot response; missing results read as an empty final transcript
pub fn parse_batch_response(value: &Value) -> RecognitionResult {
    result_entries(value)
        .first()
        .map(|entry| parse_result(entry, true))
        .unwrap_or_else(|| RecognitionResult::empty(true))
}

/// Parse one streaming message; messages without results yield `None`
pub fn parse_streaming_response(value: &Value) -> Option<RecognitionResult> {
    result_entries(value)
        .first()
        .map(|entry| parse_result(entry, false))
}

fn result_entries(value: &Value) -> Vec<&Value> {
    if let Some(results) = value.get("results").and_then(Value::as_array) {
        return results.iter().collect();
    }
    match value.get("result") {
        Some(Value::Array(results)) => results.iter().collect(),
        Some(inner @ Value::Object(_)) => {
            let nested = result_entries(inner);
            if nested.is_empty() {
                vec![inner]
            } else {
                nested
            }
        }
        _ if value.get("alternatives").is_some() || value.get("transcript").is_some() => {
            vec![value]
        }
        _ => Vec::new(),
    }
}

fn parse_result(entry: &Value, default_final: bool) -> RecognitionResult {
    let is_final = entry
        .get("is_final")
        .or_else(|| entry.get("isFinal"))
        .and_then(Value::as_bool)
        .unwrap_or(default_final);

    let hypotheses: Vec<Alternative> = match entry.get("alternatives").and_then(Value::as_array) {
        Some(list) if !list.is_empty() => list.iter().map(parse_alternative).collect(),
        _ => vec![parse_alternative(entry)],
    };

    let mut hypotheses = hypotheses.into_iter();
    let best = hypotheses.next().unwrap_or(Alternative {
        transcript: String::new(),
        confidence: 0.0,
    });
    RecognitionResult {
        transcript: best.transcript,
        confidence: best.confidence,
        alternatives: hypotheses.collect(),
        is_final,
    }
}

fn parse_alternative(value: &Value) -> Alternative {
    let transcript = value
        .get("transcript")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let confidence = value
        .get("confidence")
        .and_then(Value::as_f64)
        .filter(|c| c.is_finite())
        .map(|c| c.clamp(0.0, 1.0) as f32)
        .unwrap_or(0.0);
    Alternative {
        transcript,
        confidence,
    }
}
