//! Speech synthesis client
//!
//! Text goes to the provider, audio comes back as a [`SynthesisResult`]. Long
//! replies are split on sentence boundaries and synthesized piece by piece so
//! playback can start before the whole reply is ready.

use crate::audio::{AudioChunk, AudioEncoding, AudioFormat};
use crate::config::SynthesisConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::provider::{SynthesizeRequest, VoiceProvider};
use futures::future;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Voices the synthesis service offers
pub const VOICES: &[&str] = &[
    "alena",
    "filipp",
    "ermil",
    "jane",
    "omazh",
    "zahar",
    "dasha",
    "julia",
    "lera",
    "masha",
    "marina",
    "alexander",
    "kirill",
    "anton",
];

const SENTENCE_TERMINATORS: &[char] = &['.', '!', '?', '…'];

pub fn available_voices() -> &'static [&'static str] {
    VOICES
}

pub fn is_voice_supported(voice: &str) -> bool {
    VOICES.contains(&voice)
}

#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisResult {
    pub audio_data: Vec<u8>,
    pub format: AudioFormat,
    pub approximate_duration_seconds: f32,
}

impl SynthesisResult {
    /// Wrap provider audio; WAV payloads are recognised by their header
    pub fn from_audio(audio_data: Vec<u8>, format: AudioFormat) -> Self {
        let format = if audio_data.starts_with(b"RIFF") {
            AudioFormat {
                encoding: AudioEncoding::Wav,
                ..format
            }
        } else {
            format
        };
        let chunk = AudioChunk::new(audio_data, format);
        let approximate_duration_seconds = chunk.duration().as_secs_f32();
        Self {
            audio_data: chunk.data,
            format,
            approximate_duration_seconds,
        }
    }

    /// Zeroed LINEAR16 audio lasting roughly as long as `text` would take to say
    pub fn silence(text: &str, format: AudioFormat, seconds_per_char: f32) -> Self {
        let seconds = text.chars().count() as f32 * seconds_per_char.max(0.0);
        let samples = (format.sample_rate as f32 * seconds).floor() as usize;
        let channels = format.channels.max(1) as usize;
        Self {
            audio_data: vec![0u8; samples * channels * 2],
            format: AudioFormat::linear16(format.sample_rate, format.channels.max(1)),
            approximate_duration_seconds: seconds,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.audio_data.is_empty()
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f32(self.approximate_duration_seconds.max(0.0))
    }

    pub fn into_chunk(self) -> AudioChunk {
        AudioChunk::new(self.audio_data, self.format)
    }
}

/// One piece of a split reply and what synthesizing it produced
#[derive(Debug, Clone)]
pub struct SynthesisSegment {
    pub text: String,
    pub result: VoiceResult<SynthesisResult>,
}

pub struct SpeechSynthesizer {
    provider: Arc<dyn VoiceProvider>,
    config: SynthesisConfig,
}

impl SpeechSynthesizer {
    pub fn new(provider: Arc<dyn VoiceProvider>, config: SynthesisConfig) -> Self {
        Self { provider, config }
    }

    pub fn config(&self) -> &SynthesisConfig {
        &self.config
    }

    pub fn update_config(&mut self, config: SynthesisConfig) -> VoiceResult<()> {
        if !is_voice_supported(&config.voice) {
            return Err(VoiceError::UnsupportedVoice(config.voice));
        }
        self.config = config;
        Ok(())
    }

    /// Chunked synthesis is always available
    pub fn supports_streaming(&self) -> bool {
        true
    }

    pub async fn synthesize(
        &self,
        text: &str,
        config: Option<&SynthesisConfig>,
    ) -> VoiceResult<SynthesisResult> {
        let config = config.unwrap_or(&self.config);
        if !is_voice_supported(&config.voice) {
            return Err(VoiceError::UnsupportedVoice(config.voice.clone()));
        }
        synthesize_with(&self.provider, config, text).await
    }

    /// Synthesize `text` chunk by chunk, reporting each chunk's outcome
    pub fn synthesize_segments(
        &self,
        text: &str,
        config: Option<&SynthesisConfig>,
    ) -> BoxStream<'static, SynthesisSegment> {
        let config = config.unwrap_or(&self.config).clone();
        if !is_voice_supported(&config.voice) {
            let segment = SynthesisSegment {
                text: text.to_string(),
                result: Err(VoiceError::UnsupportedVoice(config.voice)),
            };
            return stream::once(future::ready(segment)).boxed();
        }

        let chunks = split_into_chunks(text, config.max_chunk_chars);
        debug!(chunks = chunks.len(), "Split reply for synthesis");
        let provider = self.provider.clone();
        stream::iter(chunks)
            .then(move |chunk| {
                let provider = provider.clone();
                let config = config.clone();
                async move {
                    let result = synthesize_with(&provider, &config, &chunk).await;
                    SynthesisSegment {
                        text: chunk,
                        result,
                    }
                }
            })
            .boxed()
    }

    /// Audio for each chunk in reading order. Ends after the first failure.
    pub fn synthesize_stream(
        &self,
        text: &str,
        config: Option<&SynthesisConfig>,
    ) -> BoxStream<'static, VoiceResult<SynthesisResult>> {
        let results = self.synthesize_segments(text, config).map(|segment| segment.result);
        stream::unfold((results, false), |(mut results, failed)| async move {
            if failed {
                return None;
            }
            let item = results.next().await?;
            let failed = item.is_err();
            Some((item, (results, failed)))
        })
        .boxed()
    }
}

async fn synthesize_with(
    provider: &Arc<dyn VoiceProvider>,
    config: &SynthesisConfig,
    text: &str,
) -> VoiceResult<SynthesisResult> {
    let format = config.format();
    if text.trim().is_empty() {
        return Ok(SynthesisResult::from_audio(Vec::new(), format));
    }

    info!(
        "🗣️ Synthesizing {} chars with voice {}",
        text.chars().count(),
        config.voice
    );
    let audio = provider
        .synthesize(SynthesizeRequest {
            text: text.to_string(),
            config: config.clone(),
        })
        .await
        .map_err(|e| match e {
            VoiceError::SynthesisService(_) => e,
            other => VoiceError::SynthesisService(other.to_string()),
        })?;
    Ok(SynthesisResult::from_audio(audio, format))
}

/// Split text into chunks of at most `max_chars` characters.
///
/// Sentences stay whole where they fit; a sentence longer than the limit is
/// broken at whitespace, and a single word longer than the limit is cut.
pub fn split_into_chunks(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();

    for sentence in sentences(text) {
        let pieces = if sentence.chars().count() > max_chars {
            split_long(&sentence, max_chars)
        } else {
            vec![sentence]
        };
        for piece in pieces {
            if current.is_empty() {
                current = piece;
            } else if current.chars().count() + 1 + piece.chars().count() <= max_chars {
                current.push(' ');
                current.push_str(&piece);
            } else {
                chunks.push(std::mem::replace(&mut current, piece));
            }
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Sentences with their terminal punctuation, trimmed
fn sentences(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut after_terminator = false;

    for c in text.chars() {
        if after_terminator && !SENTENCE_TERMINATORS.contains(&c) {
            if c.is_whitespace() {
                push_trimmed(&mut out, &mut current);
                after_terminator = false;
                continue;
            }
            after_terminator = false;
        }
        current.push(c);
        if SENTENCE_TERMINATORS.contains(&c) {
            after_terminator = true;
        }
    }
    push_trimmed(&mut out, &mut current);
    out
}

fn push_trimmed(out: &mut Vec<String>, current: &mut String) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        out.push(trimmed.to_string());
    }
    current.clear();
}

fn split_long(sentence: &str, max_chars: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    for word in sentence.split_whitespace() {
        let words: Vec<String> = if word.chars().count() > max_chars {
            let chars: Vec<char> = word.chars().collect();
            chars.chunks(max_chars).map(|c| c.iter().collect()).collect()
        } else {
            vec![word.to_string()]
        };
        for w in words {
            if current.is_empty() {
                current = w;
            } else if current.chars().count() + 1 + w.chars().count() <= max_chars {
                current.push(' ');
                current.push_str(&w);
            } else {
                pieces.push(std::mem::replace(&mut current, w));
            }
        }
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}
