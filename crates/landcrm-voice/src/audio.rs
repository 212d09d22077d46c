//! Audio containers and PCM conversion
//!
//! Everything that crosses a component boundary as audio is an [`AudioChunk`]:
//! raw bytes plus the format needed to interpret them. [`PcmBuffer`] is the
//! decoded, float form used by the meter, the resampler and the speaker.

use crate::error::{VoiceError, VoiceResult};
use rubato::{InterpolationParameters, InterpolationType, Resampler, SincFixedIn, WindowFunction};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::time::Duration;
use tracing::{debug, warn};

/// Sample encoding of an [`AudioChunk`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AudioEncoding {
    /// Signed 16-bit little-endian PCM
    Linear16,
    /// 32-bit little-endian float PCM
    Float32,
    /// RIFF/WAVE container
    Wav,
}

impl AudioEncoding {
    /// Name used on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioEncoding::Linear16 => "LINEAR16",
            AudioEncoding::Float32 => "FLOAT32",
            AudioEncoding::Wav => "WAV",
        }
    }
}

/// Encoding, rate and channel layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub encoding: AudioEncoding,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    pub fn linear16(sample_rate: u32, channels: u16) -> Self {
        Self {
            encoding: AudioEncoding::Linear16,
            sample_rate,
            channels,
        }
    }

    pub fn float32(sample_rate: u32, channels: u16) -> Self {
        Self {
            encoding: AudioEncoding::Float32,
            sample_rate,
            channels,
        }
    }

    fn bytes_per_frame(&self) -> Option<usize> {
        let width = match self.encoding {
            AudioEncoding::Linear16 => 2,
            AudioEncoding::Float32 => 4,
            AudioEncoding::Wav => return None,
        };
        Some(width * self.channels.max(1) as usize)
    }
}

/// Raw audio bytes with their format. Consumed once by whoever receives it.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub data: Vec<u8>,
    pub format: AudioFormat,
}

impl AudioChunk {
    pub fn new(data: Vec<u8>, format: AudioFormat) -> Self {
        Self { data, format }
    }

    /// Pack interleaved float samples without loss
    pub fn from_f32(samples: &[f32], sample_rate: u32, channels: u16) -> Self {
        let mut data = Vec::with_capacity(samples.len() * 4);
        for sample in samples {
            data.extend_from_slice(&sample.to_le_bytes());
        }
        Self {
            data,
            format: AudioFormat::float32(sample_rate, channels),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Playing time of the chunk. WAV durations come from the header; unreadable headers count as zero.
    pub fn duration(&self) -> Duration {
        match self.format.bytes_per_frame() {
            Some(frame) if self.format.sample_rate > 0 => {
                let frames = self.data.len() / frame;
                Duration::from_secs_f64(frames as f64 / self.format.sample_rate as f64)
            }
            Some(_) => Duration::ZERO,
            None => match hound::WavReader::new(Cursor::new(&self.data)) {
                Ok(reader) => {
                    let rate = reader.spec().sample_rate.max(1);
                    Duration::from_secs_f64(reader.duration() as f64 / rate as f64)
                }
                Err(_) => Duration::ZERO,
            },
        }
    }
}

/// Decoded interleaved float samples in -1.0..=1.0
#[derive(Debug, Clone, PartialEq)]
pub struct PcmBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl PcmBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
        }
    }

    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frames() as f64 / self.sample_rate as f64)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Average all channels into one
    pub fn mono(&self) -> Vec<f32> {
        downmix(&self.samples, self.channels)
    }
}

/// Average interleaved frames into mono samples
pub fn downmix(samples: &[f32], channels: u16) -> Vec<f32> {
    let channels = channels.max(1) as usize;
    if channels == 1 {
        return samples.to_vec();
    }
    samples
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Decode any supported chunk into float samples
pub fn decode(chunk: &AudioChunk) -> VoiceResult<PcmBuffer> {
    let format = chunk.format;
    match format.encoding {
        AudioEncoding::Linear16 => {
            if chunk.data.len() % 2 != 0 {
                return Err(VoiceError::Decode(format!(
                    "LINEAR16 payload has odd length {}",
                    chunk.data.len()
                )));
            }
            let samples = chunk
                .data
                .chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
                .collect();
            Ok(PcmBuffer::new(samples, format.sample_rate, format.channels))
        }
        AudioEncoding::Float32 => {
            if chunk.data.len() % 4 != 0 {
                return Err(VoiceError::Decode(format!(
                    "FLOAT32 payload length {} is not a multiple of 4",
                    chunk.data.len()
                )));
            }
            let samples = chunk
                .data
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            Ok(PcmBuffer::new(samples, format.sample_rate, format.channels))
        }
        AudioEncoding::Wav => decode_wav(&chunk.data),
    }
}

fn decode_wav(bytes: &[u8]) -> VoiceResult<PcmBuffer> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes))?;
    let spec = reader.spec();
    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()?
        }
    };
    Ok(PcmBuffer::new(samples, spec.sample_rate, spec.channels))
}

/// Decode, mix, resample and quantize a chunk into signed 16-bit little-endian PCM.
///
/// Synchronous: callers finish the conversion before any network submission.
pub fn to_linear16(chunk: &AudioChunk, sample_rate: u32, channels: u16) -> VoiceResult<Vec<u8>> {
    if sample_rate == 0 || channels == 0 {
        return Err(VoiceError::Decode(
            "target sample rate and channels must be non-zero".to_string(),
        ));
    }
    let pcm = decode(chunk)?;
    let mono = pcm.mono();
    let resampled = resample(&mono, pcm.sample_rate, sample_rate);

    let mut out = Vec::with_capacity(resampled.len() * 2 * channels as usize);
    for sample in resampled {
        let bytes = quantize(sample).to_le_bytes();
        for _ in 0..channels {
            out.extend_from_slice(&bytes);
        }
    }
    Ok(out)
}

/// Clamp to -1..=1 and scale asymmetrically onto the i16 range
pub fn quantize(sample: f32) -> i16 {
    let s = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

/// Resample mono audio. Uses a windowed-sinc resampler and falls back to linear interpolation.
pub fn resample(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if input.is_empty() || from_rate == 0 || to_rate == 0 || from_rate == to_rate {
        return input.to_vec();
    }
    match resample_sinc(input, from_rate, to_rate) {
        Ok(output) => output,
        Err(err) => {
            warn!("Sinc resampler failed ({}), using linear interpolation", err);
            resample_linear(input, to_rate as f64 / from_rate as f64)
        }
    }
}

fn resample_sinc(input: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>, String> {
    let ratio = to_rate as f64 / from_rate as f64;
    let chunk = 256usize;
    let params = InterpolationParameters {
        sinc_len: 64,
        f_cutoff: 0.90,
        interpolation: InterpolationType::Cubic,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, chunk, 1)
        .map_err(|e| format!("failed to construct sinc resampler: {e:?}"))?;

    let expected = ((input.len() as f64) * ratio).round() as usize;
    let mut out = Vec::with_capacity(expected + chunk);
    let mut segment = vec![0.0f32; chunk];
    let mut idx = 0usize;
    while idx < input.len() {
        let end = (idx + chunk).min(input.len());
        let len = end - idx;
        segment.fill(input[end - 1]);
        segment[..len].copy_from_slice(&input[idx..end]);
        let produced = resampler
            .process(std::slice::from_ref(&segment), None)
            .map_err(|e| format!("resampler process failed: {e:?}"))?;
        out.extend_from_slice(&produced[0]);
        idx = end;
    }

    let last = out.last().copied().unwrap_or(0.0);
    out.resize(expected, last);
    debug!(from_rate, to_rate, frames = out.len(), "Resampled audio");
    Ok(out)
}

/// Linear interpolation resampler. Cheap, adequate for short speech snippets.
pub fn resample_linear(input: &[f32], ratio: f64) -> Vec<f32> {
    if input.is_empty() || ratio <= 0.0 {
        return Vec::new();
    }
    let output_len = (input.len() as f64 * ratio).round() as usize;
    let mut output = Vec::with_capacity(output_len);
    for i in 0..output_len {
        let src = i as f64 / ratio;
        let idx = src.floor() as usize;
        let frac = (src - idx as f64) as f32;
        if idx + 1 < input.len() {
            output.push(input[idx] * (1.0 - frac) + input[idx + 1] * frac);
        } else {
            output.push(input[input.len() - 1]);
        }
    }
    output
}
