//! cpal-backed microphone
//!
//! cpal streams are not `Send`, so each opened stream is owned by a dedicated
//! thread that parks until the Rust-side handle is dropped. Samples cross over
//! on an unbounded channel and are drained by [`InputStream::read`].

use crate::audio::AudioFormat;
use crate::capture::{InputDevice, InputStream};
use crate::config::CaptureConfig;
use crate::error::{VoiceError, VoiceResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};
use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, info, warn};

type SampleMessage = Result<Vec<f32>, String>;

/// How long `open` waits for a device thread before giving up on it
pub(crate) const DEVICE_OPEN_TIMEOUT: Duration = Duration::from_secs(3);

/// Wait for a device thread to report its stream. A thread that neither
/// succeeds nor fails in time is abandoned; it releases whatever it opened
/// once it notices nobody is listening.
pub(crate) fn wait_until_open<T>(
    ready_rx: &std_mpsc::Receiver<VoiceResult<T>>,
    what: &str,
    timeout: Duration,
    failure: fn(String) -> VoiceError,
) -> VoiceResult<T> {
    match ready_rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(std_mpsc::RecvTimeoutError::Timeout) => {
            warn!("⏱️ {} did not open within {:?}", what, timeout);
            Err(failure(format!("{} did not open within {:?}", what, timeout)))
        }
        Err(std_mpsc::RecvTimeoutError::Disconnected) => Err(failure(format!(
            "{} thread exited before the stream opened",
            what
        ))),
    }
}

/// Default (or named) system input device
#[derive(Debug, Clone, Default)]
pub struct CpalMicrophone {
    device_name: Option<String>,
}

impl CpalMicrophone {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use the input device whose name matches exactly
    pub fn with_device(name: impl Into<String>) -> Self {
        Self {
            device_name: Some(name.into()),
        }
    }

    /// List available input devices
    pub fn list_input_devices() -> VoiceResult<Vec<String>> {
        let host = cpal::default_host();
        let mut names = Vec::new();
        for device in host.input_devices()? {
            if let Ok(name) = device.name() {
                names.push(name);
            }
        }
        Ok(names)
    }
}

impl InputDevice for CpalMicrophone {
    fn open(&self, config: &CaptureConfig) -> VoiceResult<Box<dyn InputStream>> {
        if config.echo_cancellation || config.noise_suppression || config.auto_gain_control {
            debug!(
                echo_cancellation = config.echo_cancellation,
                noise_suppression = config.noise_suppression,
                auto_gain_control = config.auto_gain_control,
                "cpal has no DSP switches; leaving processing to the host audio stack"
            );
        }

        let (sample_tx, sample_rx) = mpsc::unbounded_channel::<SampleMessage>();
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<VoiceResult<AudioFormat>>(1);
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();
        let device_name = self.device_name.clone();
        let requested = config.clone();

        let thread = std::thread::Builder::new()
            .name("landcrm-mic".to_string())
            .spawn(move || match build_stream(device_name.as_deref(), &requested, sample_tx) {
                Ok((stream, format)) => {
                    let _ = ready_tx.send(Ok(format));
                    // parked until the handle is dropped
                    let _ = shutdown_rx.recv();
                    drop(stream);
                    debug!("Microphone stream released");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })?;

        let format = wait_until_open(
            &ready_rx,
            "microphone",
            DEVICE_OPEN_TIMEOUT,
            VoiceError::DeviceAccess,
        )?;

        Ok(Box::new(CpalStream {
            format,
            samples: sample_rx,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        }))
    }
}

struct CpalStream {
    format: AudioFormat,
    samples: mpsc::UnboundedReceiver<SampleMessage>,
    shutdown: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl InputStream for CpalStream {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn read(&mut self) -> VoiceResult<Vec<f32>> {
        let mut out = Vec::new();
        loop {
            match self.samples.try_recv() {
                Ok(Ok(data)) => out.extend_from_slice(&data),
                Ok(Err(message)) => return Err(VoiceError::DeviceLost(message)),
                Err(TryRecvError::Empty) => return Ok(out),
                Err(TryRecvError::Disconnected) => {
                    return Err(VoiceError::DeviceLost("input stream closed".to_string()))
                }
            }
        }
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Microphone thread panicked during shutdown");
            }
        }
    }
}

fn build_stream(
    device_name: Option<&str>,
    requested: &CaptureConfig,
    tx: mpsc::UnboundedSender<SampleMessage>,
) -> VoiceResult<(Stream, AudioFormat)> {
    let host = cpal::default_host();
    let device = match device_name {
        Some(name) => host
            .input_devices()?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| VoiceError::DeviceAccess(format!("input device '{}' not found", name)))?,
        None => host
            .default_input_device()
            .ok_or_else(|| VoiceError::DeviceAccess("No input device available".to_string()))?,
    };
    info!(
        "📱 Using input device: {}",
        device.name().unwrap_or_else(|_| "Unknown".to_string())
    );

    let supported = device
        .supported_input_configs()
        .map_err(|e| VoiceError::DeviceAccess(e.to_string()))?
        .find(|range| {
            range.channels() == requested.channels
                && range.min_sample_rate().0 <= requested.sample_rate
                && range.max_sample_rate().0 >= requested.sample_rate
        })
        .map(|range| range.with_sample_rate(cpal::SampleRate(requested.sample_rate)));

    let chosen = match supported {
        Some(config) => config,
        None => {
            let fallback = device.default_input_config()?;
            warn!(
                "Requested {}Hz/{}ch not supported, using device default {}Hz/{}ch",
                requested.sample_rate,
                requested.channels,
                fallback.sample_rate().0,
                fallback.channels()
            );
            fallback
        }
    };

    let stream_config: StreamConfig = chosen.config();
    let format = AudioFormat::float32(stream_config.sample_rate.0, stream_config.channels);
    let err_tx = tx.clone();
    let on_error = move |err: cpal::StreamError| {
        warn!("Audio input stream error: {}", err);
        let _ = err_tx.send(Err(err.to_string()));
    };

    let stream = match chosen.sample_format() {
        SampleFormat::F32 => device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let _ = tx.send(Ok(data.to_vec()));
            },
            on_error,
            None,
        )?,
        SampleFormat::I16 => device.build_input_stream(
            &stream_config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let _ = tx.send(Ok(data.iter().map(|&s| s as f32 / 32768.0).collect()));
            },
            on_error,
            None,
        )?,
        SampleFormat::U16 => device.build_input_stream(
            &stream_config,
            move |data: &[u16], _: &cpal::InputCallbackInfo| {
                let _ = tx.send(Ok(data
                    .iter()
                    .map(|&s| (s as f32 - 32768.0) / 32768.0)
                    .collect()));
            },
            on_error,
            None,
        )?,
        other => {
            return Err(VoiceError::DeviceAccess(format!(
                "unsupported sample format {:?}",
                other
            )))
        }
    };

    stream.play()?;
    Ok((stream, format))
}
