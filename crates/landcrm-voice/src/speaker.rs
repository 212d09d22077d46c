//! rodio-backed speaker
//!
//! The rodio `OutputStream` must stay alive for anything to be heard and is not
//! `Send`, so it lives on its own thread. The worker only holds the stream
//! handle and a fresh `Sink` per buffer.

use crate::audio::PcmBuffer;
use crate::error::{VoiceError, VoiceResult};
use crate::microphone::{wait_until_open, DEVICE_OPEN_TIMEOUT};
use crate::playback::AudioOutput;
use rodio::buffer::SamplesBuffer;
use rodio::{OutputStream, OutputStreamHandle, Sink};
use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default system output device
pub struct RodioOutput {
    handle: OutputStreamHandle,
    sink: Option<Sink>,
    started: Option<Instant>,
    played: Duration,
    shutdown: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl RodioOutput {
    /// Open the default output device
    pub fn open() -> VoiceResult<Self> {
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<VoiceResult<OutputStreamHandle>>(1);
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("landcrm-speaker".to_string())
            .spawn(move || match OutputStream::try_default() {
                Ok((stream, handle)) => {
                    let _ = ready_tx.send(Ok(handle));
                    let _ = shutdown_rx.recv();
                    drop(stream);
                    debug!("Output stream closed");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(VoiceError::Playback(e.to_string())));
                }
            })?;

        let handle =
            wait_until_open(&ready_rx, "speaker", DEVICE_OPEN_TIMEOUT, VoiceError::Playback)?;
        info!("🔈 Speaker output opened");

        Ok(Self {
            handle,
            sink: None,
            started: None,
            played: Duration::ZERO,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }
}

impl AudioOutput for RodioOutput {
    fn play(&mut self, audio: PcmBuffer, volume: f32) -> VoiceResult<()> {
        self.stop();
        let sink = Sink::try_new(&self.handle).map_err(|e| VoiceError::Playback(e.to_string()))?;
        sink.set_volume(volume);
        if !audio.is_empty() {
            sink.append(SamplesBuffer::new(
                audio.channels.max(1),
                audio.sample_rate.max(1),
                audio.samples,
            ));
        }
        self.sink = Some(sink);
        self.started = Some(Instant::now());
        self.played = Duration::ZERO;
        Ok(())
    }

    fn pause(&mut self) {
        if let Some(sink) = &self.sink {
            sink.pause();
            if let Some(started) = self.started.take() {
                self.played += started.elapsed();
            }
        }
    }

    fn resume(&mut self) {
        if let Some(sink) = &self.sink {
            sink.play();
            if self.started.is_none() {
                self.started = Some(Instant::now());
            }
        }
    }

    fn stop(&mut self) {
        if let Some(sink) = self.sink.take() {
            sink.stop();
        }
        self.started = None;
        self.played = Duration::ZERO;
    }

    fn set_volume(&mut self, volume: f32) {
        if let Some(sink) = &self.sink {
            sink.set_volume(volume);
        }
    }

    fn is_finished(&self) -> bool {
        self.sink.as_ref().map(|s| s.empty()).unwrap_or(true)
    }

    fn position(&self) -> Duration {
        self.played + self.started.map(|s| s.elapsed()).unwrap_or_default()
    }
}

impl Drop for RodioOutput {
    fn drop(&mut self) {
        self.stop();
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Speaker thread panicked during shutdown");
            }
        }
    }
}
