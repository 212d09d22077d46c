//! Queued audio playback
//!
//! A single worker task owns the output device and a strict FIFO of pending
//! buffers. Only one buffer plays at a time; the next one starts when the
//! device reports the current one finished. Callers talk to the worker through
//! [`AudioPlayback`] and observe it through [`PlaybackEvent`]s.

use crate::audio::{decode, AudioChunk, PcmBuffer};
use crate::config::PlaybackConfig;
use crate::error::{VoiceError, VoiceResult};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// Output device seam
pub trait AudioOutput: Send {
    /// Start `audio` from the beginning, replacing whatever was loaded
    fn play(&mut self, audio: PcmBuffer, volume: f32) -> VoiceResult<()>;
    fn pause(&mut self);
    fn resume(&mut self);
    /// Unload the current buffer
    fn stop(&mut self);
    fn set_volume(&mut self, volume: f32);
    /// True once the loaded buffer played to its end, or nothing is loaded
    fn is_finished(&self) -> bool;
    fn position(&self) -> Duration;
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    Started { tag: u64 },
    /// Played to its end or cut short by `play_buffer`
    Ended { tag: u64 },
    /// The queue ran empty after the entry with `tag` ended
    Drained { tag: u64 },
    Paused,
    Resumed,
    Stopped,
    VolumeChanged(f32),
    Error { tag: u64, error: VoiceError },
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PlaybackState {
    pub is_playing: bool,
    pub is_paused: bool,
    pub position: Duration,
    pub duration: Duration,
    pub volume: f32,
    pub queued: usize,
}

/// Clamp into 0..=1; NaN counts as muted
pub fn clamp_volume(volume: f32) -> f32 {
    if volume.is_nan() {
        0.0
    } else {
        volume.clamp(0.0, 1.0)
    }
}

#[derive(Debug)]
struct Entry {
    audio: AudioChunk,
    tag: u64,
}

#[derive(Debug)]
enum Command {
    PlayNow(Entry),
    Enqueue(Entry),
    Pause,
    Resume,
    Stop,
    ClearQueue,
    SetVolume(f32),
    Shutdown,
}

pub struct AudioPlayback {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state: Arc<Mutex<PlaybackState>>,
    worker: Option<JoinHandle<()>>,
}

impl AudioPlayback {
    /// Start the playback worker on the current runtime
    pub fn spawn(
        output: Box<dyn AudioOutput>,
        config: PlaybackConfig,
    ) -> (Self, mpsc::UnboundedReceiver<PlaybackEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let volume = clamp_volume(config.volume);
        let state = Arc::new(Mutex::new(PlaybackState {
            volume,
            ..Default::default()
        }));

        let worker = Worker {
            output,
            queue: VecDeque::new(),
            current: None,
            paused: false,
            volume,
            state: state.clone(),
            event_tx,
        };
        let handle = tokio::spawn(worker.run(cmd_rx, config.poll_interval()));
        info!("🔊 Audio playback ready (volume {:.2})", volume);

        (
            Self {
                cmd_tx,
                state,
                worker: Some(handle),
            },
            event_rx,
        )
    }

    /// Play now, cutting off the current buffer. The queue is kept.
    pub fn play_buffer(&self, audio: AudioChunk) -> VoiceResult<()> {
        self.play_buffer_tagged(audio, 0)
    }

    pub fn play_buffer_tagged(&self, audio: AudioChunk, tag: u64) -> VoiceResult<()> {
        self.send(Command::PlayNow(Entry { audio, tag }))
    }

    /// Append to the queue; starts immediately when idle
    pub fn enqueue(&self, audio: AudioChunk) -> VoiceResult<()> {
        self.enqueue_tagged(audio, 0)
    }

    pub fn enqueue_tagged(&self, audio: AudioChunk, tag: u64) -> VoiceResult<()> {
        self.send(Command::Enqueue(Entry { audio, tag }))
    }

    pub fn pause(&self) -> VoiceResult<()> {
        self.send(Command::Pause)
    }

    pub fn resume(&self) -> VoiceResult<()> {
        self.send(Command::Resume)
    }

    /// Stop the current buffer and drop everything queued
    pub fn stop(&self) -> VoiceResult<()> {
        self.send(Command::Stop)
    }

    pub fn clear_queue(&self) -> VoiceResult<()> {
        self.send(Command::ClearQueue)
    }

    /// Returns the volume actually applied
    pub fn set_volume(&self, volume: f32) -> VoiceResult<f32> {
        let volume = clamp_volume(volume);
        lock(&self.state).volume = volume;
        self.send(Command::SetVolume(volume))?;
        Ok(volume)
    }

    pub fn volume(&self) -> f32 {
        lock(&self.state).volume
    }

    pub fn queue_len(&self) -> usize {
        lock(&self.state).queued
    }

    pub fn state(&self) -> PlaybackState {
        *lock(&self.state)
    }

    /// Stop playback, close the output device and wait for the worker
    pub async fn shutdown(&mut self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
        if let Some(handle) = self.worker.take() {
            if let Err(e) = handle.await {
                error!("Playback worker ended abnormally: {}", e);
            }
        }
    }

    fn send(&self, command: Command) -> VoiceResult<()> {
        self.cmd_tx
            .send(command)
            .map_err(|_| VoiceError::ChannelClosed("playback worker has shut down".to_string()))
    }
}

impl Drop for AudioPlayback {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
    }
}

fn lock(state: &Mutex<PlaybackState>) -> std::sync::MutexGuard<'_, PlaybackState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Current {
    tag: u64,
    duration: Duration,
}

struct Worker {
    output: Box<dyn AudioOutput>,
    queue: VecDeque<Entry>,
    current: Option<Current>,
    paused: bool,
    volume: f32,
    state: Arc<Mutex<PlaybackState>>,
    event_tx: mpsc::UnboundedSender<PlaybackEvent>,
}

impl Worker {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>, poll: Duration) {
        let mut ticker = tokio::time::interval(poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = cmd_rx.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle(command),
                },
                _ = ticker.tick(), if self.current.is_some() && !self.paused => {
                    self.check_finished();
                }
            }
            self.publish();
        }

        self.output.stop();
        self.queue.clear();
        self.current = None;
        self.publish();
        debug!("Playback worker stopped, output closed");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::PlayNow(entry) => {
                if let Some(preempted) = self.current.take() {
                    debug!(tag = preempted.tag, "Preempting current buffer");
                    self.output.stop();
                    self.emit(PlaybackEvent::Ended { tag: preempted.tag });
                }
                self.paused = false;
                self.start(entry);
            }
            Command::Enqueue(entry) => {
                self.queue.push_back(entry);
                if self.current.is_none() {
                    self.start_next();
                }
            }
            Command::Pause => {
                if self.current.is_some() && !self.paused {
                    self.output.pause();
                    self.paused = true;
                    self.emit(PlaybackEvent::Paused);
                }
            }
            Command::Resume => {
                if self.current.is_some() && self.paused {
                    self.output.resume();
                    self.paused = false;
                    self.emit(PlaybackEvent::Resumed);
                }
            }
            Command::Stop => {
                if self.current.is_some() || !self.queue.is_empty() {
                    self.output.stop();
                    self.current = None;
                    self.queue.clear();
                    self.paused = false;
                    info!("⏹️ Playback stopped");
                    self.emit(PlaybackEvent::Stopped);
                }
            }
            Command::ClearQueue => self.queue.clear(),
            Command::SetVolume(volume) => {
                self.volume = volume;
                self.output.set_volume(volume);
                self.emit(PlaybackEvent::VolumeChanged(volume));
            }
            Command::Shutdown => {}
        }
    }

    fn start_next(&mut self) {
        if let Some(entry) = self.queue.pop_front() {
            self.start(entry);
        }
    }

    fn start(&mut self, entry: Entry) {
        let tag = entry.tag;
        let started = decode(&entry.audio).and_then(|pcm| {
            let duration = pcm.duration();
            self.output.play(pcm, self.volume).map(|_| duration)
        });
        match started {
            Ok(duration) => {
                debug!(tag, ?duration, "Playing buffer");
                self.current = Some(Current { tag, duration });
                self.emit(PlaybackEvent::Started { tag });
            }
            Err(e) => {
                error!("Playback failed: {}", e);
                self.queue.clear();
                self.current = None;
                let error = match e {
                    VoiceError::Playback(_) | VoiceError::Decode(_) => e,
                    other => VoiceError::Playback(other.to_string()),
                };
                self.emit(PlaybackEvent::Error { tag, error });
            }
        }
    }

    fn check_finished(&mut self) {
        if !self.output.is_finished() {
            return;
        }
        let Some(finished) = self.current.take() else {
            return;
        };
        self.emit(PlaybackEvent::Ended { tag: finished.tag });
        self.start_next();
        if self.current.is_none() && self.queue.is_empty() {
            self.emit(PlaybackEvent::Drained { tag: finished.tag });
        }
    }

    fn publish(&self) {
        let mut state = lock(&self.state);
        *state = PlaybackState {
            is_playing: self.current.is_some() && !self.paused,
            is_paused: self.current.is_some() && self.paused,
            position: if self.current.is_some() {
                self.output.position()
            } else {
                Duration::ZERO
            },
            duration: self
                .current
                .as_ref()
                .map(|c| c.duration)
                .unwrap_or(Duration::ZERO),
            volume: self.volume,
            queued: self.queue.len(),
        };
    }

    fn emit(&self, event: PlaybackEvent) {
        if self.event_tx.send(event).is_err() {
            debug!("Playback event receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioFormat;
    use tokio::time::Instant;

    /// Plays for the buffer's duration in tokio time and records what it was given
    struct Recorder {
        started: Option<Instant>,
        length: Duration,
        paused_at: Option<Instant>,
        log: Arc<Mutex<Vec<f32>>>,
    }

    impl AudioOutput for Recorder {
        fn play(&mut self, audio: PcmBuffer, _volume: f32) -> VoiceResult<()> {
            if audio.samples.first() == Some(&-1.0) {
                return Err(VoiceError::Playback("device busy".into()));
            }
            self.log.lock().unwrap().push(audio.samples[0]);
            self.started = Some(Instant::now());
            self.length = audio.duration();
            self.paused_at = None;
            Ok(())
        }

        fn pause(&mut self) {
            self.paused_at = Some(Instant::now());
        }

        fn resume(&mut self) {
            if let (Some(paused), Some(started)) = (self.paused_at.take(), self.started) {
                self.started = Some(started + paused.elapsed());
            }
        }

        fn stop(&mut self) {
            self.started = None;
        }

        fn set_volume(&mut self, _volume: f32) {}

        fn is_finished(&self) -> bool {
            match self.started {
                Some(started) => self.paused_at.is_none() && started.elapsed() >= self.length,
                None => true,
            }
        }

        fn position(&self) -> Duration {
            self.started.map(|s| s.elapsed()).unwrap_or_default()
        }
    }

    fn recorder() -> (Box<Recorder>, Arc<Mutex<Vec<f32>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        (
            Box::new(Recorder {
                started: None,
                length: Duration::ZERO,
                paused_at: None,
                log: log.clone(),
            }),
            log,
        )
    }

    /// `ms` of LINEAR16 at 1 kHz whose first sample identifies it
    fn buffer(id: f32, ms: usize) -> AudioChunk {
        let mut samples = vec![0.0f32; ms];
        samples[0] = id;
        let data = samples
            .iter()
            .flat_map(|s| crate::audio::quantize(*s).to_le_bytes())
            .collect();
        AudioChunk::new(data, AudioFormat::linear16(1000, 1))
    }

    fn id(sample: f32) -> i32 {
        (sample * 100.0).round() as i32
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<PlaybackEvent>) -> Vec<PlaybackEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn queue_plays_in_fifo_order() {
        let (output, log) = recorder();
        let (playback, mut rx) = AudioPlayback::spawn(output, PlaybackConfig::default());
        playback.enqueue_tagged(buffer(0.1, 300), 7).unwrap();
        playback.enqueue_tagged(buffer(0.2, 50), 7).unwrap();
        playback.enqueue_tagged(buffer(0.3, 200), 7).unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        let order: Vec<i32> = log.lock().unwrap().iter().map(|s| id(*s)).collect();
        assert_eq!(order, vec![10, 20, 30]);

        let events = drain(&mut rx);
        let drained = events
            .iter()
            .filter(|e| matches!(e, PlaybackEvent::Drained { tag: 7 }))
            .count();
        assert_eq!(drained, 1);
        assert_eq!(events.last(), Some(&PlaybackEvent::Drained { tag: 7 }));
        assert!(!playback.state().is_playing);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_clears_queue_and_is_a_noop_when_idle() {
        let (output, log) = recorder();
        let (playback, mut rx) = AudioPlayback::spawn(output, PlaybackConfig::default());
        playback.enqueue(buffer(0.1, 500)).unwrap();
        playback.enqueue(buffer(0.2, 500)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(playback.queue_len(), 1);

        playback.stop().unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(log.lock().unwrap().len(), 1);
        assert_eq!(playback.queue_len(), 0);

        playback.stop().unwrap();
        playback.pause().unwrap();
        playback.resume().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stops = drain(&mut rx)
            .into_iter()
            .filter(|e| *e == PlaybackEvent::Stopped)
            .count();
        assert_eq!(stops, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_holds_position_until_resume() {
        let (output, _log) = recorder();
        let (playback, mut rx) = AudioPlayback::spawn(output, PlaybackConfig::default());
        playback.enqueue_tagged(buffer(0.1, 400), 3).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        playback.pause().unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(playback.state().is_paused);

        playback.resume().unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        let events = drain(&mut rx);
        assert!(events.contains(&PlaybackEvent::Paused));
        assert!(events.contains(&PlaybackEvent::Resumed));
        assert!(events.contains(&PlaybackEvent::Ended { tag: 3 }));
    }

    #[tokio::test(start_paused = true)]
    async fn play_buffer_preempts_current() {
        let (output, log) = recorder();
        let (playback, mut rx) = AudioPlayback::spawn(output, PlaybackConfig::default());
        playback.enqueue_tagged(buffer(0.1, 1000), 1).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        playback.play_buffer_tagged(buffer(0.5, 100), 2).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let order: Vec<i32> = log.lock().unwrap().iter().map(|s| id(*s)).collect();
        assert_eq!(order, vec![10, 50]);
        assert!(!playback.state().is_playing);

        let ended: Vec<u64> = drain(&mut rx)
            .into_iter()
            .filter_map(|event| match event {
                PlaybackEvent::Ended { tag } => Some(tag),
                _ => None,
            })
            .collect();
        // the cut-short buffer still gets its terminal event, before the new one ends
        assert_eq!(ended, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn volume_is_clamped() {
        let (output, _log) = recorder();
        let (playback, _rx) = AudioPlayback::spawn(output, PlaybackConfig::default());
        assert_eq!(playback.volume(), 0.8);
        assert_eq!(playback.set_volume(1.7).unwrap(), 1.0);
        assert_eq!(playback.set_volume(-0.2).unwrap(), 0.0);
        assert_eq!(playback.set_volume(f32::NAN).unwrap(), 0.0);
        assert_eq!(playback.set_volume(0.35).unwrap(), 0.35);
        assert_eq!(playback.volume(), 0.35);
    }

    #[tokio::test(start_paused = true)]
    async fn device_error_reports_and_clears_queue() {
        let (output, log) = recorder();
        let (playback, mut rx) = AudioPlayback::spawn(output, PlaybackConfig::default());
        playback.enqueue_tagged(buffer(-1.0, 100), 4).unwrap();
        playback.enqueue_tagged(buffer(0.2, 100), 4).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let events = drain(&mut rx);
        assert!(matches!(
            events.first(),
            Some(PlaybackEvent::Error { tag: 4, error: VoiceError::Playback(_) })
        ));
        // the second entry arrived after the failure and plays normally
        let order: Vec<i32> = log.lock().unwrap().iter().map(|s| id(*s)).collect();
        assert_eq!(order, vec![20]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_the_worker() {
        let (output, _log) = recorder();
        let (mut playback, _rx) = AudioPlayback::spawn(output, PlaybackConfig::default());
        playback.shutdown().await;
        assert!(matches!(
            playback.enqueue(buffer(0.1, 10)),
            Err(VoiceError::ChannelClosed(_))
        ));
    }
}
