//! Microphone capture sessions with voice activity detection
//!
//! [`AudioCapture`] owns the input device for the lifetime of one recording
//! session. A session is a tokio task that polls the device stream on the VAD
//! interval, feeds the volume meter and the detector, and emits
//! [`CaptureEvent`]s tagged with the session id. The device stream lives inside
//! the task, so every exit path (stop, device loss, dropped handle) releases it.

use crate::audio::{downmix, AudioChunk, AudioFormat};
use crate::config::{CaptureConfig, VadConfig};
use crate::error::{VoiceError, VoiceResult};
use crate::meter::SpectrumMeter;
use crate::vad::{VadEvent, VoiceActivityDetector};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Source of microphone streams
pub trait InputDevice: Send + Sync {
    /// Acquire the device. Dropping the returned stream releases it.
    fn open(&self, config: &CaptureConfig) -> VoiceResult<Box<dyn InputStream>>;
}

/// An open microphone stream
pub trait InputStream: Send {
    /// Actual format delivered by the device, which may differ from the request
    fn format(&self) -> AudioFormat;

    /// Interleaved samples captured since the previous read. Never blocks.
    fn read(&mut self) -> VoiceResult<Vec<f32>>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEventKind {
    DataAvailable(AudioChunk),
    SpeechStart,
    SpeechEnd { duration: Duration },
    Error(VoiceError),
}

#[derive(Debug, Clone)]
pub struct CaptureEvent {
    pub session: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: CaptureEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecordingStatus {
    pub is_recording: bool,
    pub has_speech: bool,
    pub speech_duration: Duration,
}

#[derive(Debug)]
struct Shared {
    status: RecordingStatus,
    vad: VadConfig,
    vad_changed: bool,
}

struct ActiveSession {
    id: u64,
    stop_tx: oneshot::Sender<()>,
    handle: JoinHandle<Option<AudioChunk>>,
}

/// Recording session manager
pub struct AudioCapture {
    device: Arc<dyn InputDevice>,
    config: CaptureConfig,
    shared: Arc<Mutex<Shared>>,
    event_tx: mpsc::UnboundedSender<CaptureEvent>,
    next_session: u64,
    active: Option<ActiveSession>,
}

impl AudioCapture {
    pub fn new(
        device: Arc<dyn InputDevice>,
        config: CaptureConfig,
        vad: VadConfig,
    ) -> (Self, mpsc::UnboundedReceiver<CaptureEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Mutex::new(Shared {
            status: RecordingStatus::default(),
            vad,
            vad_changed: false,
        }));
        let capture = Self {
            device,
            config,
            shared,
            event_tx,
            next_session: 0,
            active: None,
        };
        (capture, event_rx)
    }

    /// Open the device and start a new session. Returns the session id.
    pub fn start_recording(&mut self) -> VoiceResult<u64> {
        if let Some(active) = &self.active {
            if !active.handle.is_finished() {
                return Err(VoiceError::AlreadyRecording);
            }
        }
        // a previous session that died on its own has already released the device
        self.active = None;

        let stream = self.device.open(&self.config).map_err(|e| match e {
            VoiceError::DeviceAccess(_) => e,
            other => VoiceError::DeviceAccess(other.to_string()),
        })?;
        let format = stream.format();

        self.next_session += 1;
        let id = self.next_session;
        info!(
            "🎤 Recording session {} started ({}Hz, {} channels)",
            id, format.sample_rate, format.channels
        );

        let vad_config = {
            let mut shared = lock(&self.shared);
            shared.vad_changed = false;
            shared.status = RecordingStatus {
                is_recording: true,
                ..Default::default()
            };
            shared.vad.clone()
        };

        let session = Session {
            id,
            stream,
            format,
            config: self.config.clone(),
            meter: SpectrumMeter::new(self.config.fft_size, self.config.smoothing),
            vad: VoiceActivityDetector::new(vad_config),
            shared: self.shared.clone(),
            event_tx: self.event_tx.clone(),
            pending: Vec::new(),
            recording: Vec::new(),
            utterance_complete: false,
            last_flush: Instant::now(),
        };
        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(session.run(stop_rx));
        self.active = Some(ActiveSession {
            id,
            stop_tx,
            handle,
        });
        Ok(id)
    }

    /// Stop the current session, release the device and return what was recorded.
    /// Idempotent: returns `None` when nothing is recording.
    pub async fn stop_recording(&mut self) -> Option<AudioChunk> {
        let active = self.active.take()?;
        let _ = active.stop_tx.send(());
        match active.handle.await {
            Ok(recording) => {
                debug!("Recording session {} stopped", active.id);
                recording
            }
            Err(e) => {
                warn!("Recording session {} ended abnormally: {}", active.id, e);
                lock(&self.shared).status = RecordingStatus::default();
                None
            }
        }
    }

    pub fn is_recording(&self) -> bool {
        self.active
            .as_ref()
            .map(|a| !a.handle.is_finished())
            .unwrap_or(false)
    }

    /// Id of the running session, if any
    pub fn current_session(&self) -> Option<u64> {
        self.active
            .as_ref()
            .filter(|a| !a.handle.is_finished())
            .map(|a| a.id)
    }

    pub fn status(&self) -> RecordingStatus {
        lock(&self.shared).status
    }

    pub fn vad_config(&self) -> VadConfig {
        lock(&self.shared).vad.clone()
    }

    /// Replace VAD thresholds; a running session picks them up on its next tick,
    /// including a new poll interval
    pub fn update_vad_config(&self, config: VadConfig) {
        let mut shared = lock(&self.shared);
        shared.vad = config;
        shared.vad_changed = true;
    }
}

fn poll_ticker(period: Duration, start: Instant) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval_at(start, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

fn lock(shared: &Mutex<Shared>) -> std::sync::MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Session {
    id: u64,
    stream: Box<dyn InputStream>,
    format: AudioFormat,
    config: CaptureConfig,
    meter: SpectrumMeter,
    vad: VoiceActivityDetector,
    shared: Arc<Mutex<Shared>>,
    event_tx: mpsc::UnboundedSender<CaptureEvent>,
    /// Samples not yet emitted as `DataAvailable`
    pending: Vec<f32>,
    /// Samples kept for the final recording
    recording: Vec<f32>,
    utterance_complete: bool,
    last_flush: Instant,
}

impl Session {
    async fn run(mut self, mut stop_rx: oneshot::Receiver<()>) -> Option<AudioChunk> {
        let mut ticker = poll_ticker(self.vad.config().poll_interval(), Instant::now());
        self.last_flush = Instant::now();

        loop {
            tokio::select! {
                _ = &mut stop_rx => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick() {
                        error!("Recording session {} lost its device: {}", self.id, e);
                        let err = match e {
                            VoiceError::DeviceLost(_) => e,
                            other => VoiceError::DeviceLost(other.to_string()),
                        };
                        self.emit(CaptureEventKind::Error(err));
                        self.set_idle();
                        return None;
                    }
                    let period = self.vad.config().poll_interval();
                    if ticker.period() != period {
                        debug!(?period, "Recording session {} changes its poll interval", self.id);
                        ticker = poll_ticker(period, Instant::now() + period);
                    }
                }
            }
        }

        // drain whatever arrived since the last tick, then release the device
        if let Ok(tail) = self.stream.read() {
            self.pending.extend_from_slice(&tail);
            self.recording.extend_from_slice(&tail);
        }
        self.flush();
        self.set_idle();

        if self.recording.is_empty() {
            return None;
        }
        Some(AudioChunk::from_f32(
            &self.recording,
            self.format.sample_rate,
            self.format.channels,
        ))
    }

    fn tick(&mut self) -> VoiceResult<()> {
        self.apply_vad_update();

        let samples = self.stream.read()?;
        let now = Instant::now();
        self.meter.push(&downmix(&samples, self.format.channels));
        self.pending.extend_from_slice(&samples);
        self.recording.extend_from_slice(&samples);

        let volume = self.meter.volume();
        match self.vad.observe(volume, now) {
            Some(VadEvent::SpeechStart) => {
                self.emit(CaptureEventKind::SpeechStart);
            }
            Some(VadEvent::SpeechEnd { duration, forced }) => {
                info!(
                    "🔇 Speech ended after {:?}{}",
                    duration,
                    if forced { " (max duration)" } else { "" }
                );
                self.utterance_complete = true;
                self.emit(CaptureEventKind::SpeechEnd { duration });
            }
            Some(VadEvent::Discarded { duration }) => {
                debug!(?duration, "Discarding short noise segment");
                self.recording.clear();
            }
            None => {}
        }

        if !self.vad.in_speech() && !self.utterance_complete {
            self.trim_to_pre_roll();
        }

        if now.saturating_duration_since(self.last_flush) >= self.config.chunk_interval() {
            self.flush();
            self.last_flush = now;
        }

        let status = self.vad.status(now);
        let mut shared = lock(&self.shared);
        shared.status = RecordingStatus {
            is_recording: true,
            has_speech: status.has_speech,
            speech_duration: status.speech_duration,
        };
        Ok(())
    }

    fn apply_vad_update(&mut self) {
        let mut shared = lock(&self.shared);
        if shared.vad_changed {
            shared.vad_changed = false;
            self.vad.update_config(shared.vad.clone());
        }
    }

    fn trim_to_pre_roll(&mut self) {
        let frames = (self.config.pre_roll().as_secs_f64() * self.format.sample_rate as f64) as usize;
        let keep = frames * self.format.channels.max(1) as usize;
        if self.recording.len() > keep {
            let excess = self.recording.len() - keep;
            self.recording.drain(..excess);
        }
    }

    fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let chunk = AudioChunk::from_f32(
            &self.pending,
            self.format.sample_rate,
            self.format.channels,
        );
        self.pending.clear();
        self.emit(CaptureEventKind::DataAvailable(chunk));
    }

    fn set_idle(&self) {
        lock(&self.shared).status = RecordingStatus::default();
    }

    fn emit(&self, kind: CaptureEventKind) {
        let event = CaptureEvent {
            session: self.id,
            timestamp: Utc::now(),
            kind,
        };
        if self.event_tx.send(event).is_err() {
            debug!("Capture event receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Emits noise of a fixed amplitude at 16 kHz, 50 ms per read
    struct Constant {
        level: f32,
        fail_after: Option<usize>,
        reads: usize,
        seed: u64,
        live: Arc<AtomicUsize>,
    }

    impl InputStream for Constant {
        fn format(&self) -> AudioFormat {
            AudioFormat::float32(16000, 1)
        }

        fn read(&mut self) -> VoiceResult<Vec<f32>> {
            self.reads += 1;
            if self.fail_after.map(|n| self.reads > n).unwrap_or(false) {
                return Err(VoiceError::DeviceLost("unplugged".into()));
            }
            let mut out = Vec::with_capacity(800);
            for _ in 0..800 {
                self.seed = self
                    .seed
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                let unit = (self.seed >> 40) as f32 / (1u64 << 24) as f32;
                out.push((unit * 2.0 - 1.0) * self.level);
            }
            Ok(out)
        }
    }

    impl Drop for Constant {
        fn drop(&mut self) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    struct Device {
        level: f32,
        fail_after: Option<usize>,
        deny: bool,
        live: Arc<AtomicUsize>,
    }

    impl InputDevice for Device {
        fn open(&self, _config: &CaptureConfig) -> VoiceResult<Box<dyn InputStream>> {
            if self.deny {
                return Err(VoiceError::DeviceAccess("permission denied".into()));
            }
            self.live.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(Constant {
                level: self.level,
                fail_after: self.fail_after,
                reads: 0,
                seed: 42,
                live: self.live.clone(),
            }))
        }
    }

    fn device(level: f32, fail_after: Option<usize>) -> (Arc<Device>, Arc<AtomicUsize>) {
        let live = Arc::new(AtomicUsize::new(0));
        let dev = Arc::new(Device {
            level,
            fail_after,
            deny: false,
            live: live.clone(),
        });
        (dev, live)
    }

    fn test_config() -> CaptureConfig {
        CaptureConfig {
            fft_size: 512,
            smoothing: 0.0,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_is_rejected_and_stop_is_idempotent() {
        let (dev, live) = device(0.0, None);
        let (mut capture, _rx) = AudioCapture::new(dev, test_config(), VadConfig::default());

        let session = capture.start_recording().unwrap();
        assert_eq!(session, 1);
        assert_eq!(capture.start_recording(), Err(VoiceError::AlreadyRecording));
        assert!(capture.status().is_recording);

        tokio::time::sleep(Duration::from_millis(500)).await;
        capture.stop_recording().await;
        assert_eq!(live.load(Ordering::SeqCst), 0);
        assert!(!capture.status().is_recording);
        assert!(capture.stop_recording().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn denied_device_is_a_device_access_error() {
        let dev = Arc::new(Device {
            level: 0.0,
            fail_after: None,
            deny: true,
            live: Arc::new(AtomicUsize::new(0)),
        });
        let (mut capture, _rx) = AudioCapture::new(dev, test_config(), VadConfig::default());
        assert!(matches!(
            capture.start_recording(),
            Err(VoiceError::DeviceAccess(_))
        ));
        assert!(!capture.is_recording());
    }

    #[tokio::test(start_paused = true)]
    async fn emits_chunks_on_interval_while_recording() {
        let (dev, _live) = device(0.0, None);
        let (mut capture, mut rx) = AudioCapture::new(dev, test_config(), VadConfig::default());
        capture.start_recording().unwrap();
        tokio::time::sleep(Duration::from_millis(1000)).await;
        capture.stop_recording().await;

        let mut chunks = 0;
        while let Ok(event) = rx.try_recv() {
            if let CaptureEventKind::DataAvailable(chunk) = event.kind {
                assert!(!chunk.is_empty());
                chunks += 1;
            }
        }
        assert!((9..=12).contains(&chunks), "got {} chunks", chunks);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_recording_keeps_only_pre_roll() {
        let (dev, _live) = device(0.0, None);
        let (mut capture, _rx) = AudioCapture::new(dev, test_config(), VadConfig::default());
        capture.start_recording().unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        let recording = capture.stop_recording().await.unwrap();
        assert!(recording.duration() <= Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn device_loss_emits_error_and_releases_stream() {
        let (dev, live) = device(0.0, Some(3));
        let (mut capture, mut rx) = AudioCapture::new(dev, test_config(), VadConfig::default());
        capture.start_recording().unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        let mut lost = false;
        while let Ok(event) = rx.try_recv() {
            if let CaptureEventKind::Error(VoiceError::DeviceLost(_)) = event.kind {
                lost = true;
            }
        }
        assert!(lost);
        assert_eq!(live.load(Ordering::SeqCst), 0);
        assert!(!capture.is_recording());

        // a dead session does not block a fresh start
        assert_eq!(capture.start_recording(), Ok(2));
        capture.stop_recording().await;
    }

    struct Counting {
        reads: Arc<AtomicUsize>,
    }

    impl InputStream for Counting {
        fn format(&self) -> AudioFormat {
            AudioFormat::float32(16000, 1)
        }

        fn read(&mut self) -> VoiceResult<Vec<f32>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(vec![0.0; 800])
        }
    }

    impl InputDevice for Counting {
        fn open(&self, _config: &CaptureConfig) -> VoiceResult<Box<dyn InputStream>> {
            Ok(Box::new(Counting {
                reads: self.reads.clone(),
            }))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn new_poll_interval_applies_to_running_session() {
        let reads = Arc::new(AtomicUsize::new(0));
        let dev = Arc::new(Counting {
            reads: reads.clone(),
        });
        let (mut capture, _rx) = AudioCapture::new(dev, test_config(), VadConfig::default());
        capture.start_recording().unwrap();
        tokio::time::sleep(Duration::from_millis(1000)).await;
        let before = reads.load(Ordering::SeqCst);
        assert!((19..=22).contains(&before), "{} reads at 50 ms", before);

        capture.update_vad_config(VadConfig {
            poll_interval_ms: 200,
            ..Default::default()
        });
        tokio::time::sleep(Duration::from_millis(2000)).await;
        let after = reads.load(Ordering::SeqCst) - before;
        capture.stop_recording().await;
        assert!((9..=12).contains(&after), "{} reads at 200 ms", after);
    }

    #[tokio::test(start_paused = true)]
    async fn loud_input_reports_speech() {
        let (dev, _live) = device(0.5, None);
        let (mut capture, mut rx) = AudioCapture::new(dev, test_config(), VadConfig::default());
        capture.start_recording().unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(capture.status().has_speech);
        capture.stop_recording().await;

        let starts = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|e| e.kind == CaptureEventKind::SpeechStart)
            .count();
        assert_eq!(starts, 1);
    }
}
