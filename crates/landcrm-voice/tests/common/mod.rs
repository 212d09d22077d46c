//! Shared doubles for the scenario tests. Everything runs on tokio's paused clock.
#![allow(dead_code)]

use async_trait::async_trait;
use landcrm_voice::{
    AudioFormat, AudioOutput, CaptureConfig, ConnectionClient, ConnectionCredentials,
    InputDevice, InputStream, PcmBuffer, RecognizeRequest, ReplyGenerator, SynthesizeRequest,
    VoiceComponents, VoiceError, VoiceProvider, VoiceResult, VoiceSettings,
};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

pub const SECRET: &str = "c2NlbmFyaW8tc2VjcmV0LWtleS0wMDA=";

pub fn settings() -> VoiceSettings {
    let mut settings = VoiceSettings::default();
    settings.capture = CaptureConfig {
        fft_size: 512,
        smoothing: 0.0,
        ..Default::default()
    };
    settings
}

/// (how long, noise amplitude) segments; silence after the last one
pub type Script = Vec<(u64, f32)>;

/// Microphone whose n-th opened stream plays the n-th script
pub struct ScriptedMicrophone {
    scripts: Mutex<VecDeque<Script>>,
    /// Refuse to open, as when permission is denied
    pub deny: AtomicBool,
    /// Streams opened from now on fail this many ms after opening
    pub unplug_after: Mutex<Option<u64>>,
    pub opens: AtomicUsize,
    pub live: Arc<AtomicUsize>,
}

impl ScriptedMicrophone {
    pub fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            deny: AtomicBool::new(false),
            unplug_after: Mutex::new(None),
            opens: AtomicUsize::new(0),
            live: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl InputDevice for ScriptedMicrophone {
    fn open(&self, _config: &CaptureConfig) -> VoiceResult<Box<dyn InputStream>> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(VoiceError::DeviceAccess("permission denied".to_string()));
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_add(1, Ordering::SeqCst);
        let script = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
        Ok(Box::new(ScriptedStream {
            script,
            opened: Instant::now(),
            unplug_after: *self.unplug_after.lock().unwrap(),
            seed: 7,
            live: self.live.clone(),
        }))
    }
}

struct ScriptedStream {
    script: Script,
    opened: Instant,
    unplug_after: Option<u64>,
    seed: u64,
    live: Arc<AtomicUsize>,
}

impl ScriptedStream {
    fn level(&self) -> f32 {
        let mut elapsed = self.opened.elapsed().as_millis() as u64;
        for &(ms, level) in &self.script {
            if elapsed < ms {
                return level;
            }
            elapsed -= ms;
        }
        0.0
    }
}

impl InputStream for ScriptedStream {
    fn format(&self) -> AudioFormat {
        AudioFormat::float32(16000, 1)
    }

    /// One poll interval (50 ms) of white noise at the scripted level
    fn read(&mut self) -> VoiceResult<Vec<f32>> {
        if let Some(ms) = self.unplug_after {
            if self.opened.elapsed() >= Duration::from_millis(ms) {
                return Err(VoiceError::DeviceLost("microphone unplugged".to_string()));
            }
        }
        let level = self.level();
        let mut out = Vec::with_capacity(800);
        for _ in 0..800 {
            self.seed = self
                .seed
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            let unit = (self.seed >> 40) as f32 / (1u64 << 24) as f32;
            out.push((unit * 2.0 - 1.0) * level);
        }
        Ok(out)
    }
}

impl Drop for ScriptedStream {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Speaker that "plays" for the buffer's duration on the tokio clock
#[derive(Clone, Default)]
pub struct FakeOutput {
    pub played: Arc<Mutex<Vec<Duration>>>,
    state: Arc<Mutex<FakeState>>,
}

#[derive(Default)]
struct FakeState {
    started: Option<Instant>,
    length: Duration,
}

impl FakeOutput {
    pub fn played(&self) -> Vec<Duration> {
        self.played.lock().unwrap().clone()
    }
}

impl AudioOutput for FakeOutput {
    fn play(&mut self, audio: PcmBuffer, _volume: f32) -> VoiceResult<()> {
        let length = audio.duration();
        self.played.lock().unwrap().push(length);
        let mut state = self.state.lock().unwrap();
        state.started = Some(Instant::now());
        state.length = length;
        Ok(())
    }

    fn pause(&mut self) {}

    fn resume(&mut self) {}

    fn stop(&mut self) {
        self.state.lock().unwrap().started = None;
    }

    fn set_volume(&mut self, _volume: f32) {}

    fn is_finished(&self) -> bool {
        let state = self.state.lock().unwrap();
        state
            .started
            .map(|s| s.elapsed() >= state.length)
            .unwrap_or(true)
    }

    fn position(&self) -> Duration {
        let state = self.state.lock().unwrap();
        state.started.map(|s| s.elapsed()).unwrap_or_default()
    }
}

/// Remote speech services with canned answers
#[derive(Default)]
pub struct ScriptedProvider {
    pub transcript: Mutex<String>,
    pub fail_recognition: Mutex<bool>,
    pub fail_synthesis: bool,
    pub unhealthy: bool,
    pub recognition_delay: Duration,
    pub recognitions: AtomicUsize,
    pub syntheses: AtomicUsize,
    /// Texts in the order synthesis was requested
    pub synthesized: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn saying(transcript: &str) -> Self {
        Self {
            transcript: Mutex::new(transcript.to_string()),
            ..Default::default()
        }
    }

    pub fn recognitions(&self) -> usize {
        self.recognitions.load(Ordering::SeqCst)
    }

    pub fn syntheses(&self) -> usize {
        self.syntheses.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VoiceProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn recognize(&self, _request: RecognizeRequest) -> VoiceResult<Value> {
        self.recognitions.fetch_add(1, Ordering::SeqCst);
        if !self.recognition_delay.is_zero() {
            tokio::time::sleep(self.recognition_delay).await;
        }
        if *self.fail_recognition.lock().unwrap() {
            return Err(VoiceError::RecognitionService(
                "503 Service Unavailable".to_string(),
            ));
        }
        let transcript = self.transcript.lock().unwrap().clone();
        Ok(json!({
            "results": [{ "alternatives": [{ "transcript": transcript, "confidence": 0.93 }] }]
        }))
    }

    /// 10 ms of LINEAR16 silence per character, later chunks answered faster
    async fn synthesize(&self, request: SynthesizeRequest) -> VoiceResult<Vec<u8>> {
        let n = self.syntheses.fetch_add(1, Ordering::SeqCst);
        self.synthesized.lock().unwrap().push(request.text.clone());
        tokio::time::sleep(Duration::from_millis(300u64.saturating_sub(100 * n as u64))).await;
        if self.fail_synthesis {
            return Err(VoiceError::SynthesisService("500 Internal Server Error".to_string()));
        }
        let rate = request.config.sample_rate as usize;
        let samples = rate / 100 * request.text.chars().count();
        Ok(vec![0u8; samples * 2])
    }

    async fn health(&self) -> VoiceResult<()> {
        if self.unhealthy {
            return Err(VoiceError::ServiceUnavailable("connection refused".to_string()));
        }
        Ok(())
    }
}

/// Business layer stand-in
#[derive(Default)]
pub struct EchoReply {
    pub calls: AtomicUsize,
}

impl EchoReply {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReplyGenerator for EchoReply {
    async fn reply(&self, transcript: &str) -> VoiceResult<Option<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Some(format!("You said: {}", transcript)))
    }
}

pub fn connection(provider: Arc<ScriptedProvider>) -> ConnectionClient {
    let credentials = ConnectionCredentials::new("scenario-api-key-4242", SECRET).unwrap();
    ConnectionClient::with_provider(credentials, provider)
}

pub fn components(
    provider: Arc<ScriptedProvider>,
    microphone: Arc<ScriptedMicrophone>,
    output: FakeOutput,
    settings: &VoiceSettings,
) -> VoiceComponents {
    VoiceComponents::new(connection(provider), microphone, Box::new(output), settings).unwrap()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Collect events until one matches, failing if it never arrives
pub async fn wait_for<T: std::fmt::Debug>(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<T>,
    mut found: impl FnMut(&T) -> bool,
) -> Vec<T> {
    let mut seen = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(60), rx.recv()).await {
            Ok(Some(event)) => {
                let done = found(&event);
                seen.push(event);
                if done {
                    return seen;
                }
            }
            _ => panic!("expected event never arrived; saw {:?}", seen),
        }
    }
}

pub fn drain<T>(rx: &mut tokio::sync::mpsc::UnboundedReceiver<T>) -> Vec<T> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}
