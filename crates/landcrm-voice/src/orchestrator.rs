//! Hands-free conversation loop
//!
//! [`VoiceAssistant`] is a cheap handle; the work happens in one tokio task that
//! owns every component. That task feeds capture events, playback events,
//! command requests and finished network work into the [`ConversationMachine`]
//! and carries out the effects it returns. Network calls run as separate tasks
//! so a stop can abort them; whatever they still deliver afterwards carries an
//! old generation and is dropped by the machine.

use crate::capture::{AudioCapture, CaptureEvent, CaptureEventKind, InputDevice, RecordingStatus};
use crate::config::VoiceSettings;
use crate::connection::{ConnectionClient, ConnectionCredentials};
use crate::error::{VoiceError, VoiceResult};
use crate::microphone::CpalMicrophone;
use crate::playback::{AudioOutput, AudioPlayback, PlaybackEvent, PlaybackState};
use crate::speaker::RodioOutput;
use crate::stt::{RecognitionResult, SpeechRecognizer};
use crate::tts::{SpeechSynthesizer, SynthesisResult};
use crate::turn::{
    AssistantEvent, ConversationMachine, ConversationState, Effect, Generation, Input,
};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

/// Business-layer hook: turns what the user said into what the assistant says
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    /// `None` or a blank reply ends the turn without speaking
    async fn reply(&self, transcript: &str) -> VoiceResult<Option<String>>;
}

/// Everything the assistant drives, already constructed
pub struct VoiceComponents {
    pub connection: ConnectionClient,
    pub capture: AudioCapture,
    pub capture_events: mpsc::UnboundedReceiver<CaptureEvent>,
    pub recognizer: SpeechRecognizer,
    pub synthesizer: SpeechSynthesizer,
    pub playback: AudioPlayback,
    pub playback_events: mpsc::UnboundedReceiver<PlaybackEvent>,
}

impl VoiceComponents {
    /// Wire components around an existing connection and audio devices
    pub fn new(
        connection: ConnectionClient,
        device: Arc<dyn InputDevice>,
        output: Box<dyn AudioOutput>,
        settings: &VoiceSettings,
    ) -> VoiceResult<Self> {
        let (capture, capture_events) =
            AudioCapture::new(device, settings.capture.clone(), settings.vad.clone());
        let recognizer = connection.recognizer(settings.recognition.clone());
        let synthesizer = connection.synthesizer(settings.synthesis.clone())?;
        let (playback, playback_events) = AudioPlayback::spawn(output, settings.playback.clone());
        Ok(Self {
            connection,
            capture,
            capture_events,
            recognizer,
            synthesizer,
            playback,
            playback_events,
        })
    }
}

/// Point-in-time view of the whole assistant
#[derive(Debug, Clone, PartialEq)]
pub struct AssistantSnapshot {
    pub state: ConversationState,
    pub continuous: bool,
    pub listening: bool,
    pub speaking: bool,
    pub recording: RecordingStatus,
    pub playback: PlaybackState,
}

enum Command {
    Start(oneshot::Sender<VoiceResult<()>>),
    Stop(oneshot::Sender<()>),
    Unavailable(VoiceError, oneshot::Sender<()>),
    Text(String, oneshot::Sender<VoiceResult<()>>),
    Speak(String, oneshot::Sender<VoiceResult<()>>),
    Volume(f32, oneshot::Sender<VoiceResult<f32>>),
    Snapshot(oneshot::Sender<AssistantSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

pub struct VoiceAssistant {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConversationState>,
    connection: ConnectionClient,
    worker: Option<JoinHandle<()>>,
}

impl VoiceAssistant {
    /// Build the real stack: HTTP provider, default microphone and speaker.
    ///
    /// Fails with `Initialization` when credentials are missing or malformed.
    pub fn initialize(
        settings: &VoiceSettings,
        replies: Arc<dyn ReplyGenerator>,
    ) -> VoiceResult<(Self, mpsc::UnboundedReceiver<AssistantEvent>)> {
        settings.validate()?;
        let credentials = ConnectionCredentials::from_settings(&settings.connection)?;
        let connection = ConnectionClient::new(credentials, settings.connection.clone())?;
        let output = RodioOutput::open()?;
        let components = VoiceComponents::new(
            connection,
            Arc::new(CpalMicrophone::new()),
            Box::new(output),
            settings,
        )?;
        Ok(Self::with_components(components, replies))
    }

    /// Start the conversation loop around injected components
    pub fn with_components(
        components: VoiceComponents,
        replies: Arc<dyn ReplyGenerator>,
    ) -> (Self, mpsc::UnboundedReceiver<AssistantEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConversationState::Idle);
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let connection = components.connection.clone();

        let (worker, capture_events, playback_events) =
            Worker::new(components, replies, event_tx, state_tx, outcome_tx);
        let handle = tokio::spawn(worker.run(cmd_rx, capture_events, playback_events, outcome_rx));
        info!(
            "🤖 Voice assistant ready (provider {})",
            connection.info().provider
        );

        (
            Self {
                cmd_tx,
                state_rx,
                connection,
                worker: Some(handle),
            },
            event_rx,
        )
    }

    /// Idle → Listening. Checks service health first; a failed check leaves
    /// the assistant in `Error` and returns `ServiceUnavailable`.
    pub async fn start_continuous_mode(&self) -> VoiceResult<()> {
        if !self.connection.health_check().await {
            let error = VoiceError::ServiceUnavailable(
                "speech services did not pass the health check".to_string(),
            );
            self.request(|tx| Command::Unavailable(error.clone(), tx)).await?;
            return Err(error);
        }
        self.request(Command::Start).await?
    }

    /// Stop capture and playback from any state and return to `Idle`
    pub async fn stop_continuous_mode(&self) -> VoiceResult<()> {
        self.request(Command::Stop).await
    }

    /// Feed text straight into the reply path, skipping capture and recognition
    pub async fn process_text_command(&self, text: impl Into<String>) -> VoiceResult<()> {
        let text = text.into();
        self.request(|tx| Command::Text(text, tx)).await?
    }

    /// Synthesize and play `text`; appends when already speaking
    pub async fn speak(&self, text: impl Into<String>) -> VoiceResult<()> {
        let text = text.into();
        self.request(|tx| Command::Speak(text, tx)).await?
    }

    /// Returns the volume actually applied after clamping
    pub async fn set_volume(&self, volume: f32) -> VoiceResult<f32> {
        self.request(|tx| Command::Volume(volume, tx)).await?
    }

    pub fn state(&self) -> ConversationState {
        *self.state_rx.borrow()
    }

    /// Watch state changes without draining the event channel
    pub fn subscribe_state(&self) -> watch::Receiver<ConversationState> {
        self.state_rx.clone()
    }

    pub async fn snapshot(&self) -> VoiceResult<AssistantSnapshot> {
        self.request(Command::Snapshot).await
    }

    pub async fn check_health(&self) -> bool {
        self.connection.health_check().await
    }

    pub fn connection(&self) -> &ConnectionClient {
        &self.connection
    }

    /// Stop everything, release the devices and end the loop
    pub async fn shutdown(&mut self) {
        let _ = self.request(Command::Shutdown).await;
        if let Some(handle) = self.worker.take() {
            if let Err(e) = handle.await {
                error!("Assistant loop ended abnormally: {}", e);
            }
        }
        info!("👋 Voice assistant shut down");
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> VoiceResult<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(command(tx))
            .map_err(|_| VoiceError::ChannelClosed("voice assistant has shut down".to_string()))?;
        rx.await
            .map_err(|_| VoiceError::ChannelClosed("voice assistant dropped the request".to_string()))
    }
}

struct Worker {
    machine: ConversationMachine,
    capture: AudioCapture,
    /// Session id of the running capture and the generation it belongs to
    capture_session: Option<(u64, Generation)>,
    recognizer: Arc<SpeechRecognizer>,
    synthesizer: Arc<SpeechSynthesizer>,
    playback: AudioPlayback,
    replies: Arc<dyn ReplyGenerator>,
    event_tx: mpsc::UnboundedSender<AssistantEvent>,
    state_tx: watch::Sender<ConversationState>,
    outcome_tx: mpsc::UnboundedSender<Input>,
    in_flight: Vec<AbortHandle>,
    /// Synthesis jobs run one after another so replies are queued in order
    synthesis_tail: Option<JoinHandle<()>>,
    last_error: Option<VoiceError>,
}

impl Worker {
    fn new(
        components: VoiceComponents,
        replies: Arc<dyn ReplyGenerator>,
        event_tx: mpsc::UnboundedSender<AssistantEvent>,
        state_tx: watch::Sender<ConversationState>,
        outcome_tx: mpsc::UnboundedSender<Input>,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<CaptureEvent>,
        mpsc::UnboundedReceiver<PlaybackEvent>,
    ) {
        let worker = Worker {
            machine: ConversationMachine::new(),
            capture: components.capture,
            capture_session: None,
            recognizer: Arc::new(components.recognizer),
            synthesizer: Arc::new(components.synthesizer),
            playback: components.playback,
            replies,
            event_tx,
            state_tx,
            outcome_tx,
            in_flight: Vec::new(),
            synthesis_tail: None,
            last_error: None,
        };
        (worker, components.capture_events, components.playback_events)
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut capture_rx: mpsc::UnboundedReceiver<CaptureEvent>,
        mut playback_rx: mpsc::UnboundedReceiver<PlaybackEvent>,
        mut outcome_rx: mpsc::UnboundedReceiver<Input>,
    ) {
        loop {
            tokio::select! {
                command = cmd_rx.recv() => match command {
                    Some(Command::Shutdown(reply)) => {
                        self.close().await;
                        let _ = reply.send(());
                        return;
                    }
                    Some(command) => self.command(command).await,
                    None => break,
                },
                Some(event) = capture_rx.recv() => self.capture_event(event).await,
                Some(event) = playback_rx.recv() => self.playback_event(event).await,
                Some(input) = outcome_rx.recv() => {
                    if let Err(e) = self.apply(input).await {
                        warn!("Ignoring outcome: {}", e);
                    }
                }
            }
        }
        self.close().await;
    }

    async fn command(&mut self, command: Command) {
        match command {
            Command::Start(reply) => {
                let result = self.apply(Input::StartContinuous).await.and_then(|_| {
                    if self.machine.state() == ConversationState::Error {
                        Err(self.last_error.clone().unwrap_or_else(|| {
                            VoiceError::InvalidState("conversation failed to start".to_string())
                        }))
                    } else {
                        Ok(())
                    }
                });
                if result.is_ok() {
                    info!("🔁 Continuous mode on");
                }
                let _ = reply.send(result);
            }
            Command::Stop(reply) => {
                let _ = self.apply(Input::StopContinuous).await;
                info!("⏸️ Continuous mode off");
                let _ = reply.send(());
            }
            Command::Unavailable(error, reply) => {
                let generation = self.machine.generation();
                let _ = self.apply(Input::Failed { generation, error }).await;
                let _ = reply.send(());
            }
            Command::Text(text, reply) => {
                let _ = reply.send(self.apply(Input::TextCommand(text)).await);
            }
            Command::Speak(text, reply) => {
                let _ = reply.send(self.apply(Input::Speak(text)).await);
            }
            Command::Volume(volume, reply) => {
                let _ = reply.send(self.playback.set_volume(volume));
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(AssistantSnapshot {
                    state: self.machine.state(),
                    continuous: self.machine.is_continuous(),
                    listening: self.machine.is_listening(),
                    speaking: self.machine.is_speaking(),
                    recording: self.capture.status(),
                    playback: self.playback.state(),
                });
            }
            Command::Shutdown(reply) => {
                let _ = reply.send(());
            }
        }
    }

    async fn capture_event(&mut self, event: CaptureEvent) {
        let generation = match self.capture_session {
            Some((session, generation)) if session == event.session => generation,
            _ => {
                debug!(session = event.session, "Dropping event from a closed capture session");
                return;
            }
        };
        let input = match event.kind {
            CaptureEventKind::SpeechStart => Input::SpeechStarted { generation },
            CaptureEventKind::SpeechEnd { .. } => Input::SpeechEnded { generation },
            CaptureEventKind::Error(error) => Input::Failed { generation, error },
            CaptureEventKind::DataAvailable(_) => return,
        };
        if let Err(e) = self.apply(input).await {
            warn!("Ignoring capture event: {}", e);
        }
    }

    async fn playback_event(&mut self, event: PlaybackEvent) {
        let input = match event {
            PlaybackEvent::Ended { tag } => Input::PlaybackEnded { generation: tag },
            PlaybackEvent::Error { tag, error } => Input::Failed {
                generation: tag,
                error,
            },
            other => {
                debug!(?other, "Playback event");
                return;
            }
        };
        if let Err(e) = self.apply(input).await {
            warn!("Ignoring playback event: {}", e);
        }
    }

    /// Run `input` and every follow-up it causes through the machine.
    /// Only a rejection of the first input is returned to the caller.
    async fn apply(&mut self, input: Input) -> VoiceResult<()> {
        let mut inputs = VecDeque::from([input]);
        let mut first = true;
        while let Some(input) = inputs.pop_front() {
            let effects = match self.machine.handle(input) {
                Ok(effects) => effects,
                Err(e) if first => return Err(e),
                Err(e) => {
                    warn!("Follow-up rejected: {}", e);
                    continue;
                }
            };
            first = false;
            for effect in effects {
                if let Some(follow_up) = self.execute(effect).await {
                    inputs.push_back(follow_up);
                }
            }
        }
        Ok(())
    }

    async fn execute(&mut self, effect: Effect) -> Option<Input> {
        match effect {
            Effect::StartCapture { generation } => match self.capture.start_recording() {
                Ok(session) => {
                    self.capture_session = Some((session, generation));
                    Some(Input::CaptureStarted { generation })
                }
                Err(error) => {
                    error!("Could not start capture: {}", error);
                    Some(Input::Failed { generation, error })
                }
            },
            Effect::StopCapture => {
                self.capture_session = None;
                self.capture.stop_recording().await;
                None
            }
            Effect::FinishCapture { generation } => {
                self.capture_session = None;
                match self.capture.stop_recording().await {
                    Some(audio) if !audio.is_empty() => {
                        let recognizer = self.recognizer.clone();
                        let outcomes = self.outcome_tx.clone();
                        self.track(tokio::spawn(async move {
                            let result = recognizer.recognize_batch(&audio, None).await;
                            let _ = outcomes.send(Input::Recognized { generation, result });
                        }));
                        None
                    }
                    _ => Some(Input::Recognized {
                        generation,
                        result: Ok(RecognitionResult::empty(true)),
                    }),
                }
            }
            Effect::RequestReply {
                generation,
                transcript,
            } => {
                let replies = self.replies.clone();
                let outcomes = self.outcome_tx.clone();
                self.track(tokio::spawn(async move {
                    let reply = replies.reply(&transcript).await.map_err(|e| match e {
                        VoiceError::Reply(_) => e,
                        other => VoiceError::Reply(other.to_string()),
                    });
                    let _ = outcomes.send(Input::Replied { generation, reply });
                }));
                None
            }
            Effect::Synthesize { generation, text } => {
                self.synthesize(generation, text);
                None
            }
            Effect::Enqueue { generation, audio } => {
                match self.playback.enqueue_tagged(audio, generation) {
                    Ok(()) => None,
                    Err(error) => Some(Input::Failed { generation, error }),
                }
            }
            Effect::StopPlayback => {
                if let Err(e) = self.playback.stop() {
                    warn!("Could not stop playback: {}", e);
                }
                None
            }
            Effect::CancelPending => {
                for task in self.in_flight.drain(..) {
                    task.abort();
                }
                if let Some(tail) = self.synthesis_tail.take() {
                    tail.abort();
                }
                None
            }
            Effect::Emit(event) => {
                self.emit(event);
                None
            }
        }
    }

    fn synthesize(&mut self, generation: Generation, text: String) {
        let synthesizer = self.synthesizer.clone();
        let outcomes = self.outcome_tx.clone();
        let previous = self.synthesis_tail.take();

        let handle = tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            let format = synthesizer.config().format();
            let per_char = synthesizer.config().fallback_seconds_per_char;
            let mut segments = synthesizer.synthesize_segments(&text, None);
            while let Some(segment) = segments.next().await {
                let input = match segment.result {
                    Ok(result) => Input::Synthesized {
                        generation,
                        text: segment.text,
                        audio: result.into_chunk(),
                        degraded: None,
                    },
                    Err(error) => {
                        warn!("⚠️ Synthesis failed, playing silence instead: {}", error);
                        let silence = SynthesisResult::silence(&segment.text, format, per_char);
                        Input::Synthesized {
                            generation,
                            text: segment.text,
                            audio: silence.into_chunk(),
                            degraded: Some(error),
                        }
                    }
                };
                if outcomes.send(input).is_err() {
                    return;
                }
            }
            let _ = outcomes.send(Input::SynthesisFinished { generation });
        });
        self.track_abort(handle.abort_handle());
        self.synthesis_tail = Some(handle);
    }

    fn track(&mut self, handle: JoinHandle<()>) {
        self.track_abort(handle.abort_handle());
    }

    fn track_abort(&mut self, task: AbortHandle) {
        self.in_flight.retain(|task| !task.is_finished());
        self.in_flight.push(task);
    }

    #[cfg(test)]
    fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    fn emit(&mut self, event: AssistantEvent) {
        match &event {
            AssistantEvent::StateChanged(state) => {
                self.state_tx.send_replace(*state);
            }
            AssistantEvent::Error(error) => {
                error!(fatal = error.is_fatal(), "❌ Conversation stopped: {}", error);
                self.last_error = Some(error.clone());
            }
            AssistantEvent::SpeechRecognized(result) => {
                info!("👂 Heard: {}", result.transcript);
            }
            _ => {}
        }
        if self.event_tx.send(event).is_err() {
            debug!("Assistant event receiver dropped");
        }
    }

    async fn close(&mut self) {
        let _ = self.apply(Input::StopContinuous).await;
        self.capture.stop_recording().await;
        self.playback.shutdown().await;
    }
}
