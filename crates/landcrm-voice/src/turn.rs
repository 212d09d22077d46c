//! Turn-taking state machine
//!
//! ```text
//!            start                speech end               transcript
//!   Idle ───────────▶ Listening ────────────▶ Recognizing ────────────▶ Speaking
//!    ▲                   ▲  │                      │ blank                 │
//!    │ stop              │  └──────────────────────┘                       │
//!    │                   └───────────────── playback drained ◀─────────────┘
//!   Error ◀──────── any component failure (fail-stop, explicit restart)
//! ```
//!
//! [`ConversationMachine`] performs no I/O. It consumes [`Input`]s and returns
//! the [`Effect`]s the orchestrator has to carry out. Every asynchronous
//! outcome carries the generation that requested it; a stop, a restart or a
//! failure bumps the generation so late results are dropped here rather than
//! acted upon.

use crate::audio::AudioChunk;
use crate::error::{VoiceError, VoiceResult};
use crate::stt::RecognitionResult;
use serde::Serialize;
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConversationState {
    #[default]
    Idle,
    Listening,
    Recognizing,
    Speaking,
    Error,
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConversationState::Idle => "idle",
            ConversationState::Listening => "listening",
            ConversationState::Recognizing => "recognizing",
            ConversationState::Speaking => "speaking",
            ConversationState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Notifications for the business layer and the UI
#[derive(Debug, Clone, PartialEq)]
pub enum AssistantEvent {
    StateChanged(ConversationState),
    ListeningStarted,
    ListeningEnded,
    SpeechStarted,
    SpeechEnded,
    SpeechRecognized(RecognitionResult),
    ResponseReceived(String),
    SpeakingStarted,
    SpeakingEnded,
    /// A chunk could not be synthesized and was replaced by silence
    Degraded { text: String, error: VoiceError },
    Error(VoiceError),
}

pub type Generation = u64;

#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    StartContinuous,
    StopContinuous,
    TextCommand(String),
    Speak(String),
    /// The capture requested by `StartCapture` is running
    CaptureStarted { generation: Generation },
    SpeechStarted { generation: Generation },
    SpeechEnded { generation: Generation },
    Recognized {
        generation: Generation,
        result: VoiceResult<RecognitionResult>,
    },
    Replied {
        generation: Generation,
        reply: VoiceResult<Option<String>>,
    },
    /// One synthesized chunk, or its silent stand-in when `degraded` is set
    Synthesized {
        generation: Generation,
        text: String,
        audio: AudioChunk,
        degraded: Option<VoiceError>,
    },
    SynthesisFinished { generation: Generation },
    PlaybackEnded { generation: Generation },
    Failed {
        generation: Generation,
        error: VoiceError,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    StartCapture { generation: Generation },
    /// Stop capture and drop whatever was recorded
    StopCapture,
    /// Stop capture and recognize the recording
    FinishCapture { generation: Generation },
    RequestReply { generation: Generation, transcript: String },
    Synthesize { generation: Generation, text: String },
    Enqueue { generation: Generation, audio: AudioChunk },
    StopPlayback,
    /// Abort in-flight recognition, reply and synthesis work
    CancelPending,
    Emit(AssistantEvent),
}

#[derive(Debug, Default)]
pub struct ConversationMachine {
    state: ConversationState,
    generation: Generation,
    continuous: bool,
    capture_active: bool,
    /// `ListeningStarted` went out for the running capture
    listening_announced: bool,
    awaiting_reply: bool,
    pending_synthesis: usize,
    queued_buffers: usize,
}

impl ConversationMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConversationState {
        self.state
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn is_continuous(&self) -> bool {
        self.continuous
    }

    pub fn is_listening(&self) -> bool {
        self.capture_active
    }

    pub fn is_speaking(&self) -> bool {
        self.state == ConversationState::Speaking
    }

    /// True while synthesized audio is queued or still being produced
    pub fn playback_active(&self) -> bool {
        self.queued_buffers > 0 || self.pending_synthesis > 0
    }

    pub fn handle(&mut self, input: Input) -> VoiceResult<Vec<Effect>> {
        let mut fx = Vec::new();
        match input {
            Input::StartContinuous => self.start_continuous(&mut fx),
            Input::StopContinuous => self.stop_continuous(&mut fx),
            Input::TextCommand(text) => self.text_command(text, &mut fx)?,
            Input::Speak(text) => self.speak(text, &mut fx)?,
            Input::CaptureStarted { generation } => {
                if self.is_current(generation) && self.capture_active && !self.listening_announced
                {
                    self.listening_announced = true;
                    fx.push(Effect::Emit(AssistantEvent::ListeningStarted));
                }
            }
            Input::SpeechStarted { generation } => {
                if self.is_current(generation) && self.state == ConversationState::Listening {
                    fx.push(Effect::Emit(AssistantEvent::SpeechStarted));
                }
            }
            Input::SpeechEnded { generation } => {
                if self.is_current(generation) && self.state == ConversationState::Listening {
                    self.capture_active = false;
                    fx.push(Effect::FinishCapture {
                        generation: self.generation,
                    });
                    fx.push(Effect::Emit(AssistantEvent::SpeechEnded));
                    self.announce_listening_ended(&mut fx);
                    self.transition(ConversationState::Recognizing, &mut fx);
                }
            }
            Input::Recognized { generation, result } => {
                if self.is_current(generation) && self.state == ConversationState::Recognizing {
                    self.recognized(result, &mut fx);
                }
            }
            Input::Replied { generation, reply } => {
                if self.is_current(generation) && self.awaiting_reply {
                    self.awaiting_reply = false;
                    match reply {
                        Ok(Some(text)) if !text.trim().is_empty() => {
                            fx.push(Effect::Emit(AssistantEvent::ResponseReceived(text.clone())));
                            self.pending_synthesis += 1;
                            fx.push(Effect::Synthesize {
                                generation: self.generation,
                                text,
                            });
                        }
                        Ok(_) => self.finish_speaking(&mut fx),
                        Err(e) => self.fail(e, &mut fx),
                    }
                }
            }
            Input::Synthesized {
                generation,
                text,
                audio,
                degraded,
            } => {
                if self.is_current(generation) && self.pending_synthesis > 0 {
                    if let Some(error) = degraded {
                        fx.push(Effect::Emit(AssistantEvent::Degraded { text, error }));
                    }
                    self.queued_buffers += 1;
                    fx.push(Effect::Enqueue {
                        generation: self.generation,
                        audio,
                    });
                }
            }
            Input::SynthesisFinished { generation } => {
                if self.is_current(generation) && self.pending_synthesis > 0 {
                    self.pending_synthesis -= 1;
                    self.finish_speaking(&mut fx);
                }
            }
            Input::PlaybackEnded { generation } => {
                if self.is_current(generation) && self.queued_buffers > 0 {
                    self.queued_buffers -= 1;
                    self.finish_speaking(&mut fx);
                }
            }
            Input::Failed { generation, error } => {
                if self.is_current(generation) {
                    self.fail(error, &mut fx);
                }
            }
        }
        Ok(fx)
    }

    fn is_current(&self, generation: Generation) -> bool {
        if generation != self.generation {
            debug!(
                stale = generation,
                current = self.generation,
                "Dropping stale outcome"
            );
            return false;
        }
        true
    }

    fn start_continuous(&mut self, fx: &mut Vec<Effect>) {
        match self.state {
            ConversationState::Idle | ConversationState::Error => {
                self.generation += 1;
                self.reset_activity();
                self.continuous = true;
                self.begin_listening(fx);
            }
            // the loop resumes listening once the current turn ends
            _ => self.continuous = true,
        }
    }

    fn stop_continuous(&mut self, fx: &mut Vec<Effect>) {
        self.continuous = false;
        self.generation += 1;
        self.wind_down(fx);
        self.transition(ConversationState::Idle, fx);
    }

    fn text_command(&mut self, text: String, fx: &mut Vec<Effect>) -> VoiceResult<()> {
        match self.state {
            ConversationState::Idle | ConversationState::Listening => {}
            other => {
                return Err(VoiceError::InvalidState(format!(
                    "text commands are not accepted while {}",
                    other
                )))
            }
        }
        let text = text.trim().to_string();
        if text.is_empty() {
            return Ok(());
        }
        self.pause_listening(fx);
        fx.push(Effect::Emit(AssistantEvent::SpeechRecognized(
            RecognitionResult::typed(&text),
        )));
        self.awaiting_reply = true;
        self.begin_speaking(fx);
        fx.push(Effect::RequestReply {
            generation: self.generation,
            transcript: text,
        });
        Ok(())
    }

    fn speak(&mut self, text: String, fx: &mut Vec<Effect>) -> VoiceResult<()> {
        match self.state {
            ConversationState::Idle
            | ConversationState::Listening
            | ConversationState::Speaking => {}
            other => {
                return Err(VoiceError::InvalidState(format!(
                    "cannot speak while {}",
                    other
                )))
            }
        }
        if text.trim().is_empty() {
            return Ok(());
        }
        self.pause_listening(fx);
        self.begin_speaking(fx);
        self.pending_synthesis += 1;
        fx.push(Effect::Synthesize {
            generation: self.generation,
            text,
        });
        Ok(())
    }

    fn recognized(&mut self, result: VoiceResult<RecognitionResult>, fx: &mut Vec<Effect>) {
        match result {
            Ok(result) if result.is_blank() => {
                debug!("Blank transcript, back to listening");
                self.resume_or_idle(fx);
            }
            Ok(result) => {
                let transcript = result.transcript.clone();
                fx.push(Effect::Emit(AssistantEvent::SpeechRecognized(result)));
                self.awaiting_reply = true;
                self.begin_speaking(fx);
                fx.push(Effect::RequestReply {
                    generation: self.generation,
                    transcript,
                });
            }
            Err(e) => self.fail(e, fx),
        }
    }

    /// `ListeningStarted` follows once the orchestrator reports `CaptureStarted`
    fn begin_listening(&mut self, fx: &mut Vec<Effect>) {
        self.capture_active = true;
        self.listening_announced = false;
        fx.push(Effect::StartCapture {
            generation: self.generation,
        });
        self.transition(ConversationState::Listening, fx);
    }

    fn pause_listening(&mut self, fx: &mut Vec<Effect>) {
        if self.capture_active {
            self.capture_active = false;
            fx.push(Effect::StopCapture);
            self.announce_listening_ended(fx);
        }
    }

    fn announce_listening_ended(&mut self, fx: &mut Vec<Effect>) {
        if self.listening_announced {
            self.listening_announced = false;
            fx.push(Effect::Emit(AssistantEvent::ListeningEnded));
        }
    }

    fn begin_speaking(&mut self, fx: &mut Vec<Effect>) {
        if self.state != ConversationState::Speaking {
            self.transition(ConversationState::Speaking, fx);
            fx.push(Effect::Emit(AssistantEvent::SpeakingStarted));
        }
    }

    fn finish_speaking(&mut self, fx: &mut Vec<Effect>) {
        if self.state != ConversationState::Speaking
            || self.awaiting_reply
            || self.playback_active()
        {
            return;
        }
        fx.push(Effect::Emit(AssistantEvent::SpeakingEnded));
        self.resume_or_idle(fx);
    }

    fn resume_or_idle(&mut self, fx: &mut Vec<Effect>) {
        if self.continuous {
            self.begin_listening(fx);
        } else {
            self.transition(ConversationState::Idle, fx);
        }
    }

    fn fail(&mut self, error: VoiceError, fx: &mut Vec<Effect>) {
        self.continuous = false;
        self.generation += 1;
        self.wind_down(fx);
        fx.push(Effect::Emit(AssistantEvent::Error(error)));
        self.transition(ConversationState::Error, fx);
    }

    /// Release capture and playback and forget in-flight work
    fn wind_down(&mut self, fx: &mut Vec<Effect>) {
        self.pause_listening(fx);
        if self.playback_active() {
            fx.push(Effect::StopPlayback);
        }
        fx.push(Effect::CancelPending);
        if self.state == ConversationState::Speaking {
            fx.push(Effect::Emit(AssistantEvent::SpeakingEnded));
        }
        self.reset_activity();
    }

    fn reset_activity(&mut self) {
        self.capture_active = false;
        self.listening_announced = false;
        self.awaiting_reply = false;
        self.pending_synthesis = 0;
        self.queued_buffers = 0;
    }

    fn transition(&mut self, next: ConversationState, fx: &mut Vec<Effect>) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "Conversation state change");
            self.state = next;
            fx.push(Effect::Emit(AssistantEvent::StateChanged(next)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioFormat;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn transcript(text: &str) -> RecognitionResult {
        RecognitionResult {
            transcript: text.to_string(),
            confidence: 0.9,
            alternatives: Vec::new(),
            is_final: true,
        }
    }

    fn chunk() -> AudioChunk {
        AudioChunk::new(vec![0; 4], AudioFormat::linear16(16000, 1))
    }

    fn emitted(fx: &[Effect]) -> Vec<AssistantEvent> {
        fx.iter()
            .filter_map(|e| match e {
                Effect::Emit(event) => Some(event.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn full_turn_returns_to_listening() {
        let mut m = ConversationMachine::new();
        let fx = m.handle(Input::StartContinuous).unwrap();
        let g = m.generation();
        assert_eq!(fx[0], Effect::StartCapture { generation: g });
        assert_eq!(m.state(), ConversationState::Listening);

        m.handle(Input::SpeechStarted { generation: g }).unwrap();
        let fx = m.handle(Input::SpeechEnded { generation: g }).unwrap();
        assert!(fx.contains(&Effect::FinishCapture { generation: g }));
        assert_eq!(m.state(), ConversationState::Recognizing);

        let fx = m
            .handle(Input::Recognized {
                generation: g,
                result: Ok(transcript("mow the lawn")),
            })
            .unwrap();
        assert!(fx.contains(&Effect::RequestReply {
            generation: g,
            transcript: "mow the lawn".to_string()
        }));
        assert_eq!(m.state(), ConversationState::Speaking);

        let fx = m
            .handle(Input::Replied {
                generation: g,
                reply: Ok(Some("Booked for Tuesday".to_string())),
            })
            .unwrap();
        assert!(fx.contains(&Effect::Synthesize {
            generation: g,
            text: "Booked for Tuesday".to_string()
        }));

        m.handle(Input::Synthesized {
            generation: g,
            text: "Booked for Tuesday".to_string(),
            audio: chunk(),
            degraded: None,
        })
        .unwrap();
        m.handle(Input::SynthesisFinished { generation: g }).unwrap();
        assert_eq!(m.state(), ConversationState::Speaking);

        let fx = m.handle(Input::PlaybackEnded { generation: g }).unwrap();
        assert!(fx.contains(&Effect::StartCapture { generation: g }));
        assert_eq!(m.state(), ConversationState::Listening);
        assert!(emitted(&fx).contains(&AssistantEvent::SpeakingEnded));
    }

    #[test]
    fn blank_transcript_goes_straight_back_to_listening() {
        let mut m = ConversationMachine::new();
        m.handle(Input::StartContinuous).unwrap();
        let g = m.generation();
        m.handle(Input::SpeechEnded { generation: g }).unwrap();
        let fx = m
            .handle(Input::Recognized {
                generation: g,
                result: Ok(transcript("   ")),
            })
            .unwrap();
        assert!(!fx.iter().any(|e| matches!(e, Effect::RequestReply { .. })));
        assert_eq!(m.state(), ConversationState::Listening);
    }

    #[test]
    fn stale_recognition_is_ignored_after_stop() {
        let mut m = ConversationMachine::new();
        m.handle(Input::StartContinuous).unwrap();
        let g = m.generation();
        m.handle(Input::SpeechEnded { generation: g }).unwrap();
        let fx = m.handle(Input::StopContinuous).unwrap();
        assert!(fx.contains(&Effect::CancelPending));
        assert_eq!(m.state(), ConversationState::Idle);

        let fx = m
            .handle(Input::Recognized {
                generation: g,
                result: Ok(transcript("too late")),
            })
            .unwrap();
        assert!(fx.is_empty());
        assert_eq!(m.state(), ConversationState::Idle);
    }

    #[test]
    fn recognition_failure_is_fail_stop() {
        let mut m = ConversationMachine::new();
        m.handle(Input::StartContinuous).unwrap();
        let g = m.generation();
        m.handle(Input::SpeechEnded { generation: g }).unwrap();
        let error = VoiceError::RecognitionService("502".to_string());
        let fx = m
            .handle(Input::Recognized {
                generation: g,
                result: Err(error.clone()),
            })
            .unwrap();
        assert!(emitted(&fx).contains(&AssistantEvent::Error(error)));
        assert_eq!(m.state(), ConversationState::Error);
        assert!(!m.is_continuous());

        let fx = m.handle(Input::StartContinuous).unwrap();
        assert_eq!(
            fx[0],
            Effect::StartCapture {
                generation: m.generation()
            }
        );
        assert_ne!(m.generation(), g);
    }

    #[test]
    fn degraded_chunk_still_plays() {
        let mut m = ConversationMachine::new();
        m.handle(Input::Speak("hello".to_string())).unwrap();
        let g = m.generation();
        let fx = m
            .handle(Input::Synthesized {
                generation: g,
                text: "hello".to_string(),
                audio: chunk(),
                degraded: Some(VoiceError::SynthesisService("timeout".to_string())),
            })
            .unwrap();
        assert!(matches!(
            emitted(&fx).first(),
            Some(AssistantEvent::Degraded { .. })
        ));
        assert!(fx.iter().any(|e| matches!(e, Effect::Enqueue { .. })));
        m.handle(Input::SynthesisFinished { generation: g }).unwrap();
        m.handle(Input::PlaybackEnded { generation: g }).unwrap();
        assert_eq!(m.state(), ConversationState::Idle);
    }

    #[test]
    fn speak_and_text_command_acceptance() {
        let mut m = ConversationMachine::new();
        m.handle(Input::StartContinuous).unwrap();
        let g = m.generation();

        let fx = m.handle(Input::Speak("one".to_string())).unwrap();
        assert_eq!(fx[0], Effect::StopCapture);
        assert_eq!(m.state(), ConversationState::Speaking);
        // appending while speaking is fine
        m.handle(Input::Speak("two".to_string())).unwrap();
        assert!(matches!(
            m.handle(Input::TextCommand("hi".to_string())),
            Err(VoiceError::InvalidState(_))
        ));

        for _ in 0..2 {
            m.handle(Input::Synthesized {
                generation: g,
                text: String::new(),
                audio: chunk(),
                degraded: None,
            })
            .unwrap();
            m.handle(Input::SynthesisFinished { generation: g }).unwrap();
        }
        m.handle(Input::PlaybackEnded { generation: g }).unwrap();
        assert_eq!(m.state(), ConversationState::Speaking);
        m.handle(Input::PlaybackEnded { generation: g }).unwrap();
        assert_eq!(m.state(), ConversationState::Listening);

        m.handle(Input::SpeechEnded { generation: g }).unwrap();
        assert!(matches!(
            m.handle(Input::Speak("nope".to_string())),
            Err(VoiceError::InvalidState(_))
        ));
    }

    #[test]
    fn text_command_skips_recognition() {
        let mut m = ConversationMachine::new();
        let fx = m.handle(Input::TextCommand("quote for patio".to_string())).unwrap();
        let recognized = emitted(&fx)
            .into_iter()
            .find_map(|event| match event {
                AssistantEvent::SpeechRecognized(result) => Some(result),
                _ => None,
            })
            .expect("typed command is reported as recognized speech");
        assert_eq!(recognized.transcript, "quote for patio");
        assert_eq!(recognized.confidence, 1.0);
        assert!(recognized.is_final);
        assert!(fx.contains(&Effect::RequestReply {
            generation: 0,
            transcript: "quote for patio".to_string()
        }));
        let fx = m
            .handle(Input::Replied {
                generation: 0,
                reply: Ok(None),
            })
            .unwrap();
        assert!(emitted(&fx).contains(&AssistantEvent::SpeakingEnded));
        assert_eq!(m.state(), ConversationState::Idle);
    }

    #[test]
    fn listening_is_announced_once_capture_runs() {
        let mut m = ConversationMachine::new();
        let fx = m.handle(Input::StartContinuous).unwrap();
        let g = m.generation();
        assert!(!emitted(&fx).contains(&AssistantEvent::ListeningStarted));

        let fx = m.handle(Input::CaptureStarted { generation: g }).unwrap();
        assert_eq!(emitted(&fx), vec![AssistantEvent::ListeningStarted]);
        // repeated or stale reports change nothing
        assert!(m.handle(Input::CaptureStarted { generation: g }).unwrap().is_empty());
        assert!(m
            .handle(Input::CaptureStarted { generation: g - 1 })
            .unwrap()
            .is_empty());

        let fx = m.handle(Input::SpeechEnded { generation: g }).unwrap();
        assert!(emitted(&fx).contains(&AssistantEvent::ListeningEnded));
    }

    #[test]
    fn refused_microphone_never_announces_listening() {
        let mut m = ConversationMachine::new();
        m.handle(Input::StartContinuous).unwrap();
        let g = m.generation();
        let error = VoiceError::DeviceAccess("permission denied".to_string());
        let fx = m
            .handle(Input::Failed {
                generation: g,
                error: error.clone(),
            })
            .unwrap();
        let events = emitted(&fx);
        assert!(!events.contains(&AssistantEvent::ListeningEnded));
        assert!(events.contains(&AssistantEvent::Error(error)));
        assert!(fx.contains(&Effect::StopCapture));
        assert_eq!(m.state(), ConversationState::Error);
        assert!(!m.is_listening());
    }

    fn random_input(rng: &mut StdRng, current: Generation) -> Input {
        let generation = if rng.gen_bool(0.8) {
            current
        } else {
            current.saturating_sub(1)
        };
        match rng.gen_range(0..13) {
            0 => Input::StartContinuous,
            1 => Input::StopContinuous,
            2 => Input::TextCommand("text".to_string()),
            3 => Input::Speak("words".to_string()),
            4 => Input::SpeechStarted { generation },
            5 => Input::SpeechEnded { generation },
            6 => Input::Recognized {
                generation,
                result: match rng.gen_range(0..3) {
                    0 => Ok(transcript("")),
                    1 => Ok(transcript("hello")),
                    _ => Err(VoiceError::RecognitionService("down".to_string())),
                },
            },
            7 => Input::Replied {
                generation,
                reply: if rng.gen_bool(0.7) {
                    Ok(Some("reply".to_string()))
                } else {
                    Ok(None)
                },
            },
            8 => Input::Synthesized {
                generation,
                text: "reply".to_string(),
                audio: chunk(),
                degraded: None,
            },
            9 => Input::SynthesisFinished { generation },
            10 => Input::PlaybackEnded { generation },
            11 => Input::CaptureStarted { generation },
            _ => Input::Failed {
                generation,
                error: VoiceError::DeviceLost("unplugged".to_string()),
            },
        }
    }

    #[test]
    fn never_listens_and_speaks_at_once() {
        for seed in 0..200u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut m = ConversationMachine::new();
            for _ in 0..300 {
                let input = random_input(&mut rng, m.generation());
                let _ = m.handle(input);

                if m.is_listening() {
                    assert_eq!(m.state(), ConversationState::Listening, "seed {}", seed);
                }
                if m.playback_active() {
                    assert_eq!(m.state(), ConversationState::Speaking, "seed {}", seed);
                }
                assert!(!(m.is_listening() && m.is_speaking()), "seed {}", seed);
            }
        }
    }
}
