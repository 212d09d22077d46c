//! Energy-based voice activity detection
//!
//! The detector is fed one volume reading (0–100, see [`crate::meter`]) per poll
//! tick and decides when an utterance starts and ends. It owns the only timing
//! state of the capture path: when speech started and when voice was last heard.

use crate::config::VadConfig;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Transition reported by [`VoiceActivityDetector::observe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    /// Volume rose above the threshold after silence
    SpeechStart,
    /// Utterance finished. `forced` is set when the max-duration cap ended it.
    SpeechEnd { duration: Duration, forced: bool },
    /// Utterance shorter than the minimum; treated as noise
    Discarded { duration: Duration },
}

/// Snapshot for status displays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VadStatus {
    pub has_speech: bool,
    pub speech_duration: Duration,
}

#[derive(Debug, Clone, Copy)]
struct VoiceWindow {
    speech_start: Instant,
    last_voice: Instant,
}

pub struct VoiceActivityDetector {
    config: VadConfig,
    window: Option<VoiceWindow>,
}

impl VoiceActivityDetector {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            window: None,
        }
    }

    pub fn config(&self) -> &VadConfig {
        &self.config
    }

    /// Replace thresholds. An utterance in progress keeps its timestamps.
    pub fn update_config(&mut self, config: VadConfig) {
        self.config = config;
    }

    pub fn reset(&mut self) {
        self.window = None;
    }

    pub fn in_speech(&self) -> bool {
        self.window.is_some()
    }

    pub fn status(&self, now: Instant) -> VadStatus {
        match self.window {
            Some(w) => VadStatus {
                has_speech: true,
                speech_duration: now.saturating_duration_since(w.speech_start),
            },
            None => VadStatus::default(),
        }
    }

    /// Feed one volume reading taken at `now`
    pub fn observe(&mut self, volume: f32, now: Instant) -> Option<VadEvent> {
        let speaking = volume > self.config.volume_threshold;

        let Some(mut window) = self.window else {
            if speaking {
                debug!(volume, "Speech start");
                self.window = Some(VoiceWindow {
                    speech_start: now,
                    last_voice: now,
                });
                return Some(VadEvent::SpeechStart);
            }
            return None;
        };

        if speaking {
            window.last_voice = now;
            self.window = Some(window);
        }

        let elapsed = now.saturating_duration_since(window.speech_start);
        if elapsed >= self.config.max_speech_duration() {
            debug!(?elapsed, "Speech hit max duration");
            self.window = None;
            return Some(VadEvent::SpeechEnd {
                duration: elapsed,
                forced: true,
            });
        }

        if !speaking {
            let silence = now.saturating_duration_since(window.last_voice);
            if silence >= self.config.silence_duration_threshold() {
                let duration = window.last_voice.saturating_duration_since(window.speech_start);
                self.window = None;
                if duration >= self.config.min_speech_duration() {
                    debug!(?duration, "Speech end");
                    return Some(VadEvent::SpeechEnd {
                        duration,
                        forced: false,
                    });
                }
                debug!(?duration, "Speech too short, discarded");
                return Some(VadEvent::Discarded { duration });
            }
        }
        None
    }
}
