//! What the console shows: connection badge, conversation status, toasts

use landcrm_voice::{AssistantEvent, AssistantSnapshot, ConversationState, VoiceError};
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "⚪ disconnected"),
            ConnectionStatus::Connecting => write!(f, "🟡 connecting"),
            ConnectionStatus::Connected => write!(f, "🟢 connected"),
            ConnectionStatus::Error(reason) => write!(f, "🔴 error: {}", reason),
        }
    }
}

/// One line of operator input
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Start,
    Stop,
    Say(String),
    Volume(f32),
    State,
    Health,
    Help,
    Quit,
    /// Anything that is not a slash command goes to the assistant as text
    Text(String),
    Invalid(String),
}

impl ConsoleCommand {
    /// `None` for blank lines
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        if !line.starts_with('/') {
            return Some(ConsoleCommand::Text(line.to_string()));
        }
        let (name, rest) = match line.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (line, ""),
        };
        let command = match name {
            "/start" => ConsoleCommand::Start,
            "/stop" => ConsoleCommand::Stop,
            "/say" if !rest.is_empty() => ConsoleCommand::Say(rest.to_string()),
            "/say" => ConsoleCommand::Invalid("usage: /say <text>".to_string()),
            "/volume" => match rest.parse::<f32>() {
                Ok(volume) if volume.is_finite() => ConsoleCommand::Volume(volume),
                _ => ConsoleCommand::Invalid("usage: /volume <0..1>".to_string()),
            },
            "/state" => ConsoleCommand::State,
            "/health" => ConsoleCommand::Health,
            "/help" => ConsoleCommand::Help,
            "/quit" | "/exit" => ConsoleCommand::Quit,
            other => ConsoleCommand::Invalid(format!("unknown command {}", other)),
        };
        Some(command)
    }
}

pub const HELP: &str = "commands: /start  /stop  /say <text>  /volume <0..1>  /state  /health  /quit\n\
                        anything else is sent to the assistant as a text command";

/// Error toast shown to the operator
pub fn toast(error: &VoiceError) -> String {
    let hint = match error {
        VoiceError::DeviceAccess(_) => " (check the microphone and its permissions)",
        VoiceError::Initialization(_) => " (set VOICEKIT_API_KEY and VOICEKIT_SECRET_KEY)",
        VoiceError::ServiceUnavailable(_) => " (speech services unreachable)",
        _ => "",
    };
    let restart = if error.is_fatal() {
        " - /start to try again"
    } else {
        ""
    };
    format!("❌ {}{}{}", error, hint, restart)
}

/// Status the console keeps between events
#[derive(Debug, Clone)]
pub struct ConsoleStatus {
    pub connection: ConnectionStatus,
    pub state: ConversationState,
    pub listening: bool,
    pub speaking: bool,
}

impl Default for ConsoleStatus {
    fn default() -> Self {
        Self {
            connection: ConnectionStatus::Disconnected,
            state: ConversationState::Idle,
            listening: false,
            speaking: false,
        }
    }
}

impl ConsoleStatus {
    /// Fold an event into the status; returns the line to print, if any
    pub fn apply(&mut self, event: &AssistantEvent) -> Option<String> {
        match event {
            AssistantEvent::StateChanged(state) => {
                self.state = *state;
                None
            }
            AssistantEvent::ListeningStarted => {
                self.listening = true;
                Some("🎤 listening...".to_string())
            }
            AssistantEvent::ListeningEnded => {
                self.listening = false;
                None
            }
            AssistantEvent::SpeechStarted => Some("🗣️  speech detected".to_string()),
            AssistantEvent::SpeechEnded => Some("⏳ recognizing...".to_string()),
            AssistantEvent::SpeechRecognized(result) => Some(format!(
                "👤 {} ({:.0}%)",
                result.transcript,
                result.confidence * 100.0
            )),
            AssistantEvent::ResponseReceived(text) => Some(format!("🤖 {}", text)),
            AssistantEvent::SpeakingStarted => {
                self.speaking = true;
                None
            }
            AssistantEvent::SpeakingEnded => {
                self.speaking = false;
                None
            }
            AssistantEvent::Degraded { text, error } => Some(format!(
                "⚠️  could not voice \"{}\": {}",
                text, error
            )),
            AssistantEvent::Error(error) => Some(toast(error)),
        }
    }

    pub fn status_line(&self) -> String {
        let activity = if self.listening {
            "🎤 listening"
        } else if self.speaking {
            "🔊 speaking"
        } else {
            "💤 quiet"
        };
        format!("[{}] {} | {}", self.connection, self.state, activity)
    }
}

pub fn render_snapshot(snapshot: &AssistantSnapshot) -> String {
    format!(
        "state={} continuous={} listening={} speaking={} recording={} speech={:?} playing={} queued={} volume={:.2}",
        snapshot.state,
        snapshot.continuous,
        snapshot.listening,
        snapshot.speaking,
        snapshot.recording.is_recording,
        snapshot.recording.speech_duration,
        snapshot.playback.is_playing,
        snapshot.playback.queued,
        snapshot.playback.volume,
    )
}
