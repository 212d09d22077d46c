//! LandCRM voice console
//!
//! Terminal stand-in for the CRM's voice widget: shows connection and
//! conversation status, prints what was heard and answered, and forwards
//! operator commands to the assistant.

mod status;

use anyhow::Context;
use async_trait::async_trait;
use landcrm_voice::{ReplyGenerator, VoiceAssistant, VoiceResult, VoiceSettings};
use status::{render_snapshot, toast, ConnectionStatus, ConsoleCommand, ConsoleStatus, HELP};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// The real reply comes from the CRM's business layer; the console just echoes.
struct EchoReply;

#[async_trait]
impl ReplyGenerator for EchoReply {
    async fn reply(&self, transcript: &str) -> VoiceResult<Option<String>> {
        Ok(Some(format!("You said: {}", transcript)))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[landcrm-voice] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let status = Arc::new(Mutex::new(ConsoleStatus::default()));
    set_connection(&status, ConnectionStatus::Connecting);

    let settings = VoiceSettings::load().context("loading voice settings")?;
    let (mut assistant, mut events) = match VoiceAssistant::initialize(&settings, Arc::new(EchoReply)) {
        Ok(started) => started,
        Err(e) => {
            println!("{}", toast(&e));
            set_connection(&status, ConnectionStatus::Error(e.to_string()));
            return Err(e).context("initializing the voice assistant");
        }
    };

    let info = assistant.connection().info();
    println!(
        "🔑 {} key {} | stt {} | tts {}",
        info.provider, info.api_key, info.stt_url, info.tts_url
    );
    if assistant.check_health().await {
        set_connection(&status, ConnectionStatus::Connected);
    } else {
        set_connection(
            &status,
            ConnectionStatus::Error("health check failed".to_string()),
        );
    }
    println!("{}", HELP);

    let printer_status = status.clone();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let mut status = lock(&printer_status);
            if let Some(line) = status.apply(&event) {
                println!("{}", line);
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("reading stdin")?,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("CTRL-C received; shutting down");
                break;
            }
        };
        let Some(line) = line else { break };
        let Some(command) = ConsoleCommand::parse(&line) else {
            continue;
        };

        let outcome = match command {
            ConsoleCommand::Start => assistant.start_continuous_mode().await,
            ConsoleCommand::Stop => assistant.stop_continuous_mode().await,
            ConsoleCommand::Say(text) => assistant.speak(text).await,
            ConsoleCommand::Text(text) => assistant.process_text_command(text).await,
            ConsoleCommand::Volume(volume) => assistant.set_volume(volume).await.map(|applied| {
                println!("🔊 volume {:.2}", applied);
            }),
            ConsoleCommand::State => assistant.snapshot().await.map(|snapshot| {
                println!("{}", render_snapshot(&snapshot));
                println!("{}", lock(&status).status_line());
            }),
            ConsoleCommand::Health => {
                let healthy = assistant.check_health().await;
                set_connection(
                    &status,
                    if healthy {
                        ConnectionStatus::Connected
                    } else {
                        ConnectionStatus::Error("health check failed".to_string())
                    },
                );
                Ok(())
            }
            ConsoleCommand::Help => {
                println!("{}", HELP);
                Ok(())
            }
            ConsoleCommand::Invalid(message) => {
                println!("⚠️  {}", message);
                Ok(())
            }
            ConsoleCommand::Quit => break,
        };
        if let Err(e) = outcome {
            println!("{}", toast(&e));
        }
    }

    assistant.shutdown().await;
    printer.abort();
    set_connection(&status, ConnectionStatus::Disconnected);
    Ok(())
}

fn lock(status: &Mutex<ConsoleStatus>) -> std::sync::MutexGuard<'_, ConsoleStatus> {
    status.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn set_connection(status: &Mutex<ConsoleStatus>, connection: ConnectionStatus) {
    let mut status = lock(status);
    status.connection = connection;
    println!("{}", status.status_line());
}
