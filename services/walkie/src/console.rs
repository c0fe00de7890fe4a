//! Line-driven presentation layer.
//!
//! Reads operator commands from stdin and forwards them to the session
//! controller. A separate render task prints replies and failures as the
//! controller publishes them, so the prompt stays responsive while a turn is
//! in flight.

use anyhow::Context;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::{broadcast, watch},
};
use tracing::{debug, warn};
use walkie_core::{
    SessionController, SessionError, SessionEvent,
    models::{ReplyMessage, SessionSnapshot, SessionState},
};

pub const HELP: &str = "\
Commands:
  intro <phone>   request the agent's introduction
  <Enter>         start talking / send what you said
  stop            silence the agent
  cancel          give up on the current turn
  status          show the session state
  quit            leave";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Intro(String),
    PushToTalk,
    StopPlayback,
    Cancel,
    Status,
    Help,
    Quit,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("Usage: intro <phone>")]
    MissingPhone,
    #[error("Unknown command '{0}'. Type 'help' for the list of commands.")]
    Unknown(String),
}

pub fn parse_command(line: &str) -> Result<Command, CommandError> {
    let line = line.trim();
    let (word, rest) = line
        .split_once(char::is_whitespace)
        .map(|(word, rest)| (word, rest.trim()))
        .unwrap_or((line, ""));

    match word.to_lowercase().as_str() {
        "" => Ok(Command::PushToTalk),
        "intro" if rest.is_empty() => Err(CommandError::MissingPhone),
        "intro" => Ok(Command::Intro(rest.to_string())),
        "stop" => Ok(Command::StopPlayback),
        "cancel" => Ok(Command::Cancel),
        "status" => Ok(Command::Status),
        "help" | "?" => Ok(Command::Help),
        "quit" | "exit" => Ok(Command::Quit),
        _ => Err(CommandError::Unknown(line.to_string())),
    }
}

/// Applies operator commands to one session.
pub struct Console {
    session: SessionController,
}

impl Console {
    pub fn new(session: SessionController) -> Self {
        Self { session }
    }

    /// Applies `command`. Returns `false` once the operator asked to leave.
    pub async fn dispatch(&self, command: Command) -> bool {
        debug!(?command, "Console command");
        match command {
            Command::Intro(phone) => {
                let session = self.session.clone();
                tokio::spawn(async move {
                    if let Err(e) = session.request_intro(&phone).await {
                        report(&e);
                    }
                });
            }
            Command::PushToTalk => {
                let result = if self.session.state().await == SessionState::Recording {
                    self.session.end_turn().await.map(|_| ())
                } else {
                    self.session.begin_turn().await.map(|_| ())
                };
                if let Err(e) = result {
                    report(&e);
                }
            }
            Command::StopPlayback => self.session.interrupt_playback(),
            Command::Cancel => {
                if let Err(e) = self.session.abandon_turn().await {
                    report(&e);
                }
            }
            Command::Status => println!("{}", describe_snapshot(&self.session.snapshot().await)),
            Command::Help => println!("{}", HELP),
            Command::Quit => {
                self.session.interrupt_playback();
                return false;
            }
        }
        true
    }
}

/// Prints caller mistakes. Everything else reaches the operator as an event.
fn report(error: &SessionError) {
    if !error.is_recoverable() {
        println!("{}", error);
    }
}

pub fn format_reply(reply: &ReplyMessage) -> String {
    let mut out = String::new();
    if let Some(transcript) = reply.user_transcript.as_deref().filter(|t| !t.is_empty()) {
        out.push_str(&format!("You: {}\n", transcript));
    }
    out.push_str(&format!(
        "Agent [{}]: {}",
        reply.intent,
        reply.reply_text.as_deref().unwrap_or("(no text)")
    ));
    out
}

pub fn describe_event(event: &SessionEvent) -> Option<String> {
    match event {
        SessionEvent::IntroPlayed {
            lead_name: Some(name),
        } => Some(format!("Connected with {}. Press Enter to talk.", name)),
        SessionEvent::IntroPlayed { lead_name: None } => {
            Some("Connected. Press Enter to talk.".to_string())
        }
        SessionEvent::TurnStarted(turn) => {
            Some(format!("Recording {}... press Enter to send.", turn))
        }
        SessionEvent::TurnSent(turn) => Some(format!("Sending {}...", turn)),
        SessionEvent::TurnAbandoned(turn) => Some(format!("Gave up on {}.", turn)),
        SessionEvent::TurnFailed { error, .. } => Some(format!("Error: {}", error)),
        SessionEvent::PlaybackStopped { interrupted: true } => {
            Some("(agent interrupted)".to_string())
        }
        SessionEvent::PlaybackFailed(error) => Some(format!("Error: {}", error)),
        SessionEvent::ReplyReceived { .. }
        | SessionEvent::PlaybackStarted(_)
        | SessionEvent::PlaybackStopped { interrupted: false } => None,
    }
}

pub fn describe_snapshot(snapshot: &SessionSnapshot) -> String {
    let lead = snapshot
        .session
        .lead_name
        .as_deref()
        .unwrap_or("no lead yet");
    match &snapshot.active_turn {
        Some(turn) => format!(
            "State: {} | Lead: {} | Last turn: {} ({:?})",
            snapshot.state, lead, turn.id, turn.status
        ),
        None => format!("State: {} | Lead: {}", snapshot.state, lead),
    }
}

/// Prints every new reply and every event worth showing until the controller goes away.
pub async fn render(
    mut snapshots: watch::Receiver<SessionSnapshot>,
    mut events: broadcast::Receiver<SessionEvent>,
) {
    let mut shown = snapshots.borrow_and_update().last_reply.clone();
    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let latest = snapshots.borrow_and_update().last_reply.clone();
                if latest != shown {
                    if let Some(reply) = &latest {
                        println!("{}", format_reply(reply));
                    }
                    shown = latest;
                }
            }
            event = events.recv() => match event {
                Ok(event) => {
                    if let Some(line) = describe_event(&event) {
                        println!("{}", line);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Console fell behind on session events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

/// Runs the console until `quit` or end of input.
pub async fn run(session: SessionController, phone: Option<String>) -> anyhow::Result<()> {
    let renderer = tokio::spawn(render(session.subscribe(), session.events()));
    let console = Console::new(session);
    println!("{}", HELP);

    if let Some(phone) = phone {
        console.dispatch(Command::Intro(phone)).await;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines
        .next_line()
        .await
        .context("Failed to read from stdin")?
    {
        match parse_command(&line) {
            Ok(command) => {
                if !console.dispatch(command).await {
                    break;
                }
            }
            Err(e) => println!("{}", e),
        }
    }

    renderer.abort();
    Ok(())
}
