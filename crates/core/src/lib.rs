//! Walkie Core
//!
//! Turn-taking session controller for a push-to-talk voice client: play the
//! agent's introduction, then repeatedly capture an utterance, send it to the
//! agent, and play back the spoken reply.

pub mod capture;
pub mod error;
pub mod models;
pub mod playback;
pub mod session;
pub mod transport;

pub use error::SessionError;
pub use session::{SessionController, TurnHandle, TurnOutcome};

use models::{ReplyMessage, TurnId};

/// Discrete notifications the controller publishes for the presentation layer.
///
/// State itself is observed through snapshots; these events carry what a
/// snapshot cannot, such as failures and playback transitions.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The introduction succeeded; its audio (if any) is playing.
    IntroPlayed { lead_name: Option<String> },
    TurnStarted(TurnId),
    TurnSent(TurnId),
    TurnAbandoned(TurnId),
    ReplyReceived { turn: TurnId, reply: ReplyMessage },
    /// A turn or the introduction failed. `turn` is `None` for the introduction.
    TurnFailed {
        turn: Option<TurnId>,
        error: SessionError,
    },
    PlaybackStarted(String),
    PlaybackStopped { interrupted: bool },
    PlaybackFailed(SessionError),
}
