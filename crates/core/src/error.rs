//! Failure taxonomy for the session controller and its collaborators.

use crate::models::SessionState;

/// Every failure a turn, an introduction, or a device can surface.
///
/// The type is `Clone` so a single failure can be returned to the caller and
/// broadcast to observers at the same time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Cannot {operation} while the session is {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("The recording is empty, nothing was sent")]
    EmptyCapture,
    #[error("The agent is unreachable: {0}")]
    RemoteUnavailable(String),
    #[error("Connection to the agent failed: {0}")]
    Transport(String),
    #[error("The agent sent an invalid reply: {0}")]
    MalformedReply(String),
    #[error("{0}")]
    RemoteReported(String),
    #[error("Could not play the agent's audio: {0}")]
    PlaybackFailed(String),
}

impl SessionError {
    /// Caller mistakes are not recoverable by retrying the same call.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            SessionError::InvalidInput(_) | SessionError::InvalidState { .. }
        )
    }

    /// A stable, machine-friendly label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::InvalidInput(_) => "invalid_input",
            SessionError::InvalidState { .. } => "invalid_state",
            SessionError::DeviceUnavailable(_) => "device_unavailable",
            SessionError::EmptyCapture => "empty_capture",
            SessionError::RemoteUnavailable(_) => "remote_unavailable",
            SessionError::Transport(_) => "transport_error",
            SessionError::MalformedReply(_) => "malformed_reply",
            SessionError::RemoteReported(_) => "remote_reported_error",
            SessionError::PlaybackFailed(_) => "playback_failed",
        }
    }
}
