//! Session, Turn and Reply Models
//!
//! This module defines the data owned by the session controller and the wire
//! payloads exchanged with the remote agent.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Intent reported when the agent did not classify the utterance.
pub const NEUTRAL_INTENT: &str = "NEUTRAL";

/// Intent attached to the reply synthesized from the introduction.
pub const INTRO_INTENT: &str = "INTRO";

/// The legal states of the turn-taking state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    IntroPending,
    IntroReady,
    Recording,
    Sending,
    AwaitingReply,
}

impl SessionState {
    /// Whether a turn is occupying the session.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            SessionState::Recording | SessionState::Sending | SessionState::AwaitingReply
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionState::Idle => "idle",
            SessionState::IntroPending => "intro_pending",
            SessionState::IntroReady => "intro_ready",
            SessionState::Recording => "recording",
            SessionState::Sending => "sending",
            SessionState::AwaitingReply => "awaiting_reply",
        };
        f.write_str(label)
    }
}

/// Identifier the agent assigns to the lead during the introduction.
///
/// The agent may encode it as a JSON number or string; both are kept as text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "RawLeadId")]
pub struct LeadId(pub String);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawLeadId {
    Number(i64),
    Text(String),
}

impl From<RawLeadId> for LeadId {
    fn from(raw: RawLeadId) -> Self {
        match raw {
            RawLeadId::Number(n) => LeadId(n.to_string()),
            RawLeadId::Text(s) => LeadId(s),
        }
    }
}

impl fmt::Display for LeadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity and progress of one continuous interaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Session {
    pub phone: Option<String>,
    pub lead_id: Option<LeadId>,
    pub lead_name: Option<String>,
    pub intro_played: bool,
}

/// Monotonic identifier of a turn within the controller's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TurnId(pub u64);

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "turn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Idle,
    Recording,
    Sending,
    AwaitingReply,
    Complete,
    Failed,
}

impl TurnStatus {
    pub fn is_in_flight(&self) -> bool {
        matches!(self, TurnStatus::Sending | TurnStatus::AwaitingReply)
    }
}

/// One capture, transmit and reply cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub id: TurnId,
    pub status: TurnStatus,
    pub audio_payload: Vec<u8>,
    pub reply: Option<ReplyMessage>,
}

impl Turn {
    pub fn new(id: TurnId) -> Self {
        Self {
            id,
            status: TurnStatus::Idle,
            audio_payload: Vec::new(),
            reply: None,
        }
    }

    pub fn summary(&self) -> TurnSummary {
        TurnSummary {
            id: self.id,
            status: self.status,
            payload_bytes: self.audio_payload.len(),
        }
    }
}

/// Read-only view of the live turn, without its audio.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TurnSummary {
    pub id: TurnId,
    pub status: TurnStatus,
    pub payload_bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyKind {
    Reply,
    Error,
}

/// The agent's answer to a turn (or to the introduction).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplyMessage {
    pub kind: ReplyKind,
    pub user_transcript: Option<String>,
    pub intent: String,
    pub reply_text: Option<String>,
    pub audio_url: Option<String>,
    pub error_detail: Option<String>,
}

impl ReplyMessage {
    /// Builds the reply shown for the agent's opening line.
    pub fn from_introduction(intro: &Introduction) -> Self {
        Self {
            kind: ReplyKind::Reply,
            user_transcript: None,
            intent: INTRO_INTENT.to_string(),
            reply_text: Some(intro.text.clone()),
            audio_url: intro.audio_url.clone(),
            error_detail: None,
        }
    }
}

/// Result of a successful introduction exchange.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Introduction {
    pub lead_id: Option<LeadId>,
    #[serde(default)]
    pub lead_name: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default, alias = "audioReference")]
    pub audio_url: Option<String>,
}

/// The single text frame the agent sends back on a turn channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Reply {
        #[serde(default, rename = "userText")]
        user_text: Option<String>,
        #[serde(default)]
        intent: Option<String>,
        #[serde(default, rename = "replyText")]
        reply_text: Option<String>,
        #[serde(default, rename = "audioUrl")]
        audio_url: Option<String>,
    },
    Error {
        #[serde(default)]
        detail: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },
}

impl From<ServerFrame> for ReplyMessage {
    fn from(frame: ServerFrame) -> Self {
        match frame {
            ServerFrame::Reply {
                user_text,
                intent,
                reply_text,
                audio_url,
            } => ReplyMessage {
                kind: ReplyKind::Reply,
                user_transcript: user_text,
                intent: intent
                    .filter(|i| !i.is_empty())
                    .unwrap_or_else(|| NEUTRAL_INTENT.to_string()),
                reply_text,
                audio_url: audio_url.filter(|u| !u.is_empty()),
                error_detail: None,
            },
            ServerFrame::Error { detail, message } => ReplyMessage {
                kind: ReplyKind::Error,
                user_transcript: None,
                intent: NEUTRAL_INTENT.to_string(),
                reply_text: None,
                audio_url: None,
                error_detail: Some(
                    detail
                        .filter(|d| !d.trim().is_empty())
                        .or(message.filter(|m| !m.trim().is_empty()))
                        .unwrap_or_else(|| "The agent reported an unspecified error".to_string()),
                ),
            },
        }
    }
}

/// Read-only state published to observers after every transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub session: Session,
    pub active_turn: Option<TurnSummary>,
    pub last_reply: Option<ReplyMessage>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            session: Session::default(),
            active_turn: None,
            last_reply: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lead_id_accepts_number_and_string() {
        let intro: Introduction = serde_json::from_str(
            r#"{"leadId": 42, "leadName": "Ana", "text": "Hola Ana", "audioUrl": "http://x/a.mp3"}"#,
        )
        .unwrap();
        assert_eq!(intro.lead_id, Some(LeadId("42".into())));
        assert_eq!(intro.lead_name.as_deref(), Some("Ana"));

        let intro: Introduction =
            serde_json::from_str(r#"{"leadId": "L-7", "text": "Hola"}"#).unwrap();
        assert_eq!(intro.lead_id, Some(LeadId("L-7".into())));
        assert_eq!(intro.lead_name, None);
        assert_eq!(intro.audio_url, None);
    }

    #[test]
    fn test_introduction_audio_reference_alias() {
        let intro: Introduction = serde_json::from_str(
            r#"{"leadId": 1, "text": "Hola", "audioReference": "/audio/intro.mp3"}"#,
        )
        .unwrap();
        assert_eq!(intro.audio_url.as_deref(), Some("/audio/intro.mp3"));
    }

    #[test]
    fn test_reply_frame_defaults_intent_to_neutral() {
        let frame: ServerFrame =
            serde_json::from_str(r#"{"type": "reply", "userText": "hola", "replyText": "¡Hola!"}"#)
                .unwrap();
        let reply = ReplyMessage::from(frame);
        assert_eq!(reply.kind, ReplyKind::Reply);
        assert_eq!(reply.intent, NEUTRAL_INTENT);
        assert_eq!(reply.user_transcript.as_deref(), Some("hola"));
        assert_eq!(reply.audio_url, None);
    }

    #[test]
    fn test_error_frame_detail_precedence() {
        let frame: ServerFrame = serde_json::from_str(
            r#"{"type": "error", "message": "server error", "detail": "asr_failed"}"#,
        )
        .unwrap();
        assert_eq!(
            ReplyMessage::from(frame).error_detail.as_deref(),
            Some("asr_failed")
        );

        let frame: ServerFrame =
            serde_json::from_str(r#"{"type": "error", "message": "server error"}"#).unwrap();
        assert_eq!(
            ReplyMessage::from(frame).error_detail.as_deref(),
            Some("server error")
        );

        // Blank fields fall through to the next one.
        let frame: ServerFrame = serde_json::from_str(
            r#"{"type": "error", "message": "Error procesando el audio en el servidor", "detail": ""}"#,
        )
        .unwrap();
        assert_eq!(
            ReplyMessage::from(frame).error_detail.as_deref(),
            Some("Error procesando el audio en el servidor")
        );

        let frame: ServerFrame =
            serde_json::from_str(r#"{"type": "error", "message": " ", "detail": ""}"#).unwrap();
        assert_eq!(
            ReplyMessage::from(frame).error_detail.as_deref(),
            Some("The agent reported an unspecified error")
        );

        let frame: ServerFrame = serde_json::from_str(r#"{"type": "error"}"#).unwrap();
        assert!(ReplyMessage::from(frame).error_detail.is_some());
    }

    #[test]
    fn test_unknown_frame_type_is_rejected() {
        assert!(serde_json::from_str::<ServerFrame>(r#"{"type": "progress"}"#).is_err());
        assert!(serde_json::from_str::<ServerFrame>(r#"{"userText": "hola"}"#).is_err());
    }

    #[test]
    fn test_session_state_display() {
        assert_eq!(SessionState::IntroReady.to_string(), "intro_ready");
        assert_eq!(SessionState::AwaitingReply.to_string(), "awaiting_reply");
        assert!(SessionState::Sending.is_busy());
        assert!(!SessionState::IntroReady.is_busy());
    }
}
