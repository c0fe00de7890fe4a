//! Transport Client
//!
//! Two independent exchanges with the remote agent, sharing no connection state:
//!
//! - the introduction: one HTTP `GET /intro?phone=..` returning the lead identity
//!   and the agent's opening line;
//! - the turn: a fresh WebSocket per turn at `/ws/voice[?lead_id=..]`. The audio
//!   goes out as one binary frame, exactly one text frame comes back, then the
//!   client closes the channel.

use crate::{
    error::SessionError,
    models::{Introduction, LeadId, ReplyKind, ReplyMessage, ServerFrame},
};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::protocol::Message as WsMessage,
};
use tracing::{debug, info, instrument, warn};

/// The remote agent, as seen by the session controller.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// Performs the introduction exchange for `phone`.
    async fn introduce(&self, phone: &str) -> Result<Introduction, SessionError>;

    /// Opens a fresh turn channel, optionally correlated to a known lead.
    ///
    /// Resolves once the channel is acknowledged open.
    async fn open_turn(&self, lead_id: Option<LeadId>)
    -> Result<Box<dyn TurnChannel>, SessionError>;
}

/// An open turn channel. Consumed by its single exchange.
#[async_trait]
pub trait TurnChannel: Send {
    /// Sends the recording and waits for the one reply frame.
    async fn exchange(self: Box<Self>, audio: Vec<u8>) -> Result<ReplyMessage, SessionError>;
}

/// Where the agent lives and how long HTTP calls may take.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub http_base: Url,
    pub ws_base: Url,
    pub request_timeout: Duration,
}

impl TransportConfig {
    /// Builds a config whose WebSocket base is derived from the HTTP base.
    pub fn from_http_base(http_base: Url, request_timeout: Duration) -> Result<Self, SessionError> {
        let ws_base = derive_ws_base(&http_base)?;
        Ok(Self {
            http_base,
            ws_base,
            request_timeout,
        })
    }
}

/// Maps `http`/`https` to `ws`/`wss`, keeping host, port and path.
pub fn derive_ws_base(http_base: &Url) -> Result<Url, SessionError> {
    let scheme = match http_base.scheme() {
        "http" => "ws",
        "https" => "wss",
        "ws" | "wss" => return Ok(http_base.clone()),
        other => {
            return Err(SessionError::InvalidInput(format!(
                "unsupported agent URL scheme '{}'",
                other
            )));
        }
    };
    let rest = &http_base.as_str()[http_base.scheme().len()..];
    Url::parse(&format!("{}{}", scheme, rest))
        .map_err(|e| SessionError::InvalidInput(format!("invalid agent URL: {}", e)))
}

fn endpoint(base: &Url, path: &str) -> Result<Url, SessionError> {
    let joined = format!("{}/{}", base.as_str().trim_end_matches('/'), path);
    Url::parse(&joined)
        .map_err(|e| SessionError::InvalidInput(format!("invalid agent URL '{}': {}", joined, e)))
}

/// Resolves an audio reference that may be relative to the agent's HTTP base.
pub fn resolve_audio_url(base: &Url, reference: Option<String>) -> Option<String> {
    let reference = reference.filter(|r| !r.trim().is_empty())?;
    if Url::parse(&reference).is_ok() {
        return Some(reference);
    }
    match base.join(&reference) {
        Ok(url) => Some(url.to_string()),
        Err(e) => {
            warn!(%reference, error = %e, "Could not resolve audio reference");
            Some(reference)
        }
    }
}

/// Parses the agent's reply frame.
///
/// A frame whose kind is `error` is turned into [`SessionError::RemoteReported`].
pub fn decode_reply(text: &str) -> Result<ReplyMessage, SessionError> {
    let frame: ServerFrame = serde_json::from_str(text)
        .map_err(|e| SessionError::MalformedReply(e.to_string()))?;
    let reply = ReplyMessage::from(frame);
    match reply.kind {
        ReplyKind::Reply => Ok(reply),
        ReplyKind::Error => Err(SessionError::RemoteReported(
            reply.error_detail.unwrap_or_default(),
        )),
    }
}

/// The production transport: `reqwest` for the introduction, `tokio-tungstenite`
/// for turn channels.
pub struct HttpAgentTransport {
    http: reqwest::Client,
    config: TransportConfig,
}

impl HttpAgentTransport {
    pub fn new(config: TransportConfig) -> Result<Self, SessionError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SessionError::RemoteUnavailable(e.to_string()))?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn intro_url(&self, phone: &str) -> Result<Url, SessionError> {
        let mut url = endpoint(&self.config.http_base, "intro")?;
        url.query_pairs_mut().append_pair("phone", phone);
        Ok(url)
    }

    pub fn turn_url(&self, lead_id: Option<&LeadId>) -> Result<Url, SessionError> {
        let mut url = endpoint(&self.config.ws_base, "ws/voice")?;
        if let Some(lead_id) = lead_id {
            url.query_pairs_mut().append_pair("lead_id", &lead_id.0);
        }
        Ok(url)
    }

    /// Probes the agent's `/health` endpoint.
    pub async fn check_health(&self) -> Result<(), SessionError> {
        let url = endpoint(&self.config.http_base, "health")?;
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| SessionError::RemoteUnavailable(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(SessionError::RemoteUnavailable(format!(
                "health check returned {}",
                response.status()
            )))
        }
    }
}

#[async_trait]
impl AgentTransport for HttpAgentTransport {
    #[instrument(name = "introduce", skip(self))]
    async fn introduce(&self, phone: &str) -> Result<Introduction, SessionError> {
        let url = self.intro_url(phone)?;
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| SessionError::RemoteUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SessionError::RemoteUnavailable(format!(
                "introduction request failed with status {}",
                status
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| SessionError::RemoteUnavailable(e.to_string()))?;
        let mut intro: Introduction = serde_json::from_str(&body)
            .map_err(|e| SessionError::MalformedReply(e.to_string()))?;
        intro.audio_url = resolve_audio_url(&self.config.http_base, intro.audio_url);

        info!(lead_id = ?intro.lead_id, lead_name = ?intro.lead_name, "Introduction received");
        Ok(intro)
    }

    async fn open_turn(
        &self,
        lead_id: Option<LeadId>,
    ) -> Result<Box<dyn TurnChannel>, SessionError> {
        let url = self.turn_url(lead_id.as_ref())?;
        let (socket, _) = connect_async(url.as_str())
            .await
            .map_err(|e| SessionError::Transport(format!("failed to open turn channel: {}", e)))?;
        info!(%url, "Turn channel open");
        Ok(Box::new(WsTurnChannel {
            socket,
            audio_base: self.config.http_base.clone(),
        }))
    }
}

struct WsTurnChannel {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    audio_base: Url,
}

#[async_trait]
impl TurnChannel for WsTurnChannel {
    async fn exchange(self: Box<Self>, audio: Vec<u8>) -> Result<ReplyMessage, SessionError> {
        let WsTurnChannel { socket, audio_base } = *self;
        let (mut ws_tx, mut ws_rx) = socket.split();

        let bytes = audio.len();
        ws_tx
            .send(WsMessage::Binary(audio.into()))
            .await
            .map_err(|e| SessionError::Transport(format!("failed to send audio: {}", e)))?;
        debug!(bytes, "Audio frame sent, awaiting reply");

        // The first message ends the exchange, whatever it contains.
        let outcome = loop {
            match ws_rx.next().await {
                Some(Ok(WsMessage::Text(text))) => break decode_reply(&text),
                Some(Ok(WsMessage::Binary(_))) => {
                    break Err(SessionError::MalformedReply(
                        "expected a text frame, received binary".to_string(),
                    ));
                }
                Some(Ok(WsMessage::Close(close_frame))) => {
                    break Err(SessionError::Transport(format!(
                        "channel closed before a reply arrived ({:?})",
                        close_frame
                    )));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => break Err(SessionError::Transport(e.to_string())),
                None => {
                    break Err(SessionError::Transport(
                        "channel closed before a reply arrived".to_string(),
                    ));
                }
            }
        };

        if let Err(e) = ws_tx.close().await {
            debug!(error = %e, "Turn channel was already closed");
        }

        outcome.map(|mut reply| {
            reply.audio_url = resolve_audio_url(&audio_base, reply.audio_url);
            reply
        })
    }
}
