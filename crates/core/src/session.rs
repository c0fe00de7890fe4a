//! Session Controller
//!
//! The only writer of session state. It sequences introduction playback,
//! push-to-talk capture, turn exchanges and reply playback, and enforces the
//! invariants of the turn-taking state machine:
//!
//! - at most one turn is live at any time;
//! - a barge-in interrupts playback before capture starts;
//! - every failure returns the session to its last stable state;
//! - a reply whose turn is no longer the active one is dropped.
//!
//! Transitions run under one async mutex and are never held across a network
//! await, so the controller stays responsive while an exchange is in flight.

use crate::{
    SessionEvent,
    capture::{CaptureDevice, CaptureManager, CapturedAudio},
    error::SessionError,
    models::{
        LeadId, ReplyMessage, Session, SessionSnapshot, SessionState, Turn, TurnId, TurnStatus,
    },
    playback::{PlaybackController, PlaybackDevice},
    transport::AgentTransport,
};
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::{Mutex, broadcast, watch},
    task::JoinHandle,
};
use tracing::{Instrument, debug, info, info_span, instrument, warn};

const EVENT_CAPACITY: usize = 64;

/// How a dispatched turn ended, from the point of view of its caller.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Replied(ReplyMessage),
    Failed(SessionError),
    /// The turn was superseded before its exchange resolved; its result was dropped.
    Discarded,
}

/// A dispatched turn exchange. Awaiting it is optional.
pub struct TurnHandle {
    pub turn_id: TurnId,
    task: JoinHandle<TurnOutcome>,
}

impl TurnHandle {
    pub async fn outcome(self) -> TurnOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => TurnOutcome::Failed(SessionError::Transport(format!(
                "turn task aborted: {}",
                e
            ))),
        }
    }
}

/// Everything guarded by the transition lock.
struct SessionCore {
    state: SessionState,
    session: Session,
    turn: Option<Turn>,
    last_reply: Option<ReplyMessage>,
    capture: CaptureManager,
}

impl SessionCore {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            session: self.session.clone(),
            active_turn: self.turn.as_ref().map(Turn::summary),
            last_reply: self.last_reply.clone(),
        }
    }

    /// The in-flight turn with this id, if it is still the active one.
    fn in_flight_turn(&mut self, turn_id: TurnId) -> Option<&mut Turn> {
        self.turn
            .as_mut()
            .filter(|turn| turn.id == turn_id && turn.status.is_in_flight())
    }

    fn fail_turn(&mut self) {
        if let Some(turn) = self.turn.as_mut() {
            turn.status = TurnStatus::Failed;
            turn.audio_payload.clear();
        }
        self.state = SessionState::IntroReady;
    }
}

struct Inner {
    core: Mutex<SessionCore>,
    transport: Arc<dyn AgentTransport>,
    playback: PlaybackController,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    events_tx: broadcast::Sender<SessionEvent>,
    turn_deadline: Option<Duration>,
    next_turn: AtomicU64,
}

impl Inner {
    fn publish(&self, core: &SessionCore) {
        self.snapshot_tx.send_replace(core.snapshot());
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events_tx.send(event);
    }

    fn surface(&self, turn: Option<TurnId>, error: SessionError) -> SessionError {
        warn!(kind = error.kind(), error = %error, ?turn, "Turn failed");
        self.emit(SessionEvent::TurnFailed {
            turn,
            error: error.clone(),
        });
        error
    }

    async fn mark_awaiting(&self, turn_id: TurnId) {
        let mut core = self.core.lock().await;
        if let Some(turn) = core.in_flight_turn(turn_id) {
            turn.status = TurnStatus::AwaitingReply;
            core.state = SessionState::AwaitingReply;
            self.publish(&core);
            debug!(%turn_id, "Awaiting reply");
        }
    }

    /// Abandons `turn_id` if it is still in flight. Returns whether it was.
    async fn expire(&self, turn_id: TurnId, error: SessionError) -> bool {
        let mut core = self.core.lock().await;
        if core.in_flight_turn(turn_id).is_none() {
            return false;
        }
        core.fail_turn();
        self.publish(&core);
        drop(core);
        self.surface(Some(turn_id), error);
        true
    }

    /// Applies a resolved exchange, unless the turn has been superseded.
    async fn settle(
        &self,
        turn_id: TurnId,
        result: Result<ReplyMessage, SessionError>,
    ) -> TurnOutcome {
        let mut core = self.core.lock().await;
        let Some(turn) = core.in_flight_turn(turn_id) else {
            debug!(%turn_id, "Dropping stale reply");
            return TurnOutcome::Discarded;
        };

        match result {
            Ok(reply) => {
                turn.status = TurnStatus::Complete;
                turn.reply = Some(reply.clone());
                turn.audio_payload.clear();
                core.last_reply = Some(reply.clone());
                core.state = SessionState::IntroReady;
                info!(%turn_id, intent = %reply.intent, "Reply received");
                // Started under the lock so a barge-in can only come after it.
                if let Some(audio_url) = reply.audio_url.clone() {
                    self.playback.play(audio_url);
                }
                self.publish(&core);
                drop(core);

                self.emit(SessionEvent::ReplyReceived {
                    turn: turn_id,
                    reply: reply.clone(),
                });
                TurnOutcome::Replied(reply)
            }
            Err(error) => {
                core.fail_turn();
                self.publish(&core);
                drop(core);
                TurnOutcome::Failed(self.surface(Some(turn_id), error))
            }
        }
    }

    async fn run_exchange(
        self: Arc<Self>,
        turn_id: TurnId,
        lead_id: Option<LeadId>,
        audio: Vec<u8>,
    ) -> TurnOutcome {
        let exchange = async {
            let channel = self.transport.open_turn(lead_id).await?;
            self.mark_awaiting(turn_id).await;
            channel.exchange(audio).await
        };

        let Some(deadline) = self.turn_deadline else {
            let result = exchange.await;
            return self.settle(turn_id, result).await;
        };

        tokio::pin!(exchange);
        tokio::select! {
            result = &mut exchange => self.settle(turn_id, result).await,
            _ = tokio::time::sleep(deadline) => {
                let error = SessionError::Transport("turn exchange timed out".to_string());
                if !self.expire(turn_id, error.clone()).await {
                    let result = exchange.await;
                    return self.settle(turn_id, result).await;
                }
                // Not cancelled: let it resolve and drop its result.
                let late = exchange.await;
                debug!(%turn_id, ok = late.is_ok(), "Late exchange resolved after deadline");
                TurnOutcome::Failed(error)
            }
        }
    }
}

/// Orchestrates the session. Cheap to clone; all clones drive the same session.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

impl SessionController {
    pub fn new(
        transport: Arc<dyn AgentTransport>,
        capture: Box<dyn CaptureDevice>,
        playback: Arc<dyn PlaybackDevice>,
    ) -> Self {
        Self::with_turn_deadline(transport, capture, playback, None)
    }

    /// Like [`SessionController::new`], but every turn exchange that takes
    /// longer than `deadline` fails the turn. The late result is dropped.
    pub fn with_turn_deadline(
        transport: Arc<dyn AgentTransport>,
        capture: Box<dyn CaptureDevice>,
        playback: Arc<dyn PlaybackDevice>,
        deadline: Option<Duration>,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (snapshot_tx, _) = watch::channel(SessionSnapshot::default());
        let core = SessionCore {
            state: SessionState::Idle,
            session: Session::default(),
            turn: None,
            last_reply: None,
            capture: CaptureManager::new(capture),
        };
        Self {
            inner: Arc::new(Inner {
                core: Mutex::new(core),
                transport,
                playback: PlaybackController::new(playback, events_tx.clone()),
                snapshot_tx,
                events_tx,
                turn_deadline: deadline,
                next_turn: AtomicU64::new(1),
            }),
        }
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        self.inner.core.lock().await.snapshot()
    }

    pub async fn state(&self) -> SessionState {
        self.inner.core.lock().await.state
    }

    /// Observes every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.snapshot_tx.subscribe()
    }

    /// Observes discrete session events.
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events_tx.subscribe()
    }

    pub fn playback(&self) -> &PlaybackController {
        &self.inner.playback
    }

    /// Runs the introduction exchange and plays the agent's opening line.
    ///
    /// A no-op once the introduction has been played. On failure the session
    /// returns to `Idle` and the call may be retried.
    #[instrument(skip(self))]
    pub async fn request_intro(&self, phone: &str) -> Result<(), SessionError> {
        let phone = phone.trim().to_string();
        {
            let mut core = self.inner.core.lock().await;
            if core.session.intro_played {
                debug!("Introduction already played, ignoring");
                return Ok(());
            }
            if core.state != SessionState::Idle {
                return Err(SessionError::InvalidState {
                    operation: "request the introduction",
                    state: core.state,
                });
            }
            if phone.is_empty() {
                return Err(SessionError::InvalidInput(
                    "a phone number is required".to_string(),
                ));
            }
            core.session.phone = Some(phone.clone());
            core.state = SessionState::IntroPending;
            self.inner.publish(&core);
        }

        let result = self.inner.transport.introduce(&phone).await;

        let mut core = self.inner.core.lock().await;
        match result {
            Ok(intro) => {
                let reply = ReplyMessage::from_introduction(&intro);
                core.session.lead_id = intro.lead_id;
                core.session.lead_name = intro.lead_name.clone();
                core.session.intro_played = true;
                core.last_reply = Some(reply);
                core.state = SessionState::IntroReady;
                info!(lead_name = ?intro.lead_name, "Introduction ready");
                if let Some(audio_url) = intro.audio_url {
                    self.inner.playback.play(audio_url);
                }
                self.inner.publish(&core);
                drop(core);

                self.inner.emit(SessionEvent::IntroPlayed {
                    lead_name: intro.lead_name,
                });
                Ok(())
            }
            Err(error) => {
                core.state = SessionState::Idle;
                self.inner.publish(&core);
                drop(core);
                Err(self.inner.surface(None, error))
            }
        }
    }

    /// Starts a push-to-talk capture, barging in on any agent playback.
    ///
    /// Idempotent while already recording.
    #[instrument(skip(self))]
    pub async fn begin_turn(&self) -> Result<TurnId, SessionError> {
        let mut core = self.inner.core.lock().await;
        match core.state {
            SessionState::IntroReady => {}
            SessionState::Recording => {
                return core.turn.as_ref().map(|turn| turn.id).ok_or(
                    SessionError::InvalidState {
                        operation: "begin a turn",
                        state: SessionState::Recording,
                    },
                );
            }
            state => {
                return Err(SessionError::InvalidState {
                    operation: "begin a turn",
                    state,
                });
            }
        }

        // Barge-in: the user talking over the agent always wins.
        self.inner.playback.interrupt();

        let turn_id = TurnId(self.inner.next_turn.fetch_add(1, Ordering::Relaxed));
        if let Err(error) = core.capture.start() {
            drop(core);
            return Err(self.inner.surface(Some(turn_id), error));
        }

        let mut turn = Turn::new(turn_id);
        turn.status = TurnStatus::Recording;
        core.turn = Some(turn);
        core.state = SessionState::Recording;
        self.inner.publish(&core);
        drop(core);

        info!(%turn_id, "Recording");
        self.inner.emit(SessionEvent::TurnStarted(turn_id));
        Ok(turn_id)
    }

    /// Stops the capture and dispatches the recording to the agent.
    ///
    /// An empty recording is discarded locally without contacting the agent.
    #[instrument(skip(self))]
    pub async fn end_turn(&self) -> Result<TurnHandle, SessionError> {
        let mut core = self.inner.core.lock().await;
        if core.state != SessionState::Recording {
            return Err(SessionError::InvalidState {
                operation: "end a turn",
                state: core.state,
            });
        }
        let Some(turn_id) = core.turn.as_ref().map(|turn| turn.id) else {
            return Err(SessionError::InvalidState {
                operation: "end a turn",
                state: core.state,
            });
        };

        let audio = match core.capture.stop() {
            Ok(CapturedAudio::Audio(bytes)) => bytes,
            Ok(CapturedAudio::Empty) => {
                core.fail_turn();
                self.inner.publish(&core);
                drop(core);
                return Err(self.inner.surface(Some(turn_id), SessionError::EmptyCapture));
            }
            Err(error) => {
                core.fail_turn();
                self.inner.publish(&core);
                drop(core);
                return Err(self.inner.surface(Some(turn_id), error));
            }
        };

        let bytes = audio.len();
        if let Some(turn) = core.turn.as_mut() {
            turn.status = TurnStatus::Sending;
            turn.audio_payload = audio.clone();
        }
        core.state = SessionState::Sending;
        let lead_id = core.session.lead_id.clone();
        self.inner.publish(&core);
        drop(core);

        info!(%turn_id, bytes, "Sending turn");
        self.inner.emit(SessionEvent::TurnSent(turn_id));

        let span = info_span!("turn_exchange", %turn_id);
        let task = tokio::spawn(
            self.inner
                .clone()
                .run_exchange(turn_id, lead_id, audio)
                .instrument(span),
        );
        Ok(TurnHandle { turn_id, task })
    }

    /// Gives up on the current turn without cancelling its exchange.
    ///
    /// Any reply that later arrives for it is dropped.
    #[instrument(skip(self))]
    pub async fn abandon_turn(&self) -> Result<(), SessionError> {
        let mut core = self.inner.core.lock().await;
        let state = core.state;
        let Some(turn_id) = core.turn.as_ref().map(|turn| turn.id).filter(|_| state.is_busy())
        else {
            return Err(SessionError::InvalidState {
                operation: "abandon a turn",
                state,
            });
        };

        if state == SessionState::Recording {
            if let Err(e) = core.capture.stop() {
                debug!(error = %e, "Capture released with error while abandoning");
            }
        }
        core.fail_turn();
        self.inner.publish(&core);
        drop(core);

        info!(%turn_id, "Turn abandoned");
        self.inner.emit(SessionEvent::TurnAbandoned(turn_id));
        Ok(())
    }

    /// Silences the agent without starting a turn.
    pub fn interrupt_playback(&self) {
        self.inner.playback.interrupt();
    }
}
