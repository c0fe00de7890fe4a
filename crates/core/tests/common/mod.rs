//! Fake devices and a scripted agent for driving the session controller.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, broadcast, oneshot, watch};
use walkie_core::{
    SessionController, SessionError, SessionEvent,
    capture::CaptureDevice,
    models::{Introduction, LeadId, ReplyKind, ReplyMessage, SessionState},
    playback::{PlaybackCue, PlaybackDevice},
    transport::{AgentTransport, TurnChannel},
};

pub type Journal = Arc<Mutex<Vec<String>>>;

pub fn entries(journal: &Journal) -> Vec<String> {
    journal.lock().unwrap().clone()
}

/// A microphone whose next recording is set by the test.
pub struct FakeMicrophone {
    pub journal: Journal,
    pub next_payload: Arc<Mutex<Vec<u8>>>,
    pub deny: Arc<Mutex<bool>>,
    /// Set once the controller is built, to observe barge-in ordering.
    pub playback_active: Arc<Mutex<Option<watch::Receiver<bool>>>>,
    pub playback_active_at_open: Arc<Mutex<Vec<bool>>>,
}

impl CaptureDevice for FakeMicrophone {
    fn open(&mut self) -> Result<(), SessionError> {
        if *self.deny.lock().unwrap() {
            return Err(SessionError::DeviceUnavailable("permission denied".into()));
        }
        if let Some(active) = self.playback_active.lock().unwrap().as_ref() {
            self.playback_active_at_open
                .lock()
                .unwrap()
                .push(*active.borrow());
        }
        self.journal.lock().unwrap().push("capture.open".into());
        Ok(())
    }

    fn close(&mut self) -> Result<Vec<u8>, SessionError> {
        self.journal.lock().unwrap().push("capture.close".into());
        Ok(self.next_payload.lock().unwrap().clone())
    }
}

/// A speaker that holds every resource until halted or released by the test.
pub struct FakeSpeaker {
    pub journal: Journal,
    pub rendered: Mutex<Vec<String>>,
    pub finish: Notify,
}

#[async_trait]
impl PlaybackDevice for FakeSpeaker {
    async fn render(&self, audio_url: &str, cue: &PlaybackCue) -> Result<(), SessionError> {
        if !cue.is_current() {
            return Ok(());
        }
        self.rendered.lock().unwrap().push(audio_url.to_string());
        if audio_url.ends_with(".corrupt") {
            return Err(SessionError::PlaybackFailed("unsupported format".into()));
        }
        self.finish.notified().await;
        Ok(())
    }

    fn halt(&self) {
        self.journal.lock().unwrap().push("playback.halt".into());
        self.finish.notify_waiters();
    }
}

type PendingReply = oneshot::Receiver<Result<ReplyMessage, SessionError>>;

/// An agent whose answers are queued, or gated, by the test.
pub struct ScriptedAgent {
    pub intro: Mutex<Result<Introduction, SessionError>>,
    pub intro_calls: Mutex<usize>,
    pub opened: Mutex<Vec<Option<LeadId>>>,
    pub sent: Mutex<Vec<Vec<u8>>>,
    pending: Mutex<VecDeque<PendingReply>>,
}

impl ScriptedAgent {
    pub fn new(intro: Result<Introduction, SessionError>) -> Arc<Self> {
        Arc::new(Self {
            intro: Mutex::new(intro),
            intro_calls: Mutex::new(0),
            opened: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            pending: Mutex::new(VecDeque::new()),
        })
    }

    /// Queues an answer delivered as soon as the audio arrives.
    pub fn answer(&self, result: Result<ReplyMessage, SessionError>) {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        self.pending.lock().unwrap().push_back(rx);
    }

    /// Queues an answer delivered when the test sends on the returned gate.
    pub fn gate(&self) -> oneshot::Sender<Result<ReplyMessage, SessionError>> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().push_back(rx);
        tx
    }

    pub fn opened_count(&self) -> usize {
        self.opened.lock().unwrap().len()
    }
}

struct ScriptedChannel {
    agent: Arc<ScriptedAgent>,
    reply: Option<PendingReply>,
}

#[async_trait]
impl TurnChannel for ScriptedChannel {
    async fn exchange(self: Box<Self>, audio: Vec<u8>) -> Result<ReplyMessage, SessionError> {
        self.agent.sent.lock().unwrap().push(audio);
        match self.reply {
            Some(rx) => rx
                .await
                .unwrap_or_else(|_| Err(SessionError::Transport("gate dropped".into()))),
            None => Err(SessionError::Transport("no scripted reply".into())),
        }
    }
}

/// Shares one `ScriptedAgent` with the controller.
pub struct AgentHandle(pub Arc<ScriptedAgent>);

#[async_trait]
impl AgentTransport for AgentHandle {
    async fn introduce(&self, _phone: &str) -> Result<Introduction, SessionError> {
        *self.0.intro_calls.lock().unwrap() += 1;
        self.0.intro.lock().unwrap().clone()
    }

    async fn open_turn(
        &self,
        lead_id: Option<LeadId>,
    ) -> Result<Box<dyn TurnChannel>, SessionError> {
        self.0.opened.lock().unwrap().push(lead_id);
        let reply = self.0.pending.lock().unwrap().pop_front();
        Ok(Box::new(ScriptedChannel {
            agent: self.0.clone(),
            reply,
        }))
    }
}

pub struct Harness {
    pub session: SessionController,
    pub agent: Arc<ScriptedAgent>,
    pub speaker: Arc<FakeSpeaker>,
    pub journal: Journal,
    pub next_payload: Arc<Mutex<Vec<u8>>>,
    pub deny_microphone: Arc<Mutex<bool>>,
    pub playback_active_at_open: Arc<Mutex<Vec<bool>>>,
}

pub fn intro_for_ana(audio_url: Option<&str>) -> Introduction {
    Introduction {
        lead_id: Some(LeadId("101".into())),
        lead_name: Some("Ana".into()),
        text: "Hola Ana, te habla Domu.".into(),
        audio_url: audio_url.map(str::to_string),
    }
}

pub fn reply(
    user_text: &str,
    intent: &str,
    reply_text: &str,
    audio_url: Option<&str>,
) -> ReplyMessage {
    ReplyMessage {
        kind: ReplyKind::Reply,
        user_transcript: Some(user_text.into()),
        intent: intent.into(),
        reply_text: Some(reply_text.into()),
        audio_url: audio_url.map(str::to_string),
        error_detail: None,
    }
}

/// Two seconds of a 440 Hz tone at 16 kHz, as raw little-endian PCM16.
pub fn spoken_audio() -> Vec<u8> {
    (0..32_000)
        .flat_map(|i| {
            let t = i as f32 / 16_000.0;
            let sample = ((t * 440.0 * std::f32::consts::TAU).sin() * 8_000.0) as i16;
            sample.to_le_bytes()
        })
        .collect()
}

pub fn harness(intro: Result<Introduction, SessionError>) -> Harness {
    harness_with_deadline(intro, None)
}

pub fn harness_with_deadline(
    intro: Result<Introduction, SessionError>,
    deadline: Option<Duration>,
) -> Harness {
    let journal: Journal = Arc::new(Mutex::new(Vec::new()));
    let next_payload = Arc::new(Mutex::new(spoken_audio()));
    let deny_microphone = Arc::new(Mutex::new(false));
    let playback_active = Arc::new(Mutex::new(None));
    let playback_active_at_open = Arc::new(Mutex::new(Vec::new()));

    let microphone = FakeMicrophone {
        journal: journal.clone(),
        next_payload: next_payload.clone(),
        deny: deny_microphone.clone(),
        playback_active: playback_active.clone(),
        playback_active_at_open: playback_active_at_open.clone(),
    };
    let speaker = Arc::new(FakeSpeaker {
        journal: journal.clone(),
        rendered: Mutex::new(Vec::new()),
        finish: Notify::new(),
    });
    let agent = ScriptedAgent::new(intro);

    let session = SessionController::with_turn_deadline(
        Arc::new(AgentHandle(agent.clone())),
        Box::new(microphone),
        speaker.clone(),
        deadline,
    );
    *playback_active.lock().unwrap() = Some(session.playback().watch_active());

    Harness {
        session,
        agent,
        speaker,
        journal,
        next_payload,
        deny_microphone,
        playback_active_at_open,
    }
}

/// Waits until the published snapshot reaches `state`.
pub async fn wait_for_state(session: &SessionController, state: SessionState) {
    let mut snapshots = session.subscribe();
    tokio::time::timeout(
        Duration::from_secs(2),
        snapshots.wait_for(|snapshot| snapshot.state == state),
    )
    .await
    .unwrap_or_else(|_| panic!("session never reached {}", state))
    .expect("controller dropped");
}

/// Polls `condition` until it holds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never became true");
}

/// Everything published on `events` so far.
pub fn drain(events: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}
