//! Playback Controller
//!
//! Renders one agent audio resource at a time and reports an active/inactive
//! signal. Starting a new resource or a barge-in interrupts the current one.
//! Rendering failures are reported as events and never touch session state.

use crate::{SessionEvent, error::SessionError};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// Identifies one [`PlaybackController::play`] call.
///
/// Taken when `play` is called, so it goes stale as soon as that playback is
/// interrupted or replaced, even if the device has not started rendering yet.
#[derive(Debug, Clone)]
pub struct PlaybackCue {
    generation: u64,
    current: Arc<Mutex<u64>>,
}

impl PlaybackCue {
    pub fn is_current(&self) -> bool {
        *lock_generation(&self.current) == self.generation
    }
}

/// An audio output capable of rendering a resource by reference.
#[async_trait]
pub trait PlaybackDevice: Send + Sync {
    /// Renders `audio_url` from its start. Resolves when the resource ends
    /// naturally or after [`PlaybackDevice::halt`] was called.
    ///
    /// Implementations must check `cue` right before output begins and stay
    /// silent if it is no longer current.
    async fn render(&self, audio_url: &str, cue: &PlaybackCue) -> Result<(), SessionError>;

    /// Stops rendering immediately.
    fn halt(&self);
}

/// Owns the audio output and serializes access to it.
#[derive(Clone)]
pub struct PlaybackController {
    device: Arc<dyn PlaybackDevice>,
    // Bumped by every play/interrupt; a render only reports its own end.
    generation: Arc<Mutex<u64>>,
    active: Arc<watch::Sender<bool>>,
    events: broadcast::Sender<SessionEvent>,
}

impl PlaybackController {
    pub fn new(device: Arc<dyn PlaybackDevice>, events: broadcast::Sender<SessionEvent>) -> Self {
        let (active, _) = watch::channel(false);
        Self {
            device,
            generation: Arc::new(Mutex::new(0)),
            active: Arc::new(active),
            events,
        }
    }

    pub fn is_active(&self) -> bool {
        *self.active.borrow()
    }

    pub fn watch_active(&self) -> watch::Receiver<bool> {
        self.active.subscribe()
    }

    /// Begins rendering `audio_url`, interrupting whatever is playing.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn play(&self, audio_url: String) {
        if self.is_active() {
            self.interrupt();
        }

        let cue = {
            let mut current = lock_generation(&self.generation);
            *current += 1;
            self.active.send_replace(true);
            PlaybackCue {
                generation: *current,
                current: self.generation.clone(),
            }
        };
        info!(%audio_url, "Playback started");
        let _ = self
            .events
            .send(SessionEvent::PlaybackStarted(audio_url.clone()));

        let controller = self.clone();
        tokio::spawn(async move {
            if !cue.is_current() {
                debug!(%audio_url, "Interrupted before rendering started");
                return;
            }
            let result = controller.device.render(&audio_url, &cue).await;
            let ended_naturally = {
                let current = lock_generation(&controller.generation);
                if *current == cue.generation {
                    controller.active.send_replace(false)
                } else {
                    false
                }
            };
            if ended_naturally {
                debug!(%audio_url, "Playback finished");
                let _ = controller.events.send(SessionEvent::PlaybackStopped {
                    interrupted: false,
                });
            }
            if let Err(e) = result {
                warn!(%audio_url, error = %e, "Playback failed");
                let _ = controller.events.send(SessionEvent::PlaybackFailed(e));
            }
        });
    }

    /// Stops rendering immediately. A no-op when nothing is playing.
    pub fn interrupt(&self) {
        let was_active = {
            let mut current = lock_generation(&self.generation);
            *current += 1;
            self.active.send_replace(false)
        };
        if was_active {
            self.device.halt();
            info!("Playback interrupted");
            let _ = self
                .events
                .send(SessionEvent::PlaybackStopped { interrupted: true });
        }
    }
}

fn lock_generation(generation: &Mutex<u64>) -> std::sync::MutexGuard<'_, u64> {
    generation
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
