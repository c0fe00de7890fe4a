//! Agent playback through `rodio`.
//!
//! Manages one `rodio::Sink` per resource. `halt()` is the barge-in
//! kill-switch for the current sink; a resource still being downloaded is
//! kept silent by its stale cue.

use async_trait::async_trait;
use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink};
use std::{
    io::Cursor,
    sync::{Arc, Mutex, mpsc},
    thread,
    time::Duration,
};
use tracing::{debug, info};
use walkie_core::{
    SessionError,
    playback::{PlaybackCue, PlaybackDevice},
};

/// The default output device of the default host.
pub struct RodioSpeaker {
    http: reqwest::Client,
    handle: OutputStreamHandle,
    current: Mutex<Option<Arc<Sink>>>,
    // Dropping the sender ends the thread that owns the output stream.
    _keep_alive: mpsc::Sender<()>,
}

impl RodioSpeaker {
    pub fn new(fetch_timeout: Duration) -> Result<Self, SessionError> {
        let http = reqwest::Client::builder()
            .timeout(fetch_timeout)
            .build()
            .map_err(|e| SessionError::PlaybackFailed(e.to_string()))?;

        // The output stream is not Send; a dedicated thread owns it for our lifetime.
        let (handle_tx, handle_rx) = mpsc::sync_channel(1);
        let (keep_alive, keep_alive_rx) = mpsc::channel::<()>();
        thread::Builder::new()
            .name("walkie-speaker".to_string())
            .spawn(move || match OutputStream::try_default() {
                Ok((stream, handle)) => {
                    let _ = handle_tx.send(Ok(handle));
                    let _ = keep_alive_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = handle_tx.send(Err(e.to_string()));
                }
            })
            .map_err(|e| SessionError::DeviceUnavailable(e.to_string()))?;

        let handle = handle_rx
            .recv()
            .map_err(|_| {
                SessionError::DeviceUnavailable(
                    "the speaker thread exited during start-up".to_string(),
                )
            })?
            .map_err(SessionError::DeviceUnavailable)?;
        info!("Speaker ready");

        Ok(Self {
            http,
            handle,
            current: Mutex::new(None),
            _keep_alive: keep_alive,
        })
    }

    async fn fetch(&self, audio_url: &str) -> Result<Vec<u8>, SessionError> {
        let response = self
            .http
            .get(audio_url)
            .send()
            .await
            .map_err(|e| SessionError::PlaybackFailed(format!("could not fetch audio: {}", e)))?;
        if !response.status().is_success() {
            return Err(SessionError::PlaybackFailed(format!(
                "audio fetch returned {}",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| SessionError::PlaybackFailed(format!("could not read audio: {}", e)))?;
        Ok(bytes.to_vec())
    }

    fn lock_current(&self) -> std::sync::MutexGuard<'_, Option<Arc<Sink>>> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl PlaybackDevice for RodioSpeaker {
    async fn render(&self, audio_url: &str, cue: &PlaybackCue) -> Result<(), SessionError> {
        let bytes = self.fetch(audio_url).await?;
        if bytes.is_empty() {
            return Err(SessionError::PlaybackFailed("the audio resource is empty".to_string()));
        }

        let source = Decoder::new(Cursor::new(bytes))
            .map_err(|e| SessionError::PlaybackFailed(format!("decode failed: {}", e)))?;
        let sink = Arc::new(
            Sink::try_new(&self.handle).map_err(|e| SessionError::PlaybackFailed(e.to_string()))?,
        );
        {
            // Checked under the sink lock so a concurrent halt either sees this
            // sink or leaves the cue stale.
            let mut current = self.lock_current();
            if !cue.is_current() {
                debug!(%audio_url, "Halted while fetching, not starting");
                return Ok(());
            }
            sink.append(source);
            *current = Some(sink.clone());
        }

        let waiting = sink.clone();
        tokio::task::spawn_blocking(move || waiting.sleep_until_end())
            .await
            .map_err(|e| SessionError::PlaybackFailed(e.to_string()))?;

        let mut current = self.lock_current();
        if current.as_ref().is_some_and(|playing| Arc::ptr_eq(playing, &sink)) {
            *current = None;
        }
        Ok(())
    }

    fn halt(&self) {
        let mut current = self.lock_current();
        if let Some(sink) = current.take() {
            sink.stop();
            debug!("Speaker halted");
        }
    }
}
