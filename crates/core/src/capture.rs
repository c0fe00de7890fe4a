//! Capture Manager
//!
//! Wraps a microphone-like [`CaptureDevice`] and guarantees that at most one
//! capture is active and that the device is released on every exit path.

use crate::error::SessionError;
use tracing::{debug, warn};

/// A source of recorded audio.
///
/// `open` acquires the device and begins buffering. `close` must release the
/// device even when it returns an error, and yields everything buffered since
/// `open` as a single encoded payload (empty if nothing was captured).
pub trait CaptureDevice: Send {
    fn open(&mut self) -> Result<(), SessionError>;
    fn close(&mut self) -> Result<Vec<u8>, SessionError>;
}

/// What a finished capture produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapturedAudio {
    Audio(Vec<u8>),
    Empty,
}

pub struct CaptureManager {
    device: Box<dyn CaptureDevice>,
    active: bool,
}

impl CaptureManager {
    pub fn new(device: Box<dyn CaptureDevice>) -> Self {
        Self {
            device,
            active: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Acquires the input device and begins buffering.
    ///
    /// Starting twice is a programming error; the controller's state machine
    /// never does it.
    pub fn start(&mut self) -> Result<(), SessionError> {
        debug_assert!(!self.active, "capture started while already active");
        if self.active {
            return Err(SessionError::DeviceUnavailable(
                "a capture is already in progress".to_string(),
            ));
        }
        self.device.open()?;
        self.active = true;
        debug!("Capture started");
        Ok(())
    }

    /// Releases the input device and returns the accumulated payload.
    pub fn stop(&mut self) -> Result<CapturedAudio, SessionError> {
        if !self.active {
            return Ok(CapturedAudio::Empty);
        }
        self.active = false;
        let bytes = self.device.close()?;
        debug!(bytes = bytes.len(), "Capture stopped");
        if bytes.is_empty() {
            Ok(CapturedAudio::Empty)
        } else {
            Ok(CapturedAudio::Audio(bytes))
        }
    }
}

impl Drop for CaptureManager {
    fn drop(&mut self) {
        if self.active {
            if let Err(e) = self.device.close() {
                warn!(error = %e, "Failed to release capture device on drop");
            }
        }
    }
}
