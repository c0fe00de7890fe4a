//! Push-to-talk microphone backed by `cpal`.
//!
//! The input stream lives on a dedicated thread for the duration of one
//! recording (cpal streams are not `Send` on every platform). Samples are
//! converted to 16-bit PCM and pushed into a bounded ring; whatever does not
//! fit is dropped. Closing the recording joins the thread, which releases the
//! device, and encodes the ring's contents as a WAV payload.

use cpal::{
    FromSample, Sample, SizedSample,
    traits::{DeviceTrait, HostTrait, StreamTrait},
};
use ringbuf::{
    HeapCons, HeapProd, HeapRb,
    traits::{Consumer, Producer, Split},
};
use std::{
    io::Cursor,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{debug, info, warn};
use walkie_core::{SessionError, capture::CaptureDevice};

/// Format of the samples held by a finished recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub channels: u16,
    pub sample_rate: u32,
}

struct Recording {
    stop_tx: mpsc::Sender<()>,
    thread: JoinHandle<Result<Vec<u8>, SessionError>>,
}

/// The default input device of the default host.
pub struct CpalMicrophone {
    max_capture: Duration,
    recording: Option<Recording>,
}

impl CpalMicrophone {
    pub fn new(max_capture: Duration) -> Self {
        Self {
            max_capture,
            recording: None,
        }
    }
}

impl CaptureDevice for CpalMicrophone {
    fn open(&mut self) -> Result<(), SessionError> {
        if self.recording.is_some() {
            return Err(SessionError::DeviceUnavailable(
                "the microphone is already recording".to_string(),
            ));
        }

        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let (stop_tx, stop_rx) = mpsc::channel();
        let max_capture = self.max_capture;
        let thread = thread::Builder::new()
            .name("walkie-microphone".to_string())
            .spawn(move || record(max_capture, ready_tx, stop_rx))
            .map_err(|e| SessionError::DeviceUnavailable(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.recording = Some(Recording { stop_tx, thread });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(SessionError::DeviceUnavailable(
                "the microphone thread exited during start-up".to_string(),
            )),
        }
    }

    fn close(&mut self) -> Result<Vec<u8>, SessionError> {
        let Some(recording) = self.recording.take() else {
            return Ok(Vec::new());
        };
        let _ = recording.stop_tx.send(());
        recording.thread.join().map_err(|_| {
            SessionError::DeviceUnavailable("the microphone thread panicked".to_string())
        })?
    }
}

/// Body of the recording thread.
fn record(
    max_capture: Duration,
    ready_tx: mpsc::SyncSender<Result<(), SessionError>>,
    stop_rx: mpsc::Receiver<()>,
) -> Result<Vec<u8>, SessionError> {
    let started = open_stream(max_capture);
    let (stream, mut samples, format, truncated) = match started {
        Ok(parts) => {
            let _ = ready_tx.send(Ok(()));
            parts
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e.clone()));
            return Err(e);
        }
    };

    // Either a stop request or the controller going away ends the recording.
    let _ = stop_rx.recv();
    drop(stream);

    let mut pcm = Vec::new();
    while let Some(sample) = samples.try_pop() {
        pcm.push(sample);
    }
    if truncated.load(Ordering::Relaxed) {
        warn!(
            max_secs = max_capture.as_secs(),
            "Recording exceeded the capture limit and was truncated"
        );
    }
    info!(samples = pcm.len(), "Microphone closed");
    encode_wav(&pcm, format)
}

type OpenedStream = (
    cpal::Stream,
    HeapCons<i16>,
    PcmFormat,
    Arc<AtomicBool>,
);

fn open_stream(max_capture: Duration) -> Result<OpenedStream, SessionError> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| SessionError::DeviceUnavailable("no input device available".to_string()))?;
    let supported = device
        .default_input_config()
        .map_err(|e| SessionError::DeviceUnavailable(e.to_string()))?;
    let format = PcmFormat {
        channels: supported.channels(),
        sample_rate: supported.sample_rate().0,
    };
    debug!(
        device = %device.name().unwrap_or_else(|_| "unknown".to_string()),
        ?format,
        sample_format = ?supported.sample_format(),
        "Opening microphone"
    );

    let capacity = ring_capacity(format, max_capture);
    let (producer, consumer) = HeapRb::<i16>::new(capacity).split();
    let truncated = Arc::new(AtomicBool::new(false));
    let config: cpal::StreamConfig = supported.config();

    let stream = match supported.sample_format() {
        cpal::SampleFormat::F32 => {
            build_stream::<f32>(&device, &config, producer, truncated.clone())
        }
        cpal::SampleFormat::I16 => {
            build_stream::<i16>(&device, &config, producer, truncated.clone())
        }
        cpal::SampleFormat::U16 => {
            build_stream::<u16>(&device, &config, producer, truncated.clone())
        }
        other => {
            return Err(SessionError::DeviceUnavailable(format!(
                "unsupported sample format {:?}",
                other
            )));
        }
    }?;
    stream
        .play()
        .map_err(|e| SessionError::DeviceUnavailable(e.to_string()))?;

    Ok((stream, consumer, format, truncated))
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut producer: HeapProd<i16>,
    truncated: Arc<AtomicBool>,
) -> Result<cpal::Stream, SessionError>
where
    T: SizedSample,
    i16: FromSample<T>,
{
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                for &sample in data {
                    if producer.try_push(sample.to_sample::<i16>()).is_err() {
                        truncated.store(true, Ordering::Relaxed);
                        break;
                    }
                }
            },
            |err| warn!(error = %err, "Microphone stream error"),
            None,
        )
        .map_err(|e| SessionError::DeviceUnavailable(e.to_string()))
}

/// Number of samples that fit in `max_capture` at `format`.
pub fn ring_capacity(format: PcmFormat, max_capture: Duration) -> usize {
    let per_second = format.sample_rate as usize * format.channels.max(1) as usize;
    (per_second * max_capture.as_secs().max(1) as usize).max(1)
}

/// Encodes interleaved PCM as a 16-bit WAV file. No samples yield no bytes.
pub fn encode_wav(samples: &[i16], format: PcmFormat) -> Result<Vec<u8>, SessionError> {
    if samples.is_empty() {
        return Ok(Vec::new());
    }
    let spec = hound::WavSpec {
        channels: format.channels,
        sample_rate: format.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let encode_err =
        |e: hound::Error| SessionError::DeviceUnavailable(format!("WAV encoding failed: {}", e));

    let mut bytes = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    let mut writer = hound::WavWriter::new(&mut bytes, spec).map_err(encode_err)?;
    for &sample in samples {
        writer.write_sample(sample).map_err(encode_err)?;
    }
    writer.finalize().map_err(encode_err)?;
    Ok(bytes.into_inner())
}
