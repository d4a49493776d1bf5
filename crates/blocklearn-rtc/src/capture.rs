//! Microphone capture through `cpal`, encoded to Opus for the audio track.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::error::MediaError;
use crate::media::{LocalMedia, LocalTrack, MediaConstraints, MediaFrame, MediaSource, TrackKind};

const SAMPLE_RATE: u32 = 48_000;
const FRAME_MS: u64 = 20;
const FRAME_SAMPLES: usize = SAMPLE_RATE as usize * FRAME_MS as usize / 1000;
const MAX_PACKET: usize = 1500;
const STOP_POLL: Duration = Duration::from_millis(100);

/// Captures the default input device into the audio track.
///
/// Video tracks are still created so the call negotiates them; the host
/// pushes their frames through [`LocalTrack::push`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MicrophoneSource;

#[async_trait]
impl MediaSource for MicrophoneSource {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<Arc<LocalMedia>, MediaError> {
        let media = Arc::new(LocalMedia::for_constraints(constraints)?);
        if let Some(track) = media.track(TrackKind::Audio) {
            start_capture(Arc::clone(track)).await?;
        }
        Ok(media)
    }
}

/// Spawn the capture thread and wait until the device is open.
async fn start_capture(track: Arc<LocalTrack>) -> Result<(), MediaError> {
    let (ready_tx, ready_rx) = oneshot::channel();
    thread::Builder::new()
        .name("mic-capture".into())
        .spawn(move || run_capture(track, ready_tx))
        .map_err(|e| MediaError::Other(e.to_string()))?;
    ready_rx
        .await
        .map_err(|_| MediaError::Other("capture thread exited".into()))?
}

/// The stream is not `Send`, so it lives on this thread until the track stops.
fn run_capture(track: Arc<LocalTrack>, ready: oneshot::Sender<Result<(), MediaError>>) {
    let (fault_tx, fault_rx) = mpsc::channel::<String>();
    let stream = match open_stream(Arc::clone(&track), fault_tx) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let _ = ready.send(Ok(()));
    info!(track = %track.id(), "microphone capture started");

    while !track.is_stopped() {
        match fault_rx.recv_timeout(STOP_POLL) {
            Ok(fault) => error!(track = %track.id(), "audio input error: {fault}"),
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    drop(stream);
    debug!(track = %track.id(), "microphone capture stopped");
}

fn open_stream(
    track: Arc<LocalTrack>,
    faults: mpsc::Sender<String>,
) -> Result<cpal::Stream, MediaError> {
    let host = cpal::default_host();
    let device = host.default_input_device().ok_or(MediaError::NoDevice)?;
    info!(device = ?device.name(), "using input device");

    let config = cpal::StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Default,
    };
    let mut encoder = opus::Encoder::new(SAMPLE_RATE, opus::Channels::Mono, opus::Application::Voip)
        .map_err(|e| MediaError::Other(format!("opus encoder: {e}")))?;
    let mut pending: Vec<f32> = Vec::with_capacity(FRAME_SAMPLES * 2);

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                pending.extend_from_slice(data);
                while pending.len() >= FRAME_SAMPLES {
                    let frame: Vec<f32> = pending.drain(..FRAME_SAMPLES).collect();
                    match encoder.encode_vec_float(&frame, MAX_PACKET) {
                        Ok(packet) => {
                            track.push(MediaFrame {
                                data: packet,
                                duration: Duration::from_millis(FRAME_MS),
                            });
                        }
                        Err(e) => warn!(error = %e, "failed to encode audio frame"),
                    }
                }
            },
            move |err| {
                let _ = faults.send(err.to_string());
            },
            None,
        )
        .map_err(build_error)?;
    stream.play().map_err(play_error)?;
    Ok(stream)
}

fn build_error(e: cpal::BuildStreamError) -> MediaError {
    match e {
        cpal::BuildStreamError::DeviceNotAvailable => MediaError::NoDevice,
        cpal::BuildStreamError::StreamConfigNotSupported => {
            MediaError::Constraints("48 kHz mono capture is not supported".into())
        }
        other => MediaError::Other(other.to_string()),
    }
}

fn play_error(e: cpal::PlayStreamError) -> MediaError {
    match e {
        cpal::PlayStreamError::DeviceNotAvailable => MediaError::DeviceBusy,
        other => MediaError::Other(other.to_string()),
    }
}
