//! Local camera/microphone media.
//!
//! The engine acquires one [`LocalMedia`] per call and hands the same `Arc`
//! to every peer connection. Stopping it stops the tracks for all of them,
//! which is why the engine only stops media after every connection closed.
//!
//! Sources push encoded [`MediaFrame`]s into a track; every connection that
//! sends the track subscribes and writes them to the wire. Disabled tracks
//! carry nothing and stopped tracks close their subscribers.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::MediaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// Frames buffered per track before a slow writer starts skipping.
const FRAME_CAPACITY: usize = 64;

/// One encoded frame in the track's codec (Opus for audio, VP8 for video).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFrame {
    pub data: Vec<u8>,
    pub duration: Duration,
}

#[derive(Debug)]
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
    frames: Mutex<Option<broadcast::Sender<MediaFrame>>>,
}

impl LocalTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        let (frames, _) = broadcast::channel(FRAME_CAPACITY);
        Self {
            id: id.into(),
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            frames: Mutex::new(Some(frames)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        self.stopped.store(true, Ordering::SeqCst);
        if let Ok(mut frames) = self.frames.lock() {
            frames.take();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Frames pushed from now on. `None` once the track is stopped.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<MediaFrame>> {
        self.frames.lock().ok()?.as_ref().map(|tx| tx.subscribe())
    }

    /// Queue an encoded frame for every connection sending this track.
    /// Returns `false` when it was dropped: track disabled or stopped, or
    /// nobody is sending it yet.
    pub fn push(&self, frame: MediaFrame) -> bool {
        if !self.is_enabled() {
            return false;
        }
        match self.frames.lock() {
            Ok(frames) => frames.as_ref().is_some_and(|tx| tx.send(frame).is_ok()),
            Err(_) => false,
        }
    }
}

/// Drive one connection's copy of a track: hand every frame to `write`
/// while the track is enabled, until the track stops.
pub async fn forward_frames<F, Fut>(
    track: Arc<LocalTrack>,
    mut frames: broadcast::Receiver<MediaFrame>,
    mut write: F,
) where
    F: FnMut(MediaFrame) -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        match frames.recv().await {
            Ok(frame) => {
                if track.is_enabled() {
                    write(frame).await;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(track = %track.id(), skipped, "media writer fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!(track = %track.id(), "media writer finished");
}

/// The local stream shared by every outbound connection.
#[derive(Debug)]
pub struct LocalMedia {
    stream_id: String,
    tracks: Vec<Arc<LocalTrack>>,
}

impl LocalMedia {
    pub fn new(stream_id: impl Into<String>, tracks: Vec<LocalTrack>) -> Self {
        Self {
            stream_id: stream_id.into(),
            tracks: tracks.into_iter().map(Arc::new).collect(),
        }
    }

    /// Fresh stream with one track per requested kind.
    pub fn for_constraints(constraints: MediaConstraints) -> Result<Self, MediaError> {
        if !constraints.audio && !constraints.video {
            return Err(MediaError::Constraints(
                "at least one of audio or video is required".into(),
            ));
        }

        let stream_id = uuid::Uuid::new_v4().to_string();
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(LocalTrack::new(format!("{stream_id}-audio"), TrackKind::Audio));
        }
        if constraints.video {
            tracks.push(LocalTrack::new(format!("{stream_id}-video"), TrackKind::Video));
        }
        Ok(Self::new(stream_id, tracks))
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &Arc<LocalTrack>> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    /// First track of `kind`, where a source pushes its frames.
    pub fn track(&self, kind: TrackKind) -> Option<&Arc<LocalTrack>> {
        self.tracks_of(kind).next()
    }

    pub fn is_muted(&self) -> bool {
        !self.tracks_of(TrackKind::Audio).any(|t| t.is_enabled())
    }

    pub fn is_video_enabled(&self) -> bool {
        self.tracks_of(TrackKind::Video).any(|t| t.is_enabled())
    }

    /// Flip audio tracks; returns the new muted state.
    pub fn toggle_mute(&self) -> bool {
        let enable = self.is_muted();
        for track in self.tracks_of(TrackKind::Audio) {
            track.set_enabled(enable);
        }
        debug!(muted = !enable, "toggled microphone");
        !enable
    }

    /// Flip video tracks; returns whether video is now enabled.
    pub fn toggle_video(&self) -> bool {
        let enable = !self.is_video_enabled();
        for track in self.tracks_of(TrackKind::Video) {
            track.set_enabled(enable);
        }
        debug!(video = enable, "toggled camera");
        enable
    }

    /// Stop every track. Safe to call repeatedly.
    pub fn stop_all(&self) {
        if self.all_stopped() {
            return;
        }
        for track in &self.tracks {
            track.stop();
        }
        info!(stream = %self.stream_id, tracks = self.tracks.len(), "stopped local media");
    }

    pub fn all_stopped(&self) -> bool {
        self.tracks.iter().all(|t| t.is_stopped())
    }
}

/// Acquires local media, i.e. asks the platform for camera/microphone.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<Arc<LocalMedia>, MediaError>;
}

/// Media source producing tracks without touching real devices. Nothing
/// is pushed into them unless the host does so itself.
///
/// Used for headless clients and tests; can be told to fail like a real
/// device would.
#[derive(Debug, Clone, Default)]
pub struct SyntheticMediaSource {
    failure: Option<MediaError>,
}

impl SyntheticMediaSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(error: MediaError) -> Self {
        Self {
            failure: Some(error),
        }
    }
}

#[async_trait]
impl MediaSource for SyntheticMediaSource {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<Arc<LocalMedia>, MediaError> {
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        Ok(Arc::new(LocalMedia::for_constraints(constraints)?))
    }
}
