//! In-process doubles for the WebRTC backend, media devices and REST API.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use blocklearn_shared::protocol::{ChatPayload, IceCandidate, SessionDescription};
use blocklearn_shared::{PeerId, RoomKey};

use crate::api::{DurableMessage, NewSession, Rating, SessionApi};
use crate::error::{ApiError, MediaError, PeerError};
use crate::link::{LinkEvent, LinkEventKind, LinkEventSender, LinkFactory, LinkState, PeerLink};
use crate::media::{LocalMedia, LocalTrack, MediaConstraints, MediaSource, TrackKind};

pub fn candidate(name: &str) -> IceCandidate {
    IceCandidate {
        candidate: name.to_string(),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

#[derive(Debug, Default, Clone)]
pub struct FakeLinkLog {
    pub offers_created: usize,
    pub answers_created: usize,
    pub local_descriptions: usize,
    pub remote_descriptions: usize,
    pub candidates: Vec<String>,
    pub media_attached: usize,
    pub closed: usize,
}

/// Records every call; reports `Connected` once both descriptions are set.
#[derive(Clone)]
pub struct FakeLink {
    log: Arc<Mutex<FakeLinkLog>>,
    events: Option<(RoomKey, PeerId, LinkEventSender)>,
}

impl FakeLink {
    pub fn new() -> Self {
        Self {
            log: Arc::new(Mutex::new(FakeLinkLog::default())),
            events: None,
        }
    }

    pub fn log(&self) -> FakeLinkLog {
        self.log.lock().unwrap().clone()
    }

    fn maybe_connect(&self) {
        let log = self.log();
        if log.local_descriptions > 0 && log.remote_descriptions > 0 {
            if let Some((room, peer, tx)) = &self.events {
                for kind in [
                    LinkEventKind::ConnectionState(LinkState::Connected),
                    LinkEventKind::IceConnectionState(LinkState::Connected),
                ] {
                    let _ = tx.send(LinkEvent {
                        room: room.clone(),
                        peer: peer.clone(),
                        kind,
                    });
                }
            }
        }
    }
}

#[async_trait]
impl PeerLink for FakeLink {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let mut log = self.log.lock().unwrap();
        log.offers_created += 1;
        Ok(SessionDescription::offer(format!("offer-{}", log.offers_created)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let mut log = self.log.lock().unwrap();
        log.answers_created += 1;
        Ok(SessionDescription::answer(format!("answer-{}", log.answers_created)))
    }

    async fn set_local_description(&self, _desc: SessionDescription) -> Result<(), PeerError> {
        self.log.lock().unwrap().local_descriptions += 1;
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        if desc.sdp.is_empty() {
            return Err(PeerError::InvalidSdp("empty".into()));
        }
        self.log.lock().unwrap().remote_descriptions += 1;
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.log.lock().unwrap().candidates.push(candidate.candidate);
        Ok(())
    }

    async fn add_local_media(&self, _media: &Arc<LocalMedia>) -> Result<(), PeerError> {
        self.log.lock().unwrap().media_attached += 1;
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.log.lock().unwrap().closed += 1;
        Ok(())
    }
}

/// Hands out [`FakeLink`]s and remembers them per remote peer.
#[derive(Clone, Default)]
pub struct FakeLinkFactory {
    links: Arc<Mutex<HashMap<PeerId, Vec<FakeLink>>>>,
}

impl FakeLinkFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn links_for(&self, peer: &PeerId) -> Vec<FakeLink> {
        self.links
            .lock()
            .unwrap()
            .get(peer)
            .cloned()
            .unwrap_or_default()
    }

    pub fn total_offers(&self) -> usize {
        self.links
            .lock()
            .unwrap()
            .values()
            .flatten()
            .map(|l| l.log().offers_created)
            .sum()
    }
}

#[async_trait]
impl LinkFactory for FakeLinkFactory {
    async fn create(
        &self,
        room: &RoomKey,
        peer: &PeerId,
        events: LinkEventSender,
    ) -> Result<Box<dyn PeerLink>, PeerError> {
        let mut link = FakeLink::new();
        link.events = Some((room.clone(), peer.clone(), events));
        self.links
            .lock()
            .unwrap()
            .entry(peer.clone())
            .or_default()
            .push(link.clone());
        Ok(Box::new(link))
    }
}

/// Always hands out the same stream so tests can inspect its tracks.
pub struct FixedMediaSource(pub Arc<LocalMedia>);

impl FixedMediaSource {
    pub fn new() -> Self {
        Self(Arc::new(LocalMedia::new(
            "fixed",
            vec![
                LocalTrack::new("fixed-audio", TrackKind::Audio),
                LocalTrack::new("fixed-video", TrackKind::Video),
            ],
        )))
    }
}

#[async_trait]
impl MediaSource for FixedMediaSource {
    async fn acquire(&self, _constraints: MediaConstraints) -> Result<Arc<LocalMedia>, MediaError> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Default, Clone)]
pub struct ApiLog {
    pub sessions: Vec<NewSession>,
    pub posted: Vec<(String, String)>,
    pub ratings: Vec<(String, Rating)>,
}

/// In-memory [`SessionApi`] that hands out sequential session ids.
#[derive(Clone, Default)]
pub struct RecordingApi {
    log: Arc<Mutex<ApiLog>>,
    history: Arc<Mutex<Vec<DurableMessage>>>,
}

impl RecordingApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> ApiLog {
        self.log.lock().unwrap().clone()
    }

    pub fn set_history(&self, messages: Vec<DurableMessage>) {
        *self.history.lock().unwrap() = messages;
    }
}

#[async_trait]
impl SessionApi for RecordingApi {
    async fn create_session(&self, session: &NewSession) -> Result<String, ApiError> {
        let mut log = self.log.lock().unwrap();
        log.sessions.push(session.clone());
        Ok(format!("session-{}", log.sessions.len()))
    }

    async fn post_message(&self, session_id: &str, payload: &ChatPayload) -> Result<(), ApiError> {
        self.log
            .lock()
            .unwrap()
            .posted
            .push((session_id.to_string(), payload.text.clone()));
        Ok(())
    }

    async fn fetch_messages(&self, _session_id: &str) -> Result<Vec<DurableMessage>, ApiError> {
        Ok(self.history.lock().unwrap().clone())
    }

    async fn submit_rating(&self, session_id: &str, rating: &Rating) -> Result<(), ApiError> {
        self.log
            .lock()
            .unwrap()
            .ratings
            .push((session_id.to_string(), rating.clone()));
        Ok(())
    }
}
