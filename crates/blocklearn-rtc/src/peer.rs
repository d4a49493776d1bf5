use std::collections::HashMap;
use std::sync::Arc;

use blocklearn_shared::protocol::{IceCandidate, SessionDescription};
use blocklearn_shared::{PeerId, RoomKey};
use tracing::{debug, info, warn};

use crate::error::PeerError;
use crate::link::{LinkState, PeerLink};
use crate::media::{LocalMedia, TrackKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    OfferSent,
    OfferReceived,
    AnswerSent,
    Connected,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub stream_id: String,
    pub tracks: Vec<(String, TrackKind)>,
}

/// Result of feeding a link state into a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityChange {
    Unchanged,
    Connected,
    Disconnected,
    /// The link failed; the connection should be torn down.
    Failed,
}

/// One point-to-point connection to a remote peer in a room.
pub struct PeerConnection {
    room: RoomKey,
    remote: PeerId,
    link: Box<dyn PeerLink>,
    local_media: Option<Arc<LocalMedia>>,
    tracks_attached: bool,
    state: NegotiationState,
    has_local_description: bool,
    has_remote_description: bool,
    pending_ice: Vec<IceCandidate>,
    applied_ice: usize,
    connected: bool,
    remote_streams: HashMap<String, RemoteStream>,
}

impl PeerConnection {
    pub fn new(
        room: RoomKey,
        remote: PeerId,
        link: Box<dyn PeerLink>,
        local_media: Option<Arc<LocalMedia>>,
    ) -> Self {
        Self {
            room,
            remote,
            link,
            local_media,
            tracks_attached: false,
            state: NegotiationState::Idle,
            has_local_description: false,
            has_remote_description: false,
            pending_ice: Vec::new(),
            applied_ice: 0,
            connected: false,
            remote_streams: HashMap::new(),
        }
    }

    pub fn remote(&self) -> &PeerId {
        &self.remote
    }

    pub fn room(&self) -> &RoomKey {
        &self.room
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn has_local_description(&self) -> bool {
        self.has_local_description
    }

    pub fn pending_ice_count(&self) -> usize {
        self.pending_ice.len()
    }

    pub fn applied_ice_count(&self) -> usize {
        self.applied_ice
    }

    pub fn remote_streams(&self) -> impl Iterator<Item = &RemoteStream> {
        self.remote_streams.values()
    }

    fn ensure_open(&self, operation: &'static str) -> Result<(), PeerError> {
        if self.state == NegotiationState::Closed {
            return Err(PeerError::InvalidState {
                operation,
                state: self.state,
            });
        }
        Ok(())
    }

    async fn attach_tracks(&mut self) -> Result<(), PeerError> {
        if self.tracks_attached {
            return Ok(());
        }
        if let Some(media) = &self.local_media {
            self.link.add_local_media(media).await?;
            self.tracks_attached = true;
            debug!(peer = %self.remote.short(), tracks = media.tracks().len(), "attached local tracks");
        }
        Ok(())
    }

    async fn flush_pending_ice(&mut self) {
        for candidate in std::mem::take(&mut self.pending_ice) {
            match self.link.add_ice_candidate(candidate).await {
                Ok(()) => self.applied_ice += 1,
                Err(e) => warn!(peer = %self.remote.short(), error = %e, "queued ICE candidate rejected"),
            }
        }
    }

    /// Create and apply a local offer.
    ///
    /// Returns `Ok(None)` when a local description already exists and
    /// [`PeerError::MediaNotReady`] when there is nothing to send yet.
    pub async fn create_offer(&mut self) -> Result<Option<SessionDescription>, PeerError> {
        self.ensure_open("create offer")?;
        if self.has_local_description {
            debug!(peer = %self.remote.short(), "offer skipped, local description exists");
            return Ok(None);
        }
        if self.local_media.is_none() {
            return Err(PeerError::MediaNotReady);
        }

        self.attach_tracks().await?;
        let offer = self.link.create_offer().await?;
        self.link.set_local_description(offer.clone()).await?;
        self.has_local_description = true;
        self.state = NegotiationState::OfferSent;

        debug!(room = %self.room, peer = %self.remote.short(), "created SDP offer");
        Ok(Some(offer))
    }

    /// Answer a remote offer. The answer is addressed to [`Self::remote`].
    pub async fn handle_offer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, PeerError> {
        self.ensure_open("handle offer")?;
        if !matches!(self.state, NegotiationState::Idle) {
            return Err(PeerError::InvalidState {
                operation: "handle offer",
                state: self.state,
            });
        }

        self.link.set_remote_description(offer).await?;
        self.has_remote_description = true;
        self.state = NegotiationState::OfferReceived;
        self.flush_pending_ice().await;

        self.attach_tracks().await?;
        let answer = self.link.create_answer().await?;
        self.link.set_local_description(answer.clone()).await?;
        self.has_local_description = true;
        self.state = NegotiationState::AnswerSent;

        debug!(room = %self.room, peer = %self.remote.short(), "created SDP answer");
        Ok(answer)
    }

    pub async fn handle_answer(&mut self, answer: SessionDescription) -> Result<(), PeerError> {
        if self.state != NegotiationState::OfferSent {
            return Err(PeerError::InvalidState {
                operation: "handle answer",
                state: self.state,
            });
        }

        self.link.set_remote_description(answer).await?;
        self.has_remote_description = true;
        self.flush_pending_ice().await;
        self.state = NegotiationState::Connected;
        self.attach_tracks().await?;

        debug!(room = %self.room, peer = %self.remote.short(), "applied SDP answer");
        Ok(())
    }

    /// Apply a remote candidate, or queue it until the remote description
    /// is known. Queued candidates keep their arrival order.
    pub async fn handle_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.ensure_open("add ICE candidate")?;
        if !self.has_remote_description {
            self.pending_ice.push(candidate);
            debug!(peer = %self.remote.short(), queued = self.pending_ice.len(), "queued ICE candidate");
            return Ok(());
        }
        self.link.add_ice_candidate(candidate).await?;
        self.applied_ice += 1;
        Ok(())
    }

    /// Queue candidates that arrived before this connection existed.
    pub fn queue_early_candidates(&mut self, candidates: Vec<IceCandidate>) {
        self.pending_ice.extend(candidates);
    }

    /// Feed a connection-state or ICE-state update.
    pub fn on_link_state(&mut self, state: LinkState) -> ConnectivityChange {
        if self.state == NegotiationState::Closed {
            return ConnectivityChange::Unchanged;
        }
        match state {
            LinkState::Connected => {
                if matches!(
                    self.state,
                    NegotiationState::AnswerSent | NegotiationState::OfferReceived
                ) {
                    self.state = NegotiationState::Connected;
                }
                if self.connected {
                    ConnectivityChange::Unchanged
                } else {
                    self.connected = true;
                    info!(room = %self.room, peer = %self.remote.short(), "peer connected");
                    ConnectivityChange::Connected
                }
            }
            LinkState::Disconnected | LinkState::Closed => {
                if self.connected {
                    self.connected = false;
                    info!(room = %self.room, peer = %self.remote.short(), "peer disconnected");
                    ConnectivityChange::Disconnected
                } else {
                    ConnectivityChange::Unchanged
                }
            }
            LinkState::Failed => {
                self.connected = false;
                warn!(room = %self.room, peer = %self.remote.short(), "peer connection failed");
                ConnectivityChange::Failed
            }
            LinkState::New | LinkState::Connecting => ConnectivityChange::Unchanged,
        }
    }

    pub fn add_remote_track(&mut self, stream_id: String, track_id: String, kind: TrackKind) {
        let stream = self
            .remote_streams
            .entry(stream_id.clone())
            .or_insert_with(|| RemoteStream {
                stream_id,
                tracks: Vec::new(),
            });
        if !stream.tracks.iter().any(|(id, _)| *id == track_id) {
            stream.tracks.push((track_id, kind));
        }
    }

    /// Close the link. Safe to call more than once.
    pub async fn close(&mut self) {
        if self.state == NegotiationState::Closed {
            return;
        }
        self.state = NegotiationState::Closed;
        self.connected = false;
        self.pending_ice.clear();
        self.remote_streams.clear();
        if let Err(e) = self.link.close().await {
            warn!(peer = %self.remote.short(), error = %e, "error while closing link");
        }
        debug!(room = %self.room, peer = %self.remote.short(), "connection closed");
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// All live connections, keyed by `(room, remote peer)`.
pub struct ConnectionRegistry {
    connections: HashMap<(RoomKey, PeerId), PeerConnection>,
    max_connections: usize,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: HashMap::new(),
            max_connections,
        }
    }

    pub fn insert(&mut self, connection: PeerConnection) -> Result<(), PeerError> {
        let key = (connection.room.clone(), connection.remote.clone());
        if !self.connections.contains_key(&key) && self.connections.len() >= self.max_connections
        {
            return Err(PeerError::MaxConnectionsReached(self.max_connections));
        }
        self.connections.insert(key, connection);
        Ok(())
    }

    pub fn get(&self, room: &RoomKey, peer: &PeerId) -> Option<&PeerConnection> {
        self.connections.get(&(room.clone(), peer.clone()))
    }

    pub fn get_mut(&mut self, room: &RoomKey, peer: &PeerId) -> Option<&mut PeerConnection> {
        self.connections.get_mut(&(room.clone(), peer.clone()))
    }

    pub fn contains(&self, room: &RoomKey, peer: &PeerId) -> bool {
        self.connections.contains_key(&(room.clone(), peer.clone()))
    }

    /// Remove and close one connection. Returns whether it existed.
    pub async fn close(&mut self, room: &RoomKey, peer: &PeerId) -> bool {
        match self.connections.remove(&(room.clone(), peer.clone())) {
            Some(mut connection) => {
                connection.close().await;
                true
            }
            None => false,
        }
    }

    pub async fn close_all(&mut self) {
        let count = self.connections.len();
        for (_, mut connection) in self.connections.drain() {
            connection.close().await;
        }
        if count > 0 {
            info!(count, "closed all peer connections");
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::LocalTrack;
    use crate::testing::{candidate, FakeLink};

    fn media() -> Arc<LocalMedia> {
        Arc::new(LocalMedia::new(
            "local",
            vec![
                LocalTrack::new("a", TrackKind::Audio),
                LocalTrack::new("v", TrackKind::Video),
            ],
        ))
    }

    fn connection(media: Option<Arc<LocalMedia>>) -> (PeerConnection, FakeLink) {
        let link = FakeLink::new();
        let pc = PeerConnection::new(
            RoomKey::interview("r1"),
            PeerId::from("remote"),
            Box::new(link.clone()),
            media,
        );
        (pc, link)
    }

    #[tokio::test]
    async fn test_offer_requires_media() {
        let (mut pc, _) = connection(None);
        assert!(matches!(pc.create_offer().await, Err(PeerError::MediaNotReady)));
        assert_eq!(pc.state(), NegotiationState::Idle);
    }

    #[tokio::test]
    async fn test_second_offer_is_noop() {
        let (mut pc, link) = connection(Some(media()));
        assert!(pc.create_offer().await.unwrap().is_some());
        assert!(pc.create_offer().await.unwrap().is_none());
        assert_eq!(pc.state(), NegotiationState::OfferSent);
        assert_eq!(link.log().offers_created, 1);
        assert_eq!(link.log().media_attached, 1);
    }

    #[tokio::test]
    async fn test_ice_before_answer_is_queued_then_flushed_in_order() {
        let (mut pc, link) = connection(Some(media()));
        pc.create_offer().await.unwrap();

        pc.handle_ice_candidate(candidate("c1")).await.unwrap();
        pc.handle_ice_candidate(candidate("c2")).await.unwrap();
        assert_eq!(pc.pending_ice_count(), 2);
        assert!(link.log().candidates.is_empty());

        pc.handle_answer(SessionDescription::answer("remote-answer"))
            .await
            .unwrap();

        assert_eq!(pc.pending_ice_count(), 0);
        assert_eq!(link.log().candidates, vec!["c1".to_string(), "c2".to_string()]);
        assert_eq!(pc.state(), NegotiationState::Connected);

        pc.handle_ice_candidate(candidate("c3")).await.unwrap();
        assert_eq!(pc.applied_ice_count(), 3);
    }

    #[tokio::test]
    async fn test_handle_offer_flushes_early_candidates_and_answers() {
        let (mut pc, link) = connection(Some(media()));
        pc.queue_early_candidates(vec![candidate("early")]);

        let answer = pc
            .handle_offer(SessionDescription::offer("remote-offer"))
            .await
            .unwrap();

        assert_eq!(answer.kind, blocklearn_shared::protocol::SdpKind::Answer);
        assert_eq!(pc.state(), NegotiationState::AnswerSent);
        assert_eq!(link.log().candidates, vec!["early".to_string()]);
        assert_eq!(link.log().remote_descriptions, 1);
    }

    #[tokio::test]
    async fn test_answer_in_wrong_state_is_rejected() {
        let (mut pc, _) = connection(Some(media()));
        let err = pc
            .handle_answer(SessionDescription::answer("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_link_state_drives_connected_flag() {
        let (mut pc, _) = connection(Some(media()));
        assert_eq!(pc.on_link_state(LinkState::Connecting), ConnectivityChange::Unchanged);
        assert_eq!(pc.on_link_state(LinkState::Connected), ConnectivityChange::Connected);
        // ICE and peer-connection callbacks both report connected
        assert_eq!(pc.on_link_state(LinkState::Connected), ConnectivityChange::Unchanged);
        assert_eq!(pc.on_link_state(LinkState::Disconnected), ConnectivityChange::Disconnected);
        assert_eq!(pc.on_link_state(LinkState::Failed), ConnectivityChange::Failed);
        assert!(!pc.is_connected());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut pc, link) = connection(Some(media()));
        pc.create_offer().await.unwrap();
        pc.close().await;
        pc.close().await;
        assert_eq!(pc.state(), NegotiationState::Closed);
        assert_eq!(link.log().closed, 1);
        assert!(pc.create_offer().await.is_err());
    }

    #[tokio::test]
    async fn test_registry_limits_and_closes() {
        let mut registry = ConnectionRegistry::new(1);
        let (a, link_a) = connection(None);
        registry.insert(a).unwrap();

        let other = PeerConnection::new(
            RoomKey::interview("r1"),
            PeerId::from("other"),
            Box::new(FakeLink::new()),
            None,
        );
        assert!(matches!(
            registry.insert(other),
            Err(PeerError::MaxConnectionsReached(1))
        ));

        let room = RoomKey::interview("r1");
        assert!(registry.contains(&room, &PeerId::from("remote")));
        assert_eq!(registry.len(), 1);
        registry.close_all().await;
        assert!(registry.is_empty());
        assert_eq!(link_a.log().closed, 1);
    }
}
