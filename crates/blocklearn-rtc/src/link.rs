//! Backend seam between [`crate::peer::PeerConnection`] and an actual WebRTC
//! stack.

use std::sync::Arc;

use async_trait::async_trait;
use blocklearn_shared::protocol::{IceCandidate, SessionDescription};
use blocklearn_shared::{PeerId, RoomKey};
use tokio::sync::mpsc;

use crate::error::PeerError;
use crate::media::{LocalMedia, TrackKind};

/// Connectivity as reported by either the peer-connection or the
/// ICE-connection state callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEventKind {
    /// A local candidate to trickle to the remote peer.
    IceCandidate(IceCandidate),
    ConnectionState(LinkState),
    IceConnectionState(LinkState),
    RemoteTrack {
        stream_id: String,
        track_id: String,
        kind: TrackKind,
    },
}

/// Callback output of a link, tagged with the connection it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkEvent {
    pub room: RoomKey,
    pub peer: PeerId,
    pub kind: LinkEventKind,
}

pub type LinkEventSender = mpsc::UnboundedSender<LinkEvent>;

/// One point-to-point media connection.
#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    /// Attach every track of the local stream to the connection.
    async fn add_local_media(&self, media: &Arc<LocalMedia>) -> Result<(), PeerError>;

    async fn close(&self) -> Result<(), PeerError>;
}

/// Creates links whose callbacks are forwarded into `events`.
#[async_trait]
pub trait LinkFactory: Send + Sync {
    async fn create(
        &self,
        room: &RoomKey,
        peer: &PeerId,
        events: LinkEventSender,
    ) -> Result<Box<dyn PeerLink>, PeerError>;
}
