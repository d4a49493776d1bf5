//! Room membership and the decision of who offers to whom.
//!
//! Rules:
//! - an existing member offers to a peer that joins after it;
//! - a newcomer learns the existing members from `room-joined` and waits
//!   for their offers;
//! - the per-peer offer guard is checked and set in the same call that
//!   schedules the offer, so a repeated `user-joined` never yields a second
//!   offer until the peer leaves.

use std::collections::{HashMap, HashSet};

use blocklearn_shared::protocol::{ClientEvent, PeerInfo};
use blocklearn_shared::{Identity, PeerId, RoomKey};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceAction {
    /// Create an offer to this peer after the debounce delay.
    ScheduleOffer(PeerId),
    /// Close the connection to this peer and drop its remote media.
    TearDown(PeerId),
}

#[derive(Debug, Default)]
pub struct PresenceCoordinator {
    room: Option<RoomKey>,
    local_peer: Option<PeerId>,
    peers: HashMap<PeerId, Identity>,
    offer_guard: HashSet<PeerId>,
    awaiting_media: Vec<PeerId>,
    media_ready: bool,
}

impl PresenceCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// The frame that (re)joins `room`.
    pub fn join_event(room: &RoomKey, identity: &Identity) -> ClientEvent {
        ClientEvent::JoinRoom {
            room: room.clone(),
            identity: identity.clone(),
        }
    }

    pub fn join(&mut self, room: RoomKey, identity: &Identity) -> ClientEvent {
        let event = Self::join_event(&room, identity);
        info!(room = %room, user = %identity.id, "joining room");
        self.room = Some(room);
        event
    }

    pub fn leave(&mut self) -> Option<ClientEvent> {
        let room = self.room.take()?;
        self.peers.clear();
        self.offer_guard.clear();
        self.awaiting_media.clear();
        self.local_peer = None;
        Some(ClientEvent::LeaveRoom { room })
    }

    pub fn room(&self) -> Option<&RoomKey> {
        self.room.as_ref()
    }

    pub fn local_peer(&self) -> Option<&PeerId> {
        self.local_peer.as_ref()
    }

    pub fn is_present(&self, peer: &PeerId) -> bool {
        self.peers.contains_key(peer)
    }

    pub fn identity_of(&self, peer: &PeerId) -> Option<&Identity> {
        self.peers.get(peer)
    }

    pub fn peers(&self) -> impl Iterator<Item = (&PeerId, &Identity)> {
        self.peers.iter()
    }

    pub fn has_offer_guard(&self, peer: &PeerId) -> bool {
        self.offer_guard.contains(peer)
    }

    /// Join acknowledgement. Existing members are recorded but never offered
    /// to. Returns teardowns for peers that vanished while we were away.
    pub fn on_room_joined(&mut self, local: PeerId, peers: Vec<PeerInfo>) -> Vec<PresenceAction> {
        info!(peer = %local.short(), present = peers.len(), "joined room");

        let current: HashSet<PeerId> = peers.iter().map(|p| p.peer_id.clone()).collect();
        let gone: Vec<PeerId> = self
            .peers
            .keys()
            .filter(|p| !current.contains(*p))
            .cloned()
            .collect();

        let mut actions = Vec::new();
        for peer in gone {
            self.forget(&peer);
            actions.push(PresenceAction::TearDown(peer));
        }

        for info in peers {
            if info.peer_id != local {
                self.peers.insert(info.peer_id, info.identity);
            }
        }
        self.local_peer = Some(local);
        actions
    }

    pub fn on_peer_joined(&mut self, peer: PeerId, identity: Identity) -> Option<PresenceAction> {
        if self.local_peer.as_ref() == Some(&peer) {
            return None;
        }
        self.peers.insert(peer.clone(), identity);

        if !self.media_ready {
            if !self.awaiting_media.contains(&peer) {
                debug!(peer = %peer.short(), "peer joined before local media, offer deferred");
                self.awaiting_media.push(peer);
            }
            return None;
        }
        self.guard_and_schedule(peer)
    }

    fn guard_and_schedule(&mut self, peer: PeerId) -> Option<PresenceAction> {
        if !self.offer_guard.insert(peer.clone()) {
            debug!(peer = %peer.short(), "offer already scheduled");
            return None;
        }
        Some(PresenceAction::ScheduleOffer(peer))
    }

    pub fn on_peer_left(&mut self, peer: &PeerId) -> Option<PresenceAction> {
        if !self.peers.contains_key(peer) && !self.offer_guard.contains(peer) {
            return None;
        }
        self.forget(peer);
        info!(peer = %peer.short(), "peer left");
        Some(PresenceAction::TearDown(peer.clone()))
    }

    fn forget(&mut self, peer: &PeerId) {
        self.peers.remove(peer);
        self.offer_guard.remove(peer);
        self.awaiting_media.retain(|p| p != peer);
    }

    /// Local media became available; offer to everyone who was waiting.
    pub fn on_local_ready(&mut self) -> Vec<PresenceAction> {
        self.media_ready = true;
        let waiting = std::mem::take(&mut self.awaiting_media);
        waiting
            .into_iter()
            .filter_map(|p| {
                if self.peers.contains_key(&p) {
                    self.guard_and_schedule(p)
                } else {
                    None
                }
            })
            .collect()
    }

    /// Clear the guard so a future join may offer again, e.g. after the
    /// offer attempt gave up or the connection failed.
    pub fn release_offer(&mut self, peer: &PeerId) {
        self.offer_guard.remove(peer);
    }
}
