//! Room membership and event routing.
//!
//! Every WebSocket connection gets a [`PeerId`] and an outbox. Peers join
//! rooms by key; rooms are created on first join and dropped when the last
//! member leaves. Offers, answers and ICE candidates go to one target peer,
//! room events go to every member of the room.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use blocklearn_shared::protocol::{ClientEvent, PeerInfo, RoomEvent, ServerEvent};
use blocklearn_shared::{Identity, PeerId, RoomKey};
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::error::ServerError;

pub type Outbox = mpsc::Sender<ServerEvent>;

struct Connection {
    outbox: Outbox,
    rooms: HashSet<RoomKey>,
}

#[derive(Default)]
struct State {
    connections: HashMap<PeerId, Connection>,
    /// Members in join order.
    rooms: HashMap<RoomKey, Vec<PeerInfo>>,
}

impl State {
    fn deliver(&self, to: &PeerId, event: ServerEvent) {
        let Some(conn) = self.connections.get(to) else {
            return;
        };
        match conn.outbox.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(peer = %to.short(), "Dropping frame for slow peer");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(peer = %to.short(), "Outbox closed");
            }
        }
    }

    fn is_member(&self, room: &RoomKey, peer: &PeerId) -> bool {
        self.rooms
            .get(room)
            .is_some_and(|members| members.iter().any(|m| &m.peer_id == peer))
    }

    fn share_room(&self, a: &PeerId, b: &PeerId) -> bool {
        self.connections
            .get(a)
            .is_some_and(|conn| conn.rooms.iter().any(|room| self.is_member(room, b)))
    }

    fn remove_member(&mut self, room: &RoomKey, peer: &PeerId) -> bool {
        let Some(members) = self.rooms.get_mut(room) else {
            return false;
        };
        let before = members.len();
        members.retain(|m| &m.peer_id != peer);
        if members.len() == before {
            return false;
        }

        let remaining: Vec<PeerId> = members.iter().map(|m| m.peer_id.clone()).collect();
        if remaining.is_empty() {
            self.rooms.remove(room);
            debug!(room = %room, "Room closed");
        }
        if let Some(conn) = self.connections.get_mut(peer) {
            conn.rooms.remove(room);
        }
        for other in &remaining {
            self.deliver(
                other,
                ServerEvent::UserLeft {
                    peer_id: peer.clone(),
                },
            );
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomStats {
    pub room: RoomKey,
    pub participants: usize,
}

/// Shared, cloneable handle to the relay's rooms.
#[derive(Clone)]
pub struct RoomRegistry {
    state: Arc<RwLock<State>>,
    max_room_size: usize,
    echo: bool,
}

impl RoomRegistry {
    /// `max_room_size` of 0 means unlimited. With `echo` set, room events
    /// are also delivered back to their sender.
    pub fn new(max_room_size: usize, echo: bool) -> Self {
        Self {
            state: Arc::new(RwLock::new(State::default())),
            max_room_size,
            echo,
        }
    }

    /// Register a new connection and assign its peer id.
    pub async fn connect(&self, outbox: Outbox) -> PeerId {
        let peer = PeerId::new();
        self.state.write().await.connections.insert(
            peer.clone(),
            Connection {
                outbox,
                rooms: HashSet::new(),
            },
        );
        debug!(peer = %peer.short(), "Connection registered");
        peer
    }

    /// Leave every room and forget the connection.
    pub async fn disconnect(&self, peer: &PeerId) {
        let mut state = self.state.write().await;
        let rooms: Vec<RoomKey> = state
            .connections
            .get(peer)
            .map(|c| c.rooms.iter().cloned().collect())
            .unwrap_or_default();
        for room in &rooms {
            state.remove_member(room, peer);
        }
        state.connections.remove(peer);
        info!(peer = %peer.short(), rooms = rooms.len(), "Peer disconnected");
    }

    pub async fn dispatch(&self, sender: &PeerId, event: ClientEvent) -> Result<(), ServerError> {
        match event {
            ClientEvent::JoinRoom { room, identity } => self.join(sender, room, identity).await,
            ClientEvent::LeaveRoom { room } => self.leave(sender, &room).await,
            ClientEvent::Offer { target, offer } => {
                let event = ServerEvent::Offer {
                    sender: sender.clone(),
                    offer,
                };
                self.send_to(sender, &target, event).await
            }
            ClientEvent::Answer { target, answer } => {
                let event = ServerEvent::Answer {
                    sender: sender.clone(),
                    answer,
                };
                self.send_to(sender, &target, event).await
            }
            ClientEvent::IceCandidate { target, candidate } => {
                let event = ServerEvent::IceCandidate {
                    sender: sender.clone(),
                    candidate,
                };
                self.send_to(sender, &target, event).await
            }
            ClientEvent::RoomEvent { room, event } => self.broadcast(sender, &room, event).await,
        }
    }

    pub async fn join(
        &self,
        peer: &PeerId,
        room: RoomKey,
        identity: Identity,
    ) -> Result<(), ServerError> {
        let mut state = self.state.write().await;
        if !state.connections.contains_key(peer) {
            return Err(ServerError::UnknownPeer(peer.clone()));
        }

        let rejoin = state.is_member(&room, peer);
        let size = state.rooms.get(&room).map_or(0, Vec::len);
        if !rejoin && self.max_room_size > 0 && size >= self.max_room_size {
            warn!(room = %room, peer = %peer.short(), size, "Room full");
            return Err(ServerError::RoomFull {
                room,
                max: self.max_room_size,
            });
        }

        let members = state.rooms.entry(room.clone()).or_default();
        match members.iter_mut().find(|m| &m.peer_id == peer) {
            Some(member) => member.identity = identity.clone(),
            None => members.push(PeerInfo {
                peer_id: peer.clone(),
                identity: identity.clone(),
            }),
        }
        let others: Vec<PeerInfo> = members
            .iter()
            .filter(|m| &m.peer_id != peer)
            .cloned()
            .collect();
        if let Some(conn) = state.connections.get_mut(peer) {
            conn.rooms.insert(room.clone());
        }

        info!(
            room = %room,
            peer = %peer.short(),
            user = %identity.id,
            members = others.len() + 1,
            rejoin,
            "Peer joined room"
        );

        for other in &others {
            state.deliver(
                &other.peer_id,
                ServerEvent::UserJoined {
                    peer_id: peer.clone(),
                    identity: identity.clone(),
                },
            );
        }
        state.deliver(
            peer,
            ServerEvent::RoomJoined {
                room,
                peer_id: peer.clone(),
                peers: others,
            },
        );
        Ok(())
    }

    pub async fn leave(&self, peer: &PeerId, room: &RoomKey) -> Result<(), ServerError> {
        let mut state = self.state.write().await;
        if !state.remove_member(room, peer) {
            return Err(ServerError::NotInRoom(room.clone()));
        }
        info!(room = %room, peer = %peer.short(), "Peer left room");
        Ok(())
    }

    /// Route a point-to-point frame. The target must share a room with the
    /// sender.
    async fn send_to(
        &self,
        sender: &PeerId,
        target: &PeerId,
        event: ServerEvent,
    ) -> Result<(), ServerError> {
        let state = self.state.read().await;
        if !state.connections.contains_key(target) || !state.share_room(sender, target) {
            debug!(sender = %sender.short(), target = %target.short(), "Target not reachable");
            return Err(ServerError::UnknownPeer(target.clone()));
        }
        state.deliver(target, event);
        Ok(())
    }

    async fn broadcast(
        &self,
        sender: &PeerId,
        room: &RoomKey,
        event: RoomEvent,
    ) -> Result<(), ServerError> {
        let state = self.state.read().await;
        if !state.is_member(room, sender) {
            return Err(ServerError::NotInRoom(room.clone()));
        }
        let targets: Vec<PeerId> = state
            .rooms
            .get(room)
            .map(|members| {
                members
                    .iter()
                    .map(|m| m.peer_id.clone())
                    .filter(|p| self.echo || p != sender)
                    .collect()
            })
            .unwrap_or_default();

        for target in &targets {
            state.deliver(
                target,
                ServerEvent::RoomEvent {
                    sender: sender.clone(),
                    event: event.clone(),
                },
            );
        }
        Ok(())
    }

    pub async fn stats(&self) -> Vec<RoomStats> {
        let state = self.state.read().await;
        let mut stats: Vec<RoomStats> = state
            .rooms
            .iter()
            .map(|(room, members)| RoomStats {
                room: room.clone(),
                participants: members.len(),
            })
            .collect();
        stats.sort_by(|a, b| a.room.cmp(&b.room));
        stats
    }

    pub async fn room_stats(&self, room: &RoomKey) -> Option<RoomStats> {
        self.state.read().await.rooms.get(room).map(|members| RoomStats {
            room: room.clone(),
            participants: members.len(),
        })
    }

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }
}
