//! The call engine: one tokio task owning every piece of call state.
//!
//! Commands from the UI, relay frames, link callbacks, deferred offers,
//! REST completions and the 1 Hz clock all arrive through channels and are
//! handled one at a time in [`CallEngine::run`]. Nothing here is shared, so
//! nothing is locked.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use blocklearn_shared::protocol::{
    ClientEvent, IceCandidate, MessageType, ProposalDecision, RoomEvent, ServerEvent,
    SessionDescription, SessionProposal,
};
use blocklearn_shared::{Identity, PeerId, RoomKey};
use blocklearn_store::{SqliteStore, StateStore, StateStoreExt};
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::api::{DurableMessage, HttpSessionApi, NewSession, Rating, SessionApi};
use crate::chat::{ChatLog, ChatMessage, ChatUpdate};
use crate::config::EngineConfig;
use crate::error::{ApiError, EngineError, MediaError, PeerError};
use crate::link::{LinkEvent, LinkEventKind, LinkEventSender, LinkFactory};
use crate::media::{LocalMedia, MediaSource, SyntheticMediaSource, TrackKind};
use crate::negotiation::{
    ChatDraft, Effects, NegotiationNotice, NegotiationSnapshot, SessionNegotiator,
};
use crate::peer::{ConnectionRegistry, ConnectivityChange, NegotiationState, PeerConnection};
use crate::presence::{PresenceAction, PresenceCoordinator};
use crate::transport::{SignalingTransport, TransportEvent, TransportHandle};
use crate::webrtc_link::WebRtcLinkFactory;

const CHAT_KEY: &str = "chat";
const NEGOTIATION_KEY: &str = "negotiation";
const COMMAND_CAPACITY: usize = 64;
/// Per-peer limit on candidates held before a connection exists.
const MAX_ORPHAN_ICE: usize = 64;
/// Room state untouched for this long is dropped when a call starts.
const STATE_RETENTION_DAYS: i64 = 30;

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug)]
pub enum EngineCommand {
    Propose {
        date: String,
        time: String,
        duration_minutes: u32,
        topic: String,
    },
    Respond {
        proposal_id: String,
        decision: ProposalDecision,
    },
    EndSession,
    CompleteSession,
    SendChat(String),
    ShareLink(String),
    ToggleMute,
    ToggleVideo,
    SubmitRating(Rating),
    LoadHistory,
    Hangup(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingStatus {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting { attempt: u32 },
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FatalReason {
    SignalingUnavailable,
    Media(MediaError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Signaling(SignalingStatus),
    Joined {
        room: RoomKey,
        peer_id: PeerId,
    },
    PeerJoined {
        peer: PeerId,
        identity: Identity,
    },
    PeerLeft {
        peer: PeerId,
    },
    Connectivity {
        peer: PeerId,
        connected: bool,
    },
    RemoteTrack {
        peer: PeerId,
        stream_id: String,
        track_id: String,
        kind: TrackKind,
    },
    LocalMedia {
        muted: bool,
        video_enabled: bool,
    },
    Chat(ChatMessage),
    ChatConfirmed {
        correlation_id: String,
    },
    Negotiation(NegotiationNotice),
    /// Transient, non-blocking problem worth a banner.
    Notice(String),
    /// The call cannot proceed without user action.
    Fatal {
        reason: FatalReason,
        message: String,
    },
    Closed,
}

/// Collaborators injected into the engine.
pub struct EngineDeps {
    pub links: Arc<dyn LinkFactory>,
    pub media: Arc<dyn MediaSource>,
    pub store: Arc<dyn StateStore>,
    pub api: Option<Arc<dyn SessionApi>>,
    pub clock: Clock,
}

impl EngineDeps {
    /// `webrtc`-crate links, synthetic media, the on-disk store and the REST
    /// API configured in the profile.
    pub fn production(config: &EngineConfig) -> Result<Self, EngineError> {
        let links = WebRtcLinkFactory::new(&config.ice_servers)?;
        let store = SqliteStore::open_default()?;
        let cutoff = Utc::now() - chrono::Duration::days(STATE_RETENTION_DAYS);
        if let Err(e) = store.prune_before(cutoff) {
            warn!(error = %e, "failed to prune stale room state");
        }
        #[cfg(feature = "capture")]
        let media: Arc<dyn MediaSource> = Arc::new(crate::capture::MicrophoneSource);
        #[cfg(not(feature = "capture"))]
        let media: Arc<dyn MediaSource> = Arc::new(SyntheticMediaSource::new());
        let api: Option<Arc<dyn SessionApi>> = match HttpSessionApi::from_profile(&config.profile)
        {
            Some(api) => Some(Arc::new(api?)),
            None => None,
        };
        Ok(Self {
            links: Arc::new(links),
            media,
            store: Arc::new(store),
            api,
            clock: Arc::new(Utc::now),
        })
    }
}

/// Cheap, cloneable front of a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    async fn send(&self, command: EngineCommand) -> Result<(), EngineError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| EngineError::NotRunning)
    }

    pub async fn propose(
        &self,
        date: impl Into<String>,
        time: impl Into<String>,
        duration_minutes: u32,
        topic: impl Into<String>,
    ) -> Result<(), EngineError> {
        self.send(EngineCommand::Propose {
            date: date.into(),
            time: time.into(),
            duration_minutes,
            topic: topic.into(),
        })
        .await
    }

    pub async fn respond(
        &self,
        proposal_id: impl Into<String>,
        decision: ProposalDecision,
    ) -> Result<(), EngineError> {
        self.send(EngineCommand::Respond {
            proposal_id: proposal_id.into(),
            decision,
        })
        .await
    }

    pub async fn end_session(&self) -> Result<(), EngineError> {
        self.send(EngineCommand::EndSession).await
    }

    pub async fn complete_session(&self) -> Result<(), EngineError> {
        self.send(EngineCommand::CompleteSession).await
    }

    pub async fn send_chat(&self, text: impl Into<String>) -> Result<(), EngineError> {
        self.send(EngineCommand::SendChat(text.into())).await
    }

    pub async fn share_link(&self, url: impl Into<String>) -> Result<(), EngineError> {
        self.send(EngineCommand::ShareLink(url.into())).await
    }

    pub async fn toggle_mute(&self) -> Result<(), EngineError> {
        self.send(EngineCommand::ToggleMute).await
    }

    pub async fn toggle_video(&self) -> Result<(), EngineError> {
        self.send(EngineCommand::ToggleVideo).await
    }

    pub async fn submit_rating(&self, rating: Rating) -> Result<(), EngineError> {
        self.send(EngineCommand::SubmitRating(rating)).await
    }

    pub async fn load_history(&self) -> Result<(), EngineError> {
        self.send(EngineCommand::LoadHistory).await
    }

    /// Leave the room and release every resource. Returns once the engine
    /// has shut down; calling it again is a no-op.
    pub async fn hangup(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(EngineCommand::Hangup(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

/// Completions posted back into the engine loop.
enum Internal {
    OfferDue(PeerId),
    MediaAcquired(Result<Arc<LocalMedia>, MediaError>),
    SessionCreated(Result<String, ApiError>),
    HistoryLoaded(Result<Vec<DurableMessage>, ApiError>),
    RatingSubmitted(Result<(), ApiError>),
    MessagePostFailed(ApiError),
}

pub struct CallEngine {
    config: EngineConfig,
    identity: Identity,
    room: RoomKey,
    deps: EngineDeps,
    transport: TransportHandle,
    presence: PresenceCoordinator,
    connections: ConnectionRegistry,
    negotiator: SessionNegotiator,
    chat: ChatLog,
    media: Option<Arc<LocalMedia>>,
    /// Remote offers that arrived before local media.
    deferred_offers: HashMap<PeerId, SessionDescription>,
    /// Candidates from present peers we have no connection with yet.
    orphan_ice: HashMap<PeerId, Vec<IceCandidate>>,
    offer_attempts: HashMap<PeerId, u32>,
    events: mpsc::UnboundedSender<EngineEvent>,
    internal: mpsc::UnboundedSender<Internal>,
    link_events: LinkEventSender,
    closed: bool,
}

impl CallEngine {
    /// Production entry point: real WebRTC, on-disk state, WebSocket relay.
    pub fn launch(
        config: EngineConfig,
        identity: Identity,
        room: RoomKey,
    ) -> Result<(EngineHandle, mpsc::UnboundedReceiver<EngineEvent>), EngineError> {
        let deps = EngineDeps::production(&config)?;
        Self::connect(config, identity, room, deps)
    }

    /// Connect to the relay at `config.signaling_url` and start the engine.
    pub fn connect(
        config: EngineConfig,
        identity: Identity,
        room: RoomKey,
        deps: EngineDeps,
    ) -> Result<(EngineHandle, mpsc::UnboundedReceiver<EngineEvent>), EngineError> {
        let join = PresenceCoordinator::join_event(&room, &identity);
        let (transport, transport_events) = SignalingTransport::connect(&config, join)?;
        Ok(Self::spawn(
            config,
            identity,
            room,
            transport,
            transport_events,
            deps,
        ))
    }

    /// Start the engine on an already connected transport. The transport
    /// is responsible for delivering the join frame.
    pub fn spawn(
        config: EngineConfig,
        identity: Identity,
        room: RoomKey,
        transport: TransportHandle,
        transport_events: mpsc::Receiver<TransportEvent>,
        deps: EngineDeps,
    ) -> (EngineHandle, mpsc::UnboundedReceiver<EngineEvent>) {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = mpsc::unbounded_channel();

        let negotiator = SessionNegotiator::new(
            identity.clone(),
            config.profile.role,
            config.response_buffer_ttl(),
            config.response_buffer_capacity,
        );

        let engine = CallEngine {
            connections: ConnectionRegistry::new(config.max_connections),
            config,
            identity,
            room,
            deps,
            transport,
            presence: PresenceCoordinator::new(),
            negotiator,
            chat: ChatLog::new(),
            media: None,
            deferred_offers: HashMap::new(),
            orphan_ice: HashMap::new(),
            offer_attempts: HashMap::new(),
            events: events_tx,
            internal: internal_tx,
            link_events: link_tx,
            closed: false,
        };

        tokio::spawn(engine.run(commands_rx, transport_events, internal_rx, link_rx));
        (
            EngineHandle {
                commands: commands_tx,
            },
            events_rx,
        )
    }

    fn now(&self) -> DateTime<Utc> {
        (self.deps.clock)()
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    fn notice(&self, message: impl Into<String>) {
        self.emit(EngineEvent::Notice(message.into()));
    }

    fn send(&self, event: ClientEvent) {
        if let Err(e) = self.transport.emit(event) {
            warn!(error = %e, "failed to queue signaling frame");
        }
    }

    fn peer_label(&self, peer: &PeerId) -> String {
        self.presence
            .identity_of(peer)
            .map(|i| i.display_name())
            .unwrap_or_else(|| self.config.profile.remote_label.clone())
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<EngineCommand>,
        mut transport_events: mpsc::Receiver<TransportEvent>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
        mut link_events: mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        self.start();

        let mut clock = tokio::time::interval(Duration::from_secs(1));
        clock.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut transport_open = true;

        while !self.closed {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("engine handle dropped");
                        self.hangup().await;
                    }
                },

                event = transport_events.recv(), if transport_open => match event {
                    Some(event) => self.handle_transport(event).await,
                    None => transport_open = false,
                },

                Some(event) = internal.recv() => self.handle_internal(event).await,

                Some(event) = link_events.recv() => self.handle_link(event).await,

                _ = clock.tick() => {
                    let effects = self.negotiator.tick(self.now());
                    self.apply(effects);
                }
            }
        }

        debug!(room = %self.room, "engine stopped");
    }

    fn start(&mut self) {
        info!(room = %self.room, user = %self.identity.id, role = %self.config.profile.role, "starting call engine");
        self.presence.join(self.room.clone(), &self.identity);
        self.emit(EngineEvent::Signaling(SignalingStatus::Connecting));
        self.restore();

        let media = self.deps.media.clone();
        let constraints = self.config.media;
        let internal = self.internal.clone();
        tokio::spawn(async move {
            let result = media.acquire(constraints).await;
            let _ = internal.send(Internal::MediaAcquired(result));
        });

        if self.negotiator.session_id().is_some() {
            self.load_history();
        }
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    fn restore(&mut self) {
        let scope = self.room.as_str();
        match self.deps.store.load_json::<Vec<ChatMessage>>(scope, CHAT_KEY) {
            Ok(Some(messages)) => {
                debug!(count = messages.len(), "restored chat history");
                self.chat = ChatLog::restore(messages);
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "failed to load chat history"),
        }

        let snapshot = match self
            .deps
            .store
            .load_json::<NegotiationSnapshot>(scope, NEGOTIATION_KEY)
        {
            Ok(snapshot) => snapshot.unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "failed to load negotiation state");
                NegotiationSnapshot::default()
            }
        };
        let effects = self.negotiator.restore(snapshot, self.now());
        self.apply(effects);
    }

    fn save_chat(&self) {
        if let Err(e) = self
            .deps
            .store
            .save_json(self.room.as_str(), CHAT_KEY, &self.chat.messages())
        {
            warn!(error = %e, "failed to persist chat");
        }
    }

    fn save_negotiation(&self) {
        if let Err(e) = self.deps.store.save_json(
            self.room.as_str(),
            NEGOTIATION_KEY,
            &self.negotiator.snapshot(),
        ) {
            warn!(error = %e, "failed to persist negotiation state");
        }
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    async fn handle_command(&mut self, command: EngineCommand) {
        let now = self.now();
        match command {
            EngineCommand::Propose {
                date,
                time,
                duration_minutes,
                topic,
            } => {
                let result = SessionProposal::new(date, time, duration_minutes, topic)
                    .map_err(EngineError::from)
                    .and_then(|p| self.negotiator.propose(p));
                match result {
                    Ok(effects) => self.apply(effects),
                    Err(e) => self.notice(e.to_string()),
                }
            }

            EngineCommand::Respond {
                proposal_id,
                decision,
            } => match self.negotiator.respond(&proposal_id, decision, now) {
                Ok(effects) => self.apply(effects),
                Err(e) => self.notice(e.to_string()),
            },

            EngineCommand::EndSession => {
                let effects = self.negotiator.end();
                self.apply(effects);
            }

            EngineCommand::CompleteSession => {
                let effects = self.negotiator.complete();
                self.apply(effects);
            }

            EngineCommand::SendChat(text) => {
                let text = text.trim();
                if !text.is_empty() {
                    self.send_chat(text.to_string(), MessageType::Text, None);
                }
            }

            EngineCommand::ShareLink(url) => {
                let metadata = json!({ "url": url });
                self.send_chat(url, MessageType::JitsiLink, Some(metadata));
            }

            EngineCommand::ToggleMute => {
                if let Some(media) = &self.media {
                    media.toggle_mute();
                    self.emit_media_state();
                }
            }

            EngineCommand::ToggleVideo => {
                if let Some(media) = &self.media {
                    media.toggle_video();
                    self.emit_media_state();
                }
            }

            EngineCommand::SubmitRating(rating) => self.submit_rating(rating),

            EngineCommand::LoadHistory => self.load_history(),

            EngineCommand::Hangup(ack) => {
                self.hangup().await;
                let _ = ack.send(());
            }
        }
    }

    fn emit_media_state(&self) {
        if let Some(media) = &self.media {
            self.emit(EngineEvent::LocalMedia {
                muted: media.is_muted(),
                video_enabled: media.is_video_enabled(),
            });
        }
    }

    fn send_chat(
        &mut self,
        text: String,
        message_type: MessageType,
        metadata: Option<serde_json::Value>,
    ) {
        let now = self.now();
        let payload = self
            .chat
            .compose(&self.identity, text, message_type, metadata, now);
        if let Some(message) = self.chat.messages().last() {
            self.emit(EngineEvent::Chat(message.clone()));
        }
        self.save_chat();

        self.send(ClientEvent::RoomEvent {
            room: self.room.clone(),
            event: RoomEvent::ChatMessage(payload.clone()),
        });

        if let (Some(api), Some(session_id)) = (&self.deps.api, self.negotiator.session_id()) {
            let api = api.clone();
            let session_id = session_id.to_string();
            let internal = self.internal.clone();
            tokio::spawn(async move {
                if let Err(e) = api.post_message(&session_id, &payload).await {
                    let _ = internal.send(Internal::MessagePostFailed(e));
                }
            });
        }
    }

    fn submit_rating(&mut self, rating: Rating) {
        if let Err(e) = rating.validate() {
            self.notice(e.to_string());
            return;
        }
        let (Some(api), Some(session_id)) = (&self.deps.api, self.negotiator.session_id()) else {
            self.notice(EngineError::NoDurableSession.to_string());
            return;
        };

        let api = api.clone();
        let session_id = session_id.to_string();
        let internal = self.internal.clone();
        tokio::spawn(async move {
            let result = api.submit_rating(&session_id, &rating).await;
            let _ = internal.send(Internal::RatingSubmitted(result));
        });
    }

    fn load_history(&mut self) {
        let (Some(api), Some(session_id)) = (&self.deps.api, self.negotiator.session_id()) else {
            debug!("no durable session, skipping history");
            return;
        };

        let api = api.clone();
        let session_id = session_id.to_string();
        let internal = self.internal.clone();
        tokio::spawn(async move {
            let result = api.fetch_messages(&session_id).await;
            let _ = internal.send(Internal::HistoryLoaded(result));
        });
    }

    // -----------------------------------------------------------------------
    // Negotiation effects
    // -----------------------------------------------------------------------

    fn apply(&mut self, effects: Effects) {
        let now = self.now();

        for event in effects.outbound {
            self.send(ClientEvent::RoomEvent {
                room: self.room.clone(),
                event,
            });
        }

        if !effects.chat.is_empty() {
            for draft in effects.chat {
                let message = match draft {
                    ChatDraft::System(text) => self.chat.append_system(text, now),
                    ChatDraft::Proposal { author, proposal } => self.chat.append_local(
                        author.id.clone(),
                        author.sender_info(),
                        format!("Session proposal: {}", proposal.summary()),
                        MessageType::Proposal,
                        Some(json!({ "proposal": proposal })),
                        now,
                    ),
                };
                self.emit(EngineEvent::Chat(message));
            }
            self.save_chat();
        }

        for notice in effects.notices {
            self.emit(EngineEvent::Negotiation(notice));
        }

        if effects.persist {
            self.save_negotiation();
        }

        if let Some(accepted) = effects.record_session {
            match &self.deps.api {
                Some(api) => {
                    let student = accepted.counterpart(&self.identity.id).id.clone();
                    match NewSession::from_proposal(&accepted.proposal, self.identity.id.clone(), student)
                    {
                        Ok(session) => {
                            let api = api.clone();
                            let internal = self.internal.clone();
                            tokio::spawn(async move {
                                let result = api.create_session(&session).await;
                                let _ = internal.send(Internal::SessionCreated(result));
                            });
                        }
                        Err(e) => warn!(error = %e, "cannot record accepted proposal"),
                    }
                }
                None => debug!("no REST collaborator, session stays local"),
            }
        }

        if effects.share_meeting_link {
            if let Some(base) = self.config.meeting_base_url.clone() {
                let url = format!(
                    "{}/{}",
                    base.trim_end_matches('/'),
                    self.room.meeting_room_name()
                );
                info!(%url, "sharing meeting link");
                let metadata = json!({ "url": url });
                self.send_chat(url, MessageType::JitsiLink, Some(metadata));
            }
        }
    }

    async fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::OfferDue(peer) => self.offer_to(peer).await,

            Internal::MediaAcquired(Ok(media)) => {
                info!(stream = %media.stream_id(), tracks = media.tracks().len(), "local media ready");
                self.media = Some(media);
                self.emit_media_state();

                let actions = self.presence.on_local_ready();
                self.run_actions(actions).await;

                let deferred: Vec<_> = self.deferred_offers.drain().collect();
                for (peer, offer) in deferred {
                    self.answer_offer(peer, offer).await;
                }
            }

            Internal::MediaAcquired(Err(e)) => {
                error!(error = %e, "local media unavailable");
                self.emit(EngineEvent::Fatal {
                    message: e.to_string(),
                    reason: FatalReason::Media(e),
                });
            }

            Internal::SessionCreated(Ok(session_id)) => {
                let effects = self.negotiator.record_durable_session(session_id);
                self.apply(effects);
            }

            Internal::SessionCreated(Err(e)) => {
                warn!(error = %e, "failed to record session");
                self.notice(format!("Could not save the session: {e}"));
            }

            Internal::HistoryLoaded(Ok(messages)) => {
                let added = self
                    .chat
                    .merge_history(messages.into_iter().map(ChatMessage::from).collect());
                for message in added {
                    self.emit(EngineEvent::Chat(message));
                }
                self.save_chat();
            }

            Internal::HistoryLoaded(Err(e)) => {
                warn!(error = %e, "failed to load chat history");
                self.notice(format!("Could not load messages: {e}"));
            }

            Internal::RatingSubmitted(Ok(())) => {
                let message = self
                    .chat
                    .append_system("Thank you for your feedback", self.now());
                self.emit(EngineEvent::Chat(message));
                self.save_chat();
            }

            Internal::RatingSubmitted(Err(e)) => {
                warn!(error = %e, "failed to submit rating");
                self.notice(format!("Could not submit feedback: {e}"));
            }

            Internal::MessagePostFailed(e) => {
                warn!(error = %e, "failed to store chat message");
                self.notice(format!("Message was not saved: {e}"));
            }
        }
    }

    // -----------------------------------------------------------------------
    // Signaling
    // -----------------------------------------------------------------------

    async fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                self.emit(EngineEvent::Signaling(SignalingStatus::Connected));
            }
            TransportEvent::Reconnecting { attempt, delay } => {
                debug!(attempt, ?delay, "signaling reconnecting");
                self.emit(EngineEvent::Signaling(SignalingStatus::Reconnecting {
                    attempt,
                }));
            }
            TransportEvent::Disconnected => {
                self.emit(EngineEvent::Signaling(SignalingStatus::Disconnected));
            }
            TransportEvent::Unavailable { attempts } => {
                self.emit(EngineEvent::Signaling(SignalingStatus::Unavailable));
                self.emit(EngineEvent::Fatal {
                    reason: FatalReason::SignalingUnavailable,
                    message: format!(
                        "Could not reach the signaling server after {attempts} attempts"
                    ),
                });
            }
            TransportEvent::Message(event) => self.handle_server_event(event).await,
        }
    }

    async fn handle_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::RoomJoined {
                room,
                peer_id,
                peers,
            } => {
                if room != self.room {
                    warn!(%room, "join acknowledged for another room");
                    return;
                }
                let actions = self.presence.on_room_joined(peer_id.clone(), peers.clone());
                self.run_actions(actions).await;
                self.emit(EngineEvent::Joined {
                    room,
                    peer_id: peer_id.clone(),
                });
                for info in peers.into_iter().filter(|p| p.peer_id != peer_id) {
                    self.emit(EngineEvent::PeerJoined {
                        peer: info.peer_id,
                        identity: info.identity,
                    });
                }
            }

            ServerEvent::UserJoined { peer_id, identity } => {
                let known = self.presence.is_present(&peer_id);
                if let Some(action) = self.presence.on_peer_joined(peer_id.clone(), identity.clone())
                {
                    self.run_actions(vec![action]).await;
                }
                if !known && self.presence.is_present(&peer_id) {
                    self.emit(EngineEvent::PeerJoined {
                        peer: peer_id,
                        identity,
                    });
                }
            }

            ServerEvent::UserLeft { peer_id } => {
                if let Some(action) = self.presence.on_peer_left(&peer_id) {
                    self.run_actions(vec![action]).await;
                    self.emit(EngineEvent::PeerLeft { peer: peer_id });
                }
            }

            ServerEvent::Offer { sender, offer } => {
                // A new offer starts a new ICE generation.
                self.orphan_ice.remove(&sender);
                self.answer_offer(sender, offer).await;
            }

            ServerEvent::Answer { sender, answer } => {
                let Some(connection) = self.connections.get_mut(&self.room, &sender) else {
                    warn!(peer = %sender.short(), "answer for unknown connection");
                    return;
                };
                match connection.handle_answer(answer).await {
                    Ok(()) => {
                        self.offer_attempts.remove(&sender);
                    }
                    Err(e) => warn!(peer = %sender.short(), error = %e, "answer skipped"),
                }
            }

            ServerEvent::IceCandidate { sender, candidate } => {
                match self.connections.get_mut(&self.room, &sender) {
                    Some(connection) => {
                        if let Err(e) = connection.handle_ice_candidate(candidate).await {
                            warn!(peer = %sender.short(), error = %e, "ICE candidate skipped");
                        }
                    }
                    None if !self.presence.is_present(&sender) => {
                        debug!(peer = %sender.short(), "dropping ICE candidate from absent peer");
                    }
                    None => {
                        let queue = self.orphan_ice.entry(sender.clone()).or_default();
                        if queue.len() < MAX_ORPHAN_ICE {
                            debug!(peer = %sender.short(), "holding ICE candidate for future connection");
                            queue.push(candidate);
                        } else {
                            warn!(peer = %sender.short(), "too many early ICE candidates, dropping");
                        }
                    }
                }
            }

            ServerEvent::RoomEvent { event, .. } => match event {
                RoomEvent::ChatMessage(payload) => match self.chat.receive(payload) {
                    ChatUpdate::Appended(message) => {
                        self.emit(EngineEvent::Chat(message));
                        self.save_chat();
                    }
                    ChatUpdate::Confirmed { correlation_id } => {
                        self.emit(EngineEvent::ChatConfirmed { correlation_id });
                        self.save_chat();
                    }
                    ChatUpdate::Duplicate => {}
                },
                other => {
                    let effects = self.negotiator.handle_event(other, self.now());
                    self.apply(effects);
                }
            },

            ServerEvent::Error { code, message } => {
                warn!(%code, %message, "relay reported an error");
                self.notice(message);
            }
        }
    }

    async fn run_actions(&mut self, actions: Vec<PresenceAction>) {
        for action in actions {
            match action {
                PresenceAction::ScheduleOffer(peer) => {
                    self.schedule_offer(peer, self.config.offer_debounce());
                }
                PresenceAction::TearDown(peer) => self.tear_down(&peer).await,
            }
        }
    }

    fn schedule_offer(&self, peer: PeerId, delay: Duration) {
        debug!(peer = %peer.short(), ?delay, "offer scheduled");
        let internal = self.internal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = internal.send(Internal::OfferDue(peer));
        });
    }

    async fn tear_down(&mut self, peer: &PeerId) {
        self.connections.close(&self.room, peer).await;
        self.deferred_offers.remove(peer);
        self.orphan_ice.remove(peer);
        self.offer_attempts.remove(peer);
    }

    // -----------------------------------------------------------------------
    // Connections
    // -----------------------------------------------------------------------

    /// Get the connection to `peer`, creating it if needed.
    async fn ensure_connection(&mut self, peer: &PeerId) -> Result<(), PeerError> {
        if self.connections.contains(&self.room, peer) {
            return Ok(());
        }
        let link = self
            .deps
            .links
            .create(&self.room, peer, self.link_events.clone())
            .await?;
        let mut connection =
            PeerConnection::new(self.room.clone(), peer.clone(), link, self.media.clone());
        if let Some(early) = self.orphan_ice.remove(peer) {
            debug!(peer = %peer.short(), count = early.len(), "queueing early ICE candidates");
            connection.queue_early_candidates(early);
        }
        self.connections.insert(connection)
    }

    async fn offer_to(&mut self, peer: PeerId) {
        if !self.presence.is_present(&peer) {
            debug!(peer = %peer.short(), "peer left before offer");
            return;
        }

        if let Err(e) = self.ensure_connection(&peer).await {
            self.give_up_offer(&peer, &e).await;
            return;
        }
        let Some(connection) = self.connections.get_mut(&self.room, &peer) else {
            return;
        };

        match connection.create_offer().await {
            Ok(Some(offer)) => {
                info!(room = %self.room, peer = %peer.short(), "sending offer");
                self.send(ClientEvent::Offer {
                    target: peer,
                    offer,
                });
            }
            Ok(None) => {}
            Err(PeerError::MediaNotReady) => {
                let attempts = self.offer_attempts.entry(peer.clone()).or_insert(0);
                *attempts += 1;
                if *attempts < self.config.offer_retry_limit {
                    debug!(peer = %peer.short(), attempt = *attempts, "local media not ready, retrying offer");
                    self.schedule_offer(peer, self.config.offer_retry_interval());
                } else {
                    self.give_up_offer(&peer, &PeerError::MediaNotReady).await;
                }
            }
            Err(e) => self.give_up_offer(&peer, &e).await,
        }
    }

    async fn give_up_offer(&mut self, peer: &PeerId, cause: &PeerError) {
        warn!(peer = %peer.short(), error = %cause, "giving up on offer");
        self.connections.close(&self.room, peer).await;
        self.offer_attempts.remove(peer);
        self.orphan_ice.remove(peer);
        self.presence.release_offer(peer);
        self.notice(format!(
            "Could not start the call with {}: {cause}",
            self.peer_label(peer)
        ));
    }

    async fn answer_offer(&mut self, sender: PeerId, offer: SessionDescription) {
        if self.media.is_none() {
            debug!(peer = %sender.short(), "offer received before local media, deferring");
            self.deferred_offers.insert(sender, offer);
            return;
        }

        if let Some(existing) = self.connections.get(&self.room, &sender) {
            match existing.state() {
                NegotiationState::Idle => {}
                NegotiationState::OfferSent => {
                    let keep_ours = self
                        .presence
                        .local_peer()
                        .is_some_and(|local| *local < sender);
                    if keep_ours {
                        debug!(peer = %sender.short(), "offer glare, keeping our offer");
                        return;
                    }
                    debug!(peer = %sender.short(), "offer glare, answering theirs");
                    self.connections.close(&self.room, &sender).await;
                }
                state => {
                    debug!(peer = %sender.short(), ?state, "renegotiation, replacing connection");
                    self.connections.close(&self.room, &sender).await;
                }
            }
        }

        if let Err(e) = self.ensure_connection(&sender).await {
            warn!(peer = %sender.short(), error = %e, "cannot answer offer");
            self.notice(format!(
                "Could not connect to {}: {e}",
                self.peer_label(&sender)
            ));
            return;
        }
        let Some(connection) = self.connections.get_mut(&self.room, &sender) else {
            return;
        };

        match connection.handle_offer(offer).await {
            Ok(answer) => {
                info!(room = %self.room, peer = %sender.short(), "sending answer");
                self.send(ClientEvent::Answer {
                    target: sender,
                    answer,
                });
            }
            Err(e) => warn!(peer = %sender.short(), error = %e, "offer skipped"),
        }
    }

    async fn handle_link(&mut self, event: LinkEvent) {
        if event.room != self.room {
            return;
        }
        let peer = event.peer;

        match event.kind {
            LinkEventKind::IceCandidate(candidate) => {
                self.send(ClientEvent::IceCandidate {
                    target: peer,
                    candidate,
                });
            }

            LinkEventKind::ConnectionState(state) | LinkEventKind::IceConnectionState(state) => {
                let Some(connection) = self.connections.get_mut(&self.room, &peer) else {
                    return;
                };
                match connection.on_link_state(state) {
                    ConnectivityChange::Unchanged => {}
                    ConnectivityChange::Connected => {
                        self.offer_attempts.remove(&peer);
                        self.emit(EngineEvent::Connectivity {
                            peer,
                            connected: true,
                        });
                    }
                    ConnectivityChange::Disconnected => {
                        self.emit(EngineEvent::Connectivity {
                            peer: peer.clone(),
                            connected: false,
                        });
                        self.notice(format!("Connection to {} interrupted", self.peer_label(&peer)));
                    }
                    ConnectivityChange::Failed => {
                        self.connections.close(&self.room, &peer).await;
                        self.orphan_ice.remove(&peer);
                        self.presence.release_offer(&peer);
                        self.emit(EngineEvent::Connectivity {
                            peer: peer.clone(),
                            connected: false,
                        });
                        self.notice(format!("Connection to {} failed", self.peer_label(&peer)));
                    }
                }
            }

            LinkEventKind::RemoteTrack {
                stream_id,
                track_id,
                kind,
            } => {
                if let Some(connection) = self.connections.get_mut(&self.room, &peer) {
                    connection.add_remote_track(stream_id.clone(), track_id.clone(), kind);
                    self.emit(EngineEvent::RemoteTrack {
                        peer,
                        stream_id,
                        track_id,
                        kind,
                    });
                }
            }
        }
    }

    /// Close every connection, then stop local tracks, then leave the room
    /// and close the transport. Safe to call twice.
    async fn hangup(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        info!(room = %self.room, "hanging up");

        self.connections.close_all().await;
        if let Some(media) = &self.media {
            media.stop_all();
        }
        if let Some(leave) = self.presence.leave() {
            self.send(leave);
        }
        self.transport.disconnect();
        self.save_negotiation();
        self.save_chat();
        self.emit(EngineEvent::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use blocklearn_shared::protocol::PeerInfo;
    use blocklearn_store::MemoryStore;
    use chrono::TimeZone;

    use crate::config::RoleProfile;
    use crate::testing::{candidate, FakeLinkFactory, FixedMediaSource, RecordingApi};
    use crate::transport::Loopback;

    fn grace() -> Identity {
        Identity::new("m1", "grace@example.com", "Grace", "Hopper")
    }

    fn alan() -> Identity {
        Identity::new("l1", "alan@example.com", "Alan", "Turing")
    }

    fn room() -> RoomKey {
        RoomKey::for_session(&grace(), &alan(), Some("s1"))
    }

    fn fixed_clock() -> Clock {
        Arc::new(|| Utc.with_ymd_and_hms(2025, 2, 28, 9, 0, 0).unwrap())
    }

    fn deps(links: &FakeLinkFactory, api: Option<RecordingApi>) -> EngineDeps {
        EngineDeps {
            links: Arc::new(links.clone()),
            media: Arc::new(SyntheticMediaSource::new()),
            store: Arc::new(MemoryStore::new()),
            api: api.map(|a| Arc::new(a) as Arc<dyn SessionApi>),
            clock: fixed_clock(),
        }
    }

    fn config(profile: RoleProfile) -> EngineConfig {
        EngineConfig {
            profile,
            ..EngineConfig::default()
        }
    }

    async fn wait_for(
        events: &mut mpsc::UnboundedReceiver<EngineEvent>,
        mut pred: impl FnMut(&EngineEvent) -> bool,
    ) -> EngineEvent {
        tokio::time::timeout(Duration::from_secs(60), async {
            loop {
                let event = events.recv().await.expect("engine event stream ended");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for engine event")
    }

    fn drain(sent: &mut mpsc::Receiver<ClientEvent>) -> Vec<ClientEvent> {
        let mut frames = Vec::new();
        while let Ok(frame) = sent.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// Minimal in-process relay with the server's routing rules.
    #[derive(Clone, Default)]
    struct TestRelay {
        members: Arc<Mutex<Vec<(PeerId, Identity, mpsc::Sender<TransportEvent>)>>>,
    }

    impl TestRelay {
        fn deliver(&self, to: &PeerId, event: ServerEvent) {
            let members = self.members.lock().unwrap();
            if let Some((_, _, tx)) = members.iter().find(|(p, _, _)| p == to) {
                let _ = tx.try_send(TransportEvent::Message(event));
            }
        }

        fn broadcast(&self, except: Option<&PeerId>, event: ServerEvent) {
            let members = self.members.lock().unwrap();
            for (peer, _, tx) in members.iter() {
                if Some(peer) != except {
                    let _ = tx.try_send(TransportEvent::Message(event.clone()));
                }
            }
        }

        fn attach(
            &self,
            identity: Identity,
        ) -> (PeerId, TransportHandle, mpsc::Receiver<TransportEvent>) {
            let (handle, events, loopback) = TransportHandle::loopback();
            let Loopback { mut sent, inject, .. } = loopback;
            let peer = PeerId::new();

            let peers: Vec<PeerInfo> = self
                .members
                .lock()
                .unwrap()
                .iter()
                .map(|(p, i, _)| PeerInfo {
                    peer_id: p.clone(),
                    identity: i.clone(),
                })
                .collect();
            inject.try_send(TransportEvent::Connected).unwrap();
            inject
                .try_send(TransportEvent::Message(ServerEvent::RoomJoined {
                    room: room(),
                    peer_id: peer.clone(),
                    peers,
                }))
                .unwrap();
            self.broadcast(
                None,
                ServerEvent::UserJoined {
                    peer_id: peer.clone(),
                    identity: identity.clone(),
                },
            );
            self.members
                .lock()
                .unwrap()
                .push((peer.clone(), identity, inject));

            let relay = self.clone();
            let me = peer.clone();
            tokio::spawn(async move {
                while let Some(frame) = sent.recv().await {
                    match frame {
                        ClientEvent::Offer { target, offer } => relay.deliver(
                            &target,
                            ServerEvent::Offer {
                                sender: me.clone(),
                                offer,
                            },
                        ),
                        ClientEvent::Answer { target, answer } => relay.deliver(
                            &target,
                            ServerEvent::Answer {
                                sender: me.clone(),
                                answer,
                            },
                        ),
                        ClientEvent::IceCandidate { target, candidate } => relay.deliver(
                            &target,
                            ServerEvent::IceCandidate {
                                sender: me.clone(),
                                candidate,
                            },
                        ),
                        ClientEvent::RoomEvent { event, .. } => relay.broadcast(
                            None,
                            ServerEvent::RoomEvent {
                                sender: me.clone(),
                                event,
                            },
                        ),
                        ClientEvent::LeaveRoom { .. } => {
                            relay.members.lock().unwrap().retain(|(p, _, _)| *p != me);
                            relay.broadcast(None, ServerEvent::UserLeft { peer_id: me.clone() });
                        }
                        ClientEvent::JoinRoom { .. } => {}
                    }
                }
            });

            (peer, handle, events)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_peer_gets_exactly_one_offer_and_both_connect() {
        let relay = TestRelay::default();
        let links_a = FakeLinkFactory::new();
        let links_b = FakeLinkFactory::new();

        let (peer_a, transport, transport_events) = relay.attach(grace());
        let (_a, mut events_a) = CallEngine::spawn(
            config(RoleProfile::mentor()),
            grace(),
            room(),
            transport,
            transport_events,
            deps(&links_a, None),
        );
        wait_for(&mut events_a, |e| matches!(e, EngineEvent::LocalMedia { .. })).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(links_a.total_offers(), 0);

        let (peer_b, transport, transport_events) = relay.attach(alan());
        let (_b, mut events_b) = CallEngine::spawn(
            config(RoleProfile::learner()),
            alan(),
            room(),
            transport,
            transport_events,
            deps(&links_b, None),
        );

        let connected_to = |peer: PeerId| {
            move |e: &EngineEvent| {
                matches!(e, EngineEvent::Connectivity { peer: p, connected: true } if *p == peer)
            }
        };
        wait_for(&mut events_a, connected_to(peer_b.clone())).await;
        wait_for(&mut events_b, connected_to(peer_a.clone())).await;

        let a_links = links_a.links_for(&peer_b);
        assert_eq!(a_links.len(), 1);
        assert_eq!(a_links[0].log().offers_created, 1);
        assert_eq!(links_b.total_offers(), 0);
        assert_eq!(links_b.links_for(&peer_a)[0].log().answers_created, 1);
    }

    struct Solo {
        handle: EngineHandle,
        events: mpsc::UnboundedReceiver<EngineEvent>,
        loopback: Loopback,
        links: FakeLinkFactory,
    }

    async fn solo(media: Arc<dyn MediaSource>) -> Solo {
        let (transport, transport_events, loopback) = TransportHandle::loopback();
        let links = FakeLinkFactory::new();
        let mut deps = deps(&links, None);
        deps.media = media;
        let (handle, mut events) = CallEngine::spawn(
            config(RoleProfile::mentor()),
            grace(),
            room(),
            transport,
            transport_events,
            deps,
        );
        loopback
            .inject
            .send(TransportEvent::Message(ServerEvent::RoomJoined {
                room: room(),
                peer_id: PeerId::from("pa"),
                peers: vec![],
            }))
            .await
            .unwrap();
        wait_for(&mut events, |e| matches!(e, EngineEvent::Joined { .. })).await;
        Solo {
            handle,
            events,
            loopback,
            links,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_user_joined_yields_one_offer_and_orders_ice() {
        let mut solo = solo(Arc::new(SyntheticMediaSource::new())).await;
        wait_for(&mut solo.events, |e| matches!(e, EngineEvent::LocalMedia { .. })).await;

        let pb = PeerId::from("pb");
        for _ in 0..3 {
            solo.loopback
                .inject
                .send(TransportEvent::Message(ServerEvent::UserJoined {
                    peer_id: pb.clone(),
                    identity: alan(),
                }))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_secs(10)).await;

        let offers: Vec<_> = drain(&mut solo.loopback.sent)
            .into_iter()
            .filter(|f| matches!(f, ClientEvent::Offer { target, .. } if *target == pb))
            .collect();
        assert_eq!(offers.len(), 1);
        assert_eq!(solo.links.total_offers(), 1);

        for name in ["c1", "c2"] {
            solo.loopback
                .inject
                .send(TransportEvent::Message(ServerEvent::IceCandidate {
                    sender: pb.clone(),
                    candidate: candidate(name),
                }))
                .await
                .unwrap();
        }
        solo.loopback
            .inject
            .send(TransportEvent::Message(ServerEvent::Answer {
                sender: pb.clone(),
                answer: SessionDescription::answer("remote-answer"),
            }))
            .await
            .unwrap();
        wait_for(&mut solo.events, |e| {
            matches!(e, EngineEvent::Connectivity { connected: true, .. })
        })
        .await;

        let link = &solo.links.links_for(&pb)[0];
        assert_eq!(link.log().candidates, vec!["c1", "c2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_early_ice_only_kept_for_present_peers_and_capped() {
        let mut solo = solo(Arc::new(SyntheticMediaSource::new())).await;
        wait_for(&mut solo.events, |e| matches!(e, EngineEvent::LocalMedia { .. })).await;
        let pb = PeerId::from("pb");
        let ice = |name: String| {
            TransportEvent::Message(ServerEvent::IceCandidate {
                sender: pb.clone(),
                candidate: candidate(&name),
            })
        };

        for i in 0..5 {
            solo.loopback.inject.send(ice(format!("stray{i}"))).await.unwrap();
        }
        solo.loopback
            .inject
            .send(TransportEvent::Message(ServerEvent::UserJoined {
                peer_id: pb.clone(),
                identity: alan(),
            }))
            .await
            .unwrap();
        for i in 0..100 {
            solo.loopback.inject.send(ice(format!("c{i}"))).await.unwrap();
        }
        tokio::time::sleep(Duration::from_secs(10)).await;

        solo.loopback
            .inject
            .send(TransportEvent::Message(ServerEvent::Answer {
                sender: pb.clone(),
                answer: SessionDescription::answer("remote-answer"),
            }))
            .await
            .unwrap();
        wait_for(&mut solo.events, |e| {
            matches!(e, EngineEvent::Connectivity { connected: true, .. })
        })
        .await;

        let applied = solo.links.links_for(&pb)[0].log().candidates;
        assert_eq!(applied.len(), MAX_ORPHAN_ICE);
        assert_eq!(applied[0], "c0");
        assert!(applied.iter().all(|c| !c.starts_with("stray")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_offer_before_media_is_answered_once_media_is_ready() {
        let (transport, transport_events, mut loopback) = TransportHandle::loopback();
        let links = FakeLinkFactory::new();
        loopback
            .inject
            .send(TransportEvent::Message(ServerEvent::Offer {
                sender: PeerId::from("pb"),
                offer: SessionDescription::offer("remote-offer"),
            }))
            .await
            .unwrap();

        let (_handle, mut events) = CallEngine::spawn(
            config(RoleProfile::learner()),
            alan(),
            room(),
            transport,
            transport_events,
            deps(&links, None),
        );
        wait_for(&mut events, |e| matches!(e, EngineEvent::LocalMedia { .. })).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let answers: Vec<_> = drain(&mut loopback.sent)
            .into_iter()
            .filter(|f| matches!(f, ClientEvent::Answer { .. }))
            .collect();
        assert_eq!(answers.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hangup_twice_stops_tracks_and_leaves() {
        let source = FixedMediaSource::new();
        let media = source.0.clone();
        let mut solo = solo(Arc::new(source)).await;
        wait_for(&mut solo.events, |e| matches!(e, EngineEvent::LocalMedia { .. })).await;

        solo.handle.hangup().await;
        solo.handle.hangup().await;

        assert!(media.all_stopped());
        wait_for(&mut solo.events, |e| matches!(e, EngineEvent::Closed)).await;
        let frames = drain(&mut solo.loopback.sent);
        assert_eq!(
            frames.iter().filter(|f| matches!(f, ClientEvent::LeaveRoom { .. })).count(),
            1
        );
        assert!(*solo.loopback.shutdown.borrow());
        assert!(matches!(
            solo.handle.send_chat("late").await,
            Err(EngineError::NotRunning)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_relay_is_fatal() {
        let mut solo = solo(Arc::new(SyntheticMediaSource::new())).await;
        solo.loopback
            .inject
            .send(TransportEvent::Unavailable { attempts: 5 })
            .await
            .unwrap();
        let event = wait_for(&mut solo.events, |e| matches!(e, EngineEvent::Fatal { .. })).await;
        assert!(matches!(
            event,
            EngineEvent::Fatal {
                reason: FatalReason::SignalingUnavailable,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_media_denied_is_fatal_with_cause() {
        let mut solo = solo(Arc::new(SyntheticMediaSource::failing(
            MediaError::PermissionDenied,
        )))
        .await;
        let event = wait_for(&mut solo.events, |e| matches!(e, EngineEvent::Fatal { .. })).await;
        assert_eq!(
            event,
            EngineEvent::Fatal {
                reason: FatalReason::Media(MediaError::PermissionDenied),
                message: MediaError::PermissionDenied.to_string(),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_chat_echo_is_confirmed_not_duplicated() {
        let relay = TestRelay::default();
        let (_, transport, transport_events) = relay.attach(grace());
        let (handle, mut events) = CallEngine::spawn(
            config(RoleProfile::mentor()),
            grace(),
            room(),
            transport,
            transport_events,
            deps(&FakeLinkFactory::new(), None),
        );

        handle.send_chat("  hello  ").await.unwrap();
        let sent = wait_for(&mut events, |e| matches!(e, EngineEvent::Chat(_))).await;
        let EngineEvent::Chat(message) = sent else {
            unreachable!()
        };
        assert_eq!(message.message, "hello");

        let confirmed =
            wait_for(&mut events, |e| matches!(e, EngineEvent::ChatConfirmed { .. })).await;
        assert_eq!(
            confirmed,
            EngineEvent::ChatConfirmed {
                correlation_id: message.correlation_id
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_propose_accept_complete_across_two_engines() {
        let relay = TestRelay::default();
        let api = RecordingApi::new();

        let (_, transport, transport_events) = relay.attach(alan());
        let (learner, mut learner_events) = CallEngine::spawn(
            config(RoleProfile::learner()),
            alan(),
            room(),
            transport,
            transport_events,
            deps(&FakeLinkFactory::new(), None),
        );

        let mut mentor_config = config(RoleProfile::mentor());
        mentor_config.meeting_base_url = Some("https://meet.example.com/".into());
        let (_, transport, transport_events) = relay.attach(grace());
        let (mentor, mut mentor_events) = CallEngine::spawn(
            mentor_config,
            grace(),
            room(),
            transport,
            transport_events,
            deps(&FakeLinkFactory::new(), Some(api.clone())),
        );
        wait_for(&mut mentor_events, |e| matches!(e, EngineEvent::Joined { .. })).await;

        learner.propose("2025-03-01", "10:00", 60, "X").await.unwrap();

        let received = wait_for(&mut mentor_events, |e| {
            matches!(e, EngineEvent::Negotiation(NegotiationNotice::ProposalReceived { .. }))
        })
        .await;
        let EngineEvent::Negotiation(NegotiationNotice::ProposalReceived { proposal, proposer }) =
            received
        else {
            unreachable!()
        };
        assert_eq!(proposer.id, "l1");

        mentor
            .respond(proposal.id.clone(), ProposalDecision::Accepted)
            .await
            .unwrap();

        let timer_of = |e: &EngineEvent| match e {
            EngineEvent::Negotiation(NegotiationNotice::TimerChanged(Some(t))) => Some(t.clone()),
            _ => None,
        };
        let mentor_timer = timer_of(&wait_for(&mut mentor_events, |e| timer_of(e).is_some()).await);
        let learner_timer =
            timer_of(&wait_for(&mut learner_events, |e| timer_of(e).is_some()).await);
        assert_eq!(mentor_timer, learner_timer);
        let timer = mentor_timer.unwrap();
        assert_eq!(timer.duration, 3600);
        assert!(!timer.is_active);

        let link = wait_for(&mut learner_events, |e| {
            matches!(e, EngineEvent::Chat(m) if m.message_type == MessageType::JitsiLink)
        })
        .await;
        let EngineEvent::Chat(link) = link else {
            unreachable!()
        };
        assert_eq!(
            link.message,
            format!("https://meet.example.com/{}", room().meeting_room_name())
        );

        wait_for(&mut learner_events, |e| {
            matches!(
                e,
                EngineEvent::Negotiation(NegotiationNotice::DurableSessionRecorded { .. })
            )
        })
        .await;
        let sessions = api.log().sessions;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].mentor_id, "m1");
        assert_eq!(sessions[0].student_id, "l1");

        mentor.complete_session().await.unwrap();
        let system = |e: &EngineEvent| {
            matches!(e, EngineEvent::Chat(m) if m.message == "Session completed by Grace Hopper")
        };
        wait_for(&mut mentor_events, system).await;
        wait_for(&mut learner_events, system).await;
        wait_for(&mut learner_events, |e| {
            matches!(e, EngineEvent::Negotiation(NegotiationNotice::RatingRequested))
        })
        .await;

        mentor.hangup().await;
        let mut saw_prompt = false;
        while let Ok(event) = mentor_events.try_recv() {
            saw_prompt |= matches!(
                event,
                EngineEvent::Negotiation(NegotiationNotice::RatingRequested)
            );
        }
        assert!(!saw_prompt);
    }

    #[tokio::test(start_paused = true)]
    async fn test_negotiation_survives_restart() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let start = |store: Arc<dyn StateStore>| {
            let (transport, transport_events, loopback) = TransportHandle::loopback();
            let links = FakeLinkFactory::new();
            let mut deps = deps(&links, None);
            deps.store = store;
            let (handle, events) = CallEngine::spawn(
                config(RoleProfile::mentor()),
                grace(),
                room(),
                transport,
                transport_events,
                deps,
            );
            (handle, events, loopback)
        };

        let (handle, mut events, loopback) = start(store.clone());
        loopback
            .inject
            .send(TransportEvent::Message(ServerEvent::RoomEvent {
                sender: PeerId::from("pb"),
                event: RoomEvent::SessionPropose {
                    proposer: alan(),
                    proposal: serde_json::from_str(
                        r#"{"id":"p1","date":"2025-03-01","time":"10:00","duration":"60"}"#,
                    )
                    .unwrap(),
                },
            }))
            .await
            .unwrap();
        wait_for(&mut events, |e| {
            matches!(e, EngineEvent::Negotiation(NegotiationNotice::ProposalReceived { .. }))
        })
        .await;
        handle.respond("p1", ProposalDecision::Accepted).await.unwrap();
        wait_for(&mut events, |e| {
            matches!(e, EngineEvent::Negotiation(NegotiationNotice::ProposalAccepted { .. }))
        })
        .await;
        handle.hangup().await;

        let (_handle, mut events, _loopback) = start(store);
        let restored = wait_for(&mut events, |e| {
            matches!(e, EngineEvent::Negotiation(NegotiationNotice::TimerChanged(_)))
        })
        .await;
        assert!(matches!(
            restored,
            EngineEvent::Negotiation(NegotiationNotice::TimerChanged(Some(ref t))) if t.duration == 3600
        ));
    }
}
