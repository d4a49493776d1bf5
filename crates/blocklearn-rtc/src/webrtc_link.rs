//! [`PeerLink`] implementation on the `webrtc` crate.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use blocklearn_shared::protocol::{IceCandidate, SdpKind, SessionDescription};
use blocklearn_shared::{PeerId, RoomKey};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::PeerError;
use crate::link::{LinkEvent, LinkEventKind, LinkEventSender, LinkFactory, LinkState, PeerLink};
use crate::media::{forward_frames, LocalMedia, MediaFrame, TrackKind};

fn webrtc_err(e: webrtc::Error) -> PeerError {
    PeerError::WebRtc(e.to_string())
}

fn build_api() -> Result<API, PeerError> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs().map_err(webrtc_err)?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine).map_err(webrtc_err)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// Builds one `RTCPeerConnection` per remote peer.
pub struct WebRtcLinkFactory {
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcLinkFactory {
    /// Fails when the WebRTC stack cannot be initialised on this platform.
    pub fn new(ice_urls: &[String]) -> Result<Self, PeerError> {
        build_api()?;
        Ok(Self {
            ice_servers: vec![RTCIceServer {
                urls: ice_urls.to_vec(),
                ..Default::default()
            }],
        })
    }
}

#[async_trait]
impl LinkFactory for WebRtcLinkFactory {
    async fn create(
        &self,
        room: &RoomKey,
        peer: &PeerId,
        events: LinkEventSender,
    ) -> Result<Box<dyn PeerLink>, PeerError> {
        let api = build_api()?;
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await.map_err(webrtc_err)?);

        let emitter = Emitter {
            room: room.clone(),
            peer: peer.clone(),
            events,
        };
        install_handlers(&pc, emitter);

        debug!(room = %room, peer = %peer.short(), "created peer connection");
        Ok(Box::new(WebRtcLink {
            pc,
            writers: Mutex::new(Vec::new()),
        }))
    }
}

#[derive(Clone)]
struct Emitter {
    room: RoomKey,
    peer: PeerId,
    events: LinkEventSender,
}

impl Emitter {
    fn emit(&self, kind: LinkEventKind) {
        let _ = self.events.send(LinkEvent {
            room: self.room.clone(),
            peer: self.peer.clone(),
            kind,
        });
    }
}

fn install_handlers(pc: &Arc<RTCPeerConnection>, emitter: Emitter) {
    let on_state = emitter.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        let state = match s {
            RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => LinkState::New,
            RTCPeerConnectionState::Connecting => LinkState::Connecting,
            RTCPeerConnectionState::Connected => LinkState::Connected,
            RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
            RTCPeerConnectionState::Failed => LinkState::Failed,
            RTCPeerConnectionState::Closed => LinkState::Closed,
        };
        on_state.emit(LinkEventKind::ConnectionState(state));
        Box::pin(async {})
    }));

    let on_ice_state = emitter.clone();
    pc.on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
        let state = match s {
            RTCIceConnectionState::New | RTCIceConnectionState::Unspecified => LinkState::New,
            RTCIceConnectionState::Checking => LinkState::Connecting,
            RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                LinkState::Connected
            }
            RTCIceConnectionState::Disconnected => LinkState::Disconnected,
            RTCIceConnectionState::Failed => LinkState::Failed,
            RTCIceConnectionState::Closed => LinkState::Closed,
        };
        on_ice_state.emit(LinkEventKind::IceConnectionState(state));
        Box::pin(async {})
    }));

    let on_candidate = emitter.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        // `None` marks the end of gathering
        if let Some(c) = candidate {
            match c.to_json() {
                Ok(init) => on_candidate.emit(LinkEventKind::IceCandidate(IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                    username_fragment: init.username_fragment,
                })),
                Err(e) => warn!(error = %e, "failed to serialize local ICE candidate"),
            }
        }
        Box::pin(async {})
    }));

    let on_track = emitter;
    pc.on_track(Box::new(move |track, _, _| {
        let kind = match track.kind() {
            RTPCodecType::Video => TrackKind::Video,
            _ => TrackKind::Audio,
        };
        info!(peer = %on_track.peer.short(), kind = ?kind, "remote track received");
        on_track.emit(LinkEventKind::RemoteTrack {
            stream_id: track.stream_id(),
            track_id: track.id(),
            kind,
        });
        Box::pin(async {})
    }));
}

struct WebRtcLink {
    pc: Arc<RTCPeerConnection>,
    /// One per sent track, copying its frames onto the wire.
    writers: Mutex<Vec<JoinHandle<()>>>,
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    let parsed = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
        SdpKind::Rollback => {
            return Err(PeerError::InvalidSdp("rollback is not supported".into()));
        }
    };
    parsed.map_err(|e| PeerError::InvalidSdp(e.to_string()))
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription, PeerError> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        RTCSdpType::Unspecified => {
            return Err(PeerError::InvalidSdp("unspecified description type".into()));
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: desc.sdp,
    })
}

#[async_trait]
impl PeerLink for WebRtcLink {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        from_rtc(self.pc.create_offer(None).await.map_err(webrtc_err)?)
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        from_rtc(self.pc.create_answer(None).await.map_err(webrtc_err)?)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc
            .set_local_description(to_rtc(desc)?)
            .await
            .map_err(webrtc_err)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(webrtc_err)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(webrtc_err)
    }

    async fn add_local_media(&self, media: &Arc<LocalMedia>) -> Result<(), PeerError> {
        for track in media.tracks() {
            let mime_type = match track.kind() {
                TrackKind::Audio => MIME_TYPE_OPUS,
                TrackKind::Video => MIME_TYPE_VP8,
            };
            let local = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: mime_type.to_owned(),
                    ..Default::default()
                },
                track.id().to_owned(),
                media.stream_id().to_owned(),
            ));
            self.pc
                .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(webrtc_err)?;

            let Some(frames) = track.subscribe() else {
                continue;
            };
            let writer = tokio::spawn(forward_frames(
                Arc::clone(track),
                frames,
                move |frame: MediaFrame| {
                    let local = Arc::clone(&local);
                    async move {
                        let sample = Sample {
                            data: frame.data.into(),
                            duration: frame.duration,
                            ..Default::default()
                        };
                        if let Err(e) = local.write_sample(&sample).await {
                            warn!(error = %e, "failed to write media sample");
                        }
                    }
                },
            ));
            if let Ok(mut writers) = self.writers.lock() {
                writers.push(writer);
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        if let Ok(mut writers) = self.writers.lock() {
            for writer in writers.drain(..) {
                writer.abort();
            }
        }
        self.pc.close().await.map_err(webrtc_err)
    }
}
