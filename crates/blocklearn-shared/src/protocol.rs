use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::de::{self, DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};

use crate::constants::MAX_FRAME_SIZE;
use crate::error::SharedError;
use crate::identity::{Identity, SenderInfo};
use crate::types::{PeerId, RoomKey};

/// Frames sent by a client to the signaling relay
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Join (or re-join) a room. Always the first frame after a connect.
    JoinRoom { room: RoomKey, identity: Identity },
    LeaveRoom { room: RoomKey },
    Offer {
        target: PeerId,
        offer: SessionDescription,
    },
    Answer {
        target: PeerId,
        answer: SessionDescription,
    },
    IceCandidate {
        target: PeerId,
        candidate: IceCandidate,
    },
    /// Broadcast to every member of the room, sender included
    RoomEvent { room: RoomKey, event: RoomEvent },
}

/// Frames sent by the signaling relay to a client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Acknowledges a join; `peers` lists who was already present.
    RoomJoined {
        room: RoomKey,
        peer_id: PeerId,
        peers: Vec<PeerInfo>,
    },
    UserJoined {
        peer_id: PeerId,
        identity: Identity,
    },
    UserLeft {
        peer_id: PeerId,
    },
    Offer {
        sender: PeerId,
        offer: SessionDescription,
    },
    Answer {
        sender: PeerId,
        answer: SessionDescription,
    },
    IceCandidate {
        sender: PeerId,
        candidate: IceCandidate,
    },
    RoomEvent {
        sender: PeerId,
        event: RoomEvent,
    },
    Error {
        code: String,
        message: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub identity: Identity,
}

/// Application events relayed verbatim to the whole room
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind")]
pub enum RoomEvent {
    #[serde(rename = "chat:message")]
    ChatMessage(ChatPayload),

    #[serde(rename = "session:propose")]
    SessionPropose {
        proposer: Identity,
        proposal: SessionProposal,
    },

    #[serde(rename = "session:response")]
    SessionResponse {
        responder: Identity,
        response: ProposalDecision,
        proposal: SessionProposal,
    },

    #[serde(rename = "session:end")]
    SessionEnd { ended_by: Identity },

    #[serde(rename = "session:complete")]
    SessionComplete { completed_by: Identity },

    /// The accepted proposal was persisted as a durable session record
    #[serde(rename = "session:created")]
    SessionCreated {
        session_id: String,
        created_by: Identity,
    },
}

impl RoomEvent {
    /// Identity of the peer that authored the event.
    pub fn author_id(&self) -> &str {
        match self {
            RoomEvent::ChatMessage(payload) => &payload.sender_id,
            RoomEvent::SessionPropose { proposer, .. } => &proposer.id,
            RoomEvent::SessionResponse { responder, .. } => &responder.id,
            RoomEvent::SessionEnd { ended_by } => &ended_by.id,
            RoomEvent::SessionComplete { completed_by } => &completed_by.id,
            RoomEvent::SessionCreated { created_by, .. } => &created_by.id,
        }
    }
}

// ---------------------------------------------------------------------------
// WebRTC payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// SDP blob in the browser's `RTCSessionDescriptionInit` shape
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in the browser's `RTCIceCandidateInit` shape
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Text,
    System,
    Proposal,
    JitsiLink,
}

/// A chat message as it travels through the room
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatPayload {
    /// Generated by the sender; used to match the relay's echo to the
    /// provisional local record.
    pub correlation_id: String,
    pub sender_id: String,
    pub sender: SenderInfo,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Session proposals
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProposalDecision {
    Accepted,
    Rejected,
}

/// A suggested session slot awaiting the other peer's decision.
///
/// `date` is `YYYY-MM-DD` and `time` is `HH:MM`, both read as UTC so that
/// every peer derives the same start instant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionProposal {
    pub id: String,
    pub date: String,
    pub time: String,
    #[serde(alias = "duration", deserialize_with = "duration_from_number_or_string")]
    pub duration_minutes: u32,
    #[serde(default)]
    pub topic: String,
}

impl SessionProposal {
    /// Build a proposal with a fresh id, validating the slot.
    pub fn new(
        date: impl Into<String>,
        time: impl Into<String>,
        duration_minutes: u32,
        topic: impl Into<String>,
    ) -> Result<Self, SharedError> {
        let proposal = Self {
            id: uuid::Uuid::new_v4().to_string(),
            date: date.into(),
            time: time.into(),
            duration_minutes,
            topic: topic.into(),
        };
        proposal.validate()?;
        Ok(proposal)
    }

    pub fn validate(&self) -> Result<(), SharedError> {
        if self.id.is_empty() {
            return Err(SharedError::InvalidProposal("missing id".into()));
        }
        if self.duration_minutes == 0 {
            return Err(SharedError::InvalidProposal(
                "duration must be positive".into(),
            ));
        }
        self.start_time().map(|_| ())
    }

    /// Agreed start instant.
    pub fn start_time(&self) -> Result<DateTime<Utc>, SharedError> {
        let date = NaiveDate::parse_from_str(self.date.trim(), "%Y-%m-%d")
            .map_err(|e| SharedError::InvalidProposal(format!("date {:?}: {e}", self.date)))?;
        let time = NaiveTime::parse_from_str(self.time.trim(), "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(self.time.trim(), "%H:%M:%S"))
            .map_err(|e| SharedError::InvalidProposal(format!("time {:?}: {e}", self.time)))?;
        Ok(NaiveDateTime::new(date, time).and_utc())
    }

    pub fn duration_secs(&self) -> i64 {
        i64::from(self.duration_minutes) * 60
    }

    /// One-line summary used for proposal chat messages.
    pub fn summary(&self) -> String {
        let topic = if self.topic.is_empty() {
            String::new()
        } else {
            format!(" - {}", self.topic)
        };
        format!(
            "{} at {} ({} min){}",
            self.date, self.time, self.duration_minutes, topic
        )
    }
}

fn duration_from_number_or_string<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u32),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| de::Error::custom(format!("invalid duration {s:?}"))),
    }
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// Serialize a frame, refusing anything over [`MAX_FRAME_SIZE`].
pub fn encode<T: Serialize>(frame: &T) -> Result<String, SharedError> {
    let text = serde_json::to_string(frame)?;
    if text.len() > MAX_FRAME_SIZE {
        return Err(SharedError::FrameTooLarge {
            size: text.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(text)
}

pub fn decode<T: DeserializeOwned>(text: &str) -> Result<T, SharedError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(SharedError::FrameTooLarge {
            size: text.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(serde_json::from_str(text)?)
}
