use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{CHAT_ROOM_PREFIX, DEFAULT_SESSION_KEY, INTERVIEW_ROOM_PREFIX};
use crate::identity::Identity;

// Transport connection id, assigned by the relay per WebSocket
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        let end = self.0.len().min(8);
        &self.0[..end]
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical signaling group.
///
/// Keys are derived from participant data only, so both sides compute the
/// same key without talking to each other first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct RoomKey(String);

impl RoomKey {
    /// Room for a mentor/learner pair, optionally scoped to a session.
    ///
    /// Participant ids are sorted so the argument order does not matter.
    pub fn for_session(a: &Identity, b: &Identity, session: Option<&str>) -> Self {
        let (low, high) = if a.id <= b.id {
            (&a.id, &b.id)
        } else {
            (&b.id, &a.id)
        };
        let session = session
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_SESSION_KEY);
        Self(format!("{CHAT_ROOM_PREFIX}_{low}_{high}_{session}"))
    }

    /// Room for an interview, addressed by its invite code.
    pub fn interview(code: &str) -> Self {
        Self(format!("{INTERVIEW_ROOM_PREFIX}-{}", code.trim()))
    }

    /// Wrap a key computed elsewhere.
    pub fn from_raw(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 64-hex name derived from the key, used for external meeting rooms.
    pub fn meeting_room_name(&self) -> String {
        hex::encode(blake3::hash(self.0.as_bytes()).as_bytes())
    }
}

impl std::fmt::Display for RoomKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str) -> Identity {
        Identity::new(id, format!("{id}@example.com"), "U", id)
    }

    #[test]
    fn test_room_key_is_order_independent() {
        let mentor = user("42");
        let learner = user("17");

        let from_mentor = RoomKey::for_session(&mentor, &learner, Some("s-9"));
        let from_learner = RoomKey::for_session(&learner, &mentor, Some("s-9"));

        assert_eq!(from_mentor, from_learner);
        assert_eq!(from_mentor.as_str(), "chat_17_42_s-9");
    }

    #[test]
    fn test_room_key_defaults_session() {
        let key = RoomKey::for_session(&user("a"), &user("b"), None);
        assert_eq!(key.as_str(), "chat_a_b_default");

        let empty = RoomKey::for_session(&user("a"), &user("b"), Some(""));
        assert_eq!(empty, key);
    }

    #[test]
    fn test_interview_key() {
        assert_eq!(RoomKey::interview(" AB12 ").as_str(), "interview-AB12");
    }

    #[test]
    fn test_meeting_room_name_is_stable_hex() {
        let key = RoomKey::interview("x");
        let name = key.meeting_room_name();
        assert_eq!(name.len(), 64);
        assert_eq!(name, RoomKey::interview("x").meeting_room_name());
        assert_ne!(name, RoomKey::interview("y").meeting_room_name());
    }
}
