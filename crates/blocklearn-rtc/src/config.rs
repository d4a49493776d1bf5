use std::time::Duration;

use blocklearn_shared::constants::DEFAULT_STUN_SERVERS;
use blocklearn_shared::Role;
use serde::Deserialize;

use crate::media::MediaConstraints;

/// Engine configuration handed in by the hosting page.
///
/// Every field has a default, so a page only needs to supply what differs
/// (usually `signaling_url` and `profile`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// WebSocket URL of the signaling relay, e.g. `ws://localhost:5000/ws`.
    pub signaling_url: String,

    /// STUN/TURN URLs for peer connections.
    pub ice_servers: Vec<String>,

    /// Delay between a peer joining and our offer to it.
    pub offer_debounce_ms: u64,

    /// Attempts at creating an offer while local media is still missing.
    pub offer_retry_limit: u32,

    pub offer_retry_interval_ms: u64,

    pub reconnect: ReconnectPolicy,

    /// How long a response to an unknown proposal waits for that proposal.
    pub response_buffer_ttl_secs: u64,

    pub response_buffer_capacity: usize,

    pub max_connections: usize,

    /// Base URL of the external meeting service. When set, the recording
    /// side shares `<base>/<room name>` once a proposal is accepted.
    pub meeting_base_url: Option<String>,

    pub media: MediaConstraints,

    pub profile: RoleProfile,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://127.0.0.1:5000/ws".to_string(),
            ice_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            offer_debounce_ms: 1500,
            offer_retry_limit: 5,
            offer_retry_interval_ms: 1500,
            reconnect: ReconnectPolicy::default(),
            response_buffer_ttl_secs: 30,
            response_buffer_capacity: 16,
            max_connections: 8,
            meeting_base_url: None,
            media: MediaConstraints::default(),
            profile: RoleProfile::default(),
        }
    }
}

impl EngineConfig {
    pub fn offer_debounce(&self) -> Duration {
        Duration::from_millis(self.offer_debounce_ms)
    }

    pub fn offer_retry_interval(&self) -> Duration {
        Duration::from_millis(self.offer_retry_interval_ms)
    }

    pub fn response_buffer_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.response_buffer_ttl_secs as i64)
    }
}

/// Bounded reconnection with exponential backoff.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Randomization factor in `[0, 1]`; 0.5 means +/-50%.
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 5000,
            jitter: 0.5,
        }
    }
}

/// What distinguishes one page variant (interview, mentor call, learner
/// call) from another.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoleProfile {
    pub role: Role,
    pub local_label: String,
    pub remote_label: String,
    /// Base URL of the REST collaborator; `None` disables durable sessions.
    pub api_base_url: Option<String>,
    pub auth_token: Option<String>,
    pub endpoints: Endpoints,
}

impl RoleProfile {
    pub fn mentor() -> Self {
        Self::for_role(Role::Mentor)
    }

    pub fn learner() -> Self {
        Self::for_role(Role::Learner)
    }

    /// Admin side of an interview call. Interviews have no durable sessions.
    pub fn interviewer() -> Self {
        Self {
            api_base_url: None,
            ..Self::for_role(Role::Admin)
        }
    }

    fn for_role(role: Role) -> Self {
        let local_label = match role {
            Role::Mentor => "Mentor",
            Role::Learner => "Student",
            Role::Admin => "Interviewer",
        };
        Self {
            role,
            local_label: local_label.to_string(),
            remote_label: role.counterpart_label().to_string(),
            api_base_url: None,
            auth_token: None,
            endpoints: Endpoints::default(),
        }
    }
}

impl Default for RoleProfile {
    fn default() -> Self {
        Self::learner()
    }
}

/// REST paths relative to [`RoleProfile::api_base_url`]. `{session}` is
/// replaced with the durable session id.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    pub create_session: String,
    pub messages: String,
    pub feedback: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            create_session: "/api/sessions".to_string(),
            messages: "/api/session-requests/{session}/messages".to_string(),
            feedback: "/api/feedback/submit".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let raw = r#"{
            "signaling_url": "wss://relay.example.com/ws",
            "profile": { "role": "mentor", "api_base_url": "https://api.example.com" }
        }"#;
        let config: EngineConfig = serde_json::from_str(raw).unwrap();

        assert_eq!(config.signaling_url, "wss://relay.example.com/ws");
        assert_eq!(config.offer_debounce(), Duration::from_millis(1500));
        assert_eq!(config.reconnect.max_attempts, 5);
        assert_eq!(config.ice_servers.len(), 3);
        assert_eq!(config.profile.role, Role::Mentor);
        assert_eq!(config.profile.endpoints.create_session, "/api/sessions");
    }

    #[test]
    fn test_profiles() {
        assert_eq!(RoleProfile::mentor().remote_label, "Student");
        assert_eq!(RoleProfile::learner().remote_label, "Mentor");
        assert!(RoleProfile::interviewer().api_base_url.is_none());
    }
}
