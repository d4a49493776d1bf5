//! Relay configuration loaded from environment variables.
//!
//! Every setting has a default so the relay starts with zero configuration
//! for local development.

use std::net::SocketAddr;

use blocklearn_shared::constants::DEFAULT_HTTP_PORT;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for HTTP and the WebSocket endpoint.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:5000`
    pub http_addr: SocketAddr,

    /// Human-readable name reported by `/info`.
    /// Env: `INSTANCE_NAME`
    /// Default: `"BlockLearn Relay"`
    pub instance_name: String,

    /// Maximum members per room (0 = unlimited).
    /// Env: `MAX_ROOM_SIZE`
    /// Default: `0`
    pub max_room_size: usize,

    /// Whether room events are echoed back to their sender. Clients rely
    /// on the echo to confirm provisional chat messages.
    /// Env: `RELAY_ECHO` (true/false)
    /// Default: `true`
    pub relay_echo: bool,

    /// Origins allowed by CORS. Empty means any origin.
    /// Env: `ALLOWED_ORIGINS` (comma separated)
    pub allowed_origins: Vec<String>,

    /// Sustained HTTP requests per second per client IP.
    /// Env: `RATE_LIMIT_PER_SEC`
    /// Default: `10`
    pub http_rate: f64,

    /// HTTP burst size per client IP.
    /// Env: `RATE_LIMIT_BURST`
    /// Default: `30`
    pub http_burst: f64,

    /// Sustained signaling frames per second per connection.
    /// Env: `FRAME_RATE_PER_SEC`
    /// Default: `50`
    pub frame_rate: f64,

    /// Signaling frame burst per connection. ICE trickling sends a burst of
    /// candidates right after each offer/answer.
    /// Env: `FRAME_BURST`
    /// Default: `200`
    pub frame_burst: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            instance_name: "BlockLearn Relay".to_string(),
            max_room_size: 0,
            relay_echo: true,
            allowed_origins: Vec::new(),
            http_rate: 10.0,
            http_burst: 30.0,
            frame_rate: 50.0,
            frame_burst: 200.0,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup, falling back to
    /// defaults for missing or malformed values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("HTTP_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.http_addr = parsed,
                Err(_) => tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default"),
            }
        }

        if let Some(name) = lookup("INSTANCE_NAME") {
            if !name.trim().is_empty() {
                config.instance_name = name;
            }
        }

        if let Some(n) = lookup("MAX_ROOM_SIZE").and_then(|v| v.parse().ok()) {
            config.max_room_size = n;
        }

        if let Some(val) = lookup("RELAY_ECHO") {
            config.relay_echo = parse_flag(&val);
        }

        if let Some(origins) = lookup("ALLOWED_ORIGINS") {
            config.allowed_origins = origins
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect();
        }

        let positive = |key: &str| {
            lookup(key)
                .and_then(|v| v.parse::<f64>().ok())
                .filter(|v| *v > 0.0)
        };
        if let Some(v) = positive("RATE_LIMIT_PER_SEC") {
            config.http_rate = v;
        }
        if let Some(v) = positive("RATE_LIMIT_BURST") {
            config.http_burst = v;
        }
        if let Some(v) = positive("FRAME_RATE_PER_SEC") {
            config.frame_rate = v;
        }
        if let Some(v) = positive("FRAME_BURST") {
            config.frame_burst = v;
        }

        config
    }
}

fn parse_flag(val: &str) -> bool {
    !matches!(val.trim().to_ascii_lowercase().as_str(), "false" | "0" | "no" | "off")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 5000).into());
        assert!(config.relay_echo);
        assert_eq!(config.max_room_size, 0);
    }

    #[test]
    fn test_from_lookup() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("HTTP_ADDR", "127.0.0.1:6000"),
            ("INSTANCE_NAME", "staging"),
            ("MAX_ROOM_SIZE", "2"),
            ("RELAY_ECHO", "off"),
            ("ALLOWED_ORIGINS", "http://localhost:5173, https://blocklearn.app"),
            ("FRAME_BURST", "-4"),
        ]));
        assert_eq!(config.http_addr, ([127, 0, 0, 1], 6000).into());
        assert_eq!(config.instance_name, "staging");
        assert_eq!(config.max_room_size, 2);
        assert!(!config.relay_echo);
        assert_eq!(config.allowed_origins.len(), 2);
        assert_eq!(config.frame_burst, 200.0);
    }

    #[test]
    fn test_malformed_values_keep_defaults() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("HTTP_ADDR", "not an address"),
            ("MAX_ROOM_SIZE", "many"),
        ]));
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 5000).into());
        assert_eq!(config.max_room_size, 0);
    }
}
