/// Application name
pub const APP_NAME: &str = "BlockLearn";

/// Wire protocol version reported by the relay's `/info` endpoint
pub const PROTOCOL_VERSION: &str = "blocklearn-signal/1";

/// Default HTTP/WebSocket port of the signaling relay
pub const DEFAULT_HTTP_PORT: u16 = 5000;

/// WebSocket path on the relay
pub const SIGNALING_PATH: &str = "/ws";

/// Maximum size of a single signaling frame in bytes (64 KiB)
pub const MAX_FRAME_SIZE: usize = 65_536;

/// Room key used when no session id is available
pub const DEFAULT_SESSION_KEY: &str = "default";

/// Prefix of chat/session rooms
pub const CHAT_ROOM_PREFIX: &str = "chat";

/// Prefix of interview rooms
pub const INTERVIEW_ROOM_PREFIX: &str = "interview";

/// Sessions that ended more than this many seconds ago are considered lapsed
pub const SESSION_LAPSE_GRACE_SECS: i64 = 3600;

/// Default session duration offered by the proposal form, in minutes
pub const DEFAULT_DURATION_MINUTES: u32 = 60;

/// Default STUN servers
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];
