use blocklearn_shared::SharedError;
use blocklearn_store::StoreError;
use thiserror::Error;

use crate::peer::NegotiationState;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Invalid signaling URL: {0}")]
    InvalidUrl(String),

    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Signaling transport is closed")]
    Closed,

    #[error("Failed to queue frame: {0}")]
    SendFailed(String),

    #[error(transparent)]
    Protocol(#[from] SharedError),
}

/// Local camera/microphone acquisition failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Your device does not support video calls")]
    NotSupported,

    #[error("Camera/microphone access was denied. Please allow access and try again.")]
    PermissionDenied,

    #[error("Camera or microphone is already in use by another application")]
    DeviceBusy,

    #[error("No camera or microphone was found")]
    NoDevice,

    #[error("Camera/microphone cannot satisfy the requested settings: {0}")]
    Constraints(String),

    #[error("Could not access camera/microphone: {0}")]
    Other(String),
}

impl MediaError {
    /// Map a browser `DOMException` name to the matching cause.
    pub fn from_dom_name(name: &str, message: &str) -> Self {
        match name {
            "NotAllowedError" | "PermissionDeniedError" | "SecurityError" => Self::PermissionDenied,
            "NotReadableError" | "TrackStartError" | "AbortError" => Self::DeviceBusy,
            "NotFoundError" | "DevicesNotFoundError" => Self::NoDevice,
            "OverconstrainedError" | "ConstraintNotSatisfiedError" => {
                Self::Constraints(message.to_string())
            }
            "NotSupportedError" | "TypeError" => Self::NotSupported,
            _ => Self::Other(format!("{name}: {message}")),
        }
    }
}

#[derive(Error, Debug)]
pub enum PeerError {
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Local media is not ready")]
    MediaNotReady,

    #[error("Cannot {operation} in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: NegotiationState,
    },

    #[error("Connection is closed")]
    Closed,

    #[error("Max connections reached ({0})")]
    MaxConnectionsReached(usize),
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid API URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Server returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Unexpected response: {0}")]
    Decode(String),
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),

    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Shared(#[from] SharedError),

    #[error("Unknown proposal: {0}")]
    UnknownProposal(String),

    #[error("Invalid rating {0}, expected 1-5")]
    InvalidRating(u8),

    #[error("No durable session has been created yet")]
    NoDurableSession,

    #[error("Engine is not running")]
    NotRunning,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dom_names_map_to_causes() {
        assert_eq!(
            MediaError::from_dom_name("NotAllowedError", "denied"),
            MediaError::PermissionDenied
        );
        assert_eq!(
            MediaError::from_dom_name("NotReadableError", ""),
            MediaError::DeviceBusy
        );
        assert_eq!(
            MediaError::from_dom_name("NotFoundError", ""),
            MediaError::NoDevice
        );
        assert_eq!(
            MediaError::from_dom_name("OverconstrainedError", "width"),
            MediaError::Constraints("width".into())
        );
        assert!(matches!(
            MediaError::from_dom_name("WeirdError", "x"),
            MediaError::Other(_)
        ));
    }

    #[test]
    fn test_media_messages_are_human_readable() {
        let msg = MediaError::PermissionDenied.to_string();
        assert!(msg.contains("denied"));
        assert!(!MediaError::NoDevice.to_string().is_empty());
    }
}
