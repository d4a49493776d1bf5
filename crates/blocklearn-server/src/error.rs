use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use blocklearn_shared::{PeerId, RoomKey, SharedError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Room {room} is full ({max} members)")]
    RoomFull { room: RoomKey, max: usize },

    #[error("Not a member of room {0}")]
    NotInRoom(RoomKey),

    #[error("Unknown peer: {0}")]
    UnknownPeer(PeerId),

    #[error("Too many signaling frames")]
    RateLimited,

    #[error("Invalid frame: {0}")]
    BadFrame(#[from] SharedError),

    #[error("No such room: {0}")]
    UnknownRoom(RoomKey),
}

impl ServerError {
    /// Machine-readable code sent in `error` frames.
    pub fn code(&self) -> &'static str {
        match self {
            ServerError::RoomFull { .. } => "room-full",
            ServerError::NotInRoom(_) => "not-in-room",
            ServerError::UnknownPeer(_) => "unknown-peer",
            ServerError::RateLimited => "rate-limited",
            ServerError::BadFrame(_) => "bad-frame",
            ServerError::UnknownRoom(_) => "unknown-room",
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::RoomFull { .. } => (StatusCode::CONFLICT, self.to_string()),
            ServerError::NotInRoom(_)
            | ServerError::UnknownPeer(_)
            | ServerError::UnknownRoom(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ServerError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, self.to_string()),
            ServerError::BadFrame(_) => (StatusCode::BAD_REQUEST, self.to_string()),
        };

        let body = serde_json::json!({
            "error": message,
            "code": self.code(),
        });

        (status, axum::Json(body)).into_response()
    }
}
