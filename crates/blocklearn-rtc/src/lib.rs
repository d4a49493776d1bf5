//! # blocklearn-rtc
//!
//! Real-time core of a BlockLearn call: signaling transport, per-peer WebRTC
//! connections, room presence, session proposal negotiation with its timer,
//! and the room chat.
//!
//! Everything is driven by [`CallEngine`], a single tokio task that owns all
//! call state and talks to the hosting UI through [`EngineHandle`] commands
//! and [`EngineEvent`]s.

pub mod api;
#[cfg(feature = "capture")]
pub mod capture;
pub mod chat;
pub mod config;
pub mod engine;
pub mod error;
pub mod link;
pub mod media;
pub mod negotiation;
pub mod peer;
pub mod presence;
pub mod timer;
pub mod transport;
pub mod webrtc_link;

#[cfg(test)]
mod testing;

pub use config::{EngineConfig, RoleProfile};
pub use engine::{
    CallEngine, EngineCommand, EngineDeps, EngineEvent, EngineHandle, FatalReason, SignalingStatus,
};
pub use error::{ApiError, EngineError, MediaError, PeerError, TransportError};
