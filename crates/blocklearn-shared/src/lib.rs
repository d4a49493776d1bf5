//! # blocklearn-shared
//!
//! Types shared by the BlockLearn real-time engine and the signaling relay:
//! participant identities, room keys, the JSON wire protocol and the session
//! proposal model.

pub mod constants;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod types;

pub use error::SharedError;
pub use identity::{Identity, Role, SenderInfo};
pub use protocol::{ClientEvent, RoomEvent, ServerEvent};
pub use types::{PeerId, RoomKey};
