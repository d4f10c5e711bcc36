//! Group voice calls over a full mesh of peer connections, negotiated
//! through a room relay.

pub mod audio;
pub mod config;
pub mod connection;
pub mod controller;
pub mod error;
pub mod media;
pub mod mesh;
pub mod negotiation;
pub mod rtc;
pub mod session;
pub mod signaling;
pub mod transport;
pub mod types;

pub use config::{CallConfig, IceServer};
pub use controller::{Backends, CallEvent, CallSessionController, LoopEvent, SessionState};
pub use error::{CallError, MediaError, Result, TransportError};
pub use session::CallSession;
pub use types::{ParticipantId, Role, RoomId};
