use crate::types::ParticipantId;
use thiserror::Error;

/// Errors surfaced to the host through `join`/`leave` results and the
/// `CallEvent::Error` output.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("microphone access denied")]
    MediaAccessDenied,
    #[error("no audio input device available")]
    MediaUnavailable,
    #[error("signaling connection lost: {0}")]
    SignalingDisconnected(String),
    #[error("peer {0} is unreachable")]
    PeerUnreachable(ParticipantId),
    #[error("a join is already in progress")]
    AlreadyJoining,
    #[error("already joined a room")]
    AlreadyJoined,
    #[error("protocol violation from {participant}: {detail}")]
    ProtocolViolation {
        participant: ParticipantId,
        detail: String,
    },
}

impl CallError {
    /// Session-fatal errors force a full teardown.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CallError::MediaAccessDenied
                | CallError::MediaUnavailable
                | CallError::SignalingDisconnected(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("permission denied: {0}")]
    AccessDenied(String),
    #[error("device unavailable: {0}")]
    Unavailable(String),
}

impl From<MediaError> for CallError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::AccessDenied(_) => CallError::MediaAccessDenied,
            MediaError::Unavailable(_) => CallError::MediaUnavailable,
        }
    }
}

/// Failure reported by a `PeerTransport` operation.
#[derive(Debug, Error)]
#[error("transport error: {0}")]
pub struct TransportError(#[from] pub anyhow::Error);

impl TransportError {
    pub fn msg(message: impl std::fmt::Display) -> Self {
        Self(anyhow::anyhow!("{}", message))
    }
}

pub type Result<T> = std::result::Result<T, CallError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_errors_map_onto_call_errors() {
        assert_eq!(
            CallError::from(MediaError::AccessDenied("user said no".into())),
            CallError::MediaAccessDenied
        );
        assert_eq!(
            CallError::from(MediaError::Unavailable("no device".into())),
            CallError::MediaUnavailable
        );
    }

    #[test]
    fn only_session_level_failures_are_fatal() {
        assert!(CallError::SignalingDisconnected("eof".into()).is_fatal());
        assert!(!CallError::PeerUnreachable("P2".into()).is_fatal());
        assert!(!CallError::AlreadyJoined.is_fatal());
    }
}
