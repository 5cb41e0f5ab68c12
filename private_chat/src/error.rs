use thiserror::Error;

/// Failures surfaced by the realtime core to the session that caused them.
/// An offline recipient or a stale presence unregister is not an error.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("message needs a body or an attachment")]
    InvalidMessage,
    #[error("message could not be persisted")]
    PersistenceFailure(#[source] anyhow::Error),
    #[error("join before sending messages")]
    NotJoined,
    #[error("session has already joined")]
    AlreadyJoined,
    #[error("username does not match the authenticated user")]
    IdentityMismatch,
    #[error("session is closed")]
    SessionClosed,
    #[error("malformed event")]
    BadEvent,
}

impl ChatError {
    /// Stable code sent to clients in `error` events.
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::InvalidMessage => "invalid_message",
            ChatError::PersistenceFailure(_) => "persistence_failure",
            ChatError::NotJoined => "not_joined",
            ChatError::AlreadyJoined => "already_joined",
            ChatError::IdentityMismatch => "identity_mismatch",
            ChatError::SessionClosed => "session_closed",
            ChatError::BadEvent => "bad_event",
        }
    }
}
