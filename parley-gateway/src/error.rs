//! Error taxonomy.
//!
//! Subsystem errors stay close to the component that raises them and
//! convert into [`ChatError`], which is what an inbound action reports back
//! to the originating connection. Backend failures of the presence store,
//! fan-out bus and storage all surface as `TRANSIENT_INFRA`.

use thiserror::Error;

use crate::model::{ChatId, DeliveryStatus, MessageId, UserId};

/// Presence store failures.
#[derive(Debug, Clone, Error)]
pub enum PresenceError {
    #[error("presence backend error: {0}")]
    Backend(String),
}

/// Fan-out bus failures.
#[derive(Debug, Clone, Error)]
pub enum BusError {
    #[error("bus backend error: {0}")]
    Backend(String),
    #[error("bus serialization error: {0}")]
    Serialization(String),
    #[error("bus publish timed out")]
    Timeout,
}

/// Storage collaborator failures.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("storage serialization error: {0}")]
    Serialization(String),
}

/// Credential verification failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing credential")]
    MissingCredential,
    #[error("unknown credential")]
    UnknownCredential,
    #[error("credential expired")]
    Expired,
    #[error("credential revoked")]
    Revoked,
}

/// Errors reported by inbound actions.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("authentication failed: {0}")]
    AuthenticationFailure(#[from] AuthError),

    #[error("user {user} is not a participant of chat {chat}")]
    NotAParticipant { user: UserId, chat: ChatId },

    #[error("chat not found: {0}")]
    ChatNotFound(ChatId),

    #[error("message not found: {0}")]
    MessageNotFound(MessageId),

    #[error("message {id} is already {status}")]
    AlreadyInTerminalState { id: MessageId, status: DeliveryStatus },

    #[error("cannot acknowledge own message {0}")]
    OwnMessage(MessageId),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unknown connection")]
    UnknownConnection,

    #[error(transparent)]
    Presence(#[from] PresenceError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ChatError {
    /// Stable machine-readable code carried in error replies.
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::AuthenticationFailure(_) => "AUTHENTICATION_FAILURE",
            ChatError::NotAParticipant { .. } => "NOT_A_PARTICIPANT",
            ChatError::ChatNotFound(_) => "CHAT_NOT_FOUND",
            ChatError::MessageNotFound(_) => "MESSAGE_NOT_FOUND",
            ChatError::AlreadyInTerminalState { .. } => "ALREADY_IN_TERMINAL_STATE",
            ChatError::OwnMessage(_) => "OWN_MESSAGE",
            ChatError::InvalidRequest(_) => "INVALID_REQUEST",
            ChatError::UnknownConnection => "AUTHENTICATION_FAILURE",
            ChatError::Store(StoreError::NotFound(_)) => "NOT_FOUND",
            ChatError::Store(StoreError::Conflict(_)) => "CONFLICT",
            ChatError::Presence(_) | ChatError::Bus(_) | ChatError::Store(_) => "TRANSIENT_INFRA",
        }
    }

    /// Infrastructure failures that a caller may retry.
    pub fn is_transient(&self) -> bool {
        self.code() == "TRANSIENT_INFRA"
    }

    /// Benign conflicts are reported to the caller, never logged as failures.
    pub fn is_benign(&self) -> bool {
        matches!(self, ChatError::AlreadyInTerminalState { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = ChatError::NotAParticipant {
            user: "mallory".into(),
            chat: "c1".into(),
        };
        assert_eq!(err.code(), "NOT_A_PARTICIPANT");
        assert!(!err.is_transient());

        let err = ChatError::from(PresenceError::Backend("down".into()));
        assert_eq!(err.code(), "TRANSIENT_INFRA");
        assert!(err.is_transient());

        let err = ChatError::from(StoreError::Conflict("dup".into()));
        assert_eq!(err.code(), "CONFLICT");
    }

    #[test]
    fn test_terminal_state_is_benign() {
        let err = ChatError::AlreadyInTerminalState {
            id: MessageId::new(),
            status: DeliveryStatus::Read,
        };
        assert!(err.is_benign());
        assert_eq!(err.code(), "ALREADY_IN_TERMINAL_STATE");
        assert!(err.to_string().contains("READ"));
    }
}
