//! Message and chat persistence.
//!
//! The gateway does not own message history; it talks to a storage
//! collaborator through [`MessageStore`]. Two backends ship with the crate:
//!
//! ```text
//! ┌──────────────┐      MessageStore       ┌─────────────────────────┐
//! │   Gateway    │ ──────────────────────▶ │ MemoryMessageStore      │
//! │   Tracker    │                         │ RocksMessageStore       │
//! └──────────────┘                         │  CF chats               │
//!                                          │  CF messages            │
//!                                          │  CF chat_messages       │
//!                                          │  CF undelivered         │
//!                                          │  CF meta                │
//!                                          └─────────────────────────┘
//! ```
//!
//! Status updates are compare-and-set: a write that would move a message
//! backwards (or sideways) is a no-op that reports the current state.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::model::{Chat, ChatId, DeliveryStatus, Message, MessageId, NewMessage, UserId};

pub mod memory;
#[cfg(feature = "rocksdb")]
pub mod rocks;

pub use memory::MemoryMessageStore;
#[cfg(feature = "rocksdb")]
pub use rocks::{RocksConfig, RocksMessageStore};

pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of a conditional status update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusChange {
    /// The stored status moved forward from `previous`.
    Advanced { previous: DeliveryStatus, message: Message },
    /// The target was not ahead of the stored status; nothing was written.
    Unchanged { message: Message },
}

impl StatusChange {
    pub fn message(&self) -> &Message {
        match self {
            StatusChange::Advanced { message, .. } | StatusChange::Unchanged { message } => message,
        }
    }

    pub fn into_message(self) -> Message {
        match self {
            StatusChange::Advanced { message, .. } | StatusChange::Unchanged { message } => message,
        }
    }

    pub fn is_advanced(&self) -> bool {
        matches!(self, StatusChange::Advanced { .. })
    }
}

/// Storage collaborator.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Create a direct chat. Fails with `Conflict` if the id is taken or the
    /// chat does not have exactly two distinct participants.
    async fn create_chat(&self, chat: Chat) -> StoreResult<Chat>;

    async fn get_chat(&self, id: &ChatId) -> StoreResult<Option<Chat>>;

    /// Persist a message, assigning its id and creation time.
    async fn append_message(&self, message: NewMessage) -> StoreResult<Message>;

    async fn get_message(&self, id: MessageId) -> StoreResult<Option<Message>>;

    /// Messages addressed to `recipient` still in `SENT`, oldest first,
    /// optionally limited to one chat.
    async fn list_undelivered(&self, recipient: &UserId, chat: Option<&ChatId>) -> StoreResult<Vec<Message>>;

    /// Advance a message's status if `target` is strictly ahead of it.
    /// Fails with `NotFound` for an unknown id.
    async fn update_status(&self, id: MessageId, target: DeliveryStatus) -> StoreResult<StatusChange>;

    /// The `limit` most recent messages of a chat, newest first.
    async fn list_messages(&self, chat: &ChatId, limit: usize) -> StoreResult<Vec<Message>>;
}

pub(crate) fn validate_chat(chat: &Chat) -> StoreResult<()> {
    if chat.is_valid_direct() {
        Ok(())
    } else {
        Err(StoreError::Conflict(format!(
            "chat {} must have exactly two distinct participants",
            chat.id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_chat() {
        assert!(validate_chat(&Chat::direct("c1", "alice", "bob")).is_ok());
        assert!(matches!(
            validate_chat(&Chat::direct("c1", "alice", "alice")),
            Err(StoreError::Conflict(_))
        ));
        let group = Chat {
            id: "g".into(),
            participants: vec!["a".into(), "b".into(), "c".into()],
        };
        assert!(validate_chat(&group).is_err());
    }
}
