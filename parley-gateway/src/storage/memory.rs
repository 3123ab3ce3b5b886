//! In-memory message store for tests and single-process development.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{validate_chat, MessageStore, StatusChange, StoreResult};
use crate::error::StoreError;
use crate::model::{now_millis, Chat, ChatId, DeliveryStatus, Message, MessageId, NewMessage, UserId};

#[derive(Default)]
struct MemoryInner {
    chats: HashMap<ChatId, Chat>,
    messages: HashMap<MessageId, Message>,
    /// Append order per chat.
    by_chat: HashMap<ChatId, Vec<MessageId>>,
    /// Append order per recipient, only while `SENT`.
    undelivered: HashMap<UserId, Vec<MessageId>>,
}

#[derive(Default)]
pub struct MemoryMessageStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn message_count(&self) -> usize {
        self.inner.read().await.messages.len()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn create_chat(&self, chat: Chat) -> StoreResult<Chat> {
        validate_chat(&chat)?;
        let mut inner = self.inner.write().await;
        if inner.chats.contains_key(&chat.id) {
            return Err(StoreError::Conflict(format!("chat {} already exists", chat.id)));
        }
        inner.chats.insert(chat.id.clone(), chat.clone());
        Ok(chat)
    }

    async fn get_chat(&self, id: &ChatId) -> StoreResult<Option<Chat>> {
        Ok(self.inner.read().await.chats.get(id).cloned())
    }

    async fn append_message(&self, new: NewMessage) -> StoreResult<Message> {
        let mut inner = self.inner.write().await;
        if !inner.chats.contains_key(&new.chat_id) {
            return Err(StoreError::NotFound(format!("chat {}", new.chat_id)));
        }

        let message = Message {
            id: MessageId::new(),
            chat_id: new.chat_id,
            sender_id: new.sender_id,
            recipient_id: new.recipient_id,
            content: new.content,
            status: new.status,
            created_at: now_millis(),
        };
        inner
            .by_chat
            .entry(message.chat_id.clone())
            .or_default()
            .push(message.id);
        if message.status == DeliveryStatus::Sent {
            inner
                .undelivered
                .entry(message.recipient_id.clone())
                .or_default()
                .push(message.id);
        }
        inner.messages.insert(message.id, message.clone());
        Ok(message)
    }

    async fn get_message(&self, id: MessageId) -> StoreResult<Option<Message>> {
        Ok(self.inner.read().await.messages.get(&id).cloned())
    }

    async fn list_undelivered(&self, recipient: &UserId, chat: Option<&ChatId>) -> StoreResult<Vec<Message>> {
        let inner = self.inner.read().await;
        let Some(ids) = inner.undelivered.get(recipient) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| inner.messages.get(id))
            .filter(|m| chat.is_none_or(|c| &m.chat_id == c))
            .cloned()
            .collect())
    }

    async fn update_status(&self, id: MessageId, target: DeliveryStatus) -> StoreResult<StatusChange> {
        let mut inner = self.inner.write().await;
        let Some(message) = inner.messages.get_mut(&id) else {
            return Err(StoreError::NotFound(format!("message {id}")));
        };

        let previous = message.status;
        if !previous.can_advance_to(target) {
            return Ok(StatusChange::Unchanged {
                message: message.clone(),
            });
        }
        message.status = target;
        let message = message.clone();

        if previous == DeliveryStatus::Sent {
            if let Some(ids) = inner.undelivered.get_mut(&message.recipient_id) {
                ids.retain(|m| *m != id);
                if ids.is_empty() {
                    inner.undelivered.remove(&message.recipient_id);
                }
            }
        }
        Ok(StatusChange::Advanced { previous, message })
    }

    async fn list_messages(&self, chat: &ChatId, limit: usize) -> StoreResult<Vec<Message>> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_chat
            .get(chat)
            .map(|ids| {
                ids.iter()
                    .rev()
                    .take(limit)
                    .filter_map(|id| inner.messages.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
