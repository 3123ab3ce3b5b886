//! Delivery tracker: the SENT → DELIVERED → READ state machine.
//!
//! ```text
//!          recipient reachable in room at send time
//!   ┌──────────────────────────────────────────────┐
//!   │                                              ▼
//! SENT ── recipient joins room ──▶ DELIVERED ── read-ack ──▶ READ
//!   │                                                         ▲
//!   └──────────────────── read-ack ───────────────────────────┘
//! ```
//!
//! Transitions are decided by the storage compare-and-set, never by the
//! cached copy, so racing triggers (a join sweep against a read-ack, two
//! joins from two devices) each advance a message at most once. Only a
//! transition that actually happened notifies the sender.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::cache::MessageCache;
use crate::error::ChatError;
use crate::events::{ChatEvent, EventSink};
use crate::fanout::{Publisher, Topic};
use crate::model::{Chat, ChatId, DeliveryStatus, Message, MessageId, NewMessage, UserId};
use crate::presence::PresenceStore;
use crate::protocol::BusEvent;
use crate::storage::{MessageStore, StatusChange};

pub struct DeliveryTracker {
    store: Arc<dyn MessageStore>,
    presence: Arc<dyn PresenceStore>,
    publisher: Publisher,
    cache: MessageCache,
    events: Arc<dyn EventSink>,
    transitions: AtomicU64,
}

impl DeliveryTracker {
    pub fn new(
        store: Arc<dyn MessageStore>,
        presence: Arc<dyn PresenceStore>,
        publisher: Publisher,
        cache: MessageCache,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            presence,
            publisher,
            cache,
            events,
            transitions: AtomicU64::new(0),
        }
    }

    pub fn cache(&self) -> &MessageCache {
        &self.cache
    }

    /// Number of status transitions this tracker performed.
    pub fn transitions(&self) -> u64 {
        self.transitions.load(Ordering::Relaxed)
    }

    /// DELIVERED iff the recipient is reachable in the chat's room anywhere
    /// in the cluster. A presence failure never upgrades the status.
    pub async fn initial_status(&self, recipient: &UserId, chat: &ChatId) -> DeliveryStatus {
        match self.presence.is_reachable_in(recipient, chat).await {
            Ok(true) => DeliveryStatus::Delivered,
            Ok(false) => DeliveryStatus::Sent,
            Err(e) => {
                log::warn!("Delivery: reachability of {recipient} in {chat} unknown, assuming SENT: {e}");
                DeliveryStatus::Sent
            }
        }
    }

    /// Persist a new message from `sender` in `chat` with its initial status.
    pub async fn accept(&self, chat: &Chat, sender: &UserId, content: String) -> Result<Message, ChatError> {
        let recipient = chat
            .counterpart(sender)
            .ok_or_else(|| ChatError::NotAParticipant {
                user: sender.clone(),
                chat: chat.id.clone(),
            })?
            .clone();
        let status = self.initial_status(&recipient, &chat.id).await;

        let message = self
            .store
            .append_message(NewMessage {
                chat_id: chat.id.clone(),
                sender_id: sender.clone(),
                recipient_id: recipient,
                content,
                status,
            })
            .await?;
        self.cache.put(message.clone());
        self.events.publish(ChatEvent::MessageSent {
            message_id: message.id,
            chat_id: message.chat_id.clone(),
            sender_id: message.sender_id.clone(),
            status: message.status,
        });
        log::debug!("Delivery: message {} in {} accepted as {}", message.id, message.chat_id, message.status);

        if message.status == DeliveryStatus::Sent {
            return Ok(self.recheck_reachability(message).await);
        }
        Ok(message)
    }

    /// The recipient may have joined between the reachability read and the
    /// append, after its join sweep ran. Its join sweep cannot see the
    /// message then, so look again now that the message is stored.
    async fn recheck_reachability(&self, message: Message) -> Message {
        if !matches!(self.presence.is_reachable_in(&message.recipient_id, &message.chat_id).await, Ok(true)) {
            return message;
        }
        match self.transition(message.id, DeliveryStatus::Delivered).await {
            Ok(change) => change.into_message(),
            Err(e) => {
                log::warn!("Delivery: could not advance {} after late join: {e}", message.id);
                message
            }
        }
    }

    pub async fn get_message(&self, id: MessageId) -> Result<Message, ChatError> {
        if let Some(message) = self.cache.get(&id) {
            return Ok(message);
        }
        let message = self
            .store
            .get_message(id)
            .await?
            .ok_or(ChatError::MessageNotFound(id))?;
        self.cache.put(message.clone());
        Ok(message)
    }

    /// Advance every SENT message addressed to `recipient` in `chat` to
    /// DELIVERED. Returns the messages this call actually advanced.
    pub async fn deliver_pending(&self, recipient: &UserId, chat: &ChatId) -> Result<Vec<Message>, ChatError> {
        let pending = self.store.list_undelivered(recipient, Some(chat)).await?;
        let mut delivered = Vec::new();
        for message in pending {
            match self.transition(message.id, DeliveryStatus::Delivered).await {
                Ok(StatusChange::Advanced { message, .. }) => delivered.push(message),
                Ok(StatusChange::Unchanged { .. }) => {}
                Err(e) => log::warn!("Delivery: could not advance {}: {e}", message.id),
            }
        }
        if !delivered.is_empty() {
            log::debug!("Delivery: {} pending messages in {chat} delivered to {recipient}", delivered.len());
        }
        Ok(delivered)
    }

    /// Record a read acknowledgement from `reader`.
    pub async fn mark_read(&self, reader: &UserId, id: MessageId) -> Result<Message, ChatError> {
        let message = self.get_message(id).await?;
        if &message.sender_id != reader && &message.recipient_id != reader {
            return Err(ChatError::NotAParticipant {
                user: reader.clone(),
                chat: message.chat_id,
            });
        }
        if &message.sender_id == reader {
            return Err(ChatError::OwnMessage(id));
        }

        match self.transition(id, DeliveryStatus::Read).await? {
            StatusChange::Advanced { message, .. } => Ok(message),
            StatusChange::Unchanged { message } => Err(ChatError::AlreadyInTerminalState {
                id,
                status: message.status,
            }),
        }
    }

    /// Compare-and-set the status; on an actual advance refresh the cache,
    /// report the event and notify the sender's connections.
    async fn transition(&self, id: MessageId, target: DeliveryStatus) -> Result<StatusChange, ChatError> {
        let change = match self.store.update_status(id, target).await {
            Ok(change) => change,
            Err(crate::error::StoreError::NotFound(_)) => return Err(ChatError::MessageNotFound(id)),
            Err(e) => return Err(e.into()),
        };
        self.cache.put(change.message().clone());

        if let StatusChange::Advanced { previous, message } = &change {
            self.transitions.fetch_add(1, Ordering::Relaxed);
            self.events.publish(ChatEvent::StatusChanged {
                message_id: message.id,
                chat_id: message.chat_id.clone(),
                from: *previous,
                to: message.status,
            });
            self.publisher
                .publish_best_effort(
                    &Topic::User(message.sender_id.clone()),
                    None,
                    BusEvent::StatusUpdate {
                        message_id: message.id,
                        chat_id: message.chat_id.clone(),
                        status: message.status,
                    },
                )
                .await;
        }
        Ok(change)
    }
}
