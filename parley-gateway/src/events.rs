//! Event-log collaborator.
//!
//! The gateway reports what happened (connections, messages, status and
//! presence transitions) to an [`EventSink`]. Publishing never blocks and
//! never fails the action that produced the event.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::model::{ChatId, ConnectionId, DeliveryStatus, MessageId, UserId};
use crate::presence::PresenceStatus;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ChatEvent {
    ConnectionOpened {
        connection_id: ConnectionId,
        user_id: UserId,
    },
    ConnectionClosed {
        connection_id: ConnectionId,
        user_id: UserId,
        reason: String,
    },
    MessageSent {
        message_id: MessageId,
        chat_id: ChatId,
        sender_id: UserId,
        status: DeliveryStatus,
    },
    StatusChanged {
        message_id: MessageId,
        chat_id: ChatId,
        from: DeliveryStatus,
        to: DeliveryStatus,
    },
    PresenceChanged {
        user_id: UserId,
        status: PresenceStatus,
    },
}

/// Fire-and-forget event destination.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: ChatEvent);
}

/// Writes events to the `log` facade at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn publish(&self, event: ChatEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => log::debug!(target: "parley::events", "{json}"),
            Err(_) => log::debug!(target: "parley::events", "{event:?}"),
        }
    }
}

/// Forwards events into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<ChatEvent>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ChatEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn publish(&self, event: ChatEvent) {
        // The consumer going away must not affect the gateway.
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_sink_forwards() {
        let (sink, mut rx) = ChannelEventSink::new();
        let event = ChatEvent::PresenceChanged {
            user_id: "alice".into(),
            status: PresenceStatus::Online,
        };
        sink.publish(event.clone());
        assert_eq!(rx.recv().await, Some(event));

        drop(rx);
        sink.publish(ChatEvent::PresenceChanged {
            user_id: "alice".into(),
            status: PresenceStatus::Offline,
        });
    }

    #[test]
    fn test_event_json_shape() {
        let value = serde_json::to_value(ChatEvent::StatusChanged {
            message_id: MessageId::new(),
            chat_id: "c1".into(),
            from: DeliveryStatus::Sent,
            to: DeliveryStatus::Delivered,
        })
        .unwrap();
        assert_eq!(value["kind"], "status-changed");
        assert_eq!(value["to"], "DELIVERED");
    }
}
