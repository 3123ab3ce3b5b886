//! Reference WebSocket client.
//!
//! Provides:
//! - Handshake with a bearer token (header or query parameter)
//! - Request/reply correlation by `ref`
//! - Server events on a channel
//! - Typed helpers for every action

use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::model::{ChatId, ConnectionId, DeliveryStatus, Message, MessageId, UserId};
use crate::presence::PresenceRecord;
use crate::protocol::{ClientAction, ErrorBody, Inbound, ProtocolError, Reply, ServerEvent, ServerFrame};

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("credential is not a valid header value")]
    InvalidCredential,
    #[error("connection closed by server ({code}: {reason})")]
    Closed { code: u16, reason: String },
    #[error("connection lost")]
    Disconnected,
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("{}: {}", .0.code, .0.message)]
    Action(ErrorBody),
    #[error("unexpected reply payload: {0}")]
    UnexpectedReply(String),
}

impl ClientError {
    /// Error code of a rejected action.
    pub fn code(&self) -> Option<&str> {
        match self {
            ClientError::Action(body) => Some(&body.code),
            _ => None,
        }
    }
}

/// How the server ended the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

impl From<Option<CloseFrame>> for CloseInfo {
    fn from(frame: Option<CloseFrame>) -> Self {
        match frame {
            Some(frame) => Self {
                code: u16::from(frame.code),
                reason: frame.reason.as_str().to_string(),
            },
            None => Self {
                code: 1005,
                reason: String::new(),
            },
        }
    }
}

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<Reply>>>>;

pub struct ChatClient {
    connection_id: ConnectionId,
    user_id: UserId,
    outgoing: mpsc::Sender<WsMessage>,
    pending: Pending,
    next_ref: AtomicU64,
    events: mpsc::UnboundedReceiver<ServerEvent>,
    reader: Option<JoinHandle<Option<CloseInfo>>>,
}

impl ChatClient {
    /// Connect sending the token in the `Authorization` header.
    pub async fn connect(url: &str, token: &str) -> Result<Self, ClientError> {
        let mut request = url.into_client_request()?;
        let header = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_| ClientError::InvalidCredential)?;
        request.headers_mut().insert("authorization", header);
        let (ws_stream, _) = tokio_tungstenite::connect_async(request).await?;
        Self::start(ws_stream).await
    }

    /// Connect sending the token as the `token` query parameter.
    pub async fn connect_with_query(url: &str, token: &str) -> Result<Self, ClientError> {
        let separator = if url.contains('?') { '&' } else { '?' };
        let (ws_stream, _) = tokio_tungstenite::connect_async(format!("{url}{separator}token={token}")).await?;
        Self::start(ws_stream).await
    }

    async fn start<S>(ws_stream: tokio_tungstenite::WebSocketStream<S>) -> Result<Self, ClientError>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (mut writer, mut reader) = ws_stream.split();

        // The server either sends `ready` or closes the connection.
        let (connection_id, user_id) = loop {
            match reader.next().await {
                Some(Ok(WsMessage::Text(text))) => match ServerFrame::decode(text.as_str())? {
                    ServerFrame::Ready {
                        connection_id,
                        user_id,
                    } => break (connection_id, user_id),
                    other => log::debug!("Client: ignoring frame before ready: {other:?}"),
                },
                Some(Ok(WsMessage::Close(frame))) => {
                    let info = CloseInfo::from(frame);
                    return Err(ClientError::Closed {
                        code: info.code,
                        reason: info.reason,
                    });
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => return Err(ClientError::Disconnected),
            }
        };

        let (out_tx, mut out_rx) = mpsc::channel::<WsMessage>(256);
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, WsMessage::Close(_));
                if writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (event_tx, events) = mpsc::unbounded_channel();
        let reader_pending = pending.clone();
        let reader = tokio::spawn(async move {
            let mut close = None;
            while let Some(msg) = reader.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => match ServerFrame::decode(text.as_str()) {
                        Ok(ServerFrame::Reply(reply)) => {
                            let waiter = match &reply.reference {
                                Some(reference) => reader_pending.lock().await.remove(reference),
                                None => None,
                            };
                            match waiter {
                                Some(waiter) => {
                                    let _ = waiter.send(reply);
                                }
                                None => log::debug!("Client: uncorrelated reply {reply:?}"),
                            }
                        }
                        Ok(ServerFrame::Event(event)) => {
                            let _ = event_tx.send(event);
                        }
                        Ok(ServerFrame::Ready { .. }) => {}
                        Err(e) => log::warn!("Client: undecodable frame: {e}"),
                    },
                    Ok(WsMessage::Close(frame)) => {
                        close = Some(CloseInfo::from(frame));
                        break;
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
            // Wake every waiter with a disconnect.
            reader_pending.lock().await.clear();
            close
        });

        Ok(Self {
            connection_id,
            user_id,
            outgoing: out_tx,
            pending,
            next_ref: AtomicU64::new(1),
            events,
            reader: Some(reader),
        })
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Send an action and wait for its correlated reply.
    pub async fn request(&self, action: ClientAction) -> Result<Reply, ClientError> {
        let reference = self.next_ref.fetch_add(1, Ordering::Relaxed).to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(reference.clone(), tx);

        let frame = Inbound::new(Some(reference.clone()), action).encode()?;
        if self.outgoing.send(WsMessage::Text(frame.into())).await.is_err() {
            self.pending.lock().await.remove(&reference);
            return Err(ClientError::Disconnected);
        }

        match tokio::time::timeout(REPLY_TIMEOUT, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ClientError::Disconnected),
            Err(_) => {
                self.pending.lock().await.remove(&reference);
                Err(ClientError::Timeout(REPLY_TIMEOUT))
            }
        }
    }

    /// Send a raw text frame. Replies to it arrive only if it carries a
    /// `ref` this client is waiting on.
    pub async fn send_raw(&self, text: impl Into<String>) -> Result<(), ClientError> {
        let text: String = text.into();
        self.outgoing
            .send(WsMessage::Text(text.into()))
            .await
            .map_err(|_| ClientError::Disconnected)
    }

    async fn call<T: DeserializeOwned>(&self, action: ClientAction) -> Result<T, ClientError> {
        let reply = self.request(action).await?;
        if !reply.ok {
            return Err(match reply.error {
                Some(body) => ClientError::Action(body),
                None => ClientError::UnexpectedReply("failure without error body".to_string()),
            });
        }
        let data = reply.data.unwrap_or(Value::Null);
        serde_json::from_value(data).map_err(|e| ClientError::UnexpectedReply(e.to_string()))
    }

    async fn call_ok(&self, action: ClientAction) -> Result<(), ClientError> {
        let _: OkData = self.call(action).await?;
        Ok(())
    }

    pub async fn send_message(&self, chat: impl Into<ChatId>, content: impl Into<String>) -> Result<(MessageId, DeliveryStatus), ClientError> {
        let accepted: Accepted = self
            .call(ClientAction::SendMessage {
                chat_id: chat.into(),
                content: content.into(),
            })
            .await?;
        Ok((accepted.message_id, accepted.status))
    }

    pub async fn join_room(&self, chat: impl Into<ChatId>) -> Result<(), ClientError> {
        self.call_ok(ClientAction::JoinRoom { chat_id: chat.into() }).await
    }

    pub async fn leave_room(&self, chat: impl Into<ChatId>) -> Result<(), ClientError> {
        self.call_ok(ClientAction::LeaveRoom { chat_id: chat.into() }).await
    }

    pub async fn read_ack(&self, message_id: MessageId) -> Result<(), ClientError> {
        self.call_ok(ClientAction::ReadAck { message_id }).await
    }

    pub async fn list_online(&self) -> Result<Vec<UserId>, ClientError> {
        let online: OnlineData = self.call(ClientAction::ListOnline).await?;
        Ok(online.user_ids)
    }

    pub async fn get_presence(&self, user: impl Into<UserId>) -> Result<Option<PresenceRecord>, ClientError> {
        let data: PresenceData = self.call(ClientAction::GetPresence { user_id: user.into() }).await?;
        Ok(data.presence)
    }

    pub async fn set_away(&self, away: bool) -> Result<(), ClientError> {
        self.call_ok(ClientAction::SetAway { away }).await
    }

    pub async fn fetch_messages(&self, chat: impl Into<ChatId>, limit: Option<usize>) -> Result<Vec<Message>, ClientError> {
        let data: MessagesData = self
            .call(ClientAction::FetchMessages {
                chat_id: chat.into(),
                limit,
            })
            .await?;
        Ok(data.messages)
    }

    /// Next server event, or `None` if none arrives within `timeout` or the
    /// connection is gone.
    pub async fn next_event(&mut self, timeout: Duration) -> Option<ServerEvent> {
        tokio::time::timeout(timeout, self.events.recv()).await.ok().flatten()
    }

    /// Next event accepted by `filter`, skipping the others.
    pub async fn next_event_matching(&mut self, timeout: Duration, filter: impl Fn(&ServerEvent) -> bool) -> Option<ServerEvent> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let event = tokio::time::timeout_at(deadline, self.events.recv()).await.ok().flatten()?;
            if filter(&event) {
                return Some(event);
            }
        }
    }

    /// Close normally.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.outgoing
            .send(WsMessage::Close(None))
            .await
            .map_err(|_| ClientError::Disconnected)
    }

    /// Wait until the server ends the connection. Returns its close frame,
    /// if it sent one. Subsequent calls return `None`.
    pub async fn closed(&mut self) -> Option<CloseInfo> {
        self.reader.take()?.await.ok().flatten()
    }
}

#[derive(Deserialize)]
struct OkData {
    #[allow(dead_code)]
    ok: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Accepted {
    message_id: MessageId,
    status: DeliveryStatus,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OnlineData {
    user_ids: Vec<UserId>,
}

#[derive(Deserialize)]
struct PresenceData {
    presence: Option<PresenceRecord>,
}

#[derive(Deserialize)]
struct MessagesData {
    messages: Vec<Message>,
}
