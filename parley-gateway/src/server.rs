//! WebSocket front end.
//!
//! ```text
//!  TCP accept ──▶ upgrade (credential from header or ?token=)
//!                   │
//!                   ├─ rejected ──▶ close 4001, nothing registered
//!                   ▼
//!             Gateway::open_connection ──▶ ready frame
//!                   │
//!             ┌─────┴──────────── pump task ────────────────────┐
//!             │  inbound text  ──▶ handle_action ──▶ reply       │
//!             │  outbound queue ──▶ event frames / close frame   │
//!             └─────┬───────────────────────────────────────────┘
//!                   ▼
//!             Gateway::close_connection   (always, even if the pump panicked)
//! ```

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::error::ChatError;
use crate::gateway::{Gateway, GatewayError};
use crate::model::ConnectionId;
use crate::protocol::{CloseReason, Inbound, ProtocolError, Reply, ServerFrame};
use crate::registry::Outbound;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Bearer credential from the upgrade request: the `Authorization` header,
/// or the `token` query parameter for clients that cannot set headers.
pub(crate) fn extract_credential(request: &Request) -> Option<String> {
    let from_header = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());
    if from_header.is_some() {
        return from_header;
    }
    request
        .uri()
        .query()?
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
        .map(str::to_string)
        .filter(|t| !t.is_empty())
}

fn close_message(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: reason.into(),
    }))
}

/// Accepts WebSocket connections and drives them through a [`Gateway`].
pub struct ChatServer {
    gateway: Gateway,
}

impl ChatServer {
    pub fn new(gateway: Gateway) -> Self {
        Self { gateway }
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    /// Bind to the configured address and serve forever.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.gateway.config().bind_addr).await?;
        self.run_on(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn run_on(&self, listener: TcpListener) -> Result<(), ServerError> {
        self.run_until(listener, std::future::pending()).await
    }

    /// Serve until `shutdown` resolves, then ask every connection to close.
    pub async fn run_until(&self, listener: TcpListener, shutdown: impl Future<Output = ()>) -> Result<(), ServerError> {
        log::info!("Chat server listening on {}", listener.local_addr()?);
        let maintenance = self.gateway.spawn_maintenance();
        tokio::pin!(shutdown);

        let result = loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => break Err(ServerError::Io(e)),
                    };
                    log::debug!("New TCP connection from {addr}");
                    let gateway = self.gateway.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, addr, gateway).await {
                            log::warn!("Connection error from {addr}: {e}");
                        }
                    });
                }
                _ = &mut shutdown => {
                    log::info!("Chat server shutting down");
                    self.gateway.shutdown().await;
                    break Ok(());
                }
            }
        };
        maintenance.abort();
        result
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(stream: TcpStream, addr: SocketAddr, gateway: Gateway) -> Result<(), ServerError> {
        let mut credential = None;
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |request: &Request, response: Response| {
            credential = extract_credential(request);
            Ok::<Response, ErrorResponse>(response)
        })
        .await?;
        let (mut sink, source) = ws_stream.split();

        let user = match gateway.authenticate(credential.as_deref().unwrap_or_default()).await {
            Ok(user) => user,
            Err(e) => {
                log::info!("Rejecting {addr}: {e}");
                let reason = CloseReason::AuthenticationFailed;
                sink.send(close_message(reason.code(), reason.as_str())).await?;
                return Ok(());
            }
        };

        let (outbound_tx, outbound_rx) = mpsc::channel(gateway.config().outbound_buffer);
        let conn = match gateway.open_connection(user.clone(), outbound_tx).await {
            Ok(conn) => conn,
            Err(e) => {
                log::error!("Could not activate {user} from {addr}: {e}");
                sink.send(close_message(u16::from(CloseCode::Error), "activation failed")).await?;
                return Ok(());
            }
        };

        let ready = ServerFrame::Ready {
            connection_id: conn,
            user_id: user.clone(),
        };
        let pump = match sink.send(Message::Text(ready.encode()?.into())).await {
            Ok(()) => tokio::spawn(Self::pump(gateway.clone(), conn, sink, source, outbound_rx)),
            Err(e) => {
                gateway.close_connection(conn, CloseReason::TransportError).await;
                return Err(e.into());
            }
        };

        let reason = match pump.await {
            Ok(reason) => reason,
            Err(e) => {
                log::error!("Connection task for {user}/{conn} failed: {e}");
                CloseReason::TransportError
            }
        };
        gateway.close_connection(conn, reason).await;
        Ok(())
    }

    /// Move frames both ways until either side ends. Returns why.
    async fn pump(
        gateway: Gateway,
        conn: ConnectionId,
        mut sink: WsSink,
        mut source: WsSource,
        mut outbound: mpsc::Receiver<Outbound>,
    ) -> CloseReason {
        loop {
            tokio::select! {
                msg = source.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            gateway.touch(conn).await;
                            let reply = Self::dispatch(&gateway, conn, text.as_str()).await;
                            let frame = match ServerFrame::Reply(reply).encode() {
                                Ok(frame) => frame,
                                Err(e) => {
                                    log::error!("Could not encode reply for {conn}: {e}");
                                    continue;
                                }
                            };
                            if sink.send(Message::Text(frame.into())).await.is_err() {
                                return CloseReason::TransportError;
                            }
                        }
                        Some(Ok(Message::Binary(_))) => {
                            gateway.touch(conn).await;
                            let err = ChatError::InvalidRequest("binary frames are not supported".to_string());
                            let frame = ServerFrame::Reply(Reply::failure(None, &err)).encode();
                            if let Ok(frame) = frame {
                                if sink.send(Message::Text(frame.into())).await.is_err() {
                                    return CloseReason::TransportError;
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            gateway.touch(conn).await;
                            if sink.send(Message::Pong(data)).await.is_err() {
                                return CloseReason::TransportError;
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {
                            gateway.touch(conn).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::debug!("Connection {conn} closed by client");
                            return CloseReason::ClientClosed;
                        }
                        Some(Ok(Message::Frame(_))) => {}
                        Some(Err(e)) => {
                            log::warn!("WebSocket error on {conn}: {e}");
                            return CloseReason::TransportError;
                        }
                    }
                }

                out = outbound.recv() => {
                    match out {
                        Some(Outbound::Event(event)) => {
                            let frame = match ServerFrame::Event(event).encode() {
                                Ok(frame) => frame,
                                Err(e) => {
                                    log::error!("Could not encode event for {conn}: {e}");
                                    continue;
                                }
                            };
                            if sink.send(Message::Text(frame.into())).await.is_err() {
                                return CloseReason::TransportError;
                            }
                        }
                        Some(Outbound::Close(reason)) => {
                            let _ = sink.send(close_message(reason.code(), reason.as_str())).await;
                            return reason;
                        }
                        None => {
                            // Unregistered without a close signal.
                            let reason = CloseReason::ServerShutdown;
                            let _ = sink.send(close_message(reason.code(), reason.as_str())).await;
                            return reason;
                        }
                    }
                }
            }
        }
    }

    async fn dispatch(gateway: &Gateway, conn: ConnectionId, text: &str) -> Reply {
        let inbound = match Inbound::decode(text) {
            Ok(inbound) => inbound,
            Err((reference, e)) => {
                log::debug!("Malformed frame on {conn}: {e}");
                return Reply::failure(reference, &ChatError::InvalidRequest(e.to_string()));
            }
        };
        let action = inbound.action.name();
        match gateway.handle_action(conn, inbound.action).await {
            Ok(reply) => Reply::success(inbound.reference, reply.to_value()),
            Err(e) => {
                if e.is_transient() {
                    log::warn!("{action} on {conn} failed: {e}");
                } else {
                    log::debug!("{action} on {conn} rejected: {e}");
                }
                Reply::failure(inbound.reference, &e)
            }
        }
    }
}
