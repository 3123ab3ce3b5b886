//! Integration tests for end-to-end WebSocket chat.
//!
//! These tests start a real server and connect real clients, verifying the
//! handshake, delivery state machine, presence broadcasts and cleanup.

use parley_gateway::client::{ChatClient, ClientError};
use parley_gateway::config::GatewayConfig;
use parley_gateway::gateway::Gateway;
use parley_gateway::model::{Chat, DeliveryStatus};
use parley_gateway::presence::PresenceStatus;
use parley_gateway::protocol::ServerEvent;
use parley_gateway::server::ChatServer;
use std::time::Duration;
use tokio::net::TcpListener;

const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(200);

struct TestServer {
    url: String,
    gateway: Gateway,
}

impl TestServer {
    async fn start(config: GatewayConfig) -> Self {
        let gateway = Gateway::in_memory(config).await.unwrap();
        for (id, a, b) in [("c1", "alice", "bob"), ("c2", "carol", "dave")] {
            gateway.create_chat(Chat::direct(id, a, b)).await.unwrap();
        }

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        let server = ChatServer::new(gateway.clone());
        tokio::spawn(async move {
            server.run_on(listener).await.unwrap();
        });
        Self { url, gateway }
    }

    async fn with_defaults() -> Self {
        Self::start(GatewayConfig::for_testing()).await
    }

    async fn token(&self, user: &str) -> String {
        self.gateway
            .sessions()
            .unwrap()
            .create(user.into(), "test", None)
            .await
            .token
    }

    async fn connect(&self, user: &str) -> ChatClient {
        let token = self.token(user).await;
        ChatClient::connect(&self.url, &token).await.unwrap()
    }
}

fn is_chat_event(event: &ServerEvent) -> bool {
    !matches!(event, ServerEvent::PresenceUpdate { .. })
}

#[tokio::test]
async fn test_ready_frame_identifies_user() {
    let server = TestServer::with_defaults().await;
    let alice = server.connect("alice").await;
    assert_eq!(alice.user_id().as_str(), "alice");
    assert_eq!(server.gateway.registry().lookup(alice.connection_id()).await, Some("alice".into()));
}

#[tokio::test]
async fn test_query_token_fallback() {
    let server = TestServer::with_defaults().await;
    let token = server.token("bob").await;
    let bob = ChatClient::connect_with_query(&server.url, &token).await.unwrap();
    assert_eq!(bob.user_id().as_str(), "bob");
}

#[tokio::test]
async fn test_auth_failure_closes_with_4001() {
    let server = TestServer::with_defaults().await;

    match ChatClient::connect(&server.url, "bogus").await {
        Err(ClientError::Closed { code, .. }) => assert_eq!(code, 4001),
        other => panic!("expected 4001 close, got {:?}", other.map(|c| c.connection_id())),
    }
    match ChatClient::connect_with_query(&server.url, "").await {
        Err(ClientError::Closed { code, .. }) => assert_eq!(code, 4001),
        other => panic!("expected 4001 close, got {:?}", other.map(|c| c.connection_id())),
    }

    assert!(server.gateway.registry().is_empty().await);
    assert!(server.gateway.presence().list_online().await.unwrap().is_empty());
    assert_eq!(server.gateway.stats().await.auth_failures, 2);
}

#[tokio::test]
async fn test_immediate_delivery_to_joined_recipient() {
    let server = TestServer::with_defaults().await;
    let alice = server.connect("alice").await;
    let mut bob = server.connect("bob").await;
    bob.join_room("c1").await.unwrap();

    let (message_id, status) = alice.send_message("c1", "hello bob").await.unwrap();
    assert_eq!(status, DeliveryStatus::Delivered);

    match bob.next_event_matching(WAIT, is_chat_event).await {
        Some(ServerEvent::Message(message)) => {
            assert_eq!(message.id, message_id);
            assert_eq!(message.content, "hello bob");
            assert_eq!(message.sender_id.as_str(), "alice");
        }
        other => panic!("expected message event, got {other:?}"),
    }
}

#[tokio::test]
async fn test_sender_is_not_echoed() {
    let server = TestServer::with_defaults().await;
    let mut alice = server.connect("alice").await;
    alice.join_room("c1").await.unwrap();
    alice.send_message("c1", "anyone?").await.unwrap();
    assert!(alice.next_event_matching(QUIET, is_chat_event).await.is_none());
}

#[tokio::test]
async fn test_pending_message_delivered_on_join() {
    let server = TestServer::with_defaults().await;
    let mut alice = server.connect("alice").await;

    let (message_id, status) = alice.send_message("c1", "see you later").await.unwrap();
    assert_eq!(status, DeliveryStatus::Sent);

    let bob = server.connect("bob").await;
    bob.join_room("c1").await.unwrap();

    assert_eq!(
        alice.next_event_matching(WAIT, is_chat_event).await,
        Some(ServerEvent::StatusUpdate {
            message_id,
            chat_id: "c1".into(),
            status: DeliveryStatus::Delivered,
        })
    );

    let history = bob.fetch_messages("c1", None).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, DeliveryStatus::Delivered);
}

#[tokio::test]
async fn test_repeated_join_notifies_once() {
    let server = TestServer::with_defaults().await;
    let mut alice = server.connect("alice").await;
    alice.send_message("c1", "one").await.unwrap();

    let bob = server.connect("bob").await;
    bob.join_room("c1").await.unwrap();
    bob.join_room("c1").await.unwrap();

    assert!(matches!(
        alice.next_event_matching(WAIT, is_chat_event).await,
        Some(ServerEvent::StatusUpdate { .. })
    ));
    assert!(alice.next_event_matching(QUIET, is_chat_event).await.is_none());
}

#[tokio::test]
async fn test_read_ack_and_repeat() {
    let server = TestServer::with_defaults().await;
    let mut alice = server.connect("alice").await;
    let bob = server.connect("bob").await;
    bob.join_room("c1").await.unwrap();

    let (message_id, _) = alice.send_message("c1", "read me").await.unwrap();

    let err = alice.read_ack(message_id).await.unwrap_err();
    assert_eq!(err.code(), Some("OWN_MESSAGE"));

    bob.read_ack(message_id).await.unwrap();
    assert_eq!(
        alice.next_event_matching(WAIT, is_chat_event).await,
        Some(ServerEvent::StatusUpdate {
            message_id,
            chat_id: "c1".into(),
            status: DeliveryStatus::Read,
        })
    );

    let err = bob.read_ack(message_id).await.unwrap_err();
    assert_eq!(err.code(), Some("ALREADY_IN_TERMINAL_STATE"));
    assert!(alice.next_event_matching(QUIET, is_chat_event).await.is_none());
}

#[tokio::test]
async fn test_non_participant_stays_connected() {
    let server = TestServer::with_defaults().await;
    let mallory = server.connect("mallory").await;

    let err = mallory.join_room("c1").await.unwrap_err();
    assert_eq!(err.code(), Some("NOT_A_PARTICIPANT"));
    let err = mallory.send_message("c1", "hi").await.unwrap_err();
    assert_eq!(err.code(), Some("NOT_A_PARTICIPANT"));
    let err = mallory.fetch_messages("c1", None).await.unwrap_err();
    assert_eq!(err.code(), Some("NOT_A_PARTICIPANT"));

    // Still active.
    assert!(mallory.list_online().await.unwrap().contains(&"mallory".into()));
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let server = TestServer::with_defaults().await;
    let alice = server.connect("alice").await;
    let mut bob = server.connect("bob").await;
    let mut carol = server.connect("carol").await;
    let mut dave = server.connect("dave").await;
    bob.join_room("c1").await.unwrap();
    carol.join_room("c2").await.unwrap();
    dave.join_room("c2").await.unwrap();

    alice.send_message("c1", "only for bob").await.unwrap();

    assert!(matches!(
        bob.next_event_matching(WAIT, is_chat_event).await,
        Some(ServerEvent::Message(_))
    ));
    assert!(carol.next_event_matching(QUIET, is_chat_event).await.is_none());
    assert!(dave.next_event_matching(QUIET, is_chat_event).await.is_none());
}

#[tokio::test]
async fn test_disconnect_cleanup_with_two_devices() {
    let server = TestServer::with_defaults().await;
    let mut alice = server.connect("alice").await;
    let phone = server.connect("bob").await;
    let laptop = server.connect("bob").await;
    phone.join_room("c1").await.unwrap();

    // Let the online broadcasts land before watching for offline.
    tokio::time::sleep(QUIET).await;
    while alice.next_event(Duration::from_millis(10)).await.is_some() {}

    phone.close().await.unwrap();
    tokio::time::sleep(QUIET).await;
    assert!(alice.list_online().await.unwrap().contains(&"bob".into()));
    assert!(!server.gateway.presence().is_reachable_in(&"bob".into(), &"c1".into()).await.unwrap());
    assert!(alice.next_event(Duration::from_millis(10)).await.is_none());

    laptop.close().await.unwrap();
    assert_eq!(
        alice.next_event(WAIT).await,
        Some(ServerEvent::PresenceUpdate {
            user_id: "bob".into(),
            online: false,
            status: PresenceStatus::Offline,
        })
    );
    assert!(!alice.list_online().await.unwrap().contains(&"bob".into()));

    let record = alice.get_presence("bob").await.unwrap().unwrap();
    assert_eq!(record.status, PresenceStatus::Offline);
    assert!(record.connections.is_empty());
}

#[tokio::test]
async fn test_away_is_broadcast() {
    let server = TestServer::with_defaults().await;
    let alice = server.connect("alice").await;
    let mut bob = server.connect("bob").await;

    alice.set_away(true).await.unwrap();
    let event = bob
        .next_event_matching(WAIT, |e| {
            matches!(e, ServerEvent::PresenceUpdate { status: PresenceStatus::Away, .. })
        })
        .await;
    assert_eq!(
        event,
        Some(ServerEvent::PresenceUpdate {
            user_id: "alice".into(),
            online: true,
            status: PresenceStatus::Away,
        })
    );
}

#[tokio::test]
async fn test_idle_connection_closed_with_4008() {
    let config = GatewayConfig {
        idle_timeout: Duration::from_millis(300),
        sweep_interval: Duration::from_millis(100),
        ..GatewayConfig::for_testing()
    };
    let server = TestServer::start(config).await;
    let mut alice = server.connect("alice").await;

    let close = tokio::time::timeout(Duration::from_secs(3), alice.closed())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(close.code, 4008);

    tokio::time::sleep(QUIET).await;
    assert!(server.gateway.registry().is_empty().await);
    assert!(!server.gateway.presence().is_online(&"alice".into()).await.unwrap());
    assert_eq!(server.gateway.stats().await.idle_closures, 1);
}

#[tokio::test]
async fn test_shutdown_closes_with_1001() {
    let gateway = Gateway::in_memory(GatewayConfig::for_testing()).await.unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/ws", listener.local_addr().unwrap());
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let server = ChatServer::new(gateway.clone());
    let running = tokio::spawn(async move {
        server
            .run_until(listener, async {
                let _ = stop_rx.await;
            })
            .await
    });

    let session = gateway.sessions().unwrap().create("alice".into(), "test", None).await;
    let mut alice = ChatClient::connect(&url, &session.token).await.unwrap();

    stop_tx.send(()).unwrap();
    running.await.unwrap().unwrap();
    let close = tokio::time::timeout(WAIT, alice.closed()).await.unwrap().unwrap();
    assert_eq!(close.code, 1001);
}
