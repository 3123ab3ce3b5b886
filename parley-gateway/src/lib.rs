//! # parley-gateway: presence and delivery gateway for 1:1 chat
//!
//! Keeps long-lived WebSocket connections, tracks which users are reachable
//! across a fleet of gateway processes, and moves each message through
//! SENT → DELIVERED → READ with exactly one notification per transition.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────────────────────────┐
//! │ ChatClient  │ ◄────────────────► │ ChatServer ── Gateway            │
//! │ (per device)│     JSON frames    │                 │                │
//! └─────────────┘                    │   ConnectionRegistry (local)     │
//!                                    │   DeliveryTracker ── MessageStore│
//!                                    └────────┬───────────────┬─────────┘
//!                                             │               │
//!                                   ┌─────────▼─────┐ ┌───────▼───────┐
//!                                   │ PresenceStore │ │  FanoutBus    │
//!                                   │ (shared)      │ │  (pub/sub)    │
//!                                   └───────────────┘ └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON client frames and bincode bus envelopes
//! - [`presence`]: cluster-wide presence with leased connections
//! - [`registry`]: this process's connections and rooms
//! - [`fanout`]: cross-process event relay
//! - [`delivery`]: delivery status state machine
//! - [`storage`]: chats and messages
//! - [`gateway`]: connection lifecycle and inbound actions
//! - [`server`] / [`client`]: WebSocket endpoints
//!
//! ## Backends
//!
//! | Concern  | In-process              | Shared                          |
//! |----------|-------------------------|---------------------------------|
//! | Presence | `MemoryPresenceStore`   | `RedisPresenceStore` (`redis`)  |
//! | Fan-out  | `LocalBus`              | `RedisBus` (`redis`)            |
//! | Storage  | `MemoryMessageStore`    | `RocksMessageStore` (`rocksdb`) |

pub mod cache;
pub mod client;
pub mod config;
pub mod delivery;
pub mod error;
pub mod events;
pub mod fanout;
pub mod gateway;
pub mod model;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod retry;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use cache::{CacheStats, MessageCache};
pub use client::{ChatClient, ClientError, CloseInfo};
pub use config::{ConfigError, GatewayConfig};
pub use delivery::DeliveryTracker;
pub use error::{AuthError, BusError, ChatError, PresenceError, StoreError};
pub use events::{ChannelEventSink, ChatEvent, EventSink, LogEventSink};
pub use fanout::{BusHandler, FanoutBus, LocalBus, Publisher, Subscription, Topic};
pub use gateway::{Gateway, GatewayBuilder, GatewayError, GatewayStats, SweepReport};
pub use model::{Chat, ChatId, ConnectionId, DeliveryStatus, Message, MessageId, NewMessage, UserId};
pub use presence::{MemoryPresenceStore, PresenceConfig, PresenceRecord, PresenceStatus, PresenceStore};
pub use protocol::{ActionReply, ClientAction, CloseReason, Inbound, Reply, ServerEvent, ServerFrame};
pub use registry::{ConnectionRegistry, Outbound};
pub use retry::Backoff;
pub use server::{ChatServer, ServerError};
pub use session::{Authenticator, Session, SessionStore};
pub use storage::{MemoryMessageStore, MessageStore, StatusChange};

#[cfg(feature = "redis")]
pub use fanout::RedisBus;
#[cfg(feature = "redis")]
pub use presence::RedisPresenceStore;
#[cfg(feature = "rocksdb")]
pub use storage::{RocksConfig, RocksMessageStore};
