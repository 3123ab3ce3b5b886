//! RocksDB-backed message store.
//!
//! Column families:
//! - `chats`         : chat id → bincode `Chat`
//! - `messages`      : message uuid (16 bytes) → bincode `StoredMessage`
//! - `chat_messages` : `<chat id><0x00><seq:8 BE>` → message uuid
//! - `undelivered`   : `<recipient><0x00><seq:8 BE>` → message uuid, only while `SENT`
//! - `meta`          : `next_seq` → u64 BE
//!
//! Every write that touches more than one family goes through one
//! `WriteBatch`, so indexes never disagree with the message they point at.
//! Status compare-and-set is serialized per message through a small set of
//! striped locks.

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

use super::{validate_chat, MessageStore, StatusChange, StoreResult};
use crate::error::StoreError;
use crate::model::{now_millis, Chat, ChatId, DeliveryStatus, Message, MessageId, NewMessage, UserId};

const CF_CHATS: &str = "chats";
const CF_MESSAGES: &str = "messages";
const CF_CHAT_MESSAGES: &str = "chat_messages";
const CF_UNDELIVERED: &str = "undelivered";
const CF_META: &str = "meta";

const COLUMN_FAMILIES: &[&str] = &[CF_CHATS, CF_MESSAGES, CF_CHAT_MESSAGES, CF_UNDELIVERED, CF_META];

const NEXT_SEQ_KEY: &[u8] = b"next_seq";
const LOCK_STRIPES: usize = 32;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct RocksConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
}

impl Default for RocksConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("parley_data"),
            block_cache_size: 64 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 512,
        }
    }
}

impl RocksConfig {
    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredMessage {
    seq: u64,
    message: Message,
}

fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> StoreResult<T> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(value)
}

fn db_error(e: rocksdb::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// `<prefix><0x00>`, the start of every index key for one owner.
fn index_prefix(owner: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(owner.len() + 9);
    key.extend_from_slice(owner.as_bytes());
    key.push(0);
    key
}

fn index_key(owner: &str, seq: u64) -> Vec<u8> {
    let mut key = index_prefix(owner);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn message_id_from(bytes: &[u8]) -> StoreResult<MessageId> {
    let raw: [u8; 16] = bytes
        .try_into()
        .map_err(|_| StoreError::Serialization("invalid message id in index".into()))?;
    Ok(MessageId::from_uuid(Uuid::from_bytes(raw)))
}

/// RocksDB-backed [`MessageStore`].
pub struct RocksMessageStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: RocksConfig,
    next_seq: AtomicU64,
    /// Serializes appends so `next_seq` is persisted in order.
    append_lock: Mutex<()>,
    status_locks: Vec<Mutex<()>>,
}

impl RocksMessageStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: RocksConfig) -> StoreResult<Self> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cache = Cache::new_lru_cache(config.block_cache_size);
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| {
                let mut opts = Options::default();
                let mut block_opts = BlockBasedOptions::default();
                block_opts.set_block_cache(&cache);
                block_opts.set_bloom_filter(10.0, false);
                opts.set_block_based_table_factory(&block_opts);
                ColumnFamilyDescriptor::new(*name, opts)
            })
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(&db_opts, &config.path, cf_descriptors)
            .map_err(db_error)?;

        let next_seq = {
            let cf = db
                .cf_handle(CF_META)
                .ok_or_else(|| StoreError::Backend(format!("Column family '{CF_META}' not found")))?;
            match db.get_cf(&cf, NEXT_SEQ_KEY).map_err(db_error)? {
                Some(bytes) if bytes.len() == 8 => {
                    let mut buf = [0u8; 8];
                    buf.copy_from_slice(&bytes);
                    u64::from_be_bytes(buf)
                }
                _ => 0,
            }
        };
        log::info!("Message store opened at {} (next seq {next_seq})", config.path.display());

        Ok(Self {
            db,
            config,
            next_seq: AtomicU64::new(next_seq),
            append_lock: Mutex::new(()),
            status_locks: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> StoreResult<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Backend(format!("Column family '{name}' not found")))
    }

    fn write(&self, batch: WriteBatch) -> StoreResult<()> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts).map_err(db_error)
    }

    fn status_lock(&self, id: MessageId) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        &self.status_locks[(hasher.finish() as usize) % self.status_locks.len()]
    }

    fn load_stored(&self, id: MessageId) -> StoreResult<Option<StoredMessage>> {
        let cf = self.cf(CF_MESSAGES)?;
        match self.db.get_cf(&cf, id.as_uuid().as_bytes()).map_err(db_error)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Message ids under one index prefix, in key order or reversed.
    fn scan_index(&self, cf_name: &str, owner: &str, reverse: bool, limit: usize) -> StoreResult<Vec<MessageId>> {
        let cf = self.cf(cf_name)?;
        let prefix = index_prefix(owner);
        let upper = index_key(owner, u64::MAX);
        let mode = if reverse {
            IteratorMode::From(&upper, Direction::Reverse)
        } else {
            IteratorMode::From(&prefix, Direction::Forward)
        };
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(&cf, mode) {
            let (key, value) = item.map_err(db_error)?;
            if !key.starts_with(&prefix) || key.len() != prefix.len() + 8 {
                break;
            }
            ids.push(message_id_from(&value)?);
            if ids.len() >= limit {
                break;
            }
        }
        Ok(ids)
    }

    fn load_messages(&self, ids: Vec<MessageId>) -> StoreResult<Vec<StoredMessage>> {
        let mut messages = Vec::with_capacity(ids.len());
        for id in ids {
            match self.load_stored(id)? {
                Some(stored) => messages.push(stored),
                None => log::warn!("Message store: index points at missing message {id}"),
            }
        }
        Ok(messages)
    }
}

#[async_trait]
impl MessageStore for RocksMessageStore {
    async fn create_chat(&self, chat: Chat) -> StoreResult<Chat> {
        validate_chat(&chat)?;
        let cf = self.cf(CF_CHATS)?;
        let _guard = self.append_lock.lock().map_err(|_| StoreError::Backend("lock poisoned".into()))?;
        if self.db.get_cf(&cf, chat.id.as_str().as_bytes()).map_err(db_error)?.is_some() {
            return Err(StoreError::Conflict(format!("chat {} already exists", chat.id)));
        }
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, chat.id.as_str().as_bytes(), encode(&chat)?);
        self.write(batch)?;
        Ok(chat)
    }

    async fn get_chat(&self, id: &ChatId) -> StoreResult<Option<Chat>> {
        let cf = self.cf(CF_CHATS)?;
        match self.db.get_cf(&cf, id.as_str().as_bytes()).map_err(db_error)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn append_message(&self, new: NewMessage) -> StoreResult<Message> {
        if self.get_chat(&new.chat_id).await?.is_none() {
            return Err(StoreError::NotFound(format!("chat {}", new.chat_id)));
        }
        let cf_messages = self.cf(CF_MESSAGES)?;
        let cf_chat_messages = self.cf(CF_CHAT_MESSAGES)?;
        let cf_undelivered = self.cf(CF_UNDELIVERED)?;
        let cf_meta = self.cf(CF_META)?;

        let message = Message {
            id: MessageId::new(),
            chat_id: new.chat_id,
            sender_id: new.sender_id,
            recipient_id: new.recipient_id,
            content: new.content,
            status: new.status,
            created_at: now_millis(),
        };
        let id_bytes = message.id.as_uuid().into_bytes();

        let _guard = self.append_lock.lock().map_err(|_| StoreError::Backend("lock poisoned".into()))?;
        let seq = self.next_seq.load(Ordering::SeqCst);
        let stored = StoredMessage {
            seq,
            message: message.clone(),
        };

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_messages, id_bytes, encode(&stored)?);
        batch.put_cf(&cf_chat_messages, index_key(message.chat_id.as_str(), seq), id_bytes);
        if message.status == DeliveryStatus::Sent {
            batch.put_cf(&cf_undelivered, index_key(message.recipient_id.as_str(), seq), id_bytes);
        }
        batch.put_cf(&cf_meta, NEXT_SEQ_KEY, (seq + 1).to_be_bytes());
        self.write(batch)?;
        self.next_seq.store(seq + 1, Ordering::SeqCst);

        Ok(message)
    }

    async fn get_message(&self, id: MessageId) -> StoreResult<Option<Message>> {
        Ok(self.load_stored(id)?.map(|s| s.message))
    }

    async fn list_undelivered(&self, recipient: &UserId, chat: Option<&ChatId>) -> StoreResult<Vec<Message>> {
        let ids = self.scan_index(CF_UNDELIVERED, recipient.as_str(), false, usize::MAX)?;
        Ok(self
            .load_messages(ids)?
            .into_iter()
            .map(|s| s.message)
            .filter(|m| m.status == DeliveryStatus::Sent)
            .filter(|m| chat.is_none_or(|c| &m.chat_id == c))
            .collect())
    }

    async fn update_status(&self, id: MessageId, target: DeliveryStatus) -> StoreResult<StatusChange> {
        let _guard = self
            .status_lock(id)
            .lock()
            .map_err(|_| StoreError::Backend("lock poisoned".into()))?;

        let Some(mut stored) = self.load_stored(id)? else {
            return Err(StoreError::NotFound(format!("message {id}")));
        };
        let previous = stored.message.status;
        if !previous.can_advance_to(target) {
            return Ok(StatusChange::Unchanged {
                message: stored.message,
            });
        }
        stored.message.status = target;

        let mut batch = WriteBatch::default();
        batch.put_cf(&self.cf(CF_MESSAGES)?, id.as_uuid().as_bytes(), encode(&stored)?);
        if previous == DeliveryStatus::Sent {
            batch.delete_cf(
                &self.cf(CF_UNDELIVERED)?,
                index_key(stored.message.recipient_id.as_str(), stored.seq),
            );
        }
        self.write(batch)?;

        Ok(StatusChange::Advanced {
            previous,
            message: stored.message,
        })
    }

    async fn list_messages(&self, chat: &ChatId, limit: usize) -> StoreResult<Vec<Message>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let ids = self.scan_index(CF_CHAT_MESSAGES, chat.as_str(), true, limit)?;
        Ok(self.load_messages(ids)?.into_iter().map(|s| s.message).collect())
    }
}
