//! Collaborator interfaces for the durable layers.
//!
//! The core consumes these through narrow contracts; the backing
//! implementations (document store, Redis, ...) live outside the core.
//! Lookup misses are `Ok(None)` results callers must check explicitly -
//! never panics. In-memory implementations back tests and single-node
//! deployments.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use courier_protocol::{MessagePayload, UserSummary};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Store errors. A miss is not an error; this is for backend failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend unavailable: {0}")]
    Unavailable(String),
}

/// A user as the directory knows it.
#[derive(Debug, Clone, PartialEq)]
pub struct UserRecord {
    pub id: String,
    pub username: String,
    pub online: bool,
}

impl UserRecord {
    /// Roster view of this record.
    #[must_use]
    pub fn summary(&self) -> UserSummary {
        UserSummary {
            username: self.username.clone(),
            user_id: self.id.clone(),
            online: self.online,
        }
    }
}

/// User lookups and the authoritative presence flag.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn lookup_user(&self, user_id: &str) -> Result<Option<UserRecord>, StoreError>;

    async fn lookup_user_by_name(&self, username: &str)
        -> Result<Option<UserRecord>, StoreError>;

    async fn set_online_status(&self, user_id: &str, online: bool) -> Result<(), StoreError>;

    /// Everyone currently marked online, except `except_user_id`.
    async fn list_online_users(&self, except_user_id: &str)
        -> Result<Vec<UserRecord>, StoreError>;
}

/// Durable message history.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message, returning its assigned id.
    async fn persist_message(&self, message: &MessagePayload) -> Result<String, StoreError>;
}

/// Durable per-recipient queue for messages sent while offline.
#[async_trait]
pub trait OfflineQueue: Send + Sync {
    /// Append one message to the recipient's queue.
    async fn append(&self, user_id: &str, message: &MessagePayload) -> Result<(), StoreError>;

    /// Take the whole queue in FIFO order, clearing it.
    async fn flush(&self, user_id: &str) -> Result<Vec<MessagePayload>, StoreError>;
}

/// TTL'd tracking state for signaling rooms. Entries expire after an
/// inactivity window independent of explicit deletion; participant
/// updates refresh the window.
#[async_trait]
pub trait RoomStore: Send + Sync {
    async fn persist_room_metadata(&self, room_id: &str, creator_id: &str)
        -> Result<(), StoreError>;

    async fn delete_room_metadata(&self, room_id: &str) -> Result<(), StoreError>;

    async fn add_participant(&self, room_id: &str, user_id: &str) -> Result<(), StoreError>;

    async fn remove_participant(&self, room_id: &str, user_id: &str) -> Result<(), StoreError>;

    async fn list_room_participants(&self, room_id: &str) -> Result<Vec<String>, StoreError>;
}

// ---------------------------------------------------------------------
// In-memory implementations
// ---------------------------------------------------------------------

/// In-memory user directory.
#[derive(Default)]
pub struct MemoryDirectory {
    users: DashMap<String, UserRecord>,
}

impl MemoryDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a user (normally done by the account layer).
    pub fn insert_user(&self, user: UserRecord) {
        self.users.insert(user.id.clone(), user);
    }
}

#[async_trait]
impl UserDirectory for MemoryDirectory {
    async fn lookup_user(&self, user_id: &str) -> Result<Option<UserRecord>, StoreError> {
        Ok(self.users.get(user_id).map(|r| r.value().clone()))
    }

    async fn lookup_user_by_name(
        &self,
        username: &str,
    ) -> Result<Option<UserRecord>, StoreError> {
        Ok(self
            .users
            .iter()
            .find(|r| r.value().username == username)
            .map(|r| r.value().clone()))
    }

    async fn set_online_status(&self, user_id: &str, online: bool) -> Result<(), StoreError> {
        if let Some(mut user) = self.users.get_mut(user_id) {
            user.online = online;
        }
        Ok(())
    }

    async fn list_online_users(
        &self,
        except_user_id: &str,
    ) -> Result<Vec<UserRecord>, StoreError> {
        Ok(self
            .users
            .iter()
            .filter(|r| r.value().online && r.key() != except_user_id)
            .map(|r| r.value().clone())
            .collect())
    }
}

/// In-memory message history.
#[derive(Default)]
pub struct MemoryMessageStore {
    messages: Mutex<Vec<(String, MessagePayload)>>,
    seq: AtomicU64,
}

impl MemoryMessageStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn persist_message(&self, message: &MessagePayload) -> Result<String, StoreError> {
        let id = format!("msg_{}", self.seq.fetch_add(1, Ordering::Relaxed));
        self.messages.lock().unwrap().push((id.clone(), message.clone()));
        Ok(id)
    }
}

/// In-memory offline queues.
#[derive(Default)]
pub struct MemoryOfflineQueue {
    queues: DashMap<String, Vec<MessagePayload>>,
}

impl MemoryOfflineQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn queued_count(&self, user_id: &str) -> usize {
        self.queues.get(user_id).map(|q| q.len()).unwrap_or(0)
    }
}

#[async_trait]
impl OfflineQueue for MemoryOfflineQueue {
    async fn append(&self, user_id: &str, message: &MessagePayload) -> Result<(), StoreError> {
        self.queues
            .entry(user_id.to_string())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn flush(&self, user_id: &str) -> Result<Vec<MessagePayload>, StoreError> {
        Ok(self
            .queues
            .remove(user_id)
            .map(|(_, queue)| queue)
            .unwrap_or_default())
    }
}

struct RoomEntry {
    creator: Option<String>,
    participants: Vec<String>,
    expires_at: Instant,
}

/// In-memory room tracking with TTL semantics matching the external
/// store: participant updates refresh the window, expired entries read
/// as absent.
pub struct MemoryRoomStore {
    rooms: DashMap<String, RoomEntry>,
    ttl: Duration,
}

impl MemoryRoomStore {
    /// Default inactivity window (4 hours).
    pub const DEFAULT_TTL: Duration = Duration::from_secs(4 * 60 * 60);

    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            rooms: DashMap::new(),
            ttl,
        }
    }

    fn fresh_entry(&self) -> RoomEntry {
        RoomEntry {
            creator: None,
            participants: Vec::new(),
            expires_at: Instant::now() + self.ttl,
        }
    }
}

impl Default for MemoryRoomStore {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TTL)
    }
}

#[async_trait]
impl RoomStore for MemoryRoomStore {
    async fn persist_room_metadata(
        &self,
        room_id: &str,
        creator_id: &str,
    ) -> Result<(), StoreError> {
        let mut entry = self
            .rooms
            .entry(room_id.to_string())
            .or_insert_with(|| self.fresh_entry());
        entry.creator = Some(creator_id.to_string());
        entry.expires_at = Instant::now() + self.ttl;
        Ok(())
    }

    async fn delete_room_metadata(&self, room_id: &str) -> Result<(), StoreError> {
        self.rooms.remove(room_id);
        Ok(())
    }

    async fn add_participant(&self, room_id: &str, user_id: &str) -> Result<(), StoreError> {
        let mut entry = self
            .rooms
            .entry(room_id.to_string())
            .or_insert_with(|| self.fresh_entry());
        if !entry.participants.iter().any(|p| p == user_id) {
            entry.participants.push(user_id.to_string());
        }
        entry.expires_at = Instant::now() + self.ttl;
        Ok(())
    }

    async fn remove_participant(&self, room_id: &str, user_id: &str) -> Result<(), StoreError> {
        if let Some(mut entry) = self.rooms.get_mut(room_id) {
            entry.participants.retain(|p| p != user_id);
        }
        Ok(())
    }

    async fn list_room_participants(&self, room_id: &str) -> Result<Vec<String>, StoreError> {
        let expired = self
            .rooms
            .get(room_id)
            .map(|entry| entry.expires_at <= Instant::now());
        match expired {
            Some(false) => Ok(self
                .rooms
                .get(room_id)
                .map(|entry| entry.participants.clone())
                .unwrap_or_default()),
            Some(true) => {
                self.rooms.remove(room_id);
                Ok(Vec::new())
            }
            None => Ok(Vec::new()),
        }
    }
}
