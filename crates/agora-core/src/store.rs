//! Persistence gateway consumed by the hub.
//!
//! The hub never talks to a database directly. Everything durable (chat
//! history, online flags, session lookup) goes through [`ChatStore`], so the
//! room actors can be exercised against [`MemoryStore`] in tests while the
//! server plugs in its SQL implementation.

use async_trait::async_trait;
use chrono::{SecondsFormat, TimeZone, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::Mutex;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested user, session or message does not exist.
    #[error("Not found")]
    NotFound,

    /// The backing store failed.
    #[error("Database error: {0}")]
    Database(String),
}

/// A persisted chat message, as returned to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub id: i64,
    pub sender_id: i64,
    pub receiver_id: i64,
    pub message: String,
    /// RFC 3339, UTC, millisecond precision.
    pub created_at: String,
    pub is_read: bool,
    pub sender_name: String,
}

/// One conversation partner in a user's recent chat list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecentChat {
    pub user_id: i64,
    pub username: String,
    pub last_message_time: String,
    pub unread_count: i64,
}

/// Render a unix-millisecond timestamp the way chat payloads carry it.
///
/// ```
/// assert_eq!(
///     agora_core::store::format_timestamp(1_700_000_000_123),
///     "2023-11-14T22:13:20.123Z"
/// );
/// ```
#[must_use]
pub fn format_timestamp(millis: i64) -> String {
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_default()
}

/// Durable storage behind the chat hub.
///
/// Ids are the store's own user ids; an id `<= 0` never refers to a user.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Persist a message from `sender_id` to `receiver_id`, stamped with the
    /// store's clock.
    async fn save_message(
        &self,
        sender_id: i64,
        receiver_id: i64,
        message: &str,
    ) -> Result<(), StoreError>;

    /// Messages exchanged between two users in either direction.
    ///
    /// Pages are taken newest-first (`limit`, `offset`) and returned in
    /// chronological order.
    async fn fetch_messages(
        &self,
        user_a: i64,
        user_b: i64,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ChatMessage>, StoreError>;

    /// Mark every unread message from `sender_id` to `receiver_id` as read.
    async fn mark_read(&self, sender_id: i64, receiver_id: i64) -> Result<(), StoreError>;

    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for unknown usernames.
    async fn resolve_user_id(&self, username: &str) -> Result<i64, StoreError>;

    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for unknown ids.
    async fn resolve_username(&self, user_id: i64) -> Result<String, StoreError>;

    async fn set_online(&self, user_id: i64) -> Result<(), StoreError>;

    async fn set_offline(&self, user_id: i64) -> Result<(), StoreError>;

    async fn list_online_usernames(&self) -> Result<Vec<String>, StoreError>;

    /// Clear every persisted online flag. Run once at startup, before the
    /// presence registry is seeded.
    async fn reset_all_offline(&self) -> Result<(), StoreError>;

    /// Number of unread messages addressed to `user_id`.
    async fn unread_count(&self, user_id: i64) -> Result<i64, StoreError>;

    /// Conversation partners of `user_id`, most recent first.
    async fn recent_chats(&self, user_id: i64, limit: u32) -> Result<Vec<RecentChat>, StoreError>;

    /// Resolve a session token to its user id.
    async fn resolve_session(&self, token: &str) -> Result<Option<i64>, StoreError>;
}

#[derive(Debug)]
struct StoredUser {
    id: i64,
    username: String,
    online: bool,
}

#[derive(Debug)]
struct StoredMessage {
    id: i64,
    sender_id: i64,
    receiver_id: i64,
    message: String,
    created_at: i64,
    is_read: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    users: Vec<StoredUser>,
    messages: Vec<StoredMessage>,
    sessions: HashMap<String, i64>,
}

impl MemoryState {
    fn username(&self, id: i64) -> Option<&str> {
        self.users
            .iter()
            .find(|u| u.id == id)
            .map(|u| u.username.as_str())
    }

    fn user_mut(&mut self, id: i64) -> Result<&mut StoredUser, StoreError> {
        self.users
            .iter_mut()
            .find(|u| u.id == id)
            .ok_or(StoreError::NotFound)
    }
}

/// In-process [`ChatStore`] for tests and benchmarks.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user and return its id. Registering a name twice returns
    /// the existing id.
    pub async fn add_user(&self, username: &str) -> i64 {
        let mut state = self.state.lock().await;
        if let Some(user) = state.users.iter().find(|u| u.username == username) {
            return user.id;
        }
        let id = i64::try_from(state.users.len()).unwrap_or(i64::MAX - 1) + 1;
        state.users.push(StoredUser {
            id,
            username: username.to_string(),
            online: false,
        });
        id
    }

    /// Attach a session token to a user.
    pub async fn add_session(&self, token: &str, user_id: i64) {
        self.state
            .lock()
            .await
            .sessions
            .insert(token.to_string(), user_id);
    }

    /// Make every subsequent `save_message` fail.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent `fetch_messages` fail.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn save_message(
        &self,
        sender_id: i64,
        receiver_id: i64,
        message: &str,
    ) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Database("writes disabled".to_string()));
        }
        let mut state = self.state.lock().await;
        let id = i64::try_from(state.messages.len()).unwrap_or(i64::MAX - 1) + 1;
        state.messages.push(StoredMessage {
            id,
            sender_id,
            receiver_id,
            message: message.to_string(),
            created_at: Utc::now().timestamp_millis(),
            is_read: false,
        });
        Ok(())
    }

    async fn fetch_messages(
        &self,
        user_a: i64,
        user_b: i64,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Database("reads disabled".to_string()));
        }
        let state = self.state.lock().await;
        let mut pair: Vec<&StoredMessage> = state
            .messages
            .iter()
            .filter(|m| {
                (m.sender_id == user_a && m.receiver_id == user_b)
                    || (m.sender_id == user_b && m.receiver_id == user_a)
            })
            .collect();
        pair.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));

        let mut page: Vec<ChatMessage> = pair
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .filter_map(|m| {
                let sender_name = state.username(m.sender_id)?;
                Some(ChatMessage {
                    id: m.id,
                    sender_id: m.sender_id,
                    receiver_id: m.receiver_id,
                    message: m.message.clone(),
                    created_at: format_timestamp(m.created_at),
                    is_read: m.is_read,
                    sender_name: sender_name.to_string(),
                })
            })
            .collect();
        page.reverse();
        Ok(page)
    }

    async fn mark_read(&self, sender_id: i64, receiver_id: i64) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state
            .messages
            .iter_mut()
            .filter(|m| m.sender_id == sender_id && m.receiver_id == receiver_id)
            .for_each(|m| m.is_read = true);
        Ok(())
    }

    async fn resolve_user_id(&self, username: &str) -> Result<i64, StoreError> {
        let state = self.state.lock().await;
        state
            .users
            .iter()
            .find(|u| u.username == username)
            .map(|u| u.id)
            .ok_or(StoreError::NotFound)
    }

    async fn resolve_username(&self, user_id: i64) -> Result<String, StoreError> {
        let state = self.state.lock().await;
        state
            .username(user_id)
            .map(str::to_string)
            .ok_or(StoreError::NotFound)
    }

    async fn set_online(&self, user_id: i64) -> Result<(), StoreError> {
        self.state.lock().await.user_mut(user_id)?.online = true;
        Ok(())
    }

    async fn set_offline(&self, user_id: i64) -> Result<(), StoreError> {
        self.state.lock().await.user_mut(user_id)?.online = false;
        Ok(())
    }

    async fn list_online_usernames(&self) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .users
            .iter()
            .filter(|u| u.online)
            .map(|u| u.username.clone())
            .collect())
    }

    async fn reset_all_offline(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        for user in &mut state.users {
            user.online = false;
        }
        Ok(())
    }

    async fn unread_count(&self, user_id: i64) -> Result<i64, StoreError> {
        let state = self.state.lock().await;
        let count = state
            .messages
            .iter()
            .filter(|m| m.receiver_id == user_id && !m.is_read)
            .count();
        Ok(i64::try_from(count).unwrap_or(i64::MAX))
    }

    async fn recent_chats(&self, user_id: i64, limit: u32) -> Result<Vec<RecentChat>, StoreError> {
        let state = self.state.lock().await;

        // partner -> (last message millis, unread from partner)
        let mut partners: HashMap<i64, (i64, i64)> = HashMap::new();
        for m in &state.messages {
            let partner = if m.sender_id == user_id {
                m.receiver_id
            } else if m.receiver_id == user_id {
                m.sender_id
            } else {
                continue;
            };
            let entry = partners.entry(partner).or_insert((m.created_at, 0));
            entry.0 = entry.0.max(m.created_at);
            if m.receiver_id == user_id && m.sender_id == partner && !m.is_read {
                entry.1 += 1;
            }
        }

        let mut chats: Vec<(i64, RecentChat)> = partners
            .into_iter()
            .filter_map(|(partner, (last, unread))| {
                let username = state.username(partner)?.to_string();
                Some((
                    last,
                    RecentChat {
                        user_id: partner,
                        username,
                        last_message_time: format_timestamp(last),
                        unread_count: unread,
                    },
                ))
            })
            .collect();
        chats.sort_by(|a, b| b.0.cmp(&a.0));

        Ok(chats
            .into_iter()
            .take(limit as usize)
            .map(|(_, chat)| chat)
            .collect())
    }

    async fn resolve_session(&self, token: &str) -> Result<Option<i64>, StoreError> {
        Ok(self.state.lock().await.sessions.get(token).copied())
    }
}
