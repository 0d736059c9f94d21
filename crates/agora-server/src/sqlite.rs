//! SQLite persistence gateway.

use agora_core::{format_timestamp, ChatMessage, ChatStore, RecentChat, StoreError};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tracing::info;

use crate::config::DatabaseConfig;

const SCHEMA: &str = include_str!("schema.sql");

fn db_error(e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::RowNotFound => StoreError::NotFound,
        other => StoreError::Database(other.to_string()),
    }
}

/// [`ChatStore`] backed by a SQLite pool.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open the configured database and bootstrap the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the schema fails
    /// to apply.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .map_err(db_error)?;
        info!(url = %config.url, "Database opened");
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool and bootstrap the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema fails to apply.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .map_err(db_error)?;
        Ok(Self { pool })
    }

    /// Register a user and return its id.
    ///
    /// # Errors
    ///
    /// Returns an error if the username is taken.
    pub async fn create_user(&self, username: &str, email: &str) -> Result<i64, StoreError> {
        let result = sqlx::query("INSERT INTO users (username, email) VALUES (?, ?)")
            .bind(username)
            .bind(email)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(result.last_insert_rowid())
    }

    /// Open a session for `user_id` valid for `ttl_ms` milliseconds.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn create_session(
        &self,
        token: &str,
        user_id: i64,
        ttl_ms: i64,
    ) -> Result<(), StoreError> {
        sqlx::query("INSERT OR REPLACE INTO sessions (token, user_id, expires_at) VALUES (?, ?, ?)")
            .bind(token)
            .bind(user_id)
            .bind(Utc::now().timestamp_millis() + ttl_ms)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }
}

#[async_trait]
impl ChatStore for SqliteStore {
    async fn save_message(
        &self,
        sender_id: i64,
        receiver_id: i64,
        message: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO chat_messages (sender_id, receiver_id, message, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(sender_id)
        .bind(receiver_id)
        .bind(message)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn fetch_messages(
        &self,
        user_a: i64,
        user_b: i64,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let rows: Vec<(i64, i64, i64, String, i64, bool, String)> = sqlx::query_as(
            "SELECT cm.id, cm.sender_id, cm.receiver_id, cm.message, cm.created_at, cm.is_read, u.username
             FROM chat_messages cm
             JOIN users u ON cm.sender_id = u.id
             WHERE (cm.sender_id = ? AND cm.receiver_id = ?)
                OR (cm.sender_id = ? AND cm.receiver_id = ?)
             ORDER BY cm.created_at DESC, cm.id DESC
             LIMIT ? OFFSET ?",
        )
        .bind(user_a)
        .bind(user_b)
        .bind(user_b)
        .bind(user_a)
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(rows
            .into_iter()
            .rev()
            .map(
                |(id, sender_id, receiver_id, message, created_at, is_read, sender_name)| {
                    ChatMessage {
                        id,
                        sender_id,
                        receiver_id,
                        message,
                        created_at: format_timestamp(created_at),
                        is_read,
                        sender_name,
                    }
                },
            )
            .collect())
    }

    async fn mark_read(&self, sender_id: i64, receiver_id: i64) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE chat_messages SET is_read = 1 WHERE sender_id = ? AND receiver_id = ? AND is_read = 0",
        )
        .bind(sender_id)
        .bind(receiver_id)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn resolve_user_id(&self, username: &str) -> Result<i64, StoreError> {
        let (id,): (i64,) = sqlx::query_as("SELECT id FROM users WHERE username = ?")
            .bind(username)
            .fetch_one(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(id)
    }

    async fn resolve_username(&self, user_id: i64) -> Result<String, StoreError> {
        let (username,): (String,) = sqlx::query_as("SELECT username FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(username)
    }

    async fn set_online(&self, user_id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE users SET online = 1 WHERE id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn set_offline(&self, user_id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE users SET online = 0 WHERE id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn list_online_usernames(&self) -> Result<Vec<String>, StoreError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT username FROM users WHERE online = 1 ORDER BY username")
                .fetch_all(&self.pool)
                .await
                .map_err(db_error)?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    async fn reset_all_offline(&self) -> Result<(), StoreError> {
        sqlx::query("UPDATE users SET online = 0 WHERE online = 1")
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn unread_count(&self, user_id: i64) -> Result<i64, StoreError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM chat_messages WHERE receiver_id = ? AND is_read = 0",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(count)
    }

    async fn recent_chats(&self, user_id: i64, limit: u32) -> Result<Vec<RecentChat>, StoreError> {
        let rows: Vec<(i64, String, i64, i64)> = sqlx::query_as(
            "SELECT u.id, u.username, MAX(cm.created_at) AS last_message_time,
                    SUM(CASE WHEN cm.receiver_id = ? AND cm.is_read = 0 AND cm.sender_id = u.id
                             THEN 1 ELSE 0 END) AS unread_count
             FROM chat_messages cm
             JOIN users u
               ON (u.id = cm.sender_id AND cm.receiver_id = ?)
               OR (u.id = cm.receiver_id AND cm.sender_id = ?)
             WHERE cm.sender_id = ? OR cm.receiver_id = ?
             GROUP BY u.id, u.username
             ORDER BY last_message_time DESC
             LIMIT ?",
        )
        .bind(user_id)
        .bind(user_id)
        .bind(user_id)
        .bind(user_id)
        .bind(user_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(rows
            .into_iter()
            .map(|(id, username, last, unread)| RecentChat {
                user_id: id,
                username,
                last_message_time: format_timestamp(last),
                unread_count: unread,
            })
            .collect())
    }

    async fn resolve_session(&self, token: &str) -> Result<Option<i64>, StoreError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT user_id FROM sessions WHERE token = ? AND expires_at > ?")
                .bind(token)
                .bind(Utc::now().timestamp_millis())
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error)?;
        Ok(row.map(|(id,)| id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SqliteStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        SqliteStore::from_pool(pool).await.unwrap()
    }

    #[tokio::test]
    async fn test_messages_roundtrip_in_chronological_order() {
        let store = store().await;
        let alice = store.create_user("alice", "alice@example.com").await.unwrap();
        let bob = store.create_user("bob", "bob@example.com").await.unwrap();

        store.save_message(alice, bob, "first").await.unwrap();
        store.save_message(bob, alice, "second").await.unwrap();
        store.save_message(alice, bob, "third").await.unwrap();

        let all = store.fetch_messages(bob, alice, 50, 0).await.unwrap();
        let bodies: Vec<_> = all.iter().map(|m| m.message.as_str()).collect();
        assert_eq!(bodies, ["first", "second", "third"]);
        assert_eq!(all[1].sender_name, "bob");
        assert!(all[0].created_at.ends_with('Z'));

        let latest = store.fetch_messages(alice, bob, 1, 0).await.unwrap();
        assert_eq!(latest[0].message, "third");

        assert_eq!(store.unread_count(bob).await.unwrap(), 2);
        store.mark_read(alice, bob).await.unwrap();
        assert_eq!(store.unread_count(bob).await.unwrap(), 0);
        assert_eq!(store.unread_count(alice).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_presence_flags() {
        let store = store().await;
        let alice = store.create_user("alice", "").await.unwrap();
        let bob = store.create_user("bob", "").await.unwrap();

        store.set_online(alice).await.unwrap();
        store.set_online(bob).await.unwrap();
        store.set_offline(bob).await.unwrap();
        assert_eq!(store.list_online_usernames().await.unwrap(), ["alice"]);

        store.reset_all_offline().await.unwrap();
        assert!(store.list_online_usernames().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_user_and_session_resolution() {
        let store = store().await;
        let alice = store.create_user("alice", "").await.unwrap();
        assert!(store.create_user("alice", "").await.is_err());

        assert_eq!(store.resolve_user_id("alice").await.unwrap(), alice);
        assert_eq!(store.resolve_username(alice).await.unwrap(), "alice");
        assert!(matches!(
            store.resolve_user_id("ghost").await,
            Err(StoreError::NotFound)
        ));

        store.create_session("live", alice, 60_000).await.unwrap();
        store.create_session("stale", alice, -1).await.unwrap();
        assert_eq!(store.resolve_session("live").await.unwrap(), Some(alice));
        assert_eq!(store.resolve_session("stale").await.unwrap(), None);
        assert_eq!(store.resolve_session("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_recent_chats() {
        let store = store().await;
        let alice = store.create_user("alice", "").await.unwrap();
        let bob = store.create_user("bob", "").await.unwrap();
        let carol = store.create_user("carol", "").await.unwrap();

        store.save_message(bob, alice, "hi").await.unwrap();
        store.save_message(bob, alice, "you there?").await.unwrap();
        store.save_message(alice, carol, "lunch?").await.unwrap();

        let chats = store.recent_chats(alice, 20).await.unwrap();
        assert_eq!(chats.len(), 2);
        let from_bob = chats.iter().find(|c| c.user_id == bob).unwrap();
        assert_eq!(from_bob.unread_count, 2);
        let with_carol = chats.iter().find(|c| c.user_id == carol).unwrap();
        assert_eq!(with_carol.unread_count, 0);
    }
}
