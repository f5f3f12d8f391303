use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{fs, path::Path, str::FromStr};

use shared::{
    domain::{GroupId, MessageId, MessageKind, MessageStatus, UserId, UserIdentity},
    protocol::{Reaction, ReplySnapshot},
};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

/// A message row as persisted. Soft-deleted rows keep their content and
/// file columns at this layer; read paths are responsible for hiding
/// them from clients.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub recipient_id: Option<UserId>,
    pub group_id: Option<GroupId>,
    pub content: String,
    pub kind: MessageKind,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
    pub file_url: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<i64>,
    pub file_type: Option<String>,
    pub waveform: Option<Vec<f32>>,
    pub duration: Option<f64>,
    pub reply_to: Option<ReplySnapshot>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Everything needed to create a fresh durable message row.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender_id: UserId,
    pub recipient_id: Option<UserId>,
    pub group_id: Option<GroupId>,
    pub content: String,
    pub kind: MessageKind,
    pub status: MessageStatus,
    pub file_url: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<i64>,
    pub file_type: Option<String>,
    pub waveform: Option<Vec<f32>>,
    pub duration: Option<f64>,
    pub reply_to: Option<ReplySnapshot>,
}

impl NewMessage {
    pub fn direct_text(sender_id: UserId, recipient_id: UserId, content: impl Into<String>) -> Self {
        Self {
            sender_id,
            recipient_id: Some(recipient_id),
            group_id: None,
            content: content.into(),
            kind: MessageKind::Text,
            status: MessageStatus::Sent,
            file_url: None,
            file_name: None,
            file_size: None,
            file_type: None,
            waveform: None,
            duration: None,
            reply_to: None,
        }
    }
}

fn status_to_str(status: MessageStatus) -> &'static str {
    match status {
        MessageStatus::Queued => "queued",
        MessageStatus::Sending => "sending",
        MessageStatus::Sent => "sent",
        MessageStatus::Delivered => "delivered",
        MessageStatus::Read => "read",
        MessageStatus::Failed => "failed",
    }
}

fn status_from_str(raw: &str) -> MessageStatus {
    match raw {
        "queued" => MessageStatus::Queued,
        "sending" => MessageStatus::Sending,
        "delivered" => MessageStatus::Delivered,
        "read" => MessageStatus::Read,
        "failed" => MessageStatus::Failed,
        _ => MessageStatus::Sent,
    }
}

fn kind_to_str(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::Text => "text",
        MessageKind::Image => "image",
        MessageKind::File => "file",
        MessageKind::Audio => "audio",
    }
}

fn kind_from_str(raw: &str) -> MessageKind {
    match raw {
        "image" => MessageKind::Image,
        "file" => MessageKind::File,
        "audio" => MessageKind::Audio,
        _ => MessageKind::Text,
    }
}

fn row_to_message(row: &SqliteRow) -> Result<StoredMessage> {
    let waveform = row
        .try_get::<Option<String>, _>("waveform")?
        .map(|raw| serde_json::from_str::<Vec<f32>>(&raw))
        .transpose()
        .context("invalid waveform json in messages row")?;
    let reply_to = row
        .try_get::<Option<String>, _>("reply_to")?
        .map(|raw| serde_json::from_str::<ReplySnapshot>(&raw))
        .transpose()
        .context("invalid reply_to json in messages row")?;

    Ok(StoredMessage {
        message_id: MessageId(row.try_get("id")?),
        sender_id: UserId(row.try_get("sender_user_id")?),
        recipient_id: row
            .try_get::<Option<i64>, _>("recipient_user_id")?
            .map(UserId),
        group_id: row.try_get::<Option<i64>, _>("group_id")?.map(GroupId),
        content: row.try_get("content")?,
        kind: kind_from_str(&row.try_get::<String, _>("kind")?),
        status: status_from_str(&row.try_get::<String, _>("status")?),
        created_at: row.try_get("created_at")?,
        read_at: row.try_get("read_at")?,
        file_url: row.try_get("file_url")?,
        file_name: row.try_get("file_name")?,
        file_size: row.try_get("file_size")?,
        file_type: row.try_get("file_type")?,
        waveform,
        duration: row.try_get("duration")?,
        reply_to,
        deleted_at: row.try_get("deleted_at")?,
    })
}

const MESSAGE_COLUMNS: &str = "id, sender_user_id, recipient_user_id, group_id, content, kind, \
     status, created_at, read_at, file_url, file_name, file_size, file_type, waveform, duration, \
     reply_to, deleted_at";

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_user(&self, username: &str, display_name: &str) -> Result<UserId> {
        let rec = sqlx::query(
            "INSERT INTO users (username, display_name) VALUES (?, ?)
             ON CONFLICT(username) DO UPDATE SET display_name=excluded.display_name
             RETURNING id",
        )
        .bind(username)
        .bind(display_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn identity_for_user(&self, user_id: UserId) -> Result<Option<UserIdentity>> {
        let row = sqlx::query(
            "SELECT id, username, display_name, profile_image FROM users WHERE id = ?",
        )
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| UserIdentity {
            id: UserId(r.get::<i64, _>(0)),
            username: r.get::<String, _>(1),
            display_name: r.get::<String, _>(2),
            profile_image: r.get::<Option<String>, _>(3),
        }))
    }

    pub async fn create_group(&self, name: &str, owner_user_id: UserId) -> Result<GroupId> {
        let rec =
            sqlx::query("INSERT INTO groups (name, owner_user_id) VALUES (?, ?) RETURNING id")
                .bind(name)
                .bind(owner_user_id.0)
                .fetch_one(&self.pool)
                .await?;
        let group_id = GroupId(rec.get::<i64, _>(0));
        self.add_group_member(group_id, owner_user_id).await?;
        Ok(group_id)
    }

    pub async fn add_group_member(&self, group_id: GroupId, user_id: UserId) -> Result<()> {
        sqlx::query(
            "INSERT INTO group_members (group_id, user_id) VALUES (?, ?)
             ON CONFLICT(group_id, user_id) DO NOTHING",
        )
        .bind(group_id.0)
        .bind(user_id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn is_group_member(&self, group_id: GroupId, user_id: UserId) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 FROM group_members WHERE group_id = ? AND user_id = ? LIMIT 1",
        )
        .bind(group_id.0)
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    pub async fn create_message(&self, new: &NewMessage) -> Result<StoredMessage> {
        let waveform_json = new
            .waveform
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let reply_json = new
            .reply_to
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let row = sqlx::query(&format!(
            "INSERT INTO messages (sender_user_id, recipient_user_id, group_id, content, kind, \
             status, created_at, file_url, file_name, file_size, file_type, waveform, duration, \
             reply_to) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(new.sender_id.0)
        .bind(new.recipient_id.map(|u| u.0))
        .bind(new.group_id.map(|g| g.0))
        .bind(&new.content)
        .bind(kind_to_str(new.kind))
        .bind(status_to_str(new.status))
        .bind(Utc::now())
        .bind(&new.file_url)
        .bind(&new.file_name)
        .bind(new.file_size)
        .bind(&new.file_type)
        .bind(waveform_json)
        .bind(new.duration)
        .bind(reply_json)
        .fetch_one(&self.pool)
        .await?;

        row_to_message(&row)
    }

    pub async fn find_message(&self, message_id: MessageId) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"
        ))
        .bind(message_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_message).transpose()
    }

    /// Advance a message's status. Returns the updated row when the
    /// transition is legal; `None` when it would move the status
    /// backward (the idempotent no-op case) or the row does not exist.
    pub async fn advance_message_status(
        &self,
        message_id: MessageId,
        status: MessageStatus,
        read_at: Option<DateTime<Utc>>,
    ) -> Result<Option<StoredMessage>> {
        let Some(current) = self.find_message(message_id).await? else {
            return Ok(None);
        };
        if !current.status.can_advance_to(status) {
            return Ok(None);
        }

        let row = sqlx::query(&format!(
            "UPDATE messages SET status = ?, read_at = COALESCE(?, read_at)
             WHERE id = ? RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(status_to_str(status))
        .bind(read_at)
        .bind(message_id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(Some(row_to_message(&row)?))
    }

    /// Newest-first page of the direct conversation between two users.
    /// The cursor is a message id; it is resolved to a stored row first
    /// so an unknown cursor fails loudly. Row ids are assigned in
    /// insert order, which is also `created_at` order, so pagination
    /// filters on the id.
    pub async fn list_messages_between(
        &self,
        user_id: UserId,
        peer_id: UserId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<StoredMessage>> {
        let cursor = match before {
            Some(cursor_id) => {
                if self.find_message(cursor_id).await?.is_none() {
                    return Err(anyhow!("cursor message {} not found", cursor_id.0));
                }
                Some(cursor_id.0)
            }
            None => None,
        };

        let rows = if let Some(cursor_id) = cursor {
            sqlx::query(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE ((sender_user_id = ? AND recipient_user_id = ?)
                     OR (sender_user_id = ? AND recipient_user_id = ?))
                   AND id < ?
                 ORDER BY id DESC
                 LIMIT ?"
            ))
            .bind(user_id.0)
            .bind(peer_id.0)
            .bind(peer_id.0)
            .bind(user_id.0)
            .bind(cursor_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE ((sender_user_id = ? AND recipient_user_id = ?)
                     OR (sender_user_id = ? AND recipient_user_id = ?))
                 ORDER BY id DESC
                 LIMIT ?"
            ))
            .bind(user_id.0)
            .bind(peer_id.0)
            .bind(peer_id.0)
            .bind(user_id.0)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        };

        rows.iter().map(row_to_message).collect()
    }

    /// Batch mark-read restricted to the given ids. Only unread rows
    /// actually addressed to the reader transition; the returned ids
    /// let callers emit one receipt per affected message. A retry
    /// after a partial failure is idempotent.
    pub async fn mark_messages_read(
        &self,
        reader_id: UserId,
        message_ids: &[MessageId],
        read_at: DateTime<Utc>,
    ) -> Result<Vec<MessageId>> {
        if message_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; message_ids.len()].join(", ");
        let sql = format!(
            "UPDATE messages SET status = 'read', read_at = ?
             WHERE id IN ({placeholders}) AND recipient_user_id = ?
               AND status IN ('sent', 'delivered') AND deleted_at IS NULL
             RETURNING id"
        );
        let mut query = sqlx::query(&sql).bind(read_at);
        for message_id in message_ids {
            query = query.bind(message_id.0);
        }
        let rows = query.bind(reader_id.0).fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|r| MessageId(r.get::<i64, _>(0)))
            .collect())
    }

    pub async fn find_reaction(
        &self,
        message_id: MessageId,
        user_id: UserId,
    ) -> Result<Option<String>> {
        let row = sqlx::query("SELECT emoji FROM reactions WHERE message_id = ? AND user_id = ?")
            .bind(message_id.0)
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    pub async fn upsert_reaction(
        &self,
        message_id: MessageId,
        user_id: UserId,
        emoji: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO reactions (message_id, user_id, emoji) VALUES (?, ?, ?)
             ON CONFLICT(message_id, user_id) DO UPDATE SET emoji=excluded.emoji",
        )
        .bind(message_id.0)
        .bind(user_id.0)
        .bind(emoji)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_reaction(&self, message_id: MessageId, user_id: UserId) -> Result<()> {
        sqlx::query("DELETE FROM reactions WHERE message_id = ? AND user_id = ?")
            .bind(message_id.0)
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_reactions(&self, message_id: MessageId) -> Result<Vec<Reaction>> {
        let rows = sqlx::query(
            "SELECT message_id, user_id, emoji FROM reactions WHERE message_id = ? ORDER BY user_id",
        )
        .bind(message_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| Reaction {
                message_id: MessageId(r.get::<i64, _>(0)),
                user_id: UserId(r.get::<i64, _>(1)),
                emoji: r.get::<String, _>(2),
            })
            .collect())
    }

    /// Soft delete: stamps `deleted_at`, erases the content, and drops
    /// all reactions in one transaction. File columns stay in place;
    /// read paths hide them.
    pub async fn mark_unsent(
        &self,
        message_id: MessageId,
        deleted_at: DateTime<Utc>,
    ) -> Result<StoredMessage> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            "UPDATE messages SET deleted_at = ?, content = ''
             WHERE id = ? RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(deleted_at)
        .bind(message_id.0)
        .fetch_one(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM reactions WHERE message_id = ?")
            .bind(message_id.0)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        row_to_message(&row)
    }

    /// Async waveform backfill for an audio message. Returns the
    /// updated row, or `None` when the id is unknown.
    pub async fn set_waveform(
        &self,
        message_id: MessageId,
        waveform: &[f32],
    ) -> Result<Option<StoredMessage>> {
        let waveform_json = serde_json::to_string(waveform)?;
        let row = sqlx::query(&format!(
            "UPDATE messages SET waveform = ? WHERE id = ? RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(waveform_json)
        .bind(message_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_message).transpose()
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return Ok(());
    }
    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();
    if path.is_empty() {
        return Ok(());
    }
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| {
                format!(
                    "failed to create parent directory '{}' for database url '{database_url}'",
                    parent.display()
                )
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
