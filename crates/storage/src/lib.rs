use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{ChannelId, CredentialKind, ListingId, MessageId, OtpRecord, PendingCode, UserId};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredUser {
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub phone: Option<String>,
    pub password_hash: String,
    pub token: String,
    pub email_verified: bool,
    pub phone_verified: bool,
}

#[derive(Debug, Clone)]
pub struct NewUser<'a> {
    pub id: UserId,
    pub username: &'a str,
    pub email: &'a str,
    pub phone: Option<&'a str>,
    pub password_hash: &'a str,
    pub token: &'a str,
}

#[derive(Debug, Clone)]
pub struct StoredChannel {
    pub id: ChannelId,
    pub creator_id: UserId,
    pub participant_ids: Vec<UserId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub sender_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredListing {
    pub id: ListingId,
    pub creator_id: UserId,
    pub title: String,
    pub description: String,
    pub price: i64,
    pub location: String,
    pub created_at: DateTime<Utc>,
}

/// Canonical channel identity for a normalized target set: sorted ids
/// joined with commas. Callers pass the already-normalized participants.
pub fn participant_key(participants: &[UserId]) -> String {
    participants
        .iter()
        .map(|id| id.0.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

const USER_COLUMNS: &str =
    "id, username, email, phone, password_hash, token, email_verified, phone_verified";

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

    /// Inserts a user; returns `false` when the username, email, or token
    /// collides with an existing row.
    pub async fn insert_user(&self, user: &NewUser<'_>) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO users (id, username, email, phone, password_hash, token)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(user.id.0)
        .bind(user.username)
        .bind(user.email)
        .bind(user.phone)
        .bind(user.password_hash)
        .bind(user.token)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(err) if is_unique_violation(&err) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn user_by_id(&self, id: UserId) -> Result<Option<StoredUser>> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(user_from_row))
    }

    pub async fn user_by_username(&self, username: &str) -> Result<Option<StoredUser>> {
        let row = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE username = ?"
        ))
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(user_from_row))
    }

    pub async fn user_by_token(&self, token: &str) -> Result<Option<StoredUser>> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE token = ?"))
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(user_from_row))
    }

    pub async fn user_by_credentials(
        &self,
        username: &str,
        password_hash: &str,
    ) -> Result<Option<StoredUser>> {
        let row = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE username = ? AND password_hash = ?"
        ))
        .bind(username)
        .bind(password_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(user_from_row))
    }

    pub async fn users_by_ids(&self, ids: &[i64]) -> Result<Vec<StoredUser>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(user_from_row).collect())
    }

    pub async fn set_credential_verified(&self, id: UserId, kind: CredentialKind) -> Result<()> {
        let sql = match kind {
            CredentialKind::Email => "UPDATE users SET email_verified = 1 WHERE id = ?",
            CredentialKind::Phone => "UPDATE users SET phone_verified = 1 WHERE id = ?",
        };
        sqlx::query(sql).bind(id.0).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn set_phone(&self, id: UserId, phone: &str) -> Result<()> {
        sqlx::query("UPDATE users SET phone = ? WHERE id = ?")
            .bind(phone)
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_token(&self, id: UserId, token: &str) -> Result<()> {
        sqlx::query("UPDATE users SET token = ? WHERE id = ?")
            .bind(token)
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Atomically writes one credential slot of the subject's record,
    /// inserting the record if absent. The other slot is untouched.
    pub async fn upsert_otp_slot(
        &self,
        subject: UserId,
        kind: CredentialKind,
        slot: &PendingCode,
    ) -> Result<()> {
        let sql = match kind {
            CredentialKind::Email => {
                "INSERT INTO otp (user_id, email, email_code, email_issued_at, email_timeout_secs)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT(user_id) DO UPDATE SET
                    email = excluded.email,
                    email_code = excluded.email_code,
                    email_issued_at = excluded.email_issued_at,
                    email_timeout_secs = excluded.email_timeout_secs"
            }
            CredentialKind::Phone => {
                "INSERT INTO otp (user_id, phone, phone_code, phone_issued_at, phone_timeout_secs)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT(user_id) DO UPDATE SET
                    phone = excluded.phone,
                    phone_code = excluded.phone_code,
                    phone_issued_at = excluded.phone_issued_at,
                    phone_timeout_secs = excluded.phone_timeout_secs"
            }
        };
        sqlx::query(sql)
            .bind(subject.0)
            .bind(&slot.destination)
            .bind(&slot.code)
            .bind(slot.issued_at)
            .bind(slot.timeout_secs)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn otp_record(&self, subject: UserId) -> Result<Option<OtpRecord>> {
        let row = sqlx::query(
            "SELECT email, email_code, email_issued_at, email_timeout_secs,
                    phone, phone_code, phone_issued_at, phone_timeout_secs
             FROM otp WHERE user_id = ?",
        )
        .bind(subject.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| OtpRecord {
            subject,
            email: slot_from_row(&r, 0),
            phone: slot_from_row(&r, 4),
        }))
    }

    /// Clears one credential slot; deletes the record outright when the
    /// other slot is also empty. A record is never left with no slots.
    pub async fn clear_otp_slot(&self, subject: UserId, kind: CredentialKind) -> Result<()> {
        let unset = match kind {
            CredentialKind::Email => {
                "UPDATE otp SET email = NULL, email_code = NULL,
                    email_issued_at = NULL, email_timeout_secs = NULL
                 WHERE user_id = ?"
            }
            CredentialKind::Phone => {
                "UPDATE otp SET phone = NULL, phone_code = NULL,
                    phone_issued_at = NULL, phone_timeout_secs = NULL
                 WHERE user_id = ?"
            }
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query(unset).bind(subject.0).execute(&mut *tx).await?;
        sqlx::query("DELETE FROM otp WHERE user_id = ? AND email_code IS NULL AND phone_code IS NULL")
            .bind(subject.0)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Inserts a channel; returns `false` when a channel with the same
    /// canonical identity (or id) already exists.
    pub async fn insert_channel(&self, channel: &StoredChannel) -> Result<bool> {
        let participants_json = serde_json::to_string(
            &channel
                .participant_ids
                .iter()
                .map(|id| id.0)
                .collect::<Vec<_>>(),
        )?;
        let result = sqlx::query(
            "INSERT INTO channels (id, creator_id, participant_key, participant_ids, created_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT DO NOTHING",
        )
        .bind(channel.id.0)
        .bind(channel.creator_id.0)
        .bind(participant_key(&channel.participant_ids))
        .bind(participants_json)
        .bind(channel.created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Creator-anchored lookup: same creator AND same normalized target set.
    pub async fn channel_by_identity(
        &self,
        creator_id: UserId,
        participants: &[UserId],
    ) -> Result<Option<StoredChannel>> {
        let row = sqlx::query(
            "SELECT id, creator_id, participant_ids, created_at
             FROM channels WHERE creator_id = ? AND participant_key = ?",
        )
        .bind(creator_id.0)
        .bind(participant_key(participants))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(channel_from_row))
    }

    pub async fn channel_by_id(&self, id: ChannelId) -> Result<Option<StoredChannel>> {
        let row = sqlx::query(
            "SELECT id, creator_id, participant_ids, created_at FROM channels WHERE id = ?",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(channel_from_row))
    }

    /// Guarded append: the insert succeeds only while the channel row still
    /// exists. Returns `false` when the channel is gone.
    pub async fn append_message(&self, message: &StoredMessage) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO messages (id, channel_id, sender_id, content, created_at)
             SELECT ?, c.id, ?, ?, ? FROM channels c WHERE c.id = ?",
        )
        .bind(message.id.0)
        .bind(message.sender_id.0)
        .bind(&message.content)
        .bind(message.created_at)
        .bind(message.channel_id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Messages with `id > after`, oldest first. Row order breaks
    /// sub-millisecond id ties so append order is preserved.
    pub async fn list_messages_after(
        &self,
        channel_id: ChannelId,
        after: i64,
        limit: u32,
    ) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(
            "SELECT id, channel_id, sender_id, content, created_at
             FROM messages
             WHERE channel_id = ? AND id > ?
             ORDER BY id ASC, rowid ASC
             LIMIT ?",
        )
        .bind(channel_id.0)
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| StoredMessage {
                id: MessageId(r.get::<i64, _>(0)),
                channel_id: ChannelId(r.get::<i64, _>(1)),
                sender_id: UserId(r.get::<i64, _>(2)),
                content: r.get::<String, _>(3),
                created_at: r.get::<DateTime<Utc>, _>(4),
            })
            .collect())
    }

    pub async fn insert_listing(&self, listing: &StoredListing) -> Result<()> {
        sqlx::query(
            "INSERT INTO listings (id, creator_id, title, description, price, location, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(listing.id.0)
        .bind(listing.creator_id.0)
        .bind(&listing.title)
        .bind(&listing.description)
        .bind(listing.price)
        .bind(&listing.location)
        .bind(listing.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn listing_by_id(&self, id: ListingId) -> Result<Option<StoredListing>> {
        let row = sqlx::query(
            "SELECT id, creator_id, title, description, price, location, created_at
             FROM listings WHERE id = ?",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(listing_from_row))
    }

    pub async fn listings_by_creator(&self, creator_id: UserId) -> Result<Vec<StoredListing>> {
        let rows = sqlx::query(
            "SELECT id, creator_id, title, description, price, location, created_at
             FROM listings WHERE creator_id = ? ORDER BY id ASC",
        )
        .bind(creator_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(listing_from_row).collect())
    }
}

fn user_from_row(r: sqlx::sqlite::SqliteRow) -> StoredUser {
    StoredUser {
        id: UserId(r.get::<i64, _>(0)),
        username: r.get::<String, _>(1),
        email: r.get::<String, _>(2),
        phone: r.get::<Option<String>, _>(3),
        password_hash: r.get::<String, _>(4),
        token: r.get::<String, _>(5),
        email_verified: r.get::<bool, _>(6),
        phone_verified: r.get::<bool, _>(7),
    }
}

fn channel_from_row(r: sqlx::sqlite::SqliteRow) -> StoredChannel {
    let ids: Vec<i64> = serde_json::from_str(&r.get::<String, _>(2)).unwrap_or_default();
    StoredChannel {
        id: ChannelId(r.get::<i64, _>(0)),
        creator_id: UserId(r.get::<i64, _>(1)),
        participant_ids: ids.into_iter().map(UserId).collect(),
        created_at: r.get::<DateTime<Utc>, _>(3),
    }
}

fn listing_from_row(r: sqlx::sqlite::SqliteRow) -> StoredListing {
    StoredListing {
        id: ListingId(r.get::<i64, _>(0)),
        creator_id: UserId(r.get::<i64, _>(1)),
        title: r.get::<String, _>(2),
        description: r.get::<String, _>(3),
        price: r.get::<i64, _>(4),
        location: r.get::<String, _>(5),
        created_at: r.get::<DateTime<Utc>, _>(6),
    }
}

/// Reads one credential slot starting at `base`: destination, code,
/// issued_at, timeout_secs. A slot without a code is not pending.
fn slot_from_row(r: &sqlx::sqlite::SqliteRow, base: usize) -> Option<PendingCode> {
    let code = r.get::<Option<String>, _>(base + 1)?;
    Some(PendingCode {
        destination: r.get::<Option<String>, _>(base).unwrap_or_default(),
        code,
        issued_at: r
            .get::<Option<DateTime<Utc>>, _>(base + 2)
            .unwrap_or(DateTime::UNIX_EPOCH),
        timeout_secs: r.get::<Option<i64>, _>(base + 3).unwrap_or_default(),
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db)
            if matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation)
    )
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
