use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use snafu::ResultExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use tokio::sync::broadcast;

use super::error::{
    ConflictSnafu, CreateSqliteDirectorySnafu, InvariantViolationSnafu, NotFoundSnafu,
    SqliteConnectOptionsSnafu, SqliteConnectSnafu, SqliteMigrateSnafu, SqlitePragmaSnafu,
    SqliteQuerySnafu, StorageError, StorageResult,
};
use super::ids::{MessageId, SessionTokenId, UserId};
use super::types::{
    ChangeNotice, CredentialRecord, MessageQuery, MessageRecord, MessageSet, NewMessage, NewUser,
    Participants, SessionTokenRecord, UserRecord,
};
use super::{BoxFuture, MessageStore, SessionTokenStore, UserStore};

/// Notices buffered per change-feed receiver before it starts lagging.
pub const CHANGE_FEED_CAPACITY: usize = 256;

const USER_COLUMNS: &str = "id, email, display_name, photo_url, created_at";
const MESSAGE_COLUMNS: &str =
    "seq, id, sender_id, recipient_id, participant_low, participant_high, text, created_at";

#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
    database_url: String,
    changes: broadcast::Sender<ChangeNotice>,
}

impl SqliteStorage {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        // A single long-lived connection keeps `:memory:` databases alive for the pool lifetime.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-foreign-keys",
                pragma: "foreign_keys",
            })?;
        sqlx::query("PRAGMA busy_timeout = 5000;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-busy-timeout",
                pragma: "busy_timeout",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        tracing::info!(database_url = %database_url, "opened sqlite storage");

        Ok(Self {
            pool,
            database_url,
            changes,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }
}

impl UserStore for SqliteStorage {
    fn create_user(&self, input: NewUser) -> BoxFuture<'_, StorageResult<UserRecord>> {
        Box::pin(async move {
            let user_id = UserId::new_v7();
            let now = unix_timestamp_millis();

            let inserted = sqlx::query(
                "INSERT INTO users (id, email, display_name, photo_url, password_hash, password_salt, created_at) VALUES (?, ?, ?, NULL, ?, ?, ?)",
            )
            .bind(user_id.to_string())
            .bind(input.email.clone())
            .bind(input.display_name.clone())
            .bind(input.password_hash)
            .bind(input.password_salt)
            .bind(now)
            .execute(&self.pool)
            .await;

            match inserted {
                Ok(_) => {}
                Err(sqlx::Error::Database(error)) if error.is_unique_violation() => {
                    return ConflictSnafu {
                        stage: "user-create-unique-email",
                        entity: "user",
                        details: format!("email '{}' is already registered", input.email),
                    }
                    .fail();
                }
                Err(source) => {
                    return Err(StorageError::SqliteQuery {
                        stage: "user-create-insert",
                        source,
                    });
                }
            }

            Ok(UserRecord {
                id: user_id,
                email: input.email,
                display_name: input.display_name,
                photo_url: None,
                created_at_unix_millis: i64_to_u64(now, "user-create-created-at")?,
            })
        })
    }

    fn get_user(&self, user_id: UserId) -> BoxFuture<'_, StorageResult<Option<UserRecord>>> {
        Box::pin(async move {
            let row = sqlx::query_as::<_, UserRow>(&format!(
                "SELECT {USER_COLUMNS} FROM users WHERE id = ?"
            ))
            .bind(user_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "user-get-query",
            })?;

            row.map(user_row_to_record).transpose()
        })
    }

    fn find_user_by_email<'a>(
        &'a self,
        email: &'a str,
    ) -> BoxFuture<'a, StorageResult<Option<UserRecord>>> {
        Box::pin(async move {
            let row = sqlx::query_as::<_, UserRow>(&format!(
                "SELECT {USER_COLUMNS} FROM users WHERE email = ?"
            ))
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "user-find-by-email-query",
            })?;

            row.map(user_row_to_record).transpose()
        })
    }

    fn find_credentials_by_email<'a>(
        &'a self,
        email: &'a str,
    ) -> BoxFuture<'a, StorageResult<Option<CredentialRecord>>> {
        Box::pin(async move {
            let row = sqlx::query_as::<_, CredentialRow>(&format!(
                "SELECT {USER_COLUMNS}, password_hash, password_salt FROM users WHERE email = ?"
            ))
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "user-find-credentials-query",
            })?;

            row.map(|row| {
                Ok(CredentialRecord {
                    user: user_row_to_record(UserRow {
                        id: row.id,
                        email: row.email,
                        display_name: row.display_name,
                        photo_url: row.photo_url,
                        created_at: row.created_at,
                    })?,
                    password_hash: row.password_hash,
                    password_salt: row.password_salt,
                })
            })
            .transpose()
        })
    }

    fn search_users<'a>(
        &'a self,
        fragment: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, StorageResult<Vec<UserRecord>>> {
        Box::pin(async move {
            let pattern = format!("%{}%", escape_like(fragment));
            let rows = sqlx::query_as::<_, UserRow>(&format!(
                "SELECT {USER_COLUMNS} FROM users WHERE email LIKE ? ESCAPE '\\' ORDER BY email ASC LIMIT ?"
            ))
            .bind(pattern)
            .bind(usize_to_i64(limit, "user-search-limit")?)
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "user-search-query",
            })?;

            rows.into_iter().map(user_row_to_record).collect()
        })
    }
}

impl SessionTokenStore for SqliteStorage {
    fn issue_session_token(
        &self,
        user_id: UserId,
    ) -> BoxFuture<'_, StorageResult<SessionTokenRecord>> {
        Box::pin(async move {
            let token = SessionTokenId::new_v7();
            let now = unix_timestamp_millis();

            sqlx::query(
                "INSERT INTO session_tokens (id, user_id, created_at, revoked_at) VALUES (?, ?, ?, NULL)",
            )
            .bind(token.to_string())
            .bind(user_id.to_string())
            .bind(now)
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "session-token-issue-insert",
            })?;

            Ok(SessionTokenRecord {
                id: token,
                user_id,
                created_at_unix_millis: i64_to_u64(now, "session-token-issue-created-at")?,
                revoked_at_unix_millis: None,
            })
        })
    }

    fn resolve_session_token(
        &self,
        token: SessionTokenId,
    ) -> BoxFuture<'_, StorageResult<Option<UserRecord>>> {
        Box::pin(async move {
            let row = sqlx::query_as::<_, UserRow>(
                "SELECT u.id, u.email, u.display_name, u.photo_url, u.created_at FROM session_tokens t JOIN users u ON u.id = t.user_id WHERE t.id = ? AND t.revoked_at IS NULL",
            )
            .bind(token.to_string())
            .fetch_optional(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "session-token-resolve-query",
            })?;

            row.map(user_row_to_record).transpose()
        })
    }

    fn revoke_session_token(&self, token: SessionTokenId) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            let now = unix_timestamp_millis();
            let result = sqlx::query(
                "UPDATE session_tokens SET revoked_at = ? WHERE id = ? AND revoked_at IS NULL",
            )
            .bind(now)
            .bind(token.to_string())
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "session-token-revoke-apply",
            })?;

            if result.rows_affected() == 0 {
                let exists =
                    sqlx::query_scalar::<_, i64>("SELECT 1 FROM session_tokens WHERE id = ? LIMIT 1")
                        .bind(token.to_string())
                        .fetch_optional(&self.pool)
                        .await
                        .context(SqliteQuerySnafu {
                            stage: "session-token-revoke-exists",
                        })?;
                if exists.is_none() {
                    return NotFoundSnafu {
                        stage: "session-token-revoke-missing",
                        entity: "session_token",
                        id: token.to_string(),
                    }
                    .fail();
                }
            }

            Ok(())
        })
    }

    fn revoke_user_sessions(&self, user_id: UserId) -> BoxFuture<'_, StorageResult<u64>> {
        Box::pin(async move {
            let now = unix_timestamp_millis();
            let result = sqlx::query(
                "UPDATE session_tokens SET revoked_at = ? WHERE user_id = ? AND revoked_at IS NULL",
            )
            .bind(now)
            .bind(user_id.to_string())
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "session-token-revoke-user-apply",
            })?;

            Ok(result.rows_affected())
        })
    }
}

impl MessageStore for SqliteStorage {
    fn append_message(&self, input: NewMessage) -> BoxFuture<'_, StorageResult<MessageRecord>> {
        Box::pin(async move {
            let participants = input.participants()?;
            let message_id = MessageId::new_v7();
            let now = unix_timestamp_millis();

            let result = sqlx::query(
                "INSERT INTO messages (id, sender_id, recipient_id, participant_low, participant_high, text, created_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(message_id.to_string())
            .bind(input.sender_id.to_string())
            .bind(input.recipient_id.to_string())
            .bind(participants.low().to_string())
            .bind(participants.high().to_string())
            .bind(input.text.clone())
            .bind(now)
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-append-insert",
            })?;

            let record = MessageRecord {
                id: message_id,
                seq: i64_to_u64(result.last_insert_rowid(), "message-append-seq")?,
                sender_id: input.sender_id,
                recipient_id: input.recipient_id,
                participants,
                text: input.text,
                created_at_unix_millis: i64_to_u64(now, "message-append-created-at")?,
            };

            // A send error only means nobody is subscribed right now.
            let _ = self.changes.send(ChangeNotice {
                message_id,
                participants,
            });
            tracing::debug!(message_id = %message_id, seq = record.seq, "appended message");

            Ok(record)
        })
    }

    fn query_messages(&self, query: MessageQuery) -> BoxFuture<'_, StorageResult<MessageSet>> {
        Box::pin(async move {
            if query.limit == 0 {
                return Ok(MessageSet::default());
            }

            let participant = query.participant.to_string();
            let rows = sqlx::query_as::<_, MessageRow>(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE participant_low = ? OR participant_high = ? ORDER BY created_at DESC, seq DESC LIMIT ? OFFSET ?"
            ))
            .bind(participant.clone())
            .bind(participant)
            .bind(usize_to_i64(query.limit, "message-query-limit")?)
            .bind(usize_to_i64(query.offset, "message-query-offset")?)
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-query-select",
            })?;

            let mut set = MessageSet::default();
            for row in rows {
                let seq = row.seq;
                match message_row_to_record(row) {
                    Ok(record) => set.messages.push(record),
                    Err(error) => {
                        tracing::warn!(seq, error = %error, "quarantined malformed message row");
                        set.quarantined += 1;
                    }
                }
            }

            Ok(set)
        })
    }

    fn get_message(
        &self,
        message_id: MessageId,
    ) -> BoxFuture<'_, StorageResult<Option<MessageRecord>>> {
        Box::pin(async move {
            let row = sqlx::query_as::<_, MessageRow>(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"
            ))
            .bind(message_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-get-query",
            })?;

            row.map(message_row_to_record).transpose()
        })
    }

    fn watch_changes(&self) -> broadcast::Receiver<ChangeNotice> {
        self.changes.subscribe()
    }
}

#[derive(Debug, FromRow)]
struct UserRow {
    id: String,
    email: String,
    display_name: Option<String>,
    photo_url: Option<String>,
    created_at: i64,
}

#[derive(Debug, FromRow)]
struct CredentialRow {
    id: String,
    email: String,
    display_name: Option<String>,
    photo_url: Option<String>,
    created_at: i64,
    password_hash: String,
    password_salt: String,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    seq: i64,
    id: String,
    sender_id: String,
    recipient_id: String,
    participant_low: String,
    participant_high: String,
    text: String,
    created_at: i64,
}

fn user_row_to_record(row: UserRow) -> StorageResult<UserRecord> {
    Ok(UserRecord {
        id: UserId::parse(&row.id)?,
        email: row.email,
        display_name: row.display_name,
        photo_url: row.photo_url,
        created_at_unix_millis: i64_to_u64(row.created_at, "user-row-created-at")?,
    })
}

fn message_row_to_record(row: MessageRow) -> StorageResult<MessageRecord> {
    let sender_id = UserId::parse(&row.sender_id)?;
    let recipient_id = UserId::parse(&row.recipient_id)?;
    let participants = Participants::new(
        UserId::parse(&row.participant_low)?,
        UserId::parse(&row.participant_high)?,
    )?;

    // The pair must be exactly {sender, recipient}; anything else is a foreign document shape.
    if participants.other(sender_id) != Some(recipient_id) {
        return InvariantViolationSnafu {
            stage: "message-row-participants",
            details: format!(
                "message '{}' participants do not match sender '{}' and recipient '{}'",
                row.id, sender_id, recipient_id
            ),
        }
        .fail();
    }

    Ok(MessageRecord {
        id: MessageId::parse(&row.id)?,
        seq: i64_to_u64(row.seq, "message-row-seq")?,
        sender_id,
        recipient_id,
        participants,
        text: row.text,
        created_at_unix_millis: i64_to_u64(row.created_at, "message-row-created-at")?,
    })
}

fn unix_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0_i64, |duration| duration.as_millis() as i64)
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("negative sqlite integer '{value}' cannot map to u64"),
        })
}

fn usize_to_i64(value: usize, stage: &'static str) -> StorageResult<i64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("usize '{value}' cannot map to sqlite i64"),
        })
}

fn escape_like(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for character in raw.chars() {
        if matches!(character, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(character);
    }
    escaped
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}
