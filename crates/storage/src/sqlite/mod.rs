use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use snafu::{OptionExt, ResultExt};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};

use super::error::{
    ConflictSnafu, DecodeJsonSnafu, EncodeJsonSnafu, InvariantViolationSnafu, NotFoundSnafu,
    SqliteQuerySnafu, StorageError,
};
use super::error::{
    CreateSqliteDirectorySnafu, SqliteConnectOptionsSnafu, SqliteConnectSnafu, SqliteMigrateSnafu,
    SqlitePragmaSnafu, StorageResult,
};
use super::ids::{ChatId, MessageId};
use super::types::{
    ChatRecord, CompletionState, ExtraData, Feedback, FeedbackUpdate, MessageRole,
    RecordedMessage, ToBeRecordedMessage, validate_extra_data,
};
use super::{BoxFuture, ChatStore, MessageStore};

#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
    database_url: String,
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

        // A single long-lived connection also keeps `:memory:` databases alive.
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

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::debug!(database_url = %database_url, "sqlite storage ready");
        Ok(Self { pool, database_url })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    async fn create_chat_record(&self) -> StorageResult<ChatRecord> {
        let chat_id = ChatId::new_v7();
        let now = unix_timestamp_seconds();

        sqlx::query(
            "INSERT INTO chats (id, title, created_at, updated_at, deleted_at) VALUES (?, '', ?, ?, NULL)",
        )
        .bind(chat_id.to_string())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "chat-create-insert",
        })?;

        Ok(ChatRecord {
            id: chat_id,
            title: String::new(),
            created_at_unix_seconds: i64_to_u64(now, "chat-create-created-at")?,
            updated_at_unix_seconds: i64_to_u64(now, "chat-create-updated-at")?,
        })
    }

    async fn load_chat(&self, chat_id: ChatId) -> StorageResult<Option<ChatRecord>> {
        let row = sqlx::query_as::<_, ChatRow>(
            "SELECT id, title, created_at, updated_at FROM chats WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(chat_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "chat-get-query",
        })?;

        row.map(chat_row_to_record).transpose()
    }

    async fn load_chats(&self) -> StorageResult<Vec<ChatRecord>> {
        let rows = sqlx::query_as::<_, ChatRow>(
            "SELECT id, title, created_at, updated_at FROM chats WHERE deleted_at IS NULL ORDER BY updated_at DESC, id DESC",
        )
        .fetch_all(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "chat-list-query",
        })?;

        rows.into_iter().map(chat_row_to_record).collect()
    }

    async fn set_title(&self, chat_id: ChatId, title: String) -> StorageResult<ChatRecord> {
        let now = unix_timestamp_seconds();
        let result = sqlx::query(
            "UPDATE chats SET title = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(title)
        .bind(now)
        .bind(chat_id.to_string())
        .execute(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "chat-update-title-apply",
        })?;

        if result.rows_affected() == 0 {
            return NotFoundSnafu {
                stage: "chat-update-title-missing",
                entity: "chat",
                id: chat_id.to_string(),
            }
            .fail();
        }

        self.load_chat(chat_id).await?.context(NotFoundSnafu {
            stage: "chat-update-title-load",
            entity: "chat",
            id: chat_id.to_string(),
        })
    }

    async fn soft_delete_chat(&self, chat_id: ChatId) -> StorageResult<()> {
        let now = unix_timestamp_seconds();
        let result = sqlx::query(
            "UPDATE chats SET deleted_at = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(now)
        .bind(now)
        .bind(chat_id.to_string())
        .execute(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "chat-soft-delete-apply",
        })?;

        if result.rows_affected() == 0 {
            let exists = sqlx::query_scalar::<_, i64>("SELECT 1 FROM chats WHERE id = ? LIMIT 1")
                .bind(chat_id.to_string())
                .fetch_optional(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "chat-soft-delete-exists",
                })?;
            if exists.is_none() {
                return NotFoundSnafu {
                    stage: "chat-soft-delete-missing",
                    entity: "chat",
                    id: chat_id.to_string(),
                }
                .fail();
            }
        }

        Ok(())
    }

    async fn write_messages(
        &self,
        chat_id: ChatId,
        messages: Vec<ToBeRecordedMessage>,
    ) -> StorageResult<Vec<RecordedMessage>> {
        for message in &messages {
            validate_extra_data(&message.extra_data, "message-create-validate")?;
        }

        let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
            stage: "message-create-begin",
        })?;

        let chat_active = sqlx::query_scalar::<_, i64>(
            "SELECT 1 FROM chats WHERE id = ? AND deleted_at IS NULL LIMIT 1",
        )
        .bind(chat_id.to_string())
        .fetch_optional(&mut *tx)
        .await
        .context(SqliteQuerySnafu {
            stage: "message-create-chat-exists",
        })?;
        if chat_active.is_none() {
            return NotFoundSnafu {
                stage: "message-create-chat-missing",
                entity: "chat",
                id: chat_id.to_string(),
            }
            .fail();
        }

        let mut next_seq = sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE chat_id = ?",
        )
        .bind(chat_id.to_string())
        .fetch_one(&mut *tx)
        .await
        .context(SqliteQuerySnafu {
            stage: "message-create-next-seq",
        })?;

        let now = unix_timestamp_seconds();

        for message in &messages {
            let extra_data = encode_extra_data(&message.extra_data)?;
            let owner = sqlx::query_scalar::<_, String>("SELECT chat_id FROM messages WHERE id = ?")
                .bind(message.id.to_string())
                .fetch_optional(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "message-create-owner",
                })?;

            match owner {
                Some(owner) if owner != chat_id.to_string() => {
                    return ConflictSnafu {
                        stage: "message-create-foreign-id",
                        entity: "message",
                        details: format!(
                            "message '{}' already belongs to chat '{owner}'",
                            message.id
                        ),
                    }
                    .fail();
                }
                Some(_) => {
                    sqlx::query(
                        "UPDATE messages SET role = ?, content = ?, extra_data = ?, trace = ?, llm_type = ?, usecase = ?, completion = ?, updated_at = ? WHERE id = ?",
                    )
                    .bind(role_to_sql(message.role))
                    .bind(message.content.clone())
                    .bind(extra_data)
                    .bind(message.trace.clone())
                    .bind(message.llm_type.clone())
                    .bind(message.usecase.clone())
                    .bind(completion_to_sql(message.completion))
                    .bind(now)
                    .bind(message.id.to_string())
                    .execute(&mut *tx)
                    .await
                    .context(SqliteQuerySnafu {
                        stage: "message-create-update-existing",
                    })?;
                }
                None => {
                    sqlx::query(
                        "INSERT INTO messages (id, chat_id, seq, role, content, extra_data, trace, llm_type, usecase, completion, feedback, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, ?, ?)",
                    )
                    .bind(message.id.to_string())
                    .bind(chat_id.to_string())
                    .bind(next_seq)
                    .bind(role_to_sql(message.role))
                    .bind(message.content.clone())
                    .bind(extra_data)
                    .bind(message.trace.clone())
                    .bind(message.llm_type.clone())
                    .bind(message.usecase.clone())
                    .bind(completion_to_sql(message.completion))
                    .bind(now)
                    .bind(now)
                    .execute(&mut *tx)
                    .await
                    .context(SqliteQuerySnafu {
                        stage: "message-create-insert",
                    })?;
                    next_seq += 1;
                }
            }
        }

        sqlx::query("UPDATE chats SET updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(chat_id.to_string())
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-create-touch-chat",
            })?;

        tx.commit().await.context(SqliteQuerySnafu {
            stage: "message-create-commit",
        })?;

        let mut recorded = Vec::with_capacity(messages.len());
        for message in &messages {
            recorded.push(self.load_message(chat_id, message.id).await?.context(
                InvariantViolationSnafu {
                    stage: "message-create-reload",
                    details: format!("message '{}' vanished after commit", message.id),
                },
            )?);
        }

        Ok(recorded)
    }

    async fn load_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
    ) -> StorageResult<Option<RecordedMessage>> {
        let row = sqlx::query_as::<_, MessageRow>(
            "SELECT id, chat_id, role, content, extra_data, trace, llm_type, usecase, completion, feedback, created_at, updated_at FROM messages WHERE chat_id = ? AND id = ?",
        )
        .bind(chat_id.to_string())
        .bind(message_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "message-get-query",
        })?;

        row.map(message_row_to_record).transpose()
    }

    async fn load_messages(&self, chat_id: ChatId) -> StorageResult<Vec<RecordedMessage>> {
        if self.load_chat(chat_id).await?.is_none() {
            return NotFoundSnafu {
                stage: "message-list-chat-missing",
                entity: "chat",
                id: chat_id.to_string(),
            }
            .fail();
        }

        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT id, chat_id, role, content, extra_data, trace, llm_type, usecase, completion, feedback, created_at, updated_at FROM messages WHERE chat_id = ? ORDER BY seq ASC",
        )
        .bind(chat_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "message-list-query",
        })?;

        rows.into_iter().map(message_row_to_record).collect()
    }

    async fn write_feedback(
        &self,
        chat_id: ChatId,
        update: FeedbackUpdate,
    ) -> StorageResult<RecordedMessage> {
        let feedback = serde_json::to_string(&update.feedback).context(EncodeJsonSnafu {
            stage: "message-feedback-encode",
            column: "feedback",
        })?;
        let now = unix_timestamp_seconds();

        let result =
            sqlx::query("UPDATE messages SET feedback = ?, updated_at = ? WHERE chat_id = ? AND id = ?")
                .bind(feedback)
                .bind(now)
                .bind(chat_id.to_string())
                .bind(update.message_id.to_string())
                .execute(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "message-feedback-apply",
                })?;

        if result.rows_affected() == 0 {
            return NotFoundSnafu {
                stage: "message-feedback-missing",
                entity: "message",
                id: update.message_id.to_string(),
            }
            .fail();
        }

        self.load_message(chat_id, update.message_id)
            .await?
            .context(NotFoundSnafu {
                stage: "message-feedback-load",
                entity: "message",
                id: update.message_id.to_string(),
            })
    }
}

impl ChatStore for SqliteStorage {
    fn create_chat(&self) -> BoxFuture<'_, StorageResult<ChatRecord>> {
        Box::pin(self.create_chat_record())
    }

    fn find_chat_by_id(&self, chat_id: ChatId) -> BoxFuture<'_, StorageResult<Option<ChatRecord>>> {
        Box::pin(self.load_chat(chat_id))
    }

    fn list_chats(&self) -> BoxFuture<'_, StorageResult<Vec<ChatRecord>>> {
        Box::pin(self.load_chats())
    }

    fn update_title(
        &self,
        chat_id: ChatId,
        title: String,
    ) -> BoxFuture<'_, StorageResult<ChatRecord>> {
        Box::pin(self.set_title(chat_id, title))
    }

    fn delete_chat(&self, chat_id: ChatId) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(self.soft_delete_chat(chat_id))
    }
}

impl MessageStore for SqliteStorage {
    fn create_messages(
        &self,
        chat_id: ChatId,
        messages: Vec<ToBeRecordedMessage>,
    ) -> BoxFuture<'_, StorageResult<Vec<RecordedMessage>>> {
        Box::pin(self.write_messages(chat_id, messages))
    }

    fn list_messages(
        &self,
        chat_id: ChatId,
    ) -> BoxFuture<'_, StorageResult<Vec<RecordedMessage>>> {
        Box::pin(self.load_messages(chat_id))
    }

    fn update_feedback(
        &self,
        chat_id: ChatId,
        update: FeedbackUpdate,
    ) -> BoxFuture<'_, StorageResult<RecordedMessage>> {
        Box::pin(self.write_feedback(chat_id, update))
    }
}

#[derive(Debug, FromRow)]
struct ChatRow {
    id: String,
    title: String,
    created_at: i64,
    updated_at: i64,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    chat_id: String,
    role: String,
    content: String,
    extra_data: String,
    trace: Option<String>,
    llm_type: Option<String>,
    usecase: Option<String>,
    completion: String,
    feedback: Option<String>,
    created_at: i64,
    updated_at: i64,
}

fn chat_row_to_record(row: ChatRow) -> StorageResult<ChatRecord> {
    Ok(ChatRecord {
        id: ChatId::parse(&row.id)?,
        title: row.title,
        created_at_unix_seconds: i64_to_u64(row.created_at, "chat-row-created-at")?,
        updated_at_unix_seconds: i64_to_u64(row.updated_at, "chat-row-updated-at")?,
    })
}

fn message_row_to_record(row: MessageRow) -> StorageResult<RecordedMessage> {
    Ok(RecordedMessage {
        id: MessageId::parse(&row.id)?,
        chat_id: ChatId::parse(&row.chat_id)?,
        role: role_from_sql(&row.role)?,
        content: row.content,
        extra_data: serde_json::from_str::<Vec<ExtraData>>(&row.extra_data).context(
            DecodeJsonSnafu {
                stage: "message-row-extra-data",
                column: "extra_data",
            },
        )?,
        trace: row.trace,
        llm_type: row.llm_type,
        usecase: row.usecase,
        completion: completion_from_sql(&row.completion)?,
        feedback: row
            .feedback
            .as_deref()
            .map(serde_json::from_str::<Feedback>)
            .transpose()
            .context(DecodeJsonSnafu {
                stage: "message-row-feedback",
                column: "feedback",
            })?,
        created_at_unix_seconds: i64_to_u64(row.created_at, "message-row-created-at")?,
        updated_at_unix_seconds: i64_to_u64(row.updated_at, "message-row-updated-at")?,
    })
}

fn encode_extra_data(extra_data: &[ExtraData]) -> StorageResult<String> {
    serde_json::to_string(extra_data).context(EncodeJsonSnafu {
        stage: "message-create-encode-extra-data",
        column: "extra_data",
    })
}

fn role_to_sql(role: MessageRole) -> &'static str {
    match role {
        MessageRole::System => "system",
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
    }
}

fn role_from_sql(raw: &str) -> StorageResult<MessageRole> {
    match raw {
        "system" => Ok(MessageRole::System),
        "user" => Ok(MessageRole::User),
        "assistant" => Ok(MessageRole::Assistant),
        _ => InvariantViolationSnafu {
            stage: "message-role-from-sql",
            details: format!("unknown message role '{raw}'"),
        }
        .fail(),
    }
}

fn completion_to_sql(completion: CompletionState) -> &'static str {
    match completion {
        CompletionState::Complete => "complete",
        CompletionState::Truncated => "truncated",
    }
}

fn completion_from_sql(raw: &str) -> StorageResult<CompletionState> {
    match raw {
        "complete" => Ok(CompletionState::Complete),
        "truncated" => Ok(CompletionState::Truncated),
        _ => InvariantViolationSnafu {
            stage: "message-completion-from-sql",
            details: format!("unknown completion state '{raw}'"),
        }
        .fail(),
    }
}

fn unix_timestamp_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0_i64, |duration| duration.as_secs() as i64)
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("negative sqlite integer '{value}' cannot map to u64"),
        })
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
