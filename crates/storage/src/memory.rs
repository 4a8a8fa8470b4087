use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use super::error::{ConflictSnafu, NotFoundSnafu, StorageResult};
use super::ids::{ChatId, MessageId};
use super::types::{
    ChatRecord, FeedbackUpdate, RecordedMessage, ToBeRecordedMessage, validate_extra_data,
};
use super::{BoxFuture, ChatStore, MessageStore};

#[derive(Debug)]
struct MemoryChat {
    record: ChatRecord,
    deleted: bool,
    /// Write order; message bodies live in `MemoryState::messages`.
    message_ids: Vec<MessageId>,
}

#[derive(Debug, Default)]
struct MemoryState {
    chats: HashMap<ChatId, MemoryChat>,
    messages: HashMap<MessageId, RecordedMessage>,
}

/// Process-local store with the same observable behavior as [`crate::SqliteStorage`].
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: Mutex<MemoryState>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn create_chat_now(&self) -> ChatRecord {
        let now = unix_timestamp_seconds();
        let record = ChatRecord {
            id: ChatId::new_v7(),
            title: String::new(),
            created_at_unix_seconds: now,
            updated_at_unix_seconds: now,
        };
        self.state().chats.insert(
            record.id,
            MemoryChat {
                record: record.clone(),
                deleted: false,
                message_ids: Vec::new(),
            },
        );
        record
    }

    fn write_messages_now(
        &self,
        chat_id: ChatId,
        messages: Vec<ToBeRecordedMessage>,
    ) -> StorageResult<Vec<RecordedMessage>> {
        for message in &messages {
            validate_extra_data(&message.extra_data, "memory-message-create-validate")?;
        }

        let mut state = self.state();
        let MemoryState {
            chats,
            messages: stored,
        } = &mut *state;

        let Some(chat) = chats.get_mut(&chat_id).filter(|chat| !chat.deleted) else {
            return NotFoundSnafu {
                stage: "memory-message-create-chat-missing",
                entity: "chat",
                id: chat_id.to_string(),
            }
            .fail();
        };

        for message in &messages {
            if let Some(existing) = stored.get(&message.id)
                && existing.chat_id != chat_id
            {
                return ConflictSnafu {
                    stage: "memory-message-create-foreign-id",
                    entity: "message",
                    details: format!(
                        "message '{}' already belongs to chat '{}'",
                        message.id, existing.chat_id
                    ),
                }
                .fail();
            }
        }

        let now = unix_timestamp_seconds();
        let mut recorded = Vec::with_capacity(messages.len());
        for message in messages {
            let (created_at, feedback) = match stored.get(&message.id) {
                Some(existing) => (existing.created_at_unix_seconds, existing.feedback.clone()),
                None => {
                    chat.message_ids.push(message.id);
                    (now, None)
                }
            };

            let record = RecordedMessage {
                id: message.id,
                chat_id,
                role: message.role,
                content: message.content,
                extra_data: message.extra_data,
                trace: message.trace,
                llm_type: message.llm_type,
                usecase: message.usecase,
                completion: message.completion,
                feedback,
                created_at_unix_seconds: created_at,
                updated_at_unix_seconds: now,
            };
            stored.insert(record.id, record.clone());
            recorded.push(record);
        }

        chat.record.updated_at_unix_seconds = now;
        Ok(recorded)
    }

    fn active_chat(&self, chat_id: ChatId, stage: &'static str) -> StorageResult<ChatRecord> {
        self.state()
            .chats
            .get(&chat_id)
            .filter(|chat| !chat.deleted)
            .map(|chat| chat.record.clone())
            .ok_or_else(|| {
                NotFoundSnafu {
                    stage,
                    entity: "chat",
                    id: chat_id.to_string(),
                }
                .build()
            })
    }
}

impl ChatStore for MemoryStorage {
    fn create_chat(&self) -> BoxFuture<'_, StorageResult<ChatRecord>> {
        let record = self.create_chat_now();
        Box::pin(async move { Ok(record) })
    }

    fn find_chat_by_id(&self, chat_id: ChatId) -> BoxFuture<'_, StorageResult<Option<ChatRecord>>> {
        let record = self.active_chat(chat_id, "memory-chat-get").ok();
        Box::pin(async move { Ok(record) })
    }

    fn list_chats(&self) -> BoxFuture<'_, StorageResult<Vec<ChatRecord>>> {
        let mut chats = self
            .state()
            .chats
            .values()
            .filter(|chat| !chat.deleted)
            .map(|chat| chat.record.clone())
            .collect::<Vec<_>>();
        chats.sort_by(|left, right| {
            right
                .updated_at_unix_seconds
                .cmp(&left.updated_at_unix_seconds)
                .then_with(|| right.id.cmp(&left.id))
        });
        Box::pin(async move { Ok(chats) })
    }

    fn update_title(
        &self,
        chat_id: ChatId,
        title: String,
    ) -> BoxFuture<'_, StorageResult<ChatRecord>> {
        let result = {
            let mut state = self.state();
            match state.chats.get_mut(&chat_id).filter(|chat| !chat.deleted) {
                Some(chat) => {
                    chat.record.title = title;
                    chat.record.updated_at_unix_seconds = unix_timestamp_seconds();
                    Ok(chat.record.clone())
                }
                None => NotFoundSnafu {
                    stage: "memory-chat-update-title-missing",
                    entity: "chat",
                    id: chat_id.to_string(),
                }
                .fail(),
            }
        };
        Box::pin(async move { result })
    }

    fn delete_chat(&self, chat_id: ChatId) -> BoxFuture<'_, StorageResult<()>> {
        let result = match self.state().chats.get_mut(&chat_id) {
            Some(chat) => {
                chat.deleted = true;
                Ok(())
            }
            None => NotFoundSnafu {
                stage: "memory-chat-delete-missing",
                entity: "chat",
                id: chat_id.to_string(),
            }
            .fail(),
        };
        Box::pin(async move { result })
    }
}

impl MessageStore for MemoryStorage {
    fn create_messages(
        &self,
        chat_id: ChatId,
        messages: Vec<ToBeRecordedMessage>,
    ) -> BoxFuture<'_, StorageResult<Vec<RecordedMessage>>> {
        let result = self.write_messages_now(chat_id, messages);
        Box::pin(async move { result })
    }

    fn list_messages(
        &self,
        chat_id: ChatId,
    ) -> BoxFuture<'_, StorageResult<Vec<RecordedMessage>>> {
        let result = self
            .active_chat(chat_id, "memory-message-list-chat-missing")
            .map(|_| {
                let state = self.state();
                state
                    .chats
                    .get(&chat_id)
                    .map(|chat| {
                        chat.message_ids
                            .iter()
                            .filter_map(|id| state.messages.get(id).cloned())
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default()
            });
        Box::pin(async move { result })
    }

    fn update_feedback(
        &self,
        chat_id: ChatId,
        update: FeedbackUpdate,
    ) -> BoxFuture<'_, StorageResult<RecordedMessage>> {
        let result = {
            let mut state = self.state();
            match state
                .messages
                .get_mut(&update.message_id)
                .filter(|message| message.chat_id == chat_id)
            {
                Some(message) => {
                    message.feedback = Some(update.feedback);
                    message.updated_at_unix_seconds = unix_timestamp_seconds();
                    Ok(message.clone())
                }
                None => NotFoundSnafu {
                    stage: "memory-message-feedback-missing",
                    entity: "message",
                    id: update.message_id.to_string(),
                }
                .fail(),
            }
        };
        Box::pin(async move { result })
    }
}

fn unix_timestamp_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StorageError;
    use crate::types::{CompletionState, ExtraData, ExtraDataSource, Feedback, FeedbackRating, MessageRole};

    fn message(role: MessageRole, content: &str) -> ToBeRecordedMessage {
        ToBeRecordedMessage {
            id: MessageId::new_v7(),
            role,
            content: content.to_string(),
            extra_data: Vec::new(),
            trace: None,
            llm_type: None,
            usecase: Some("chat".to_string()),
            completion: CompletionState::Complete,
        }
    }

    #[tokio::test]
    async fn upsert_keeps_position_and_feedback() {
        let storage = MemoryStorage::new();
        let chat = storage.create_chat().await.expect("chat");
        let user = message(MessageRole::User, "q");
        let mut assistant = message(MessageRole::Assistant, "part");
        assistant.completion = CompletionState::Truncated;

        storage
            .create_messages(chat.id, vec![user.clone(), assistant.clone()])
            .await
            .expect("first write");
        storage
            .update_feedback(
                chat.id,
                FeedbackUpdate {
                    message_id: assistant.id,
                    feedback: Feedback::new(FeedbackRating::Good),
                },
            )
            .await
            .expect("feedback");

        assistant.content = "part and more".to_string();
        assistant.completion = CompletionState::Complete;
        storage
            .create_messages(chat.id, vec![assistant.clone()])
            .await
            .expect("rewrite");

        let listed = storage.list_messages(chat.id).await.expect("listed");
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, user.id);
        assert_eq!(listed[1].content, "part and more");
        assert_eq!(listed[1].feedback, Some(Feedback::new(FeedbackRating::Good)));
    }

    #[tokio::test]
    async fn deleted_chat_is_hidden_and_rejects_messages() {
        let storage = MemoryStorage::new();
        let kept = storage.create_chat().await.expect("kept");
        let dropped = storage.create_chat().await.expect("dropped");

        storage.delete_chat(dropped.id).await.expect("deleted");

        let listed = storage.list_chats().await.expect("listed");
        assert_eq!(listed.iter().map(|chat| chat.id).collect::<Vec<_>>(), vec![kept.id]);
        assert_eq!(storage.find_chat_by_id(dropped.id).await.expect("lookup"), None);
        assert!(matches!(
            storage
                .create_messages(dropped.id, vec![message(MessageRole::User, "hi")])
                .await,
            Err(StorageError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn inline_attachments_are_rejected() {
        let storage = MemoryStorage::new();
        let chat = storage.create_chat().await.expect("chat");
        let mut user = message(MessageRole::User, "look");
        user.extra_data = vec![ExtraData {
            kind: "file".to_string(),
            name: "notes.txt".to_string(),
            source: ExtraDataSource::Base64 {
                media_type: "text/plain".to_string(),
                data: "aGk=".to_string(),
            },
        }];

        assert!(matches!(
            storage.create_messages(chat.id, vec![user]).await,
            Err(StorageError::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn titles_update_on_live_chats_only() {
        let storage = MemoryStorage::new();
        let chat = storage.create_chat().await.expect("chat");

        let titled = storage
            .update_title(chat.id, "Groceries".to_string())
            .await
            .expect("titled");
        assert_eq!(titled.title, "Groceries");

        storage.delete_chat(chat.id).await.expect("deleted");
        assert!(matches!(
            storage.update_title(chat.id, "Again".to_string()).await,
            Err(StorageError::NotFound { .. })
        ));
    }
}
