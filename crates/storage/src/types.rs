use serde::{Deserialize, Serialize};

use super::error::{ConflictSnafu, StorageResult};
use super::ids::{ChatId, MessageId};

/// Storage-local message role, intentionally decoupled from session-layer role enums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// Whether a recorded assistant turn finished or was cut off by a token limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompletionState {
    #[default]
    Complete,
    Truncated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRecord {
    pub id: ChatId,
    /// Empty until a title has been predicted or set.
    pub title: String,
    pub created_at_unix_seconds: u64,
    pub updated_at_unix_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExtraDataSource {
    #[serde(rename = "base64")]
    Base64 {
        #[serde(rename = "mediaType")]
        media_type: String,
        data: String,
    },
    #[serde(rename = "s3")]
    Remote {
        #[serde(rename = "mediaType")]
        media_type: String,
        uri: String,
    },
}

/// A file or image attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraData {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub source: ExtraDataSource,
}

impl ExtraData {
    pub fn remote(
        kind: impl Into<String>,
        name: impl Into<String>,
        media_type: impl Into<String>,
        uri: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            source: ExtraDataSource::Remote {
                media_type: media_type.into(),
                uri: uri.into(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackRating {
    Good,
    Bad,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feedback {
    pub rating: FeedbackRating,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Feedback {
    pub fn new(rating: FeedbackRating) -> Self {
        Self {
            rating,
            reasons: Vec::new(),
            detail: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedbackUpdate {
    pub message_id: MessageId,
    pub feedback: Feedback,
}

/// A message the caller wants written; an existing `id` in the same chat is overwritten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToBeRecordedMessage {
    pub id: MessageId,
    pub role: MessageRole,
    pub content: String,
    pub extra_data: Vec<ExtraData>,
    pub trace: Option<String>,
    pub llm_type: Option<String>,
    pub usecase: Option<String>,
    pub completion: CompletionState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedMessage {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub role: MessageRole,
    pub content: String,
    pub extra_data: Vec<ExtraData>,
    pub trace: Option<String>,
    pub llm_type: Option<String>,
    pub usecase: Option<String>,
    pub completion: CompletionState,
    pub feedback: Option<Feedback>,
    pub created_at_unix_seconds: u64,
    pub updated_at_unix_seconds: u64,
}

pub(crate) fn validate_extra_data(
    extra_data: &[ExtraData],
    stage: &'static str,
) -> StorageResult<()> {
    for item in extra_data {
        if matches!(item.source, ExtraDataSource::Base64 { .. }) {
            return ConflictSnafu {
                stage,
                entity: "extra_data",
                details: format!(
                    "attachment '{}' carries an inline payload; store object references only",
                    item.name
                ),
            }
            .fail();
        }
    }

    Ok(())
}
