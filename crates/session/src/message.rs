use gencase_llm::{Attachment, AttachmentSource, Role, UnrecordedMessage};
use gencase_storage::{
    CompletionState, ExtraData, ExtraDataSource, Feedback, MessageId, MessageRole,
    RecordedMessage, ToBeRecordedMessage,
};

/// Lifecycle of one assistant turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TurnStatus {
    /// Placeholder or still streaming.
    Pending,
    #[default]
    Complete,
    /// The stream stopped on a token limit; the turn can be continued.
    Truncated,
}

impl From<CompletionState> for TurnStatus {
    fn from(value: CompletionState) -> Self {
        match value {
            CompletionState::Complete => Self::Complete,
            CompletionState::Truncated => Self::Truncated,
        }
    }
}

/// Roles a caller may push directly; the system message belongs to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TurnRole {
    User,
    Assistant,
}

impl From<TurnRole> for Role {
    fn from(value: TurnRole) -> Self {
        match value {
            TurnRole::User => Self::User,
            TurnRole::Assistant => Self::Assistant,
        }
    }
}

/// A file the user attached, already uploaded to object storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    pub kind: String,
    pub name: String,
    pub media_type: String,
    pub uri: String,
}

impl UploadedFile {
    pub fn new(
        kind: impl Into<String>,
        name: impl Into<String>,
        media_type: impl Into<String>,
        uri: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            media_type: media_type.into(),
            uri: uri.into(),
        }
    }

    pub fn to_extra_data(&self) -> ExtraData {
        ExtraData::remote(
            self.kind.clone(),
            self.name.clone(),
            self.media_type.clone(),
            self.uri.clone(),
        )
    }
}

/// One entry of a session's history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Set once the message has been persisted.
    pub message_id: Option<MessageId>,
    pub usecase: Option<String>,
    pub extra_data: Vec<ExtraData>,
    pub trace: Option<String>,
    pub llm_type: Option<String>,
    pub status: TurnStatus,
    pub feedback: Option<Feedback>,
    pub created_at_unix_seconds: Option<u64>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            message_id: None,
            usecase: None,
            extra_data: Vec::new(),
            trace: None,
            llm_type: None,
            status: TurnStatus::Complete,
            feedback: None,
            created_at_unix_seconds: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Empty assistant turn shown while the answer streams in.
    pub fn assistant_placeholder() -> Self {
        Self {
            status: TurnStatus::Pending,
            ..Self::assistant("")
        }
    }

    pub fn with_extra_data(mut self, extra_data: Vec<ExtraData>) -> Self {
        self.extra_data = extra_data;
        self
    }

    pub fn with_status(mut self, status: TurnStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_placeholder(&self) -> bool {
        self.role == Role::Assistant && self.status == TurnStatus::Pending
    }

    pub fn to_unrecorded(&self) -> UnrecordedMessage {
        UnrecordedMessage {
            role: self.role,
            content: self.content.clone(),
            extra_data: self.extra_data.iter().map(extra_data_to_attachment).collect(),
            trace: self.trace.clone(),
        }
    }

    /// `None` until an id has been assigned.
    pub fn to_record(&self) -> Option<ToBeRecordedMessage> {
        Some(ToBeRecordedMessage {
            id: self.message_id?,
            role: role_to_storage(self.role),
            content: self.content.clone(),
            extra_data: self.extra_data.clone(),
            trace: self.trace.clone(),
            llm_type: self.llm_type.clone(),
            usecase: self.usecase.clone(),
            completion: match self.status {
                TurnStatus::Truncated => CompletionState::Truncated,
                TurnStatus::Pending | TurnStatus::Complete => CompletionState::Complete,
            },
        })
    }

    pub fn from_record(record: RecordedMessage) -> Self {
        Self {
            role: role_from_storage(record.role),
            content: record.content,
            message_id: Some(record.id),
            usecase: record.usecase,
            extra_data: record.extra_data,
            trace: record.trace,
            llm_type: record.llm_type,
            status: record.completion.into(),
            feedback: record.feedback,
            created_at_unix_seconds: Some(record.created_at_unix_seconds),
        }
    }
}

fn extra_data_to_attachment(extra_data: &ExtraData) -> Attachment {
    let source = match &extra_data.source {
        ExtraDataSource::Base64 { media_type, data } => AttachmentSource::Base64 {
            media_type: media_type.clone(),
            data: data.clone(),
        },
        ExtraDataSource::Remote { media_type, uri } => AttachmentSource::Remote {
            media_type: media_type.clone(),
            uri: uri.clone(),
        },
    };

    Attachment {
        kind: extra_data.kind.clone(),
        name: extra_data.name.clone(),
        source,
    }
}

fn role_to_storage(role: Role) -> MessageRole {
    match role {
        Role::System => MessageRole::System,
        Role::User => MessageRole::User,
        Role::Assistant => MessageRole::Assistant,
    }
}

fn role_from_storage(role: MessageRole) -> Role {
    match role {
        MessageRole::System => Role::System,
        MessageRole::User => Role::User,
        MessageRole::Assistant => Role::Assistant,
    }
}
