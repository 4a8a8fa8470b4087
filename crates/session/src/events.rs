use gencase_storage::ChatId;

use crate::usecase::SessionKey;

pub const SESSION_EVENT_CAPACITY: usize = 256;

/// Notifications published by the manager after each state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A new snapshot of the session was published.
    Updated { key: SessionKey },
    /// Coalesced assistant text appended to the streaming turn.
    Delta { key: SessionKey, text: String },
    Trace { key: SessionKey, text: String },
    StopReason { key: SessionKey, stop_reason: String },
    TitleChanged { chat_id: ChatId, title: String },
}

impl SessionEvent {
    pub fn key(&self) -> Option<&SessionKey> {
        match self {
            Self::Updated { key }
            | Self::Delta { key, .. }
            | Self::Trace { key, .. }
            | Self::StopReason { key, .. } => Some(key),
            Self::TitleChanged { .. } => None,
        }
    }
}
