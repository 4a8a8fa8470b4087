use gencase_llm::ProviderError;
use gencase_storage::StorageError;
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SessionError {
    #[snafu(display("no model selected for session '{key}'"))]
    ModelNotSelected { stage: &'static str, key: String },
    #[snafu(display("model '{model_id}' selected for session '{key}' is not in the catalog"))]
    UnknownModel {
        stage: &'static str,
        key: String,
        model_id: String,
    },
    #[snafu(display("session '{key}' has not been initialized"))]
    SessionMissing { stage: &'static str, key: String },
    #[snafu(display("session '{key}' has no persisted chat"))]
    ChatNotPersisted { stage: &'static str, key: String },
    #[snafu(display("chat '{chat_id}' does not exist or was deleted"))]
    ChatMissing { stage: &'static str, chat_id: String },
    #[snafu(display("message '{message_id}' is not part of session '{key}'"))]
    MessageMissing {
        stage: &'static str,
        key: String,
        message_id: String,
    },
    #[snafu(display("session '{key}' is already generating a reply"))]
    GenerationInProgress { stage: &'static str, key: String },
    #[snafu(display("generation for session '{key}' was cancelled on `{stage}`"))]
    GenerationCancelled { stage: &'static str, key: String },
    #[snafu(display("inference failed on `{stage}`, {source}"))]
    Inference {
        stage: &'static str,
        source: ProviderError,
    },
    #[snafu(display("stream for session '{key}' failed: {message}"))]
    StreamFailed {
        stage: &'static str,
        key: String,
        message: String,
    },
    #[snafu(display("persistence failed on `{stage}`, {source}"))]
    Persistence {
        stage: &'static str,
        source: StorageError,
    },
}

impl SessionError {
    /// Misconfiguration the user cannot fix by retrying; `loading` is left as it was.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::ModelNotSelected { .. } | Self::UnknownModel { .. }
        )
    }

    /// The call was refused before touching the session.
    pub fn is_rejection(&self) -> bool {
        self.is_configuration()
            || matches!(self, Self::GenerationInProgress { .. })
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
