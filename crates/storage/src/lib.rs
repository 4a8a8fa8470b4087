use std::future::Future;
use std::pin::Pin;

pub mod error;
pub mod ids;
pub mod memory;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use ids::{ChatId, MessageId};
pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;
pub use types::{
    ChatRecord, CompletionState, ExtraData, ExtraDataSource, Feedback, FeedbackRating,
    FeedbackUpdate, MessageRole, RecordedMessage, ToBeRecordedMessage,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait ChatStore: Send + Sync {
    fn create_chat(&self) -> BoxFuture<'_, StorageResult<ChatRecord>>;
    /// Deleted chats are reported as missing.
    fn find_chat_by_id(&self, chat_id: ChatId) -> BoxFuture<'_, StorageResult<Option<ChatRecord>>>;
    /// Most recently updated first.
    fn list_chats(&self) -> BoxFuture<'_, StorageResult<Vec<ChatRecord>>>;
    fn update_title(
        &self,
        chat_id: ChatId,
        title: String,
    ) -> BoxFuture<'_, StorageResult<ChatRecord>>;
    fn delete_chat(&self, chat_id: ChatId) -> BoxFuture<'_, StorageResult<()>>;
}

pub trait MessageStore: Send + Sync {
    /// Writes a batch in order. Ids already recorded in the chat are updated in place.
    fn create_messages(
        &self,
        chat_id: ChatId,
        messages: Vec<ToBeRecordedMessage>,
    ) -> BoxFuture<'_, StorageResult<Vec<RecordedMessage>>>;
    fn list_messages(&self, chat_id: ChatId)
    -> BoxFuture<'_, StorageResult<Vec<RecordedMessage>>>;
    fn update_feedback(
        &self,
        chat_id: ChatId,
        update: FeedbackUpdate,
    ) -> BoxFuture<'_, StorageResult<RecordedMessage>>;
}

pub trait Storage: ChatStore + MessageStore {}

impl<T> Storage for T where T: ChatStore + MessageStore {}
