mod assembler;
mod error;
mod events;
mod handle;
mod history;
mod manager;
mod message;
mod prompt;
mod registry;
mod usecase;

pub use assembler::{ChunkAssembler, DEFAULT_FLUSH_MIN_CHARS, FlushPolicy};
pub use error::{SessionError, SessionResult};
pub use events::{SESSION_EVENT_CAPACITY, SessionEvent};
pub use handle::SessionHandle;
pub use history::{is_continuation, select_history};
pub use manager::{
    ChatSessionManager, GenerateOptions, ListChanged, PostProcess, PostRequest, PreProcess,
};
pub use message::{Message, TurnRole, TurnStatus, UploadedFile};
pub use prompt::{
    DefaultPromptTemplates, OutputTagScrubber, PromptTemplates, strip_assistant_footnotes, strip_footnotes,
    strip_output_tags,
};
pub use registry::{GenerationGuard, Session, SessionRegistry};
pub use usecase::{SessionKey, UseCase};

pub use gencase_llm::Role;
