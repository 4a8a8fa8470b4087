use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use gencase_llm::{
    ChunkStreamHandle, InferenceEndpoint, InferenceRequest, ModelCatalog, ModelDescriptor, Role,
    STOP_REASON_MAX_TOKENS, StreamEvent, StreamingChunk, UnrecordedMessage,
};
use gencase_storage::{ChatId, ChatRecord, FeedbackUpdate, MessageId, Storage};
use snafu::{OptionExt, ResultExt};
use tokio::sync::broadcast;

use crate::assembler::{ChunkAssembler, FlushPolicy};
use crate::error::{
    ChatMissingSnafu, ChatNotPersistedSnafu, GenerationCancelledSnafu, GenerationInProgressSnafu,
    InferenceSnafu, MessageMissingSnafu,
    ModelNotSelectedSnafu, PersistenceSnafu, SessionMissingSnafu, SessionResult,
    StreamFailedSnafu, UnknownModelSnafu,
};
use crate::events::{SESSION_EVENT_CAPACITY, SessionEvent};
use crate::history::{is_continuation, select_history};
use crate::message::{Message, TurnRole, TurnStatus, UploadedFile};
use crate::prompt::{DefaultPromptTemplates, OutputTagScrubber, PromptTemplates, strip_output_tags};
use crate::registry::{GenerationGuard, Session, SessionRegistry};
use crate::usecase::{SessionKey, UseCase};

pub type PreProcess = Arc<dyn Fn(Vec<Message>) -> Vec<Message> + Send + Sync>;
pub type PostProcess = Arc<dyn Fn(String) -> String + Send + Sync>;
/// Invoked after the chat list changed (a title was predicted).
pub type ListChanged = Arc<dyn Fn() + Send + Sync>;

/// Knobs shared by `post` and `continue_generation`.
#[derive(Clone, Default)]
pub struct GenerateOptions {
    pub ignore_history: bool,
    pub pre_process: Option<PreProcess>,
    pub post_process: Option<PostProcess>,
    /// Forwarded as the model descriptor's session id.
    pub session_id: Option<String>,
    pub on_list_changed: Option<ListChanged>,
}

impl fmt::Debug for GenerateOptions {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("GenerateOptions")
            .field("ignore_history", &self.ignore_history)
            .field("pre_process", &self.pre_process.is_some())
            .field("post_process", &self.post_process.is_some())
            .field("session_id", &self.session_id)
            .field("on_list_changed", &self.on_list_changed.is_some())
            .finish()
    }
}

impl GenerateOptions {
    pub fn with_ignore_history(mut self, ignore_history: bool) -> Self {
        self.ignore_history = ignore_history;
        self
    }

    pub fn with_pre_process(
        mut self,
        pre_process: impl Fn(Vec<Message>) -> Vec<Message> + Send + Sync + 'static,
    ) -> Self {
        self.pre_process = Some(Arc::new(pre_process));
        self
    }

    pub fn with_post_process(
        mut self,
        post_process: impl Fn(String) -> String + Send + Sync + 'static,
    ) -> Self {
        self.post_process = Some(Arc::new(post_process));
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_on_list_changed(mut self, on_list_changed: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_list_changed = Some(Arc::new(on_list_changed));
        self
    }
}

/// A new user turn.
#[derive(Debug, Clone, Default)]
pub struct PostRequest {
    pub content: String,
    pub uploaded_files: Vec<UploadedFile>,
    pub options: GenerateOptions,
}

impl PostRequest {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn with_uploaded_files(mut self, uploaded_files: Vec<UploadedFile>) -> Self {
        self.uploaded_files = uploaded_files;
        self
    }

    pub fn with_options(mut self, options: GenerateOptions) -> Self {
        self.options = options;
        self
    }
}

/// Owns every live conversation and drives generations into them.
///
/// Cheap to clone; clones share the registry, endpoint and storage.
#[derive(Clone)]
pub struct ChatSessionManager {
    registry: Arc<SessionRegistry>,
    endpoint: Arc<dyn InferenceEndpoint>,
    storage: Arc<dyn Storage>,
    templates: Arc<dyn PromptTemplates>,
    catalog: Arc<ModelCatalog>,
    default_model_id: Option<String>,
    flush_policy: FlushPolicy,
    events: broadcast::Sender<SessionEvent>,
}

impl ChatSessionManager {
    pub fn new(endpoint: Arc<dyn InferenceEndpoint>, storage: Arc<dyn Storage>) -> Self {
        let (events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        Self {
            registry: Arc::new(SessionRegistry::new()),
            endpoint,
            storage,
            templates: Arc::new(DefaultPromptTemplates),
            catalog: Arc::new(ModelCatalog::default()),
            default_model_id: None,
            flush_policy: FlushPolicy::default(),
            events,
        }
    }

    pub fn with_registry(mut self, registry: Arc<SessionRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_templates(mut self, templates: Arc<dyn PromptTemplates>) -> Self {
        self.templates = templates;
        self
    }

    pub fn with_catalog(mut self, catalog: ModelCatalog) -> Self {
        self.catalog = Arc::new(catalog);
        self
    }

    /// Model selected for sessions created from now on.
    pub fn with_default_model(mut self, model_id: impl Into<String>) -> Self {
        self.default_model_id = Some(model_id.into());
        self
    }

    pub fn with_flush_policy(mut self, flush_policy: FlushPolicy) -> Self {
        self.flush_policy = flush_policy;
        self
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn init(&self, key: &SessionKey, use_case: &UseCase) -> Arc<Session> {
        self.registry.get_or_insert_with(key, |epoch| {
            tracing::debug!(key = %key, use_case = %use_case, "session created");
            self.fresh_session(use_case, None, epoch)
        })
    }

    /// Installs persisted history at `key`, resetting other sessions that hold the same chat.
    pub fn restore(
        &self,
        key: &SessionKey,
        use_case: &UseCase,
        messages: Vec<Message>,
        chat: Option<ChatRecord>,
    ) -> Arc<Session> {
        if let Some(chat_id) = chat.as_ref().map(|chat| chat.id) {
            for other in self.registry.keys_holding_chat(chat_id) {
                if &other != key {
                    tracing::debug!(key = %other, chat_id = %chat_id, "resetting duplicate session");
                    self.reset(&other, None);
                }
            }
        }

        let mut messages = messages;
        let system = messages
            .iter()
            .position(|message| message.role == Role::System)
            .map(|index| messages.remove(index))
            .unwrap_or_else(|| Message::system(self.templates.system_context(use_case)));
        let before = messages.len();
        messages.retain(|message| message.role != Role::System);
        if messages.len() != before {
            tracing::debug!(key = %key, dropped = before - messages.len(), "dropping extra system messages");
        }
        messages.insert(0, system);

        let session = self.registry.replace(key, |previous, epoch| Session {
            use_case: use_case.clone(),
            chat,
            messages,
            stop_reason: String::new(),
            loading: false,
            model_id: self.carried_model_id(previous),
            epoch,
        });
        self.publish(key);
        session
    }

    /// Cancels any generation for `key` and resets it to its system prompt.
    pub fn clear(&self, key: &SessionKey, use_case: &UseCase) -> Arc<Session> {
        let session = self.reset(key, Some(use_case));
        tracing::debug!(key = %key, "session cleared");
        session
    }

    /// Process-wide reset: drops every session and cancels every generation.
    pub fn reset_all(&self) {
        for key in self.registry.keys() {
            self.registry.cancel_generation(&key);
        }
        self.registry.clear();
    }

    pub async fn post(&self, key: &SessionKey, request: PostRequest) -> SessionResult<Arc<Session>> {
        let (snapshot, model, guard) =
            self.claim_generation(key, request.options.session_id.as_deref())?;
        let extra_data = request
            .uploaded_files
            .iter()
            .map(UploadedFile::to_extra_data)
            .collect::<Vec<_>>();

        self.write(key, snapshot.epoch, "post-append-turn", |session| {
            session
                .messages
                .push(Message::user(request.content).with_extra_data(extra_data));
            session.messages.push(Message::assistant_placeholder());
            session.loading = true;
        })?;

        self.generate(key, snapshot.epoch, model, request.options, guard)
            .await
    }

    /// Runs the generation routine directly, e.g. after a `max_tokens` stop.
    pub async fn continue_generation(
        &self,
        key: &SessionKey,
        options: GenerateOptions,
    ) -> SessionResult<Arc<Session>> {
        let (snapshot, model, guard) = self.claim_generation(key, options.session_id.as_deref())?;
        self.generate(key, snapshot.epoch, model, options, guard)
            .await
    }

    /// Resolves the model and registers a generation before any state changes.
    fn claim_generation(
        &self,
        key: &SessionKey,
        session_id: Option<&str>,
    ) -> SessionResult<(Arc<Session>, ModelDescriptor, GenerationGuard)> {
        let snapshot = self.snapshot(key).context(SessionMissingSnafu {
            stage: "generate-load-session",
            key: key.to_string(),
        })?;
        let model = self.resolve_model(key, &snapshot, session_id)?;
        let guard = self
            .registry
            .try_begin_generation(key)
            .context(GenerationInProgressSnafu {
                stage: "generate-claim",
                key: key.to_string(),
            })?;
        Ok((snapshot, model, guard))
    }

    async fn generate(
        &self,
        key: &SessionKey,
        epoch: u64,
        model: ModelDescriptor,
        options: GenerateOptions,
        mut guard: GenerationGuard,
    ) -> SessionResult<Arc<Session>> {
        let mut continuing = false;
        let started = self.write(key, epoch, "generate-start", |session| {
            continuing = is_continuation(&session.messages);
            if continuing {
                if let Some(last) = session.messages.last_mut() {
                    last.status = TurnStatus::Pending;
                }
            } else if !session.messages.last().is_some_and(Message::is_placeholder) {
                session.messages.push(Message::assistant_placeholder());
            }
            session.loading = true;
            session.stop_reason.clear();
        })?;
        let assistant_index = started.messages.len() - 1;

        let mut outgoing = select_history(&started.messages, continuing, options.ignore_history);
        if let Some(pre_process) = &options.pre_process {
            outgoing = pre_process(outgoing);
        }
        let request = InferenceRequest::new(
            model.clone(),
            outgoing.iter().map(Message::to_unrecorded).collect(),
            key.as_str(),
        );

        tracing::debug!(
            key = %key,
            model_id = %model.model_id,
            continuing,
            history_len = request.messages.len(),
            "starting generation"
        );
        self.stream_into(key, epoch, assistant_index, request, &mut guard)
            .await?;
        self.ensure_live(key, &mut guard, "generate-stream-finished")?;

        let finished = self.write(key, epoch, "generate-finish-content", |session| {
            let truncated = session.stop_reason == STOP_REASON_MAX_TOKENS;
            if let Some(message) = session.messages.get_mut(assistant_index) {
                let scrubbed = strip_output_tags(&message.content);
                message.content = match &options.post_process {
                    Some(post_process) => post_process(scrubbed),
                    None => scrubbed,
                };
                message.status = if truncated {
                    TurnStatus::Truncated
                } else {
                    TurnStatus::Complete
                };
                message.llm_type = Some(model.model_id.clone());
            }
        })?;

        let chat = match finished.chat.clone() {
            Some(chat) => chat,
            None => {
                let created = self.storage.create_chat().await;
                self.ensure_live(key, &mut guard, "generate-create-chat")?;
                let chat = created.context(PersistenceSnafu {
                    stage: "generate-create-chat",
                })?;
                self.write(key, epoch, "generate-attach-chat", |session| {
                    session.chat = Some(chat.clone());
                })?;
                chat
            }
        };
        if chat.title.trim().is_empty() {
            self.spawn_title_prediction(
                key.clone(),
                chat.id,
                model.clone(),
                finished.messages.clone(),
                options.on_list_changed.clone(),
            );
        }

        let mut to_persist = HashSet::new();
        if continuing
            && let Some(message_id) = finished
                .messages
                .get(assistant_index)
                .and_then(|message| message.message_id)
        {
            to_persist.insert(message_id);
        }
        let usecase = key.use_case().tag().to_string();
        let prepared = self.write(key, epoch, "generate-assign-ids", |session| {
            for message in session
                .messages
                .iter_mut()
                .filter(|message| message.role != Role::System && message.message_id.is_none())
            {
                let message_id = MessageId::new_v7();
                message.message_id = Some(message_id);
                message.usecase.get_or_insert_with(|| usecase.clone());
                to_persist.insert(message_id);
            }
        })?;

        let batch = prepared
            .messages
            .iter()
            .filter(|message| {
                message
                    .message_id
                    .is_some_and(|message_id| to_persist.contains(&message_id))
            })
            .filter_map(Message::to_record)
            .collect::<Vec<_>>();
        let persisted = self.storage.create_messages(chat.id, batch).await;
        self.ensure_live(key, &mut guard, "generate-persist-messages")?;
        let recorded = persisted.context(PersistenceSnafu {
            stage: "generate-persist-messages",
        })?;

        let session = self.write(key, epoch, "generate-apply-records", |session| {
            for record in recorded {
                if let Some(message) = session
                    .messages
                    .iter_mut()
                    .find(|message| message.message_id == Some(record.id))
                {
                    *message = Message::from_record(record);
                }
            }
            session.loading = false;
        })?;

        tracing::debug!(
            key = %key,
            chat_id = %chat.id,
            stop_reason = %session.stop_reason,
            "generation finished"
        );
        Ok(session)
    }

    async fn stream_into(
        &self,
        key: &SessionKey,
        epoch: u64,
        assistant_index: usize,
        request: InferenceRequest,
        guard: &mut GenerationGuard,
    ) -> SessionResult<()> {
        let ChunkStreamHandle { mut stream, worker } = self
            .endpoint
            .invoke_stream(request)
            .context(InferenceSnafu {
                stage: "generate-invoke-stream",
            })?;
        tokio::spawn(worker);

        let mut assembler = ChunkAssembler::new(self.flush_policy);
        let mut scrubber = OutputTagScrubber::new();
        loop {
            let event = tokio::select! {
                biased;
                _ = &mut guard.cancel_rx => {
                    stream.cancel();
                    tracing::debug!(key = %key, "generation cancelled mid-stream");
                    return GenerationCancelledSnafu {
                        stage: "generate-stream-cancelled",
                        key: key.to_string(),
                    }
                    .fail();
                }
                event = stream.recv() => event,
            };

            match event {
                Some(StreamEvent::Chunk(chunk)) => {
                    self.apply_chunk(key, epoch, assistant_index, &mut assembler, &mut scrubber, chunk)?;
                }
                Some(StreamEvent::Complete) | None => break,
                Some(StreamEvent::Failed(message)) => {
                    tracing::warn!(key = %key, error = %message, "inference stream failed");
                    return StreamFailedSnafu {
                        stage: "generate-stream-failed",
                        key: key.to_string(),
                        message,
                    }
                    .fail();
                }
            }
        }

        let mut rest = assembler
            .finish()
            .map(|rest| scrubber.push(&rest))
            .unwrap_or_default();
        rest.push_str(&scrubber.finish());
        self.append_content(key, epoch, assistant_index, rest)
    }

    fn apply_chunk(
        &self,
        key: &SessionKey,
        epoch: u64,
        assistant_index: usize,
        assembler: &mut ChunkAssembler,
        scrubber: &mut OutputTagScrubber,
        chunk: StreamingChunk,
    ) -> SessionResult<()> {
        if let Some(trace) = chunk.trace_text() {
            self.write(key, epoch, "generate-apply-trace", |session| {
                if let Some(message) = session.messages.get_mut(assistant_index) {
                    message
                        .trace
                        .get_or_insert_with(String::new)
                        .push_str(trace);
                }
            })?;
            self.emit(SessionEvent::Trace {
                key: key.clone(),
                text: trace.to_string(),
            });
        }

        if let Some(stop_reason) = chunk.stop_reason() {
            self.write(key, epoch, "generate-apply-stop-reason", |session| {
                session.stop_reason = stop_reason.to_string();
            })?;
            self.emit(SessionEvent::StopReason {
                key: key.clone(),
                stop_reason: stop_reason.to_string(),
            });
        }

        match assembler.push(&chunk.text) {
            Some(delta) => self.append_content(key, epoch, assistant_index, scrubber.push(&delta)),
            None => Ok(()),
        }
    }

    fn append_content(
        &self,
        key: &SessionKey,
        epoch: u64,
        assistant_index: usize,
        delta: String,
    ) -> SessionResult<()> {
        if delta.is_empty() {
            return Ok(());
        }
        self.write(key, epoch, "generate-append-content", |session| {
            if let Some(message) = session.messages.get_mut(assistant_index) {
                message.content.push_str(&delta);
            }
        })?;
        self.emit(SessionEvent::Delta {
            key: key.clone(),
            text: delta,
        });
        Ok(())
    }

    fn spawn_title_prediction(
        &self,
        key: SessionKey,
        chat_id: ChatId,
        model: ModelDescriptor,
        transcript: Vec<Message>,
        on_list_changed: Option<ListChanged>,
    ) {
        let manager = self.clone();
        tokio::spawn(async move {
            match manager
                .predict_title(&key, chat_id, model, transcript)
                .await
            {
                Ok(Some(chat)) => {
                    tracing::debug!(key = %key, chat_id = %chat_id, title = %chat.title, "chat titled");
                    if let Some(on_list_changed) = on_list_changed {
                        on_list_changed();
                    }
                }
                Ok(None) => {
                    tracing::debug!(key = %key, chat_id = %chat_id, "title prediction was empty");
                }
                Err(error) => {
                    tracing::warn!(key = %key, chat_id = %chat_id, error = %error, "title prediction failed");
                }
            }
        });
    }

    async fn predict_title(
        &self,
        key: &SessionKey,
        chat_id: ChatId,
        model: ModelDescriptor,
        transcript: Vec<Message>,
    ) -> SessionResult<Option<ChatRecord>> {
        let mut messages = vec![UnrecordedMessage::new(
            Role::System,
            self.templates.title_prompt(),
        )];
        messages.extend(
            transcript
                .iter()
                .filter(|message| message.role != Role::System)
                .map(|message| UnrecordedMessage::new(message.role, message.content.clone())),
        );

        let request = InferenceRequest::new(model, messages, format!("{key}#title"));
        let predicted = self
            .endpoint
            .predict(request)
            .await
            .context(InferenceSnafu {
                stage: "title-predict",
            })?;

        let title = predicted.trim().trim_matches('"').trim();
        if title.is_empty() {
            return Ok(None);
        }
        self.rename_chat(chat_id, title.to_string()).await.map(Some)
    }

    pub async fn send_feedback(
        &self,
        key: &SessionKey,
        update: FeedbackUpdate,
    ) -> SessionResult<Message> {
        let chat_id = self
            .snapshot(key)
            .context(SessionMissingSnafu {
                stage: "feedback-load-session",
                key: key.to_string(),
            })?
            .chat_id()
            .context(ChatNotPersistedSnafu {
                stage: "feedback-chat-id",
                key: key.to_string(),
            })?;

        let record = self
            .storage
            .update_feedback(chat_id, update)
            .await
            .context(PersistenceSnafu {
                stage: "feedback-update",
            })?;
        let message = Message::from_record(record);

        let mut replaced = false;
        self.registry.update_current(key, |session| {
            if let Some(slot) = session
                .messages
                .iter_mut()
                .find(|slot| slot.message_id == message.message_id)
            {
                *slot = message.clone();
                replaced = true;
            }
        });
        if !replaced {
            return MessageMissingSnafu {
                stage: "feedback-replace",
                key: key.to_string(),
                message_id: message
                    .message_id
                    .map(|message_id| message_id.to_string())
                    .unwrap_or_default(),
            }
            .fail();
        }

        self.publish(key);
        Ok(message)
    }

    pub fn push_message(
        &self,
        key: &SessionKey,
        role: TurnRole,
        content: impl Into<String>,
    ) -> SessionResult<Arc<Session>> {
        let message = Message::new(role.into(), content);
        let session = self
            .registry
            .update_current(key, |session| session.messages.push(message))
            .context(SessionMissingSnafu {
                stage: "push-message",
                key: key.to_string(),
            })?;
        self.publish(key);
        Ok(session)
    }

    /// Removes the last message; the system message is never popped.
    pub fn pop_message(&self, key: &SessionKey) -> Option<Message> {
        let mut popped = None;
        self.registry.update_current(key, |session| {
            if session.messages.len() > 1 {
                popped = session.messages.pop();
            }
        });
        if popped.is_some() {
            self.publish(key);
        }
        popped
    }

    pub fn update_system_context(
        &self,
        key: &SessionKey,
        system_context: impl Into<String>,
    ) -> SessionResult<Arc<Session>> {
        let system_context = system_context.into();
        let session = self
            .registry
            .update_current(key, |session| match session.messages.first_mut() {
                Some(first) if first.role == Role::System => first.content = system_context,
                _ => session.messages.insert(0, Message::system(system_context)),
            })
            .context(SessionMissingSnafu {
                stage: "update-system-context",
                key: key.to_string(),
            })?;
        self.publish(key);
        Ok(session)
    }

    pub fn current_system_context(&self, key: &SessionKey) -> Option<String> {
        self.snapshot(key)
            .and_then(|session| session.system_context().map(ToString::to_string))
    }

    /// Caller-side rollback after a failed turn: drop the placeholder, show `diagnostic`.
    pub fn recover_failed_turn(
        &self,
        key: &SessionKey,
        diagnostic: impl Into<String>,
    ) -> SessionResult<Arc<Session>> {
        self.registry.cancel_generation(key);
        let diagnostic = Message::assistant(diagnostic);
        let session = self
            .registry
            .update_current(key, |session| {
                if session
                    .messages
                    .last()
                    .is_some_and(|last| last.role == Role::Assistant && last.message_id.is_none())
                {
                    session.messages.pop();
                }
                session.messages.push(diagnostic);
                session.loading = false;
            })
            .context(SessionMissingSnafu {
                stage: "recover-failed-turn",
                key: key.to_string(),
            })?;
        self.publish(key);
        Ok(session)
    }

    /// Loads a persisted chat and installs it at `key`.
    pub async fn load_history(
        &self,
        key: &SessionKey,
        use_case: &UseCase,
        chat_id: ChatId,
    ) -> SessionResult<Arc<Session>> {
        let chat = self
            .storage
            .find_chat_by_id(chat_id)
            .await
            .context(PersistenceSnafu {
                stage: "load-history-find-chat",
            })?
            .context(ChatMissingSnafu {
                stage: "load-history-find-chat",
                chat_id: chat_id.to_string(),
            })?;
        let records = self
            .storage
            .list_messages(chat_id)
            .await
            .context(PersistenceSnafu {
                stage: "load-history-list-messages",
            })?;

        let messages = records.into_iter().map(Message::from_record).collect();
        Ok(self.restore(key, use_case, messages, Some(chat)))
    }

    pub async fn list_chats(&self) -> SessionResult<Vec<ChatRecord>> {
        self.storage.list_chats().await.context(PersistenceSnafu {
            stage: "list-chats",
        })
    }

    /// Renames a chat and updates every live session holding it.
    pub async fn rename_chat(&self, chat_id: ChatId, title: String) -> SessionResult<ChatRecord> {
        let chat = self
            .storage
            .update_title(chat_id, title)
            .await
            .context(PersistenceSnafu {
                stage: "rename-chat",
            })?;

        for key in self.registry.keys_holding_chat(chat_id) {
            self.registry.update_current(&key, |session| {
                session.chat = Some(chat.clone());
            });
            self.publish(&key);
        }
        self.emit(SessionEvent::TitleChanged {
            chat_id,
            title: chat.title.clone(),
        });
        Ok(chat)
    }

    /// Deletes a chat and resets every live session holding it.
    pub async fn delete_chat(&self, chat_id: ChatId) -> SessionResult<()> {
        self.storage
            .delete_chat(chat_id)
            .await
            .context(PersistenceSnafu {
                stage: "delete-chat",
            })?;

        for key in self.registry.keys_holding_chat(chat_id) {
            self.reset(&key, None);
        }
        tracing::debug!(chat_id = %chat_id, "chat deleted");
        Ok(())
    }

    pub fn snapshot(&self, key: &SessionKey) -> Option<Arc<Session>> {
        self.registry.get(key)
    }

    pub fn loading(&self, key: &SessionKey) -> bool {
        self.snapshot(key).is_some_and(|session| session.loading)
    }

    /// Messages without the system prompt.
    pub fn messages(&self, key: &SessionKey) -> Vec<Message> {
        self.snapshot(key)
            .map(|session| session.visible_messages().to_vec())
            .unwrap_or_default()
    }

    pub fn raw_messages(&self, key: &SessionKey) -> Vec<Message> {
        self.snapshot(key)
            .map(|session| session.messages.clone())
            .unwrap_or_default()
    }

    pub fn is_empty(&self, key: &SessionKey) -> bool {
        self.snapshot(key)
            .is_none_or(|session| session.visible_messages().is_empty())
    }

    pub fn model_id(&self, key: &SessionKey) -> Option<String> {
        self.snapshot(key).and_then(|session| session.model_id.clone())
    }

    pub fn set_model_id(&self, key: &SessionKey, model_id: impl Into<String>) -> SessionResult<()> {
        let model_id = model_id.into();
        self.registry
            .update_current(key, |session| session.model_id = Some(model_id))
            .context(SessionMissingSnafu {
                stage: "set-model-id",
                key: key.to_string(),
            })?;
        self.publish(key);
        Ok(())
    }

    pub fn stop_reason(&self, key: &SessionKey) -> String {
        self.snapshot(key)
            .map(|session| session.stop_reason.clone())
            .unwrap_or_default()
    }

    pub fn chat(&self, key: &SessionKey) -> Option<ChatRecord> {
        self.snapshot(key).and_then(|session| session.chat.clone())
    }

    fn resolve_model(
        &self,
        key: &SessionKey,
        session: &Session,
        session_id: Option<&str>,
    ) -> SessionResult<ModelDescriptor> {
        let Some(model_id) = session.model_id.as_deref() else {
            tracing::warn!(key = %key, "no model selected; generation skipped");
            return ModelNotSelectedSnafu {
                stage: "generate-resolve-model",
                key: key.to_string(),
            }
            .fail();
        };

        let Some(mut descriptor) = self.catalog.resolve(model_id) else {
            tracing::warn!(key = %key, model_id = %model_id, "unknown model; generation skipped");
            return UnknownModelSnafu {
                stage: "generate-resolve-model",
                key: key.to_string(),
                model_id: model_id.to_string(),
            }
            .fail();
        };

        descriptor.session_id = session_id.map(ToString::to_string);
        Ok(descriptor)
    }

    fn ensure_live(
        &self,
        key: &SessionKey,
        guard: &mut GenerationGuard,
        stage: &'static str,
    ) -> SessionResult<()> {
        if guard.is_cancelled() {
            tracing::debug!(key = %key, stage, "generation cancelled between steps");
            return GenerationCancelledSnafu {
                stage,
                key: key.to_string(),
            }
            .fail();
        }
        Ok(())
    }

    /// Epoch-guarded write from a generation; a reset session yields `GenerationCancelled`.
    fn write<F>(
        &self,
        key: &SessionKey,
        epoch: u64,
        stage: &'static str,
        mutate: F,
    ) -> SessionResult<Arc<Session>>
    where
        F: FnOnce(&mut Session),
    {
        let session = self
            .registry
            .update(key, epoch, mutate)
            .context(GenerationCancelledSnafu {
                stage,
                key: key.to_string(),
            })?;
        self.publish(key);
        Ok(session)
    }

    /// Resets `key` to its system prompt, keeping its use case unless one is given.
    fn reset(&self, key: &SessionKey, use_case: Option<&UseCase>) -> Arc<Session> {
        let session = self.registry.replace(key, |previous, epoch| {
            let use_case = use_case
                .cloned()
                .or_else(|| previous.map(|previous| previous.use_case.clone()))
                .unwrap_or_else(|| key.use_case());
            self.fresh_session(&use_case, previous, epoch)
        });
        self.publish(key);
        session
    }

    fn fresh_session(&self, use_case: &UseCase, previous: Option<&Session>, epoch: u64) -> Session {
        Session::new(
            use_case.clone(),
            self.templates.system_context(use_case),
            self.carried_model_id(previous),
            epoch,
        )
    }

    fn carried_model_id(&self, previous: Option<&Session>) -> Option<String> {
        previous
            .and_then(|previous| previous.model_id.clone())
            .or_else(|| self.default_model_id.clone())
    }

    fn publish(&self, key: &SessionKey) {
        self.emit(SessionEvent::Updated { key: key.clone() });
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use gencase_llm::{Model, STOP_REASON_END_TURN, Script, ScriptEnd, ScriptedEndpoint};
    use gencase_storage::{
        BoxFuture, ChatStore, CompletionState, Feedback, FeedbackRating, MemoryStorage,
        MessageRole, MessageStore, RecordedMessage, StorageResult, ToBeRecordedMessage,
    };
    use tokio::sync::{Notify, Semaphore};

    use super::*;
    use crate::error::SessionError;
    use crate::prompt::strip_assistant_footnotes;

    const MODEL: &str = "test-model";

    struct Fixture {
        manager: ChatSessionManager,
        endpoint: Arc<ScriptedEndpoint>,
        storage: Arc<MemoryStorage>,
        key: SessionKey,
    }

    fn fixture() -> Fixture {
        let endpoint = Arc::new(ScriptedEndpoint::new());
        let storage = Arc::new(MemoryStorage::new());
        let manager = ChatSessionManager::new(endpoint.clone(), storage.clone())
            .with_catalog(ModelCatalog::new(vec![Model::from_id(MODEL)]))
            .with_default_model(MODEL);
        let key = SessionKey::from("/chat");
        manager.init(&key, &UseCase::Chat);

        Fixture {
            manager,
            endpoint,
            storage,
            key,
        }
    }

    fn contents(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|message| message.content.as_str()).collect()
    }

    fn system_count(messages: &[Message]) -> usize {
        messages
            .iter()
            .filter(|message| message.role == Role::System)
            .count()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("condition reached in time");
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum GatedCall {
        CreateChat,
        CreateMessages,
    }

    /// Memory storage that parks one kind of call until the test opens the gate.
    struct GatedStorage {
        inner: MemoryStorage,
        gate: GatedCall,
        reached: Notify,
        release: Semaphore,
    }

    impl GatedStorage {
        fn new(gate: GatedCall) -> Self {
            Self {
                inner: MemoryStorage::new(),
                gate,
                reached: Notify::new(),
                release: Semaphore::new(0),
            }
        }

        async fn pass(&self, call: GatedCall) {
            if call == self.gate {
                self.reached.notify_one();
                self.release.acquire().await.expect("gate open").forget();
            }
        }

        async fn wait_until_parked(&self) {
            tokio::time::timeout(Duration::from_secs(5), self.reached.notified())
                .await
                .expect("storage call parked in time");
        }

        fn open(&self) {
            self.release.add_permits(1);
        }
    }

    impl ChatStore for GatedStorage {
        fn create_chat(&self) -> BoxFuture<'_, StorageResult<ChatRecord>> {
            Box::pin(async move {
                self.pass(GatedCall::CreateChat).await;
                self.inner.create_chat().await
            })
        }

        fn find_chat_by_id(&self, chat_id: ChatId) -> BoxFuture<'_, StorageResult<Option<ChatRecord>>> {
            self.inner.find_chat_by_id(chat_id)
        }

        fn list_chats(&self) -> BoxFuture<'_, StorageResult<Vec<ChatRecord>>> {
            self.inner.list_chats()
        }

        fn update_title(&self, chat_id: ChatId, title: String) -> BoxFuture<'_, StorageResult<ChatRecord>> {
            self.inner.update_title(chat_id, title)
        }

        fn delete_chat(&self, chat_id: ChatId) -> BoxFuture<'_, StorageResult<()>> {
            self.inner.delete_chat(chat_id)
        }
    }

    impl MessageStore for GatedStorage {
        fn create_messages(
            &self,
            chat_id: ChatId,
            messages: Vec<ToBeRecordedMessage>,
        ) -> BoxFuture<'_, StorageResult<Vec<RecordedMessage>>> {
            Box::pin(async move {
                self.pass(GatedCall::CreateMessages).await;
                self.inner.create_messages(chat_id, messages).await
            })
        }

        fn list_messages(&self, chat_id: ChatId) -> BoxFuture<'_, StorageResult<Vec<RecordedMessage>>> {
            self.inner.list_messages(chat_id)
        }

        fn update_feedback(
            &self,
            chat_id: ChatId,
            update: FeedbackUpdate,
        ) -> BoxFuture<'_, StorageResult<RecordedMessage>> {
            self.inner.update_feedback(chat_id, update)
        }
    }

    fn gated_fixture(
        gate: GatedCall,
    ) -> (ChatSessionManager, Arc<ScriptedEndpoint>, Arc<GatedStorage>, SessionKey) {
        let endpoint = Arc::new(ScriptedEndpoint::new());
        let storage = Arc::new(GatedStorage::new(gate));
        let manager = ChatSessionManager::new(endpoint.clone(), storage.clone())
            .with_catalog(ModelCatalog::new(vec![Model::from_id(MODEL)]))
            .with_default_model(MODEL);
        let key = SessionKey::from("/chat");
        manager.init(&key, &UseCase::Chat);
        (manager, endpoint, storage, key)
    }

    fn spawn_post(
        manager: &ChatSessionManager,
        key: &SessionKey,
        content: &str,
    ) -> tokio::task::JoinHandle<SessionResult<Arc<Session>>> {
        let manager = manager.clone();
        let key = key.clone();
        let request = PostRequest::new(content);
        tokio::spawn(async move { manager.post(&key, request).await })
    }

    fn assert_system_only(manager: &ChatSessionManager, key: &SessionKey) {
        let raw = manager.raw_messages(key);
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].role, Role::System);
        assert!(!manager.loading(key));
        assert_eq!(manager.chat(key), None);
    }

    async fn next_title(events: &mut broadcast::Receiver<SessionEvent>) -> String {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::TitleChanged { title, .. }) => return title,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("title event in time")
    }

    #[tokio::test]
    async fn posted_turn_shows_user_and_empty_placeholder_before_chunks() {
        let Fixture {
            manager,
            endpoint,
            key,
            ..
        } = fixture();
        endpoint.push_script(Script::hanging());

        let task = tokio::spawn({
            let manager = manager.clone();
            let key = key.clone();
            async move { manager.post(&key, PostRequest::new("hello")).await }
        });
        wait_until(|| endpoint.stream_requests().len() == 1).await;

        let messages = manager.messages(&key);
        assert_eq!(contents(&messages), vec!["hello", ""]);
        assert_eq!(messages[0].role, Role::User);
        assert!(messages[1].is_placeholder());
        assert!(manager.loading(&key));

        manager.clear(&key, &UseCase::Chat);
        let outcome = task.await.expect("post task joins");
        assert!(matches!(outcome, Err(SessionError::GenerationCancelled { .. })));
    }

    #[tokio::test]
    async fn single_char_chunks_assemble_in_two_flushes() {
        let Fixture {
            manager,
            endpoint,
            key,
            ..
        } = fixture();
        endpoint.push_script(Script::texts([
            "a", "b", "c", "d", "e", "f", "g", "h", "i", "j", "k",
        ]));
        let mut events = manager.subscribe();

        let session = manager
            .post(&key, PostRequest::new("alphabet"))
            .await
            .expect("generation succeeds");

        let mut deltas = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::Delta { text, .. } = event {
                deltas.push(text);
            }
        }
        assert_eq!(deltas, vec!["abcdefghij".to_string(), "k".to_string()]);
        assert_eq!(
            session.messages.last().map(|message| message.content.as_str()),
            Some("abcdefghijk")
        );
    }

    #[tokio::test]
    async fn end_to_end_turn_persists_both_messages_and_predicts_a_title() {
        let Fixture {
            manager,
            endpoint,
            storage,
            key,
        } = fixture();
        endpoint.push_script(Script::new(vec![
            StreamingChunk::text("4"),
            StreamingChunk::text("").with_stop_reason(STOP_REASON_END_TURN),
        ]));
        endpoint.push_prediction("Simple arithmetic");
        let list_changes = Arc::new(AtomicUsize::new(0));
        let mut events = manager.subscribe();

        let options = GenerateOptions::default().with_on_list_changed({
            let list_changes = list_changes.clone();
            move || {
                list_changes.fetch_add(1, Ordering::SeqCst);
            }
        });
        let session = manager
            .post(&key, PostRequest::new("2+2?").with_options(options))
            .await
            .expect("generation succeeds");

        assert!(!session.loading);
        assert_eq!(session.stop_reason, STOP_REASON_END_TURN);
        let assistant = session.messages.last().expect("assistant turn");
        assert_eq!(assistant.content, "4");
        assert_eq!(assistant.status, TurnStatus::Complete);
        assert_eq!(assistant.llm_type.as_deref(), Some(MODEL));

        let chat = session.chat.clone().expect("chat created");
        let recorded = storage.list_messages(chat.id).await.expect("listed");
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0].role, MessageRole::User);
        assert_eq!(recorded[1].role, MessageRole::Assistant);
        assert_ne!(recorded[0].id, recorded[1].id);
        assert_eq!(recorded[0].usecase.as_deref(), Some("chat"));
        let in_memory_ids = session
            .visible_messages()
            .iter()
            .map(|message| message.message_id)
            .collect::<Vec<_>>();
        assert_eq!(in_memory_ids, vec![Some(recorded[0].id), Some(recorded[1].id)]);

        let request = &endpoint.stream_requests()[0];
        assert_eq!(request.model.model_id, MODEL);
        assert_eq!(request.messages.len(), 2);
        assert_eq!(request.messages[1].content, "2+2?");

        assert_eq!(next_title(&mut events).await, "Simple arithmetic");
        wait_until(|| list_changes.load(Ordering::SeqCst) == 1).await;
        assert_eq!(
            manager.chat(&key).map(|chat| chat.title),
            Some("Simple arithmetic".to_string())
        );
    }

    #[tokio::test]
    async fn truncated_turn_is_continued_by_appending() {
        let Fixture {
            manager,
            endpoint,
            storage,
            key,
        } = fixture();
        let chat = storage.create_chat().await.expect("chat");
        storage
            .update_title(chat.id, "Essay".to_string())
            .await
            .expect("titled");
        let user_id = MessageId::new_v7();
        let assistant_id = MessageId::new_v7();
        storage
            .create_messages(
                chat.id,
                vec![
                    ToBeRecordedMessage {
                        id: user_id,
                        role: MessageRole::User,
                        content: "write an essay".to_string(),
                        extra_data: Vec::new(),
                        trace: None,
                        llm_type: None,
                        usecase: Some("chat".to_string()),
                        completion: CompletionState::Complete,
                    },
                    ToBeRecordedMessage {
                        id: assistant_id,
                        role: MessageRole::Assistant,
                        content: "The first part  \n".to_string(),
                        extra_data: Vec::new(),
                        trace: None,
                        llm_type: Some(MODEL.to_string()),
                        usecase: Some("chat".to_string()),
                        completion: CompletionState::Truncated,
                    },
                ],
            )
            .await
            .expect("seeded");
        manager
            .load_history(&key, &UseCase::Chat, chat.id)
            .await
            .expect("history loaded");
        endpoint.push_script(Script::texts(["and the rest."]));

        let session = manager
            .continue_generation(&key, GenerateOptions::default())
            .await
            .expect("continuation succeeds");

        let request = &endpoint.stream_requests()[0];
        let sent = request.messages.last().expect("trailing assistant turn");
        assert_eq!(sent.role, Role::Assistant);
        assert_eq!(sent.content, "The first part");

        let assistant = session.messages.last().expect("assistant");
        assert_eq!(assistant.message_id, Some(assistant_id));
        assert_eq!(assistant.content, "The first part  \nand the rest.");
        assert_eq!(assistant.status, TurnStatus::Complete);

        let recorded = storage.list_messages(chat.id).await.expect("listed");
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[1].content, "The first part  \nand the rest.");
        assert_eq!(recorded[1].completion, CompletionState::Complete);
    }

    #[tokio::test]
    async fn max_tokens_marks_the_turn_truncated() {
        let Fixture {
            manager,
            endpoint,
            key,
            ..
        } = fixture();
        endpoint.push_script(Script::new(vec![
            StreamingChunk::text("cut o"),
            StreamingChunk::stop(STOP_REASON_MAX_TOKENS),
        ]));

        let session = manager
            .post(&key, PostRequest::new("long please"))
            .await
            .expect("generation succeeds");

        assert_eq!(manager.stop_reason(&key), STOP_REASON_MAX_TOKENS);
        let assistant = session.messages.last().expect("assistant");
        assert_eq!(assistant.status, TurnStatus::Truncated);
        assert!(is_continuation(&session.messages));
    }

    #[tokio::test]
    async fn system_message_stays_single_and_first() {
        let Fixture { manager, key, .. } = fixture();
        let check = |manager: &ChatSessionManager| {
            let raw = manager.raw_messages(&key);
            assert_eq!(system_count(&raw), 1);
            assert_eq!(raw[0].role, Role::System);
        };

        check(&manager);
        manager.init(&key, &UseCase::Chat);
        check(&manager);
        manager.restore(&key, &UseCase::Chat, vec![Message::user("no system")], None);
        check(&manager);
        manager.restore(
            &key,
            &UseCase::Chat,
            vec![Message::system("custom"), Message::user("hi")],
            None,
        );
        check(&manager);
        assert_eq!(manager.current_system_context(&key).as_deref(), Some("custom"));
        manager.restore(
            &key,
            &UseCase::Rag,
            vec![
                Message::user("q"),
                Message::system("late"),
                Message::assistant("a"),
                Message::system("later"),
            ],
            None,
        );
        check(&manager);
        assert_eq!(manager.current_system_context(&key).as_deref(), Some("late"));
        assert_eq!(contents(&manager.messages(&key)), vec!["q", "a"]);
        manager
            .push_message(&key, TurnRole::Assistant, "note")
            .expect("session exists");
        check(&manager);
        manager.clear(&key, &UseCase::Chat);
        check(&manager);
        assert!(manager.is_empty(&key));
        assert_eq!(manager.pop_message(&key), None);
        check(&manager);
    }

    #[tokio::test]
    async fn restore_resets_other_sessions_holding_the_chat() {
        let Fixture {
            manager, storage, ..
        } = fixture();
        let chat = storage.create_chat().await.expect("chat");
        let first = SessionKey::from("/chat");
        let second = SessionKey::for_chat(chat.id);

        manager.restore(
            &first,
            &UseCase::Chat,
            vec![Message::user("q"), Message::assistant("a")],
            Some(chat.clone()),
        );
        manager.restore(
            &second,
            &UseCase::Chat,
            vec![Message::user("q"), Message::assistant("a")],
            Some(chat.clone()),
        );

        assert!(manager.is_empty(&first));
        assert_eq!(manager.chat(&first), None);
        assert_eq!(system_count(&manager.raw_messages(&first)), 1);
        assert_eq!(manager.chat(&second).map(|chat| chat.id), Some(chat.id));
        assert_eq!(contents(&manager.messages(&second)), vec!["q", "a"]);
    }

    #[tokio::test]
    async fn ignore_history_sends_system_and_current_turn_only() {
        let Fixture {
            manager,
            endpoint,
            key,
            ..
        } = fixture();
        manager.restore(
            &key,
            &UseCase::Chat,
            vec![
                Message::user("u1"),
                Message::assistant("a1"),
                Message::user("u2"),
                Message::assistant("a2"),
            ],
            None,
        );
        endpoint.push_script(Script::texts(["a3"]));

        manager
            .post(
                &key,
                PostRequest::new("u3")
                    .with_options(GenerateOptions::default().with_ignore_history(true)),
            )
            .await
            .expect("generation succeeds");

        let request = &endpoint.stream_requests()[0];
        let sent = request
            .messages
            .iter()
            .map(|message| (message.role, message.content.as_str()))
            .collect::<Vec<_>>();
        let system = manager.current_system_context(&key).expect("system");
        assert_eq!(sent, vec![(Role::System, system.as_str()), (Role::User, "u3")]);
    }

    #[tokio::test]
    async fn missing_or_unknown_model_is_a_configuration_error() {
        let endpoint = Arc::new(ScriptedEndpoint::new());
        let manager = ChatSessionManager::new(endpoint.clone(), Arc::new(MemoryStorage::new()))
            .with_catalog(ModelCatalog::new(vec![Model::from_id(MODEL)]));
        let key = SessionKey::from("/chat");
        manager.init(&key, &UseCase::Chat);

        let before = manager.raw_messages(&key);

        let error = manager
            .post(&key, PostRequest::new("first"))
            .await
            .expect_err("no model selected");
        assert!(matches!(error, SessionError::ModelNotSelected { .. }));
        assert!(error.is_configuration());
        assert!(!manager.loading(&key));
        assert_eq!(manager.raw_messages(&key), before);

        manager.set_model_id(&key, "retired-model").expect("session exists");
        let error = manager
            .post(&key, PostRequest::new("first"))
            .await
            .expect_err("unknown model");
        assert!(matches!(error, SessionError::UnknownModel { .. }));
        assert!(!manager.loading(&key));
        assert_eq!(manager.raw_messages(&key), before);
        assert!(endpoint.stream_requests().is_empty());

        manager.set_model_id(&key, MODEL).expect("session exists");
        endpoint.push_script(Script::texts(["ok"]));
        manager
            .post(&key, PostRequest::new("second"))
            .await
            .expect("generation succeeds");
        let sent = endpoint.stream_requests()[0]
            .messages
            .iter()
            .map(|message| message.role)
            .collect::<Vec<_>>();
        assert_eq!(sent, vec![Role::System, Role::User]);
    }

    #[tokio::test]
    async fn failed_stream_propagates_and_can_be_recovered() {
        let Fixture {
            manager,
            endpoint,
            key,
            ..
        } = fixture();
        endpoint.push_script(
            Script::texts(["par"]).ending(ScriptEnd::Fail("connection reset".to_string())),
        );

        let error = manager
            .post(&key, PostRequest::new("hi"))
            .await
            .expect_err("stream fails");
        assert!(matches!(error, SessionError::StreamFailed { .. }));
        assert!(manager.loading(&key));

        let session = manager
            .recover_failed_turn(&key, "Something went wrong.")
            .expect("session exists");
        assert!(!session.loading);
        assert_eq!(contents(session.visible_messages()), vec!["hi", "Something went wrong."]);
    }

    #[tokio::test]
    async fn trace_output_tags_and_post_process_are_applied() {
        let Fixture {
            manager,
            endpoint,
            key,
            ..
        } = fixture();
        endpoint.push_script(Script::new(vec![
            StreamingChunk::trace("searching docs; "),
            StreamingChunk::text("<output>Answer"),
            StreamingChunk::trace("ranking"),
            StreamingChunk::text("</output>"),
        ]));
        let options = GenerateOptions::default()
            .with_post_process(|content| format!("{content}\n\n[^1]: source.pdf"))
            .with_session_id("kb-1");

        let session = manager
            .post(&key, PostRequest::new("question").with_options(options))
            .await
            .expect("generation succeeds");

        let assistant = session.messages.last().expect("assistant");
        assert_eq!(assistant.content, "Answer\n\n[^1]: source.pdf");
        assert_eq!(assistant.trace.as_deref(), Some("searching docs; ranking"));
        assert_eq!(
            endpoint.stream_requests()[0].model.session_id.as_deref(),
            Some("kb-1")
        );
    }

    #[tokio::test]
    async fn pre_process_rewrites_outgoing_history_only() {
        let Fixture {
            manager,
            endpoint,
            key,
            ..
        } = fixture();
        manager.restore(
            &key,
            &UseCase::Rag,
            vec![Message::user("q1"), Message::assistant("a1[^1]\n[^1]: doc.pdf")],
            None,
        );
        endpoint.push_script(Script::texts(["a2"]));

        let session = manager
            .post(
                &key,
                PostRequest::new("q2").with_options(
                    GenerateOptions::default().with_pre_process(strip_assistant_footnotes),
                ),
            )
            .await
            .expect("generation succeeds");

        assert_eq!(endpoint.stream_requests()[0].messages[2].content, "a1");
        assert_eq!(session.messages[2].content, "a1[^1]\n[^1]: doc.pdf");
        assert_eq!(session.messages[2].usecase.as_deref(), Some("chat"));
    }

    #[tokio::test]
    async fn feedback_replaces_the_message_in_place() {
        let Fixture {
            manager,
            endpoint,
            key,
            ..
        } = fixture();
        endpoint.push_script(Script::texts(["fine"]));
        let session = manager
            .post(&key, PostRequest::new("rate me"))
            .await
            .expect("generation succeeds");
        let message_id = session
            .messages
            .last()
            .and_then(|message| message.message_id)
            .expect("persisted id");

        let updated = manager
            .send_feedback(
                &key,
                FeedbackUpdate {
                    message_id,
                    feedback: Feedback::new(FeedbackRating::Good),
                },
            )
            .await
            .expect("feedback stored");

        assert_eq!(updated.feedback, Some(Feedback::new(FeedbackRating::Good)));
        assert_eq!(
            manager.messages(&key).last().and_then(|message| message.feedback.clone()),
            Some(Feedback::new(FeedbackRating::Good))
        );
    }

    #[tokio::test]
    async fn feedback_needs_a_persisted_chat() {
        let Fixture { manager, key, .. } = fixture();

        let error = manager
            .send_feedback(
                &key,
                FeedbackUpdate {
                    message_id: MessageId::new_v7(),
                    feedback: Feedback::new(FeedbackRating::Bad),
                },
            )
            .await
            .expect_err("no chat yet");
        assert!(matches!(error, SessionError::ChatNotPersisted { .. }));
    }

    #[tokio::test]
    async fn deleting_a_chat_resets_sessions_holding_it() {
        let Fixture {
            manager,
            endpoint,
            key,
            ..
        } = fixture();
        endpoint.push_script(Script::texts(["hello there"]));
        let session = manager
            .post(&key, PostRequest::new("hi"))
            .await
            .expect("generation succeeds");
        let chat_id = session.chat_id().expect("chat created");

        manager.delete_chat(chat_id).await.expect("deleted");

        assert!(manager.is_empty(&key));
        assert_eq!(manager.chat(&key), None);
        assert_eq!(manager.model_id(&key).as_deref(), Some(MODEL));
        assert!(manager.list_chats().await.expect("listed").is_empty());
    }

    #[tokio::test]
    async fn push_and_pop_manage_transient_messages() {
        let Fixture { manager, key, .. } = fixture();

        manager
            .push_message(&key, TurnRole::Assistant, "Searching...")
            .expect("session exists");
        assert_eq!(contents(&manager.messages(&key)), vec!["Searching..."]);

        let popped = manager.pop_message(&key).expect("popped");
        assert_eq!(popped.content, "Searching...");
        assert!(manager.is_empty(&key));

        let missing = SessionKey::from("/never-initialized");
        assert!(manager.push_message(&missing, TurnRole::User, "x").is_err());
    }

    #[tokio::test]
    async fn reset_all_drops_sessions_and_cancels_streams() {
        let Fixture {
            manager,
            endpoint,
            key,
            ..
        } = fixture();
        endpoint.push_script(Script::hanging());

        let task = tokio::spawn({
            let manager = manager.clone();
            let key = key.clone();
            async move { manager.post(&key, PostRequest::new("hello")).await }
        });
        wait_until(|| endpoint.stream_requests().len() == 1).await;

        manager.reset_all();

        let outcome = task.await.expect("post task joins");
        assert!(matches!(outcome, Err(SessionError::GenerationCancelled { .. })));
        assert!(manager.snapshot(&key).is_none());
    }

    #[tokio::test]
    async fn post_is_refused_while_a_reply_is_streaming() {
        let Fixture {
            manager,
            endpoint,
            storage,
            key,
        } = fixture();
        endpoint.push_script(Script::hanging());
        let first = spawn_post(&manager, &key, "u1");
        wait_until(|| endpoint.stream_requests().len() == 1).await;

        let error = manager
            .post(&key, PostRequest::new("u2"))
            .await
            .expect_err("reply still streaming");
        assert!(matches!(error, SessionError::GenerationInProgress { .. }));
        assert!(error.is_rejection());
        let error = manager
            .continue_generation(&key, GenerateOptions::default())
            .await
            .expect_err("reply still streaming");
        assert!(matches!(error, SessionError::GenerationInProgress { .. }));
        assert_eq!(contents(&manager.messages(&key)), vec!["u1", ""]);
        assert_eq!(endpoint.stream_requests().len(), 1);

        manager.clear(&key, &UseCase::Chat);
        let outcome = first.await.expect("post task joins");
        assert!(matches!(outcome, Err(SessionError::GenerationCancelled { .. })));

        endpoint.push_script(Script::texts(["a2"]));
        let session = manager
            .post(&key, PostRequest::new("u2"))
            .await
            .expect("generation succeeds");
        let sent = endpoint.stream_requests()[1]
            .messages
            .iter()
            .map(|message| (message.role, message.content.clone()))
            .collect::<Vec<_>>();
        assert_eq!(sent[1..], [(Role::User, "u2".to_string())]);

        let chat_id = session.chat_id().expect("chat created");
        let recorded = storage.list_messages(chat_id).await.expect("listed");
        let persisted = recorded
            .iter()
            .map(|record| (record.role, record.content.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(
            persisted,
            vec![(MessageRole::User, "u2"), (MessageRole::Assistant, "a2")]
        );
    }

    #[tokio::test]
    async fn post_is_refused_while_the_previous_turn_is_persisting() {
        let (manager, endpoint, storage, key) = gated_fixture(GatedCall::CreateMessages);
        endpoint.push_script(Script::texts(["a1"]));
        let first = spawn_post(&manager, &key, "u1");
        storage.wait_until_parked().await;

        let error = manager
            .post(&key, PostRequest::new("u2"))
            .await
            .expect_err("previous turn still persisting");
        assert!(matches!(error, SessionError::GenerationInProgress { .. }));

        storage.open();
        let session = first
            .await
            .expect("post task joins")
            .expect("first turn completes");
        assert_eq!(contents(session.visible_messages()), vec!["u1", "a1"]);
        let chat_id = session.chat_id().expect("chat created");
        assert_eq!(storage.list_messages(chat_id).await.expect("listed").len(), 2);
    }

    #[tokio::test]
    async fn clear_while_persisting_messages_keeps_the_session_reset() {
        let (manager, endpoint, storage, key) = gated_fixture(GatedCall::CreateMessages);
        endpoint.push_script(Script::texts(["late answer"]));
        let task = spawn_post(&manager, &key, "hello");
        storage.wait_until_parked().await;

        let cleared = manager.clear(&key, &UseCase::Chat);
        storage.open();

        let outcome = task.await.expect("post task joins");
        assert!(matches!(outcome, Err(SessionError::GenerationCancelled { .. })));
        assert_system_only(&manager, &key);
        assert_eq!(manager.snapshot(&key).map(|session| session.epoch), Some(cleared.epoch));
    }

    #[tokio::test]
    async fn clear_while_creating_the_chat_keeps_the_session_reset() {
        let (manager, endpoint, storage, key) = gated_fixture(GatedCall::CreateChat);
        endpoint.push_script(Script::texts(["late answer"]));
        let task = spawn_post(&manager, &key, "hello");
        storage.wait_until_parked().await;

        manager.clear(&key, &UseCase::Chat);
        storage.open();

        let outcome = task.await.expect("post task joins");
        assert!(matches!(outcome, Err(SessionError::GenerationCancelled { .. })));
        assert_system_only(&manager, &key);
        for chat in storage.list_chats().await.expect("listed") {
            assert!(storage.list_messages(chat.id).await.expect("listed").is_empty());
        }
        assert!(endpoint.predict_requests().is_empty());
    }

    #[tokio::test]
    async fn deleting_the_chat_while_persisting_cancels_the_turn() {
        let (manager, endpoint, storage, key) = gated_fixture(GatedCall::CreateMessages);
        endpoint.push_script(Script::texts(["late answer"]));
        let task = spawn_post(&manager, &key, "hello");
        storage.wait_until_parked().await;
        let chat_id = manager.chat(&key).map(|chat| chat.id).expect("chat attached");

        manager.delete_chat(chat_id).await.expect("deleted");
        storage.open();

        let outcome = task.await.expect("post task joins");
        assert!(matches!(outcome, Err(SessionError::GenerationCancelled { .. })));
        assert_system_only(&manager, &key);
        assert_eq!(storage.find_chat_by_id(chat_id).await.expect("queried"), None);
    }

    #[tokio::test]
    async fn streamed_deltas_never_show_output_tags() {
        let Fixture {
            manager,
            endpoint,
            key,
            ..
        } = fixture();
        endpoint.push_script(Script::texts([
            "<out",
            "put>Hello wor",
            "ld, fine</outp",
            "ut>",
        ]));
        let mut events = manager.subscribe();

        let session = manager
            .post(&key, PostRequest::new("greet me"))
            .await
            .expect("generation succeeds");

        let mut deltas = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::Delta { text, .. } = event {
                deltas.push(text);
            }
        }
        assert_eq!(deltas, vec!["Hello wor".to_string(), "ld, fine".to_string()]);
        assert_eq!(
            session.messages.last().map(|message| message.content.as_str()),
            Some("Hello world, fine")
        );
    }
}
