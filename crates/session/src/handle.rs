use std::sync::Arc;

use gencase_storage::FeedbackUpdate;

use crate::error::SessionResult;
use crate::manager::{ChatSessionManager, GenerateOptions, PostRequest};
use crate::message::{Message, TurnRole};
use crate::registry::Session;
use crate::usecase::{SessionKey, UseCase};

/// The manager bound to one conversation, as seen by a front-end.
#[derive(Clone)]
pub struct SessionHandle {
    manager: ChatSessionManager,
    key: SessionKey,
    use_case: UseCase,
}

impl SessionHandle {
    /// Binds to `key` and initializes the session if needed.
    pub fn new(manager: ChatSessionManager, key: SessionKey, use_case: UseCase) -> Self {
        manager.init(&key, &use_case);
        Self {
            manager,
            key,
            use_case,
        }
    }

    /// Binds to `route`, deriving the use case from its first segment.
    pub fn for_route(manager: ChatSessionManager, route: &str) -> Self {
        let key = SessionKey::new(route);
        let use_case = key.use_case();
        Self::new(manager, key, use_case)
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn use_case(&self) -> &UseCase {
        &self.use_case
    }

    pub fn manager(&self) -> &ChatSessionManager {
        &self.manager
    }

    pub fn init(&self) -> Arc<Session> {
        self.manager.init(&self.key, &self.use_case)
    }

    pub async fn post_chat(&self, request: PostRequest) -> SessionResult<Arc<Session>> {
        self.init();
        self.manager.post(&self.key, request).await
    }

    pub async fn continue_generation(&self, options: GenerateOptions) -> SessionResult<Arc<Session>> {
        self.manager.continue_generation(&self.key, options).await
    }

    pub fn clear(&self) -> Arc<Session> {
        self.manager.clear(&self.key, &self.use_case)
    }

    pub fn update_system_context(&self, system_context: impl Into<String>) -> SessionResult<Arc<Session>> {
        self.init();
        self.manager.update_system_context(&self.key, system_context)
    }

    pub fn get_current_system_context(&self) -> Option<String> {
        self.manager.current_system_context(&self.key)
    }

    pub fn push_message(&self, role: TurnRole, content: impl Into<String>) -> SessionResult<Arc<Session>> {
        self.init();
        self.manager.push_message(&self.key, role, content)
    }

    pub fn pop_message(&self) -> Option<Message> {
        self.manager.pop_message(&self.key)
    }

    pub async fn send_feedback(&self, update: FeedbackUpdate) -> SessionResult<Message> {
        self.manager.send_feedback(&self.key, update).await
    }

    pub fn recover_failed_turn(&self, diagnostic: impl Into<String>) -> SessionResult<Arc<Session>> {
        self.manager.recover_failed_turn(&self.key, diagnostic)
    }

    pub fn get_stop_reason(&self) -> String {
        self.manager.stop_reason(&self.key)
    }

    pub fn loading(&self) -> bool {
        self.manager.loading(&self.key)
    }

    pub fn messages(&self) -> Vec<Message> {
        self.manager.messages(&self.key)
    }

    pub fn raw_messages(&self) -> Vec<Message> {
        self.manager.raw_messages(&self.key)
    }

    pub fn is_empty(&self) -> bool {
        self.manager.is_empty(&self.key)
    }

    pub fn get_model_id(&self) -> Option<String> {
        self.manager.model_id(&self.key)
    }

    pub fn set_model_id(&self, model_id: impl Into<String>) -> SessionResult<()> {
        self.init();
        self.manager.set_model_id(&self.key, model_id)
    }

    pub fn snapshot(&self) -> Option<Arc<Session>> {
        self.manager.snapshot(&self.key)
    }
}

#[cfg(test)]
mod tests {
    use gencase_llm::{Model, ModelCatalog, Script, ScriptedEndpoint};
    use gencase_storage::MemoryStorage;

    use super::*;

    fn manager(endpoint: Arc<ScriptedEndpoint>) -> ChatSessionManager {
        ChatSessionManager::new(endpoint, Arc::new(MemoryStorage::new()))
            .with_catalog(ModelCatalog::new(vec![Model::from_id("m")]))
            .with_default_model("m")
    }

    #[tokio::test]
    async fn handle_runs_a_turn_for_its_route() {
        let endpoint = Arc::new(ScriptedEndpoint::new());
        endpoint.push_script(Script::texts(["Bonjour"]));
        let handle = SessionHandle::for_route(manager(endpoint.clone()), "/translate");

        assert_eq!(handle.use_case(), &UseCase::Translate);
        assert!(handle.is_empty());
        assert_eq!(handle.get_model_id().as_deref(), Some("m"));

        handle
            .post_chat(PostRequest::new("Hello"))
            .await
            .expect("generation succeeds");

        let messages = handle.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "Bonjour");
        assert_eq!(messages[1].usecase.as_deref(), Some("translate"));
        assert!(!handle.loading());
        assert_eq!(handle.raw_messages().len(), 3);
    }

    #[tokio::test]
    async fn system_context_can_be_replaced_and_survives_clear_as_default() {
        let handle = SessionHandle::for_route(manager(Arc::new(ScriptedEndpoint::new())), "/chat");
        let default_context = handle.get_current_system_context().expect("system prompt");

        handle
            .update_system_context("Answer in haiku.")
            .expect("session exists");
        assert_eq!(
            handle.get_current_system_context().as_deref(),
            Some("Answer in haiku.")
        );

        handle.clear();
        assert_eq!(handle.get_current_system_context(), Some(default_context));
    }
}
