use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use gencase_llm::Role;
use gencase_storage::{ChatId, ChatRecord};
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

use crate::message::Message;
use crate::usecase::{SessionKey, UseCase};

/// State of one conversation. Published as immutable `Arc` snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub use_case: UseCase,
    pub chat: Option<ChatRecord>,
    /// Index 0 is always the single system message.
    pub messages: Vec<Message>,
    pub stop_reason: String,
    pub loading: bool,
    pub model_id: Option<String>,
    /// Changes whenever the session is reset; writes from older generations are rejected.
    pub epoch: u64,
}

impl Session {
    pub fn new(
        use_case: UseCase,
        system_context: impl Into<String>,
        model_id: Option<String>,
        epoch: u64,
    ) -> Self {
        Self {
            use_case,
            chat: None,
            messages: vec![Message::system(system_context)],
            stop_reason: String::new(),
            loading: false,
            model_id,
            epoch,
        }
    }

    /// Messages shown to the user.
    pub fn visible_messages(&self) -> &[Message] {
        match self.messages.first() {
            Some(first) if first.role == Role::System => &self.messages[1..],
            _ => &self.messages,
        }
    }

    pub fn system_context(&self) -> Option<&str> {
        self.messages
            .first()
            .filter(|message| message.role == Role::System)
            .map(|message| message.content.as_str())
    }

    pub fn chat_id(&self) -> Option<ChatId> {
        self.chat.as_ref().map(|chat| chat.id)
    }
}

struct ActiveGeneration {
    serial: u64,
    cancel_tx: oneshot::Sender<()>,
}

/// Process-wide map of live sessions plus the generations streaming into them.
///
/// Locks are only taken for synchronous copy-on-write updates.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionKey, Arc<Session>>>,
    generations: Mutex<HashMap<SessionKey, ActiveGeneration>>,
    next_epoch: AtomicU64,
    next_serial: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_epoch(&self) -> u64 {
        self.next_epoch.fetch_add(1, Ordering::Relaxed)
    }

    pub fn get(&self, key: &SessionKey) -> Option<Arc<Session>> {
        lock(&self.sessions).get(key).cloned()
    }

    pub fn keys(&self) -> Vec<SessionKey> {
        lock(&self.sessions).keys().cloned().collect()
    }

    /// Returns the existing session or installs the one built by `make`.
    pub fn get_or_insert_with<F>(&self, key: &SessionKey, make: F) -> Arc<Session>
    where
        F: FnOnce(u64) -> Session,
    {
        let mut sessions = lock(&self.sessions);
        if let Some(existing) = sessions.get(key) {
            return Arc::clone(existing);
        }

        let session = Arc::new(make(self.next_epoch()));
        sessions.insert(key.clone(), Arc::clone(&session));
        session
    }

    /// Installs a fresh session under a new epoch and cancels any generation for `key`.
    pub fn replace<F>(&self, key: &SessionKey, make: F) -> Arc<Session>
    where
        F: FnOnce(Option<&Session>, u64) -> Session,
    {
        self.cancel_generation(key);

        let mut sessions = lock(&self.sessions);
        let epoch = self.next_epoch();
        let session = Arc::new(make(sessions.get(key).map(Arc::as_ref), epoch));
        sessions.insert(key.clone(), Arc::clone(&session));
        session
    }

    /// Copy-on-write update guarded by `epoch`; `None` if the session is gone or was reset.
    pub fn update<F>(&self, key: &SessionKey, epoch: u64, mutate: F) -> Option<Arc<Session>>
    where
        F: FnOnce(&mut Session),
    {
        let mut sessions = lock(&self.sessions);
        let slot = sessions.get_mut(key)?;
        if slot.epoch != epoch {
            return None;
        }

        mutate(Arc::make_mut(slot));
        Some(Arc::clone(slot))
    }

    /// Copy-on-write update of whatever session currently lives at `key`.
    pub fn update_current<F>(&self, key: &SessionKey, mutate: F) -> Option<Arc<Session>>
    where
        F: FnOnce(&mut Session),
    {
        let mut sessions = lock(&self.sessions);
        let slot = sessions.get_mut(key)?;
        mutate(Arc::make_mut(slot));
        Some(Arc::clone(slot))
    }

    pub fn keys_holding_chat(&self, chat_id: ChatId) -> Vec<SessionKey> {
        lock(&self.sessions)
            .iter()
            .filter(|(_, session)| session.chat_id() == Some(chat_id))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Drops every session and cancels every generation.
    pub fn clear(&self) {
        lock(&self.generations).clear();
        lock(&self.sessions).clear();
    }

    /// Registers a generation for `key`; `None` while another one is still registered.
    pub fn try_begin_generation(self: &Arc<Self>, key: &SessionKey) -> Option<GenerationGuard> {
        let mut generations = lock(&self.generations);
        if generations.contains_key(key) {
            return None;
        }

        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        generations.insert(key.clone(), ActiveGeneration { serial, cancel_tx });

        Some(GenerationGuard {
            registry: Arc::clone(self),
            key: key.clone(),
            serial,
            cancel_rx,
        })
    }

    pub fn cancel_generation(&self, key: &SessionKey) -> bool {
        lock(&self.generations)
            .remove(key)
            .is_some_and(|generation| generation.cancel_tx.send(()).is_ok())
    }

    pub fn is_generating(&self, key: &SessionKey) -> bool {
        lock(&self.generations).contains_key(key)
    }

    fn finish_generation(&self, key: &SessionKey, serial: u64) {
        let mut generations = lock(&self.generations);
        if generations
            .get(key)
            .is_some_and(|generation| generation.serial == serial)
        {
            generations.remove(key);
        }
    }
}

/// Keeps a generation registered until dropped.
pub struct GenerationGuard {
    registry: Arc<SessionRegistry>,
    key: SessionKey,
    serial: u64,
    /// Resolves when the generation is cancelled.
    pub(crate) cancel_rx: oneshot::Receiver<()>,
}

impl GenerationGuard {
    /// True once the generation was cancelled or its registration dropped.
    pub fn is_cancelled(&mut self) -> bool {
        !matches!(self.cancel_rx.try_recv(), Err(TryRecvError::Empty))
    }
}

impl Drop for GenerationGuard {
    fn drop(&mut self) {
        self.registry.finish_generation(&self.key, self.serial);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
