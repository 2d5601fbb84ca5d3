//! In-memory conversation store.
//!
//! Each conversation lives behind its own async mutex. Holding the lock for
//! the duration of a turn serializes turns per identifier, while different
//! identifiers proceed independently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;

use crate::models::message::Message;

/// Ordered message history for one identifier, seeded with a system message
#[derive(Debug, Clone)]
pub struct Conversation {
    id: String,
    messages: Vec<Message>,
}

impl Conversation {
    pub(crate) fn seeded(id: &str, seed_instructions: &str) -> Self {
        Self {
            id: id.to_string(),
            messages: vec![Message::system().with_text(seed_instructions)],
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn append(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn extend(&mut self, messages: impl IntoIterator<Item = Message>) {
        self.messages.extend(messages);
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Always false: the seed message is never removed
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

pub type ConversationHandle = Arc<AsyncMutex<Conversation>>;

pub struct ConversationStore {
    seed_instructions: String,
    conversations: Mutex<HashMap<String, ConversationHandle>>,
}

impl ConversationStore {
    pub fn new<S: Into<String>>(seed_instructions: S) -> Self {
        Self {
            seed_instructions: seed_instructions.into(),
            conversations: Mutex::new(HashMap::new()),
        }
    }

    pub fn seed_instructions(&self) -> &str {
        &self.seed_instructions
    }

    /// Return the conversation for `id`, creating and seeding it on first reference
    pub fn get_or_create(&self, id: &str) -> ConversationHandle {
        let mut conversations = self.lock();
        conversations
            .entry(id.to_string())
            .or_insert_with(|| {
                tracing::debug!(conversation_id = id, "creating conversation");
                Arc::new(AsyncMutex::new(Conversation::seeded(
                    id,
                    &self.seed_instructions,
                )))
            })
            .clone()
    }

    /// Append outside of a turn; waits for any turn in progress on the same id
    pub async fn append(&self, id: &str, message: Message) {
        let handle = self.get_or_create(id);
        handle.lock().await.append(message);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of the committed history, waiting for any turn in progress
    pub async fn snapshot(&self, id: &str) -> Option<Vec<Message>> {
        let handle = self.lock().get(id).cloned()?;
        let conversation = handle.lock().await;
        Some(conversation.messages().to_vec())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ConversationHandle>> {
        // The map is only touched by short, non-panicking sections
        self.conversations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
