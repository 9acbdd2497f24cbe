//! Per-conversation message history.
//!
//! An append-only store of immutable messages keyed by conversation id.
//! The prompt context is a bounded window computed at read time; the full
//! history stays available for audit and the history surface.

use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use crate::types::{Message, Role};

#[derive(Default)]
pub struct ConversationStore {
    conversations: DashMap<String, Vec<Message>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new conversation and return its id.
    pub fn create(&self) -> String {
        let id = Uuid::new_v4().to_string();
        self.conversations.insert(id.clone(), Vec::new());
        tracing::debug!(conversation_id = %id, "created conversation");
        id
    }

    pub fn exists(&self, id: &str) -> bool {
        self.conversations.contains_key(id)
    }

    /// Append a message. Unknown ids are created on the fly; appends for
    /// the same id are serialized by the per-key lock, so concurrent turns
    /// never lose or reorder messages.
    pub fn append(&self, id: &str, role: Role, content: impl Into<String>) {
        let mut entry = self.conversations.entry(id.to_string()).or_default();
        entry.push(Message {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        });
    }

    /// Full ordered history, empty for unknown ids.
    pub fn messages(&self, id: &str) -> Vec<Message> {
        self.conversations
            .get(id)
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    /// The last `max_messages` turns formatted for prompt injection.
    pub fn context_window(&self, id: &str, max_messages: usize) -> String {
        let Some(messages) = self.conversations.get(id) else {
            return String::new();
        };
        let start = messages.len().saturating_sub(max_messages);
        messages[start..]
            .iter()
            .map(|m| match m.role {
                Role::User => format!("Потребител: {}", m.content),
                Role::Assistant => format!("Асистент: {}", m.content),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Remove a conversation entirely. False when the id is unknown.
    pub fn delete(&self, id: &str) -> bool {
        self.conversations.remove(id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_append_then_read() {
        let store = ConversationStore::new();
        let id = store.create();
        store.append(&id, Role::User, "Какво е читалище?");
        store.append(&id, Role::Assistant, "Културна институция.");

        let messages = store.messages(&id);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].content, "Културна институция.");
    }

    #[test]
    fn append_auto_creates_unknown_conversation() {
        let store = ConversationStore::new();
        store.append("ghost", Role::User, "здравей");
        assert!(store.exists("ghost"));
        assert_eq!(store.messages("ghost").len(), 1);
    }

    #[test]
    fn repeated_reads_return_identical_sequences() {
        let store = ConversationStore::new();
        let id = store.create();
        store.append(&id, Role::User, "а");
        store.append(&id, Role::Assistant, "б");
        store.append(&id, Role::User, "в");

        let first: Vec<String> = store.messages(&id).iter().map(|m| m.content.clone()).collect();
        let second: Vec<String> = store.messages(&id).iter().map(|m| m.content.clone()).collect();
        assert_eq!(first, second);
        assert_eq!(first, vec!["а", "б", "в"]);
    }

    #[test]
    fn context_window_is_bounded_but_history_is_not() {
        let store = ConversationStore::new();
        let id = store.create();
        for i in 0..20 {
            store.append(&id, Role::User, format!("въпрос {}", i));
        }
        let window = store.context_window(&id, 4);
        assert_eq!(window.lines().count(), 4);
        assert!(window.contains("въпрос 19"));
        assert!(!window.contains("въпрос 15"));
        assert_eq!(store.messages(&id).len(), 20);
    }

    #[test]
    fn context_window_formats_roles() {
        let store = ConversationStore::new();
        let id = store.create();
        store.append(&id, Role::User, "Колко са?");
        store.append(&id, Role::Assistant, "Около 3600.");
        let window = store.context_window(&id, 10);
        assert_eq!(window, "Потребител: Колко са?\nАсистент: Около 3600.");
    }

    #[test]
    fn delete_removes_conversation() {
        let store = ConversationStore::new();
        let id = store.create();
        assert!(store.delete(&id));
        assert!(!store.exists(&id));
        assert!(!store.delete(&id));
    }

    #[test]
    fn concurrent_appends_do_not_lose_messages() {
        use std::sync::Arc;
        let store = Arc::new(ConversationStore::new());
        let id = store.create();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let id = id.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    store.append(&id, Role::User, "x");
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.messages(&id).len(), 400);
    }
}
