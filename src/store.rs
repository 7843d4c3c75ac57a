//! Persistence abstraction (§10.6): the core only needs thread-safe CRUD on
//! chat records and users; this module ships the minimal in-memory default
//! so §8's scenarios run end-to-end without pretending to specify a wire
//! format for a real database.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// One stored chat message, mirroring the reference schema's field set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Monotonically increasing id assigned at insertion.
    pub id: u64,
    /// Author.
    pub username: String,
    /// Message body.
    pub content: String,
    /// `YYYY-MM-DD HH:MM:SS` local timestamp, as formatted by the caller.
    pub timestamp: String,
    /// Private-message recipient; empty for public messages.
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub target_user: String,
    /// Room scoping; empty for the global room.
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub room_id: String,
}

/// Thread-safe CRUD on chat records. `since` filtering is id-based: callers
/// pass the last id they've seen and get back everything strictly newer.
pub trait MessageStore: Send + Sync {
    /// Stores `message`, assigning it the next id, and returns that id.
    fn add_message(&self, message: ChatMessage) -> u64;

    /// Messages with `id > since`, optionally filtered to `username`'s
    /// messages (`None` returns every user's messages), oldest first.
    fn messages_after(&self, since: u64, username: Option<&str>) -> Vec<ChatMessage>;

    /// Total number of stored messages.
    fn message_count(&self) -> usize;
}

/// In-memory `MessageStore`, the default collaborator.
#[derive(Default)]
pub struct InMemoryMessageStore {
    messages: Mutex<Vec<ChatMessage>>,
    next_id: Mutex<u64>,
}

impl InMemoryMessageStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        InMemoryMessageStore {
            messages: Mutex::new(Vec::new()),
            next_id: Mutex::new(1),
        }
    }
}

impl MessageStore for InMemoryMessageStore {
    fn add_message(&self, mut message: ChatMessage) -> u64 {
        let mut next_id = self.next_id.lock().unwrap();
        let id = *next_id;
        *next_id += 1;
        message.id = id;
        self.messages.lock().unwrap().push(message);
        id
    }

    fn messages_after(&self, since: u64, username: Option<&str>) -> Vec<ChatMessage> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.id > since)
            .filter(|m| username.map(|u| m.username == u).unwrap_or(true))
            .cloned()
            .collect()
    }

    fn message_count(&self) -> usize {
        self.messages.lock().unwrap().len()
    }
}

/// Thread-safe CRUD on registered users, kept separate from `SessionManager`
/// (which tracks *live* connections) so a persistent-user collaborator could
/// be swapped in without touching session lifecycle.
pub trait UserStore: Send + Sync {
    /// Registers `username`; `false` if already registered.
    fn register(&self, username: &str) -> bool;

    /// Whether `username` has been registered.
    fn contains(&self, username: &str) -> bool;
}

/// In-memory `UserStore`, the default collaborator.
#[derive(Default)]
pub struct InMemoryUserStore {
    usernames: Mutex<std::collections::HashSet<String>>,
}

impl InMemoryUserStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        InMemoryUserStore {
            usernames: Mutex::new(std::collections::HashSet::new()),
        }
    }
}

impl UserStore for InMemoryUserStore {
    fn register(&self, username: &str) -> bool {
        self.usernames.lock().unwrap().insert(username.to_string())
    }

    fn contains(&self, username: &str) -> bool {
        self.usernames.lock().unwrap().contains(username)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn msg(username: &str, content: &str) -> ChatMessage {
        ChatMessage {
            id: 0,
            username: username.to_string(),
            content: content.to_string(),
            timestamp: "2026-01-01 00:00:00".to_string(),
            target_user: String::new(),
            room_id: String::new(),
        }
    }

    #[test]
    fn add_message_assigns_increasing_ids() {
        let store = InMemoryMessageStore::new();
        let a = store.add_message(msg("alice", "hi"));
        let b = store.add_message(msg("bob", "yo"));
        assert!(b > a);
        assert_eq!(2, store.message_count());
    }

    #[test]
    fn messages_after_filters_by_since_and_username() {
        let store = InMemoryMessageStore::new();
        store.add_message(msg("alice", "1"));
        let second = store.add_message(msg("bob", "2"));
        store.add_message(msg("alice", "3"));

        let all_after_first = store.messages_after(1, None);
        assert_eq!(2, all_after_first.len());

        let alice_only = store.messages_after(0, Some("alice"));
        assert_eq!(2, alice_only.len());
        assert!(alice_only.iter().all(|m| m.username == "alice"));

        let _ = second;
    }

    #[test]
    fn user_store_rejects_duplicate_registration() {
        let store = InMemoryUserStore::new();
        assert!(store.register("alice"));
        assert!(!store.register("alice"));
        assert!(store.contains("alice"));
    }
}
