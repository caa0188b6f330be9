//! In-memory model of the active chat session.
//!
//! The store is the only owner of message content. Every mutation goes
//! through one of its operations and publishes a fresh [`SessionSnapshot`]
//! to subscribers, so observers see the same ordered sequence of states.

use tokio::sync::watch;

use crate::core::message::{Message, MessageId};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    pub session_id: Option<String>,
    pub model: Option<String>,
    pub active: bool,
    pub messages: Vec<Message>,
    pub is_any_turn_streaming: bool,
}

impl SessionSnapshot {
    pub fn streaming_message(&self) -> Option<&Message> {
        self.messages.iter().find(|message| message.is_streaming)
    }
}

pub struct SessionStore {
    session_id: Option<String>,
    model: Option<String>,
    active: bool,
    messages: Vec<Message>,
    turn_streaming: bool,
    tx: watch::Sender<SessionSnapshot>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SessionSnapshot::default());
        Self {
            session_id: None,
            model: None,
            active: false,
            messages: Vec::new(),
            turn_streaming: false,
            tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            model: self.model.clone(),
            active: self.active,
            messages: self.messages.clone(),
            is_any_turn_streaming: self.turn_streaming,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|message| &message.id == id)
    }

    pub fn position(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|message| &message.id == id)
    }

    pub fn create_session(&mut self, session_id: impl Into<String>, model: impl Into<String>) {
        self.session_id = Some(session_id.into());
        self.model = Some(model.into());
        self.active = true;
        self.messages.clear();
        self.turn_streaming = false;
        self.publish();
    }

    pub fn deactivate(&mut self) {
        self.active = false;
        self.publish();
    }

    /// Appends `message` unless a message with the same id is already present.
    pub fn append_message(&mut self, message: Message) -> bool {
        if self.position(&message.id).is_some() {
            return false;
        }
        self.messages.push(message);
        self.publish();
        true
    }

    /// Replaces the content of `id` with `updater(current)`. The updater always
    /// sees the stored value, never a copy held by the caller.
    pub fn update_message_content<F>(&mut self, id: &MessageId, updater: F) -> bool
    where
        F: FnOnce(&str) -> String,
    {
        let Some(message) = self.messages.iter_mut().find(|message| &message.id == id) else {
            return false;
        };
        message.content = updater(&message.content);
        self.publish();
        true
    }

    pub fn set_message_streaming(&mut self, id: &MessageId, streaming: bool) -> bool {
        let Some(message) = self.messages.iter_mut().find(|message| &message.id == id) else {
            return false;
        };
        message.is_streaming = streaming;
        self.publish();
        true
    }

    pub fn set_message_error(&mut self, id: &MessageId, detail: impl Into<String>) -> bool {
        let Some(message) = self.messages.iter_mut().find(|message| &message.id == id) else {
            return false;
        };
        message.error = Some(detail.into());
        self.publish();
        true
    }

    pub fn set_turn_streaming(&mut self, streaming: bool) {
        if self.turn_streaming != streaming {
            self.turn_streaming = streaming;
            self.publish();
        }
    }

    pub fn clear_messages(&mut self) {
        self.messages.clear();
        self.publish();
    }

    pub fn replace_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        self.publish();
    }

    /// Removes `id` and every later message, returning the removed tail.
    pub fn truncate_from(&mut self, id: &MessageId) -> Vec<Message> {
        let Some(index) = self.position(id) else {
            return Vec::new();
        };
        let removed = self.messages.split_off(index);
        self.publish();
        removed
    }

    fn publish(&self) {
        self.tx.send_replace(self.snapshot());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_session() -> SessionStore {
        let mut store = SessionStore::new();
        store.create_session("s1", "llama3");
        store
    }

    #[test]
    fn create_session_overwrites_previous_state() {
        let mut store = store_with_session();
        store.append_message(Message::user("Hello"));
        store.create_session("s2", "mistral");

        let snapshot = store.snapshot();
        assert_eq!(snapshot.session_id.as_deref(), Some("s2"));
        assert_eq!(snapshot.model.as_deref(), Some("mistral"));
        assert!(snapshot.active);
        assert!(snapshot.messages.is_empty());
    }

    #[test]
    fn append_with_duplicate_id_is_a_no_op() {
        let mut store = store_with_session();
        let message = Message::user("Hello");
        assert!(store.append_message(message.clone()));
        assert!(!store.append_message(message));
        assert_eq!(store.messages().len(), 1);
    }

    #[test]
    fn updater_reads_latest_stored_content() {
        let mut store = store_with_session();
        let message = Message::assistant_placeholder();
        let id = message.id.clone();
        store.append_message(message);

        for delta in ["Hi", " ", "there"] {
            store.update_message_content(&id, |prev| format!("{prev}{delta}"));
        }
        assert_eq!(store.get(&id).unwrap().content, "Hi there");
        assert!(!store.update_message_content(&MessageId::from("missing"), |_| "x".into()));
    }

    #[test]
    fn truncate_from_removes_target_and_tail() {
        let mut store = store_with_session();
        let first = Message::user("one");
        let second = Message::assistant("two");
        let third = Message::user("three");
        let second_id = second.id.clone();
        store.append_message(first.clone());
        store.append_message(second);
        store.append_message(third);

        let removed = store.truncate_from(&second_id);
        assert_eq!(removed.len(), 2);
        assert_eq!(store.messages(), &[first]);
        assert!(store.truncate_from(&MessageId::from("missing")).is_empty());
    }

    #[test]
    fn subscribers_observe_every_mutation() {
        let mut store = store_with_session();
        let mut rx = store.subscribe();
        assert!(!rx.has_changed().unwrap());

        let message = Message::assistant_placeholder();
        let id = message.id.clone();
        store.append_message(message);
        assert!(rx.has_changed().unwrap());
        let snapshot = rx.borrow_and_update().clone();
        assert_eq!(snapshot.streaming_message().map(|m| &m.id), Some(&id));

        store.set_message_streaming(&id, false);
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().streaming_message().is_none());
    }

    #[test]
    fn replace_and_clear_swap_the_whole_list() {
        let mut store = store_with_session();
        store.append_message(Message::user("old"));
        store.replace_messages(vec![Message::user("a"), Message::assistant("b")]);
        assert_eq!(store.messages().len(), 2);
        assert_eq!(store.messages()[0].content, "a");
        store.clear_messages();
        assert!(store.messages().is_empty());
    }
}
