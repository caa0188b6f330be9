//! Loading persisted history into the store on session switch.

use std::collections::HashSet;

use tracing::debug;

use crate::core::controller::StreamingController;
use crate::core::message::Message;
use crate::core::transport::{BackendError, ChatBackend};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryLoad {
    Applied { messages: usize },
    /// The active session changed while the history was being fetched.
    Stale,
}

/// Fetches the history of `session_id` and installs it once no turn is in
/// flight. Entries with unknown roles or repeated ids are skipped.
pub async fn load_history(
    controller: &StreamingController,
    backend: &dyn ChatBackend,
    session_id: &str,
) -> Result<HistoryLoad, BackendError> {
    let entries = backend.fetch_history(session_id).await?;
    let fetched = entries.len();

    let mut seen = HashSet::new();
    let messages: Vec<Message> = entries
        .into_iter()
        .filter_map(Message::from_history)
        .filter(|message| seen.insert(message.id.clone()))
        .collect();
    if messages.len() != fetched {
        debug!(
            session_id,
            fetched,
            kept = messages.len(),
            "Skipped history entries"
        );
    }

    let outcome = controller
        .when_idle(|store| {
            if store.session_id() != Some(session_id) {
                return HistoryLoad::Stale;
            }
            let count = messages.len();
            store.replace_messages(messages);
            HistoryLoad::Applied { messages: count }
        })
        .await;

    debug!(session_id, outcome = ?outcome, "History load finished");
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::HistoryEntry;
    use crate::core::message::Role;
    use crate::utils::test_utils::{
        delta_frame, done_frame, new_controller, wait_for_streaming, FakeBackend,
        ScriptedTransport,
    };
    use chrono::Utc;
    use std::sync::Arc;

    fn entry(id: &str, role: &str, content: &str) -> HistoryEntry {
        HistoryEntry {
            id: id.to_string(),
            role: role.to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn history_replaces_messages_and_skips_unknown_entries() {
        let transport = ScriptedTransport::with_body(vec![done_frame()]);
        let controller = new_controller(transport, Some("s1")).await;
        let backend = FakeBackend::with_history(vec![
            entry("m1", "user", "Hello"),
            entry("m2", "assistant", "Hi"),
            entry("m3", "tool", "ignored"),
            entry("m2", "assistant", "duplicate"),
        ]);

        let outcome = load_history(&controller, &backend, "s1").await.unwrap();
        assert_eq!(outcome, HistoryLoad::Applied { messages: 2 });

        let store = controller.store().lock().await;
        let roles: Vec<Role> = store.messages().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);
        assert_eq!(store.messages()[1].content, "Hi");
    }

    #[tokio::test]
    async fn history_for_inactive_session_is_discarded() {
        let transport = ScriptedTransport::with_body(vec![done_frame()]);
        let controller = new_controller(transport, Some("s2")).await;
        let backend = FakeBackend::with_history(vec![entry("m1", "user", "Old")]);

        let outcome = load_history(&controller, &backend, "s1").await.unwrap();
        assert_eq!(outcome, HistoryLoad::Stale);
        assert!(controller.store().lock().await.messages().is_empty());
    }

    #[tokio::test]
    async fn history_waits_for_in_flight_turn() {
        let (transport, feed) = ScriptedTransport::live();
        let controller = Arc::new(new_controller(transport, Some("s1")).await);
        let backend = Arc::new(FakeBackend::with_history(vec![
            entry("m1", "user", "Persisted"),
            entry("m2", "assistant", "Answer"),
        ]));

        let turn = tokio::spawn({
            let controller = Arc::clone(&controller);
            async move { controller.send("Live", None).await }
        });
        feed.send_frame(delta_frame("streaming"));
        wait_for_streaming(&controller).await;

        let load = tokio::spawn({
            let controller = Arc::clone(&controller);
            let backend = Arc::clone(&backend);
            async move { load_history(&controller, backend.as_ref(), "s1").await }
        });
        tokio::task::yield_now().await;
        assert!(!load.is_finished());
        assert_eq!(controller.store().lock().await.messages().len(), 2);

        feed.send_frame(done_frame());
        turn.await.unwrap();
        let outcome = load.await.unwrap().unwrap();
        assert_eq!(outcome, HistoryLoad::Applied { messages: 2 });

        let store = controller.store().lock().await;
        assert_eq!(store.messages()[0].content, "Persisted");
        assert!(store.messages().iter().all(|m| !m.is_streaming));
    }
}
