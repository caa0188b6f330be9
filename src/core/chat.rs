//! The chat surface used by front ends.
//!
//! [`ChatSession`] ties the backend, the streaming controller and the
//! transcript log together. It is cheap to clone; clones share one session.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

use crate::api::SessionInitResponse;
use crate::core::controller::{StreamingController, TurnOutcome};
use crate::core::history::{load_history, HistoryLoad};
use crate::core::message::{Attachment, MessageId};
use crate::core::session_store::{SessionSnapshot, SessionStore};
use crate::core::transport::{BackendError, ChatBackend, Transport};
use crate::utils::logging::LoggingState;

#[derive(Clone)]
pub struct ChatSession {
    inner: Arc<Inner>,
}

struct Inner {
    backend: Arc<dyn ChatBackend>,
    controller: StreamingController,
    logging: Mutex<LoggingState>,
}

impl ChatSession {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        transport: Arc<dyn Transport>,
        turn_timeout: Option<Duration>,
        logging: LoggingState,
    ) -> Self {
        let store = Arc::new(Mutex::new(SessionStore::new()));
        let controller = StreamingController::new(transport, store, backend.chat_url())
            .with_turn_timeout(turn_timeout);
        Self {
            inner: Arc::new(Inner {
                backend,
                controller,
                logging: Mutex::new(logging),
            }),
        }
    }

    pub fn controller(&self) -> &StreamingController {
        &self.inner.controller
    }

    /// Asks the server for a fresh session and makes it the active one. Any
    /// turn still streaming for the previous session is cancelled.
    pub async fn start_new_chat(&self, model: &str) -> Result<SessionInitResponse, BackendError> {
        let info = self.inner.backend.init_session(model).await?;
        self.inner
            .controller
            .interrupt_with(|store| store.create_session(&info.session_id, &info.model))
            .await;
        debug!(session_id = %info.session_id, model = %info.model, "Started new chat");
        Ok(info)
    }

    /// Makes `session_id` active and fills it with the server's history.
    pub async fn switch_session(
        &self,
        session_id: &str,
        model: &str,
    ) -> Result<HistoryLoad, BackendError> {
        self.inner
            .controller
            .interrupt_with(|store| store.create_session(session_id, model))
            .await;
        debug!(session_id, model, "Switched session");
        load_history(
            &self.inner.controller,
            self.inner.backend.as_ref(),
            session_id,
        )
        .await
    }

    pub async fn reload_history(&self) -> Result<HistoryLoad, BackendError> {
        let session_id = self
            .inner
            .controller
            .store()
            .lock()
            .await
            .session_id()
            .map(str::to_string);
        let Some(session_id) = session_id else {
            return Ok(HistoryLoad::Stale);
        };
        load_history(
            &self.inner.controller,
            self.inner.backend.as_ref(),
            &session_id,
        )
        .await
    }

    /// Cancels any running turn, drops the local messages and marks the
    /// session inactive. Later sends are rejected until a new chat starts.
    pub async fn end_session(&self) {
        self.inner
            .controller
            .interrupt_with(|store| {
                store.clear_messages();
                store.deactivate();
            })
            .await;
    }

    pub async fn list_models(&self) -> Result<Vec<String>, BackendError> {
        self.inner.backend.list_models().await
    }

    pub async fn send(&self, prompt: &str, attachment: Option<Attachment>) -> TurnOutcome {
        let outcome = self.inner.controller.send(prompt, attachment).await;
        self.log_turn(&outcome).await;
        outcome
    }

    pub async fn regenerate(&self, assistant_id: &MessageId) -> TurnOutcome {
        let mut discarded = 0;
        let outcome = self
            .inner
            .controller
            .regenerate_with(assistant_id, |tail| discarded = tail.len())
            .await;
        if outcome.is_rejected() {
            return outcome;
        }

        debug!(discarded, "Rewriting transcript after regeneration");
        let messages = self.inner.controller.store().lock().await.messages().to_vec();
        let logging = self.inner.logging.lock().await;
        if let Err(err) = logging.rewrite_log(&messages) {
            warn!(error = %err, "Failed to rewrite transcript");
        }
        outcome
    }

    pub async fn cancel_active_turn(&self) -> bool {
        self.inner.controller.cancel_active_turn().await
    }

    pub async fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.controller.store().lock().await.subscribe()
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        self.inner.controller.store().lock().await.snapshot()
    }

    pub async fn logging_status(&self) -> String {
        self.inner.logging.lock().await.get_status_string()
    }

    pub async fn toggle_logging(&self) -> Result<String, String> {
        self.inner
            .logging
            .lock()
            .await
            .toggle_logging("Logging paused")
            .map_err(|err| err.to_string())
    }

    async fn log_turn(&self, outcome: &TurnOutcome) {
        let Some(assistant_id) = outcome.assistant_id() else {
            return;
        };

        let pair = {
            let store = self.inner.controller.store().lock().await;
            store
                .position(assistant_id)
                .filter(|index| *index > 0)
                .map(|index| {
                    let messages = store.messages();
                    (messages[index - 1].clone(), messages[index].clone())
                })
        };
        let Some((user, assistant)) = pair else {
            return;
        };

        let logging = self.inner.logging.lock().await;
        if let Err(err) = logging.log_turn(&user, &assistant) {
            warn!(error = %err, "Failed to write transcript");
        }
    }
}
