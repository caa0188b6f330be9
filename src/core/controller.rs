//! Runs assistant turns against the streaming endpoint.
//!
//! A turn moves `Sending -> Streaming -> Completed | Failed | Cancelled`.
//! At most one turn is in flight per controller; the slot is claimed under
//! `active` before anything touches the store, and released by whichever of
//! completion, failure or cancellation happens first.
//!
//! Lock order is always `active` then `store`.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{pin_mut, StreamExt};
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::ChatRequest;
use crate::core::chat_stream::{decode_stream, StreamEvent};
use crate::core::message::{Attachment, Message, MessageId};
use crate::core::session_store::SessionStore;
use crate::core::transport::Transport;

pub type SharedStore = Arc<Mutex<SessionStore>>;

/// Content shown in place of an assistant answer when its turn fails.
pub const FAILURE_PLACEHOLDER: &str = "Sorry, I encountered an error while generating a response.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Sending,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

/// Why a request was ignored. These are expected UI races, not failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    EmptyPrompt,
    NoSession,
    TurnInProgress,
    MessageNotFound,
    NotAssistantMessage,
    NoPrecedingUserMessage,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RejectReason::EmptyPrompt => "nothing to send",
            RejectReason::NoSession => "no active session",
            RejectReason::TurnInProgress => "a response is still streaming",
            RejectReason::MessageNotFound => "message not found",
            RejectReason::NotAssistantMessage => "only assistant messages can be regenerated",
            RejectReason::NoPrecedingUserMessage => "no user message precedes that response",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Rejected(RejectReason),
    Completed {
        assistant_id: MessageId,
    },
    Failed {
        assistant_id: MessageId,
        error: String,
    },
    /// `assistant_id` is `None` when the turn was cancelled before its
    /// messages were appended.
    Cancelled {
        assistant_id: Option<MessageId>,
    },
    TimedOut {
        assistant_id: Option<MessageId>,
    },
}

impl TurnOutcome {
    pub fn assistant_id(&self) -> Option<&MessageId> {
        match self {
            TurnOutcome::Rejected(_) => None,
            TurnOutcome::Completed { assistant_id } | TurnOutcome::Failed { assistant_id, .. } => {
                Some(assistant_id)
            }
            TurnOutcome::Cancelled { assistant_id } | TurnOutcome::TimedOut { assistant_id } => {
                assistant_id.as_ref()
            }
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, TurnOutcome::Rejected(_))
    }
}

/// What a claimed turn will send.
pub(crate) struct TurnInput {
    pub session_id: String,
    pub model: String,
    pub user_message: Message,
    /// Set when `user_message` is already in history, as for regeneration.
    /// It is then only sent, never appended.
    pub prompt_in_history: bool,
}

struct ActiveTurn {
    turn_id: u64,
    assistant_id: MessageId,
    state: TurnState,
    cancel: CancellationToken,
}

struct ClaimedTurn {
    turn_id: u64,
    assistant_id: MessageId,
    cancel: CancellationToken,
    input: TurnInput,
}

type TurnSlot = Arc<Mutex<Option<ActiveTurn>>>;

/// Frees the turn slot if the future driving a claimed turn is dropped
/// before the turn reaches a terminal state.
struct TurnGuard {
    turn_id: u64,
    cancel: CancellationToken,
    slot: TurnSlot,
    store: SharedStore,
    idle_tx: Arc<watch::Sender<bool>>,
    armed: bool,
}

impl TurnGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.cancel.cancel();
        let turn_id = self.turn_id;

        if let (Ok(mut slot), Ok(mut store)) = (self.slot.try_lock(), self.store.try_lock()) {
            debug!(turn_id, "Turn dropped mid-flight");
            StreamingController::cancel_locked(
                &mut slot,
                &mut store,
                Some(turn_id),
                &self.idle_tx,
            );
            return;
        }

        let slot = Arc::clone(&self.slot);
        let store = Arc::clone(&self.store);
        let idle_tx = Arc::clone(&self.idle_tx);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let mut slot = slot.lock().await;
                    let mut store = store.lock().await;
                    debug!(turn_id, "Turn dropped mid-flight");
                    StreamingController::cancel_locked(
                        &mut slot,
                        &mut store,
                        Some(turn_id),
                        &idle_tx,
                    );
                });
            }
            Err(_) => warn!(turn_id, "Turn dropped outside a runtime; slot not released"),
        }
    }
}

pub struct StreamingController {
    transport: Arc<dyn Transport>,
    store: SharedStore,
    chat_url: String,
    turn_timeout: Option<Duration>,
    active: TurnSlot,
    next_turn_id: AtomicU64,
    idle_tx: Arc<watch::Sender<bool>>,
}

impl StreamingController {
    pub fn new(transport: Arc<dyn Transport>, store: SharedStore, chat_url: String) -> Self {
        let (idle_tx, _rx) = watch::channel(true);
        Self {
            transport,
            store,
            chat_url,
            turn_timeout: None,
            active: Arc::new(Mutex::new(None)),
            next_turn_id: AtomicU64::new(1),
            idle_tx: Arc::new(idle_tx),
        }
    }

    /// Turns running longer than `timeout` are cancelled and reported as timed out.
    pub fn with_turn_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.turn_timeout = timeout;
        self
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub async fn state(&self) -> TurnState {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|turn| turn.state)
            .unwrap_or(TurnState::Idle)
    }

    pub async fn is_busy(&self) -> bool {
        self.active.lock().await.is_some()
    }

    /// Sends `prompt` as a new user message and streams the reply into a new
    /// assistant message. Resolves when the turn reaches a terminal state.
    pub async fn send(&self, prompt: &str, attachment: Option<Attachment>) -> TurnOutcome {
        let prompt = prompt.to_string();
        let claimed = self
            .claim(move |store| {
                if prompt.trim().is_empty() && attachment.is_none() {
                    return Err(RejectReason::EmptyPrompt);
                }
                let (Some(session_id), Some(model)) = (store.session_id(), store.model()) else {
                    return Err(RejectReason::NoSession);
                };
                if !store.is_active() {
                    return Err(RejectReason::NoSession);
                }
                Ok(TurnInput {
                    session_id: session_id.to_string(),
                    model: model.to_string(),
                    user_message: Message::user(prompt).with_attachment(attachment),
                    prompt_in_history: false,
                })
            })
            .await;

        match claimed {
            Ok((turn, guard)) => self.run(turn, guard).await,
            Err(reason) => {
                debug!(reason = ?reason, "Send rejected");
                TurnOutcome::Rejected(reason)
            }
        }
    }

    /// Claims the turn slot and, while holding it and the store, lets
    /// `prepare` validate the request and adjust history.
    pub(crate) async fn claim_and_run<F>(&self, prepare: F) -> TurnOutcome
    where
        F: FnOnce(&mut SessionStore) -> Result<TurnInput, RejectReason>,
    {
        match self.claim(prepare).await {
            Ok((turn, guard)) => self.run(turn, guard).await,
            Err(reason) => TurnOutcome::Rejected(reason),
        }
    }

    async fn claim<F>(&self, prepare: F) -> Result<(ClaimedTurn, TurnGuard), RejectReason>
    where
        F: FnOnce(&mut SessionStore) -> Result<TurnInput, RejectReason>,
    {
        let mut slot = self.active.lock().await;
        if slot.is_some() {
            return Err(RejectReason::TurnInProgress);
        }

        let mut store = self.store.lock().await;
        let input = prepare(&mut store)?;

        let turn_id = self.next_turn_id.fetch_add(1, Ordering::Relaxed);
        let assistant_id = MessageId::generate();
        let cancel = CancellationToken::new();
        *slot = Some(ActiveTurn {
            turn_id,
            assistant_id: assistant_id.clone(),
            state: TurnState::Sending,
            cancel: cancel.clone(),
        });
        store.set_turn_streaming(true);
        self.idle_tx.send_replace(false);

        debug!(
            turn_id,
            session_id = %input.session_id,
            model = %input.model,
            "Turn started"
        );

        let guard = TurnGuard {
            turn_id,
            cancel: cancel.clone(),
            slot: Arc::clone(&self.active),
            store: Arc::clone(&self.store),
            idle_tx: Arc::clone(&self.idle_tx),
            armed: true,
        };
        let turn = ClaimedTurn {
            turn_id,
            assistant_id,
            cancel,
            input,
        };
        Ok((turn, guard))
    }

    async fn run(&self, turn: ClaimedTurn, guard: TurnGuard) -> TurnOutcome {
        let turn_id = turn.turn_id;
        let assistant_id = turn.assistant_id.clone();

        let outcome = match self.turn_timeout {
            None => self.drive(turn).await,
            Some(timeout) => match tokio::time::timeout(timeout, self.drive(turn)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(turn_id, timeout_ms = timeout.as_millis() as u64, "Turn timed out");
                    self.cancel_turn(Some(turn_id)).await;
                    let appended = self.store.lock().await.get(&assistant_id).is_some();
                    TurnOutcome::TimedOut {
                        assistant_id: appended.then_some(assistant_id),
                    }
                }
            },
        };
        guard.disarm();
        outcome
    }

    async fn drive(&self, turn: ClaimedTurn) -> TurnOutcome {
        let ClaimedTurn {
            turn_id,
            assistant_id,
            cancel,
            input,
        } = turn;

        let request = ChatRequest {
            session_id: input.session_id.clone(),
            model: input.model.clone(),
            message: input.user_message.content.clone(),
            stream: true,
            attachment: input.user_message.attachment.as_ref().map(Attachment::to_wire),
        };
        let pending_user = (!input.prompt_in_history).then_some(input.user_message);
        let body = match serde_json::to_value(&request) {
            Ok(body) => body,
            Err(err) => {
                let error = err.to_string();
                return self
                    .fail_before_stream(turn_id, &cancel, pending_user, assistant_id, error)
                    .await;
            }
        };

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.transport.open_stream(&self.chat_url, body) => Some(result),
        };

        let bytes = match opened {
            None => return TurnOutcome::Cancelled { assistant_id: None },
            Some(Err(err)) => {
                let error = err.to_string();
                return self
                    .fail_before_stream(turn_id, &cancel, pending_user, assistant_id, error)
                    .await;
            }
            Some(Ok(bytes)) => bytes,
        };

        if !self.mark_streaming(turn_id).await {
            return TurnOutcome::Cancelled { assistant_id: None };
        }

        {
            let mut store = self.store.lock().await;
            if cancel.is_cancelled() {
                return TurnOutcome::Cancelled { assistant_id: None };
            }
            if let Some(user_message) = pending_user {
                store.append_message(user_message);
            }
            let mut placeholder = Message::assistant_placeholder();
            placeholder.id = assistant_id.clone();
            store.append_message(placeholder);
        }

        let events = decode_stream(bytes);
        pin_mut!(events);

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return TurnOutcome::Cancelled { assistant_id: Some(assistant_id) };
                }
                event = events.next() => event,
            };

            match next {
                Some(StreamEvent::TextDelta(delta)) => {
                    let mut store = self.store.lock().await;
                    if cancel.is_cancelled() {
                        return TurnOutcome::Cancelled {
                            assistant_id: Some(assistant_id),
                        };
                    }
                    store.update_message_content(&assistant_id, |prev| {
                        let mut next = String::with_capacity(prev.len() + delta.len());
                        next.push_str(prev);
                        next.push_str(&delta);
                        next
                    });
                }
                Some(StreamEvent::Done) | None => {
                    return self.complete(turn_id, assistant_id).await;
                }
                Some(StreamEvent::Error(message)) => {
                    return self.fail_streaming(turn_id, assistant_id, message).await;
                }
            }
        }
    }

    async fn mark_streaming(&self, turn_id: u64) -> bool {
        let mut slot = self.active.lock().await;
        match slot.as_mut() {
            Some(turn) if turn.turn_id == turn_id => {
                turn.state = TurnState::Streaming;
                true
            }
            _ => false,
        }
    }

    /// Releases the slot if `turn_id` still owns it. Returns the store guard
    /// so the caller can apply its terminal mutation before anyone else runs.
    async fn release(
        &self,
        turn_id: u64,
        terminal: TurnState,
    ) -> Option<MutexGuard<'_, SessionStore>> {
        let mut slot = self.active.lock().await;
        if !slot.as_ref().is_some_and(|turn| turn.turn_id == turn_id) {
            return None;
        }
        *slot = None;
        let mut store = self.store.lock().await;
        store.set_turn_streaming(false);
        self.idle_tx.send_replace(true);
        debug!(turn_id, state = ?terminal, "Turn finished");
        Some(store)
    }

    async fn complete(&self, turn_id: u64, assistant_id: MessageId) -> TurnOutcome {
        let Some(mut store) = self.release(turn_id, TurnState::Completed).await else {
            return TurnOutcome::Cancelled {
                assistant_id: Some(assistant_id),
            };
        };
        store.set_message_streaming(&assistant_id, false);
        TurnOutcome::Completed { assistant_id }
    }

    async fn fail_streaming(
        &self,
        turn_id: u64,
        assistant_id: MessageId,
        error: String,
    ) -> TurnOutcome {
        let Some(mut store) = self.release(turn_id, TurnState::Failed).await else {
            return TurnOutcome::Cancelled {
                assistant_id: Some(assistant_id),
            };
        };
        warn!(turn_id, error = %error, "Assistant turn failed");
        store.update_message_content(&assistant_id, |_| FAILURE_PLACEHOLDER.to_string());
        store.set_message_error(&assistant_id, error.clone());
        store.set_message_streaming(&assistant_id, false);
        TurnOutcome::Failed {
            assistant_id,
            error,
        }
    }

    async fn fail_before_stream(
        &self,
        turn_id: u64,
        cancel: &CancellationToken,
        user_message: Option<Message>,
        assistant_id: MessageId,
        error: String,
    ) -> TurnOutcome {
        if cancel.is_cancelled() {
            return TurnOutcome::Cancelled { assistant_id: None };
        }
        let Some(mut store) = self.release(turn_id, TurnState::Failed).await else {
            return TurnOutcome::Cancelled { assistant_id: None };
        };
        warn!(turn_id, error = %error, "Failed to open response stream");
        if let Some(user_message) = user_message {
            store.append_message(user_message);
        }
        let mut failed = Message::assistant(FAILURE_PLACEHOLDER);
        failed.id = assistant_id.clone();
        failed.error = Some(error.clone());
        store.append_message(failed);
        TurnOutcome::Failed {
            assistant_id,
            error,
        }
    }

    /// Cancels the in-flight turn, if any. Content streamed so far is kept.
    pub async fn cancel_active_turn(&self) -> bool {
        self.cancel_turn(None).await
    }

    async fn cancel_turn(&self, only_turn: Option<u64>) -> bool {
        let mut slot = self.active.lock().await;
        let mut store = self.store.lock().await;
        Self::cancel_locked(&mut slot, &mut store, only_turn, &self.idle_tx)
    }

    fn cancel_locked(
        slot: &mut Option<ActiveTurn>,
        store: &mut SessionStore,
        only_turn: Option<u64>,
        idle_tx: &watch::Sender<bool>,
    ) -> bool {
        let matches = match (slot.as_ref(), only_turn) {
            (Some(turn), Some(id)) => turn.turn_id == id,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !matches {
            return false;
        }
        let Some(turn) = slot.take() else {
            return false;
        };
        turn.cancel.cancel();
        store.set_message_streaming(&turn.assistant_id, false);
        store.set_turn_streaming(false);
        idle_tx.send_replace(true);
        debug!(turn_id = turn.turn_id, state = ?turn.state, "Turn cancelled");
        true
    }

    /// Cancels any in-flight turn and runs `f` against the store before a new
    /// turn can be claimed.
    pub async fn interrupt_with<R>(&self, f: impl FnOnce(&mut SessionStore) -> R) -> R {
        let mut slot = self.active.lock().await;
        let mut store = self.store.lock().await;
        Self::cancel_locked(&mut slot, &mut store, None, &self.idle_tx);
        f(&mut store)
    }

    /// Waits until no turn is in flight, then runs `f` against the store
    /// while holding the turn slot so no turn can start concurrently.
    pub async fn when_idle<R>(&self, f: impl FnOnce(&mut SessionStore) -> R) -> R {
        let mut idle_rx = self.idle_tx.subscribe();
        loop {
            {
                let slot = self.active.lock().await;
                if slot.is_none() {
                    let mut store = self.store.lock().await;
                    return f(&mut store);
                }
            }
            let _ = idle_rx.wait_for(|idle| *idle).await;
        }
    }

    pub async fn wait_idle(&self) {
        let mut idle_rx = self.idle_tx.subscribe();
        let _ = idle_rx.wait_for(|idle| *idle).await;
    }
}
