//! Re-running an assistant turn from its prompting user message.
//!
//! Regeneration is a replay, not a branch: the target answer and everything
//! after it are dropped, and the user message that produced it is sent again.
//! That user message stays in history, so a regeneration cancelled before its
//! stream opens leaves the prompt in place.

use tracing::debug;

use crate::core::controller::{RejectReason, StreamingController, TurnInput, TurnOutcome};
use crate::core::message::{Message, MessageId};
use crate::core::session_store::SessionStore;

/// Messages removed by a regeneration, in their original order.
pub type DiscardedMessages = Vec<Message>;

impl StreamingController {
    pub async fn regenerate(&self, assistant_id: &MessageId) -> TurnOutcome {
        self.regenerate_with(assistant_id, |_| {}).await
    }

    /// Like [`StreamingController::regenerate`], handing the discarded tail to
    /// `on_discard` once the turn slot is held.
    pub async fn regenerate_with<F>(&self, assistant_id: &MessageId, on_discard: F) -> TurnOutcome
    where
        F: FnOnce(DiscardedMessages),
    {
        let outcome = self
            .claim_and_run(|store| {
                let (input, discarded) = prepare_regeneration(store, assistant_id)?;
                on_discard(discarded);
                Ok(input)
            })
            .await;

        if let TurnOutcome::Rejected(reason) = &outcome {
            debug!(
                assistant_id = %assistant_id,
                reason = ?reason,
                "Regeneration rejected"
            );
        }
        outcome
    }
}

fn prepare_regeneration(
    store: &mut SessionStore,
    assistant_id: &MessageId,
) -> Result<(TurnInput, DiscardedMessages), RejectReason> {
    let (Some(session_id), Some(model)) = (store.session_id(), store.model()) else {
        return Err(RejectReason::NoSession);
    };
    if !store.is_active() {
        return Err(RejectReason::NoSession);
    }
    let (session_id, model) = (session_id.to_string(), model.to_string());

    let index = store
        .position(assistant_id)
        .ok_or(RejectReason::MessageNotFound)?;
    let messages = store.messages();
    if !messages[index].is_assistant() {
        return Err(RejectReason::NotAssistantMessage);
    }
    let prompt = index
        .checked_sub(1)
        .map(|user_index| &messages[user_index])
        .filter(|message| message.is_user())
        .ok_or(RejectReason::NoPrecedingUserMessage)?;

    let user_message = prompt.clone();
    let discarded = store.truncate_from(assistant_id);

    Ok((
        TurnInput {
            session_id,
            model,
            user_message,
            prompt_in_history: true,
        },
        discarded,
    ))
}
