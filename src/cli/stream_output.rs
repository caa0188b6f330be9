//! Incremental terminal output for a streaming turn.

use std::future::Future;
use std::io::{self, Write};

use crate::core::chat::ChatSession;
use crate::core::controller::TurnOutcome;
use crate::core::message::MessageId;
use crate::core::session_store::SessionSnapshot;

/// Turns successive snapshots into the text that still needs printing for
/// the assistant message currently streaming.
#[derive(Default)]
pub struct StreamPrinter {
    current: Option<MessageId>,
    printed: String,
    finished: Option<MessageId>,
}

impl StreamPrinter {
    pub fn render(&mut self, snapshot: &SessionSnapshot) -> String {
        let mut out = String::new();
        if self.current.is_none() {
            if let Some(message) = snapshot.streaming_message() {
                self.current = Some(message.id.clone());
                self.printed.clear();
            }
        }
        let Some(id) = self.current.clone() else {
            return out;
        };

        let Some(message) = snapshot.messages.iter().find(|message| message.id == id) else {
            // Dropped by a session switch.
            self.current = None;
            if !self.printed.is_empty() {
                out.push('\n');
            }
            return out;
        };

        match message.content.strip_prefix(self.printed.as_str()) {
            Some(rest) => out.push_str(rest),
            None => {
                out.push('\n');
                out.push_str(&message.content);
            }
        }
        self.printed.clone_from(&message.content);

        if !message.is_streaming {
            out.push('\n');
            if let Some(error) = &message.error {
                out.push_str(&format!("[error: {error}]\n"));
            }
            self.current = None;
            self.finished = Some(id);
        }
        out
    }

    /// Renders whatever `render` missed, e.g. a turn that completed between
    /// two observed snapshots.
    pub fn finish(&mut self, snapshot: &SessionSnapshot, assistant_id: Option<&MessageId>) -> String {
        let mut out = self.render(snapshot);
        let Some(id) = assistant_id else {
            return out;
        };
        if self.finished.as_ref() == Some(id) {
            return out;
        }
        if let Some(message) = snapshot.messages.iter().find(|message| &message.id == id) {
            out.push_str(&message.content);
            out.push('\n');
            if let Some(error) = &message.error {
                out.push_str(&format!("[error: {error}]\n"));
            }
            self.finished = Some(id.clone());
        }
        out
    }
}

fn emit(text: &str) {
    if text.is_empty() {
        return;
    }
    let mut stdout = io::stdout().lock();
    let _ = stdout.write_all(text.as_bytes());
    let _ = stdout.flush();
}

/// Drives `turn` to completion while echoing the streamed answer.
pub async fn stream_turn<F>(chat: &ChatSession, turn: F) -> TurnOutcome
where
    F: Future<Output = TurnOutcome>,
{
    let mut rx = chat.subscribe().await;
    let mut printer = StreamPrinter::default();
    tokio::pin!(turn);

    let outcome = loop {
        tokio::select! {
            outcome = &mut turn => break outcome,
            changed = rx.changed() => {
                if changed.is_err() {
                    break (&mut turn).await;
                }
                let text = printer.render(&rx.borrow_and_update());
                emit(&text);
            }
        }
    };

    let snapshot = chat.snapshot().await;
    emit(&printer.finish(&snapshot, outcome.assistant_id()));
    report_outcome(&outcome);
    outcome
}

pub fn report_outcome(outcome: &TurnOutcome) {
    match outcome {
        TurnOutcome::Completed { .. } | TurnOutcome::Failed { .. } => {}
        TurnOutcome::Rejected(reason) => eprintln!("⚠️  Not sent: {reason}"),
        TurnOutcome::Cancelled { .. } => eprintln!("⏹  Response stopped"),
        TurnOutcome::TimedOut { .. } => eprintln!("⏱  Response timed out"),
    }
}
