//! Printing a session's stored history.

use std::error::Error;

use chrono::Local;

use crate::core::chat::ChatSession;
use crate::core::history::HistoryLoad;
use crate::core::message::{Message, Role};

pub async fn run_history(
    chat: &ChatSession,
    session_id: &str,
    model: &str,
) -> Result<(), Box<dyn Error>> {
    match chat.switch_session(session_id, model).await? {
        HistoryLoad::Applied { messages: 0 } => println!("No messages in session {session_id}."),
        HistoryLoad::Applied { .. } => print_messages(&chat.snapshot().await.messages),
        HistoryLoad::Stale => {}
    }
    Ok(())
}

pub fn print_messages(messages: &[Message]) {
    for message in messages {
        println!("{}", format_message(message));
    }
}

fn format_message(message: &Message) -> String {
    let timestamp = message.created_at.with_timezone(&Local).format("%Y-%m-%d %H:%M");
    let speaker = match message.role {
        Role::User => "You",
        Role::Assistant => "Assistant",
    };
    let mut text = format!("[{timestamp}] {speaker}: {}", message.content);
    if let Some(attachment) = &message.attachment {
        text.push_str(&format!(" (📎 {})", attachment.file_name));
    }
    if let Some(error) = &message.error {
        text.push_str(&format!(" [error: {error}]"));
    }
    text
}
