//! One-shot "say" command: send a single prompt and print the answer.

use std::error::Error;
use std::path::Path;

use crate::cli::stream_output::stream_turn;
use crate::core::chat::ChatSession;
use crate::core::controller::TurnOutcome;
use crate::core::message::Attachment;

pub async fn run_say(
    chat: &ChatSession,
    model: &str,
    prompt: Vec<String>,
    attach: Option<&Path>,
) -> Result<(), Box<dyn Error>> {
    let prompt = prompt.join(" ");
    let attachment = match attach {
        Some(path) => Some(read_attachment(path).await?),
        None => None,
    };
    if prompt.trim().is_empty() && attachment.is_none() {
        return Err("Usage: localchat say <prompt>".into());
    }

    chat.start_new_chat(model).await?;
    let outcome = stream_turn(chat, chat.send(&prompt, attachment)).await;
    match outcome {
        TurnOutcome::Completed { .. } => Ok(()),
        TurnOutcome::Failed { error, .. } => Err(error.into()),
        other => Err(format!("Response did not complete: {other:?}").into()),
    }
}

pub async fn read_attachment(path: &Path) -> Result<Attachment, Box<dyn Error>> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|err| format!("Cannot read {}: {err}", path.display()))?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "attachment".to_string());
    let attachment = Attachment::new(file_name, bytes);
    Ok(match media_type_for(path) {
        Some(media_type) => attachment.with_media_type(media_type),
        None => attachment,
    })
}

fn media_type_for(path: &Path) -> Option<&'static str> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    let media_type = match extension.as_str() {
        "txt" | "log" => "text/plain",
        "md" => "text/markdown",
        "json" => "application/json",
        "csv" => "text/csv",
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => return None,
    };
    Some(media_type)
}
