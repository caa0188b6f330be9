//! Interactive line-based chat on stdin/stdout.

use std::error::Error;
use std::path::PathBuf;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cli::history::print_messages;
use crate::cli::say::read_attachment;
use crate::cli::stream_output::stream_turn;
use crate::core::chat::ChatSession;
use crate::core::history::HistoryLoad;

const HELP: &str = "\
Commands:
  /regen              Regenerate the last response
  /stop               Stop the response that is streaming
  /new                Start a new session with the current model
  /switch <id>        Switch to an existing session and load its history
  /history            Reload and print the current session's history
  /attach <file> ...  Send a prompt with a file attached
  /log                Pause or resume transcript logging
  /help               Show this help
  /quit               Leave";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplCommand {
    Send(String),
    Attach { path: PathBuf, prompt: String },
    Regenerate,
    Stop,
    New,
    Switch(String),
    History,
    Log,
    Help,
    Quit,
    Unknown(String),
}

/// Blank lines yield `None`. Text that does not start with `/` is a prompt.
pub fn parse_line(line: &str) -> Option<ReplCommand> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let Some(command) = trimmed.strip_prefix('/') else {
        return Some(ReplCommand::Send(trimmed.to_string()));
    };

    let (name, rest) = command
        .split_once(char::is_whitespace)
        .map(|(name, rest)| (name, rest.trim()))
        .unwrap_or((command, ""));
    let parsed = match (name, rest) {
        ("regen" | "retry", "") => ReplCommand::Regenerate,
        ("stop", "") => ReplCommand::Stop,
        ("new", "") => ReplCommand::New,
        ("switch", id) if !id.is_empty() => ReplCommand::Switch(id.to_string()),
        ("history", "") => ReplCommand::History,
        ("attach", args) if !args.is_empty() => {
            let (path, prompt) = args
                .split_once(char::is_whitespace)
                .map(|(path, prompt)| (path, prompt.trim()))
                .unwrap_or((args, ""));
            ReplCommand::Attach {
                path: PathBuf::from(path),
                prompt: prompt.to_string(),
            }
        }
        ("log", "") => ReplCommand::Log,
        ("help", "") => ReplCommand::Help,
        ("quit" | "exit", "") => ReplCommand::Quit,
        _ => ReplCommand::Unknown(trimmed.to_string()),
    };
    Some(parsed)
}

pub async fn run_chat(chat: ChatSession, model: String) -> Result<(), Box<dyn Error>> {
    let info = chat.start_new_chat(&model).await?;
    eprintln!("💬 localchat: session {} with model {}", info.session_id, info.model);
    eprintln!("   Transcript logging: {}", chat.logging_status().await);
    eprintln!("   Type /help for commands, /quit to leave.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut turn: Option<JoinHandle<()>> = None;

    while let Some(line) = lines.next_line().await? {
        let Some(command) = parse_line(&line) else {
            continue;
        };
        debug!(command = ?command, "Chat command");

        match command {
            ReplCommand::Send(prompt) => {
                if turn_running(&mut turn).await {
                    continue;
                }
                turn = Some(spawn_turn(&chat, move |chat| async move {
                    stream_turn(&chat, chat.send(&prompt, None)).await;
                }));
            }
            ReplCommand::Attach { path, prompt } => {
                if turn_running(&mut turn).await {
                    continue;
                }
                match read_attachment(&path).await {
                    Ok(attachment) => {
                        turn = Some(spawn_turn(&chat, move |chat| async move {
                            stream_turn(&chat, chat.send(&prompt, Some(attachment))).await;
                        }));
                    }
                    Err(err) => eprintln!("❌ {err}"),
                }
            }
            ReplCommand::Regenerate => {
                if turn_running(&mut turn).await {
                    continue;
                }
                let snapshot = chat.snapshot().await;
                let Some(last) = snapshot
                    .messages
                    .iter()
                    .rev()
                    .find(|message| message.is_assistant())
                else {
                    eprintln!("⚠️  Nothing to regenerate");
                    continue;
                };
                let assistant_id = last.id.clone();
                turn = Some(spawn_turn(&chat, move |chat| async move {
                    stream_turn(&chat, chat.regenerate(&assistant_id)).await;
                }));
            }
            ReplCommand::Stop => {
                if !chat.cancel_active_turn().await {
                    eprintln!("⚠️  Nothing is streaming");
                }
            }
            ReplCommand::New => match chat.start_new_chat(&model).await {
                Ok(info) => eprintln!("✨ New session {}", info.session_id),
                Err(err) => eprintln!("❌ Could not start a session: {err}"),
            },
            ReplCommand::Switch(session_id) => {
                match chat.switch_session(&session_id, &model).await {
                    Ok(HistoryLoad::Applied { messages }) => {
                        eprintln!("🔀 Switched to {session_id} ({messages} messages)");
                        print_messages(&chat.snapshot().await.messages);
                    }
                    Ok(HistoryLoad::Stale) => {}
                    Err(err) => eprintln!("❌ Could not load history: {err}"),
                }
            }
            ReplCommand::History => match chat.reload_history().await {
                Ok(_) => print_messages(&chat.snapshot().await.messages),
                Err(err) => eprintln!("❌ Could not load history: {err}"),
            },
            ReplCommand::Log => match chat.toggle_logging().await {
                Ok(status) => eprintln!("📝 {status}"),
                Err(err) => eprintln!("❌ {err}"),
            },
            ReplCommand::Help => eprintln!("{HELP}"),
            ReplCommand::Quit => break,
            ReplCommand::Unknown(text) => {
                eprintln!("⚠️  Unknown command: {text} (try /help)");
            }
        }
    }

    chat.cancel_active_turn().await;
    if let Some(handle) = turn {
        let _ = handle.await;
    }
    Ok(())
}

/// Joins the previous turn task if it has finished. Returns true, after
/// telling the user, while it is still running.
async fn turn_running(turn: &mut Option<JoinHandle<()>>) -> bool {
    match turn.take() {
        Some(handle) if !handle.is_finished() => {
            eprintln!("⚠️  A response is still streaming (use /stop)");
            *turn = Some(handle);
            true
        }
        Some(handle) => {
            if let Err(err) = handle.await {
                warn!(error = %err, "Turn task ended abnormally");
            }
            false
        }
        None => false,
    }
}

fn spawn_turn<F, Fut>(chat: &ChatSession, body: F) -> JoinHandle<()>
where
    F: FnOnce(ChatSession) -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(body(chat.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_a_prompt() {
        assert_eq!(
            parse_line("  Hello there "),
            Some(ReplCommand::Send("Hello there".into()))
        );
        assert_eq!(parse_line("   "), None);
    }

    #[test]
    fn slash_commands_parse() {
        assert_eq!(parse_line("/regen"), Some(ReplCommand::Regenerate));
        assert_eq!(parse_line("/retry"), Some(ReplCommand::Regenerate));
        assert_eq!(parse_line("/stop"), Some(ReplCommand::Stop));
        assert_eq!(
            parse_line("/switch  abc-123 "),
            Some(ReplCommand::Switch("abc-123".into()))
        );
        assert_eq!(parse_line("/exit"), Some(ReplCommand::Quit));
    }

    #[test]
    fn attach_takes_path_and_optional_prompt() {
        assert_eq!(
            parse_line("/attach notes.txt summarize this"),
            Some(ReplCommand::Attach {
                path: PathBuf::from("notes.txt"),
                prompt: "summarize this".into(),
            })
        );
        assert_eq!(
            parse_line("/attach notes.txt"),
            Some(ReplCommand::Attach {
                path: PathBuf::from("notes.txt"),
                prompt: String::new(),
            })
        );
    }

    #[test]
    fn malformed_commands_are_unknown() {
        assert_eq!(
            parse_line("/switch"),
            Some(ReplCommand::Unknown("/switch".into()))
        );
        assert_eq!(
            parse_line("/stop now"),
            Some(ReplCommand::Unknown("/stop now".into()))
        );
    }

    #[tokio::test]
    async fn finished_turn_is_joined_and_running_turn_is_kept() {
        let mut turn = Some(tokio::spawn(async {}));
        while !turn.as_ref().unwrap().is_finished() {
            tokio::task::yield_now().await;
        }
        assert!(!turn_running(&mut turn).await);
        assert!(turn.is_none());

        let (_tx, rx) = tokio::sync::oneshot::channel::<()>();
        let mut turn = Some(tokio::spawn(async move {
            let _ = rx.await;
        }));
        assert!(turn_running(&mut turn).await);
        assert!(turn.is_some());
        turn.unwrap().abort();
    }
}
