//! Plain-text transcript of finalized turns.

use crate::core::message::{Message, Role};
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::Path;
use tempfile::NamedTempFile;

pub struct LoggingState {
    file_path: Option<String>,
    is_active: bool,
}

impl LoggingState {
    /// Logging starts active when a file is given up front.
    pub fn new(log_file: Option<String>) -> Result<Self, Box<dyn std::error::Error>> {
        let mut logging = LoggingState {
            file_path: None,
            is_active: false,
        };
        if let Some(path) = log_file {
            logging.set_log_file(path)?;
        }
        Ok(logging)
    }

    pub fn set_log_file(&mut self, path: String) -> Result<String, Box<dyn std::error::Error>> {
        // Fail early if the file cannot be created or written.
        self.test_file_access(&path)?;

        self.file_path = Some(path.clone());
        self.is_active = true;

        Ok(format!("Logging enabled to: {path}"))
    }

    pub fn toggle_logging(
        &mut self,
        pause_message: &str,
    ) -> Result<String, Box<dyn std::error::Error>> {
        match self.file_path.clone() {
            Some(path) => {
                if self.is_active {
                    self.log_message(&format!("## {pause_message}"))?;
                    self.is_active = false;
                    Ok(format!("Logging paused (file: {path})"))
                } else {
                    self.is_active = true;
                    Ok(format!("Logging resumed to: {path}"))
                }
            }
            None => Err("No log file specified. Use --log <filename> to enable logging.".into()),
        }
    }

    pub fn is_active(&self) -> bool {
        self.is_active && self.file_path.is_some()
    }

    pub fn log_message(&self, content: &str) -> Result<(), Box<dyn std::error::Error>> {
        let Some(file_path) = self.active_path() else {
            return Ok(());
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;
        let mut writer = BufWriter::with_capacity(64 * 1024, file);
        write_block(&mut writer, content)?;
        writer.flush()?;
        Ok(())
    }

    /// Appends one finished exchange: the prompt with a `You:` prefix, then the answer.
    pub fn log_turn(
        &self,
        user: &Message,
        assistant: &Message,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let Some(file_path) = self.active_path() else {
            return Ok(());
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;
        let mut writer = BufWriter::new(file);
        write_message(&mut writer, user)?;
        write_message(&mut writer, assistant)?;
        writer.flush()?;
        Ok(())
    }

    pub fn get_status_string(&self) -> String {
        let file_name = |path: &str| {
            Path::new(path)
                .file_name()
                .unwrap_or_default()
                .to_string_lossy()
                .into_owned()
        };
        match (&self.file_path, self.is_active) {
            (None, _) => "disabled".to_string(),
            (Some(path), true) => format!("active ({})", file_name(path)),
            (Some(path), false) => format!("paused ({})", file_name(path)),
        }
    }

    /// Rewrites the whole transcript from `messages`, e.g. after regeneration
    /// dropped earlier turns. The file is replaced atomically.
    pub fn rewrite_log(&self, messages: &[Message]) -> Result<(), Box<dyn std::error::Error>> {
        let Some(file_path) = self.active_path() else {
            return Ok(());
        };

        let target_path = Path::new(file_path);
        let parent = target_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut temp_file = NamedTempFile::new_in(parent)?;

        for message in messages.iter().filter(|message| !message.is_streaming) {
            write_message(&mut temp_file, message)?;
        }

        temp_file.flush()?;
        temp_file.as_file().sync_all()?;
        temp_file.persist(file_path)?;
        Ok(())
    }

    fn active_path(&self) -> Option<&str> {
        if !self.is_active {
            return None;
        }
        self.file_path.as_deref()
    }

    fn test_file_access(&self, path: &str) -> Result<(), Box<dyn std::error::Error>> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.flush()?;
        Ok(())
    }
}

fn write_message(writer: &mut impl Write, message: &Message) -> std::io::Result<()> {
    match message.role {
        Role::User => write_block(writer, &format!("You: {}", message.content)),
        Role::Assistant if message.content.is_empty() => Ok(()),
        Role::Assistant => write_block(writer, &message.content),
    }
}

fn write_block(writer: &mut impl Write, content: &str) -> std::io::Result<()> {
    for line in content.lines() {
        writeln!(writer, "{line}")?;
    }
    // Blank line between messages, as on screen.
    writeln!(writer)
}
