//! Model listing

use std::error::Error;

use crate::core::chat::ChatSession;

pub async fn list_models(chat: &ChatSession, default_model: Option<&str>) -> Result<(), Box<dyn Error>> {
    let models = chat.list_models().await?;

    if let Some(default_model) = default_model {
        println!("🎯 Default model: {default_model} (from config)");
        println!();
    }

    if models.is_empty() {
        println!("No models reported by the server.");
        return Ok(());
    }

    println!("Found {} models (sorted newest first):", models.len());
    for model in models {
        let marker = if Some(model.as_str()) == default_model { " *" } else { "" };
        println!("  • {model}{marker}");
    }
    Ok(())
}
