use serde::{Deserialize, Serialize};

/// Body posted to the chat endpoint to open a streamed assistant turn.
#[derive(Serialize, Debug, Clone)]
pub struct ChatRequest {
    pub session_id: String,
    pub model: String,
    pub message: String,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment: Option<ChatAttachment>,
}

/// Attachment as sent on the wire; `data` is base64 encoded.
#[derive(Serialize, Debug, Clone)]
pub struct ChatAttachment {
    pub file_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub data: String,
}

/// Native frame shape emitted by the local server inside `data:` lines.
#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamFrame {
    Delta {
        #[serde(default)]
        content: String,
    },
    Done,
    Error {
        #[serde(default)]
        message: String,
    },
}

#[derive(Deserialize)]
pub struct ChatResponseDelta {
    pub content: Option<String>,
}

#[derive(Deserialize)]
pub struct ChatResponseChoice {
    pub delta: ChatResponseDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// OpenAI-compatible streaming chunk, accepted as a fallback frame shape.
#[derive(Deserialize)]
pub struct ChatResponse {
    pub choices: Vec<ChatResponseChoice>,
}

#[derive(Serialize)]
pub struct SessionInitRequest {
    pub model: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionInitResponse {
    #[serde(alias = "sessionId")]
    pub session_id: String,
    #[serde(alias = "modelName")]
    pub model: String,
}

/// One persisted message as returned by the history endpoint.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub id: String,
    pub role: String,
    pub content: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// History responses come either as a bare list or wrapped in an object.
#[derive(Deserialize, Debug)]
#[serde(untagged)]
pub enum HistoryResponse {
    List(Vec<HistoryEntry>),
    Wrapped { messages: Vec<HistoryEntry> },
}

impl HistoryResponse {
    pub fn into_entries(self) -> Vec<HistoryEntry> {
        match self {
            HistoryResponse::List(entries) => entries,
            HistoryResponse::Wrapped { messages } => messages,
        }
    }
}

#[derive(Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub created: Option<u64>,
}

#[derive(Deserialize)]
pub struct ModelsResponse {
    pub data: Vec<ModelInfo>,
}

pub mod models;
