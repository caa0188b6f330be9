//! Seams between the chat engine and the network.
//!
//! [`Transport`] opens a streamed request; [`ChatBackend`] covers the plain
//! REST calls used for session setup and history. Both are implemented over
//! `reqwest` by [`crate::core::http_backend::HttpBackend`].

use std::error::Error as StdError;
use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;

use crate::api::{HistoryEntry, SessionInitResponse};

/// Raw response body, yielded chunk by chunk until the connection closes.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, TransportError>> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The request never reached the server or the connection dropped.
    Connect(String),
    /// The server answered with a non-success status.
    Status { status: u16, message: String },
    /// Reading the response body failed after the stream was opened.
    Body(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Connect(msg) => write!(f, "Connection failed: {msg}"),
            TransportError::Status { status, message } => {
                write!(f, "Request failed with status {status}: {message}")
            }
            TransportError::Body(msg) => write!(f, "Stream interrupted: {msg}"),
        }
    }
}

impl StdError for TransportError {}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn open_stream(
        &self,
        url: &str,
        body: serde_json::Value,
    ) -> Result<ByteStream, TransportError>;
}

#[derive(Debug)]
pub enum BackendError {
    Transport(TransportError),
    /// The server responded but the payload could not be understood.
    Decode(String),
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Transport(err) => write!(f, "{err}"),
            BackendError::Decode(msg) => write!(f, "Unexpected response from server: {msg}"),
        }
    }
}

impl StdError for BackendError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            BackendError::Transport(err) => Some(err),
            BackendError::Decode(_) => None,
        }
    }
}

impl From<TransportError> for BackendError {
    fn from(value: TransportError) -> Self {
        BackendError::Transport(value)
    }
}

/// REST calls used around the streaming engine.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn init_session(&self, model: &str) -> Result<SessionInitResponse, BackendError>;

    async fn fetch_history(&self, session_id: &str) -> Result<Vec<HistoryEntry>, BackendError>;

    async fn list_models(&self) -> Result<Vec<String>, BackendError>;

    /// Endpoint that `Transport::open_stream` should be called with for chat turns.
    fn chat_url(&self) -> String;
}
